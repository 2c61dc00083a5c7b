//! Positional rule-patch algebra.
//!
//! A rule entry may carry a leading numeric offset (`"2,DOMAIN,x.com,DIRECT"`).
//! Offsets are interpreted against the list length at the time each entry is
//! inserted, so earlier insertions shift the positions later ones land on.

use crate::model::RuleDocument;

/// Split a rule entry into its positional offset and the rule text.
///
/// An entry whose first comma-separated token parses as an unsigned integer
/// is `offset,rule`; anything else is a plain rule with offset zero. Real
/// rules start with an alphabetic type token, so a numeric head is
/// unambiguous.
fn split_entry(entry: &str) -> (usize, &str) {
    if let Some((head, rest)) = entry.split_once(',')
        && !rest.is_empty()
        && let Ok(offset) = head.trim().parse::<usize>()
    {
        return (offset, rest);
    }
    (0, entry)
}

/// Apply a rule document to a base rule list, producing the patched list.
///
/// Prepends insert at `min(offset, len)` from the start, appends at
/// `len - offset` from the start (clamped to the front), deletes remove the
/// first exact match of the rule text with any offset stripped. Order is
/// fixed: prepends, then appends, then deletes. Deletes that match nothing
/// are skipped.
#[must_use]
pub fn patch(base: &[String], doc: &RuleDocument) -> Vec<String> {
    let mut rules: Vec<String> = base.to_vec();

    for entry in &doc.prepend {
        let (offset, rule) = split_entry(entry);
        let at = offset.min(rules.len());
        rules.insert(at, rule.to_string());
    }

    for entry in &doc.append {
        let (offset, rule) = split_entry(entry);
        let at = rules.len().saturating_sub(offset);
        rules.insert(at, rule.to_string());
    }

    for entry in &doc.delete {
        let (_, rule) = split_entry(entry);
        if let Some(position) = rules.iter().position(|existing| existing == rule) {
            rules.remove(position);
        }
    }

    rules
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> Vec<String> {
        vec!["A".to_string(), "B".to_string(), "C".to_string()]
    }

    fn doc(prepend: &[&str], append: &[&str], delete: &[&str]) -> RuleDocument {
        RuleDocument {
            prepend: prepend.iter().copied().map(String::from).collect(),
            append: append.iter().copied().map(String::from).collect(),
            delete: delete.iter().copied().map(String::from).collect(),
        }
    }

    #[test]
    fn prepend_with_offset_inserts_from_the_start() {
        let patched = patch(&base(), &doc(&["1,X"], &[], &[]));
        assert_eq!(patched, ["A", "X", "B", "C"]);
    }

    #[test]
    fn prepend_without_offset_lands_first() {
        let base = vec!["DOMAIN,x.com,DIRECT".to_string()];
        let patched = patch(&base, &doc(&["0,DOMAIN,y.com,PROXY"], &[], &[]));
        assert_eq!(patched, ["DOMAIN,y.com,PROXY", "DOMAIN,x.com,DIRECT"]);
    }

    #[test]
    fn append_with_offset_counts_from_the_end() {
        let patched = patch(&base(), &doc(&[], &["1,Y"], &[]));
        assert_eq!(patched, ["A", "B", "Y", "C"]);
    }

    #[test]
    fn append_without_offset_lands_last() {
        let patched = patch(&base(), &doc(&[], &["DOMAIN,z.com,REJECT"], &[]));
        assert_eq!(patched, ["A", "B", "C", "DOMAIN,z.com,REJECT"]);
    }

    #[test]
    fn offsets_are_relative_to_the_list_at_insertion_time() {
        // The first prepend grows the list, shifting where the second lands.
        let patched = patch(&base(), &doc(&["0,X", "0,Y"], &[], &[]));
        assert_eq!(patched, ["Y", "X", "A", "B", "C"]);

        let patched = patch(&base(), &doc(&["1,X", "1,Y"], &[], &[]));
        assert_eq!(patched, ["A", "Y", "X", "B", "C"]);
    }

    #[test]
    fn oversized_offsets_clamp_to_the_list_bounds() {
        let patched = patch(&base(), &doc(&["9,X"], &["9,Y"], &[]));
        assert_eq!(patched, ["Y", "A", "B", "C", "X"]);
    }

    #[test]
    fn delete_removes_only_the_first_match() {
        let base = vec!["A".to_string(), "B".to_string(), "A".to_string()];
        let patched = patch(&base, &doc(&[], &[], &["A"]));
        assert_eq!(patched, ["B", "A"]);
    }

    #[test]
    fn delete_ignores_offsets_and_misses_silently() {
        let patched = patch(&base(), &doc(&[], &[], &["3,B", "NOPE"]));
        assert_eq!(patched, ["A", "C"]);
    }

    #[test]
    fn deletes_run_after_insertions() {
        let patched = patch(&base(), &doc(&["0,X"], &["0,X"], &["X"]));
        assert_eq!(patched, ["A", "B", "C", "X"]);
    }

    #[test]
    fn rules_with_alphabetic_heads_keep_their_text() {
        let patched = patch(&[], &doc(&["MATCH,DIRECT"], &[], &[]));
        assert_eq!(patched, ["MATCH,DIRECT"]);
    }
}
