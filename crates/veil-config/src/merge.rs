#![allow(clippy::redundant_pub_crate)]

//! Deep merge for YAML mappings.

use serde_yaml::{Mapping, Value};

/// Merge `patch` onto `base`, recursing into nested mappings.
///
/// Scalar and sequence values from the patch replace the base value
/// wholesale; only mappings merge key-by-key. The patch always wins.
pub(crate) fn deep_merge(base: &mut Mapping, patch: Mapping) {
    for (key, value) in patch {
        match value {
            Value::Mapping(incoming) => {
                if let Some(Value::Mapping(existing)) = base.get_mut(&key) {
                    deep_merge(existing, incoming);
                } else {
                    base.insert(key, Value::Mapping(incoming));
                }
            }
            other => {
                base.insert(key, other);
            }
        }
    }
}
