//! Runtime config synthesis.
//!
//! Regenerates the single document handed to the core process from the
//! current profile, the override chain, the profile's rule patches, and the
//! app-managed settings. The output is derived, never edited in place; every
//! pass starts from the stored profile body.

use std::path::{Path, PathBuf};

use serde_yaml::{Mapping, Value};
use tracing::{debug, warn};

use crate::error::{ConfigError, ConfigResult};
use crate::merge::deep_merge;
use crate::model::{OverrideItem, OverrideScope, ProfileMeta};
use crate::override_engine::OverrideEngine;
use crate::rules;
use crate::store::ConfigStore;

/// File name of the synthesized document inside the working directory.
const CONFIG_FILE: &str = "config.yaml";

/// Static data files the core expects next to its working directory.
const GEO_ASSETS: [&str; 4] = ["geoip.dat", "geosite.dat", "country.mmdb", "asn.mmdb"];

/// The document handed to the core process, plus where it was written.
#[derive(Debug, Clone)]
pub struct RuntimeConfig {
    /// Profile the document was derived from.
    pub profile_id: String,
    /// The merged document.
    pub doc: Mapping,
    /// Serialized YAML form, byte-identical across passes with equal inputs.
    pub serialized: String,
    /// Path the serialized form was written to.
    pub path: PathBuf,
    /// Working directory the core should run in.
    pub work_dir: PathBuf,
}

/// Orchestrates profile loading, overrides, rule patches, and the controlled
/// merge into one runtime document.
#[derive(Clone)]
pub struct ConfigSynthesizer {
    store: ConfigStore,
    engine: OverrideEngine,
}

impl ConfigSynthesizer {
    /// Build a synthesizer reading from the given store.
    #[must_use]
    pub fn new(store: ConfigStore) -> Self {
        let engine = OverrideEngine::new(store.dirs().clone());
        Self { store, engine }
    }

    /// Regenerate the runtime config and write it to the working directory.
    ///
    /// Per-override failures degrade to no-ops (see [`OverrideEngine`]); only
    /// a missing or unparseable profile, or filesystem trouble, fails the
    /// whole pass.
    ///
    /// # Errors
    /// Returns an error when no current profile is selected, the profile
    /// body is invalid, or the working directory cannot be written.
    pub async fn synthesize(&self) -> ConfigResult<RuntimeConfig> {
        let meta = self.store.current_profile().await?;
        let body = self.store.profile_body(&meta.id).await?;
        let mut doc = parse_profile(&meta.id, &body)?;

        let overrides = self.store.overrides().await?;
        for item in ordered_overrides(&overrides, &meta) {
            doc = self.engine.apply(doc, item).await;
        }

        if let Some(rule_doc) = meta.rules.as_ref().filter(|rule_doc| !rule_doc.is_empty()) {
            let base = extract_rules(&doc);
            let patched = rules::patch(&base, rule_doc);
            doc.insert(
                Value::from("rules"),
                Value::Sequence(patched.into_iter().map(Value::from).collect()),
            );
        }

        let settings = self.store.app_settings().await?;
        let controlled = self.store.controlled().await?;
        deep_merge(&mut doc, controlled.filtered(&settings));
        clamp_log_level(&mut doc);

        let dirs = self.store.dirs();
        let work_dir = if settings.per_profile_work_dir {
            let private = dirs.profile_work_dir(&meta.id);
            self.copy_geo_assets(&private).await?;
            private
        } else {
            let shared = dirs.work_dir();
            tokio::fs::create_dir_all(&shared)
                .await
                .map_err(|error| ConfigError::io("create_work_dir", &shared, error))?;
            shared
        };

        let serialized = serde_yaml::to_string(&doc).map_err(|source| ConfigError::Serialize {
            operation: "serialize_runtime_config",
            source,
        })?;
        let path = work_dir.join(CONFIG_FILE);
        tokio::fs::write(&path, &serialized)
            .await
            .map_err(|error| ConfigError::io("write_runtime_config", &path, error))?;
        debug!(profile_id = %meta.id, path = %path.display(), "runtime config synthesized");

        Ok(RuntimeConfig {
            profile_id: meta.id,
            doc,
            serialized,
            path,
            work_dir,
        })
    }

    /// Seed a private working directory with the shared geo assets.
    ///
    /// Copy-if-absent: a file the profile already has is never overwritten.
    async fn copy_geo_assets(&self, private: &Path) -> ConfigResult<()> {
        tokio::fs::create_dir_all(private)
            .await
            .map_err(|error| ConfigError::io("create_profile_work_dir", private, error))?;

        let shared = self.store.dirs().work_dir();
        for name in GEO_ASSETS {
            let source = shared.join(name);
            let target = private.join(name);
            let target_present = tokio::fs::try_exists(&target)
                .await
                .map_err(|error| ConfigError::io("probe_geo_asset", &target, error))?;
            if target_present {
                continue;
            }
            match tokio::fs::copy(&source, &target).await {
                Ok(_) => {}
                Err(error) if error.kind() == std::io::ErrorKind::NotFound => {}
                Err(error) => return Err(ConfigError::io("copy_geo_asset", &source, error)),
            }
        }
        Ok(())
    }
}

/// Parse a profile body, rejecting HTML payloads and non-mapping documents.
fn parse_profile(id: &str, body: &str) -> ConfigResult<Mapping> {
    if body.trim_start().starts_with('<') {
        // A failed subscription fetch stores the server's error page.
        return Err(ConfigError::HtmlProfilePayload { id: id.to_string() });
    }
    let doc: Value =
        serde_yaml::from_str(body).map_err(|source| ConfigError::InvalidProfileYaml {
            id: id.to_string(),
            source,
        })?;
    match doc {
        Value::Mapping(mapping) => Ok(mapping),
        _ => Err(ConfigError::ProfileNotMapping { id: id.to_string() }),
    }
}

/// Ordered, deduplicated override chain: global items first (in store
/// order), then the profile's own list. Unknown ids are skipped.
fn ordered_overrides<'a>(all: &'a [OverrideItem], meta: &ProfileMeta) -> Vec<&'a OverrideItem> {
    let mut seen: Vec<&str> = Vec::new();
    let mut chain = Vec::new();

    let global_ids = all
        .iter()
        .filter(|item| item.scope == OverrideScope::Global)
        .map(|item| item.id.as_str());
    for id in global_ids.chain(meta.override_ids.iter().map(String::as_str)) {
        if seen.contains(&id) {
            continue;
        }
        seen.push(id);
        all.iter().find(|item| item.id == id).map_or_else(
            || warn!(override_id = %id, profile_id = %meta.id, "profile references unknown override"),
            |item| chain.push(item),
        );
    }
    chain
}

/// The profile's rule list as plain strings.
fn extract_rules(doc: &Mapping) -> Vec<String> {
    let Some(Value::Sequence(entries)) = doc.get(Value::from("rules")) else {
        return Vec::new();
    };
    entries
        .iter()
        .map(|entry| {
            entry.as_str().map_or_else(
                || {
                    serde_yaml::to_string(entry)
                        .map(|text| text.trim_end().to_string())
                        .unwrap_or_default()
                },
                ToString::to_string,
            )
        })
        .collect()
}

/// The core only ever runs at `info` or `debug`; anything else would either
/// silence operational logs or flood them.
fn clamp_log_level(doc: &mut Mapping) {
    let level = doc.get(Value::from("log-level")).and_then(Value::as_str);
    let clamped = match level {
        Some("debug") => "debug",
        _ => "info",
    };
    doc.insert(Value::from("log-level"), Value::from(clamped));
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::OverrideKind;

    fn mapping(text: &str) -> Mapping {
        serde_yaml::from_str(text).expect("valid mapping")
    }

    #[test]
    fn html_payloads_are_rejected_with_the_profile_id() {
        let error = parse_profile("sub1", "<!DOCTYPE html><html></html>").unwrap_err();
        assert!(matches!(error, ConfigError::HtmlProfilePayload { id } if id == "sub1"));
    }

    #[test]
    fn invalid_yaml_is_rejected_with_the_profile_id() {
        let error = parse_profile("p1", "a: [unclosed").unwrap_err();
        assert!(matches!(error, ConfigError::InvalidProfileYaml { id, .. } if id == "p1"));
    }

    #[test]
    fn scalar_documents_are_rejected() {
        let error = parse_profile("p1", "just a string").unwrap_err();
        assert!(matches!(error, ConfigError::ProfileNotMapping { .. }));
    }

    #[test]
    fn log_level_clamps_to_info_or_debug() {
        let mut doc = mapping("log-level: silent\n");
        clamp_log_level(&mut doc);
        assert_eq!(doc.get(Value::from("log-level")), Some(&Value::from("info")));

        let mut doc = mapping("log-level: debug\n");
        clamp_log_level(&mut doc);
        assert_eq!(doc.get(Value::from("log-level")), Some(&Value::from("debug")));

        let mut doc = Mapping::new();
        clamp_log_level(&mut doc);
        assert_eq!(doc.get(Value::from("log-level")), Some(&Value::from("info")));
    }

    #[test]
    fn override_chain_orders_global_before_profile_and_dedups() {
        let item = |id: &str, scope: OverrideScope| OverrideItem {
            id: id.to_string(),
            name: id.to_string(),
            kind: OverrideKind::YamlPatch,
            scope,
            source: String::new(),
        };
        let all = vec![
            item("g1", OverrideScope::Global),
            item("p1", OverrideScope::Profile),
            item("g2", OverrideScope::Global),
        ];
        let meta = ProfileMeta {
            id: "profile".to_string(),
            name: "profile".to_string(),
            override_ids: vec!["p1".to_string(), "g1".to_string(), "missing".to_string()],
            rules: None,
        };

        let chain: Vec<&str> = ordered_overrides(&all, &meta)
            .into_iter()
            .map(|item| item.id.as_str())
            .collect();
        assert_eq!(chain, ["g1", "g2", "p1"]);
    }
}
