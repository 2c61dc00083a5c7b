//! Typed models for profiles, overrides, rule documents, and the
//! app-controlled subset of core settings.

use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};

/// Metadata describing one stored proxy configuration document.
///
/// The raw YAML body lives in its own file; the index only carries what the
/// synthesis pipeline needs to order overrides and rule patches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileMeta {
    /// Stable identifier, used in file names and error reports.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Per-profile override ids, applied after the globally scoped ones.
    #[serde(default)]
    pub override_ids: Vec<String>,
    /// Positional rule patches for this profile.
    #[serde(default)]
    pub rules: Option<RuleDocument>,
}

/// Index of profiles plus the current-profile marker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProfileIndex {
    /// Identifier of the profile selected as current, if any.
    #[serde(default)]
    pub current: Option<String>,
    /// All known profiles.
    #[serde(default)]
    pub items: Vec<ProfileMeta>,
}

/// Positional rule patches applied to a profile's rule list.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RuleDocument {
    /// Rules inserted counting from the start of the list.
    #[serde(default)]
    pub prepend: Vec<String>,
    /// Rules inserted counting from the end of the list.
    #[serde(default)]
    pub append: Vec<String>,
    /// Rules removed by exact serialized match.
    #[serde(default)]
    pub delete: Vec<String>,
}

impl RuleDocument {
    /// True when the document patches nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.prepend.is_empty() && self.append.is_empty() && self.delete.is_empty()
    }
}

/// How an override transforms the profile document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideKind {
    /// A sandboxed script defining `main(config)`.
    Script,
    /// A YAML document deep-merged onto the profile.
    YamlPatch,
}

/// Which profiles an override applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverrideScope {
    /// Applied to every profile, before per-profile overrides.
    Global,
    /// Applied only when a profile lists the override's id.
    Profile,
}

/// A script or YAML patch transforming a profile document before use.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverrideItem {
    /// Stable identifier referenced by profiles.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    /// Script or YAML patch.
    pub kind: OverrideKind,
    /// Global or per-profile.
    pub scope: OverrideScope,
    /// Source text: Lua for scripts, a YAML document for patches.
    pub source: String,
}

/// The subset of the core's settings the application manages itself,
/// persisted independently of any profile and merged over it on synthesis.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ControlledConfig(pub Mapping);

impl ControlledConfig {
    const TUN_KEY: &'static str = "tun";
    const DNS_KEYS: [&'static str; 2] = ["dns", "hosts"];
    const SNIFFER_KEY: &'static str = "sniffer";
    const NAMESERVER_POLICY_KEY: &'static str = "nameserver-policy";

    /// Current `log-level` value, when present and a string.
    #[must_use]
    pub fn log_level(&self) -> Option<&str> {
        self.0
            .get(Value::from("log-level"))
            .and_then(Value::as_str)
    }

    /// Flip `tun.enable`, used when the core rejects TUN for lack of
    /// privileges and the feature must be disabled before the next start.
    pub fn set_tun_enabled(&mut self, enabled: bool) {
        let tun = self
            .0
            .entry(Value::from(Self::TUN_KEY))
            .or_insert_with(|| Value::Mapping(Mapping::new()));
        if let Value::Mapping(tun) = tun {
            tun.insert(Value::from("enable"), Value::from(enabled));
        }
    }

    /// Whether `tun.enable` is currently set.
    #[must_use]
    pub fn tun_enabled(&self) -> bool {
        self.0
            .get(Value::from(Self::TUN_KEY))
            .and_then(|tun| tun.get(Value::from("enable")))
            .and_then(Value::as_bool)
            .unwrap_or(false)
    }

    /// Produce the mapping actually merged over the profile, with the
    /// feature-gated sections removed according to the app settings.
    #[must_use]
    pub fn filtered(&self, settings: &AppSettings) -> Mapping {
        let mut doc = self.0.clone();
        if !settings.control_dns {
            for key in Self::DNS_KEYS {
                doc.remove(Value::from(key));
            }
        }
        if !settings.control_sniff {
            doc.remove(Value::from(Self::SNIFFER_KEY));
        }
        if !settings.nameserver_policy
            && let Some(Value::Mapping(dns)) = doc.get_mut(Value::from("dns"))
        {
            dns.remove(Value::from(Self::NAMESERVER_POLICY_KEY));
        }
        doc
    }
}

/// Application settings this subsystem consumes read-only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
#[allow(clippy::struct_excessive_bools)]
pub struct AppSettings {
    /// Merge the controlled `dns`/`hosts` sections into the runtime config.
    pub control_dns: bool,
    /// Merge the controlled `sniffer` section into the runtime config.
    pub control_sniff: bool,
    /// Keep the controlled `dns.nameserver-policy` section when merging.
    pub nameserver_policy: bool,
    /// Give every profile its own private working directory.
    pub per_profile_work_dir: bool,
    /// Leave the core running when the application exits.
    pub keep_core_alive: bool,
    /// File name of the core binary to supervise.
    pub core_name: String,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            control_dns: true,
            control_sniff: true,
            nameserver_policy: false,
            per_profile_work_dir: false,
            keep_core_alive: false,
            core_name: "mihomo".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controlled_from_yaml(text: &str) -> ControlledConfig {
        serde_yaml::from_str(text).expect("valid controlled config")
    }

    #[test]
    fn filtered_drops_dns_when_control_disabled() {
        let controlled = controlled_from_yaml("dns:\n  enable: true\nhosts:\n  a.test: 1.2.3.4\nmixed-port: 7890\n");
        let settings = AppSettings {
            control_dns: false,
            ..AppSettings::default()
        };

        let doc = controlled.filtered(&settings);
        assert!(!doc.contains_key(Value::from("dns")));
        assert!(!doc.contains_key(Value::from("hosts")));
        assert!(doc.contains_key(Value::from("mixed-port")));
    }

    #[test]
    fn filtered_drops_sniffer_when_control_disabled() {
        let controlled = controlled_from_yaml("sniffer:\n  enable: true\n");
        let settings = AppSettings {
            control_sniff: false,
            ..AppSettings::default()
        };

        assert!(controlled.filtered(&settings).is_empty());
    }

    #[test]
    fn filtered_strips_nameserver_policy_when_feature_off() {
        let controlled =
            controlled_from_yaml("dns:\n  enable: true\n  nameserver-policy:\n    geosite:cn: system\n");
        let doc = controlled.filtered(&AppSettings::default());

        let Some(Value::Mapping(dns)) = doc.get(Value::from("dns")) else {
            panic!("dns section should survive");
        };
        assert!(dns.contains_key(Value::from("enable")));
        assert!(!dns.contains_key(Value::from("nameserver-policy")));
    }

    #[test]
    fn tun_toggle_round_trips() {
        let mut controlled = controlled_from_yaml("tun:\n  enable: true\n  stack: gvisor\n");
        assert!(controlled.tun_enabled());

        controlled.set_tun_enabled(false);
        assert!(!controlled.tun_enabled());

        // The rest of the tun section is untouched.
        let tun = controlled.0.get(Value::from("tun")).expect("tun section");
        assert_eq!(tun.get(Value::from("stack")), Some(&Value::from("gvisor")));
    }
}
