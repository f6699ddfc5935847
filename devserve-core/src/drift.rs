//! Configuration drift detection.
//!
//! When a server starts, the configuration values its command depends on are
//! captured into a [`ConfigSnapshot`]. Later invocations diff that snapshot
//! against the live configuration to tell whether the server is still running
//! with current settings. Drift results are derived on demand and never
//! persisted.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use crate::config::{GlobalConfig, Protocol};
use crate::registry::ServerEntry;
use crate::template::extract_variable_names;

/// A configuration key a server command can depend on.
///
/// Serialized as the user-facing key string (`hostname`, `httpsCert`,
/// `httpsKey`, `protocol`, `portRange`, `variables.NAME`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConfigKey {
    Hostname,
    HttpsCert,
    HttpsKey,
    Protocol,
    PortRange,
    Variable(String),
}

impl ConfigKey {
    /// The template variable this key backs, when there is one.
    pub fn template_var(&self) -> Option<String> {
        match self {
            ConfigKey::Hostname => Some("hostname".into()),
            ConfigKey::HttpsCert => Some("https-cert".into()),
            ConfigKey::HttpsKey => Some("https-key".into()),
            ConfigKey::Protocol => Some("url".into()),
            ConfigKey::PortRange => None,
            ConfigKey::Variable(name) => Some(name.clone()),
        }
    }
}

impl fmt::Display for ConfigKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigKey::Hostname => write!(f, "hostname"),
            ConfigKey::HttpsCert => write!(f, "httpsCert"),
            ConfigKey::HttpsKey => write!(f, "httpsKey"),
            ConfigKey::Protocol => write!(f, "protocol"),
            ConfigKey::PortRange => write!(f, "portRange"),
            ConfigKey::Variable(name) => write!(f, "variables.{}", name),
        }
    }
}

impl std::str::FromStr for ConfigKey {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "hostname" => Ok(ConfigKey::Hostname),
            "httpsCert" => Ok(ConfigKey::HttpsCert),
            "httpsKey" => Ok(ConfigKey::HttpsKey),
            "protocol" => Ok(ConfigKey::Protocol),
            "portRange" => Ok(ConfigKey::PortRange),
            other => match other.strip_prefix("variables.") {
                Some(name) if !name.is_empty() => Ok(ConfigKey::Variable(name.to_string())),
                _ => Err(format!("unknown configuration key '{}'", other)),
            },
        }
    }
}

impl Serialize for ConfigKey {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for ConfigKey {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

/// Configuration values captured when a server last (re)started.
///
/// Only the keys the command actually uses are recorded; `portRange` expands
/// into its two bounds, and only the custom variables referenced by the
/// command are captured so that unrelated variable edits never show as drift.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ConfigSnapshot {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_cert: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub https_key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub protocol: Option<Protocol>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_min: Option<u16>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port_range_max: Option<u16>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_variables: BTreeMap<String, String>,
}

/// One configuration value that changed since the server started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriftedValue {
    pub config_key: ConfigKey,
    pub template_var: Option<String>,
    pub started_with: Option<String>,
    pub current: Option<String>,
}

/// Result of diffing a server's snapshot against the live configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriftResult {
    pub has_drift: bool,
    pub drifted: Vec<DriftedValue>,
    pub port_out_of_range: bool,
    pub protocol_changed: bool,
}

/// Which configuration keys a command depends on.
///
/// `portRange` is always included: every server's valid operating range can
/// change. `protocol` is included only when the command references `{{url}}`,
/// since the rendered URL's scheme depends on it.
pub fn extract_used_config_keys(command: &str, config: &GlobalConfig) -> BTreeSet<ConfigKey> {
    let names = extract_variable_names(command);
    let mut keys = BTreeSet::new();
    keys.insert(ConfigKey::PortRange);
    if names.contains("url") {
        keys.insert(ConfigKey::Protocol);
    }
    for name in &names {
        if let Some(key) = crate::template::builtin_config_key(name) {
            keys.insert(key);
        } else if config.variables.contains_key(name) {
            keys.insert(ConfigKey::Variable(name.clone()));
        }
    }
    keys
}

/// Capture the current configuration values for the given used keys.
pub fn create_config_snapshot(
    config: &GlobalConfig,
    used_keys: &BTreeSet<ConfigKey>,
) -> ConfigSnapshot {
    let mut snapshot = ConfigSnapshot::default();
    for key in used_keys {
        match key {
            ConfigKey::Hostname => snapshot.hostname = Some(config.hostname.clone()),
            ConfigKey::HttpsCert => {
                snapshot.https_cert = config.https_cert.as_ref().map(|p| p.display().to_string())
            }
            ConfigKey::HttpsKey => {
                snapshot.https_key = config.https_key.as_ref().map(|p| p.display().to_string())
            }
            ConfigKey::Protocol => snapshot.protocol = Some(config.protocol),
            ConfigKey::PortRange => {
                snapshot.port_range_min = Some(config.port_range.min);
                snapshot.port_range_max = Some(config.port_range.max);
            }
            ConfigKey::Variable(name) => {
                if let Some(value) = config.variables.get(name) {
                    snapshot.custom_variables.insert(name.clone(), value.clone());
                }
            }
        }
    }
    snapshot
}

/// Diff a server's snapshot against the live configuration.
///
/// A server without a snapshot has nothing to compare against and reports no
/// drift. For `portRange`, only the entry's port falling outside the current
/// range counts; the bounds changing while the port stays inside is fine.
pub fn detect_drift(entry: &ServerEntry, config: &GlobalConfig) -> DriftResult {
    let Some(snapshot) = &entry.config_snapshot else {
        return DriftResult::default();
    };

    let mut result = DriftResult::default();
    for key in &entry.used_config_keys {
        match key {
            ConfigKey::Hostname => {
                let current = Some(config.hostname.clone());
                if snapshot.hostname != current {
                    result.drifted.push(drifted(key, snapshot.hostname.clone(), current));
                }
            }
            ConfigKey::HttpsCert => {
                let current = config.https_cert.as_ref().map(|p| p.display().to_string());
                if snapshot.https_cert != current {
                    result
                        .drifted
                        .push(drifted(key, snapshot.https_cert.clone(), current));
                }
            }
            ConfigKey::HttpsKey => {
                let current = config.https_key.as_ref().map(|p| p.display().to_string());
                if snapshot.https_key != current {
                    result
                        .drifted
                        .push(drifted(key, snapshot.https_key.clone(), current));
                }
            }
            ConfigKey::Protocol => {
                if snapshot.protocol != Some(config.protocol) {
                    result.protocol_changed = true;
                    result.drifted.push(drifted(
                        key,
                        snapshot.protocol.map(|p| p.to_string()),
                        Some(config.protocol.to_string()),
                    ));
                }
            }
            ConfigKey::PortRange => {
                if !config.port_range.contains(entry.port) {
                    result.port_out_of_range = true;
                    let started = match (snapshot.port_range_min, snapshot.port_range_max) {
                        (Some(min), Some(max)) => Some(format!("{}-{}", min, max)),
                        _ => None,
                    };
                    result
                        .drifted
                        .push(drifted(key, started, Some(config.port_range.to_string())));
                }
            }
            ConfigKey::Variable(name) => {
                let started = snapshot.custom_variables.get(name).cloned();
                let current = config.variables.get(name).cloned();
                if started != current {
                    result.drifted.push(drifted(key, started, current));
                }
            }
        }
    }
    result.has_drift = !result.drifted.is_empty();
    result
}

fn drifted(key: &ConfigKey, started_with: Option<String>, current: Option<String>) -> DriftedValue {
    DriftedValue {
        config_key: key.clone(),
        template_var: key.template_var(),
        started_with,
        current,
    }
}

/// Fixed sentinel returned by [`format_drift`] when nothing changed.
pub const NO_DRIFT: &str = "No configuration drift detected.";

/// Human-readable drift summary.
pub fn format_drift(result: &DriftResult) -> String {
    if !result.has_drift {
        return NO_DRIFT.to_string();
    }
    let render = |v: &Option<String>| match v {
        Some(value) => value.clone(),
        None => "(not set)".to_string(),
    };
    let mut lines = vec!["Configuration drift detected:".to_string()];
    for value in &result.drifted {
        let mut line = format!(
            "  {}: started with {}, now {}",
            value.config_key,
            render(&value.started_with),
            render(&value.current),
        );
        if value.config_key == ConfigKey::PortRange && result.port_out_of_range {
            line.push_str(" (assigned port is out of range)");
        }
        lines.push(line);
    }
    lines.join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{PortRange, Protocol};
    use crate::registry::ServerEntry;
    use pretty_assertions::assert_eq;

    fn config() -> GlobalConfig {
        GlobalConfig {
            hostname: "localhost".into(),
            ..GlobalConfig::default()
        }
    }

    fn entry_with(command: &str, port: u16, config: &GlobalConfig) -> ServerEntry {
        let used = extract_used_config_keys(command, config);
        let snapshot = create_config_snapshot(config, &used);
        let mut entry = ServerEntry::new("test", command, "/p".into());
        entry.port = port;
        entry.used_config_keys = used;
        entry.config_snapshot = Some(snapshot);
        entry
    }

    #[test]
    fn used_keys_always_include_port_range() {
        let keys = extract_used_config_keys("npm start", &config());
        assert_eq!(keys.into_iter().collect::<Vec<_>>(), vec![ConfigKey::PortRange]);
    }

    #[test]
    fn url_reference_pulls_in_protocol() {
        let keys = extract_used_config_keys("open {{url}}", &config());
        assert!(keys.contains(&ConfigKey::Protocol));
    }

    #[test]
    fn custom_variable_tracked_only_when_defined() {
        let mut cfg = config();
        cfg.variables.insert("api-url".into(), "http://localhost:3000".into());
        let keys = extract_used_config_keys("serve {{api-url}} {{unrelated}}", &cfg);
        assert!(keys.contains(&ConfigKey::Variable("api-url".into())));
        assert!(!keys.contains(&ConfigKey::Variable("unrelated".into())));
    }

    #[test]
    fn snapshot_captures_only_referenced_variables() {
        let mut cfg = config();
        cfg.variables.insert("api-url".into(), "a".into());
        cfg.variables.insert("other".into(), "b".into());
        let keys = extract_used_config_keys("serve {{api-url}}", &cfg);
        let snapshot = create_config_snapshot(&cfg, &keys);
        assert_eq!(snapshot.custom_variables.len(), 1);
        assert_eq!(snapshot.custom_variables.get("api-url"), Some(&"a".to_string()));
    }

    #[test]
    fn fresh_snapshot_has_no_drift() {
        let cfg = config();
        let entry = entry_with("npm start --host {{hostname}} --port {{port}}", 3456, &cfg);
        let result = detect_drift(&entry, &cfg);
        assert!(!result.has_drift);
        assert_eq!(format_drift(&result), NO_DRIFT);
    }

    #[test]
    fn missing_snapshot_means_no_drift() {
        let cfg = config();
        let mut entry = entry_with("npm start", 3456, &cfg);
        entry.config_snapshot = None;
        assert!(!detect_drift(&entry, &cfg).has_drift);
    }

    #[test]
    fn hostname_change_drifts() {
        let cfg = config();
        let entry = entry_with("serve --host {{hostname}}", 3456, &cfg);
        let mut changed = cfg.clone();
        changed.hostname = "0.0.0.0".into();
        let result = detect_drift(&entry, &changed);
        assert!(result.has_drift);
        assert_eq!(result.drifted.len(), 1);
        let value = &result.drifted[0];
        assert_eq!(value.config_key, ConfigKey::Hostname);
        assert_eq!(value.template_var.as_deref(), Some("hostname"));
        assert_eq!(value.started_with.as_deref(), Some("localhost"));
        assert_eq!(value.current.as_deref(), Some("0.0.0.0"));
    }

    #[test]
    fn protocol_change_sets_flag() {
        let cfg = config();
        let entry = entry_with("open {{url}}", 3456, &cfg);
        let mut changed = cfg.clone();
        changed.protocol = Protocol::Https;
        let result = detect_drift(&entry, &changed);
        assert!(result.has_drift);
        assert!(result.protocol_changed);
    }

    #[test]
    fn range_shrink_flags_out_of_range_port() {
        let cfg = config();
        let entry = entry_with("npm start", 9500, &cfg);
        let mut changed = cfg.clone();
        changed.port_range = PortRange { min: 3000, max: 5000 };
        let result = detect_drift(&entry, &changed);
        assert!(result.port_out_of_range);
        assert!(result.has_drift);
        assert_eq!(result.drifted[0].started_with.as_deref(), Some("3000-9999"));
    }

    #[test]
    fn range_change_without_out_of_range_port_is_not_drift() {
        let cfg = config();
        let entry = entry_with("npm start", 3456, &cfg);
        let mut changed = cfg.clone();
        changed.port_range = PortRange { min: 3000, max: 5000 };
        let result = detect_drift(&entry, &changed);
        assert!(!result.port_out_of_range);
        assert!(!result.has_drift);
    }

    #[test]
    fn removed_variable_drifts_to_not_set() {
        let mut cfg = config();
        cfg.variables.insert("api-url".into(), "http://localhost:3000".into());
        let entry = entry_with("serve {{api-url}}", 3456, &cfg);
        let mut changed = cfg.clone();
        changed.variables.clear();
        let result = detect_drift(&entry, &changed);
        assert!(result.has_drift);
        assert_eq!(result.drifted[0].current, None);
        assert!(format_drift(&result).contains("(not set)"));
    }

    #[test]
    fn config_key_serde_round_trip() {
        for key in [
            ConfigKey::Hostname,
            ConfigKey::HttpsCert,
            ConfigKey::PortRange,
            ConfigKey::Variable("api-url".into()),
        ] {
            let json = serde_json::to_string(&key).unwrap();
            let back: ConfigKey = serde_json::from_str(&json).unwrap();
            assert_eq!(back, key);
        }
    }
}
