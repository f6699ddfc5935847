//! The server registry: one JSON file of every managed server.
//!
//! The registry is plain load/save state at
//! `$XDG_STATE_HOME/devserve/servers.json`. A single invocation owns the file
//! for its lifetime; no cross-process locking is attempted.

use chrono::{DateTime, Utc};
use globset::GlobBuilder;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use crate::config::Protocol;
use crate::drift::{ConfigKey, ConfigSnapshot};
use crate::error::{Error, Result};
use crate::ports;

/// One managed process registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerEntry {
    pub id: String,
    pub name: String,
    /// Unrendered command template.
    pub command: String,
    /// Last rendered command.
    pub resolved_command: String,
    pub cwd: PathBuf,
    pub port: u16,
    pub protocol: Protocol,
    pub hostname: String,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub env: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub tags: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Handle the active supervisor backend addresses this server by.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub process_handle: Option<String>,
    /// Identity key for command-hash lookups, derived from (cwd, command).
    pub command_hash: String,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub used_config_keys: BTreeSet<ConfigKey>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config_snapshot: Option<ConfigSnapshot>,
}

impl ServerEntry {
    pub fn new(name: &str, command: &str, cwd: PathBuf) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.to_string(),
            command: command.to_string(),
            resolved_command: command.to_string(),
            command_hash: ports::command_hash(&cwd, command),
            cwd,
            port: 0,
            protocol: Protocol::Http,
            hostname: String::new(),
            env: BTreeMap::new(),
            tags: BTreeSet::new(),
            description: None,
            created_at: Utc::now(),
            process_handle: None,
            used_config_keys: BTreeSet::new(),
            config_snapshot: None,
        }
    }
}

/// Partial update applied by [`Registry::update_server`].
#[derive(Debug, Clone, Default)]
pub struct ServerPatch {
    pub port: Option<u16>,
    pub protocol: Option<Protocol>,
    pub hostname: Option<String>,
    pub resolved_command: Option<String>,
    pub env: Option<BTreeMap<String, String>>,
    pub tags: Option<BTreeSet<String>>,
    pub description: Option<String>,
    pub process_handle: Option<Option<String>>,
    pub used_config_keys: Option<BTreeSet<ConfigKey>>,
    pub config_snapshot: Option<Option<ConfigSnapshot>>,
}

/// Filter for [`Registry::list`]. At most one of the fields is usually set;
/// combining them narrows the result further.
#[derive(Debug, Clone, Default)]
pub struct ListFilter {
    pub tag: Option<String>,
    pub cwd: Option<PathBuf>,
    /// Shell-style glob matched against each entry's command, with `{a,b}`
    /// alternates (e.g. `*{vite,storybook}*`).
    pub cmd_glob: Option<String>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct RegistryData {
    version: u32,
    #[serde(default)]
    servers: Vec<ServerEntry>,
}

const REGISTRY_VERSION: u32 = 1;

/// File-backed registry of managed servers.
pub struct Registry {
    path: PathBuf,
    data: RegistryData,
}

impl Registry {
    pub fn default_path() -> Result<PathBuf> {
        let dirs = xdg::BaseDirectories::with_prefix("devserve");
        dirs.place_state_file("servers.json").map_err(Error::Io)
    }

    /// Load the registry from `path`, starting empty if the file is absent.
    pub fn open(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = std::fs::read_to_string(&path)?;
            serde_json::from_str(&contents).map_err(|e| Error::Registry {
                reason: format!("{}: {}", path.display(), e),
            })?
        } else {
            RegistryData {
                version: REGISTRY_VERSION,
                servers: Vec::new(),
            }
        };
        Ok(Self { path, data })
    }

    pub fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let contents = serde_json::to_string_pretty(&self.data)?;
        std::fs::write(&self.path, contents)?;
        Ok(())
    }

    pub fn find_by_name(&self, cwd: &Path, name: &str) -> Option<ServerEntry> {
        self.data
            .servers
            .iter()
            .find(|s| s.cwd == cwd && s.name == name)
            .cloned()
    }

    pub fn find_by_command_hash(&self, cwd: &Path, command: &str) -> Option<ServerEntry> {
        let hash = ports::command_hash(cwd, command);
        self.data
            .servers
            .iter()
            .find(|s| s.command_hash == hash)
            .cloned()
    }

    pub fn find_by_id(&self, id: &str) -> Option<ServerEntry> {
        self.data.servers.iter().find(|s| s.id == id).cloned()
    }

    /// Every port currently assigned to a registered server.
    pub fn assigned_ports(&self) -> BTreeSet<u16> {
        self.data.servers.iter().map(|s| s.port).collect()
    }

    /// Add a new server, enforcing name uniqueness across the registry.
    pub fn add_server(&mut self, entry: ServerEntry) -> Result<ServerEntry> {
        if self.data.servers.iter().any(|s| s.name == entry.name) {
            return Err(Error::DuplicateName { name: entry.name });
        }
        self.data.servers.push(entry.clone());
        Ok(entry)
    }

    pub fn update_server(&mut self, id: &str, patch: ServerPatch) -> Result<ServerEntry> {
        let entry = self
            .data
            .servers
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| Error::Registry {
                reason: format!("no server with id {}", id),
            })?;
        if let Some(port) = patch.port {
            entry.port = port;
        }
        if let Some(protocol) = patch.protocol {
            entry.protocol = protocol;
        }
        if let Some(hostname) = patch.hostname {
            entry.hostname = hostname;
        }
        if let Some(resolved) = patch.resolved_command {
            entry.resolved_command = resolved;
        }
        if let Some(env) = patch.env {
            entry.env = env;
        }
        if let Some(tags) = patch.tags {
            entry.tags = tags;
        }
        if let Some(description) = patch.description {
            entry.description = Some(description);
        }
        if let Some(handle) = patch.process_handle {
            entry.process_handle = handle;
        }
        if let Some(keys) = patch.used_config_keys {
            entry.used_config_keys = keys;
        }
        if let Some(snapshot) = patch.config_snapshot {
            entry.config_snapshot = snapshot;
        }
        Ok(entry.clone())
    }

    pub fn remove_server(&mut self, id: &str) -> Result<ServerEntry> {
        let index = self
            .data
            .servers
            .iter()
            .position(|s| s.id == id)
            .ok_or_else(|| Error::Registry {
                reason: format!("no server with id {}", id),
            })?;
        Ok(self.data.servers.remove(index))
    }

    /// List entries matching the filter, in registry order.
    pub fn list(&self, filter: &ListFilter) -> Result<Vec<ServerEntry>> {
        let matcher = match &filter.cmd_glob {
            Some(pattern) => Some(
                GlobBuilder::new(pattern)
                    .build()
                    .map_err(|e| Error::InvalidFilter {
                        reason: format!("invalid command glob '{}': {}", pattern, e),
                    })?
                    .compile_matcher(),
            ),
            None => None,
        };
        Ok(self
            .data
            .servers
            .iter()
            .filter(|s| filter.tag.as_ref().is_none_or(|tag| s.tags.contains(tag)))
            .filter(|s| filter.cwd.as_ref().is_none_or(|cwd| &s.cwd == cwd))
            .filter(|s| {
                matcher
                    .as_ref()
                    .is_none_or(|m| m.is_match(s.command.as_str()))
            })
            .cloned()
            .collect())
    }

    pub fn is_empty(&self) -> bool {
        self.data.servers.is_empty()
    }

    pub fn len(&self) -> usize {
        self.data.servers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use tempfile::TempDir;

    fn registry() -> (Registry, TempDir) {
        let dir = TempDir::new().unwrap();
        let registry = Registry::open(dir.path().join("servers.json")).unwrap();
        (registry, dir)
    }

    fn entry(name: &str, command: &str) -> ServerEntry {
        ServerEntry::new(name, command, PathBuf::from("/p"))
    }

    #[test]
    fn duplicate_names_rejected() {
        let (mut registry, _dir) = registry();
        registry.add_server(entry("web", "npx vite")).unwrap();
        let err = registry.add_server(entry("web", "npx next dev")).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { .. }));
    }

    #[test]
    fn lookup_by_name_is_scoped_to_cwd() {
        let (mut registry, _dir) = registry();
        registry.add_server(entry("web", "npx vite")).unwrap();
        assert!(registry.find_by_name(Path::new("/p"), "web").is_some());
        assert!(registry.find_by_name(Path::new("/other"), "web").is_none());
    }

    #[test]
    fn command_hash_lookup_ignores_whitespace() {
        let (mut registry, _dir) = registry();
        registry.add_server(entry("web", "npx vite")).unwrap();
        let found = registry.find_by_command_hash(Path::new("/p"), "  npx   vite  ");
        assert!(found.is_some());
        assert!(
            registry
                .find_by_command_hash(Path::new("/p"), "npx next dev")
                .is_none()
        );
    }

    #[test]
    fn save_and_reload_round_trips() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("servers.json");
        let mut registry = Registry::open(path.clone()).unwrap();
        let mut e = entry("web", "npx vite");
        e.port = 4123;
        e.tags.insert("frontend".into());
        registry.add_server(e.clone()).unwrap();
        registry.save().unwrap();

        let reloaded = Registry::open(path).unwrap();
        assert_eq!(reloaded.find_by_id(&e.id), Some(e));
    }

    #[test]
    fn glob_filter_with_brace_alternates() {
        let (mut registry, _dir) = registry();
        registry.add_server(entry("a", "npx storybook dev")).unwrap();
        registry.add_server(entry("b", "npx vite")).unwrap();
        registry.add_server(entry("c", "npx next dev")).unwrap();

        let filter = ListFilter {
            cmd_glob: Some("*{vite,storybook}*".into()),
            ..Default::default()
        };
        let matched = registry.list(&filter).unwrap();
        let names: Vec<_> = matched.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["a", "b"]);
    }

    #[test]
    fn invalid_glob_is_a_filter_error() {
        let (registry, _dir) = registry();
        let filter = ListFilter {
            cmd_glob: Some("*{vite".into()),
            ..Default::default()
        };
        assert!(matches!(
            registry.list(&filter).unwrap_err(),
            Error::InvalidFilter { .. }
        ));
    }

    #[test]
    fn tag_filter_narrows() {
        let (mut registry, _dir) = registry();
        let mut tagged = entry("a", "npx vite");
        tagged.tags.insert("frontend".into());
        registry.add_server(tagged).unwrap();
        registry.add_server(entry("b", "cargo run")).unwrap();

        let filter = ListFilter {
            tag: Some("frontend".into()),
            ..Default::default()
        };
        let matched = registry.list(&filter).unwrap();
        assert_eq!(matched.len(), 1);
        assert_eq!(matched[0].name, "a");
    }

    #[test]
    fn patch_updates_in_place() {
        let (mut registry, _dir) = registry();
        let e = registry.add_server(entry("web", "npx vite")).unwrap();
        let updated = registry
            .update_server(
                &e.id,
                ServerPatch {
                    port: Some(5123),
                    process_handle: Some(Some("devserve:web".into())),
                    ..Default::default()
                },
            )
            .unwrap();
        assert_eq!(updated.port, 5123);
        assert_eq!(updated.process_handle.as_deref(), Some("devserve:web"));
    }
}
