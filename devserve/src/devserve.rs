//! The orchestrator: ties configuration, registry, port allocation, template
//! rendering and the process backend together into the user-facing
//! operations.
//!
//! The interesting part is [`Devserve::start`]: given a start request it
//! decides whether to create a new server, reuse a running one, or restart an
//! existing one, based on registry lookups, live backend status and an
//! environment diff.

use miette::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use devserve_core::config::{GlobalConfig, Protocol, RefreshPolicy};
use devserve_core::error::Error;
use devserve_core::ports::{self, CiPortLease, PortAllocator};
use devserve_core::registry::{ListFilter, Registry, ServerEntry, ServerPatch};
use devserve_core::template::{self, TemplateVars};
use devserve_core::{drift, names};
use devserve_processes::{
    ProcessBackend, ProcessInfo, ProcessStatus, StartSpec, handle_for,
};

/// A request to start (or reuse) a server.
#[derive(Debug, Clone, Default)]
pub struct StartRequest {
    /// Unrendered command template.
    pub command: String,
    pub cwd: PathBuf,
    /// Requested environment; values may contain `{{placeholders}}`.
    pub env: BTreeMap<String, String>,
    pub name: Option<String>,
    pub port: Option<u32>,
    pub protocol: Option<Protocol>,
    pub tags: BTreeSet<String>,
    pub description: Option<String>,
}

/// What `start` decided to do.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAction {
    /// A new entry was created and its process started.
    Started,
    /// The server was already running with the same environment; untouched.
    Existing,
    /// The server existed but had to be (re)started.
    Restarted,
}

impl std::fmt::Display for StartAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StartAction::Started => write!(f, "started"),
            StartAction::Existing => write!(f, "already running"),
            StartAction::Restarted => write!(f, "restarted"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StartOutcome {
    pub action: StartAction,
    /// True when a differing environment forced a delete + start.
    pub env_changed: bool,
    /// True when the assigned port differs from the requested/preferred one.
    pub port_reassigned: bool,
    pub entry: ServerEntry,
}

/// Which servers a batch operation targets. Exactly one field may be set.
#[derive(Debug, Clone, Default)]
pub struct Selection {
    pub name: Option<String>,
    pub all: bool,
    pub tag: Option<String>,
    pub cmd: Option<String>,
}

/// Per-target result of a batch operation. One target failing never stops
/// the others.
#[derive(Debug)]
pub struct BatchOutcome {
    pub name: String,
    pub result: Result<()>,
}

pub struct Devserve {
    config: GlobalConfig,
    registry: Registry,
    backend: Box<dyn ProcessBackend>,
    ci_mode: bool,
}

impl Devserve {
    pub fn new(
        config: GlobalConfig,
        registry: Registry,
        backend: Box<dyn ProcessBackend>,
        ci_mode: bool,
    ) -> Self {
        Self {
            config,
            registry,
            backend,
            ci_mode,
        }
    }

    pub fn config(&self) -> &GlobalConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut GlobalConfig {
        &mut self.config
    }

    pub fn ci_mode(&self) -> bool {
        self.ci_mode
    }

    /// Start a server, creating or reusing a registry entry as appropriate.
    ///
    /// Lookup is by `(cwd, name)` when a name is given, otherwise by the
    /// normalized command hash. An explicit name that matches nothing always
    /// creates a new entry, even when the same command is already registered
    /// under another name; the old entry is left alone.
    pub async fn start(&mut self, request: StartRequest) -> Result<StartOutcome> {
        let candidate = match &request.name {
            Some(name) => self.registry.find_by_name(&request.cwd, name),
            None => self
                .registry
                .find_by_command_hash(&request.cwd, &request.command),
        };
        match candidate {
            None => self.start_new(request).await,
            Some(entry) => self.start_existing(entry, request).await,
        }
    }

    async fn start_new(&mut self, request: StartRequest) -> Result<StartOutcome> {
        let existing: BTreeSet<String> = self
            .registry
            .list(&ListFilter::default())?
            .into_iter()
            .map(|e| e.name)
            .collect();
        let name = match &request.name {
            Some(name) => name.clone(),
            // CI invocations may not share a registry, so the name must be
            // derivable from the inputs alone.
            None if self.ci_mode => names::deterministic_name(&request.command, &request.env),
            None => names::generate_name(&existing, names::DEFAULT_MAX_ATTEMPTS),
        };

        let mut allocator = self.allocator(self.registry.assigned_ports());
        let assignment = allocator.assign(&request.cwd, &request.command, request.port)?;
        allocator.save_ci_lease()?;

        let protocol = request.protocol.unwrap_or(self.config.protocol);
        let vars = self.template_vars(assignment.port, protocol);
        self.check_missing(&request.command, &vars)?;
        let resolved_command = {
            let resolver = sibling_resolver(&self.registry);
            template::render_with_lookup(&request.command, &vars, Some(&request.cwd), &resolver)?
        };
        let env = self.resolve_env(&request.env, &vars, &request.cwd)?;
        let used = drift::extract_used_config_keys(
            &dependency_text(&request.command, &request.env),
            &self.config,
        );
        let snapshot = drift::create_config_snapshot(&self.config, &used);

        let handle = handle_for(&name);
        let mut entry = ServerEntry::new(&name, &request.command, request.cwd.clone());
        entry.port = assignment.port;
        entry.protocol = protocol;
        entry.hostname = self.config.hostname.clone();
        entry.resolved_command = resolved_command.clone();
        entry.env = env.clone();
        entry.tags = request.tags;
        entry.description = request.description;
        entry.process_handle = Some(handle.clone());
        entry.used_config_keys = used;
        entry.config_snapshot = Some(snapshot);

        self.backend
            .start(&StartSpec {
                handle,
                command: resolved_command,
                cwd: request.cwd,
                env,
            })
            .await?;
        let entry = self.registry.add_server(entry)?;
        self.registry.save()?;
        info!("Started '{}' on port {}", entry.name, entry.port);

        Ok(StartOutcome {
            action: StartAction::Started,
            env_changed: false,
            port_reassigned: assignment.reassigned,
            entry,
        })
    }

    async fn start_existing(
        &mut self,
        entry: ServerEntry,
        request: StartRequest,
    ) -> Result<StartOutcome> {
        let handle = entry
            .process_handle
            .clone()
            .unwrap_or_else(|| handle_for(&entry.name));
        // Only possible when the lookup was by explicit name; a command-hash
        // match implies the normalized commands agree.
        if ports::command_hash(&entry.cwd, &request.command) != entry.command_hash {
            warn!(
                "'{}' is registered with command '{}'; ignoring the requested '{}'",
                entry.name, entry.command, request.command
            );
        }
        let info = self.backend.describe(&handle).await?;

        let port = self.effective_port(&entry, &request)?;
        let protocol = request.protocol.unwrap_or(entry.protocol);
        let vars = self.template_vars(port, protocol);
        let requested_env = self.resolve_env(&request.env, &vars, &request.cwd)?;
        let env_changed = requested_env != entry.env;

        if info.status.is_online() && !env_changed {
            let drift_result = drift::detect_drift(&entry, &self.config);
            let wants_refresh = matches!(
                self.config.refresh_on_change,
                RefreshPolicy::OnStart | RefreshPolicy::Auto
            );
            if (drift_result.has_drift || drift_result.port_out_of_range) && wants_refresh {
                info!("Refreshing '{}': {}", entry.name, drift::format_drift(&drift_result));
                let port_reassigned = port != entry.port;
                let entry = self
                    .refresh_entry(entry, &handle, port, protocol, None, &request.env)
                    .await?;
                return Ok(StartOutcome {
                    action: StartAction::Restarted,
                    env_changed: false,
                    port_reassigned,
                    entry,
                });
            }
            if drift_result.has_drift {
                warn!("'{}': {}", entry.name, drift::format_drift(&drift_result));
            }
            debug!("'{}' already running on port {}", entry.name, entry.port);
            return Ok(StartOutcome {
                action: StartAction::Existing,
                env_changed: false,
                port_reassigned: false,
                entry,
            });
        }

        if env_changed {
            // A backend restart would preserve the old environment, so the
            // process has to be deleted and started fresh.
            let port_reassigned = port != entry.port;
            let entry = self
                .refresh_entry(entry, &handle, port, protocol, Some(requested_env), &request.env)
                .await?;
            return Ok(StartOutcome {
                action: StartAction::Restarted,
                env_changed: true,
                port_reassigned,
                entry,
            });
        }

        // Not online, environment unchanged: restart in place when the
        // backend still has a record, otherwise start fresh from the entry.
        match info.status {
            ProcessStatus::Unknown => {
                let port_reassigned = port != entry.port;
                let entry = self
                    .refresh_entry(entry, &handle, port, protocol, None, &request.env)
                    .await?;
                Ok(StartOutcome {
                    action: StartAction::Restarted,
                    env_changed: false,
                    port_reassigned,
                    entry,
                })
            }
            _ => {
                self.backend.restart(&handle).await?;
                info!("Restarted '{}'", entry.name);
                Ok(StartOutcome {
                    action: StartAction::Restarted,
                    env_changed: false,
                    port_reassigned: false,
                    entry,
                })
            }
        }
    }

    /// Delete the backend process (absent is fine), re-render the command
    /// against the current configuration, update the entry and start fresh.
    ///
    /// `raw_env` is the requested environment before template resolution;
    /// dependency extraction must see the same text as the create path, or
    /// variables referenced only in the environment fall out of drift
    /// tracking.
    async fn refresh_entry(
        &mut self,
        entry: ServerEntry,
        handle: &str,
        port: u16,
        protocol: Protocol,
        new_env: Option<BTreeMap<String, String>>,
        raw_env: &BTreeMap<String, String>,
    ) -> Result<ServerEntry> {
        self.backend.delete(handle).await?;

        let vars = self.template_vars(port, protocol);
        self.check_missing(&entry.command, &vars)?;
        let resolved_command = {
            let resolver = sibling_resolver(&self.registry);
            template::render_with_lookup(&entry.command, &vars, Some(&entry.cwd), &resolver)?
        };
        let env = new_env.unwrap_or_else(|| entry.env.clone());
        let used = drift::extract_used_config_keys(
            &dependency_text(&entry.command, raw_env),
            &self.config,
        );
        let snapshot = drift::create_config_snapshot(&self.config, &used);

        let updated = self.registry.update_server(
            &entry.id,
            ServerPatch {
                port: Some(port),
                protocol: Some(protocol),
                hostname: Some(self.config.hostname.clone()),
                resolved_command: Some(resolved_command.clone()),
                env: Some(env.clone()),
                process_handle: Some(Some(handle.to_string())),
                used_config_keys: Some(used),
                config_snapshot: Some(Some(snapshot)),
                ..Default::default()
            },
        )?;
        self.backend
            .start(&StartSpec {
                handle: handle.to_string(),
                command: resolved_command,
                cwd: entry.cwd.clone(),
                env,
            })
            .await?;
        self.registry.save()?;
        Ok(updated)
    }

    /// Port to use when acting on an existing entry. An explicit port is
    /// validated against the range whatever the action; otherwise the
    /// entry's port is kept unless the range no longer contains it.
    fn effective_port(&self, entry: &ServerEntry, request: &StartRequest) -> Result<u16> {
        match request.port {
            Some(port) => {
                if port > u32::from(u16::MAX) || !self.config.port_range.contains(port as u16) {
                    return Err(Error::PortOutOfRange {
                        port,
                        min: self.config.port_range.min,
                        max: self.config.port_range.max,
                    }
                    .into());
                }
                Ok(port as u16)
            }
            None if self.config.port_range.contains(entry.port) => Ok(entry.port),
            None => {
                let mut occupied = self.registry.assigned_ports();
                occupied.remove(&entry.port);
                let mut allocator = self.allocator(occupied);
                let assignment = allocator.assign(&entry.cwd, &entry.command, None)?;
                allocator.save_ci_lease()?;
                Ok(assignment.port)
            }
        }
    }

    fn allocator(&self, occupied: BTreeSet<u16>) -> PortAllocator {
        let allocator = PortAllocator::new(self.config.port_range, occupied);
        if self.ci_mode {
            allocator.with_ci_lease(CiPortLease::load())
        } else {
            allocator
        }
    }

    /// Variable values available to templates for a given port/protocol.
    fn template_vars(&self, port: u16, protocol: Protocol) -> TemplateVars {
        let mut vars: TemplateVars = self.config.variables.clone();
        vars.insert("port".into(), port.to_string());
        vars.insert("hostname".into(), self.config.hostname.clone());
        vars.insert(
            "url".into(),
            format!("{}://{}:{}", protocol, self.config.hostname, port),
        );
        if let Some(cert) = &self.config.https_cert {
            vars.insert("https-cert".into(), cert.display().to_string());
        }
        if let Some(key) = &self.config.https_key {
            vars.insert("https-key".into(), key.display().to_string());
        }
        vars
    }

    fn check_missing(&self, template: &str, vars: &TemplateVars) -> Result<()> {
        for missing in template::find_missing_variables(template, vars) {
            if let Some(key) = &missing.config_key {
                return Err(Error::ConfigInvalid {
                    reason: format!(
                        "template variable '{{{{{}}}}}' is unset; set it with `devserve config set {} <value>`",
                        missing.name, key
                    ),
                }
                .into());
            }
            if missing.is_custom {
                return Err(Error::TemplateMissingVariable { name: missing.name }.into());
            }
        }
        Ok(())
    }

    fn resolve_env(
        &self,
        env: &BTreeMap<String, String>,
        vars: &TemplateVars,
        cwd: &Path,
    ) -> Result<BTreeMap<String, String>> {
        let resolver = sibling_resolver(&self.registry);
        env.iter()
            .map(|(key, value)| {
                let rendered = template::render_with_lookup(value, vars, Some(cwd), &resolver)?;
                Ok((key.clone(), rendered))
            })
            .collect()
    }

    fn entry(&self, cwd: &Path, name: &str) -> Result<ServerEntry> {
        self.registry
            .find_by_name(cwd, name)
            .ok_or_else(|| {
                Error::ServerNotFound {
                    name: name.to_string(),
                    cwd: cwd.to_path_buf(),
                }
                .into()
            })
    }

    fn select_targets(&self, cwd: &Path, selection: &Selection) -> Result<Vec<ServerEntry>> {
        let set = [
            selection.name.is_some(),
            selection.all,
            selection.tag.is_some(),
            selection.cmd.is_some(),
        ];
        match set.iter().filter(|&&s| s).count() {
            0 => {
                return Err(Error::InvalidFilter {
                    reason: "specify a server name or one of --all, --tag, --cmd".into(),
                }
                .into());
            }
            1 => {}
            _ => {
                return Err(Error::InvalidFilter {
                    reason: "a server name, --all, --tag and --cmd are mutually exclusive".into(),
                }
                .into());
            }
        }
        if let Some(name) = &selection.name {
            return Ok(vec![self.entry(cwd, name)?]);
        }
        let filter = ListFilter {
            tag: selection.tag.clone(),
            cmd_glob: selection.cmd.clone(),
            cwd: None,
        };
        Ok(self.registry.list(&filter)?)
    }

    /// Gracefully stop each selected server. Backend records are kept so the
    /// servers can be restarted later.
    pub async fn stop(&mut self, cwd: &Path, selection: &Selection) -> Result<Vec<BatchOutcome>> {
        let targets = self.select_targets(cwd, selection)?;
        let mut outcomes = Vec::with_capacity(targets.len());
        for entry in targets {
            let handle = handle_of(&entry);
            let result = self.backend.stop(&handle).await;
            outcomes.push(BatchOutcome {
                name: entry.name,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Restart each selected server in place, preserving its environment.
    pub async fn restart(
        &mut self,
        cwd: &Path,
        selection: &Selection,
    ) -> Result<Vec<BatchOutcome>> {
        let targets = self.select_targets(cwd, selection)?;
        let mut outcomes = Vec::with_capacity(targets.len());
        for entry in targets {
            let handle = handle_of(&entry);
            let result = self.backend.restart(&handle).await;
            outcomes.push(BatchOutcome {
                name: entry.name,
                result,
            });
        }
        Ok(outcomes)
    }

    /// Kill and forget each selected server: backend record and registry
    /// entry both go away.
    pub async fn remove(&mut self, cwd: &Path, selection: &Selection) -> Result<Vec<BatchOutcome>> {
        let targets = self.select_targets(cwd, selection)?;
        let mut outcomes = Vec::with_capacity(targets.len());
        for entry in targets {
            let handle = handle_of(&entry);
            let result = match self.backend.delete(&handle).await {
                Ok(()) => self
                    .registry
                    .remove_server(&entry.id)
                    .map(|_| ())
                    .map_err(Into::into),
                Err(e) => Err(e),
            };
            outcomes.push(BatchOutcome {
                name: entry.name,
                result,
            });
        }
        self.registry.save()?;
        Ok(outcomes)
    }

    /// Registry entries matching the filter, each with its live status.
    pub async fn list(&self, filter: &ListFilter) -> Result<Vec<(ServerEntry, ProcessInfo)>> {
        let mut rows = Vec::new();
        for entry in self.registry.list(filter)? {
            let info = self.backend.describe(&handle_of(&entry)).await?;
            rows.push((entry, info));
        }
        Ok(rows)
    }

    /// Live backend view of one server, for `logs` and status display.
    pub async fn describe(&self, cwd: &Path, name: &str) -> Result<ProcessInfo> {
        let entry = self.entry(cwd, name)?;
        self.backend.describe(&handle_of(&entry)).await
    }

    /// Truncate logs for one server, or for everything devserve manages.
    pub async fn flush_logs(&mut self, cwd: &Path, name: Option<&str>) -> Result<()> {
        match name {
            Some(name) => {
                let entry = self.entry(cwd, name)?;
                self.backend.flush(Some(&handle_of(&entry))).await
            }
            None => self.backend.flush(None).await,
        }
    }

    /// Human-readable drift summary for one server.
    pub fn drift_report(&self, cwd: &Path, name: &str) -> Result<String> {
        let entry = self.entry(cwd, name)?;
        let result = drift::detect_drift(&entry, &self.config);
        Ok(drift::format_drift(&result))
    }
}

fn handle_of(entry: &ServerEntry) -> String {
    entry
        .process_handle
        .clone()
        .unwrap_or_else(|| handle_for(&entry.name))
}

/// Text scanned for configuration-key dependencies: the command template
/// plus the raw (unrendered) environment values.
fn dependency_text(command: &str, env: &BTreeMap<String, String>) -> String {
    let mut text = command.to_string();
    for value in env.values() {
        text.push(' ');
        text.push_str(value);
    }
    text
}

/// Resolver for `{{$ "server" "property"}}` lookups against the registry.
fn sibling_resolver(
    registry: &Registry,
) -> impl Fn(&Path, &str, &str) -> std::result::Result<String, String> + '_ {
    move |dir: &Path, server: &str, property: &str| {
        let entry = registry.find_by_name(dir, server).ok_or_else(|| {
            format!("no server named '{}' in {}", server, dir.display())
        })?;
        match property {
            "port" => Ok(entry.port.to_string()),
            "hostname" => Ok(entry.hostname.clone()),
            "url" => Ok(format!(
                "{}://{}:{}",
                entry.protocol, entry.hostname, entry.port
            )),
            "name" => Ok(entry.name.clone()),
            "command" => Ok(entry.resolved_command.clone()),
            other => Err(format!(
                "server '{}' has no property '{}'",
                server, other
            )),
        }
    }
}
