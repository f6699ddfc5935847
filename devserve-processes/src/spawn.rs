//! Direct-spawn backend: servers run as children of the current invocation.
//!
//! Used when no persistent daemon is wanted (CI, disposable runs). Children
//! are placed in their own process group, their output is teed to per-run log
//! files and to our own stdout/stderr prefixed with the server name, and
//! every spawned child is tracked in a shared [`ChildRegistry`] so the
//! shutdown sweep can terminate whatever is still alive before we exit.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::{IntoDiagnostic, Result, bail};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex, OnceLock};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{debug, warn};

use crate::tree::{self, KILL_GRACE};
use crate::{ProcessBackend, ProcessInfo, ProcessStatus, StartSpec, name_from_handle};

/// One spawned child and what we need to restart or reap it.
#[derive(Debug, Clone)]
struct TrackedChild {
    pid: u32,
    spec: StartSpec,
    started_at: DateTime<Utc>,
    restart_count: u32,
    out_log: PathBuf,
    err_log: PathBuf,
    /// Set by the reaper task when the child exits: true on success.
    exit_success: Arc<OnceLock<bool>>,
}

/// Process-wide record of children spawned by this invocation.
///
/// Sits behind a synchronous mutex so the signal-driven shutdown sweep can
/// read it without a runtime.
#[derive(Debug, Default)]
pub struct ChildRegistry {
    children: Mutex<HashMap<String, TrackedChild>>,
}

impl ChildRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// PIDs of every still-tracked child, for the shutdown sweep.
    pub fn live_pids(&self) -> Vec<u32> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .values()
            .filter(|c| c.exit_success.get().is_none())
            .map(|c| c.pid)
            .collect()
    }

    fn insert(&self, handle: &str, child: TrackedChild) {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .insert(handle.to_string(), child);
    }

    fn remove(&self, handle: &str) -> Option<TrackedChild> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .remove(handle)
    }

    fn get(&self, handle: &str) -> Option<TrackedChild> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get(handle)
            .cloned()
    }

    fn all(&self) -> Vec<(String, TrackedChild)> {
        self.children
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect()
    }
}

/// Direct child-process backend.
pub struct SpawnBackend {
    registry: Arc<ChildRegistry>,
    log_dir: PathBuf,
}

impl SpawnBackend {
    pub fn new(state_dir: &Path, registry: Arc<ChildRegistry>) -> Result<Self> {
        let log_dir = crate::log_dir(state_dir)?;
        Ok(Self { registry, log_dir })
    }

    pub fn registry(&self) -> Arc<ChildRegistry> {
        Arc::clone(&self.registry)
    }

    fn status_of(child: &TrackedChild) -> ProcessStatus {
        match child.exit_success.get() {
            Some(true) => ProcessStatus::Stopped,
            Some(false) => ProcessStatus::Errored,
            None => {
                if tree::is_alive(child.pid) {
                    ProcessStatus::Online
                } else {
                    ProcessStatus::Stopped
                }
            }
        }
    }

    fn info_of(handle: &str, child: &TrackedChild) -> ProcessInfo {
        let status = Self::status_of(child);
        ProcessInfo {
            handle: handle.to_string(),
            pid: (status == ProcessStatus::Online).then_some(child.pid),
            status,
            uptime_start: Some(child.started_at),
            restart_count: child.restart_count,
            cpu: None,
            memory: None,
            out_log: Some(child.out_log.clone()),
            err_log: Some(child.err_log.clone()),
        }
    }

    async fn spawn_child(&self, spec: &StartSpec, restart_count: u32) -> Result<TrackedChild> {
        let name = name_from_handle(&spec.handle)
            .unwrap_or(&spec.handle)
            .to_string();

        let stamp = Utc::now().format("%Y%m%d-%H%M%S");
        let out_log = self.log_dir.join(format!("{}-{}.out.log", name, stamp));
        let err_log = self.log_dir.join(format!("{}-{}.err.log", name, stamp));

        // Own process group, so the whole tree can be signalled together.
        let mut std_cmd = std::process::Command::new("bash");
        std_cmd
            .arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.cwd)
            .envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        #[cfg(unix)]
        {
            use std::os::unix::process::CommandExt;
            std_cmd.process_group(0);
        }

        let mut child = Command::from(std_cmd)
            .spawn()
            .map_err(|e| miette::miette!("Failed to spawn '{}': {}", spec.command, e))?;
        let pid = child
            .id()
            .ok_or_else(|| miette::miette!("Child for '{}' exited before tracking", name))?;
        debug!("Spawned '{}' as PID {} in {}", name, pid, spec.cwd.display());

        let stdout = child.stdout.take().expect("stdout piped");
        let stderr = child.stderr.take().expect("stderr piped");
        spawn_forwarder(stdout, out_log.clone(), name.clone(), false).await?;
        spawn_forwarder(stderr, err_log.clone(), name.clone(), true).await?;

        let exit_success = Arc::new(OnceLock::new());
        let exit_flag = Arc::clone(&exit_success);
        let reaper_name = name.clone();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) => {
                    debug!("'{}' exited with {}", reaper_name, status);
                    let _ = exit_flag.set(status.success());
                }
                Err(e) => {
                    warn!("Failed to reap '{}': {}", reaper_name, e);
                    let _ = exit_flag.set(false);
                }
            }
        });

        Ok(TrackedChild {
            pid,
            spec: spec.clone(),
            started_at: Utc::now(),
            restart_count,
            out_log,
            err_log,
            exit_success,
        })
    }

    async fn kill_tracked(&self, child: &TrackedChild) {
        let pid = child.pid;
        if child.exit_success.get().is_some() {
            return;
        }
        let _ = tokio::task::spawn_blocking(move || tree::kill_tree(pid, KILL_GRACE)).await;
    }
}

/// Tee one output stream to its log file and to our own stdio with a
/// `[name]` prefix.
async fn spawn_forwarder(
    stream: impl tokio::io::AsyncRead + Unpin + Send + 'static,
    log_path: PathBuf,
    name: String,
    is_stderr: bool,
) -> Result<()> {
    let mut log_file = tokio::fs::File::create(&log_path).await.into_diagnostic()?;
    tokio::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    if let Err(e) = log_file.write_all(format!("{}\n", line).as_bytes()).await {
                        debug!("Failed to write log {}: {}", log_path.display(), e);
                    }
                    if is_stderr {
                        eprintln!("[{}] {}", name, line);
                    } else {
                        println!("[{}] {}", name, line);
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    debug!("Error reading output of '{}': {}", name, e);
                    break;
                }
            }
        }
        let _ = log_file.flush().await;
    });
    Ok(())
}

#[async_trait]
impl ProcessBackend for SpawnBackend {
    async fn connect(&self) -> Result<()> {
        Ok(())
    }

    async fn start(&self, spec: &StartSpec) -> Result<()> {
        if let Some(existing) = self.registry.get(&spec.handle) {
            if Self::status_of(&existing) == ProcessStatus::Online {
                bail!("'{}' is already running as PID {}", spec.handle, existing.pid);
            }
        }
        let child = self.spawn_child(spec, 0).await?;
        self.registry.insert(&spec.handle, child);
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        match self.registry.get(handle) {
            Some(child) => {
                self.kill_tracked(&child).await;
                Ok(())
            }
            None => Ok(()),
        }
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        if let Some(child) = self.registry.remove(handle) {
            self.kill_tracked(&child).await;
        }
        Ok(())
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        let Some(existing) = self.registry.get(handle) else {
            bail!("Cannot restart unknown process '{}'", handle);
        };
        self.kill_tracked(&existing).await;
        // Same spec, same env: environment changes go through delete + start.
        let child = self
            .spawn_child(&existing.spec, existing.restart_count + 1)
            .await?;
        self.registry.insert(handle, child);
        Ok(())
    }

    async fn describe(&self, handle: &str) -> Result<ProcessInfo> {
        Ok(match self.registry.get(handle) {
            Some(child) => Self::info_of(handle, &child),
            None => ProcessInfo::absent(handle),
        })
    }

    async fn flush(&self, handle: Option<&str>) -> Result<()> {
        let targets: Vec<TrackedChild> = match handle {
            Some(handle) => self.registry.get(handle).into_iter().collect(),
            None => self.registry.all().into_iter().map(|(_, c)| c).collect(),
        };
        for child in targets {
            for path in [&child.out_log, &child.err_log] {
                if path.exists() {
                    tokio::fs::File::create(path).await.into_diagnostic()?;
                }
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessInfo>> {
        Ok(self
            .registry
            .all()
            .iter()
            .map(|(handle, child)| Self::info_of(handle, child))
            .collect())
    }
}
