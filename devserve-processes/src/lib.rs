//! Process supervision for devserve.
//!
//! Two backends share one capability contract:
//! - Daemon: processes are handed to a persistent pm2 daemon and survive the
//!   invocation.
//! - Spawn: processes run as direct children of the current invocation, for
//!   CI and other disposable runs where no daemon should linger.
//!
//! Both implement the [`ProcessBackend`] trait; callers never depend on
//! backend-specific behavior.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use miette::Result;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub mod daemon;
pub mod log_tailer;
pub mod shutdown;
pub mod spawn;
pub mod tree;

pub use daemon::DaemonBackend;
pub use shutdown::ShutdownSweep;
pub use spawn::{ChildRegistry, SpawnBackend};

/// Prefix applied to every backend handle so managed processes never collide
/// with unrelated processes on the same host.
pub const HANDLE_NAMESPACE: &str = "devserve";

/// Backend handle for a server name.
pub fn handle_for(name: &str) -> String {
    format!("{}:{}", HANDLE_NAMESPACE, name)
}

/// Recover the server name from a namespaced handle.
pub fn name_from_handle(handle: &str) -> Option<&str> {
    handle.strip_prefix(HANDLE_NAMESPACE)?.strip_prefix(':')
}

/// Directory for spawn-backend log files under a base state directory.
/// Creates the directory if it doesn't exist.
pub fn log_dir(state_dir: &Path) -> Result<PathBuf> {
    let dir = state_dir.join("logs");
    std::fs::create_dir_all(&dir)
        .map_err(|e| miette::miette!("Failed to create log directory: {}", e))?;
    Ok(dir)
}

/// Status a backend reports for a supervised server.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ProcessStatus {
    /// Backend has no record of the process.
    #[default]
    Unknown,
    /// Confirmed running.
    Online,
    /// Known, not running.
    Stopped,
    /// Crash loop or abnormal exit.
    Errored,
}

impl ProcessStatus {
    pub fn is_online(self) -> bool {
        matches!(self, ProcessStatus::Online)
    }
}

impl std::fmt::Display for ProcessStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProcessStatus::Unknown => write!(f, "unknown"),
            ProcessStatus::Online => write!(f, "online"),
            ProcessStatus::Stopped => write!(f, "stopped"),
            ProcessStatus::Errored => write!(f, "errored"),
        }
    }
}

/// What a backend knows about one supervised process.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessInfo {
    pub handle: String,
    pub status: ProcessStatus,
    pub pid: Option<u32>,
    pub uptime_start: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub cpu: Option<f32>,
    pub memory: Option<u64>,
    pub out_log: Option<PathBuf>,
    pub err_log: Option<PathBuf>,
}

impl ProcessInfo {
    /// The benign "backend has no record" result.
    pub fn absent(handle: &str) -> Self {
        Self {
            handle: handle.to_string(),
            ..Self::default()
        }
    }
}

/// Everything a backend needs to start one server process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartSpec {
    pub handle: String,
    /// Fully rendered shell command.
    pub command: String,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
}

/// Capability contract shared by the daemon and spawn backends.
#[async_trait]
pub trait ProcessBackend: Send + Sync {
    /// Establish the backend connection. Lazy backends may no-op here and
    /// connect on first use.
    async fn connect(&self) -> Result<()>;

    /// Start a process under the given handle.
    async fn start(&self, spec: &StartSpec) -> Result<()>;

    /// Graceful stop; the backend keeps its record of the process.
    async fn stop(&self, handle: &str) -> Result<()>;

    /// Forceful stop and removal of the backend's record. Absent processes
    /// are not an error.
    async fn delete(&self, handle: &str) -> Result<()>;

    /// In-place restart preserving the prior environment. Environment
    /// changes must go through delete + start instead.
    async fn restart(&self, handle: &str) -> Result<()>;

    /// Query live status. "Not found" is reported as an absent
    /// [`ProcessInfo`], never as an error.
    async fn describe(&self, handle: &str) -> Result<ProcessInfo>;

    /// Truncate logs for one handle, or for all when `None`.
    async fn flush(&self, handle: Option<&str>) -> Result<()>;

    /// All processes this backend knows about.
    async fn list(&self) -> Result<Vec<ProcessInfo>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_round_trip() {
        let handle = handle_for("brave-otter");
        assert_eq!(handle, "devserve:brave-otter");
        assert_eq!(name_from_handle(&handle), Some("brave-otter"));
        assert_eq!(name_from_handle("pm2:other"), None);
    }
}
