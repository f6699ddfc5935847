//! Daemon-managed backend: processes are handed to a persistent pm2 daemon.
//!
//! Wraps the external `pm2` CLI. The connection (a `pm2 ping`, which also
//! boots the daemon when absent) is established lazily and at most once per
//! invocation. "Process not found" responses from describe/delete are benign
//! and mapped to an absent result; anything else from the daemon is a fault.

use async_trait::async_trait;
use chrono::DateTime;
use miette::{Result, bail, miette};
use serde::Deserialize;
use std::path::PathBuf;
use tokio::process::Command;
use tokio::sync::OnceCell;
use tracing::debug;

use crate::{HANDLE_NAMESPACE, ProcessBackend, ProcessInfo, ProcessStatus, StartSpec};

pub struct DaemonBackend {
    connected: OnceCell<()>,
}

impl DaemonBackend {
    pub fn new() -> Self {
        Self {
            connected: OnceCell::new(),
        }
    }

    async fn ensure_connected(&self) -> Result<()> {
        self.connected
            .get_or_try_init(|| async {
                let output = Command::new("pm2")
                    .arg("ping")
                    .output()
                    .await
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::NotFound => {
                            miette!("pm2 not found on PATH; install pm2 or run in CI mode")
                        }
                        _ => miette!("Failed to reach the pm2 daemon: {}", e),
                    })?;
                if !output.status.success() {
                    bail!(
                        "pm2 daemon did not respond to ping: {}",
                        String::from_utf8_lossy(&output.stderr).trim()
                    );
                }
                debug!("Connected to pm2 daemon");
                Ok(())
            })
            .await
            .map(|_| ())
    }

    async fn pm2(&self, args: &[&str], env: Option<&StartSpec>) -> Result<Pm2Output> {
        self.ensure_connected().await?;
        let mut cmd = Command::new("pm2");
        cmd.args(args);
        if let Some(spec) = env {
            cmd.envs(&spec.env);
        }
        let output = cmd
            .output()
            .await
            .map_err(|e| miette!("Failed to invoke pm2 {}: {}", args.join(" "), e))?;
        Ok(Pm2Output {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn jlist(&self) -> Result<Vec<Pm2Process>> {
        let output = self.pm2(&["jlist"], None).await?;
        if !output.success {
            bail!("pm2 jlist failed: {}", output.stderr.trim());
        }
        serde_json::from_str(&output.stdout)
            .map_err(|e| miette!("Unparseable pm2 jlist output: {}", e))
    }
}

impl Default for DaemonBackend {
    fn default() -> Self {
        Self::new()
    }
}

struct Pm2Output {
    success: bool,
    stdout: String,
    stderr: String,
}

impl Pm2Output {
    /// pm2 reports unknown names as "Process or Namespace X not found".
    fn is_not_found(&self) -> bool {
        self.stderr.to_lowercase().contains("not found")
    }
}

#[derive(Debug, Deserialize)]
struct Pm2Process {
    name: String,
    #[serde(default)]
    pid: Option<u32>,
    pm2_env: Pm2Env,
    #[serde(default)]
    monit: Option<Pm2Monit>,
}

#[derive(Debug, Deserialize)]
struct Pm2Env {
    #[serde(default)]
    status: Option<String>,
    /// Epoch milliseconds of the last (re)start.
    #[serde(default)]
    pm_uptime: Option<i64>,
    #[serde(default)]
    restart_time: Option<u32>,
    #[serde(default)]
    pm_out_log_path: Option<PathBuf>,
    #[serde(default)]
    pm_err_log_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
struct Pm2Monit {
    #[serde(default)]
    cpu: Option<f32>,
    #[serde(default)]
    memory: Option<u64>,
}

/// pm2 invocation for starting one server. Autorestart is disabled so that
/// crashed or exited servers stay visible as stopped/errored instead of
/// being silently resurrected by the daemon.
fn start_args(spec: &StartSpec) -> Vec<String> {
    vec![
        "start".into(),
        "bash".into(),
        "--name".into(),
        spec.handle.clone(),
        "--cwd".into(),
        spec.cwd.display().to_string(),
        "--no-autorestart".into(),
        "--".into(),
        "-c".into(),
        spec.command.clone(),
    ]
}

fn parse_status(status: Option<&str>) -> ProcessStatus {
    match status {
        Some("online" | "launching") => ProcessStatus::Online,
        Some("stopped" | "stopping") => ProcessStatus::Stopped,
        Some("errored") => ProcessStatus::Errored,
        _ => ProcessStatus::Unknown,
    }
}

fn info_from(process: Pm2Process) -> ProcessInfo {
    let status = parse_status(process.pm2_env.status.as_deref());
    ProcessInfo {
        handle: process.name,
        status,
        pid: process.pid.filter(|&pid| pid != 0 && status.is_online()),
        uptime_start: process
            .pm2_env
            .pm_uptime
            .and_then(DateTime::from_timestamp_millis),
        restart_count: process.pm2_env.restart_time.unwrap_or(0),
        cpu: process.monit.as_ref().and_then(|m| m.cpu),
        memory: process.monit.as_ref().and_then(|m| m.memory),
        out_log: process.pm2_env.pm_out_log_path,
        err_log: process.pm2_env.pm_err_log_path,
    }
}

#[async_trait]
impl ProcessBackend for DaemonBackend {
    async fn connect(&self) -> Result<()> {
        self.ensure_connected().await
    }

    async fn start(&self, spec: &StartSpec) -> Result<()> {
        let args = start_args(spec);
        let args: Vec<&str> = args.iter().map(String::as_str).collect();
        let output = self.pm2(&args, Some(spec)).await?;
        if !output.success {
            bail!(
                "pm2 failed to start '{}': {}",
                spec.handle,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn stop(&self, handle: &str) -> Result<()> {
        let output = self.pm2(&["stop", handle], None).await?;
        if !output.success && !output.is_not_found() {
            bail!("pm2 failed to stop '{}': {}", handle, output.stderr.trim());
        }
        Ok(())
    }

    async fn delete(&self, handle: &str) -> Result<()> {
        let output = self.pm2(&["delete", handle], None).await?;
        if !output.success && !output.is_not_found() {
            bail!("pm2 failed to delete '{}': {}", handle, output.stderr.trim());
        }
        Ok(())
    }

    async fn restart(&self, handle: &str) -> Result<()> {
        // No --update-env: an in-place restart keeps the prior environment.
        let output = self.pm2(&["restart", handle], None).await?;
        if !output.success {
            bail!(
                "pm2 failed to restart '{}': {}",
                handle,
                output.stderr.trim()
            );
        }
        Ok(())
    }

    async fn describe(&self, handle: &str) -> Result<ProcessInfo> {
        let processes = self.jlist().await?;
        Ok(processes
            .into_iter()
            .find(|p| p.name == handle)
            .map(info_from)
            .unwrap_or_else(|| ProcessInfo::absent(handle)))
    }

    async fn flush(&self, handle: Option<&str>) -> Result<()> {
        let output = match handle {
            Some(handle) => self.pm2(&["flush", handle], None).await?,
            None => self.pm2(&["flush"], None).await?,
        };
        if !output.success && !output.is_not_found() {
            bail!("pm2 failed to flush logs: {}", output.stderr.trim());
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<ProcessInfo>> {
        let prefix = format!("{}:", HANDLE_NAMESPACE);
        Ok(self
            .jlist()
            .await?
            .into_iter()
            .filter(|p| p.name.starts_with(&prefix))
            .map(info_from)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jlist_subset_parses() {
        let json = r#"[{
            "name": "devserve:brave-otter",
            "pid": 4242,
            "pm2_env": {
                "status": "online",
                "pm_uptime": 1700000000000,
                "restart_time": 3,
                "pm_out_log_path": "/tmp/out.log",
                "pm_err_log_path": "/tmp/err.log"
            },
            "monit": { "cpu": 1.5, "memory": 10485760 }
        }]"#;
        let processes: Vec<Pm2Process> = serde_json::from_str(json).unwrap();
        let info = info_from(processes.into_iter().next().unwrap());
        assert_eq!(info.status, ProcessStatus::Online);
        assert_eq!(info.pid, Some(4242));
        assert_eq!(info.restart_count, 3);
        assert_eq!(info.memory, Some(10_485_760));
    }

    #[test]
    fn stopped_process_reports_no_pid() {
        let json = r#"[{
            "name": "devserve:x",
            "pid": 0,
            "pm2_env": { "status": "stopped" }
        }]"#;
        let processes: Vec<Pm2Process> = serde_json::from_str(json).unwrap();
        let info = info_from(processes.into_iter().next().unwrap());
        assert_eq!(info.status, ProcessStatus::Stopped);
        assert_eq!(info.pid, None);
    }

    #[test]
    fn start_disables_autorestart() {
        let spec = StartSpec {
            handle: "devserve:web".into(),
            command: "npx vite --port 4123".into(),
            cwd: "/proj".into(),
            env: Default::default(),
        };
        let args = start_args(&spec);
        assert!(args.contains(&"--no-autorestart".to_string()));
        // The command goes to bash after the `--` separator, untouched.
        assert_eq!(
            &args[args.len() - 3..],
            &["--".to_string(), "-c".to_string(), spec.command.clone()]
        );
        assert!(args.iter().position(|a| a == "--no-autorestart").unwrap()
            < args.iter().position(|a| a == "--").unwrap());
    }

    #[test]
    fn unknown_status_maps_to_unknown() {
        assert_eq!(parse_status(Some("waiting restart")), ProcessStatus::Unknown);
        assert_eq!(parse_status(None), ProcessStatus::Unknown);
    }
}
