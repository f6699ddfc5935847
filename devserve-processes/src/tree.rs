//! Process-tree termination.
//!
//! Killing only the direct child leaves grandchildren orphaned (shells,
//! `npm run` wrappers, dev-server workers), so teardown enumerates the full
//! descendant tree and signals it deepest-first: SIGTERM everyone, wait out a
//! grace period, then SIGKILL whatever survived.
//!
//! Everything here is synchronous so the shutdown sweep can run it from a
//! signal path without a runtime; async callers go through `spawn_blocking`.

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Grace period between the SIGTERM and SIGKILL passes.
pub const KILL_GRACE: Duration = Duration::from_secs(5);

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Whether a process exists (signal 0 probe).
pub fn is_alive(pid: u32) -> bool {
    signal::kill(Pid::from_raw(pid as i32), None).is_ok()
}

/// Snapshot of the system process table as (pid, ppid) pairs.
///
/// Uses `ps` rather than /proc so the same path works on macOS.
fn process_table() -> Vec<(u32, u32)> {
    let output = match std::process::Command::new("ps")
        .args(["-eo", "pid=,ppid="])
        .output()
    {
        Ok(output) => output,
        Err(e) => {
            warn!("Failed to run ps for process tree enumeration: {}", e);
            return Vec::new();
        }
    };
    String::from_utf8_lossy(&output.stdout)
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let pid = fields.next()?.parse().ok()?;
            let ppid = fields.next()?.parse().ok()?;
            Some((pid, ppid))
        })
        .collect()
}

/// All transitive descendants of `root`, deepest first.
pub fn descendants(root: u32) -> Vec<u32> {
    let mut children: HashMap<u32, Vec<u32>> = HashMap::new();
    for (pid, ppid) in process_table() {
        children.entry(ppid).or_default().push(pid);
    }

    let mut found: Vec<(u32, u32)> = Vec::new();
    let mut stack: Vec<(u32, u32)> = vec![(root, 0)];
    while let Some((pid, depth)) = stack.pop() {
        if pid != root {
            found.push((pid, depth));
        }
        for &child in children.get(&pid).map(Vec::as_slice).unwrap_or_default() {
            stack.push((child, depth + 1));
        }
    }
    found.sort_by(|a, b| b.1.cmp(&a.1));
    found.into_iter().map(|(pid, _)| pid).collect()
}

/// Send a signal, swallowing "already exited" and logging anything else.
/// Signal failures never abort a teardown sequence.
fn send(pid: u32, sig: Signal) {
    match signal::kill(Pid::from_raw(pid as i32), sig) {
        Ok(()) => {}
        Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => warn!("Failed to send {} to PID {}: {}", sig, pid, e),
    }
}

/// Terminate `root` and its full descendant tree.
///
/// SIGTERM pass (descendants deepest-first, then the root), up to `grace` of
/// waiting for natural exit, then a SIGKILL pass for survivors.
pub fn kill_tree(root: u32, grace: Duration) {
    if !is_alive(root) {
        debug!("PID {} already exited, nothing to kill", root);
        return;
    }

    let mut targets = descendants(root);
    targets.push(root);
    debug!("Terminating process tree of {}: {:?}", root, targets);

    for &pid in &targets {
        send(pid, Signal::SIGTERM);
    }

    let deadline = Instant::now() + grace;
    while Instant::now() < deadline {
        if targets.iter().all(|&pid| !is_alive(pid)) {
            return;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    let survivors: Vec<u32> = targets.iter().copied().filter(|&pid| is_alive(pid)).collect();
    if !survivors.is_empty() {
        warn!(
            "Process tree of {} did not exit within {:?}, sending SIGKILL to {:?}",
            root, grace, survivors
        );
        // Re-enumerate: SIGTERM handlers may have spawned replacements.
        let mut remaining = descendants(root);
        remaining.push(root);
        for pid in remaining {
            send(pid, Signal::SIGKILL);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn own_process_is_alive() {
        assert!(is_alive(std::process::id()));
    }

    #[test]
    fn bogus_pid_is_not_alive() {
        // PID near the typical pid_max, extremely unlikely to exist.
        assert!(!is_alive(4_190_000));
    }

    #[test]
    fn kill_tree_on_exited_pid_is_a_no_op() {
        let child = std::process::Command::new("true").spawn().unwrap();
        let pid = child.id();
        let mut child = child;
        child.wait().unwrap();
        kill_tree(pid, Duration::from_millis(100));
    }

    #[test]
    fn descendants_finds_grandchildren() {
        // bash spawns sleep as its child: a two-level tree under us.
        let mut child = std::process::Command::new("bash")
            .args(["-c", "sleep 30 & wait"])
            .spawn()
            .unwrap();
        std::thread::sleep(Duration::from_millis(300));

        let tree = descendants(std::process::id());
        assert!(tree.contains(&child.id()), "direct child missing from {:?}", tree);
        assert!(tree.len() >= 2, "expected grandchild in {:?}", tree);

        kill_tree(child.id(), Duration::from_secs(2));
        child.wait().unwrap();
    }
}
