//! Deterministic port allocation.
//!
//! Every (working directory, command) pair hashes to a preferred port inside
//! the configured range, so re-running the identical command from the
//! identical directory lands on the same port across machine restarts. On
//! conflict the allocator walks upward through the range, wrapping at the top.
//!
//! In CI mode, invocations may not share a registry, so claimed ports are
//! additionally recorded in a shared lease file with a one-hour TTL. The
//! lease is deliberately unlocked, best-effort state: concurrent CI jobs can
//! still race, and staleness eviction plus skip-if-claimed is the only
//! mitigation. That is inherited behavior, not a defect to fix here.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::io::ErrorKind;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::config::PortRange;
use crate::error::{Error, Result};

/// Milliseconds a CI lease entry stays valid.
const CI_LEASE_TTL_MS: i64 = 60 * 60 * 1000;

const CI_LEASE_FILE: &str = "devserve-ci-ports.json";

/// 32-bit FNV-1a over a byte string.
fn fnv1a_32(input: &str) -> u32 {
    let mut hash: u32 = 0x811c9dc5;
    for byte in input.bytes() {
        hash ^= u32::from(byte);
        hash = hash.wrapping_mul(0x0100_0193);
    }
    hash
}

/// Normalized identity string for a (cwd, command) pair: trimmed command with
/// whitespace runs collapsed, joined to the directory with a colon.
pub fn normalize_identity(cwd: &Path, command: &str) -> String {
    let collapsed = command.split_whitespace().collect::<Vec<_>>().join(" ");
    format!("{}:{}", cwd.display(), collapsed)
}

/// Identity hash used by the registry to recognize the same logical server.
pub fn command_hash(cwd: &Path, command: &str) -> String {
    format!("{:08x}", fnv1a_32(&normalize_identity(cwd, command)))
}

/// The deterministic port a (cwd, command) pair prefers inside `range`.
pub fn preferred_port(cwd: &Path, command: &str, range: PortRange) -> u16 {
    let hash = fnv1a_32(&normalize_identity(cwd, command));
    let offset = hash % range.span();
    range.min + offset as u16
}

/// Whether a TCP listener can currently bind the port on all interfaces.
///
/// "Address in use" means unavailable; any other bind error is a fault.
pub fn is_available(port: u16) -> Result<bool> {
    match TcpListener::bind(("0.0.0.0", port)) {
        Ok(_) => Ok(true),
        Err(e) if e.kind() == ErrorKind::AddrInUse => Ok(false),
        Err(source) => Err(Error::PortProbe { port, source }),
    }
}

/// Describe the process occupying a port, for error and log messages.
/// Returns an empty string when it cannot be determined.
pub fn process_using_port(port: u16) -> String {
    use netstat2::{AddressFamilyFlags, ProtocolFlags, ProtocolSocketInfo, get_sockets_info};

    let af_flags = AddressFamilyFlags::IPV4 | AddressFamilyFlags::IPV6;
    let Ok(sockets) = get_sockets_info(af_flags, ProtocolFlags::TCP) else {
        return String::new();
    };

    for socket in sockets {
        let local_port = match &socket.protocol_socket_info {
            ProtocolSocketInfo::Tcp(tcp) => tcp.local_port,
            ProtocolSocketInfo::Udp(udp) => udp.local_port,
        };
        if local_port == port {
            if let Some(&pid) = socket.associated_pids.first() {
                #[cfg(target_os = "linux")]
                if let Ok(name) = std::fs::read_to_string(format!("/proc/{}/comm", pid)) {
                    return format!(" by {} (PID {})", name.trim(), pid);
                }
                return format!(" (PID {})", pid);
            }
        }
    }
    String::new()
}

/// Ports claimed by CI-mode invocations within the lease TTL.
///
/// File layout: `{"ports": [int], "timestamp": epoch-ms}` at a fixed path in
/// the system temp directory.
#[derive(Debug)]
pub struct CiPortLease {
    path: PathBuf,
    leased: BTreeSet<u16>,
    tracked: BTreeSet<u16>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct LeaseFile {
    ports: Vec<u16>,
    timestamp: i64,
}

impl CiPortLease {
    pub fn default_path() -> PathBuf {
        std::env::temp_dir().join(CI_LEASE_FILE)
    }

    pub fn load() -> Self {
        Self::load_from(Self::default_path())
    }

    /// Read the lease file, evicting it entirely when older than the TTL.
    /// Read failures are treated as an empty lease.
    pub fn load_from(path: PathBuf) -> Self {
        let leased = match std::fs::read_to_string(&path) {
            Ok(contents) => match serde_json::from_str::<LeaseFile>(&contents) {
                Ok(file) => {
                    let age = Utc::now().timestamp_millis() - file.timestamp;
                    if age > CI_LEASE_TTL_MS {
                        debug!("Discarding stale CI port lease ({} ms old)", age);
                        BTreeSet::new()
                    } else {
                        file.ports.into_iter().collect()
                    }
                }
                Err(e) => {
                    warn!("Unparseable CI port lease {}: {}", path.display(), e);
                    BTreeSet::new()
                }
            },
            Err(_) => BTreeSet::new(),
        };
        Self {
            path,
            leased,
            tracked: BTreeSet::new(),
        }
    }

    pub fn contains(&self, port: u16) -> bool {
        self.leased.contains(&port) || self.tracked.contains(&port)
    }

    /// Claim a port in memory only; [`CiPortLease::save`] persists the batch.
    pub fn track(&mut self, port: u16) {
        self.tracked.insert(port);
    }

    /// Write leased plus tracked ports back with a fresh timestamp.
    pub fn save(&self) -> Result<()> {
        let file = LeaseFile {
            ports: self.leased.union(&self.tracked).copied().collect(),
            timestamp: Utc::now().timestamp_millis(),
        };
        std::fs::write(&self.path, serde_json::to_string(&file)?)?;
        Ok(())
    }
}

/// Result of a port assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortAssignment {
    pub port: u16,
    /// True when the returned port differs from the requested/preferred one.
    pub reassigned: bool,
}

/// Assigns ports deterministically within the configured range, avoiding
/// registry-assigned ports and, in CI mode, lease-claimed ports.
pub struct PortAllocator {
    range: PortRange,
    occupied: BTreeSet<u16>,
    ci_lease: Option<CiPortLease>,
}

impl PortAllocator {
    pub fn new(range: PortRange, occupied: BTreeSet<u16>) -> Self {
        Self {
            range,
            occupied,
            ci_lease: None,
        }
    }

    /// Enable CI mode with the given lease.
    pub fn with_ci_lease(mut self, lease: CiPortLease) -> Self {
        self.ci_lease = Some(lease);
        self
    }

    pub fn ci_lease(&self) -> Option<&CiPortLease> {
        self.ci_lease.as_ref()
    }

    /// Persist the CI lease, if CI mode is active. Called once per invocation.
    pub fn save_ci_lease(&self) -> Result<()> {
        match &self.ci_lease {
            Some(lease) => lease.save(),
            None => Ok(()),
        }
    }

    /// Assign a port for (cwd, command).
    ///
    /// An explicit port overrides the deterministic preference but is still
    /// validated against the range. `reassigned` reports whether the caller
    /// got something other than what was requested or preferred.
    pub fn assign(
        &mut self,
        cwd: &Path,
        command: &str,
        explicit: Option<u32>,
    ) -> Result<PortAssignment> {
        let start = match explicit {
            Some(port) => {
                if port > u32::from(u16::MAX) || !self.range.contains(port as u16) {
                    return Err(Error::PortOutOfRange {
                        port,
                        min: self.range.min,
                        max: self.range.max,
                    });
                }
                port as u16
            }
            None => preferred_port(cwd, command, self.range),
        };

        let port = if self.ci_lease.is_some() {
            self.assign_ci(start)?
        } else {
            self.assign_direct(start)?
        };

        Ok(PortAssignment {
            port,
            reassigned: port != start,
        })
    }

    /// Walk upward from `start`, wrapping at the top of the range, skipping
    /// lease-claimed and registry-assigned ports, until one binds.
    fn assign_ci(&mut self, start: u16) -> Result<u16> {
        let mut candidate = start;
        for _ in 0..self.range.span() {
            let lease = self.ci_lease.as_ref().expect("ci mode");
            if !lease.contains(candidate)
                && !self.occupied.contains(&candidate)
                && is_available(candidate)?
            {
                self.ci_lease.as_mut().expect("ci mode").track(candidate);
                return Ok(candidate);
            }
            candidate = self.next(candidate);
        }
        Err(Error::NoPortAvailable {
            min: self.range.min,
            max: self.range.max,
        })
    }

    /// Probe `start` directly; on conflict, search upward with wraparound.
    fn assign_direct(&mut self, start: u16) -> Result<u16> {
        let mut candidate = start;
        for _ in 0..self.range.span() {
            if !self.occupied.contains(&candidate) && is_available(candidate)? {
                return Ok(candidate);
            }
            debug!(
                "Port {} unavailable{}, trying next",
                candidate,
                process_using_port(candidate)
            );
            candidate = self.next(candidate);
        }
        Err(Error::NoPortAvailable {
            min: self.range.min,
            max: self.range.max,
        })
    }

    fn next(&self, port: u16) -> u16 {
        if port >= self.range.max {
            self.range.min
        } else {
            port + 1
        }
    }
}
