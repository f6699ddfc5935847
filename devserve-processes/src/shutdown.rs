//! One-shot teardown of spawned children on process exit.
//!
//! The spawn backend's children must not outlive the invocation: interrupt,
//! terminate and hangup signals, panics, and normal exit all funnel into one
//! synchronous sweep that kills every still-tracked child. An atomic guard
//! ensures the sweep runs at most once even when several triggers fire
//! concurrently.

use nix::sys::signal::{self as nix_signal, SaFlags, SigAction, SigHandler, SigSet, Signal};
use nix::unistd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, info};

use crate::spawn::ChildRegistry;
use crate::tree::{self, KILL_GRACE};

pub struct ShutdownSweep {
    registry: Arc<ChildRegistry>,
    swept: AtomicBool,
}

impl ShutdownSweep {
    pub fn new(registry: Arc<ChildRegistry>) -> Arc<Self> {
        Arc::new(Self {
            registry,
            swept: AtomicBool::new(false),
        })
    }

    /// Kill every still-tracked child. Runs at most once; later calls are
    /// no-ops. Synchronous so it can run from signal and panic paths.
    pub fn sweep(&self) {
        if self.swept.swap(true, Ordering::SeqCst) {
            return;
        }
        let pids = self.registry.live_pids();
        if pids.is_empty() {
            return;
        }
        info!("Sweeping {} spawned process(es) before exit", pids.len());
        for pid in pids {
            tree::kill_tree(pid, KILL_GRACE);
        }
    }

    /// Install handlers for SIGINT/SIGTERM/SIGHUP that sweep once and then
    /// re-raise the signal with its default handler so the exit code is
    /// correct.
    pub fn install_signals(self: &Arc<Self>) {
        let sweep = Arc::clone(self);
        tokio::spawn(async move {
            let mut sigint = signal(SignalKind::interrupt()).expect("install SIGINT handler");
            let mut sigterm = signal(SignalKind::terminate()).expect("install SIGTERM handler");
            let mut sighup = signal(SignalKind::hangup()).expect("install SIGHUP handler");

            let received = tokio::select! {
                _ = sigint.recv() => Signal::SIGINT,
                _ = sigterm.recv() => Signal::SIGTERM,
                _ = sighup.recv() => Signal::SIGHUP,
            };
            info!("Received {:?}, cleaning up spawned processes...", received);
            sweep.sweep();
            exit_with_signal(received);
        });
    }

    /// Chain the sweep into the panic hook so uncaught faults also clean up.
    pub fn install_panic_hook(self: &Arc<Self>) {
        let sweep = Arc::clone(self);
        let previous = std::panic::take_hook();
        std::panic::set_hook(Box::new(move |info| {
            sweep.sweep();
            previous(info);
        }));
    }
}

/// Restore the default handler for `sig` and re-raise it to terminate with
/// the conventional exit status.
fn exit_with_signal(sig: Signal) -> ! {
    let action = SigAction::new(SigHandler::SigDfl, SaFlags::empty(), SigSet::empty());
    unsafe {
        if nix_signal::sigaction(sig, &action).is_ok() {
            let _ = nix_signal::kill(unistd::getpid(), sig);
        }
    }
    debug!("Signal re-raise did not terminate, exiting directly");
    std::process::exit(1);
}
