//! Lifecycle integration tests for the direct-spawn backend. These run real
//! child processes.

mod common;

use common::*;
use devserve_processes::{ProcessBackend, ProcessStatus, ShutdownSweep, tree};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::test(flavor = "multi_thread")]
async fn start_describe_delete_round_trip() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("sleeper", "sleep 30");

        ctx.backend.start(&spec).await.expect("start failed");
        let info = ctx.backend.describe(&spec.handle).await.unwrap();
        assert_eq!(info.status, ProcessStatus::Online);
        let pid = info.pid.expect("online process has a pid");
        assert!(tree::is_alive(pid));

        ctx.backend.delete(&spec.handle).await.expect("delete failed");
        let info = ctx.backend.describe(&spec.handle).await.unwrap();
        assert_eq!(info.status, ProcessStatus::Unknown);
        assert_eq!(info.pid, None);
        assert!(!tree::is_alive(pid));
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn clean_exit_reports_stopped() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("oneshot", "true");
        ctx.backend.start(&spec).await.unwrap();

        let info = wait_for_status(&ctx.backend, &spec.handle, Duration::from_secs(5), |s| {
            s == ProcessStatus::Stopped
        })
        .await;
        assert_eq!(info.pid, None);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn failing_exit_reports_errored() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("failing", "exit 3");
        ctx.backend.start(&spec).await.unwrap();

        wait_for_status(&ctx.backend, &spec.handle, Duration::from_secs(5), |s| {
            s == ProcessStatus::Errored
        })
        .await;
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_keeps_the_record() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("stoppable", "sleep 30");
        ctx.backend.start(&spec).await.unwrap();

        ctx.backend.stop(&spec.handle).await.unwrap();
        let info = wait_for_status(&ctx.backend, &spec.handle, Duration::from_secs(10), |s| {
            s != ProcessStatus::Online
        })
        .await;
        // Record survives a stop, unlike a delete.
        assert_ne!(info.status, ProcessStatus::Unknown);
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn restart_spawns_a_new_pid() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("restarting", "sleep 30");
        ctx.backend.start(&spec).await.unwrap();
        let first = ctx.backend.describe(&spec.handle).await.unwrap();

        ctx.backend.restart(&spec.handle).await.unwrap();
        let second = ctx.backend.describe(&spec.handle).await.unwrap();
        assert_eq!(second.status, ProcessStatus::Online);
        assert_ne!(second.pid, first.pid);
        assert_eq!(second.restart_count, 1);

        ctx.backend.delete(&spec.handle).await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn delete_kills_the_whole_tree() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let marker = ctx.temp_dir.path().join("grandchild.pid");
        // A child that spawns its own long-running child and records its PID.
        let command = format!("sleep 30 & echo $! > {} && wait", marker.display());
        let spec = ctx.spec("tree", &command);
        ctx.backend.start(&spec).await.unwrap();

        let grandchild = {
            let start = std::time::Instant::now();
            loop {
                if let Ok(contents) = std::fs::read_to_string(&marker) {
                    if let Ok(pid) = contents.trim().parse::<u32>() {
                        break pid;
                    }
                }
                assert!(start.elapsed() < Duration::from_secs(5), "grandchild never appeared");
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        assert!(tree::is_alive(grandchild));

        ctx.backend.delete(&spec.handle).await.unwrap();
        assert!(!tree::is_alive(grandchild), "grandchild survived the kill");
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn output_is_captured_and_flushable() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("chatty", "echo hello-from-the-server; sleep 30");
        ctx.backend.start(&spec).await.unwrap();

        let info = ctx.backend.describe(&spec.handle).await.unwrap();
        let out_log = info.out_log.expect("spawned process has an out log");

        let start = std::time::Instant::now();
        loop {
            let contents = std::fs::read_to_string(&out_log).unwrap_or_default();
            if contents.contains("hello-from-the-server") {
                break;
            }
            assert!(start.elapsed() < Duration::from_secs(5), "log line never arrived");
            tokio::time::sleep(Duration::from_millis(50)).await;
        }

        ctx.backend.flush(Some(&spec.handle)).await.unwrap();
        let contents = std::fs::read_to_string(&out_log).unwrap();
        assert!(contents.is_empty());

        ctx.backend.delete(&spec.handle).await.unwrap();
    })
    .await
    .unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn sweep_kills_tracked_children() {
    timeout(TEST_TIMEOUT, async {
        let ctx = TestContext::new();
        let spec = ctx.spec("doomed", "sleep 30");
        ctx.backend.start(&spec).await.unwrap();
        let pid = ctx
            .backend
            .describe(&spec.handle)
            .await
            .unwrap()
            .pid
            .unwrap();

        let sweep = ShutdownSweep::new(Arc::clone(&ctx.children));
        tokio::task::spawn_blocking(move || sweep.sweep())
            .await
            .unwrap();
        assert!(!tree::is_alive(pid));
    })
    .await
    .unwrap();
}
