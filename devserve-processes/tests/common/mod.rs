//! Shared test utilities for devserve-processes integration tests.

// Each test file compiles separately, so not all helpers are used in each binary
#![allow(dead_code)]

use devserve_processes::{ChildRegistry, ProcessBackend, SpawnBackend, StartSpec, handle_for};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

/// Test context owning a temp state directory and a spawn backend.
pub struct TestContext {
    pub temp_dir: TempDir,
    pub children: Arc<ChildRegistry>,
    pub backend: SpawnBackend,
}

impl TestContext {
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp dir");
        let children = ChildRegistry::new();
        let backend = SpawnBackend::new(temp_dir.path(), Arc::clone(&children))
            .expect("Failed to create spawn backend");
        Self {
            temp_dir,
            children,
            backend,
        }
    }

    pub fn spec(&self, name: &str, command: &str) -> StartSpec {
        StartSpec {
            handle: handle_for(name),
            command: command.to_string(),
            cwd: self.temp_dir.path().to_path_buf(),
            env: BTreeMap::new(),
        }
    }
}

/// Poll `describe` until the predicate holds or the deadline passes.
pub async fn wait_for_status(
    backend: &SpawnBackend,
    handle: &str,
    deadline: Duration,
    predicate: impl Fn(devserve_processes::ProcessStatus) -> bool,
) -> devserve_processes::ProcessInfo {
    let start = std::time::Instant::now();
    loop {
        let info = backend.describe(handle).await.expect("describe failed");
        if predicate(info.status) {
            return info;
        }
        if start.elapsed() > deadline {
            panic!("timed out waiting for status change, last was {}", info.status);
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
}
