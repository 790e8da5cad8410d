//! ---
//! luo_section: "15-testing-qa-runbook"
//! luo_subsection: "integration-tests"
//! luo_type: "source"
//! luo_scope: "test"
//! luo_description: "Shared fixtures for the scenario suites."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
#![allow(dead_code)]

use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use r_luo_common::{AppConfig, ModuleFormat, ModuleKind};
use r_luo_registry::{FileModule, ModuleRegistry, ModuleSpec};
use tokio::time::{sleep, Instant};

/// Isolated configuration rooted at `dir`: no sync, no cluster.
pub fn config(dir: &Path, node_id: &str) -> AppConfig {
    let mut config = AppConfig::default();
    config.node.node_id = node_id.to_owned();
    config.backup.directory = dir.join("backups").join(node_id);
    config.audit.directory = dir.join("audit").join(node_id);
    config.sync.enabled = false;
    config.sync.signal_path = dir.join("sync").join("signal.json");
    config.sync.worker_dir = dir.join("sync").join("workers");
    config.cluster.enabled = false;
    config
}

pub fn write(path: &Path, contents: &str) {
    fs::write(path, contents).expect("write module source");
}

pub fn json_module(path: &Path, contents: &str) -> Arc<FileModule> {
    write(path, contents);
    Arc::new(FileModule::open(path, ModuleFormat::Json).expect("open module source"))
}

pub fn registry_with(modules: Vec<(&str, ModuleKind, Arc<FileModule>)>) -> Arc<ModuleRegistry> {
    let registry = Arc::new(ModuleRegistry::new());
    for (name, kind, module) in modules {
        registry
            .register(ModuleSpec::new(name, kind, module))
            .expect("register module");
    }
    registry
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        sleep(Duration::from_millis(10)).await;
    }
}
