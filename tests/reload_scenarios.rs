//! ---
//! luo_section: "15-testing-qa-runbook"
//! luo_subsection: "integration-tests"
//! luo_type: "source"
//! luo_scope: "test"
//! luo_description: "Single-process reload, rollback, and registration scenarios."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
mod support;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use parking_lot::{Mutex, RwLock};
use r_luo_common::ModuleKind;
use r_luo_core::{LiveUpdateOrchestrator, ModuleStatus, ReloadError};
use r_luo_persistence::BackupArchive;
use r_luo_registry::{
    fingerprint_bytes, ContractError, Fingerprint, ModuleRegistry, ModuleSpec, ModuleState,
    RegistryError, ReloadContract, SwapModule,
};
use serde_json::json;

/// Module whose reload step fails after validation passed while `broken` is set.
struct Brittle {
    active: RwLock<String>,
    source: Mutex<String>,
    broken: AtomicBool,
}

impl Brittle {
    fn new(content: &str) -> Self {
        Self {
            active: RwLock::new(content.to_owned()),
            source: Mutex::new(content.to_owned()),
            broken: AtomicBool::new(true),
        }
    }
}

impl ReloadContract for Brittle {
    fn current_fingerprint(&self) -> Fingerprint {
        fingerprint_bytes(self.active.read().as_bytes())
    }

    fn source_fingerprint(&self) -> Result<Fingerprint, ContractError> {
        Ok(fingerprint_bytes(self.source.lock().as_bytes()))
    }

    fn reload(&self) -> Result<Fingerprint, ContractError> {
        if self.broken.load(Ordering::SeqCst) {
            *self.active.write() = "half-built".to_owned();
            return Err(ContractError::load("constructor raised an exception"));
        }
        let next = self.source.lock().clone();
        *self.active.write() = next.clone();
        Ok(fingerprint_bytes(next.as_bytes()))
    }

    fn capture(&self) -> Result<ModuleState, ContractError> {
        let active = self.active.read().clone();
        Ok(ModuleState::new(
            fingerprint_bytes(active.as_bytes()),
            json!(active),
        ))
    }

    fn restore(&self, state: &ModuleState) -> Result<(), ContractError> {
        let content = state
            .payload
            .as_str()
            .ok_or_else(|| ContractError::Restore("payload is not a string".to_owned()))?;
        *self.active.write() = content.to_owned();
        Ok(())
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn changed_rules_are_applied_and_previous_revision_backed_up() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let rules = support::json_module(&path, r#"{"version": "v1"}"#);
    let v1 = rules.current_fingerprint();
    let registry = support::registry_with(vec![("rules", ModuleKind::Rule, rules.clone())]);
    let config = support::config(dir.path(), "node-a");
    let service = LiveUpdateOrchestrator::new(config.clone(), registry)
        .process_id("worker-1")
        .scheduled_scans(false)
        .start()
        .unwrap();

    support::write(&path, r#"{"version": "v2", "strict": true}"#);
    let result = service.check(None).await.unwrap();
    assert!(result.committed);
    assert_eq!(result.applied(), vec!["rules".to_owned()]);
    assert_eq!(result.changes[0].old_fingerprint, v1);

    let status = service.status();
    assert_eq!(status.generation, 1);
    assert_eq!(status.modules[0].generation, 1);
    assert_eq!(status.modules[0].fingerprint, rules.current_fingerprint());
    assert_eq!(rules.document().value["version"], "v2");

    let archive = BackupArchive::from_config(&config.backup);
    let latest = archive.latest("rules").unwrap().unwrap();
    let record = archive.load("rules", &latest.id).unwrap();
    assert_eq!(record.fingerprint, v1);
    assert_eq!(record.generation, 0);

    let again = service.check(Some("rules")).await.unwrap();
    assert!(!again.committed);
    assert!(again.outcomes.is_empty());

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn throwing_reload_rolls_back_only_that_module() {
    let dir = tempfile::tempdir().unwrap();
    let limits_path = dir.path().join("limits.json");
    let limits = support::json_module(&limits_path, r#"{"max": 1}"#);
    let brittle = Arc::new(Brittle::new("rules v1"));
    let registry = Arc::new(ModuleRegistry::new());
    registry
        .register(ModuleSpec::new("rules", ModuleKind::Rule, brittle.clone()))
        .unwrap();
    registry
        .register(ModuleSpec::new("limits", ModuleKind::Config, limits.clone()))
        .unwrap();
    let before = brittle.current_fingerprint();

    let service = LiveUpdateOrchestrator::new(support::config(dir.path(), "node-a"), registry)
        .scheduled_scans(false)
        .start()
        .unwrap();

    *brittle.source.lock() = "rules v2".to_owned();
    let result = service.reload("rules").await.unwrap();
    assert!(!result.committed);
    assert!(matches!(
        result.outcome("rules"),
        Some(ModuleStatus::ApplyFailed { rolled_back: true, .. })
    ));
    let status = service.status();
    let rules = status.modules.iter().find(|m| m.name == "rules").unwrap();
    assert_eq!(rules.fingerprint, before);
    assert!(rules.last_error.is_some());
    assert_eq!(brittle.current_fingerprint(), before);
    assert_eq!(service.health().count("apply_error"), 1);
    assert_eq!(status.failure_counts.get("apply_error"), Some(&1));

    support::write(&limits_path, r#"{"max": 25}"#);
    let result = service.reload_all().await.unwrap();
    assert!(result.committed);
    assert_eq!(result.applied(), vec!["limits".to_owned()]);
    assert_eq!(limits.document().value["max"], 25);
    assert_eq!(brittle.current_fingerprint(), before);

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_restores_a_named_generation() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let rules = support::json_module(&path, r#"{"version": "v1"}"#);
    let registry = support::registry_with(vec![("rules", ModuleKind::Rule, rules.clone())]);
    let service = LiveUpdateOrchestrator::new(support::config(dir.path(), "node-a"), registry)
        .scheduled_scans(false)
        .start()
        .unwrap();

    support::write(&path, r#"{"version": "v2"}"#);
    service.reload("rules").await.unwrap();
    let v2 = rules.current_fingerprint();
    support::write(&path, r#"{"version": "v3", "extra": 1}"#);
    service.reload("rules").await.unwrap();
    assert_eq!(service.generation(), 2);

    let report = service.rollback("rules", Some(1)).await.unwrap();
    assert_eq!(report.generation, 1);
    assert_eq!(report.fingerprint, v2);
    assert!(report.backup_id.is_some());
    assert_eq!(rules.document().value["version"], "v2");
    assert_eq!(service.generation(), 2);
    assert_eq!(service.health().count("rollback"), 1);

    let missing = service.rollback("rules", Some(9)).await.unwrap_err();
    assert!(matches!(missing, ReloadError::Persistence(_)));

    service.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rollback_after_a_failed_reload_returns_to_the_prior_revision() {
    let dir = tempfile::tempdir().unwrap();
    let rules = Arc::new(Brittle::new("rules v1"));
    rules.broken.store(false, Ordering::SeqCst);
    let v1 = rules.current_fingerprint();
    let registry = Arc::new(ModuleRegistry::new());
    registry
        .register(ModuleSpec::new("rules", ModuleKind::Rule, rules.clone()))
        .unwrap();
    let config = support::config(dir.path(), "node-a");
    let service = LiveUpdateOrchestrator::new(config.clone(), registry)
        .scheduled_scans(false)
        .start()
        .unwrap();

    *rules.source.lock() = "rules v2".to_owned();
    assert!(service.reload("rules").await.unwrap().committed);
    let v2 = rules.current_fingerprint();
    assert_ne!(v1, v2);

    rules.broken.store(true, Ordering::SeqCst);
    *rules.source.lock() = "rules v3".to_owned();
    let failed = service.reload("rules").await.unwrap();
    assert!(matches!(
        failed.outcome("rules"),
        Some(ModuleStatus::ApplyFailed { rolled_back: true, .. })
    ));
    assert_eq!(rules.current_fingerprint(), v2);
    let archive = BackupArchive::from_config(&config.backup);
    assert_eq!(archive.list("rules").unwrap().len(), 1);

    let report = service.rollback("rules", None).await.unwrap();
    assert_eq!(report.fingerprint, v1);
    assert_eq!(report.generation, 0);
    assert_eq!(rules.current_fingerprint(), v1);
    assert_eq!(service.status().modules[0].fingerprint, v1);

    service.shutdown().await;
}

#[test]
fn dependency_cycle_is_rejected_and_nothing_registered() {
    let registry = ModuleRegistry::new();
    let a = SwapModule::new(1u32, || Ok(1u32));
    let b = SwapModule::new(2u32, || Ok(2u32));
    let err = registry
        .register_all(vec![
            ModuleSpec::new("a", ModuleKind::Config, Arc::new(a)).depends_on(["b"]),
            ModuleSpec::new("b", ModuleKind::Config, Arc::new(b)).depends_on(["a"]),
        ])
        .unwrap_err();
    assert!(matches!(err, RegistryError::Cycle(_)));
    assert!(registry.is_empty());
    assert_eq!(ReloadError::from(err).kind(), "cycle_error");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn readers_never_observe_a_partial_document() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("pair.json");
    let pair = support::json_module(&path, r#"{"a": 0, "b": 0}"#);
    let registry = support::registry_with(vec![("pair", ModuleKind::Config, pair.clone())]);
    let service = LiveUpdateOrchestrator::new(support::config(dir.path(), "node-a"), registry)
        .scheduled_scans(false)
        .start()
        .unwrap();

    let stop = Arc::new(AtomicBool::new(false));
    let readers: Vec<_> = (0..4)
        .map(|_| {
            let cell = pair.cell();
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let mut reads = 0u64;
                while !stop.load(Ordering::Relaxed) {
                    let document = cell.load();
                    assert_eq!(document.value["a"], document.value["b"]);
                    assert_eq!(document.fingerprint, fingerprint_bytes(document.raw.as_bytes()));
                    reads += 1;
                }
                reads
            })
        })
        .collect();

    for round in 1..=20 {
        support::write(&path, &format!(r#"{{"a": {round}, "b": {round}}}"#));
        service.reload("pair").await.unwrap();
    }
    stop.store(true, Ordering::Relaxed);
    for reader in readers {
        assert!(reader.join().unwrap() > 0);
    }
    assert_eq!(pair.document().value["a"], 20);
    assert_eq!(service.generation(), 20);

    service.shutdown().await;
}
