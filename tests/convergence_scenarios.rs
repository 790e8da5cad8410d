//! ---
//! luo_section: "15-testing-qa-runbook"
//! luo_subsection: "integration-tests"
//! luo_type: "source"
//! luo_scope: "test"
//! luo_description: "Sibling-process and cluster convergence scenarios."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
mod support;

use std::sync::Arc;
use std::time::Duration;

use r_luo_cluster::{ClusterEvent, ClusterMessage, CoordinationService, LoopbackCoordinator};
use r_luo_common::{AppConfig, ModuleKind};
use r_luo_core::{LiveUpdateOrchestrator, LiveUpdateService};
use r_luo_persistence::{MemorySignalChannel, SignalChannel};
use r_luo_registry::{FileModule, ReloadContract};

const POLL: Duration = Duration::from_millis(150);

fn sibling_config(dir: &std::path::Path, process: &str) -> AppConfig {
    let mut config = support::config(dir, process);
    config.node.node_id = "host-1".to_owned();
    config.sync.enabled = true;
    config.sync.poll_interval = POLL;
    config
}

fn start_sibling(
    config: AppConfig,
    process: &str,
    rules: Arc<FileModule>,
    channel: Arc<MemorySignalChannel>,
) -> LiveUpdateService {
    LiveUpdateOrchestrator::new(
        config,
        support::registry_with(vec![("rules", ModuleKind::Rule, rules)]),
    )
    .process_id(process)
    .signal_channel(channel)
    .scheduled_scans(false)
    .start()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sibling_follows_driver_without_detecting() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let channel = Arc::new(MemorySignalChannel::new());
    let rules_a = support::json_module(&path, r#"{"rev": 0}"#);
    let rules_b = Arc::new(FileModule::open(&path, r_luo_common::ModuleFormat::Json).unwrap());

    let a = start_sibling(
        sibling_config(dir.path(), "worker-a"),
        "worker-a",
        rules_a.clone(),
        channel.clone(),
    );
    let b = start_sibling(
        sibling_config(dir.path(), "worker-b"),
        "worker-b",
        rules_b.clone(),
        channel.clone(),
    );

    for rev in 1..=3 {
        support::write(&path, &format!(r#"{{"rev": {rev}, "pad": "{}"}}"#, "x".repeat(rev)));
        let result = a.check(None).await.unwrap();
        assert!(result.committed);
    }
    assert_eq!(a.generation(), 3);
    assert_eq!(channel.latest().unwrap().unwrap().generation, 3);

    tokio::time::sleep(POLL * 2).await;
    let report = b.worker_sync().unwrap();
    let worker_b = report
        .workers
        .iter()
        .find(|w| w.process_id == "worker-b")
        .expect("worker-b reported");
    assert_eq!(worker_b.generation, 3);
    assert_eq!(b.generation(), 3);
    assert_eq!(rules_b.current_fingerprint(), rules_a.current_fingerprint());
    assert_eq!(b.detector().detection_count(), 0);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_signal_delivery_applies_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let channel = Arc::new(MemorySignalChannel::new());
    let rules_a = support::json_module(&path, r#"{"rev": 0}"#);
    let rules_b = Arc::new(FileModule::open(&path, r_luo_common::ModuleFormat::Json).unwrap());
    let a = start_sibling(
        sibling_config(dir.path(), "worker-a"),
        "worker-a",
        rules_a,
        channel.clone(),
    );
    let b = start_sibling(
        sibling_config(dir.path(), "worker-b"),
        "worker-b",
        rules_b,
        channel.clone(),
    );

    support::write(&path, r#"{"rev": 1, "note": "first"}"#);
    a.check(None).await.unwrap();
    b.sync_now().await.unwrap();
    let reloads = b.registry().get("rules").unwrap().reload_count;
    assert_eq!(reloads, 1);

    a.trigger_all_workers().unwrap();
    assert!(b.sync_now().await.unwrap().is_none());
    assert_eq!(b.registry().get("rules").unwrap().reload_count, reloads);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn reload_all_applies_only_changed_modules_and_reaches_siblings() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let channel = Arc::new(MemorySignalChannel::new());
    let rules_a = support::json_module(&path, r#"{"rev": 0}"#);
    let rules_b = Arc::new(FileModule::open(&path, r_luo_common::ModuleFormat::Json).unwrap());
    let a = start_sibling(
        sibling_config(dir.path(), "worker-a"),
        "worker-a",
        rules_a,
        channel.clone(),
    );
    let b = start_sibling(
        sibling_config(dir.path(), "worker-b"),
        "worker-b",
        rules_b.clone(),
        channel.clone(),
    );

    let unchanged = a.reload_all().await.unwrap();
    assert!(!unchanged.committed);
    assert!(unchanged.outcomes.is_empty());
    assert_eq!(a.registry().get("rules").unwrap().reload_count, 0);
    assert_eq!(channel.latest().unwrap().unwrap().generation, 0);

    support::write(&path, r#"{"rev": 1, "note": "changed"}"#);
    let changed = a.reload_all().await.unwrap();
    assert!(changed.committed);
    assert_eq!(changed.applied(), vec!["rules".to_owned()]);
    b.sync_now().await.unwrap();
    assert_eq!(b.generation(), 1);
    assert_eq!(rules_b.document().value["rev"], 1);

    a.shutdown().await;
    b.shutdown().await;
}

fn node_config(dir: &std::path::Path, node: &str) -> AppConfig {
    let mut config = support::config(dir, node);
    config.cluster.enabled = true;
    config.cluster.expected_peers = 1;
    config.cluster.ack_timeout = Duration::from_secs(2);
    config.cluster.lock_timeout = Duration::from_millis(300);
    config.cluster.lock_ttl = Duration::from_secs(5);
    config.cluster.resubscribe_interval = Duration::from_millis(50);
    config
}

fn start_node(
    config: AppConfig,
    modules: Vec<(&str, ModuleKind, Arc<FileModule>)>,
    backend: Arc<LoopbackCoordinator>,
) -> LiveUpdateService {
    LiveUpdateOrchestrator::new(config, support::registry_with(modules))
    .coordination(backend)
    .scheduled_scans(false)
    .start()
    .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn cluster_peers_converge_and_report_outage() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("rules.json");
    let backend = Arc::new(LoopbackCoordinator::new());
    let rules_a = support::json_module(&path, r#"{"rev": 0}"#);
    let rules_b = Arc::new(FileModule::open(&path, r_luo_common::ModuleFormat::Json).unwrap());
    let a = start_node(
        node_config(dir.path(), "node-a"),
        vec![("rules", ModuleKind::Rule, rules_a)],
        backend.clone(),
    );
    let b = start_node(
        node_config(dir.path(), "node-b"),
        vec![("rules", ModuleKind::Rule, rules_b.clone())],
        backend.clone(),
    );
    tokio::time::sleep(Duration::from_millis(100)).await;

    for rev in 1..=5 {
        support::write(&path, &format!(r#"{{"rev": {rev}, "pad": "{}"}}"#, "y".repeat(rev)));
        let result = a.reload("rules").await.unwrap();
        assert_eq!(result.generation, rev as u64);
    }
    assert!(
        support::wait_until(Duration::from_secs(2), || b.generation() == 5).await,
        "node-b stuck at generation {}",
        b.generation()
    );
    assert_eq!(b.status().modules[0].generation, 5);
    assert_eq!(rules_b.document().value["rev"], 5);

    backend.set_available(false);
    support::write(&path, r#"{"rev": 6, "pad": "outage"}"#);
    let result = a.reload("rules").await.unwrap();
    assert!(result.committed);
    assert_eq!(a.generation(), 6);

    assert!(
        support::wait_until(Duration::from_secs(2), || {
            b.health().count("sync_propagation_error") >= 1
        })
        .await
    );
    assert!(a.health().count("sync_propagation_error") >= 1);
    assert_eq!(b.generation(), 5);
    assert!(a.status().cluster_degraded);
    assert!(b.status().cluster_degraded);

    a.shutdown().await;
    b.shutdown().await;
}

struct Pair {
    rules: Arc<FileModule>,
    pricing: Arc<FileModule>,
}

fn open_pair(rules: &std::path::Path, pricing: &std::path::Path) -> Pair {
    let open = |path: &std::path::Path| {
        Arc::new(FileModule::open(path, r_luo_common::ModuleFormat::Json).unwrap())
    };
    Pair {
        rules: open(rules),
        pricing: open(pricing),
    }
}

fn start_pair_node(
    dir: &std::path::Path,
    node: &str,
    pair: &Pair,
    backend: Arc<LoopbackCoordinator>,
) -> LiveUpdateService {
    start_node(
        node_config(dir, node),
        vec![
            ("pricing", ModuleKind::Config, pair.pricing.clone()),
            ("rules", ModuleKind::Rule, pair.rules.clone()),
        ],
        backend,
    )
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn contended_lock_still_draws_a_unique_cluster_generation() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.json");
    let pricing_path = dir.path().join("pricing.json");
    support::write(&rules_path, r#"{"rev": 0}"#);
    support::write(&pricing_path, r#"{"p": 0}"#);
    let backend = Arc::new(LoopbackCoordinator::new());
    let on_a = open_pair(&rules_path, &pricing_path);
    let on_b = open_pair(&rules_path, &pricing_path);
    let a = start_pair_node(dir.path(), "node-a", &on_a, backend.clone());
    let b = start_pair_node(dir.path(), "node-b", &on_b, backend.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    // a third node takes the driver lock and mints generation 1 for a rules change
    let lock_name = node_config(dir.path(), "node-c").cluster.lock_name;
    let topic = node_config(dir.path(), "node-c").cluster.topic;
    let lease = backend
        .acquire_lock(&lock_name, "node-c", Duration::from_secs(30))
        .await
        .unwrap()
        .expect("lock free");
    let held = backend.allocate_generation(0).await.unwrap();
    assert_eq!(held, 1);
    support::write(&rules_path, r#"{"rev": 1, "from": "node-c"}"#);

    support::write(&pricing_path, r#"{"p": 1}"#);
    let result = a.reload("pricing").await.unwrap();
    assert!(result.committed);
    assert_eq!(result.generation, 2);
    assert_eq!(a.health().count("lock_timeout_error"), 1);
    assert_eq!(on_a.rules.document().value["rev"], 1);
    assert_eq!(on_a.pricing.document().value["p"], 1);

    assert!(
        support::wait_until(Duration::from_secs(2), || b.generation() == 2).await,
        "node-b stuck at generation {}",
        b.generation()
    );
    assert_eq!(on_b.rules.document().value["rev"], 1);
    assert_eq!(on_b.pricing.document().value["p"], 1);

    // node-c's event is now behind both nodes and must not regress them
    backend
        .publish(
            &topic,
            ClusterMessage::Event(ClusterEvent {
                generation: held,
                timestamp: chrono::Utc::now(),
                module_list: vec!["rules".to_owned()],
                origin_node_id: "node-c".to_owned(),
            }),
        )
        .await
        .unwrap();
    backend.release_lock(&lease).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(a.generation(), 2);
    assert_eq!(b.generation(), 2);

    a.shutdown().await;
    b.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn peer_catches_up_on_changes_committed_during_an_outage() {
    let dir = tempfile::tempdir().unwrap();
    let rules_path = dir.path().join("rules.json");
    let pricing_path = dir.path().join("pricing.json");
    support::write(&rules_path, r#"{"rev": 0}"#);
    support::write(&pricing_path, r#"{"p": 0}"#);
    let backend = Arc::new(LoopbackCoordinator::new());
    let on_a = open_pair(&rules_path, &pricing_path);
    let on_b = open_pair(&rules_path, &pricing_path);
    let a = start_pair_node(dir.path(), "node-a", &on_a, backend.clone());
    let b = start_pair_node(dir.path(), "node-b", &on_b, backend.clone());
    tokio::time::sleep(Duration::from_millis(100)).await;

    backend.set_available(false);
    support::write(&rules_path, r#"{"rev": 1, "during": "outage"}"#);
    let local = a.reload("rules").await.unwrap();
    assert!(local.committed);
    assert_eq!(local.generation, 1);
    assert_eq!(b.generation(), 0);
    assert!(support::wait_until(Duration::from_secs(2), || b.status().cluster_degraded).await);

    backend.set_available(true);
    assert!(
        support::wait_until(Duration::from_secs(2), || {
            !a.status().cluster_degraded && !b.status().cluster_degraded
        })
        .await,
        "nodes never resubscribed"
    );

    support::write(&pricing_path, r#"{"p": 1}"#);
    let result = a.reload("pricing").await.unwrap();
    assert_eq!(result.generation, 2);
    assert_eq!(result.applied(), vec!["pricing".to_owned()]);

    assert!(
        support::wait_until(Duration::from_secs(2), || b.generation() == 2).await,
        "node-b stuck at generation {}",
        b.generation()
    );
    assert_eq!(on_b.pricing.document().value["p"], 1);
    assert_eq!(on_b.rules.document().value["rev"], 1);

    a.shutdown().await;
    b.shutdown().await;
}
