//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_luo_cluster::{
    ClusterEvent, ClusterSynchronizer, CoordinationError, CoordinationService, DriverDecision,
    LoopbackCoordinator, RemoteApplier,
};
use r_luo_common::time::duration_to_millis;
use r_luo_common::{AppConfig, ClusterBackend, Generation, ModuleKind};
use r_luo_metrics::{new_registry, ReloadMetrics, SharedRegistry};
use r_luo_persistence::{
    BackupArchive, FileSignalChannel, PersistenceMetrics, SignalChannel, SyncSignal,
    WorkerSyncState,
};
use r_luo_registry::{Fingerprint, ModuleRegistry};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::broadcaster::ProcessSyncBroadcaster;
use crate::coordinator::{
    Phase, ReloadCoordinator, ReloadRequest, ReloadResult, RollbackReport,
};
use crate::detector::{ChangeDetector, ScanScope, Trigger};
use crate::error::ReloadError;
use crate::health::{AuditRecord, HealthAndAuditLog};

/// Per-module view served by the status surface.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleStatusView {
    pub name: String,
    pub kind: ModuleKind,
    pub fingerprint: Fingerprint,
    pub generation: Generation,
    pub last_reload_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reload_count: u64,
    pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub node_id: String,
    pub process_id: String,
    pub phase: Phase,
    pub generation: Generation,
    pub sync_enabled: bool,
    pub cluster_enabled: bool,
    pub cluster_degraded: bool,
    pub modules: Vec<ModuleStatusView>,
    pub failure_counts: BTreeMap<String, u64>,
    pub recent_failures: Vec<AuditRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleVersion {
    pub name: String,
    pub fingerprint: Fingerprint,
    pub generation: Generation,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSyncReport {
    pub process_id: String,
    pub generation: Generation,
    pub signal: Option<SyncSignal>,
    pub workers: Vec<WorkerSyncState>,
}

/// Wires the reload pipeline from configuration and starts its background loops.
pub struct LiveUpdateOrchestrator {
    config: AppConfig,
    registry: Arc<ModuleRegistry>,
    process_id: Option<String>,
    signal: Option<Arc<dyn SignalChannel>>,
    coordination: Option<Arc<dyn CoordinationService>>,
    metrics_registry: Option<SharedRegistry>,
    scheduled_scans: bool,
}

impl LiveUpdateOrchestrator {
    pub fn new(config: AppConfig, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            config,
            registry,
            process_id: None,
            signal: None,
            coordination: None,
            metrics_registry: None,
            scheduled_scans: true,
        }
    }

    pub fn process_id(mut self, process_id: impl Into<String>) -> Self {
        self.process_id = Some(process_id.into());
        self
    }

    /// Use `channel` instead of the file channel named in the sync config.
    pub fn signal_channel(mut self, channel: Arc<dyn SignalChannel>) -> Self {
        self.signal = Some(channel);
        self
    }

    /// Use `backend` instead of the one named in the cluster config.
    pub fn coordination(mut self, backend: Arc<dyn CoordinationService>) -> Self {
        self.coordination = Some(backend);
        self
    }

    pub fn metrics_registry(mut self, registry: SharedRegistry) -> Self {
        self.metrics_registry = Some(registry);
        self
    }

    /// Disable the per-kind detector loops; reloads then happen only on request
    /// or through sibling and cluster propagation.
    pub fn scheduled_scans(mut self, enabled: bool) -> Self {
        self.scheduled_scans = enabled;
        self
    }

    /// Build the pipeline and spawn its tasks. Must run inside a tokio runtime.
    pub fn start(self) -> Result<LiveUpdateService> {
        let config = self.config;
        let process_id = self.process_id.unwrap_or_else(|| config.process_id());
        let metrics_registry = self.metrics_registry.unwrap_or_else(new_registry);

        let reload_metrics = ReloadMetrics::new(metrics_registry.clone())
            .context("failed to register reload metrics")?;
        let persistence_metrics = PersistenceMetrics::new(metrics_registry.clone())
            .context("failed to register persistence metrics")?;

        let health = Arc::new(
            HealthAndAuditLog::open(&config.audit)
                .with_context(|| {
                    format!("failed to open audit log in {}", config.audit.directory.display())
                })?
                .with_metrics(persistence_metrics.clone()),
        );
        let detector = Arc::new(ChangeDetector::new(Arc::clone(&self.registry)));
        let backups = Arc::new(
            BackupStore::new(
                BackupArchive::from_config(&config.backup),
                Arc::clone(&self.registry),
            )
            .with_metrics(persistence_metrics),
        );

        let signal: Option<Arc<dyn SignalChannel>> = match (config.sync.enabled, self.signal) {
            (false, _) => None,
            (true, Some(channel)) => Some(channel),
            (true, None) => Some(Arc::new(FileSignalChannel::from_config(&config.sync))),
        };

        let mut coordinator = ReloadCoordinator::new(
            process_id.clone(),
            Arc::clone(&self.registry),
            Arc::clone(&detector),
            Arc::clone(&backups),
            Arc::clone(&health),
        )
        .with_metrics(reload_metrics.clone());
        if let Some(channel) = &signal {
            coordinator = coordinator.with_signal(Arc::clone(channel));
        }
        let coordinator = Arc::new(coordinator);

        let broadcaster = signal.map(|channel| {
            Arc::new(
                ProcessSyncBroadcaster::new(
                    channel,
                    Arc::clone(&coordinator),
                    Arc::clone(&health),
                    config.sync.poll_interval,
                )
                .with_metrics(reload_metrics.clone()),
            )
        });

        let cluster = if config.cluster.enabled {
            let backend: Arc<dyn CoordinationService> = match self.coordination {
                Some(backend) => backend,
                None => match config.cluster.backend {
                    ClusterBackend::Loopback => Arc::new(LoopbackCoordinator::new()),
                },
            };
            Some(Arc::new(ClusterSynchronizer::new(
                config.node.node_id.clone(),
                config.cluster.clone(),
                backend,
            )))
        } else {
            None
        };

        let inner = Arc::new(ServiceInner {
            node_id: config.node.node_id.clone(),
            process_id,
            lock_name: config.cluster.lock_name.clone(),
            lock_timeout: config.cluster.lock_timeout,
            registry: self.registry,
            coordinator,
            health,
            broadcaster,
            cluster,
            metrics: reload_metrics,
            metrics_registry,
        });

        let (shutdown, _) = broadcast::channel(4);
        let mut tasks = Vec::new();
        if self.scheduled_scans {
            for kind in ModuleKind::ALL {
                if inner.registry.list().iter().any(|d| d.kind == kind) {
                    let period = config.detector.interval_for(kind);
                    tasks.push(tokio::spawn(detector_loop(
                        Arc::clone(&inner),
                        kind,
                        period,
                        shutdown.subscribe(),
                    )));
                }
            }
        }
        if let Some(broadcaster) = &inner.broadcaster {
            tasks.push(tokio::spawn(
                Arc::clone(broadcaster).run(shutdown.subscribe()),
            ));
        }
        if let Some(cluster) = &inner.cluster {
            let applier: Arc<dyn RemoteApplier> = Arc::new(ClusterApplier {
                inner: Arc::clone(&inner),
            });
            tasks.push(tokio::spawn(
                Arc::clone(cluster).run_listener(applier, shutdown.subscribe()),
            ));
        }

        info!(
            node = %inner.node_id,
            process = %inner.process_id,
            modules = inner.registry.len(),
            tasks = tasks.len(),
            sync = inner.broadcaster.is_some(),
            cluster = inner.cluster.is_some(),
            "live update orchestrator started"
        );

        Ok(LiveUpdateService {
            inner,
            shutdown,
            tasks: Mutex::new(tasks),
        })
    }
}

struct ServiceInner {
    node_id: String,
    process_id: String,
    lock_name: String,
    lock_timeout: Duration,
    registry: Arc<ModuleRegistry>,
    coordinator: Arc<ReloadCoordinator>,
    health: Arc<HealthAndAuditLog>,
    broadcaster: Option<Arc<ProcessSyncBroadcaster>>,
    cluster: Option<Arc<ClusterSynchronizer>>,
    metrics: ReloadMetrics,
    metrics_registry: SharedRegistry,
}

impl ServiceInner {
    async fn scan_and_reload(
        &self,
        scope: ScanScope,
        trigger: Trigger,
    ) -> Result<ReloadResult, ReloadError> {
        let changes = self.coordinator.scan(&scope, trigger).await?;
        if changes.is_empty() {
            return Ok(ReloadResult::noop(
                self.coordinator.generation(),
                &ReloadRequest::scan(scope, trigger),
            ));
        }
        self.drive(ReloadRequest::detected(changes, trigger)).await
    }

    /// Run a local request, leading the cluster when one is configured.
    async fn drive(&self, request: ReloadRequest) -> Result<ReloadResult, ReloadError> {
        let Some(cluster) = &self.cluster else {
            return self.coordinator.trigger_reload(request).await;
        };

        match cluster.acquire_driver().await {
            DriverDecision::Leader(lease) => {
                let request = self.cluster_generation(cluster, request).await;
                let result = self.coordinator.trigger_reload(request).await;
                if let Ok(result) = &result {
                    self.replicate(cluster, result).await;
                }
                cluster.release(&lease).await;
                result
            }
            DriverDecision::Deferred => {
                let err = ReloadError::LockTimeout {
                    lock: self.lock_name.clone(),
                    timeout_ms: duration_to_millis(self.lock_timeout),
                };
                self.health.record_error(&err, None);
                if request.trigger == Trigger::Scheduled {
                    // the lock holder publishes this change; re-detect if it never arrives
                    for change in &request.changes {
                        self.coordinator.detector().invalidate(&change.module_name);
                    }
                    return Ok(ReloadResult {
                        deferred: true,
                        ..ReloadResult::noop(self.coordinator.generation(), &request)
                    });
                }
                let request = self.cluster_generation(cluster, request).await;
                let result = self.coordinator.trigger_reload(request).await?;
                self.replicate(cluster, &result).await;
                Ok(result)
            }
            DriverDecision::Degraded(_) => {
                let result = self.coordinator.trigger_reload(request).await?;
                self.replicate(cluster, &result).await;
                Ok(result)
            }
        }
    }

    /// Draw the commit generation from the cluster counter so it never
    /// collides with one another node allocated.
    async fn cluster_generation(
        &self,
        cluster: &ClusterSynchronizer,
        request: ReloadRequest,
    ) -> ReloadRequest {
        match cluster
            .allocate_generation(self.coordinator.generation_floor())
            .await
        {
            Ok(generation) => request.with_generation(generation),
            Err(err) => {
                warn!(error = %err, "cluster generation unavailable; allocating locally");
                request
            }
        }
    }

    async fn replicate(&self, cluster: &ClusterSynchronizer, result: &ReloadResult) {
        let applied = result.applied();
        if !result.committed || applied.is_empty() {
            return;
        }
        let event = ClusterEvent {
            generation: result.generation,
            timestamp: Utc::now(),
            module_list: applied,
            origin_node_id: self.node_id.clone(),
        };
        match cluster.publish(event).await {
            Ok(summary) if summary.timed_out => {
                warn!(
                    generation = result.generation,
                    expected = summary.expected,
                    received = summary.received.len(),
                    "not every peer acknowledged the reload"
                );
            }
            Ok(_) => debug!(generation = result.generation, "reload replicated to cluster"),
            Err(err) => {
                let err = ReloadError::sync("cluster", err);
                self.health.record_error(&err, Some(result.generation));
                self.metrics.record_sync_failure("cluster");
            }
        }
    }
}

struct ClusterApplier {
    inner: Arc<ServiceInner>,
}

#[async_trait]
impl RemoteApplier for ClusterApplier {
    fn known_generation(&self) -> Generation {
        self.inner.coordinator.generation()
    }

    async fn apply_remote(&self, event: ClusterEvent) {
        match self
            .inner
            .coordinator
            .trigger_reload(ReloadRequest::from_cluster(&event))
            .await
        {
            Ok(result) => debug!(
                generation = result.generation,
                applied = ?result.applied(),
                "remote reload applied"
            ),
            Err(err) => {
                warn!(generation = event.generation, error = %err, "remote reload failed");
                self.inner.health.record_error(&err, Some(event.generation));
            }
        }
    }

    fn on_propagation_failure(&self, error: &CoordinationError) {
        let err = ReloadError::sync("cluster", error);
        self.inner.health.record_error(&err, None);
        self.inner.metrics.record_sync_failure("cluster");
    }
}

async fn detector_loop(
    inner: Arc<ServiceInner>,
    kind: ModuleKind,
    period: Duration,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut ticker = interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    debug!(kind = %kind, period_ms = duration_to_millis(period), "detector loop started");
    loop {
        tokio::select! {
            _ = shutdown.recv() => {
                debug!(kind = %kind, "detector loop stopping");
                break;
            }
            _ = ticker.tick() => {
                // pick up sibling generations first so a local commit never skips one
                if let Some(broadcaster) = &inner.broadcaster {
                    if let Err(err) = broadcaster.poll_once().await {
                        debug!(error = %err, "sync poll before scan failed");
                    }
                }
                match inner.scan_and_reload(ScanScope::Kind(kind), Trigger::Scheduled).await {
                    Ok(result) if !result.outcomes.is_empty() => debug!(
                        kind = %kind,
                        generation = result.generation,
                        committed = result.committed,
                        "scheduled reload finished"
                    ),
                    Ok(_) => {}
                    Err(ReloadError::Busy) => debug!(kind = %kind, "apply in progress; scan skipped"),
                    Err(err) => warn!(kind = %kind, error = %err, "scheduled scan failed"),
                }
            }
        }
    }
}

/// Running orchestrator. Every operator operation goes through this handle.
pub struct LiveUpdateService {
    inner: Arc<ServiceInner>,
    shutdown: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl std::fmt::Debug for LiveUpdateService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveUpdateService")
            .field("node_id", &self.inner.node_id)
            .field("process_id", &self.inner.process_id)
            .field("generation", &self.inner.coordinator.generation())
            .finish_non_exhaustive()
    }
}

impl LiveUpdateService {
    pub fn coordinator(&self) -> &Arc<ReloadCoordinator> {
        &self.inner.coordinator
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.inner.registry
    }

    pub fn health(&self) -> &Arc<HealthAndAuditLog> {
        &self.inner.health
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        self.inner.coordinator.detector()
    }

    pub fn broadcaster(&self) -> Option<&Arc<ProcessSyncBroadcaster>> {
        self.inner.broadcaster.as_ref()
    }

    pub fn metrics_registry(&self) -> SharedRegistry {
        self.inner.metrics_registry.clone()
    }

    pub fn generation(&self) -> Generation {
        self.inner.coordinator.generation()
    }

    pub fn status(&self) -> StatusReport {
        let modules = self
            .inner
            .registry
            .list()
            .into_iter()
            .map(|d| ModuleStatusView {
                name: d.name.clone(),
                kind: d.kind,
                fingerprint: d.fingerprint.clone(),
                generation: d.generation,
                last_reload_time: d.last_reload_time,
                last_error: d.last_error.clone(),
                reload_count: d.reload_count,
                depends_on: d.dependency_names.clone(),
            })
            .collect();
        StatusReport {
            node_id: self.inner.node_id.clone(),
            process_id: self.inner.process_id.clone(),
            phase: self.inner.coordinator.phase(),
            generation: self.inner.coordinator.generation(),
            sync_enabled: self.inner.broadcaster.is_some(),
            cluster_enabled: self.inner.cluster.is_some(),
            cluster_degraded: self
                .inner
                .cluster
                .as_ref()
                .map(|c| c.is_degraded())
                .unwrap_or(false),
            modules,
            failure_counts: self.inner.health.failure_counts(),
            recent_failures: self.inner.health.recent_failures(),
        }
    }

    /// Immediate scan of one module or of everything, reloading what changed.
    pub async fn check(&self, module: Option<&str>) -> Result<ReloadResult, ReloadError> {
        let scope = match module {
            Some(name) => ScanScope::Modules(vec![name.to_owned()]),
            None => ScanScope::All,
        };
        self.inner.scan_and_reload(scope, Trigger::Manual).await
    }

    pub fn versions(&self) -> Vec<ModuleVersion> {
        self.inner
            .registry
            .list()
            .into_iter()
            .map(|d| ModuleVersion {
                name: d.name.clone(),
                fingerprint: d.fingerprint.clone(),
                generation: d.generation,
            })
            .collect()
    }

    /// Forced reload of one module and its dependents.
    pub async fn reload(&self, name: &str) -> Result<ReloadResult, ReloadError> {
        self.inner
            .drive(ReloadRequest::forced(ScanScope::Modules(vec![name.to_owned()])))
            .await
    }

    /// Full scan-and-reload of every module, fanned out to the other workers
    /// on this host. Without a commit the current signal is rewritten so
    /// siblings still re-evaluate it.
    pub async fn reload_all(&self) -> Result<ReloadResult, ReloadError> {
        let result = self
            .inner
            .scan_and_reload(ScanScope::All, Trigger::Manual)
            .await?;
        if !result.committed {
            if let Some(broadcaster) = &self.inner.broadcaster {
                if let Err(err) = broadcaster.rebroadcast() {
                    warn!(error = %err, "failed to fan reload-all out to sibling workers");
                }
            }
        }
        Ok(result)
    }

    pub async fn rollback(
        &self,
        name: &str,
        to_generation: Option<Generation>,
    ) -> Result<RollbackReport, ReloadError> {
        self.inner.coordinator.rollback(name, to_generation).await
    }

    pub fn worker_sync(&self) -> Result<WorkerSyncReport, ReloadError> {
        let generation = self.inner.coordinator.generation();
        let (signal, workers) = match self.inner.coordinator.signal_channel() {
            Some(channel) => {
                let signal = channel
                    .latest()
                    .map_err(|err| ReloadError::sync("process", err))?;
                let workers = channel
                    .workers()
                    .map_err(|err| ReloadError::sync("process", err))?;
                (signal, workers)
            }
            None => (
                None,
                vec![WorkerSyncState {
                    process_id: self.inner.process_id.clone(),
                    generation,
                    updated_at: Utc::now(),
                }],
            ),
        };
        Ok(WorkerSyncReport {
            process_id: self.inner.process_id.clone(),
            generation,
            signal,
            workers,
        })
    }

    /// Rewrite the sync signal so every worker on this host re-evaluates it.
    pub fn trigger_all_workers(&self) -> Result<SyncSignal, ReloadError> {
        match &self.inner.broadcaster {
            Some(broadcaster) => broadcaster.rebroadcast(),
            None => Err(ReloadError::sync("process", "process sync is disabled")),
        }
    }

    /// Poll the sync signal now instead of waiting for the next tick.
    pub async fn sync_now(&self) -> Result<Option<ReloadResult>, ReloadError> {
        match &self.inner.broadcaster {
            Some(broadcaster) => broadcaster.poll_once().await,
            None => Ok(None),
        }
    }

    /// Stop background loops and wait for them to exit.
    pub async fn shutdown(&self) {
        let _ = self.shutdown.send(());
        let tasks = std::mem::take(&mut *self.tasks.lock());
        for task in tasks {
            if let Err(err) = task.await {
                warn!(error = %err, "orchestrator task ended abnormally");
            }
        }
        info!(process = %self.inner.process_id, "live update orchestrator stopped");
    }
}
