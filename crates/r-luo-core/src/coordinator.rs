//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
//! Reload state machine: scan, plan, validate, apply, confirm, roll back.
//!
//! One reload applies at a time per process. Scheduled scans that find the
//! apply lock taken return [`ReloadError::Busy`]; operator and remote requests
//! wait for it.

use std::collections::{BTreeMap, HashMap};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use parking_lot::Mutex;
use r_luo_cluster::ClusterEvent;
use r_luo_common::Generation;
use r_luo_metrics::ReloadMetrics;
use r_luo_persistence::{BackupId, SignalChannel, SyncSignal, WorkerSyncState};
use r_luo_registry::{
    ContractError, Fingerprint, ModuleDescriptor, ModuleRegistry, RegistryError,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::backup::BackupStore;
use crate::detector::{ChangeDetector, ChangeEvent, ScanScope, Trigger};
use crate::error::ReloadError;
use crate::health::HealthAndAuditLog;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Idle,
    Scanning,
    Planning,
    Validating,
    Applying,
    Confirming,
    RollingBack,
}

/// Where a reload request came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Signal,
    Cluster,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReloadRequest {
    pub scope: ScanScope,
    /// Reload every module in scope whether or not its source changed.
    pub force: bool,
    pub trigger: Trigger,
    pub origin: Origin,
    /// Generation to commit; allocated locally when `None`. A target more
    /// than one past the current generation widens the reload to every module.
    pub generation: Option<Generation>,
    /// Changes already detected by the caller.
    pub changes: Vec<ChangeEvent>,
}

impl ReloadRequest {
    /// Scan `scope` and reload whatever changed.
    pub fn scan(scope: ScanScope, trigger: Trigger) -> Self {
        Self {
            scope,
            force: false,
            trigger,
            origin: Origin::Local,
            generation: None,
            changes: Vec::new(),
        }
    }

    /// Operator reload of `scope` regardless of detected changes.
    pub fn forced(scope: ScanScope) -> Self {
        Self {
            force: true,
            ..Self::scan(scope, Trigger::Manual)
        }
    }

    /// Reload the modules named by changes the caller already detected.
    pub fn detected(changes: Vec<ChangeEvent>, trigger: Trigger) -> Self {
        let names = changes.iter().map(|c| c.module_name.clone()).collect();
        Self {
            force: true,
            changes,
            ..Self::scan(ScanScope::Modules(names), trigger)
        }
    }

    /// Converge on a sibling's signal. `scope` is everything when generations were skipped.
    pub fn from_signal(signal: &SyncSignal, scope: ScanScope) -> Self {
        Self {
            scope,
            force: true,
            trigger: Trigger::Scheduled,
            origin: Origin::Signal,
            generation: Some(signal.generation),
            changes: Vec::new(),
        }
    }

    /// Apply a peer's event. Every module is reloaded when the event skips
    /// generations this process never saw.
    pub fn from_cluster(event: &ClusterEvent) -> Self {
        Self {
            scope: ScanScope::Modules(event.module_list.clone()),
            force: true,
            trigger: Trigger::Scheduled,
            origin: Origin::Cluster,
            generation: Some(event.generation),
            changes: Vec::new(),
        }
    }

    pub fn with_generation(mut self, generation: Generation) -> Self {
        self.generation = Some(generation);
        self
    }

    fn label(&self) -> &'static str {
        match self.origin {
            Origin::Local => self.trigger.as_str(),
            Origin::Signal => "signal",
            Origin::Cluster => "cluster",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ModuleStatus {
    Applied { fingerprint: Fingerprint },
    ValidationFailed { error: String },
    ApplyFailed { error: String, rolled_back: bool },
    /// A dependency failed; this module keeps its prior implementation.
    Blocked { by: String },
}

impl ModuleStatus {
    fn label(&self) -> &'static str {
        match self {
            ModuleStatus::Applied { .. } => "applied",
            ModuleStatus::ValidationFailed { .. } => "validation_failed",
            ModuleStatus::ApplyFailed { .. } => "apply_failed",
            ModuleStatus::Blocked { .. } => "blocked",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleOutcome {
    pub module: String,
    #[serde(flatten)]
    pub status: ModuleStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReloadResult {
    pub generation: Generation,
    pub committed: bool,
    /// The request carried a generation this process already reached.
    pub stale: bool,
    /// Another node holds the driver lock and will publish this change.
    pub deferred: bool,
    pub origin: Origin,
    pub trigger: Trigger,
    pub changes: Vec<ChangeEvent>,
    pub outcomes: Vec<ModuleOutcome>,
}

impl ReloadResult {
    pub(crate) fn noop(generation: Generation, request: &ReloadRequest) -> Self {
        Self {
            generation,
            committed: false,
            stale: false,
            deferred: false,
            origin: request.origin,
            trigger: request.trigger,
            changes: request.changes.clone(),
            outcomes: Vec::new(),
        }
    }

    /// Names of the modules that were swapped in, in apply order.
    pub fn applied(&self) -> Vec<String> {
        self.outcomes
            .iter()
            .filter(|o| matches!(o.status, ModuleStatus::Applied { .. }))
            .map(|o| o.module.clone())
            .collect()
    }

    pub fn outcome(&self, module: &str) -> Option<&ModuleStatus> {
        self.outcomes
            .iter()
            .find(|o| o.module == module)
            .map(|o| &o.status)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RollbackReport {
    pub module: String,
    pub generation: Generation,
    pub fingerprint: Fingerprint,
    /// `None` when the known-good revision was used.
    pub backup_id: Option<BackupId>,
}

struct PhaseGuard<'a>(&'a Mutex<Phase>);

impl<'a> PhaseGuard<'a> {
    fn enter(cell: &'a Mutex<Phase>, phase: Phase) -> Self {
        *cell.lock() = phase;
        Self(cell)
    }

    fn set(&self, phase: Phase) {
        *self.0.lock() = phase;
    }
}

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.lock() = Phase::Idle;
    }
}

/// Run a contract call, turning panics into ordinary failures.
fn guarded<T>(call: impl FnOnce() -> Result<T, ContractError>) -> Result<T, String> {
    match catch_unwind(AssertUnwindSafe(call)) {
        Ok(Ok(value)) => Ok(value),
        Ok(Err(err)) => Err(err.to_string()),
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_owned());
            Err(format!("panicked: {message}"))
        }
    }
}

fn blocked_by(descriptor: &ModuleDescriptor, failed: &HashMap<String, String>) -> Option<String> {
    descriptor
        .dependency_names
        .iter()
        .find_map(|dependency| failed.get(dependency).cloned())
}

pub struct ReloadCoordinator {
    process_id: String,
    registry: Arc<ModuleRegistry>,
    detector: Arc<ChangeDetector>,
    backups: Arc<BackupStore>,
    health: Arc<HealthAndAuditLog>,
    signal: Option<Arc<dyn SignalChannel>>,
    metrics: Option<ReloadMetrics>,
    apply_lock: tokio::sync::Mutex<()>,
    phase: Mutex<Phase>,
    generation: AtomicU64,
}

impl std::fmt::Debug for ReloadCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReloadCoordinator")
            .field("process_id", &self.process_id)
            .field("phase", &self.phase())
            .field("generation", &self.generation())
            .finish_non_exhaustive()
    }
}

impl ReloadCoordinator {
    pub fn new(
        process_id: impl Into<String>,
        registry: Arc<ModuleRegistry>,
        detector: Arc<ChangeDetector>,
        backups: Arc<BackupStore>,
        health: Arc<HealthAndAuditLog>,
    ) -> Self {
        Self {
            process_id: process_id.into(),
            registry,
            detector,
            backups,
            health,
            signal: None,
            metrics: None,
            apply_lock: tokio::sync::Mutex::new(()),
            phase: Mutex::new(Phase::Idle),
            generation: AtomicU64::new(0),
        }
    }

    /// Publish committed generations to sibling processes through `channel`.
    pub fn with_signal(mut self, channel: Arc<dyn SignalChannel>) -> Self {
        self.signal = Some(channel);
        self
    }

    pub fn with_metrics(mut self, metrics: ReloadMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn process_id(&self) -> &str {
        &self.process_id
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    /// Highest generation this process has committed.
    pub fn generation(&self) -> Generation {
        self.generation.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<ModuleRegistry> {
        &self.registry
    }

    pub fn detector(&self) -> &Arc<ChangeDetector> {
        &self.detector
    }

    pub fn health(&self) -> &Arc<HealthAndAuditLog> {
        &self.health
    }

    pub fn signal_channel(&self) -> Option<&Arc<dyn SignalChannel>> {
        self.signal.as_ref()
    }

    fn latest_signal(&self) -> Option<SyncSignal> {
        let channel = self.signal.as_ref()?;
        match channel.latest() {
            Ok(signal) => signal,
            Err(err) => {
                debug!(error = %err, "sync signal unreadable");
                None
            }
        }
    }

    /// Lowest generation a new local commit may use: above both this process
    /// and the host's current signal.
    pub fn generation_floor(&self) -> Generation {
        let signalled = self.latest_signal().map(|s| s.generation).unwrap_or(0);
        self.generation().max(signalled)
    }

    async fn acquire(&self, busy_fails: bool) -> Result<tokio::sync::MutexGuard<'_, ()>, ReloadError> {
        if busy_fails {
            self.apply_lock.try_lock().map_err(|_| ReloadError::Busy)
        } else {
            Ok(self.apply_lock.lock().await)
        }
    }

    /// Detect changes without applying them.
    pub async fn scan(
        &self,
        scope: &ScanScope,
        trigger: Trigger,
    ) -> Result<Vec<ChangeEvent>, ReloadError> {
        let _apply = self.acquire(trigger == Trigger::Scheduled).await?;
        let _phase = PhaseGuard::enter(&self.phase, Phase::Scanning);
        self.detector.scan(scope, trigger)
    }

    pub async fn trigger_reload(&self, request: ReloadRequest) -> Result<ReloadResult, ReloadError> {
        let _apply = self
            .acquire(request.trigger == Trigger::Scheduled && request.origin == Origin::Local)
            .await?;
        if let Some(metrics) = &self.metrics {
            metrics.record_attempt(request.label());
        }
        let phase = PhaseGuard::enter(&self.phase, Phase::Scanning);

        let current = self.generation();
        if let Some(target) = request.generation {
            if target <= current {
                debug!(target, current, origin = ?request.origin, "ignoring stale reload request");
                return Ok(ReloadResult {
                    stale: true,
                    ..ReloadResult::noop(current, &request)
                });
            }
        }

        let mut changes = request.changes.clone();
        let names = self.select_modules(&request, &mut changes)?;
        let target = request
            .generation
            .unwrap_or_else(|| self.generation_floor() + 1);

        if names.is_empty() {
            if request.origin == Origin::Local {
                return Ok(ReloadResult {
                    changes,
                    ..ReloadResult::noop(current, &request)
                });
            }
            self.commit(target, &[], request.origin);
            return Ok(ReloadResult {
                generation: target,
                committed: true,
                changes,
                ..ReloadResult::noop(target, &request)
            });
        }

        phase.set(Phase::Planning);
        let plan = self.registry.dependency_order(&names).map_err(|err| {
            let err = ReloadError::from(err);
            self.health.record_error(&err, Some(target));
            err
        })?;
        info!(
            generation = target,
            origin = ?request.origin,
            plan = ?plan.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "reload planned"
        );

        let mut outcomes: BTreeMap<usize, ModuleOutcome> = BTreeMap::new();
        let mut failed: HashMap<String, String> = HashMap::new();

        phase.set(Phase::Validating);
        let mut ready = Vec::with_capacity(plan.len());
        for (index, descriptor) in plan.iter().enumerate() {
            if let Some(root) = blocked_by(descriptor, &failed) {
                failed.insert(descriptor.name.clone(), root.clone());
                outcomes.insert(index, self.outcome(descriptor, ModuleStatus::Blocked { by: root }));
                continue;
            }
            match guarded(|| descriptor.contract.validate()) {
                Ok(()) => ready.push((index, descriptor)),
                Err(reason) => {
                    let err = ReloadError::Validation {
                        module: descriptor.name.clone(),
                        reason: reason.clone(),
                    };
                    self.fail(descriptor, &err, target);
                    failed.insert(descriptor.name.clone(), descriptor.name.clone());
                    outcomes.insert(
                        index,
                        self.outcome(descriptor, ModuleStatus::ValidationFailed { error: reason }),
                    );
                }
            }
        }

        phase.set(Phase::Applying);
        let mut applied = Vec::new();
        for (index, descriptor) in ready {
            if let Some(root) = blocked_by(descriptor, &failed) {
                failed.insert(descriptor.name.clone(), root.clone());
                outcomes.insert(index, self.outcome(descriptor, ModuleStatus::Blocked { by: root }));
                continue;
            }
            let status = self.apply(descriptor, target, &phase);
            match &status {
                ModuleStatus::Applied { .. } => applied.push(descriptor.name.clone()),
                _ => {
                    failed.insert(descriptor.name.clone(), descriptor.name.clone());
                }
            }
            outcomes.insert(index, self.outcome(descriptor, status));
        }

        phase.set(Phase::Confirming);
        let committed = !applied.is_empty() || request.origin != Origin::Local;
        if committed {
            self.commit(target, &applied, request.origin);
        }
        Ok(ReloadResult {
            generation: if committed { target } else { current },
            committed,
            stale: false,
            deferred: false,
            origin: request.origin,
            trigger: request.trigger,
            changes,
            outcomes: outcomes.into_values().collect(),
        })
    }

    fn select_modules(
        &self,
        request: &ReloadRequest,
        changes: &mut Vec<ChangeEvent>,
    ) -> Result<Vec<String>, ReloadError> {
        let mut names: Vec<String> = if request.force {
            match &request.scope {
                ScanScope::All => self.registry.names(),
                ScanScope::Kind(kind) => self
                    .registry
                    .list()
                    .into_iter()
                    .filter(|d| d.kind == *kind)
                    .map(|d| d.name.clone())
                    .collect(),
                ScanScope::Modules(requested) if request.origin == Origin::Local => {
                    for name in requested {
                        if !self.registry.contains(name) {
                            return Err(RegistryError::UnknownModule(name.clone()).into());
                        }
                    }
                    requested.clone()
                }
                // siblings and peers may host modules this process does not
                ScanScope::Modules(requested) => requested
                    .iter()
                    .filter(|name| {
                        let known = self.registry.contains(name);
                        if !known {
                            debug!(module = %name, "remote reload names an unregistered module");
                        }
                        known
                    })
                    .cloned()
                    .collect(),
            }
        } else {
            let detected = self.detector.scan(&request.scope, request.trigger)?;
            let names = detected.iter().map(|e| e.module_name.clone()).collect();
            changes.extend(detected);
            names
        };

        // a generation minted elsewhere was never seen here; converge on everything
        if let Some(target) = request.generation {
            let current = self.generation();
            if target > current + 1 && (request.origin != Origin::Local || !names.is_empty()) {
                debug!(target, current, origin = ?request.origin, "generations skipped; reloading every module");
                names.extend(self.registry.names());
            }
        }

        // catch up on a sibling generation before committing past it
        if request.origin == Origin::Local && !names.is_empty() {
            if let Some(signal) = self.latest_signal() {
                let current = self.generation();
                if signal.generation > current {
                    let missed: Vec<String> = if signal.generation > current + 1 {
                        self.registry.names()
                    } else {
                        signal.module_list.clone()
                    };
                    names.extend(missed.into_iter().filter(|name| self.registry.contains(name)));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        names.retain(|name| seen.insert(name.clone()));
        Ok(names)
    }

    fn apply(&self, descriptor: &ModuleDescriptor, target: Generation, phase: &PhaseGuard<'_>) -> ModuleStatus {
        let name = descriptor.name.as_str();
        let backup_id = match self.backups.snapshot(name) {
            Ok(id) => id,
            Err(err) => {
                let err = ReloadError::Apply {
                    module: name.to_owned(),
                    reason: format!("pre-apply backup failed: {err}"),
                };
                self.fail(descriptor, &err, target);
                return ModuleStatus::ApplyFailed {
                    error: err.to_string(),
                    rolled_back: false,
                };
            }
        };

        let started = Instant::now();
        let result = guarded(|| descriptor.contract.reload());
        if let Some(metrics) = &self.metrics {
            metrics.observe_apply(name, started.elapsed().as_secs_f64());
        }

        match result {
            Ok(fingerprint) => {
                if let Err(err) =
                    self.registry
                        .record_reload(name, fingerprint.clone(), target, Utc::now())
                {
                    warn!(module = name, error = %err, "module vanished while applying");
                }
                self.detector.acknowledge(name, fingerprint.clone());
                self.backups.settle(name);
                info!(module = name, generation = target, fingerprint = %fingerprint, "module reloaded");
                ModuleStatus::Applied { fingerprint }
            }
            Err(reason) => {
                phase.set(Phase::RollingBack);
                let rolled_back = self.backups.restore(name, &backup_id);
                if rolled_back {
                    self.backups.discard(name, &backup_id);
                    if let Some(metrics) = &self.metrics {
                        metrics.inc_rollback();
                    }
                }
                phase.set(Phase::Applying);
                let err = ReloadError::Apply {
                    module: name.to_owned(),
                    reason: reason.clone(),
                };
                self.fail(descriptor, &err, target);
                ModuleStatus::ApplyFailed {
                    error: reason,
                    rolled_back,
                }
            }
        }
    }

    fn fail(&self, descriptor: &ModuleDescriptor, err: &ReloadError, generation: Generation) {
        self.health.record_error(err, Some(generation));
        if let Err(registry_err) = self.registry.record_failure(&descriptor.name, err.to_string()) {
            warn!(module = %descriptor.name, error = %registry_err, "failed to record module error");
        }
    }

    fn outcome(&self, descriptor: &ModuleDescriptor, status: ModuleStatus) -> ModuleOutcome {
        if let Some(metrics) = &self.metrics {
            metrics.record_outcome(&descriptor.name, status.label());
        }
        ModuleOutcome {
            module: descriptor.name.clone(),
            status,
        }
    }

    fn commit(&self, generation: Generation, applied: &[String], origin: Origin) {
        self.generation.fetch_max(generation, Ordering::SeqCst);
        if let Some(metrics) = &self.metrics {
            metrics.set_generation(self.generation());
        }
        self.health.record_event(
            "reload_committed",
            None,
            Some(generation),
            format!("{origin:?} reload applied [{}]", applied.join(", ")),
        );
        if origin != Origin::Signal && !applied.is_empty() {
            self.publish_signal(generation, applied);
        }
        self.report_worker();
    }

    fn publish_signal(&self, generation: Generation, applied: &[String]) {
        let Some(channel) = &self.signal else {
            return;
        };
        if let Some(current) = self.latest_signal() {
            if current.generation >= generation {
                return;
            }
        }
        let signal = SyncSignal {
            generation,
            timestamp: Utc::now(),
            module_list: applied.to_vec(),
            origin_process_id: self.process_id.clone(),
        };
        match channel.publish(&signal) {
            Ok(()) => debug!(generation, "sync signal published"),
            Err(err) => {
                let err = ReloadError::sync("process", err);
                self.health.record_error(&err, Some(generation));
                if let Some(metrics) = &self.metrics {
                    metrics.record_sync_failure("process");
                }
            }
        }
    }

    /// Write this process's generation to the worker ledger.
    pub fn report_worker(&self) {
        let Some(channel) = &self.signal else {
            return;
        };
        let state = WorkerSyncState {
            process_id: self.process_id.clone(),
            generation: self.generation(),
            updated_at: Utc::now(),
        };
        if let Err(err) = channel.record_worker(&state) {
            debug!(error = %err, "failed to record worker generation");
        }
    }

    /// Restore `name` to an earlier revision without minting a generation.
    pub async fn rollback(
        &self,
        name: &str,
        to_generation: Option<Generation>,
    ) -> Result<RollbackReport, ReloadError> {
        let _apply = self.acquire(false).await?;
        let _phase = PhaseGuard::enter(&self.phase, Phase::RollingBack);
        let descriptor = self
            .registry
            .get(name)
            .ok_or_else(|| ReloadError::from(RegistryError::UnknownModule(name.to_owned())))?;

        let point = self.backups.resolve(name, to_generation).map_err(|err| {
            self.health.record_error(&err, to_generation);
            err
        })?;
        if let Err(reason) = guarded(|| descriptor.contract.validate_state(&point.state)) {
            let err = ReloadError::Validation {
                module: name.to_owned(),
                reason,
            };
            self.fail(&descriptor, &err, point.generation);
            return Err(err);
        }
        if let Err(reason) = guarded(|| descriptor.contract.restore(&point.state)) {
            let err = ReloadError::Apply {
                module: name.to_owned(),
                reason,
            };
            self.fail(&descriptor, &err, point.generation);
            return Err(err);
        }

        self.registry
            .record_restore(name, point.state.fingerprint.clone(), point.generation)?;
        self.detector.reset(name);
        if let Some(metrics) = &self.metrics {
            metrics.inc_rollback();
        }
        let source = point
            .backup_id
            .as_ref()
            .map(|id| id.to_string())
            .unwrap_or_else(|| "known-good revision".to_owned());
        self.health.record_event(
            "rollback",
            Some(name),
            Some(point.generation),
            format!("restored {} from {source}", point.state.fingerprint),
        );
        info!(module = name, generation = point.generation, source = %source, "module rolled back");

        Ok(RollbackReport {
            module: name.to_owned(),
            generation: point.generation,
            fingerprint: point.state.fingerprint,
            backup_id: point.backup_id,
        })
    }
}
