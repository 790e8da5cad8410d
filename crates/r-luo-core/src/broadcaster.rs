//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use r_luo_metrics::ReloadMetrics;
use r_luo_persistence::{SignalChannel, SyncSignal, WorkerSyncState};
use tokio::sync::broadcast;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::{debug, info};

use crate::coordinator::{ReloadCoordinator, ReloadRequest, ReloadResult};
use crate::detector::ScanScope;
use crate::error::ReloadError;
use crate::health::HealthAndAuditLog;

/// Keeps sibling worker processes on one host converged on the latest signal.
pub struct ProcessSyncBroadcaster {
    channel: Arc<dyn SignalChannel>,
    coordinator: Arc<ReloadCoordinator>,
    health: Arc<HealthAndAuditLog>,
    metrics: Option<ReloadMetrics>,
    poll_interval: Duration,
    unreachable: AtomicBool,
}

impl std::fmt::Debug for ProcessSyncBroadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProcessSyncBroadcaster")
            .field("process_id", &self.coordinator.process_id())
            .field("poll_interval", &self.poll_interval)
            .finish_non_exhaustive()
    }
}

impl ProcessSyncBroadcaster {
    pub fn new(
        channel: Arc<dyn SignalChannel>,
        coordinator: Arc<ReloadCoordinator>,
        health: Arc<HealthAndAuditLog>,
        poll_interval: Duration,
    ) -> Self {
        Self {
            channel,
            coordinator,
            health,
            metrics: None,
            poll_interval,
            unreachable: AtomicBool::new(false),
        }
    }

    pub fn with_metrics(mut self, metrics: ReloadMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    fn channel_failed(&self, err: impl ToString) -> ReloadError {
        let err = ReloadError::sync("process", err.to_string());
        if !self.unreachable.swap(true, Ordering::SeqCst) {
            self.health.record_error(&err, None);
            if let Some(metrics) = &self.metrics {
                metrics.record_sync_failure("process");
            }
        }
        err
    }

    fn channel_ok(&self) {
        if self.unreachable.swap(false, Ordering::SeqCst) {
            info!(process = %self.coordinator.process_id(), "sync signal reachable again");
        }
    }

    /// Read the signal once and converge on it.
    ///
    /// A gap of more than one generation means intermediate signals were
    /// overwritten, so every module is reloaded instead of the listed ones.
    pub async fn poll_once(&self) -> Result<Option<ReloadResult>, ReloadError> {
        let signal = match self.channel.latest() {
            Ok(signal) => {
                self.channel_ok();
                signal
            }
            Err(err) => return Err(self.channel_failed(err)),
        };
        let Some(signal) = signal else {
            self.coordinator.report_worker();
            return Ok(None);
        };

        let local = self.coordinator.generation();
        if signal.generation <= local {
            self.coordinator.report_worker();
            return Ok(None);
        }

        let scope = if signal.generation > local + 1 {
            ScanScope::All
        } else {
            ScanScope::Modules(signal.module_list.clone())
        };
        info!(
            process = %self.coordinator.process_id(),
            origin = %signal.origin_process_id,
            local,
            signalled = signal.generation,
            full = matches!(scope, ScanScope::All),
            "converging on sibling reload"
        );
        let result = self
            .coordinator
            .trigger_reload(ReloadRequest::from_signal(&signal, scope))
            .await?;
        Ok(Some(result))
    }

    /// Rewrite the current signal so every worker re-evaluates it.
    ///
    /// With no signal yet, one is built from this process's generation and
    /// full module list.
    pub fn rebroadcast(&self) -> Result<SyncSignal, ReloadError> {
        let existing = self.channel.latest().map_err(|err| self.channel_failed(err))?;
        let signal = match existing {
            Some(signal) => SyncSignal {
                timestamp: Utc::now(),
                ..signal
            },
            None => SyncSignal {
                generation: self.coordinator.generation(),
                timestamp: Utc::now(),
                module_list: self.coordinator.registry().names(),
                origin_process_id: self.coordinator.process_id().to_owned(),
            },
        };
        self.channel
            .publish(&signal)
            .map_err(|err| self.channel_failed(err))?;
        self.channel_ok();
        self.health.record_event(
            "rebroadcast",
            None,
            Some(signal.generation),
            format!("signal rewritten by {}", self.coordinator.process_id()),
        );
        Ok(signal)
    }

    /// Worker ledger as reported by every process sharing the channel.
    pub fn workers(&self) -> Result<Vec<WorkerSyncState>, ReloadError> {
        self.channel
            .workers()
            .map_err(|err| ReloadError::sync("process", err))
    }

    pub async fn run(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        let mut ticker = interval_at(Instant::now() + self.poll_interval, self.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = shutdown.recv() => {
                    debug!(process = %self.coordinator.process_id(), "sync poller stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(err) = self.poll_once().await {
                        debug!(error = %err, "sync poll failed");
                    }
                }
            }
        }
    }
}
