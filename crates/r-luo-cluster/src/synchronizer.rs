//! ---
//! luo_section: "07-resilience-fault-tolerance"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Cluster lock, pub/sub coordination, and reload event synchronizer."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use r_luo_common::time::duration_to_millis;
use r_luo_common::{ClusterConfig, Generation};
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::coordination::{
    ClusterEvent, ClusterMessage, CoordinationError, CoordinationService, LockLease,
};

const LOCK_RETRY_INTERVAL: Duration = Duration::from_millis(50);

/// Receiving side of cluster replication, implemented by the local orchestrator.
#[async_trait]
pub trait RemoteApplier: Send + Sync {
    /// Highest generation this node has committed.
    fn known_generation(&self) -> Generation;

    /// Run the local apply pipeline for a newer remote event.
    async fn apply_remote(&self, event: ClusterEvent);

    /// The channel became unreachable; the node now reloads independently.
    fn on_propagation_failure(&self, error: &CoordinationError);
}

/// Outcome of trying to become the driver for one change.
#[derive(Debug)]
pub enum DriverDecision {
    Leader(LockLease),
    /// Another node holds the lock; its event will arrive over the topic.
    Deferred,
    /// The backend is unreachable; proceed as an independent node.
    Degraded(CoordinationError),
}

/// Acknowledgements collected after publishing an event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AckSummary {
    pub expected: usize,
    pub received: BTreeSet<String>,
    pub timed_out: bool,
}

/// Replicates committed generations to every node through the coordination service.
pub struct ClusterSynchronizer {
    node_id: String,
    config: ClusterConfig,
    coordinator: Arc<dyn CoordinationService>,
    degraded: AtomicBool,
}

impl std::fmt::Debug for ClusterSynchronizer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterSynchronizer")
            .field("node_id", &self.node_id)
            .field("topic", &self.config.topic)
            .field("degraded", &self.is_degraded())
            .finish_non_exhaustive()
    }
}

impl ClusterSynchronizer {
    pub fn new(
        node_id: impl Into<String>,
        config: ClusterConfig,
        coordinator: Arc<dyn CoordinationService>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            config,
            coordinator,
            degraded: AtomicBool::new(false),
        }
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::SeqCst)
    }

    /// Returns true when this call moved the node into degraded mode.
    fn mark_degraded(&self, error: &CoordinationError) -> bool {
        let entered = !self.degraded.swap(true, Ordering::SeqCst);
        if entered {
            warn!(
                node = %self.node_id,
                error = %error,
                "cluster coordination unavailable; continuing with independent per-node reloads"
            );
        }
        entered
    }

    fn mark_synchronized(&self) {
        if self.degraded.swap(false, Ordering::SeqCst) {
            info!(node = %self.node_id, "cluster coordination restored");
        }
    }

    /// Try to become the driver, retrying until `lock_timeout` elapses.
    pub async fn acquire_driver(&self) -> DriverDecision {
        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            match self
                .coordinator
                .acquire_lock(&self.config.lock_name, &self.node_id, self.config.lock_ttl)
                .await
            {
                Ok(Some(lease)) => {
                    debug!(node = %self.node_id, lock = %lease.name, "acquired driver lock");
                    return DriverDecision::Leader(lease);
                }
                Ok(None) => {
                    let now = Instant::now();
                    if now >= deadline {
                        warn!(
                            node = %self.node_id,
                            lock = %self.config.lock_name,
                            timeout_ms = duration_to_millis(self.config.lock_timeout),
                            "timed out waiting for driver lock"
                        );
                        return DriverDecision::Deferred;
                    }
                    sleep(LOCK_RETRY_INTERVAL.min(deadline - now)).await;
                }
                Err(err) => {
                    self.mark_degraded(&err);
                    return DriverDecision::Degraded(err);
                }
            }
        }
    }

    pub async fn release(&self, lease: &LockLease) {
        if let Err(err) = self.coordinator.release_lock(lease).await {
            warn!(node = %self.node_id, lock = %lease.name, error = %err, "failed to release driver lock");
        }
    }

    /// Allocate the next cluster-wide generation, never below `floor + 1`.
    pub async fn allocate_generation(
        &self,
        floor: Generation,
    ) -> Result<Generation, CoordinationError> {
        self.coordinator
            .allocate_generation(floor)
            .await
            .map_err(|err| {
                self.mark_degraded(&err);
                err
            })
    }

    /// Publish an event and wait (bounded, best effort) for peer acknowledgements.
    pub async fn publish(&self, event: ClusterEvent) -> Result<AckSummary, CoordinationError> {
        let expected = self.config.expected_peers;
        let mut acks = match expected {
            0 => None,
            _ => Some(self.coordinator.subscribe(&self.config.topic).await?),
        };
        let generation = event.generation;
        let delivered = self
            .coordinator
            .publish(&self.config.topic, ClusterMessage::Event(event))
            .await
            .map_err(|err| {
                self.mark_degraded(&err);
                err
            })?;
        self.mark_synchronized();
        debug!(node = %self.node_id, generation, delivered, "published cluster event");

        let mut summary = AckSummary {
            expected,
            received: BTreeSet::new(),
            timed_out: false,
        };
        let Some(acks) = acks.as_mut() else {
            return Ok(summary);
        };

        let deadline = sleep(self.config.ack_timeout);
        tokio::pin!(deadline);
        while summary.received.len() < expected {
            tokio::select! {
                _ = &mut deadline => {
                    summary.timed_out = true;
                    warn!(
                        node = %self.node_id,
                        generation,
                        expected,
                        received = summary.received.len(),
                        "peer acknowledgements timed out"
                    );
                    break;
                }
                message = acks.recv() => match message {
                    Ok(ClusterMessage::Ack { generation: acked, node_id })
                        if acked == generation && node_id != self.node_id =>
                    {
                        summary.received.insert(node_id);
                    }
                    Ok(_) => {}
                    Err(RecvError::Lagged(skipped)) => {
                        debug!(node = %self.node_id, skipped, "ack subscription lagged");
                    }
                    Err(RecvError::Closed) => {
                        summary.timed_out = true;
                        warn!(node = %self.node_id, generation, "topic closed while waiting for acknowledgements");
                        break;
                    }
                },
            }
        }
        Ok(summary)
    }

    /// Subscription loop: applies newer remote events and resubscribes while degraded.
    pub async fn run_listener(
        self: Arc<Self>,
        applier: Arc<dyn RemoteApplier>,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        loop {
            let mut subscription = match self.coordinator.subscribe(&self.config.topic).await {
                Ok(subscription) => {
                    self.mark_synchronized();
                    subscription
                }
                Err(err) => {
                    if self.mark_degraded(&err) {
                        applier.on_propagation_failure(&err);
                    }
                    tokio::select! {
                        _ = shutdown.recv() => return,
                        _ = sleep(self.config.resubscribe_interval) => continue,
                    }
                }
            };

            loop {
                tokio::select! {
                    _ = shutdown.recv() => {
                        debug!(node = %self.node_id, "cluster listener stopping");
                        return;
                    }
                    message = subscription.recv() => match message {
                        Ok(ClusterMessage::Event(event)) => self.handle_event(&applier, event).await,
                        Ok(ClusterMessage::Ack { .. }) => {}
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(node = %self.node_id, skipped, "cluster subscription lagged; relying on later events to converge");
                        }
                        Err(RecvError::Closed) => {
                            let err = CoordinationError::Closed;
                            if self.mark_degraded(&err) {
                                applier.on_propagation_failure(&err);
                            }
                            break;
                        }
                    },
                }
            }
        }
    }

    async fn handle_event(&self, applier: &Arc<dyn RemoteApplier>, event: ClusterEvent) {
        let generation = event.generation;
        if event.origin_node_id == self.node_id {
            return;
        }
        if generation > applier.known_generation() {
            info!(
                node = %self.node_id,
                origin = %event.origin_node_id,
                generation,
                modules = ?event.module_list,
                "applying remote reload event"
            );
            applier.apply_remote(event).await;
        } else {
            debug!(node = %self.node_id, generation, "ignoring stale cluster event");
        }
        let ack = ClusterMessage::Ack {
            generation,
            node_id: self.node_id.clone(),
        };
        if let Err(err) = self.coordinator.publish(&self.config.topic, ack).await {
            warn!(node = %self.node_id, generation, error = %err, "failed to acknowledge cluster event");
        }
    }
}
