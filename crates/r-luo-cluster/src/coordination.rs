//! ---
//! luo_section: "07-resilience-fault-tolerance"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Cluster lock, pub/sub coordination, and reload event synchronizer."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use r_luo_common::Generation;
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CoordinationError {
    #[error("coordination backend unavailable: {0}")]
    Unavailable(String),
    #[error("lock '{name}' is held by {holder}")]
    LockHeld { name: String, holder: String },
    #[error("subscription closed")]
    Closed,
    #[error("coordination backend error: {0}")]
    Backend(String),
}

/// Reload event replicated to every node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterEvent {
    pub generation: Generation,
    pub timestamp: DateTime<Utc>,
    pub module_list: Vec<String>,
    pub origin_node_id: String,
}

/// Everything carried on the reload topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClusterMessage {
    Event(ClusterEvent),
    Ack { generation: Generation, node_id: String },
}

/// Named mutual-exclusion lease. Expires after `ttl` unless released first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockLease {
    pub name: String,
    pub holder: String,
    pub token: Uuid,
    pub ttl: Duration,
}

pub type Subscription = broadcast::Receiver<ClusterMessage>;

/// Narrow interface to the cross-node coordination backend.
#[async_trait]
pub trait CoordinationService: Send + Sync {
    /// Try once to take the lock. `Ok(None)` when another holder owns an unexpired lease.
    async fn acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, CoordinationError>;

    async fn release_lock(&self, lease: &LockLease) -> Result<(), CoordinationError>;

    /// Publish on `topic`, returning how many subscribers received the message.
    async fn publish(&self, topic: &str, message: ClusterMessage)
        -> Result<usize, CoordinationError>;

    async fn subscribe(&self, topic: &str) -> Result<Subscription, CoordinationError>;

    /// Atomically advance the cluster counter to a value above both itself and `floor`.
    async fn allocate_generation(&self, floor: Generation) -> Result<Generation, CoordinationError>;
}
