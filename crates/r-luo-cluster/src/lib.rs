//! ---
//! luo_section: "07-resilience-fault-tolerance"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Cluster lock, pub/sub coordination, and reload event synchronizer."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
//! Inter-node replication of reload generations.
//!
//! The distributed lock and the pub/sub topic are reached only through
//! [`CoordinationService`]; any backend offering lock, publish, subscribe and
//! an atomic counter can stand behind it.

mod coordination;
mod loopback;
mod synchronizer;

pub use coordination::{
    ClusterEvent, ClusterMessage, CoordinationError, CoordinationService, LockLease, Subscription,
};
pub use loopback::LoopbackCoordinator;
pub use synchronizer::{AckSummary, ClusterSynchronizer, DriverDecision, RemoteApplier};
