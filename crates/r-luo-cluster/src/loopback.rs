//! ---
//! luo_section: "07-resilience-fault-tolerance"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Cluster lock, pub/sub coordination, and reload event synchronizer."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use parking_lot::Mutex;
use r_luo_common::Generation;
use tokio::sync::broadcast;
use tracing::{debug, info};
use uuid::Uuid;

use crate::coordination::{
    ClusterMessage, CoordinationError, CoordinationService, LockLease, Subscription,
};

const TOPIC_CAPACITY: usize = 256;

#[derive(Debug)]
struct HeldLock {
    holder: String,
    token: Uuid,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct LoopbackState {
    locks: HashMap<String, HeldLock>,
    topics: HashMap<String, broadcast::Sender<ClusterMessage>>,
    counter: Generation,
}

/// In-process coordination backend shared by every node handle cloned from one `Arc`.
#[derive(Debug)]
pub struct LoopbackCoordinator {
    state: Mutex<LoopbackState>,
    available: AtomicBool,
}

impl Default for LoopbackCoordinator {
    fn default() -> Self {
        Self::new()
    }
}

impl LoopbackCoordinator {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(LoopbackState::default()),
            available: AtomicBool::new(true),
        }
    }

    /// Simulate a backend outage. Going unavailable closes every live subscription.
    pub fn set_available(&self, available: bool) {
        let previous = self.available.swap(available, Ordering::SeqCst);
        if previous && !available {
            self.state.lock().topics.clear();
            info!("loopback coordinator marked unavailable");
        } else if !previous && available {
            info!("loopback coordinator available again");
        }
    }

    pub fn is_available(&self) -> bool {
        self.available.load(Ordering::SeqCst)
    }

    fn ensure_available(&self) -> Result<(), CoordinationError> {
        if self.is_available() {
            Ok(())
        } else {
            Err(CoordinationError::Unavailable(
                "loopback coordinator offline".to_owned(),
            ))
        }
    }
}

#[async_trait]
impl CoordinationService for LoopbackCoordinator {
    async fn acquire_lock(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<LockLease>, CoordinationError> {
        self.ensure_available()?;
        let now = Instant::now();
        let mut state = self.state.lock();
        if let Some(held) = state.locks.get(name) {
            if held.expires_at > now && held.holder != holder {
                return Ok(None);
            }
        }
        let token = Uuid::new_v4();
        state.locks.insert(
            name.to_owned(),
            HeldLock {
                holder: holder.to_owned(),
                token,
                expires_at: now + ttl,
            },
        );
        debug!(lock = name, holder, "lock acquired");
        Ok(Some(LockLease {
            name: name.to_owned(),
            holder: holder.to_owned(),
            token,
            ttl,
        }))
    }

    async fn release_lock(&self, lease: &LockLease) -> Result<(), CoordinationError> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let owned = state
            .locks
            .get(&lease.name)
            .map(|held| held.token == lease.token)
            .unwrap_or(false);
        if owned {
            state.locks.remove(&lease.name);
            debug!(lock = %lease.name, holder = %lease.holder, "lock released");
        }
        Ok(())
    }

    async fn publish(
        &self,
        topic: &str,
        message: ClusterMessage,
    ) -> Result<usize, CoordinationError> {
        self.ensure_available()?;
        let sender = self
            .state
            .lock()
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0)
            .clone();
        Ok(sender.send(message).unwrap_or(0))
    }

    async fn subscribe(&self, topic: &str) -> Result<Subscription, CoordinationError> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        let sender = state
            .topics
            .entry(topic.to_owned())
            .or_insert_with(|| broadcast::channel(TOPIC_CAPACITY).0);
        Ok(sender.subscribe())
    }

    async fn allocate_generation(&self, floor: Generation) -> Result<Generation, CoordinationError> {
        self.ensure_available()?;
        let mut state = self.state.lock();
        state.counter = state.counter.max(floor) + 1;
        Ok(state.counter)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::ClusterEvent;
    use chrono::Utc;

    #[tokio::test]
    async fn lock_is_exclusive_until_released_or_expired() {
        let coordinator = LoopbackCoordinator::new();
        let ttl = Duration::from_millis(80);
        let lease = coordinator
            .acquire_lock("driver", "node-a", ttl)
            .await
            .unwrap()
            .unwrap();
        assert!(coordinator
            .acquire_lock("driver", "node-b", ttl)
            .await
            .unwrap()
            .is_none());

        coordinator.release_lock(&lease).await.unwrap();
        let lease_b = coordinator
            .acquire_lock("driver", "node-b", ttl)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(lease_b.holder, "node-b");

        tokio::time::sleep(ttl + Duration::from_millis(20)).await;
        assert!(coordinator
            .acquire_lock("driver", "node-a", ttl)
            .await
            .unwrap()
            .is_some());
        // a stale lease must not release the new holder's lock
        coordinator.release_lock(&lease_b).await.unwrap();
        assert!(coordinator
            .acquire_lock("driver", "node-b", ttl)
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn generations_never_regress_below_floor() {
        let coordinator = LoopbackCoordinator::new();
        assert_eq!(coordinator.allocate_generation(0).await.unwrap(), 1);
        assert_eq!(coordinator.allocate_generation(9).await.unwrap(), 10);
        assert_eq!(coordinator.allocate_generation(3).await.unwrap(), 11);
    }

    #[tokio::test]
    async fn outage_closes_subscriptions() {
        let coordinator = LoopbackCoordinator::new();
        let mut subscription = coordinator.subscribe("reload").await.unwrap();
        let event = ClusterMessage::Event(ClusterEvent {
            generation: 1,
            timestamp: Utc::now(),
            module_list: vec!["rules".into()],
            origin_node_id: "node-a".into(),
        });
        assert_eq!(coordinator.publish("reload", event.clone()).await.unwrap(), 1);
        assert_eq!(subscription.recv().await.unwrap(), event);

        coordinator.set_available(false);
        assert!(matches!(
            subscription.recv().await,
            Err(broadcast::error::RecvError::Closed)
        ));
        assert!(matches!(
            coordinator.publish("reload", event).await,
            Err(CoordinationError::Unavailable(_))
        ));
        assert!(coordinator.subscribe("reload").await.is_err());
    }
}
