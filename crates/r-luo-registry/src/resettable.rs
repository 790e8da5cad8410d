//! ---
//! luo_section: "02-module-registry"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Hot-swappable module registry and reload contracts."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde_json::json;

use crate::contract::{ContractError, Fingerprint, ModuleState, ReloadContract};

/// Process-wide state that is cleared and rebuilt on reload (caches, pools, memoized tables).
pub trait ResettableResource: Send + Sync + 'static {
    fn reset(&self) -> Result<(), ContractError>;
}

/// Registers a [`ResettableResource`] as a module. Each successful reset starts a new epoch.
///
/// A cache has no external source, so scans never flag it; it reloads when
/// forced or when a dependency it sits on reloads.
pub struct ResettableModule<R> {
    resource: Arc<R>,
    epoch: AtomicU64,
}

impl<R: ResettableResource> ResettableModule<R> {
    pub fn new(resource: Arc<R>) -> Self {
        Self {
            resource,
            epoch: AtomicU64::new(0),
        }
    }

    pub fn resource(&self) -> Arc<R> {
        Arc::clone(&self.resource)
    }

    pub fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    fn fingerprint_for(epoch: u64) -> Fingerprint {
        format!("epoch-{epoch}")
    }
}

impl<R: ResettableResource> ReloadContract for ResettableModule<R> {
    fn current_fingerprint(&self) -> Fingerprint {
        Self::fingerprint_for(self.epoch())
    }

    fn source_fingerprint(&self) -> Result<Fingerprint, ContractError> {
        Ok(self.current_fingerprint())
    }

    fn reload(&self) -> Result<Fingerprint, ContractError> {
        self.resource.reset()?;
        let epoch = self.epoch.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Self::fingerprint_for(epoch))
    }

    fn capture(&self) -> Result<ModuleState, ContractError> {
        let epoch = self.epoch();
        Ok(ModuleState::new(
            Self::fingerprint_for(epoch),
            json!({ "epoch": epoch }),
        ))
    }

    /// Cleared state cannot be brought back; restoring rebuilds it empty under the recorded epoch.
    fn restore(&self, state: &ModuleState) -> Result<(), ContractError> {
        let epoch = state
            .payload
            .get("epoch")
            .and_then(serde_json::Value::as_u64)
            .ok_or_else(|| ContractError::Restore("missing epoch".to_owned()))?;
        self.resource.reset()?;
        self.epoch.store(epoch, Ordering::SeqCst);
        Ok(())
    }

    fn known_good(&self) -> Option<ModuleState> {
        Some(ModuleState::new(Self::fingerprint_for(0), json!({ "epoch": 0 })))
    }
}
