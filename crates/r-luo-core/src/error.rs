//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use r_luo_persistence::PersistenceError;
use r_luo_registry::RegistryError;

/// Failure taxonomy of the reload pipeline.
///
/// Detection and sync errors are recovered locally; apply errors are isolated
/// per module; validation and cycle errors surface through the status surface.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ReloadError {
    #[error("fingerprint source for '{module}' unreachable: {reason}")]
    Detection { module: String, reason: String },
    #[error("candidate for '{module}' failed validation: {reason}")]
    Validation { module: String, reason: String },
    #[error("reload of '{module}' failed: {reason}")]
    Apply { module: String, reason: String },
    #[error("{channel} sync propagation failed: {reason}")]
    SyncPropagation { channel: String, reason: String },
    #[error("could not acquire lock '{lock}' within {timeout_ms} ms")]
    LockTimeout { lock: String, timeout_ms: u64 },
    #[error("dependency cycle detected involving module '{0}'")]
    Cycle(String),
    #[error(transparent)]
    Registry(RegistryError),
    #[error("persistence failure: {0}")]
    Persistence(String),
    #[error("another reload is already applying")]
    Busy,
}

impl ReloadError {
    /// Stable label used in audit records and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            ReloadError::Detection { .. } => "detection_error",
            ReloadError::Validation { .. } => "validation_error",
            ReloadError::Apply { .. } => "apply_error",
            ReloadError::SyncPropagation { .. } => "sync_propagation_error",
            ReloadError::LockTimeout { .. } => "lock_timeout_error",
            ReloadError::Cycle(_) => "cycle_error",
            ReloadError::Registry(_) => "registry_error",
            ReloadError::Persistence(_) => "persistence_error",
            ReloadError::Busy => "busy",
        }
    }

    /// Module the error concerns, when there is one.
    pub fn module(&self) -> Option<&str> {
        match self {
            ReloadError::Detection { module, .. }
            | ReloadError::Validation { module, .. }
            | ReloadError::Apply { module, .. } => Some(module),
            ReloadError::Cycle(module) => Some(module),
            ReloadError::Registry(RegistryError::UnknownModule(module)) => Some(module),
            _ => None,
        }
    }

    pub fn sync(channel: &str, reason: impl ToString) -> Self {
        ReloadError::SyncPropagation {
            channel: channel.to_owned(),
            reason: reason.to_string(),
        }
    }
}

impl From<RegistryError> for ReloadError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::Cycle(module) => ReloadError::Cycle(module),
            other => ReloadError::Registry(other),
        }
    }
}

impl From<PersistenceError> for ReloadError {
    fn from(err: PersistenceError) -> Self {
        ReloadError::Persistence(err.to_string())
    }
}
