//! ---
//! luo_section: "02-module-registry"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Hot-swappable module registry and reload contracts."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Opaque value representing a module's current version or content.
pub type Fingerprint = String;

/// Failures raised by a module while honouring its reload contract.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ContractError {
    #[error("fingerprint source unavailable: {0}")]
    SourceUnavailable(String),
    #[error("candidate rejected: {0}")]
    Invalid(String),
    #[error("reload failed: {0}")]
    Load(String),
    #[error("state restore failed: {0}")]
    Restore(String),
}

impl ContractError {
    pub fn invalid(reason: impl Into<String>) -> Self {
        Self::Invalid(reason.into())
    }

    pub fn load(reason: impl Into<String>) -> Self {
        Self::Load(reason.into())
    }
}

/// Snapshot of the implementation a module is currently serving.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModuleState {
    pub fingerprint: Fingerprint,
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl ModuleState {
    pub fn new(fingerprint: impl Into<Fingerprint>, payload: serde_json::Value) -> Self {
        Self {
            fingerprint: fingerprint.into(),
            payload,
        }
    }
}

/// Cheap change indicator compared before any content hashing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeMarker {
    pub modified: Option<SystemTime>,
    pub len: u64,
}

/// Contract every hot-swappable unit exposes to the orchestrator.
///
/// `reload` must publish the new implementation with a single atomic
/// reference swap so concurrent readers see either the old or the new value.
pub trait ReloadContract: Send + Sync + 'static {
    /// Fingerprint of the implementation currently being served.
    fn current_fingerprint(&self) -> Fingerprint;

    /// Fingerprint of what a reload would load right now.
    fn source_fingerprint(&self) -> Result<Fingerprint, ContractError>;

    /// Optional cheap marker (mtime, length) checked before hashing.
    fn change_marker(&self) -> Option<ChangeMarker> {
        None
    }

    /// Pure pre-check of the reload candidate.
    fn validate(&self) -> Result<(), ContractError> {
        Ok(())
    }

    /// Load the candidate and swap it in, returning the loaded fingerprint.
    fn reload(&self) -> Result<Fingerprint, ContractError>;

    /// Capture the active implementation for backup.
    fn capture(&self) -> Result<ModuleState, ContractError>;

    /// Swap a previously captured implementation back in.
    fn restore(&self, state: &ModuleState) -> Result<(), ContractError>;

    /// Re-validate a captured state before a rollback commits it.
    fn validate_state(&self, _state: &ModuleState) -> Result<(), ContractError> {
        Ok(())
    }

    /// Last known-good revision from the authoritative source history.
    fn known_good(&self) -> Option<ModuleState> {
        None
    }
}

/// SHA-256 hex digest of raw bytes.
pub fn fingerprint_bytes(bytes: &[u8]) -> Fingerprint {
    hex::encode(Sha256::digest(bytes))
}

/// SHA-256 hex digest of the canonical JSON encoding of a value.
pub fn fingerprint_json<T: Serialize + ?Sized>(value: &T) -> Result<Fingerprint, ContractError> {
    let bytes = serde_json::to_vec(value).map_err(|err| ContractError::load(err.to_string()))?;
    Ok(fingerprint_bytes(&bytes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn json_fingerprint_is_stable() {
        let a = fingerprint_json(&json!({"rate": 1.5, "tier": "gold"})).unwrap();
        let b = fingerprint_json(&json!({"rate": 1.5, "tier": "gold"})).unwrap();
        let c = fingerprint_json(&json!({"rate": 1.6, "tier": "gold"})).unwrap();
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
    }
}
