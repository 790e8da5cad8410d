//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Persistence abstractions and storage bindings."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
#![warn(missing_docs)]
//! Local persisted state for R-LUO: module backups, the audit log, and the
//! process sync signal shared by sibling workers on one host.

/// Result alias used throughout the persistence crate.
pub type Result<T> = std::result::Result<T, PersistenceError>;

/// Error type for the persistence subsystem.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Wrapper for IO errors encountered while reading/writing persistence files.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    /// Wrapper for JSON serialization issues.
    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),
    /// Wrapper for CBOR serialization issues.
    #[error("cbor serialization error: {0}")]
    Cbor(#[from] serde_cbor::Error),
    /// Reported when a backup envelope fails integrity verification.
    #[error("backup hash mismatch: {0}")]
    HashMismatch(String),
    /// Wrapper for Prometheus metrics registration failures.
    #[error("metrics error: {0}")]
    Metrics(#[from] prometheus::Error),
    /// Requested record does not exist.
    #[error("not found: {0}")]
    NotFound(String),
}

pub mod audit;
pub mod backup;
pub mod metrics;
pub mod signal;

pub use audit::{read_entries as read_audit_entries, AuditEntry, AuditLogWriter};
pub use backup::{BackupArchive, BackupEntry, BackupId, BackupRecord, BACKUP_VERSION};
pub use metrics::PersistenceMetrics;
pub use signal::{
    FileSignalChannel, MemorySignalChannel, SignalChannel, SyncSignal, WorkerSyncState,
};

/// Replace characters that are unsafe in a file name.
pub(crate) fn file_safe(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect()
}
