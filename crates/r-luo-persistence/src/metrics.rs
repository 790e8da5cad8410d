//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Persistence abstractions and storage bindings."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::sync::Arc;

use prometheus::{Counter, IntCounterVec, Opts, Registry};

use crate::Result;

/// Metrics published by the persistence subsystem.
#[derive(Clone)]
pub struct PersistenceMetrics {
    backups_written: IntCounterVec,
    backups_failed: IntCounterVec,
    backups_pruned: IntCounterVec,
    audit_bytes: Counter,
}

impl PersistenceMetrics {
    /// Register all persistence metrics with the provided registry.
    pub fn new(registry: Arc<Registry>) -> Result<Self> {
        let backups_written = IntCounterVec::new(
            Opts::new(
                "r_luo_backups_written_total",
                "Total number of module backups successfully persisted",
            ),
            &["module"],
        )?;
        registry.register(Box::new(backups_written.clone()))?;

        let backups_failed = IntCounterVec::new(
            Opts::new(
                "r_luo_backups_failed_total",
                "Total number of module backup writes that failed",
            ),
            &["module"],
        )?;
        registry.register(Box::new(backups_failed.clone()))?;

        let backups_pruned = IntCounterVec::new(
            Opts::new(
                "r_luo_backups_pruned_total",
                "Total number of module backups evicted by retention",
            ),
            &["module"],
        )?;
        registry.register(Box::new(backups_pruned.clone()))?;

        let audit_bytes = Counter::with_opts(Opts::new(
            "r_luo_audit_log_bytes_total",
            "Total bytes appended to the audit log",
        ))?;
        registry.register(Box::new(audit_bytes.clone()))?;

        Ok(Self {
            backups_written,
            backups_failed,
            backups_pruned,
            audit_bytes,
        })
    }

    /// Record a successful backup for `module`.
    pub fn record_backup_written(&self, module: &str) {
        self.backups_written.with_label_values(&[module]).inc();
    }

    /// Record a failed backup write for `module`.
    pub fn record_backup_failed(&self, module: &str) {
        self.backups_failed.with_label_values(&[module]).inc();
    }

    /// Record backups evicted by retention.
    pub fn record_backups_pruned(&self, module: &str, count: usize) {
        self.backups_pruned
            .with_label_values(&[module])
            .inc_by(count as u64);
    }

    /// Add to the total number of bytes written to the audit log.
    pub fn record_audit_bytes(&self, bytes: usize) {
        self.audit_bytes.inc_by(bytes as f64);
    }
}

impl std::fmt::Debug for PersistenceMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistenceMetrics").finish_non_exhaustive()
    }
}
