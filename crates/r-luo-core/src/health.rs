//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_luo_common::{AuditConfig, Generation};
use r_luo_persistence::{AuditLogWriter, PersistenceMetrics};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};

use crate::error::ReloadError;

/// Whether a record describes a failure or a normal lifecycle step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Error,
}

/// One structured audit record, mirrored in memory and in the JSONL log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub severity: Severity,
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub module: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub generation: Option<Generation>,
    pub message: String,
}

/// Failure counters, recent history, and the durable audit trail.
///
/// Audit file failures are logged and never fail the operation being audited.
pub struct HealthAndAuditLog {
    writer: Mutex<Option<AuditLogWriter>>,
    recent: Mutex<VecDeque<AuditRecord>>,
    recent_limit: usize,
    counters: Mutex<BTreeMap<String, u64>>,
    sequence: AtomicU64,
    metrics: Option<PersistenceMetrics>,
}

impl std::fmt::Debug for HealthAndAuditLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HealthAndAuditLog")
            .field("recent_limit", &self.recent_limit)
            .field("counters", &*self.counters.lock())
            .finish_non_exhaustive()
    }
}

impl HealthAndAuditLog {
    /// Audit log backed by rotating files under `config.directory`.
    pub fn open(config: &AuditConfig) -> r_luo_persistence::Result<Self> {
        let writer = AuditLogWriter::open(&config.directory, config.max_bytes, config.max_files)?;
        info!(path = %writer.path().display(), "audit log opened");
        let mut log = Self::in_memory(config.recent_limit);
        log.writer = Mutex::new(Some(writer));
        Ok(log)
    }

    /// Audit log that keeps only the in-memory history.
    pub fn in_memory(recent_limit: usize) -> Self {
        Self {
            writer: Mutex::new(None),
            recent: Mutex::new(VecDeque::new()),
            recent_limit: recent_limit.max(1),
            counters: Mutex::new(BTreeMap::new()),
            sequence: AtomicU64::new(0),
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Count and persist a pipeline failure.
    pub fn record_error(&self, err: &ReloadError, generation: Option<Generation>) -> AuditRecord {
        error!(kind = err.kind(), module = ?err.module(), generation, error = %err, "reload pipeline error");
        self.push(
            Severity::Error,
            err.kind(),
            err.module().map(str::to_owned),
            generation,
            err.to_string(),
        )
    }

    /// Persist a lifecycle event such as a committed generation or a rollback.
    pub fn record_event(
        &self,
        kind: &str,
        module: Option<&str>,
        generation: Option<Generation>,
        message: impl Into<String>,
    ) -> AuditRecord {
        self.push(
            Severity::Info,
            kind,
            module.map(str::to_owned),
            generation,
            message.into(),
        )
    }

    fn push(
        &self,
        severity: Severity,
        kind: &str,
        module: Option<String>,
        generation: Option<Generation>,
        message: String,
    ) -> AuditRecord {
        let record = AuditRecord {
            sequence: self.sequence.fetch_add(1, Ordering::SeqCst) + 1,
            timestamp: Utc::now(),
            severity,
            kind: kind.to_owned(),
            module,
            generation,
            message,
        };

        *self.counters.lock().entry(record.kind.clone()).or_insert(0) += 1;
        {
            let mut recent = self.recent.lock();
            if recent.len() == self.recent_limit {
                recent.pop_front();
            }
            recent.push_back(record.clone());
        }

        if let Some(writer) = self.writer.lock().as_mut() {
            let payload = match serde_json::to_value(&record) {
                Ok(payload) => payload,
                Err(err) => {
                    warn!(error = %err, "failed to encode audit record");
                    return record;
                }
            };
            match writer.append(payload) {
                Ok((_, bytes)) => {
                    if let Some(metrics) = &self.metrics {
                        metrics.record_audit_bytes(bytes);
                    }
                }
                Err(err) => warn!(error = %err, kind = %record.kind, "failed to append audit record"),
            }
        }
        record
    }

    /// Number of records of one kind, e.g. `apply_error`.
    pub fn count(&self, kind: &str) -> u64 {
        self.counters.lock().get(kind).copied().unwrap_or(0)
    }

    pub fn counts(&self) -> BTreeMap<String, u64> {
        self.counters.lock().clone()
    }

    /// Error counts only.
    pub fn failure_counts(&self) -> BTreeMap<String, u64> {
        self.counters
            .lock()
            .iter()
            .filter(|(kind, _)| kind.ends_with("_error"))
            .map(|(kind, count)| (kind.clone(), *count))
            .collect()
    }

    /// Most recent records, oldest first.
    pub fn recent(&self) -> Vec<AuditRecord> {
        self.recent.lock().iter().cloned().collect()
    }

    pub fn recent_failures(&self) -> Vec<AuditRecord> {
        self.recent
            .lock()
            .iter()
            .filter(|record| record.severity == Severity::Error)
            .cloned()
            .collect()
    }
}
