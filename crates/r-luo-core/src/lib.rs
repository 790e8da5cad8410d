//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
//! Reload pipeline for R-LUO: detect source changes, apply them in dependency
//! order with per-module rollback, and propagate committed generations to
//! sibling processes and cluster peers.

mod backup;
mod broadcaster;
mod coordinator;
mod detector;
mod error;
mod health;
mod orchestrator;

pub use backup::{BackupStore, RestorePoint};
pub use broadcaster::ProcessSyncBroadcaster;
pub use coordinator::{
    ModuleOutcome, ModuleStatus, Origin, Phase, ReloadCoordinator, ReloadRequest, ReloadResult,
    RollbackReport,
};
pub use detector::{ChangeDetector, ChangeEvent, ScanScope, Trigger};
pub use error::ReloadError;
pub use health::{AuditRecord, HealthAndAuditLog, Severity};
pub use orchestrator::{
    LiveUpdateOrchestrator, LiveUpdateService, ModuleStatusView, ModuleVersion, StatusReport,
    WorkerSyncReport,
};
