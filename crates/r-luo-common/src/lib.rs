//! ---
//! luo_section: "01-core-functionality"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Shared primitives and utilities for the live update runtime."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
//! Core shared primitives for the R-LUO workspace.
//! This crate exposes configuration loading, logging setup, and the small
//! vocabulary types (module kinds, generations) consumed across the workspace.

pub mod config;
pub mod logging;
pub mod module;
pub mod time;

pub use config::{
    ApiConfig, AppConfig, AuditConfig, BackupConfig, BackupFormat, ClusterBackend, ClusterConfig,
    DetectorConfig, LoggingConfig, MetricsConfig, ModuleConfig, NodeConfig, SyncConfig,
};
pub use logging::{init_cli, init_tracing, LogFormat};
pub use module::{ModuleFormat, ModuleKind};

/// Monotonically increasing identifier of one cluster-wide reload event.
///
/// Generation `0` means "nothing reloaded since process start".
pub type Generation = u64;
