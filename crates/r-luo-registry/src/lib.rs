//! ---
//! luo_section: "02-module-registry"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Hot-swappable module registry and reload contracts."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
//! Registry of hot-swappable units for R-LUO.
//!
//! Every unit is an indirect reference held in a table; a reload replaces the
//! reference atomically and never mutates the active value in place.

mod contract;
mod file_module;
mod registry;
mod resettable;
mod swap;

pub use contract::{
    fingerprint_bytes, fingerprint_json, ChangeMarker, ContractError, Fingerprint, ModuleState,
    ReloadContract,
};
pub use file_module::{file_module_specs, FileDocument, FileModule};
pub use registry::{ModuleDescriptor, ModuleRegistry, ModuleSpec, RegistryError};
pub use resettable::{ResettableModule, ResettableResource};
pub use swap::{SwapCell, SwapModule};
