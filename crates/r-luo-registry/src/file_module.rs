//! ---
//! luo_section: "02-module-registry"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Hot-swappable module registry and reload contracts."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use indexmap::IndexMap;
use parking_lot::Mutex;
use r_luo_common::{ModuleConfig, ModuleFormat};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::contract::{
    fingerprint_bytes, ChangeMarker, ContractError, Fingerprint, ModuleState, ReloadContract,
};
use crate::registry::ModuleSpec;
use crate::swap::SwapCell;

/// Parsed revision of a file-backed module.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileDocument {
    pub fingerprint: Fingerprint,
    pub raw: String,
    pub value: serde_json::Value,
}

/// Configuration or rule set reloaded as data from a file.
///
/// `validate` reads and parses the file once and stages the result; the next
/// `reload` swaps in exactly that document.
#[derive(Debug)]
pub struct FileModule {
    path: PathBuf,
    format: ModuleFormat,
    cell: Arc<SwapCell<FileDocument>>,
    staged: Mutex<Option<FileDocument>>,
    startup: FileDocument,
}

impl FileModule {
    /// Load the initial revision. The module refuses to register if the file is unreadable.
    pub fn open(path: impl Into<PathBuf>, format: ModuleFormat) -> Result<Self, ContractError> {
        let path = path.into();
        let document = read_document(&path, format)?;
        debug!(path = %path.display(), fingerprint = %document.fingerprint, "loaded file module");
        Ok(Self {
            path,
            format,
            cell: Arc::new(SwapCell::new(document.clone())),
            staged: Mutex::new(None),
            startup: document,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn document(&self) -> Arc<FileDocument> {
        self.cell.load()
    }

    pub fn cell(&self) -> Arc<SwapCell<FileDocument>> {
        Arc::clone(&self.cell)
    }

    fn decode(state: &ModuleState) -> Result<FileDocument, ContractError> {
        serde_json::from_value(state.payload.clone())
            .map_err(|err| ContractError::Restore(err.to_string()))
    }
}

impl ReloadContract for FileModule {
    fn current_fingerprint(&self) -> Fingerprint {
        self.cell.load().fingerprint.clone()
    }

    fn source_fingerprint(&self) -> Result<Fingerprint, ContractError> {
        let bytes = fs::read(&self.path).map_err(|err| {
            ContractError::SourceUnavailable(format!("{}: {}", self.path.display(), err))
        })?;
        Ok(fingerprint_bytes(&bytes))
    }

    fn change_marker(&self) -> Option<ChangeMarker> {
        let metadata = fs::metadata(&self.path).ok()?;
        Some(ChangeMarker {
            modified: metadata.modified().ok(),
            len: metadata.len(),
        })
    }

    fn validate(&self) -> Result<(), ContractError> {
        let mut staged = self.staged.lock();
        *staged = None;
        *staged = Some(read_document(&self.path, self.format)?);
        Ok(())
    }

    fn reload(&self) -> Result<Fingerprint, ContractError> {
        let staged = self.staged.lock().take();
        let document = match staged {
            Some(document) => document,
            None => read_document(&self.path, self.format)?,
        };
        let fingerprint = document.fingerprint.clone();
        self.cell.replace(document);
        Ok(fingerprint)
    }

    fn capture(&self) -> Result<ModuleState, ContractError> {
        let document = self.cell.load();
        let payload = serde_json::to_value(document.as_ref())
            .map_err(|err| ContractError::load(err.to_string()))?;
        Ok(ModuleState::new(document.fingerprint.clone(), payload))
    }

    fn restore(&self, state: &ModuleState) -> Result<(), ContractError> {
        let document = Self::decode(state)?;
        self.cell.replace(document);
        Ok(())
    }

    fn validate_state(&self, state: &ModuleState) -> Result<(), ContractError> {
        let document = Self::decode(state)?;
        let reparsed = parse(&document.raw, self.format)?;
        if reparsed != document.value || fingerprint_bytes(document.raw.as_bytes()) != state.fingerprint {
            return Err(ContractError::invalid("backup content does not match its fingerprint"));
        }
        Ok(())
    }

    fn known_good(&self) -> Option<ModuleState> {
        serde_json::to_value(&self.startup)
            .ok()
            .map(|payload| ModuleState::new(self.startup.fingerprint.clone(), payload))
    }
}

fn read_document(path: &Path, format: ModuleFormat) -> Result<FileDocument, ContractError> {
    let raw = fs::read_to_string(path).map_err(|err| {
        ContractError::SourceUnavailable(format!("{}: {}", path.display(), err))
    })?;
    let value = parse(&raw, format)?;
    Ok(FileDocument {
        fingerprint: fingerprint_bytes(raw.as_bytes()),
        raw,
        value,
    })
}

fn parse(raw: &str, format: ModuleFormat) -> Result<serde_json::Value, ContractError> {
    match format {
        ModuleFormat::Json => {
            serde_json::from_str(raw).map_err(|err| ContractError::invalid(err.to_string()))
        }
        ModuleFormat::Toml => {
            let value: toml::Value =
                toml::from_str(raw).map_err(|err| ContractError::invalid(err.to_string()))?;
            serde_json::to_value(value).map_err(|err| ContractError::invalid(err.to_string()))
        }
        ModuleFormat::Text => Ok(serde_json::Value::String(raw.to_owned())),
    }
}

/// Open every file module declared in configuration, in declaration order.
pub fn file_module_specs(
    modules: &IndexMap<String, ModuleConfig>,
) -> Result<Vec<ModuleSpec>, ContractError> {
    modules
        .iter()
        .map(|(name, module)| {
            let contract = FileModule::open(&module.source, module.format).map_err(|err| {
                ContractError::load(format!(
                    "module '{}' ({}): {}",
                    name,
                    module.source.display(),
                    err
                ))
            })?;
            Ok(ModuleSpec::new(name.clone(), module.kind, Arc::new(contract))
                .depends_on(module.depends_on.iter().cloned()))
        })
        .collect()
}
