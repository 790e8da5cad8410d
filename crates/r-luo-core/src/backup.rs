//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::sync::Arc;

use r_luo_common::Generation;
use r_luo_persistence::{BackupArchive, BackupEntry, BackupId, BackupRecord, PersistenceMetrics};
use r_luo_registry::{ModuleDescriptor, ModuleRegistry, ModuleState, RegistryError};
use tracing::{debug, info, warn};

use crate::error::ReloadError;

/// A revision a module can be restored to.
#[derive(Debug, Clone, PartialEq)]
pub struct RestorePoint {
    /// `None` when falling back to the module's known-good revision.
    pub backup_id: Option<BackupId>,
    pub generation: Generation,
    pub state: ModuleState,
}

/// Snapshots module implementations before an apply and restores them on demand.
pub struct BackupStore {
    archive: BackupArchive,
    registry: Arc<ModuleRegistry>,
    metrics: Option<PersistenceMetrics>,
}

impl std::fmt::Debug for BackupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackupStore")
            .field("root", &self.archive.root())
            .field("retain_last", &self.archive.retain_last())
            .finish_non_exhaustive()
    }
}

impl BackupStore {
    pub fn new(archive: BackupArchive, registry: Arc<ModuleRegistry>) -> Self {
        Self {
            archive,
            registry,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: PersistenceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn archive(&self) -> &BackupArchive {
        &self.archive
    }

    fn descriptor(&self, name: &str) -> Result<Arc<ModuleDescriptor>, ReloadError> {
        self.registry
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_owned()).into())
    }

    /// Persist the implementation `name` is serving right now.
    ///
    /// Retention is applied by [`BackupStore::settle`] once the apply that
    /// needed the snapshot succeeds.
    pub fn snapshot(&self, name: &str) -> Result<BackupId, ReloadError> {
        let descriptor = self.descriptor(name)?;
        let result = descriptor
            .contract
            .capture()
            .map_err(|err| ReloadError::Persistence(format!("capture of '{name}' failed: {err}")))
            .and_then(|state| {
                let record =
                    BackupRecord::new(name, descriptor.generation, state.fingerprint, state.payload);
                self.archive.write(&record).map_err(ReloadError::from)
            });

        match result {
            Ok(entry) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_backup_written(name);
                }
                debug!(module = name, backup = %entry.id, generation = entry.generation, "backup written");
                Ok(entry.id)
            }
            Err(err) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_backup_failed(name);
                }
                Err(err)
            }
        }
    }

    /// The apply guarded by `backup_id` succeeded: trim the module's backups
    /// to the configured retention.
    pub fn settle(&self, name: &str) {
        if let Err(err) = self.prune(name, self.archive.retain_last()) {
            warn!(module = name, error = %err, "failed to prune old backups");
        }
    }

    /// The apply guarded by `backup_id` was rolled back, so the snapshot only
    /// duplicates the revision still being served.
    pub fn discard(&self, name: &str, backup_id: &BackupId) {
        match self.archive.remove(name, backup_id) {
            Ok(_) => debug!(module = name, backup = %backup_id, "discarded snapshot of rolled back apply"),
            Err(err) => warn!(module = name, backup = %backup_id, error = %err, "failed to discard snapshot"),
        }
    }

    /// Put `name` back on the revision stored under `backup_id`.
    ///
    /// Falls back to the module's known-good revision when the backup cannot
    /// be read. Returns whether the module now serves a restored revision.
    pub fn restore(&self, name: &str, backup_id: &BackupId) -> bool {
        let descriptor = match self.descriptor(name) {
            Ok(descriptor) => descriptor,
            Err(err) => {
                warn!(module = name, error = %err, "cannot restore unknown module");
                return false;
            }
        };
        let state = match self.archive.load(name, backup_id) {
            Ok(record) => ModuleState::new(record.fingerprint, record.payload),
            Err(err) => {
                warn!(module = name, backup = %backup_id, error = %err, "backup unreadable; trying known-good revision");
                match descriptor.contract.known_good() {
                    Some(state) => state,
                    None => return false,
                }
            }
        };
        match descriptor.contract.restore(&state) {
            Ok(()) => {
                info!(module = name, backup = %backup_id, fingerprint = %state.fingerprint, "module restored");
                true
            }
            Err(err) => {
                warn!(module = name, backup = %backup_id, error = %err, "restore failed");
                false
            }
        }
    }

    /// Resolve the revision an operator rollback should restore.
    ///
    /// With a target generation, the newest backup captured at that generation.
    /// Otherwise the newest backup that differs from the revision being served,
    /// or the known-good revision when no such backup exists.
    pub fn resolve(
        &self,
        name: &str,
        to_generation: Option<Generation>,
    ) -> Result<RestorePoint, ReloadError> {
        let descriptor = self.descriptor(name)?;
        let found = match to_generation {
            Some(generation) => {
                let entry = self.archive.find_generation(name, generation)?.ok_or_else(|| {
                    ReloadError::Persistence(format!("no backup of '{name}' at generation {generation}"))
                })?;
                let record = self.archive.load(name, &entry.id)?;
                Some((entry.id, record))
            }
            None => self.previous_revision(&descriptor)?,
        };

        match found {
            Some((id, record)) => Ok(RestorePoint {
                backup_id: Some(id),
                generation: record.generation,
                state: ModuleState::new(record.fingerprint, record.payload),
            }),
            None => {
                let state = descriptor.contract.known_good().ok_or_else(|| {
                    ReloadError::Persistence(format!("no backup or known-good revision for '{name}'"))
                })?;
                Ok(RestorePoint {
                    backup_id: None,
                    generation: 0,
                    state,
                })
            }
        }
    }

    fn previous_revision(
        &self,
        descriptor: &ModuleDescriptor,
    ) -> Result<Option<(BackupId, BackupRecord)>, ReloadError> {
        let name = descriptor.name.as_str();
        for entry in self.archive.list(name)?.into_iter().rev() {
            let record = match self.archive.load(name, &entry.id) {
                Ok(record) => record,
                Err(err) => {
                    warn!(module = name, backup = %entry.id, error = %err, "skipping unreadable backup");
                    continue;
                }
            };
            if record.fingerprint != descriptor.fingerprint {
                return Ok(Some((entry.id, record)));
            }
        }
        Ok(None)
    }

    pub fn list(&self, name: &str) -> Result<Vec<BackupEntry>, ReloadError> {
        Ok(self.archive.list(name)?)
    }

    pub fn prune(&self, name: &str, keep_last: usize) -> Result<usize, ReloadError> {
        let removed = self.archive.prune(name, keep_last)?;
        if removed > 0 {
            if let Some(metrics) = &self.metrics {
                metrics.record_backups_pruned(name, removed);
            }
        }
        Ok(removed)
    }
}
