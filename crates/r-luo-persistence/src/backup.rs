//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Persistence abstractions and storage bindings."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use r_luo_common::{BackupConfig, BackupFormat, Generation};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::{file_safe, PersistenceError, Result};

/// Current backup envelope version.
pub const BACKUP_VERSION: u16 = 1;

/// Implementation snapshot of one module, captured right before an apply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackupRecord {
    /// Module the snapshot belongs to.
    pub module_name: String,
    /// Generation the module was serving when captured.
    pub generation: Generation,
    /// Fingerprint of the captured implementation.
    pub fingerprint: String,
    /// Module-defined payload sufficient to restore the implementation.
    #[serde(default)]
    pub payload: serde_json::Value,
    /// Timestamp when the snapshot was taken.
    pub created_at: DateTime<Utc>,
}

impl BackupRecord {
    /// Construct a record from raw components.
    pub fn new(
        module_name: impl Into<String>,
        generation: Generation,
        fingerprint: impl Into<String>,
        payload: serde_json::Value,
    ) -> Self {
        Self {
            module_name: module_name.into(),
            generation,
            fingerprint: fingerprint.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct BackupEnvelope {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
    record: BackupRecord,
}

/// Identifier of one retained backup (the file stem within the module directory).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BackupId(String);

impl BackupId {
    /// Wrap a raw identifier.
    pub fn new(raw: impl Into<String>) -> Self {
        Self(raw.into())
    }

    /// Borrow the identifier as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    fn generation(&self) -> Option<Generation> {
        self.0.rsplit('-').next()?.parse().ok()
    }
}

impl fmt::Display for BackupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Listing entry for a retained backup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BackupEntry {
    /// Backup identifier.
    pub id: BackupId,
    /// Generation recorded in the identifier.
    pub generation: Generation,
    /// Location of the envelope on disk.
    pub path: PathBuf,
}

/// Per-module ring of hashed backup envelopes on the local filesystem.
///
/// Layout: `<root>/<module>/<millis>-<seq>-<generation>.<json|cbor>`, all
/// numbers zero padded so lexical order equals creation order.
#[derive(Debug)]
pub struct BackupArchive {
    root: PathBuf,
    format: BackupFormat,
    retain_last: usize,
    sequence: AtomicU64,
}

impl BackupArchive {
    /// Build an archive rooted at `root`.
    pub fn new(root: impl Into<PathBuf>, format: BackupFormat, retain_last: usize) -> Self {
        Self {
            root: root.into(),
            format,
            retain_last: retain_last.max(1),
            sequence: AtomicU64::new(0),
        }
    }

    /// Build an archive from the `[backup]` configuration block.
    pub fn from_config(config: &BackupConfig) -> Self {
        Self::new(config.directory.clone(), config.format, config.retain_last)
    }

    /// Root directory of the archive.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Configured retention per module.
    pub fn retain_last(&self) -> usize {
        self.retain_last
    }

    fn module_dir(&self, module: &str) -> PathBuf {
        self.root.join(file_safe(module))
    }

    /// Persist a record and return its listing entry.
    pub fn write(&self, record: &BackupRecord) -> Result<BackupEntry> {
        let dir = self.module_dir(&record.module_name);
        fs::create_dir_all(&dir)?;

        let sequence = self.sequence.fetch_add(1, Ordering::SeqCst);
        let id = BackupId(format!(
            "{:013}-{:06}-{:020}",
            record.created_at.timestamp_millis().max(0),
            sequence % 1_000_000,
            record.generation
        ));
        let path = dir.join(format!("{}.{}", id, self.format.extension()));

        let envelope = BackupEnvelope {
            version: BACKUP_VERSION,
            created_at: Utc::now(),
            hash: compute_hash(record)?,
            record: record.clone(),
        };

        let mut writer = BufWriter::new(File::create(&path)?);
        match self.format {
            BackupFormat::Cbor => {
                let bytes = serde_cbor::to_vec(&envelope).map_err(PersistenceError::from)?;
                writer.write_all(&bytes)?;
            }
            BackupFormat::Json => {
                let json = serde_json::to_vec_pretty(&envelope)?;
                writer.write_all(&json)?;
            }
        }
        writer.flush()?;
        debug!(module = %record.module_name, backup = %id, path = %path.display(), "backup written");

        Ok(BackupEntry {
            id,
            generation: record.generation,
            path,
        })
    }

    /// Retained backups for `module`, oldest first.
    pub fn list(&self, module: &str) -> Result<Vec<BackupEntry>> {
        let dir = self.module_dir(module);
        if !dir.exists() {
            return Ok(Vec::new());
        }
        let mut entries = Vec::new();
        for entry in WalkDir::new(&dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if !entry.file_type().is_file() || envelope_format(path).is_none() {
                continue;
            }
            let Some(stem) = path.file_stem().and_then(|stem| stem.to_str()) else {
                continue;
            };
            let id = BackupId::new(stem);
            let Some(generation) = id.generation() else {
                warn!(path = %path.display(), "ignoring backup with unparseable name");
                continue;
            };
            entries.push(BackupEntry {
                id,
                generation,
                path: path.to_path_buf(),
            });
        }
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(entries)
    }

    /// Most recent retained backup for `module`.
    pub fn latest(&self, module: &str) -> Result<Option<BackupEntry>> {
        Ok(self.list(module)?.pop())
    }

    /// Most recent retained backup for `module` captured at `generation`.
    pub fn find_generation(
        &self,
        module: &str,
        generation: Generation,
    ) -> Result<Option<BackupEntry>> {
        Ok(self
            .list(module)?
            .into_iter()
            .rev()
            .find(|entry| entry.generation == generation))
    }

    /// Load and verify a backup by identifier.
    pub fn load(&self, module: &str, id: &BackupId) -> Result<BackupRecord> {
        let entry = self
            .list(module)?
            .into_iter()
            .find(|entry| &entry.id == id)
            .ok_or_else(|| PersistenceError::NotFound(format!("{module}/{id}")))?;
        load_record(&entry.path)
    }

    /// Delete one backup. Missing entries are not an error.
    pub fn remove(&self, module: &str, id: &BackupId) -> Result<bool> {
        let Some(entry) = self.list(module)?.into_iter().find(|entry| &entry.id == id) else {
            return Ok(false);
        };
        fs::remove_file(&entry.path)?;
        debug!(module, backup = %id, "backup removed");
        Ok(true)
    }

    /// Drop all but the newest `keep_last` backups; returns the number removed.
    pub fn prune(&self, module: &str, keep_last: usize) -> Result<usize> {
        let entries = self.list(module)?;
        let keep_last = keep_last.max(1);
        if entries.len() <= keep_last {
            return Ok(0);
        }
        let excess = entries.len() - keep_last;
        for entry in entries.iter().take(excess) {
            debug!(module, backup = %entry.id, "pruning backup");
            fs::remove_file(&entry.path)?;
        }
        Ok(excess)
    }
}

fn envelope_format(path: &Path) -> Option<BackupFormat> {
    match path.extension().and_then(|ext| ext.to_str()) {
        Some("json") => Some(BackupFormat::Json),
        Some("cbor") => Some(BackupFormat::Cbor),
        _ => None,
    }
}

fn load_envelope(path: &Path) -> Result<BackupEnvelope> {
    let mut file = File::open(path)?;
    let mut bytes = Vec::new();
    file.read_to_end(&mut bytes)?;
    let envelope = match envelope_format(path) {
        Some(BackupFormat::Cbor) => serde_cbor::from_slice(&bytes).map_err(PersistenceError::from)?,
        _ => serde_json::from_slice(&bytes)?,
    };
    Ok(envelope)
}

/// Load a backup file and verify its hash.
pub fn load_record(path: &Path) -> Result<BackupRecord> {
    let envelope = load_envelope(path)?;
    let expected = compute_hash(&envelope.record)?;
    if envelope.hash != expected {
        return Err(PersistenceError::HashMismatch(path.display().to_string()));
    }
    Ok(envelope.record)
}

/// Verify the integrity of a backup without returning the payload.
pub fn verify_backup(path: &Path) -> bool {
    match load_envelope(path) {
        Ok(envelope) => compute_hash(&envelope.record)
            .map(|hash| hash == envelope.hash)
            .unwrap_or(false),
        Err(_) => false,
    }
}

fn compute_hash(record: &BackupRecord) -> Result<String> {
    let serialized = serde_json::to_vec(record)?;
    let mut hasher = Sha256::new();
    hasher.update(serialized);
    Ok(hex::encode(hasher.finalize()))
}
