//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Persistence abstractions and storage bindings."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_luo_common::{Generation, SyncConfig};
use serde::{Deserialize, Serialize};
use tempfile::NamedTempFile;
use tracing::warn;
use walkdir::WalkDir;

use crate::{file_safe, PersistenceError, Result};

/// Latest committed reload on this host. Overwritten, never appended.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncSignal {
    /// Generation committed by the origin process.
    pub generation: Generation,
    /// Time the signal was (re)written.
    pub timestamp: DateTime<Utc>,
    /// Modules applied in that generation.
    pub module_list: Vec<String>,
    /// Process that wrote the signal.
    pub origin_process_id: String,
}

/// Last generation a worker process reported as applied.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerSyncState {
    /// Reporting process.
    pub process_id: String,
    /// Generation the process has converged to.
    pub generation: Generation,
    /// Time of the report.
    pub updated_at: DateTime<Utc>,
}

/// Single-writer, multi-reader channel carrying the latest [`SyncSignal`].
///
/// Any poller reading after a publish observes that publish or a newer one;
/// intermediate signals may be skipped.
pub trait SignalChannel: Send + Sync {
    /// Replace the current signal.
    fn publish(&self, signal: &SyncSignal) -> Result<()>;
    /// Read the current signal; `Ok(None)` when nothing was published yet.
    fn latest(&self) -> Result<Option<SyncSignal>>;
    /// Record the generation a worker has reached.
    fn record_worker(&self, state: &WorkerSyncState) -> Result<()>;
    /// All worker reports, ordered by process id.
    fn workers(&self) -> Result<Vec<WorkerSyncState>>;
}

/// Signal record at a well-known path plus one ledger file per worker.
#[derive(Debug, Clone)]
pub struct FileSignalChannel {
    signal_path: PathBuf,
    worker_dir: PathBuf,
}

impl FileSignalChannel {
    /// Build a channel from explicit locations.
    pub fn new(signal_path: impl Into<PathBuf>, worker_dir: impl Into<PathBuf>) -> Self {
        Self {
            signal_path: signal_path.into(),
            worker_dir: worker_dir.into(),
        }
    }

    /// Build a channel from the `[sync]` configuration block.
    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(config.signal_path.clone(), config.worker_dir.clone())
    }

    /// Location of the signal record.
    pub fn signal_path(&self) -> &Path {
        &self.signal_path
    }
}

fn write_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };
    fs::create_dir_all(&parent)?;
    let mut file = NamedTempFile::new_in(&parent)?;
    file.write_all(&serde_json::to_vec_pretty(value)?)?;
    file.flush()?;
    file.persist(path).map_err(|err| PersistenceError::Io(err.error))?;
    Ok(())
}

impl SignalChannel for FileSignalChannel {
    fn publish(&self, signal: &SyncSignal) -> Result<()> {
        write_atomic(&self.signal_path, signal)
    }

    fn latest(&self) -> Result<Option<SyncSignal>> {
        let bytes = match fs::read(&self.signal_path) {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        Ok(Some(serde_json::from_slice(&bytes)?))
    }

    fn record_worker(&self, state: &WorkerSyncState) -> Result<()> {
        let path = self
            .worker_dir
            .join(format!("{}.json", file_safe(&state.process_id)));
        write_atomic(&path, state)
    }

    fn workers(&self) -> Result<Vec<WorkerSyncState>> {
        if !self.worker_dir.exists() {
            return Ok(Vec::new());
        }
        let mut workers = Vec::new();
        for entry in WalkDir::new(&self.worker_dir)
            .min_depth(1)
            .max_depth(1)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            let path = entry.path();
            if path.extension().and_then(|ext| ext.to_str()) != Some("json") {
                continue;
            }
            match fs::read(path)
                .map_err(PersistenceError::from)
                .and_then(|bytes| serde_json::from_slice::<WorkerSyncState>(&bytes).map_err(Into::into))
            {
                Ok(state) => workers.push(state),
                Err(err) => {
                    warn!(path = %path.display(), error = %err, "skipping unreadable worker ledger")
                }
            }
        }
        workers.sort_by(|a, b| a.process_id.cmp(&b.process_id));
        Ok(workers)
    }
}

/// In-memory channel shared between simulated sibling processes.
#[derive(Debug, Default)]
pub struct MemorySignalChannel {
    signal: Mutex<Option<SyncSignal>>,
    workers: Mutex<BTreeMap<String, WorkerSyncState>>,
    unavailable: AtomicBool,
}

impl MemorySignalChannel {
    /// Create an empty, available channel.
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate the shared location becoming unreachable (or reachable again).
    pub fn set_available(&self, available: bool) {
        self.unavailable.store(!available, Ordering::SeqCst);
    }

    fn ensure_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(PersistenceError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "signal channel unavailable",
            )));
        }
        Ok(())
    }
}

impl SignalChannel for MemorySignalChannel {
    fn publish(&self, signal: &SyncSignal) -> Result<()> {
        self.ensure_available()?;
        *self.signal.lock() = Some(signal.clone());
        Ok(())
    }

    fn latest(&self) -> Result<Option<SyncSignal>> {
        self.ensure_available()?;
        Ok(self.signal.lock().clone())
    }

    fn record_worker(&self, state: &WorkerSyncState) -> Result<()> {
        self.ensure_available()?;
        self.workers
            .lock()
            .insert(state.process_id.clone(), state.clone());
        Ok(())
    }

    fn workers(&self) -> Result<Vec<WorkerSyncState>> {
        self.ensure_available()?;
        Ok(self.workers.lock().values().cloned().collect())
    }
}
