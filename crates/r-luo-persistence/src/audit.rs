//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Persistence abstractions and storage bindings."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::Digest;
use tracing::debug;

use crate::{backup::BACKUP_VERSION, Result};

const ACTIVE_FILE: &str = "audit.log";

/// Audit log file header stored as the first line of every file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct AuditLogHeader {
    version: u16,
    created_at: DateTime<Utc>,
    hash: String,
}

impl AuditLogHeader {
    fn new() -> Self {
        let created_at = Utc::now();
        let hash = format!(
            "{:x}",
            sha2::Sha256::digest(created_at.to_rfc3339().as_bytes())
        );
        Self {
            version: BACKUP_VERSION,
            created_at,
            hash,
        }
    }
}

/// One audit record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Sequential identifier assigned when appending; continues across rotations.
    pub sequence: u64,
    /// Timestamp when the record was appended.
    pub timestamp: DateTime<Utc>,
    /// Arbitrary JSON payload describing the audited event.
    pub payload: serde_json::Value,
}

/// Append-only JSONL writer with size based rotation.
///
/// The active file is `audit.log`; rotated files are `audit.log.1` (newest)
/// through `audit.log.<max_files - 1>` (oldest).
pub struct AuditLogWriter {
    directory: PathBuf,
    max_bytes: u64,
    max_files: usize,
    writer: BufWriter<File>,
    current_bytes: u64,
    next_sequence: u64,
}

impl AuditLogWriter {
    /// Open (or create) the active log inside `directory`.
    pub fn open(directory: &Path, max_bytes: u64, max_files: usize) -> Result<Self> {
        fs::create_dir_all(directory)?;
        let path = directory.join(ACTIVE_FILE);
        let last_sequence = if path.exists() {
            determine_last_sequence(&path)?
        } else {
            0
        };
        let (writer, current_bytes) = open_active(&path)?;
        Ok(Self {
            directory: directory.to_path_buf(),
            max_bytes: max_bytes.max(1),
            max_files: max_files.max(1),
            writer,
            current_bytes,
            next_sequence: last_sequence,
        })
    }

    /// Path of the active file.
    pub fn path(&self) -> PathBuf {
        self.directory.join(ACTIVE_FILE)
    }

    /// Append a payload and return the assigned sequence number and byte count.
    pub fn append(&mut self, payload: serde_json::Value) -> Result<(u64, usize)> {
        self.next_sequence += 1;
        let entry = AuditEntry {
            sequence: self.next_sequence,
            timestamp: Utc::now(),
            payload,
        };
        let line = serde_json::to_string(&entry)?;
        let bytes = line.len() + 1;
        if self.current_bytes + bytes as u64 > self.max_bytes {
            self.rotate()?;
        }
        self.writer.write_all(line.as_bytes())?;
        self.writer.write_all(b"\n")?;
        self.writer.flush()?;
        self.current_bytes += bytes as u64;
        Ok((entry.sequence, bytes))
    }

    /// All files currently on disk, newest first, active file included.
    pub fn files(&self) -> Vec<PathBuf> {
        let mut files = vec![self.path()];
        for index in 1..self.max_files {
            let path = self.rotated_path(index);
            if path.exists() {
                files.push(path);
            }
        }
        files
    }

    fn rotated_path(&self, index: usize) -> PathBuf {
        self.directory.join(format!("{ACTIVE_FILE}.{index}"))
    }

    fn rotate(&mut self) -> Result<()> {
        self.writer.flush()?;
        let active = self.path();
        if self.max_files <= 1 {
            fs::remove_file(&active)?;
        } else {
            for index in (1..self.max_files).rev() {
                let source = if index == 1 {
                    active.clone()
                } else {
                    self.rotated_path(index - 1)
                };
                let target = self.rotated_path(index);
                if source.exists() {
                    if target.exists() {
                        fs::remove_file(&target)?;
                    }
                    fs::rename(&source, &target)?;
                }
            }
        }
        let (writer, current_bytes) = open_active(&active)?;
        self.writer = writer;
        self.current_bytes = current_bytes;
        debug!(directory = %self.directory.display(), "audit log rotated");
        Ok(())
    }
}

fn open_active(path: &Path) -> Result<(BufWriter<File>, u64)> {
    let file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut writer = BufWriter::new(file);
    let existing = fs::metadata(path)?.len();
    if existing > 0 {
        return Ok((writer, existing));
    }
    let header = serde_json::to_string(&AuditLogHeader::new())?;
    writer.write_all(header.as_bytes())?;
    writer.write_all(b"\n")?;
    writer.flush()?;
    Ok((writer, header.len() as u64 + 1))
}

fn determine_last_sequence(path: &Path) -> Result<u64> {
    let mut last = 0u64;
    for entry in read_entries(path)? {
        last = entry.sequence;
    }
    Ok(last)
}

/// Read every entry in one audit file, skipping the header and unparseable lines.
pub fn read_entries(path: &Path) -> Result<Vec<AuditEntry>> {
    let file = File::open(path)?;
    let reader = BufReader::new(file);
    let mut entries = Vec::new();
    for line in reader.lines().skip(1) {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        if let Ok(entry) = serde_json::from_str::<AuditEntry>(&line) {
            entries.push(entry);
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn append_and_read_back() {
        let dir = tempdir().unwrap();
        let mut writer = AuditLogWriter::open(dir.path(), 1024 * 1024, 3).unwrap();
        writer.append(json!({"kind": "apply_error"})).unwrap();
        writer.append(json!({"kind": "reload"})).unwrap();

        let entries = read_entries(&writer.path()).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].payload["kind"], "apply_error");
        assert_eq!(entries[1].sequence, 2);
    }

    #[test]
    fn rotation_keeps_bounded_file_count() {
        let dir = tempdir().unwrap();
        let mut writer = AuditLogWriter::open(dir.path(), 256, 3).unwrap();
        for index in 0..40 {
            writer
                .append(json!({"kind": "reload", "module": format!("m{index}")}))
                .unwrap();
        }
        let files = writer.files();
        assert_eq!(files.len(), 3);
        assert!(!dir.path().join("audit.log.3").exists());

        let newest = read_entries(&files[0]).unwrap();
        assert_eq!(newest.last().unwrap().sequence, 40);
    }

    #[test]
    fn reopening_continues_sequence() {
        let dir = tempdir().unwrap();
        {
            let mut writer = AuditLogWriter::open(dir.path(), 4096, 2).unwrap();
            writer.append(json!({"n": 1})).unwrap();
            writer.append(json!({"n": 2})).unwrap();
        }
        let mut writer = AuditLogWriter::open(dir.path(), 4096, 2).unwrap();
        let (sequence, _) = writer.append(json!({"n": 3})).unwrap();
        assert_eq!(sequence, 3);
    }
}
