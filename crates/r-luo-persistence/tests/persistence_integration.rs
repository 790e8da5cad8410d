//! ---
//! luo_section: "03-persistence-logging"
//! luo_subsection: "test"
//! luo_type: "source"
//! luo_scope: "test"
//! luo_description: "Persistence abstractions and storage bindings."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::sync::Arc;

use chrono::Utc;
use prometheus::Registry;
use r_luo_common::BackupFormat;
use r_luo_persistence::{
    read_audit_entries, AuditLogWriter, BackupArchive, BackupRecord, FileSignalChannel,
    PersistenceMetrics, SignalChannel, SyncSignal,
};
use serde_json::json;
use tempfile::tempdir;

#[test]
fn backups_survive_archive_restart_with_bounded_retention() {
    let dir = tempdir().unwrap();
    {
        let archive = BackupArchive::new(dir.path(), BackupFormat::Cbor, 2);
        for generation in 1..=3 {
            archive
                .write(&BackupRecord::new(
                    "pricing",
                    generation,
                    format!("fp-{generation}"),
                    json!({ "generation": generation }),
                ))
                .unwrap();
            archive.prune("pricing", archive.retain_last()).unwrap();
        }
        archive
            .write(&BackupRecord::new("rules", 1, "fp-r", json!(null)))
            .unwrap();
    }

    let reopened = BackupArchive::new(dir.path(), BackupFormat::Json, 2);
    let pricing = reopened.list("pricing").unwrap();
    assert_eq!(pricing.len(), 2);
    let latest = reopened.latest("pricing").unwrap().unwrap();
    let record = reopened.load("pricing", &latest.id).unwrap();
    assert_eq!(record.fingerprint, "fp-3");
    assert_eq!(reopened.list("rules").unwrap().len(), 1);
}

#[test]
fn audit_bytes_are_tracked_by_metrics() -> anyhow::Result<()> {
    let dir = tempdir()?;
    let registry = Arc::new(Registry::new());
    let metrics = PersistenceMetrics::new(Arc::clone(&registry))?;
    let mut writer = AuditLogWriter::open(dir.path(), 64 * 1024, 2)?;

    let (_, bytes_a) = writer.append(json!({"kind": "sync_propagation_error"}))?;
    let (_, bytes_b) = writer.append(json!({"kind": "apply_error", "module": "rules"}))?;
    metrics.record_audit_bytes(bytes_a + bytes_b);

    let entries = read_audit_entries(&writer.path())?;
    assert_eq!(entries.len(), 2);
    let families = registry.gather();
    let audit = families
        .iter()
        .find(|family| family.get_name() == "r_luo_audit_log_bytes_total")
        .expect("audit metric registered");
    assert_eq!(
        audit.get_metric()[0].get_counter().get_value(),
        (bytes_a + bytes_b) as f64
    );
    Ok(())
}

#[test]
fn sibling_channels_share_the_signal_file() {
    let dir = tempdir().unwrap();
    let signal_path = dir.path().join("signal.json");
    let writer = FileSignalChannel::new(&signal_path, dir.path().join("workers"));
    let reader = FileSignalChannel::new(&signal_path, dir.path().join("workers"));

    writer
        .publish(&SyncSignal {
            generation: 7,
            timestamp: Utc::now(),
            module_list: vec!["pricing".into(), "rules".into()],
            origin_process_id: "worker-1".into(),
        })
        .unwrap();

    let seen = reader.latest().unwrap().unwrap();
    assert_eq!(seen.generation, 7);
    assert_eq!(seen.module_list, vec!["pricing", "rules"]);
}
