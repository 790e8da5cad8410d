//! ---
//! luo_section: "04-configuration-orchestration"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Live update orchestration core."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use r_luo_common::ModuleKind;
use r_luo_registry::{ChangeMarker, Fingerprint, ModuleDescriptor, ModuleRegistry};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::ReloadError;

/// What started a scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    Scheduled,
    Manual,
}

impl Trigger {
    pub fn as_str(&self) -> &'static str {
        match self {
            Trigger::Scheduled => "scheduled",
            Trigger::Manual => "manual",
        }
    }
}

/// Which modules a scan covers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScanScope {
    All,
    Kind(ModuleKind),
    Modules(Vec<String>),
}

/// A module whose source no longer matches the last observed fingerprint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub module_name: String,
    pub old_fingerprint: Fingerprint,
    pub new_fingerprint: Fingerprint,
    pub detected_at: DateTime<Utc>,
    pub trigger: Trigger,
}

#[derive(Debug, Clone)]
struct Observation {
    marker: Option<ChangeMarker>,
    fingerprint: Fingerprint,
}

/// Compares each module's source fingerprint with the last one observed.
///
/// The cheap change marker is checked first; content is hashed only when the
/// marker moved or the module has none. A source that cannot be read is
/// logged and treated as unchanged.
pub struct ChangeDetector {
    registry: Arc<ModuleRegistry>,
    observed: Mutex<HashMap<String, Observation>>,
    scans: AtomicU64,
    detections: AtomicU64,
}

impl std::fmt::Debug for ChangeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChangeDetector")
            .field("scans", &self.scan_count())
            .field("detections", &self.detection_count())
            .finish_non_exhaustive()
    }
}

impl ChangeDetector {
    pub fn new(registry: Arc<ModuleRegistry>) -> Self {
        Self {
            registry,
            observed: Mutex::new(HashMap::new()),
            scans: AtomicU64::new(0),
            detections: AtomicU64::new(0),
        }
    }

    pub fn scan_count(&self) -> u64 {
        self.scans.load(Ordering::SeqCst)
    }

    /// Number of change events this detector has emitted.
    pub fn detection_count(&self) -> u64 {
        self.detections.load(Ordering::SeqCst)
    }

    pub fn scan(&self, scope: &ScanScope, trigger: Trigger) -> Result<Vec<ChangeEvent>, ReloadError> {
        let descriptors = self.select(scope)?;
        self.scans.fetch_add(1, Ordering::SeqCst);

        let mut events = Vec::new();
        for descriptor in descriptors {
            if let Some(event) = self.inspect(&descriptor, trigger) {
                events.push(event);
            }
        }
        if !events.is_empty() {
            self.detections
                .fetch_add(events.len() as u64, Ordering::SeqCst);
            info!(
                trigger = trigger.as_str(),
                modules = ?events.iter().map(|e| e.module_name.as_str()).collect::<Vec<_>>(),
                "detected source changes"
            );
        }
        Ok(events)
    }

    fn select(&self, scope: &ScanScope) -> Result<Vec<Arc<ModuleDescriptor>>, ReloadError> {
        match scope {
            ScanScope::All => Ok(self.registry.list()),
            ScanScope::Kind(kind) => Ok(self
                .registry
                .list()
                .into_iter()
                .filter(|descriptor| descriptor.kind == *kind)
                .collect()),
            ScanScope::Modules(names) => names
                .iter()
                .map(|name| {
                    self.registry.get(name).ok_or_else(|| {
                        ReloadError::from(r_luo_registry::RegistryError::UnknownModule(
                            name.clone(),
                        ))
                    })
                })
                .collect(),
        }
    }

    fn inspect(&self, descriptor: &ModuleDescriptor, trigger: Trigger) -> Option<ChangeEvent> {
        let previous = self
            .observed
            .lock()
            .get(&descriptor.name)
            .cloned()
            .unwrap_or_else(|| Observation {
                marker: None,
                fingerprint: descriptor.fingerprint.clone(),
            });

        // marker first, then hash: a write racing the hash only re-triggers hashing later
        let marker = descriptor.contract.change_marker();
        if marker.is_some() && marker == previous.marker {
            return None;
        }

        let fingerprint = match descriptor.contract.source_fingerprint() {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                let error = ReloadError::Detection {
                    module: descriptor.name.clone(),
                    reason: err.to_string(),
                };
                warn!(module = %descriptor.name, error = %error, "fingerprint source unavailable; treating as unchanged");
                return None;
            }
        };

        self.observed.lock().insert(
            descriptor.name.clone(),
            Observation {
                marker,
                fingerprint: fingerprint.clone(),
            },
        );

        if fingerprint == previous.fingerprint {
            return None;
        }
        debug!(module = %descriptor.name, old = %previous.fingerprint, new = %fingerprint, "fingerprint changed");
        Some(ChangeEvent {
            module_name: descriptor.name.clone(),
            old_fingerprint: previous.fingerprint,
            new_fingerprint: fingerprint,
            detected_at: Utc::now(),
            trigger,
        })
    }

    /// Record the fingerprint a module just loaded so it is not reported again.
    ///
    /// The marker is cleared, forcing one hash on the next scan in case the
    /// source moved after the load.
    pub fn acknowledge(&self, name: &str, fingerprint: Fingerprint) {
        self.observed.lock().insert(
            name.to_owned(),
            Observation {
                marker: None,
                fingerprint,
            },
        );
    }

    /// Re-baseline a module on its current source.
    ///
    /// Used after a rollback so the restored revision is not flagged as a change.
    pub fn reset(&self, name: &str) {
        let Some(descriptor) = self.registry.get(name) else {
            return;
        };
        let marker = descriptor.contract.change_marker();
        let fingerprint = descriptor
            .contract
            .source_fingerprint()
            .unwrap_or_else(|_| descriptor.fingerprint.clone());
        self.observed
            .lock()
            .insert(name.to_owned(), Observation { marker, fingerprint });
    }

    /// Forget what was observed; the next scan compares against the active fingerprint.
    pub fn invalidate(&self, name: &str) {
        self.observed.lock().remove(name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::RwLock;
    use r_luo_registry::{ContractError, ModuleSpec, ModuleState, ReloadContract};
    use std::sync::atomic::AtomicUsize;

    #[derive(Default)]
    struct Source {
        fingerprint: RwLock<String>,
        marker: RwLock<Option<u64>>,
        hashes: AtomicUsize,
        offline: RwLock<bool>,
    }

    impl ReloadContract for Source {
        fn current_fingerprint(&self) -> Fingerprint {
            "v1".into()
        }

        fn source_fingerprint(&self) -> Result<Fingerprint, ContractError> {
            if *self.offline.read() {
                return Err(ContractError::SourceUnavailable("offline".into()));
            }
            self.hashes.fetch_add(1, Ordering::SeqCst);
            Ok(self.fingerprint.read().clone())
        }

        fn change_marker(&self) -> Option<ChangeMarker> {
            self.marker
                .read()
                .map(|len| ChangeMarker { modified: None, len })
        }

        fn reload(&self) -> Result<Fingerprint, ContractError> {
            Ok(self.fingerprint.read().clone())
        }

        fn capture(&self) -> Result<ModuleState, ContractError> {
            Ok(ModuleState::new("v1", serde_json::Value::Null))
        }

        fn restore(&self, _state: &ModuleState) -> Result<(), ContractError> {
            Ok(())
        }
    }

    fn setup() -> (Arc<Source>, ChangeDetector) {
        let source = Arc::new(Source::default());
        *source.fingerprint.write() = "v1".into();
        let registry = Arc::new(ModuleRegistry::new());
        registry
            .register(ModuleSpec::new("rules", ModuleKind::Rule, source.clone()))
            .unwrap();
        (source, ChangeDetector::new(registry))
    }

    #[test]
    fn reports_each_change_once() {
        let (source, detector) = setup();
        assert!(detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap().is_empty());

        *source.fingerprint.write() = "v2".into();
        let events = detector.scan(&ScanScope::All, Trigger::Manual).unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].old_fingerprint, "v1");
        assert_eq!(events[0].new_fingerprint, "v2");
        assert_eq!(events[0].trigger, Trigger::Manual);

        assert!(detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap().is_empty());
        assert_eq!(detector.detection_count(), 1);
        assert_eq!(detector.scan_count(), 3);
    }

    #[test]
    fn unchanged_marker_skips_hashing() {
        let (source, detector) = setup();
        *source.marker.write() = Some(10);
        detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap();
        let hashes = source.hashes.load(Ordering::SeqCst);

        detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap();
        assert_eq!(source.hashes.load(Ordering::SeqCst), hashes);

        *source.marker.write() = Some(11);
        detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap();
        assert_eq!(source.hashes.load(Ordering::SeqCst), hashes + 1);
    }

    #[test]
    fn unreachable_source_is_not_a_change() {
        let (source, detector) = setup();
        *source.offline.write() = true;
        assert!(detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap().is_empty());

        *source.offline.write() = false;
        *source.fingerprint.write() = "v2".into();
        assert_eq!(detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap().len(), 1);
    }

    #[test]
    fn scope_filters_by_kind_and_rejects_unknown_names() {
        let (source, detector) = setup();
        *source.fingerprint.write() = "v2".into();
        assert!(detector
            .scan(&ScanScope::Kind(ModuleKind::Cache), Trigger::Scheduled)
            .unwrap()
            .is_empty());
        assert_eq!(
            detector
                .scan(&ScanScope::Kind(ModuleKind::Rule), Trigger::Scheduled)
                .unwrap()
                .len(),
            1
        );
        let err = detector
            .scan(&ScanScope::Modules(vec!["ghost".into()]), Trigger::Manual)
            .unwrap_err();
        assert_eq!(err.kind(), "registry_error");
    }

    #[test]
    fn reset_rebaselines_on_current_source() {
        let (source, detector) = setup();
        *source.fingerprint.write() = "v2".into();
        detector.reset("rules");
        assert!(detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap().is_empty());

        detector.invalidate("rules");
        assert_eq!(detector.scan(&ScanScope::All, Trigger::Scheduled).unwrap().len(), 1);
    }
}
