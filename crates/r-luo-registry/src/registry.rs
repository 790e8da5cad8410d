//! ---
//! luo_section: "02-module-registry"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Hot-swappable module registry and reload contracts."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;
use r_luo_common::{Generation, ModuleKind};
use tracing::{debug, info};

use crate::contract::{Fingerprint, ReloadContract};

/// Registration and lookup failures.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("module '{0}' is already registered")]
    Duplicate(String),
    #[error("module '{0}' is not registered")]
    UnknownModule(String),
    #[error("module '{module}' depends on unknown module '{dependency}'")]
    UnknownDependency { module: String, dependency: String },
    #[error("dependency cycle detected involving module '{0}'")]
    Cycle(String),
}

/// Registration request for one module.
pub struct ModuleSpec {
    pub name: String,
    pub kind: ModuleKind,
    pub dependency_names: Vec<String>,
    pub contract: Arc<dyn ReloadContract>,
}

impl ModuleSpec {
    pub fn new(name: impl Into<String>, kind: ModuleKind, contract: Arc<dyn ReloadContract>) -> Self {
        Self {
            name: name.into(),
            kind,
            dependency_names: Vec::new(),
            contract,
        }
    }

    pub fn depends_on<I, S>(mut self, dependencies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependency_names
            .extend(dependencies.into_iter().map(Into::into));
        self
    }
}

/// Immutable view of a registered module. Updates publish a new descriptor.
#[derive(Clone)]
pub struct ModuleDescriptor {
    pub name: String,
    pub kind: ModuleKind,
    pub dependency_names: Vec<String>,
    pub contract: Arc<dyn ReloadContract>,
    pub fingerprint: Fingerprint,
    pub generation: Generation,
    pub last_reload_time: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub reload_count: u64,
    /// Registration position, used to break topological ties.
    pub order: usize,
}

impl fmt::Debug for ModuleDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleDescriptor")
            .field("name", &self.name)
            .field("kind", &self.kind)
            .field("dependency_names", &self.dependency_names)
            .field("fingerprint", &self.fingerprint)
            .field("generation", &self.generation)
            .field("last_reload_time", &self.last_reload_time)
            .field("last_error", &self.last_error)
            .field("reload_count", &self.reload_count)
            .field("order", &self.order)
            .finish_non_exhaustive()
    }
}

type Table = IndexMap<String, Arc<ModuleDescriptor>>;

/// In-memory index of hot-swappable units.
///
/// Readers load the current table without locking. Writers serialize on a
/// mutex, clone the table, and publish the copy with one atomic swap.
pub struct ModuleRegistry {
    table: ArcSwap<Table>,
    writer: Mutex<()>,
}

impl Default for ModuleRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for ModuleRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleRegistry")
            .field("modules", &self.names())
            .finish()
    }
}

impl ModuleRegistry {
    pub fn new() -> Self {
        Self {
            table: ArcSwap::from_pointee(IndexMap::new()),
            writer: Mutex::new(()),
        }
    }

    pub fn register(&self, spec: ModuleSpec) -> Result<(), RegistryError> {
        self.register_all(vec![spec])
    }

    /// Register a batch. Any duplicate, unknown dependency or cycle rejects the whole batch.
    pub fn register_all(&self, specs: Vec<ModuleSpec>) -> Result<(), RegistryError> {
        let _guard = self.writer.lock();
        let current = self.table.load_full();

        {
            let mut batch: HashSet<&str> = HashSet::new();
            for spec in &specs {
                if current.contains_key(&spec.name) || !batch.insert(spec.name.as_str()) {
                    return Err(RegistryError::Duplicate(spec.name.clone()));
                }
            }
            for spec in &specs {
                for dependency in &spec.dependency_names {
                    if !current.contains_key(dependency) && !batch.contains(dependency.as_str()) {
                        return Err(RegistryError::UnknownDependency {
                            module: spec.name.clone(),
                            dependency: dependency.clone(),
                        });
                    }
                }
            }

            let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();
            let edges = current
                .values()
                .map(|descriptor| (descriptor.name.as_str(), &descriptor.dependency_names))
                .chain(
                    specs
                        .iter()
                        .map(|spec| (spec.name.as_str(), &spec.dependency_names)),
                );
            for (name, dependencies) in edges {
                graph.add_node(name);
                for dependency in dependencies {
                    graph.add_edge(dependency.as_str(), name, ());
                }
            }
            if let Err(cycle) = toposort(&graph, None) {
                return Err(RegistryError::Cycle(cycle.node_id().to_owned()));
            }
        }

        let mut next: Table = (*current).clone();
        let base = next.len();
        for (offset, spec) in specs.into_iter().enumerate() {
            let fingerprint = spec.contract.current_fingerprint();
            info!(
                module = %spec.name,
                kind = %spec.kind,
                dependencies = ?spec.dependency_names,
                fingerprint = %fingerprint,
                "registered module"
            );
            let descriptor = ModuleDescriptor {
                name: spec.name.clone(),
                kind: spec.kind,
                dependency_names: spec.dependency_names,
                contract: spec.contract,
                fingerprint,
                generation: 0,
                last_reload_time: None,
                last_error: None,
                reload_count: 0,
                order: base + offset,
            };
            next.insert(spec.name, Arc::new(descriptor));
        }
        self.table.store(Arc::new(next));
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<Arc<ModuleDescriptor>> {
        self.table.load().get(name).cloned()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.table.load().contains_key(name)
    }

    /// All descriptors in registration order.
    pub fn list(&self) -> Vec<Arc<ModuleDescriptor>> {
        self.table.load().values().cloned().collect()
    }

    pub fn names(&self) -> Vec<String> {
        self.table.load().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.table.load().len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.load().is_empty()
    }

    /// Transitive dependents of `name`, in registration order, excluding `name`.
    pub fn dependents_of(&self, name: &str) -> Result<Vec<String>, RegistryError> {
        let table = self.table.load_full();
        if !table.contains_key(name) {
            return Err(RegistryError::UnknownModule(name.to_owned()));
        }
        let reverse = reverse_edges(&table);
        let mut dependents: Vec<&str> = closure(&reverse, [name])
            .into_iter()
            .filter(|candidate| *candidate != name)
            .collect();
        dependents.sort_by_key(|candidate| table[*candidate].order);
        Ok(dependents.into_iter().map(str::to_owned).collect())
    }

    /// Topological order of `changed` plus every transitive dependent.
    ///
    /// Ties between independent modules are broken by registration order.
    pub fn dependency_order(
        &self,
        changed: &[String],
    ) -> Result<Vec<Arc<ModuleDescriptor>>, RegistryError> {
        let table = self.table.load_full();
        for name in changed {
            if !table.contains_key(name) {
                return Err(RegistryError::UnknownModule(name.clone()));
            }
        }
        let reverse = reverse_edges(&table);
        let selected = closure(&reverse, changed.iter().map(String::as_str));

        let mut indegree: HashMap<&str, usize> =
            selected.iter().map(|name| (*name, 0usize)).collect();
        for name in &selected {
            for dependency in &table[*name].dependency_names {
                if selected.contains(dependency.as_str()) {
                    if let Some(count) = indegree.get_mut(name) {
                        *count += 1;
                    }
                }
            }
        }

        let mut ready: BinaryHeap<Reverse<(usize, &str)>> = indegree
            .iter()
            .filter(|(_, count)| **count == 0)
            .map(|(name, _)| Reverse((table[*name].order, *name)))
            .collect();
        let mut ordered = Vec::with_capacity(selected.len());
        while let Some(Reverse((_, name))) = ready.pop() {
            ordered.push(Arc::clone(&table[name]));
            let Some(children) = reverse.get(name) else {
                continue;
            };
            for child in children {
                if let Some(count) = indegree.get_mut(child) {
                    *count -= 1;
                    if *count == 0 {
                        ready.push(Reverse((table[*child].order, *child)));
                    }
                }
            }
        }
        debug!(
            changed = ?changed,
            planned = ?ordered.iter().map(|d| d.name.as_str()).collect::<Vec<_>>(),
            "computed dependency order"
        );
        Ok(ordered)
    }

    /// Publish a successful reload for `name`.
    pub fn record_reload(
        &self,
        name: &str,
        fingerprint: Fingerprint,
        generation: Generation,
        at: DateTime<Utc>,
    ) -> Result<Arc<ModuleDescriptor>, RegistryError> {
        self.update(name, |descriptor| {
            descriptor.fingerprint = fingerprint;
            descriptor.generation = generation;
            descriptor.last_reload_time = Some(at);
            descriptor.last_error = None;
            descriptor.reload_count += 1;
        })
    }

    /// Remember the last failure without touching the active fingerprint.
    pub fn record_failure(
        &self,
        name: &str,
        error: impl Into<String>,
    ) -> Result<Arc<ModuleDescriptor>, RegistryError> {
        let error = error.into();
        self.update(name, |descriptor| descriptor.last_error = Some(error))
    }

    /// Publish a restored backup as the active revision.
    pub fn record_restore(
        &self,
        name: &str,
        fingerprint: Fingerprint,
        generation: Generation,
    ) -> Result<Arc<ModuleDescriptor>, RegistryError> {
        self.update(name, |descriptor| {
            descriptor.fingerprint = fingerprint;
            descriptor.generation = generation;
            descriptor.last_reload_time = Some(Utc::now());
        })
    }

    fn update<F>(&self, name: &str, apply: F) -> Result<Arc<ModuleDescriptor>, RegistryError>
    where
        F: FnOnce(&mut ModuleDescriptor),
    {
        let _guard = self.writer.lock();
        let current = self.table.load_full();
        let existing = current
            .get(name)
            .ok_or_else(|| RegistryError::UnknownModule(name.to_owned()))?;
        let mut updated = ModuleDescriptor::clone(existing);
        apply(&mut updated);
        let updated = Arc::new(updated);
        let mut next: Table = (*current).clone();
        next.insert(name.to_owned(), Arc::clone(&updated));
        self.table.store(Arc::new(next));
        Ok(updated)
    }
}

fn reverse_edges(table: &Table) -> HashMap<&str, Vec<&str>> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for descriptor in table.values() {
        for dependency in &descriptor.dependency_names {
            reverse
                .entry(dependency.as_str())
                .or_default()
                .push(descriptor.name.as_str());
        }
    }
    reverse
}

fn closure<'a, I>(reverse: &HashMap<&'a str, Vec<&'a str>>, roots: I) -> HashSet<&'a str>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut seen = HashSet::new();
    let mut queue: VecDeque<&'a str> = roots.into_iter().collect();
    while let Some(name) = queue.pop_front() {
        if !seen.insert(name) {
            continue;
        }
        if let Some(children) = reverse.get(name) {
            queue.extend(children.iter().copied());
        }
    }
    seen
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::contract::{ContractError, ModuleState};

    struct Fixed(&'static str);

    impl ReloadContract for Fixed {
        fn current_fingerprint(&self) -> Fingerprint {
            self.0.to_owned()
        }

        fn source_fingerprint(&self) -> Result<Fingerprint, ContractError> {
            Ok(self.0.to_owned())
        }

        fn reload(&self) -> Result<Fingerprint, ContractError> {
            Ok(self.0.to_owned())
        }

        fn capture(&self) -> Result<ModuleState, ContractError> {
            Ok(ModuleState::new(self.0, serde_json::Value::Null))
        }

        fn restore(&self, _state: &ModuleState) -> Result<(), ContractError> {
            Ok(())
        }
    }

    fn spec(name: &str) -> ModuleSpec {
        ModuleSpec::new(name, ModuleKind::Config, Arc::new(Fixed("v1")))
    }

    fn names(order: &[Arc<ModuleDescriptor>]) -> Vec<&str> {
        order.iter().map(|d| d.name.as_str()).collect()
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let registry = ModuleRegistry::new();
        registry.register(spec("pricing")).unwrap();
        assert_eq!(
            registry.register(spec("pricing")),
            Err(RegistryError::Duplicate("pricing".into()))
        );
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn unknown_dependency_is_rejected() {
        let registry = ModuleRegistry::new();
        let err = registry
            .register(spec("rules").depends_on(["pricing"]))
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownDependency { .. }));
        assert!(registry.is_empty());
    }

    #[test]
    fn self_dependency_is_a_cycle() {
        let registry = ModuleRegistry::new();
        let err = registry
            .register_all(vec![spec("loop").depends_on(["loop"])])
            .unwrap_err();
        assert_eq!(err, RegistryError::Cycle("loop".into()));
    }

    #[test]
    fn order_includes_dependents_and_breaks_ties_by_registration() {
        let registry = ModuleRegistry::new();
        registry
            .register_all(vec![
                spec("tariffs"),
                spec("pricing").depends_on(["tariffs"]),
                spec("banner"),
                spec("rules").depends_on(["pricing"]),
                spec("quotes").depends_on(["tariffs"]),
            ])
            .unwrap();

        let order = registry.dependency_order(&["tariffs".to_owned()]).unwrap();
        assert_eq!(names(&order), vec!["tariffs", "pricing", "rules", "quotes"]);

        let order = registry
            .dependency_order(&["banner".to_owned(), "pricing".to_owned()])
            .unwrap();
        assert_eq!(names(&order), vec!["pricing", "banner", "rules"]);

        assert_eq!(
            registry.dependents_of("tariffs").unwrap(),
            vec!["pricing", "rules", "quotes"]
        );
    }

    #[test]
    fn updates_replace_descriptor_in_place() {
        let registry = ModuleRegistry::new();
        registry.register_all(vec![spec("a"), spec("b")]).unwrap();
        let before = registry.get("a").unwrap();
        registry
            .record_reload("a", "v2".into(), 4, Utc::now())
            .unwrap();
        registry.record_failure("b", "boom").unwrap();

        let after = registry.get("a").unwrap();
        assert_eq!(before.fingerprint, "v1");
        assert_eq!(after.fingerprint, "v2");
        assert_eq!(after.generation, 4);
        assert_eq!(after.reload_count, 1);
        assert_eq!(registry.get("b").unwrap().last_error.as_deref(), Some("boom"));
        assert_eq!(registry.names(), vec!["a", "b"]);
    }
}
