//! ---
//! luo_section: "02-module-registry"
//! luo_subsection: "module"
//! luo_type: "source"
//! luo_scope: "code"
//! luo_description: "Hot-swappable module registry and reload contracts."
//! luo_version: "v0.0.0-prealpha"
//! luo_owner: "tbd"
//! ---
use std::fmt;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::contract::{fingerprint_json, ContractError, Fingerprint, ModuleState, ReloadContract};

/// Lock-free holder of the active value. Readers never block on writers.
pub struct SwapCell<T> {
    inner: ArcSwap<T>,
}

impl<T> SwapCell<T> {
    pub fn new(value: T) -> Self {
        Self {
            inner: ArcSwap::from_pointee(value),
        }
    }

    /// Current value; the returned `Arc` stays valid across later swaps.
    pub fn load(&self) -> Arc<T> {
        self.inner.load_full()
    }

    /// Replace the active value and return the previous one.
    pub fn replace(&self, value: T) -> Arc<T> {
        self.inner.swap(Arc::new(value))
    }

    pub fn store(&self, value: Arc<T>) {
        self.inner.store(value);
    }
}

impl<T: fmt::Debug> fmt::Debug for SwapCell<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SwapCell")
            .field("value", &self.inner.load_full())
            .finish()
    }
}

type Loader<T> = Box<dyn Fn() -> Result<T, ContractError> + Send + Sync>;
type Validator<T> = Box<dyn Fn(&T) -> Result<(), ContractError> + Send + Sync>;

/// Data module over a loader closure, fingerprinted by its JSON encoding.
///
/// Code paths stay fixed; what changes is the value they read through
/// [`SwapModule::cell`]. The candidate checked by `validate` is the one the
/// following `reload` swaps in.
pub struct SwapModule<T> {
    cell: Arc<SwapCell<T>>,
    loader: Loader<T>,
    validator: Option<Validator<T>>,
    staged: Mutex<Option<T>>,
    known_good: Option<ModuleState>,
}

impl<T> SwapModule<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    pub fn new<F>(initial: T, loader: F) -> Self
    where
        F: Fn() -> Result<T, ContractError> + Send + Sync + 'static,
    {
        let known_good = fingerprint_json(&initial)
            .ok()
            .zip(serde_json::to_value(&initial).ok())
            .map(|(fingerprint, payload)| ModuleState::new(fingerprint, payload));
        Self {
            cell: Arc::new(SwapCell::new(initial)),
            loader: Box::new(loader),
            validator: None,
            staged: Mutex::new(None),
            known_good,
        }
    }

    pub fn with_validator<V>(mut self, validator: V) -> Self
    where
        V: Fn(&T) -> Result<(), ContractError> + Send + Sync + 'static,
    {
        self.validator = Some(Box::new(validator));
        self
    }

    /// Handle that request-handling code reads through.
    pub fn cell(&self) -> Arc<SwapCell<T>> {
        Arc::clone(&self.cell)
    }

    fn check(&self, candidate: &T) -> Result<(), ContractError> {
        match &self.validator {
            Some(validator) => validator(candidate),
            None => Ok(()),
        }
    }

    fn decode(state: &ModuleState) -> Result<T, ContractError> {
        serde_json::from_value(state.payload.clone())
            .map_err(|err| ContractError::Restore(err.to_string()))
    }
}

impl<T> ReloadContract for SwapModule<T>
where
    T: Serialize + DeserializeOwned + Send + Sync + 'static,
{
    fn current_fingerprint(&self) -> Fingerprint {
        fingerprint_json(self.cell.load().as_ref()).unwrap_or_default()
    }

    fn source_fingerprint(&self) -> Result<Fingerprint, ContractError> {
        let candidate = (self.loader)()
            .map_err(|err| ContractError::SourceUnavailable(err.to_string()))?;
        fingerprint_json(&candidate)
    }

    fn validate(&self) -> Result<(), ContractError> {
        let mut staged = self.staged.lock();
        *staged = None;
        let candidate = (self.loader)()?;
        self.check(&candidate)?;
        *staged = Some(candidate);
        Ok(())
    }

    fn reload(&self) -> Result<Fingerprint, ContractError> {
        let staged = self.staged.lock().take();
        let candidate = match staged {
            Some(candidate) => candidate,
            None => {
                let candidate = (self.loader)()?;
                self.check(&candidate)?;
                candidate
            }
        };
        let fingerprint = fingerprint_json(&candidate)?;
        self.cell.replace(candidate);
        Ok(fingerprint)
    }

    fn capture(&self) -> Result<ModuleState, ContractError> {
        let current = self.cell.load();
        let payload = serde_json::to_value(current.as_ref())
            .map_err(|err| ContractError::load(err.to_string()))?;
        Ok(ModuleState::new(fingerprint_json(current.as_ref())?, payload))
    }

    fn restore(&self, state: &ModuleState) -> Result<(), ContractError> {
        let value = Self::decode(state)?;
        self.cell.replace(value);
        Ok(())
    }

    fn validate_state(&self, state: &ModuleState) -> Result<(), ContractError> {
        let value = Self::decode(state)?;
        self.check(&value)
    }

    fn known_good(&self) -> Option<ModuleState> {
        self.known_good.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use serde::Deserialize;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Tariff {
        rate: u32,
    }

    fn module(source: Arc<Mutex<u32>>) -> SwapModule<Tariff> {
        SwapModule::new(Tariff { rate: 1 }, move || Ok(Tariff { rate: *source.lock() }))
            .with_validator(|tariff| {
                if tariff.rate == 0 {
                    Err(ContractError::invalid("rate must be positive"))
                } else {
                    Ok(())
                }
            })
    }

    #[test]
    fn reload_swaps_whole_value() {
        let source = Arc::new(Mutex::new(1));
        let module = module(Arc::clone(&source));
        let cell = module.cell();
        let before = cell.load();

        *source.lock() = 7;
        assert_ne!(module.source_fingerprint().unwrap(), module.current_fingerprint());
        let fingerprint = module.reload().unwrap();

        assert_eq!(cell.load().rate, 7);
        assert_eq!(before.rate, 1);
        assert_eq!(fingerprint, module.current_fingerprint());
    }

    #[test]
    fn validator_rejects_candidate() {
        let source = Arc::new(Mutex::new(0));
        let module = module(source);
        assert!(matches!(module.validate(), Err(ContractError::Invalid(_))));
    }

    #[test]
    fn reload_uses_the_validated_candidate() {
        let source = Arc::new(Mutex::new(4));
        let module = module(Arc::clone(&source));
        module.validate().unwrap();
        *source.lock() = 0;

        module.reload().unwrap();
        assert_eq!(module.cell().load().rate, 4);

        // an unvalidated reload still refuses a rejected candidate
        assert!(matches!(module.reload(), Err(ContractError::Invalid(_))));
        assert_eq!(module.cell().load().rate, 4);
    }

    #[test]
    fn capture_then_restore_preserves_fingerprint() {
        let source = Arc::new(Mutex::new(3));
        let module = module(Arc::clone(&source));
        module.reload().unwrap();
        let state = module.capture().unwrap();

        *source.lock() = 9;
        module.reload().unwrap();
        module.restore(&state).unwrap();

        assert_eq!(module.current_fingerprint(), state.fingerprint);
        assert_eq!(module.cell().load().rate, 3);
        assert_eq!(
            module.known_good().unwrap().payload,
            serde_json::json!({"rate": 1})
        );
    }
}
