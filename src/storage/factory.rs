//! Factory for creating storage backends based on registered constructors
//!
//! Instances are created lazily on first use and cached per identifier, so
//! expensive setup only happens for backends that are actually used. Each
//! identifier gets its own once-cell: concurrent first calls for the same
//! identifier run the constructor exactly once. A failed construction drops
//! the empty cell, so the next call retries and unknown identifiers are not
//! tracked.

use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use tracing::{error, info};

use super::registry::BackendRegistry;
use super::StorageBackend;
use crate::error::StorageResult;

type InstanceCell = Arc<OnceCell<Arc<dyn StorageBackend>>>;

pub struct BackendFactory {
    registry: Arc<BackendRegistry>,
    instances: Mutex<HashMap<String, InstanceCell>>,
}

impl BackendFactory {
    pub fn new(registry: Arc<BackendRegistry>) -> Self {
        Self {
            registry,
            instances: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<BackendRegistry> {
        &self.registry
    }

    fn instances(&self) -> MutexGuard<'_, HashMap<String, InstanceCell>> {
        self.instances.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Return the cached backend for `identifier`, constructing it on first use.
    pub fn get_backend(&self, identifier: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        let cell = self
            .instances()
            .entry(identifier.to_string())
            .or_default()
            .clone();

        let result = cell.get_or_try_init(|| {
            let constructor = self.registry.get_constructor(identifier)?;
            match constructor() {
                Ok(backend) => {
                    info!("Initialized storage backend '{}' ({})", identifier, backend.name());
                    Ok(backend)
                }
                Err(e) => {
                    error!("Failed to construct storage backend '{}': {}", identifier, e);
                    Err(e)
                }
            }
        });

        match result {
            Ok(backend) => Ok(Arc::clone(backend)),
            Err(e) => {
                self.discard_empty(identifier, &cell);
                Err(e)
            }
        }
    }

    /// Remove `identifier`'s cell if it is still `cell` and was never filled
    fn discard_empty(&self, identifier: &str, cell: &InstanceCell) {
        let mut instances = self.instances();
        let stale = instances
            .get(identifier)
            .map_or(false, |current| Arc::ptr_eq(current, cell) && current.get().is_none());
        if stale {
            instances.remove(identifier);
        }
    }

    /// Number of identifiers holding a cell, filled or not
    #[cfg(test)]
    fn tracked_len(&self) -> usize {
        self.instances().len()
    }

    pub fn is_cached(&self, identifier: &str) -> bool {
        self.instances()
            .get(identifier)
            .map_or(false, |cell| cell.get().is_some())
    }

    /// Identifiers with a constructed instance, sorted
    pub fn cached_identifiers(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .instances()
            .iter()
            .filter(|(_, cell)| cell.get().is_some())
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    /// Drop every cached instance. Registrations are kept.
    pub fn reset_cache(&self) {
        self.instances().clear();
    }

    /// Drop cached instances and all registrations.
    pub fn reset_all(&self) {
        self.reset_cache();
        self.registry.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{ErrorKind, StorageError};
    use crate::storage::local::LocalStorageBackend;
    use crate::storage::BackendOptions;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn counting_factory(counter: Arc<AtomicUsize>) -> BackendFactory {
        let registry = Arc::new(BackendRegistry::new());
        registry.register("local", move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(Arc::new(LocalStorageBackend::new(
                "/tmp/stowage-factory",
                "/files",
                b"k".to_vec(),
                BackendOptions::default(),
            )) as Arc<dyn StorageBackend>)
        });
        BackendFactory::new(registry)
    }

    #[test]
    fn test_same_instance_returned() {
        let counter = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(counter.clone());

        let first = factory.get_backend("local").unwrap();
        let second = factory.get_backend("local").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(factory.is_cached("local"));
    }

    #[test]
    fn test_unregistered_identifier_propagates() {
        let factory = counting_factory(Arc::new(AtomicUsize::new(0)));

        let err = factory.get_backend("azure").err().unwrap();
        assert_eq!(err.kind(), ErrorKind::BackendNotRegistered);
        assert!(!factory.is_cached("azure"));
    }

    #[test]
    fn test_unknown_identifiers_are_not_tracked() {
        let factory = counting_factory(Arc::new(AtomicUsize::new(0)));

        for i in 0..100 {
            let err = factory.get_backend(&format!("bogus-{}", i)).err().unwrap();
            assert_eq!(err.kind(), ErrorKind::BackendNotRegistered);
        }
        assert_eq!(factory.tracked_len(), 0);

        factory.get_backend("local").unwrap();
        assert_eq!(factory.tracked_len(), 1);
    }

    #[test]
    fn test_failed_construction_is_not_cached() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let registry = Arc::new(BackendRegistry::new());
        let seen = attempts.clone();
        registry.register("flaky", move || {
            if seen.fetch_add(1, Ordering::SeqCst) == 0 {
                Err(StorageError::backend("first attempt fails"))
            } else {
                Ok(Arc::new(LocalStorageBackend::new(
                    "/tmp/stowage-flaky",
                    "/files",
                    b"k".to_vec(),
                    BackendOptions::default(),
                )) as Arc<dyn StorageBackend>)
            }
        });
        let factory = BackendFactory::new(registry);

        let err = factory.get_backend("flaky").err().unwrap();
        assert_eq!(err.to_string(), "first attempt fails");
        assert!(!factory.is_cached("flaky"));
        assert_eq!(factory.tracked_len(), 0);

        assert!(factory.get_backend("flaky").is_ok());
        assert!(factory.is_cached("flaky"));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_cache_keeps_registrations() {
        let counter = Arc::new(AtomicUsize::new(0));
        let factory = counting_factory(counter.clone());

        let first = factory.get_backend("local").unwrap();
        factory.reset_cache();
        assert!(!factory.is_cached("local"));
        assert!(factory.registry().is_registered("local"));

        let second = factory.get_backend("local").unwrap();
        assert!(!Arc::ptr_eq(&first, &second));
        assert_eq!(counter.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_reset_all_clears_registry() {
        let factory = counting_factory(Arc::new(AtomicUsize::new(0)));
        factory.get_backend("local").unwrap();
        factory.reset_all();

        assert!(factory.cached_identifiers().is_empty());
        assert!(factory.registry().list_registered().is_empty());
    }

    #[test]
    fn test_concurrent_first_access_constructs_once() {
        let counter = Arc::new(AtomicUsize::new(0));
        let factory = Arc::new(counting_factory(counter.clone()));

        let handles: Vec<_> = (0..16)
            .map(|_| {
                let factory = factory.clone();
                std::thread::spawn(move || factory.get_backend("local").map(|_| ()).is_ok())
            })
            .collect();

        for handle in handles {
            assert!(handle.join().unwrap());
        }
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
