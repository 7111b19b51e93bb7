//! Runtime registry mapping backend identifiers to constructors

use std::collections::HashMap;
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use super::StorageBackend;
use crate::error::{StorageError, StorageResult};

/// Zero-argument constructor producing one backend instance.
pub type BackendConstructor =
    Arc<dyn Fn() -> StorageResult<Arc<dyn StorageBackend>> + Send + Sync>;

/// String-keyed map with last-writer-wins registration. Shared by the backend
/// registry and the settings-schema registry.
pub(crate) struct KeyedRegistry<V: Clone> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> Default for KeyedRegistry<V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }
}

impl<V: Clone> KeyedRegistry<V> {
    fn read(&self) -> RwLockReadGuard<'_, HashMap<String, V>> {
        self.entries.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn write(&self) -> RwLockWriteGuard<'_, HashMap<String, V>> {
        self.entries.write().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns true when an earlier entry was replaced.
    pub(crate) fn insert(&self, key: String, value: V) -> bool {
        self.write().insert(key, value).is_some()
    }

    pub(crate) fn get(&self, key: &str) -> Option<V> {
        self.read().get(key).cloned()
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.read().contains_key(key)
    }

    pub(crate) fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    pub(crate) fn clear(&self) {
        self.write().clear();
    }
}

#[derive(Default)]
pub struct BackendRegistry {
    constructors: KeyedRegistry<BackendConstructor>,
}

impl BackendRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or replace the constructor for `identifier`. Never fails;
    /// re-registering an identifier overrides the earlier constructor.
    pub fn register<F>(&self, identifier: impl Into<String>, constructor: F)
    where
        F: Fn() -> StorageResult<Arc<dyn StorageBackend>> + Send + Sync + 'static,
    {
        let identifier = identifier.into();
        if identifier.is_empty() {
            warn!("Ignoring storage backend registration with an empty identifier");
            return;
        }

        if self.constructors.insert(identifier.clone(), Arc::new(constructor)) {
            debug!("Replaced storage backend constructor for '{}'", identifier);
        } else {
            debug!("Registered storage backend '{}'", identifier);
        }
    }

    pub fn get_constructor(&self, identifier: &str) -> StorageResult<BackendConstructor> {
        self.constructors
            .get(identifier)
            .ok_or_else(|| StorageError::BackendNotRegistered {
                identifier: identifier.to_string(),
                registered: self.list_registered(),
            })
    }

    pub fn is_registered(&self, identifier: &str) -> bool {
        self.constructors.contains(identifier)
    }

    /// Registered identifiers in sorted order
    pub fn list_registered(&self) -> Vec<String> {
        self.constructors.keys()
    }

    pub fn reset(&self) {
        self.constructors.clear();
    }
}
