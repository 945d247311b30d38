//! In-memory storage for testing.

use crate::backend::{validate_namespace, StorageBackend, StorageProvider};
use crate::error::StorageResult;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

/// An in-memory namespace.
///
/// This backend stores all data in memory and is suitable for:
/// - Unit tests
/// - Integration tests
/// - Ephemeral sessions that don't need persistence
///
/// # Example
///
/// ```rust
/// use mailsync_storage::{InMemoryBackend, StorageBackend};
///
/// let backend = InMemoryBackend::new();
/// backend.put("k", "v").unwrap();
/// assert_eq!(backend.keys().unwrap(), vec!["k".to_string()]);
/// ```
#[derive(Debug, Default)]
pub struct InMemoryBackend {
    entries: RwLock<BTreeMap<String, String>>,
}

impl InMemoryBackend {
    /// Creates a new empty backend.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a backend with pre-existing entries.
    ///
    /// Useful for testing recovery scenarios.
    #[must_use]
    pub fn with_entries<I, K, V>(entries: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        Self {
            entries: RwLock::new(
                entries
                    .into_iter()
                    .map(|(k, v)| (k.into(), v.into()))
                    .collect(),
            ),
        }
    }

    /// Returns the number of stored keys.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl StorageBackend for InMemoryBackend {
    fn get(&self, key: &str) -> StorageResult<Option<String>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn put(&self, key: &str, value: &str) -> StorageResult<()> {
        self.entries
            .write()
            .insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn remove(&self, key: &str) -> StorageResult<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn clear(&self) -> StorageResult<()> {
        self.entries.write().clear();
        Ok(())
    }

    fn keys(&self) -> StorageResult<Vec<String>> {
        Ok(self.entries.read().keys().cloned().collect())
    }
}

/// Provider of [`InMemoryBackend`] namespaces.
///
/// Reopening a namespace returns the same backend, which stands in for
/// "durable across restarts" in tests that rebuild the engine.
#[derive(Debug, Default)]
pub struct InMemoryProvider {
    namespaces: RwLock<HashMap<String, Arc<InMemoryBackend>>>,
}

impl InMemoryProvider {
    /// Creates an empty provider.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds `namespace` with a single entry.
    pub fn seed(&self, namespace: &str, key: &str, value: &str) {
        let backend = Arc::clone(
            self.namespaces
                .write()
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(InMemoryBackend::new())),
        );
        backend
            .entries
            .write()
            .insert(key.to_string(), value.to_string());
    }
}

impl StorageProvider for InMemoryProvider {
    fn open(&self, namespace: &str) -> StorageResult<Arc<dyn StorageBackend>> {
        validate_namespace(namespace)?;
        let backend = Arc::clone(
            self.namespaces
                .write()
                .entry(namespace.to_string())
                .or_insert_with(|| Arc::new(InMemoryBackend::new())),
        );
        Ok(backend)
    }

    fn namespaces(&self) -> StorageResult<Vec<String>> {
        let mut names: Vec<String> = self
            .namespaces
            .read()
            .iter()
            .filter(|(_, backend)| !backend.is_empty())
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        Ok(names)
    }

    fn destroy(&self, namespace: &str) -> StorageResult<()> {
        if let Some(backend) = self.namespaces.write().remove(namespace) {
            backend.clear()?;
        }
        Ok(())
    }
}
