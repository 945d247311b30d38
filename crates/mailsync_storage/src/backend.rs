//! Storage backend and provider traits.

use crate::error::StorageResult;
use std::sync::Arc;

/// A durable string-to-string map for one namespace.
///
/// # Invariants
///
/// - `put` and `remove` are durable when they return `Ok`
/// - `get` after `put` returns the same value, in-process and after reopen
/// - Backends must be `Send + Sync`; concurrent callers see whole writes
///
/// # Implementors
///
/// - [`super::InMemoryBackend`] - For testing
/// - [`super::FileBackend`] - For persistent storage
pub trait StorageBackend: Send + Sync {
    /// Returns the value stored under `key`, if any.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn get(&self, key: &str) -> StorageResult<Option<String>>;

    /// Stores `value` under `key`, replacing any previous value.
    ///
    /// # Errors
    ///
    /// Returns an error if the write could not be made durable. The previous
    /// value is kept in that case.
    fn put(&self, key: &str, value: &str) -> StorageResult<()>;

    /// Removes `key`. Removing a missing key is not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal could not be made durable.
    fn remove(&self, key: &str) -> StorageResult<()>;

    /// Removes every key in this namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if the removal could not be made durable.
    fn clear(&self) -> StorageResult<()>;

    /// Returns all keys currently stored, in ascending order.
    ///
    /// # Errors
    ///
    /// Returns an error if the underlying storage cannot be read.
    fn keys(&self) -> StorageResult<Vec<String>>;
}

/// Opens namespaced backends.
///
/// A provider returns the **same** backend for repeated opens of one
/// namespace, so writers in one process never observe stale copies.
pub trait StorageProvider: Send + Sync {
    /// Opens (creating if needed) the backend for `namespace`.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace name is invalid or its data cannot
    /// be loaded.
    fn open(&self, namespace: &str) -> StorageResult<Arc<dyn StorageBackend>>;

    /// Lists every namespace that currently holds persisted data.
    ///
    /// # Errors
    ///
    /// Returns an error if the namespace listing cannot be read.
    fn namespaces(&self) -> StorageResult<Vec<String>>;

    /// Deletes all data of `namespace`. Destroying an unknown namespace is
    /// not an error.
    ///
    /// # Errors
    ///
    /// Returns an error if the data could not be removed.
    fn destroy(&self, namespace: &str) -> StorageResult<()>;
}

pub(crate) fn validate_namespace(namespace: &str) -> StorageResult<()> {
    if namespace.is_empty() {
        return Err(crate::StorageError::InvalidNamespace(namespace.to_string()));
    }
    Ok(())
}
