//! Per-account cursor persistence.

use crate::error::SyncResult;
use mailsync_protocol::{AccountId, Cursor, CursorState};
use mailsync_storage::{StorageBackend, StorageProvider};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

/// Key under which each account namespace stores its cursor.
pub const NEXT_EVENT_CURSOR_KEY: &str = "latest_event_id";

/// Durable per-account cursor store.
///
/// Each account maps to its own storage namespace; opened namespaces are
/// cached so that concurrent account tasks share one backend per account.
///
/// The locked marker is the empty string on disk and reads back as
/// [`CursorState::Locked`].
pub struct CursorStore {
    provider: Arc<dyn StorageProvider>,
    opened: Mutex<HashMap<AccountId, Arc<dyn StorageBackend>>>,
}

impl CursorStore {
    /// Creates a cursor store over `provider`.
    pub fn new(provider: Arc<dyn StorageProvider>) -> Self {
        Self {
            provider,
            opened: Mutex::new(HashMap::new()),
        }
    }

    fn backend(&self, account: &AccountId) -> SyncResult<Arc<dyn StorageBackend>> {
        let mut opened = self.opened.lock();
        if let Some(backend) = opened.get(account) {
            return Ok(Arc::clone(backend));
        }
        let backend = self.provider.open(account.as_str())?;
        opened.insert(account.clone(), Arc::clone(&backend));
        Ok(backend)
    }

    /// Loads the explicit cursor state of `account`.
    pub fn load(&self, account: &AccountId) -> SyncResult<CursorState> {
        let stored = self.backend(account)?.get(NEXT_EVENT_CURSOR_KEY)?;
        let state = CursorState::from_stored(stored);
        debug!(%account, %state, "cursor loaded");
        Ok(state)
    }

    /// Returns the cursor of `account`; locked and absent both read as `None`.
    pub fn get(&self, account: &AccountId) -> SyncResult<Option<Cursor>> {
        Ok(self.load(account)?.cursor().cloned())
    }

    /// Persists `cursor` for `account`.
    pub fn set(&self, account: &AccountId, cursor: &Cursor) -> SyncResult<()> {
        self.backend(account)?
            .put(NEXT_EVENT_CURSOR_KEY, cursor.as_str())?;
        debug!(%account, %cursor, "cursor stored");
        Ok(())
    }

    /// Writes the locked marker for `account`.
    pub fn lock(&self, account: &AccountId) -> SyncResult<()> {
        self.backend(account)?.put(NEXT_EVENT_CURSOR_KEY, "")?;
        debug!(%account, "cursor locked");
        Ok(())
    }

    /// Removes the persisted cursor of `account` and forgets its namespace.
    pub fn clear(&self, account: &AccountId) -> SyncResult<()> {
        self.opened.lock().remove(account);
        self.provider.destroy(account.as_str())?;
        debug!(%account, "cursor cleared");
        Ok(())
    }

    /// Removes every persisted cursor, including accounts never opened by
    /// this process.
    pub fn clear_all(&self) -> SyncResult<()> {
        let mut opened = self.opened.lock();
        let mut namespaces = self.provider.namespaces()?;
        namespaces.extend(opened.keys().map(|account| account.as_str().to_string()));
        namespaces.sort();
        namespaces.dedup();

        for namespace in &namespaces {
            self.provider.destroy(namespace)?;
        }
        opened.clear();
        debug!(count = namespaces.len(), "all cursors cleared");
        Ok(())
    }
}
