//! In-memory event handler for testing and ephemeral use.

use crate::error::{SyncError, SyncResult};
use crate::handler::{EventHandler, EventHandlerFactory};
use async_trait::async_trait;
use mailsync_protocol::{AccountId, EventAction, EventBatch, EventRecord, TargetType};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::warn;

type ObjectKey = (TargetType, String);

/// Number of times each handler operation was called.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HandlerCalls {
    /// `refresh_contacts` calls.
    pub refresh_contacts: usize,
    /// `refresh` calls.
    pub refresh: usize,
    /// `stage` calls.
    pub stage: usize,
    /// `write` calls.
    pub write: usize,
}

#[derive(Debug, Default)]
struct CallCounters {
    refresh_contacts: AtomicUsize,
    refresh: AtomicUsize,
    stage: AtomicUsize,
    write: AtomicUsize,
}

/// A mailbox kept in memory.
///
/// Objects are keyed by `(target, target_id)`. Creates and updates are
/// upserts, deletes are removals. The remote snapshot stands in for what a
/// full resync would download: `refresh` replaces the whole mailbox with it,
/// `refresh_contacts` replaces only contact data.
#[derive(Debug, Default)]
pub struct MemoryEventHandler {
    objects: RwLock<BTreeMap<ObjectKey, Vec<u8>>>,
    remote_snapshot: RwLock<BTreeMap<ObjectKey, Vec<u8>>>,
    staged: Mutex<Option<Vec<EventRecord>>>,
    staged_batches: Mutex<Vec<Vec<EventRecord>>>,
    fail_writes: AtomicBool,
    calls: CallCounters,
}

impl MemoryEventHandler {
    /// Creates an empty handler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the state a refresh downloads.
    pub fn set_remote_snapshot(&self, objects: impl IntoIterator<Item = (TargetType, String, Vec<u8>)>) {
        *self.remote_snapshot.write() = objects
            .into_iter()
            .map(|(target, id, payload)| ((target, id), payload))
            .collect();
    }

    /// Makes every subsequent `write` fail (or succeed again).
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Returns the payload of one object.
    pub fn get(&self, target: TargetType, id: &str) -> Option<Vec<u8>> {
        self.objects.read().get(&(target, id.to_string())).cloned()
    }

    /// Returns the number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.read().len()
    }

    /// Returns true if the mailbox is empty.
    pub fn is_empty(&self) -> bool {
        self.objects.read().is_empty()
    }

    /// Returns the ids of all objects of one kind, in order.
    pub fn ids(&self, target: TargetType) -> Vec<String> {
        self.objects
            .read()
            .keys()
            .filter(|(t, _)| *t == target)
            .map(|(_, id)| id.clone())
            .collect()
    }

    /// Returns the call counts.
    pub fn calls(&self) -> HandlerCalls {
        HandlerCalls {
            refresh_contacts: self.calls.refresh_contacts.load(Ordering::SeqCst),
            refresh: self.calls.refresh.load(Ordering::SeqCst),
            stage: self.calls.stage.load(Ordering::SeqCst),
            write: self.calls.write.load(Ordering::SeqCst),
        }
    }

    /// Returns the argument of every `stage` call, in order.
    pub fn staged_batches(&self) -> Vec<Vec<EventRecord>> {
        self.staged_batches.lock().clone()
    }
}

#[async_trait]
impl EventHandler for MemoryEventHandler {
    async fn refresh_contacts(&self) -> SyncResult<()> {
        self.calls.refresh_contacts.fetch_add(1, Ordering::SeqCst);
        let snapshot = self.remote_snapshot.read();
        let mut objects = self.objects.write();
        objects.retain(|(target, _), _| !target.is_contact_data());
        objects.extend(
            snapshot
                .iter()
                .filter(|((target, _), _)| target.is_contact_data())
                .map(|(key, payload)| (key.clone(), payload.clone())),
        );
        Ok(())
    }

    async fn refresh(&self) -> SyncResult<()> {
        self.calls.refresh.fetch_add(1, Ordering::SeqCst);
        *self.staged.lock() = None;
        let snapshot = self.remote_snapshot.read().clone();
        *self.objects.write() = snapshot;
        Ok(())
    }

    async fn stage(&self, events: &[EventRecord]) -> bool {
        self.calls.stage.fetch_add(1, Ordering::SeqCst);
        self.staged_batches.lock().push(events.to_vec());

        for (index, event) in events.iter().enumerate() {
            if let Err(e) = event.validate() {
                warn!(index, target_id = %event.target_id, error = %e, "invalid event record");
                *self.staged.lock() = None;
                return false;
            }
        }
        *self.staged.lock() = Some(events.to_vec());
        true
    }

    async fn write(&self, batch: &EventBatch) -> SyncResult<()> {
        self.calls.write.fetch_add(1, Ordering::SeqCst);
        let staged = self
            .staged
            .lock()
            .take()
            .ok_or_else(|| SyncError::write("nothing staged"))?;

        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(SyncError::write(format!(
                "mailbox rejected batch ending at {}",
                batch.next_cursor
            )));
        }

        let mut objects = self.objects.write();
        for event in staged {
            let key = (event.target, event.target_id);
            match (event.action, event.payload) {
                (EventAction::Delete, _) => {
                    objects.remove(&key);
                }
                (EventAction::Create | EventAction::Update, Some(payload)) => {
                    objects.insert(key, payload);
                }
                (_, None) => {}
            }
        }
        Ok(())
    }
}

/// Creates one [`MemoryEventHandler`] per account and keeps them reachable.
#[derive(Debug, Default)]
pub struct MemoryHandlerFactory {
    handlers: Mutex<HashMap<AccountId, Arc<MemoryEventHandler>>>,
    snapshot: Vec<(TargetType, String, Vec<u8>)>,
}

impl MemoryHandlerFactory {
    /// Creates a factory whose handlers start with an empty remote snapshot.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds every created handler with this remote snapshot.
    pub fn with_snapshot(mut self, snapshot: Vec<(TargetType, String, Vec<u8>)>) -> Self {
        self.snapshot = snapshot;
        self
    }

    /// Returns the handler created for `account`, if any.
    pub fn handler(&self, account: &AccountId) -> Option<Arc<MemoryEventHandler>> {
        self.handlers.lock().get(account).cloned()
    }

    /// Returns how many handlers were created.
    pub fn created(&self) -> usize {
        self.handlers.lock().len()
    }
}

impl EventHandlerFactory for MemoryHandlerFactory {
    fn create(&self, account: &AccountId) -> Arc<dyn EventHandler> {
        let handler = Arc::new(MemoryEventHandler::new());
        handler.set_remote_snapshot(self.snapshot.iter().cloned());
        self.handlers
            .lock()
            .insert(account.clone(), Arc::clone(&handler));
        handler
    }
}
