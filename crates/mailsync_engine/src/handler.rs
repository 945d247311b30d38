//! Event handler contract and the per-account sync handle.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use mailsync_protocol::{AccountId, EventBatch, EventRecord};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Mutex, MutexGuard};

/// Applies remote events to the local state of one account.
///
/// The engine drives a handler through `stage` then `write` for every batch,
/// and calls the refresh operations when the server asks for a resync.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Reloads all contact data from the server. Idempotent.
    async fn refresh_contacts(&self) -> SyncResult<()>;

    /// Rebuilds the whole mailbox from the server.
    async fn refresh(&self) -> SyncResult<()>;

    /// Validates and buffers `events` without touching local state.
    ///
    /// Returns `false` if any record is structurally invalid.
    async fn stage(&self, events: &[EventRecord]) -> bool;

    /// Commits the staged events of `batch` to local state.
    async fn write(&self, batch: &EventBatch) -> SyncResult<()>;
}

/// Creates the event handler of a newly seen account.
pub trait EventHandlerFactory: Send + Sync {
    /// Creates a handler bound to `account`.
    fn create(&self, account: &AccountId) -> Arc<dyn EventHandler>;
}

impl<F> EventHandlerFactory for F
where
    F: Fn(&AccountId) -> Arc<dyn EventHandler> + Send + Sync,
{
    fn create(&self, account: &AccountId) -> Arc<dyn EventHandler> {
        self(account)
    }
}

/// Where a handler is within the apply cycle of a batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HandlerState {
    /// No batch in flight.
    #[default]
    Idle,
    /// A batch was staged and awaits `write`.
    Staging,
    /// A staged batch is being committed.
    Applying,
}

/// Per-account sync statistics.
#[derive(Debug, Clone, Default)]
pub struct SyncStats {
    /// Cycles that ended without error.
    pub cycles_completed: u64,
    /// Cycles that ended with an error.
    pub cycles_failed: u64,
    /// Event pages fetched.
    pub batches_fetched: u64,
    /// Events committed through `write`.
    pub events_applied: u64,
    /// Bootstraps performed.
    pub bootstraps: u64,
    /// Server-requested full refreshes.
    pub full_refreshes: u64,
    /// Contact refreshes, including those done during bootstrap.
    pub contact_refreshes: u64,
    /// Batches rejected by staging.
    pub staging_rejections: u64,
    /// Time the last cycle finished.
    pub last_sync_time: Option<Instant>,
    /// Message of the last failure.
    pub last_error: Option<String>,
}

/// Everything the engine keeps for one account.
pub struct SyncHandle {
    account: AccountId,
    handler: Arc<dyn EventHandler>,
    state: RwLock<HandlerState>,
    stats: RwLock<SyncStats>,
    cycle: Mutex<()>,
    retired: AtomicBool,
}

impl SyncHandle {
    /// Creates an idle handle.
    pub fn new(account: AccountId, handler: Arc<dyn EventHandler>) -> Self {
        Self {
            account,
            handler,
            state: RwLock::new(HandlerState::Idle),
            stats: RwLock::new(SyncStats::default()),
            cycle: Mutex::new(()),
            retired: AtomicBool::new(false),
        }
    }

    /// Returns the account.
    pub fn account(&self) -> &AccountId {
        &self.account
    }

    /// Returns the wrapped handler.
    pub fn handler(&self) -> &Arc<dyn EventHandler> {
        &self.handler
    }

    /// Returns the handler state.
    pub fn state(&self) -> HandlerState {
        *self.state.read()
    }

    /// Returns a copy of the statistics.
    pub fn stats(&self) -> SyncStats {
        self.stats.read().clone()
    }

    pub(crate) fn update_stats(&self, f: impl FnOnce(&mut SyncStats)) {
        f(&mut self.stats.write());
    }

    /// Waits until no other cycle of this account runs, then holds it off.
    pub async fn lock_cycle(&self) -> MutexGuard<'_, ()> {
        self.cycle.lock().await
    }

    /// Marks the handle as dropped from the registry. Call while holding
    /// the cycle lock; cycles that acquire it afterwards must not run.
    pub(crate) fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
    }

    /// Returns true once the account was reset and this handle replaced.
    pub fn is_retired(&self) -> bool {
        self.retired.load(Ordering::SeqCst)
    }

    /// Forces the state back to idle, discarding a cycle that was dropped
    /// mid-batch.
    pub fn reset_state(&self) {
        *self.state.write() = HandlerState::Idle;
    }

    fn transition(&self, from: HandlerState, to: HandlerState) -> SyncResult<()> {
        let mut state = self.state.write();
        if *state != from {
            return Err(SyncError::InvalidStateTransition {
                from: format!("{:?}", *state),
                to: format!("{to:?}"),
            });
        }
        *state = to;
        Ok(())
    }

    /// Reloads contact data.
    pub async fn refresh_contacts(&self) -> SyncResult<()> {
        self.handler.refresh_contacts().await?;
        self.update_stats(|s| s.contact_refreshes += 1);
        Ok(())
    }

    /// Rebuilds the mailbox.
    pub async fn refresh(&self) -> SyncResult<()> {
        self.handler.refresh().await
    }

    /// Stages `events`. Leaves the handle in `Staging` when accepted.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] unless the handle is idle.
    pub async fn stage(&self, events: &[EventRecord]) -> SyncResult<bool> {
        self.transition(HandlerState::Idle, HandlerState::Staging)?;
        let accepted = self.handler.stage(events).await;
        if !accepted {
            self.reset_state();
        }
        Ok(accepted)
    }

    /// Writes the staged batch. Returns to `Idle` whatever the outcome.
    ///
    /// # Errors
    ///
    /// Returns [`SyncError::InvalidStateTransition`] unless a batch is staged,
    /// or the handler's write error.
    pub async fn write(&self, batch: &EventBatch) -> SyncResult<()> {
        self.transition(HandlerState::Staging, HandlerState::Applying)?;
        let result = self.handler.write(batch).await;
        self.reset_state();
        result
    }
}

impl std::fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncHandle")
            .field("account", &self.account)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
