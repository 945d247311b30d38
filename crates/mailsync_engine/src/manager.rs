//! Multi-account event manager.

use crate::config::SyncConfig;
use crate::cursor::CursorStore;
use crate::error::{SyncError, SyncResult};
use crate::handler::{EventHandlerFactory, SyncHandle, SyncStats};
use crate::transport::EventFetchClient;
use mailsync_protocol::{AccountId, Cursor, CursorState};
use mailsync_storage::StorageProvider;
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::task::JoinSet;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Outcome of one drain loop for one account.
#[derive(Debug, Clone)]
pub struct CycleResult {
    /// Account that was synced.
    pub account: AccountId,
    /// Cursor state found at the start of the cycle.
    pub initial_state: CursorState,
    /// Cursor state left at the end of the cycle.
    pub final_state: CursorState,
    /// Whether the cycle bootstrapped instead of fetching events.
    pub bootstrapped: bool,
    /// Event pages fetched.
    pub batches_fetched: u32,
    /// Events committed through `write`.
    pub events_applied: u64,
    /// Whether contact data was reloaded.
    pub contacts_refreshed: bool,
    /// Whether the server forced a full refresh.
    pub full_refresh: bool,
    /// Whether a batch failed staging and halted the cycle.
    pub staging_rejected: bool,
    /// Wall-clock time of the cycle.
    pub duration: Duration,
}

impl CycleResult {
    fn new(account: AccountId, initial_state: CursorState) -> Self {
        Self {
            account,
            final_state: initial_state.clone(),
            initial_state,
            bootstrapped: false,
            batches_fetched: 0,
            events_applied: 0,
            contacts_refreshed: false,
            full_refresh: false,
            staging_rejected: false,
            duration: Duration::ZERO,
        }
    }
}

/// Per-account outcomes of [`EventManager::sync_accounts`].
#[derive(Debug, Default)]
pub struct SyncSummary {
    results: BTreeMap<AccountId, SyncResult<CycleResult>>,
}

impl SyncSummary {
    /// Returns the outcome for `account`.
    pub fn get(&self, account: &AccountId) -> Option<&SyncResult<CycleResult>> {
        self.results.get(account)
    }

    /// Iterates over all outcomes, ordered by account.
    pub fn iter(&self) -> impl Iterator<Item = (&AccountId, &SyncResult<CycleResult>)> {
        self.results.iter()
    }

    /// Returns the number of accounts synced.
    pub fn len(&self) -> usize {
        self.results.len()
    }

    /// Returns true if no account was synced.
    pub fn is_empty(&self) -> bool {
        self.results.is_empty()
    }

    /// Returns the number of accounts whose cycle succeeded.
    pub fn succeeded(&self) -> usize {
        self.results.values().filter(|r| r.is_ok()).count()
    }

    /// Iterates over the failed accounts.
    pub fn failures(&self) -> impl Iterator<Item = (&AccountId, &SyncError)> {
        self.results
            .iter()
            .filter_map(|(account, result)| result.as_ref().err().map(|e| (account, e)))
    }

    /// Collects the successful results, or returns the first failure in
    /// account order.
    pub fn into_result(self) -> SyncResult<Vec<CycleResult>> {
        self.results.into_values().collect()
    }
}

/// Keeps local state of every logged-in account in step with its remote
/// event log.
///
/// Each account owns a [`SyncHandle`] created on first use. Accounts are
/// synced concurrently, one task each; within an account a single cycle runs
/// at a time. Refresh operations and locked-marker writes are serialized
/// across all accounts; event fetches are not.
pub struct EventManager {
    config: SyncConfig,
    client: RwLock<Arc<dyn EventFetchClient>>,
    factory: Arc<dyn EventHandlerFactory>,
    cursors: CursorStore,
    handles: Mutex<HashMap<AccountId, Arc<SyncHandle>>>,
    refresh_gate: tokio::sync::Mutex<()>,
    cancelled: AtomicBool,
}

impl EventManager {
    /// Creates a manager.
    pub fn new(
        config: SyncConfig,
        client: Arc<dyn EventFetchClient>,
        factory: Arc<dyn EventHandlerFactory>,
        provider: Arc<dyn StorageProvider>,
    ) -> Self {
        Self {
            config,
            client: RwLock::new(client),
            factory,
            cursors: CursorStore::new(provider),
            handles: Mutex::new(HashMap::new()),
            refresh_gate: tokio::sync::Mutex::new(()),
            cancelled: AtomicBool::new(false),
        }
    }

    /// Returns the configuration.
    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Returns the cursor store.
    pub fn cursors(&self) -> &CursorStore {
        &self.cursors
    }

    /// Returns the handle of `account`, creating it if absent.
    pub fn handle(&self, account: &AccountId) -> Arc<SyncHandle> {
        let mut handles = self.handles.lock();
        let handle = handles.entry(account.clone()).or_insert_with(|| {
            debug!(%account, "registering account");
            Arc::new(SyncHandle::new(account.clone(), self.factory.create(account)))
        });
        Arc::clone(handle)
    }

    /// Returns the registered accounts, in order.
    pub fn accounts(&self) -> Vec<AccountId> {
        let mut accounts: Vec<_> = self.handles.lock().keys().cloned().collect();
        accounts.sort();
        accounts
    }

    /// Returns the statistics of a registered account.
    pub fn stats(&self, account: &AccountId) -> Option<SyncStats> {
        self.handles.lock().get(account).map(|handle| handle.stats())
    }

    /// Replaces the fetch client. Cursors are untouched; fetches already
    /// issued finish on the old client.
    pub fn swap_fetch_client(&self, client: Arc<dyn EventFetchClient>) {
        *self.client.write() = client;
        info!("fetch client replaced");
    }

    fn client(&self) -> Arc<dyn EventFetchClient> {
        Arc::clone(&self.client.read())
    }

    /// Requests cancellation. Cycles stop before their next fetch with
    /// [`SyncError::Cancelled`]; the flag stays set until
    /// [`reset_cancel`](Self::reset_cancel).
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    /// Clears a cancellation request.
    pub fn reset_cancel(&self) {
        self.cancelled.store(false, Ordering::SeqCst);
    }

    /// Returns true if cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Forgets every account: handles and persisted cursors.
    ///
    /// Waits for running cycles to finish first, so none of them can write
    /// a cursor back after the reset.
    pub async fn reset_state(&self) -> SyncResult<()> {
        let handles: Vec<Arc<SyncHandle>> = self.handles.lock().values().cloned().collect();
        let mut cycles = Vec::with_capacity(handles.len());
        for handle in &handles {
            cycles.push(handle.lock_cycle().await);
            handle.retire();
        }

        self.handles.lock().clear();
        self.cursors.clear_all()?;
        info!(accounts = handles.len(), "sync state reset for all accounts");
        Ok(())
    }

    /// Forgets one account: its handle and persisted cursor.
    ///
    /// Waits for a running cycle of the account to finish first.
    pub async fn reset_account(&self, account: &AccountId) -> SyncResult<()> {
        let handle = self.handles.lock().get(account).cloned();
        let _cycle = match &handle {
            Some(handle) => {
                let guard = handle.lock_cycle().await;
                handle.retire();
                Some(guard)
            }
            None => None,
        };

        self.handles.lock().remove(account);
        self.cursors.clear(account)?;
        info!(%account, "sync state reset");
        Ok(())
    }

    /// Registers `accounts` if needed, then drains every registered account
    /// concurrently.
    ///
    /// One account's failure never affects another. Dropping the returned
    /// future aborts the account tasks at their next suspension point.
    pub async fn sync_accounts(
        self: &Arc<Self>,
        accounts: impl IntoIterator<Item = AccountId>,
    ) -> SyncSummary {
        for account in accounts {
            self.handle(&account);
        }
        let handles: Vec<Arc<SyncHandle>> = self.handles.lock().values().cloned().collect();

        let mut pending = BTreeSet::new();
        let mut tasks = JoinSet::new();
        for handle in handles {
            let manager = Arc::clone(self);
            pending.insert(handle.account().clone());
            tasks.spawn(async move {
                let result = manager.run_cycle(&handle).await;
                (handle.account().clone(), result)
            });
        }

        let mut summary = SyncSummary::default();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((account, result)) => {
                    pending.remove(&account);
                    summary.results.insert(account, result);
                }
                Err(e) => error!(error = %e, "account task failed"),
            }
        }
        for account in pending {
            summary
                .results
                .insert(account, Err(SyncError::handler("account task panicked")));
        }

        debug!(
            accounts = summary.len(),
            succeeded = summary.succeeded(),
            "sync round finished"
        );
        summary
    }

    /// Registers `account` if needed and drains it.
    ///
    /// Returns [`SyncError::Cancelled`] if the account is reset while this
    /// call waits for a running cycle.
    pub async fn sync_account(&self, account: &AccountId) -> SyncResult<CycleResult> {
        let handle = self.handle(account);
        self.run_cycle(&handle).await
    }

    async fn run_cycle(&self, handle: &SyncHandle) -> SyncResult<CycleResult> {
        let span = info_span!("sync_cycle", account = %handle.account());
        async {
            let _cycle = handle.lock_cycle().await;
            if handle.is_retired() {
                debug!("account was reset while the cycle waited");
                return Err(SyncError::Cancelled);
            }
            handle.reset_state();

            let start = Instant::now();
            let outcome = self.drain(handle).await;

            handle.update_stats(|stats| {
                stats.last_sync_time = Some(Instant::now());
                match &outcome {
                    Ok(_) => stats.cycles_completed += 1,
                    Err(e) => {
                        stats.cycles_failed += 1;
                        stats.last_error = Some(e.to_string());
                    }
                }
            });

            match outcome {
                Ok(mut result) => {
                    result.duration = start.elapsed();
                    debug!(
                        batches = result.batches_fetched,
                        events = result.events_applied,
                        cursor = %result.final_state,
                        "cycle finished"
                    );
                    Ok(result)
                }
                Err(e) => {
                    error!(error = %e, "cycle failed");
                    Err(e)
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Runs one cycle. A bootstrap only establishes the starting cursor: it
    /// returns without fetching events, which the next cycle picks up.
    async fn drain(&self, handle: &SyncHandle) -> SyncResult<CycleResult> {
        let account = handle.account();
        self.check_cancelled()?;

        let initial_state = self.cursors.load(account)?;
        let mut result = CycleResult::new(account.clone(), initial_state.clone());

        let mut cursor = match initial_state {
            CursorState::Valid(cursor) => cursor,
            state => {
                let cursor = self.bootstrap(handle, &state).await?;
                result.bootstrapped = true;
                result.contacts_refreshed = true;
                result.final_state = CursorState::Valid(cursor);
                return Ok(result);
            }
        };

        loop {
            let client = self.client();
            let batch = self
                .with_timeout(client.fetch_events(account, &cursor))
                .await?;
            result.batches_fetched += 1;
            handle.update_stats(|s| s.batches_fetched += 1);
            debug!(
                from = %cursor,
                next = %batch.next_cursor,
                events = batch.events.len(),
                more = batch.has_more,
                "batch fetched"
            );

            if batch.contacts_changed {
                self.refresh_contacts(handle).await?;
                result.contacts_refreshed = true;
            }

            if batch.force_full_refresh {
                info!(discarded = batch.events.len(), "server requested full refresh");
                self.full_refresh(handle).await?;
                handle.update_stats(|s| s.full_refreshes += 1);
                result.full_refresh = true;
                result.final_state = CursorState::Locked;
                return Ok(result);
            }

            if !handle.stage(&batch.events).await? {
                warn!(cursor = %cursor, events = batch.events.len(), "batch rejected by staging");
                handle.update_stats(|s| s.staging_rejections += 1);
                result.staging_rejected = true;
                return Ok(result);
            }
            handle.write(&batch).await?;
            self.cursors.set(account, &batch.next_cursor)?;

            let applied = batch.events.len() as u64;
            result.events_applied += applied;
            result.final_state = CursorState::Valid(batch.next_cursor.clone());
            handle.update_stats(|s| s.events_applied += applied);

            if !batch.has_more {
                return Ok(result);
            }
            cursor = batch.next_cursor;
            self.check_cancelled()?;
        }
    }

    async fn bootstrap(&self, handle: &SyncHandle, state: &CursorState) -> SyncResult<Cursor> {
        let account = handle.account();
        info!(%state, "bootstrapping account");

        self.refresh_contacts(handle).await?;
        self.full_refresh(handle).await?;

        let client = self.client();
        let cursor = self
            .with_timeout(client.fetch_latest_cursor(account))
            .await?;
        self.cursors.set(account, &cursor)?;
        handle.update_stats(|s| s.bootstraps += 1);
        info!(%cursor, "bootstrap complete");
        Ok(cursor)
    }

    async fn refresh_contacts(&self, handle: &SyncHandle) -> SyncResult<()> {
        let _gate = self.refresh_gate.lock().await;
        debug!("refreshing contacts");
        handle.refresh_contacts().await
    }

    /// Writes the locked marker, then rebuilds the mailbox. A crash in
    /// between leaves the account locked, which bootstraps on the next sync.
    async fn full_refresh(&self, handle: &SyncHandle) -> SyncResult<()> {
        let _gate = self.refresh_gate.lock().await;
        self.cursors.lock(handle.account())?;
        debug!("refreshing mailbox");
        handle.refresh().await
    }

    async fn with_timeout<T>(&self, fetch: impl Future<Output = SyncResult<T>>) -> SyncResult<T> {
        tokio::time::timeout(self.config.request_timeout, fetch)
            .await
            .map_err(|_| SyncError::Timeout)?
    }
}

impl std::fmt::Debug for EventManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventManager")
            .field("config", &self.config)
            .field("accounts", &self.accounts())
            .field("cancelled", &self.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor::NEXT_EVENT_CURSOR_KEY;
    use crate::handler::{EventHandler, HandlerState};
    use crate::memory_handler::{MemoryEventHandler, MemoryHandlerFactory};
    use crate::transport::{FetchCall, ScriptedClient};
    use async_trait::async_trait;
    use mailsync_protocol::{EventBatch, EventRecord, TargetType};
    use mailsync_storage::{InMemoryProvider, StorageProvider};
    use std::sync::atomic::AtomicUsize;

    struct Fixture {
        client: Arc<ScriptedClient>,
        factory: Arc<MemoryHandlerFactory>,
        provider: Arc<InMemoryProvider>,
        manager: Arc<EventManager>,
    }

    impl Fixture {
        fn new() -> Self {
            Self::with_config(SyncConfig::default())
        }

        fn with_config(config: SyncConfig) -> Self {
            let client = Arc::new(ScriptedClient::new());
            let factory = Arc::new(MemoryHandlerFactory::new());
            let provider = Arc::new(InMemoryProvider::new());
            let manager = Arc::new(EventManager::new(
                config,
                client.clone(),
                factory.clone(),
                provider.clone(),
            ));
            Self {
                client,
                factory,
                provider,
                manager,
            }
        }

        fn seed_cursor(&self, account: &AccountId, value: &str) {
            self.provider
                .seed(account.as_str(), NEXT_EVENT_CURSOR_KEY, value);
        }

        fn state(&self, account: &AccountId) -> CursorState {
            self.manager.cursors().load(account).unwrap()
        }

        fn handler(&self, account: &AccountId) -> Arc<MemoryEventHandler> {
            self.factory.handler(account).unwrap()
        }
    }

    fn u(id: &str) -> AccountId {
        AccountId::from(id)
    }

    fn cursor(token: &str) -> Cursor {
        Cursor::new(token).unwrap()
    }

    fn valid(token: &str) -> CursorState {
        CursorState::Valid(cursor(token))
    }

    fn add_message(id: &str) -> EventRecord {
        EventRecord::create(TargetType::Message, id, id.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn bootstrap_without_cursor() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.client.push_latest(&u1, cursor("E1"));

        let result = fx.manager.sync_account(&u1).await.unwrap();

        assert_eq!(fx.state(&u1), valid("E1"));
        let calls = fx.handler(&u1).calls();
        assert_eq!(calls.refresh_contacts, 1);
        assert_eq!(calls.refresh, 1);
        assert_eq!(calls.stage, 0);
        assert_eq!(fx.client.events_calls(&u1), 0);
        assert_eq!(fx.client.calls_for(&u1), vec![FetchCall::LatestCursor(u1)]);
        assert!(result.bootstrapped);
        assert_eq!(result.initial_state, CursorState::Absent);
        assert_eq!(result.final_state, valid("E1"));
    }

    #[tokio::test]
    async fn incremental_batch_is_staged_written_and_persisted() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client
            .push_batch(&u1, EventBatch::new(vec![add_message("X")], cursor("E2")));

        let result = fx.manager.sync_account(&u1).await.unwrap();

        let handler = fx.handler(&u1);
        assert_eq!(handler.staged_batches(), vec![vec![add_message("X")]]);
        assert_eq!(handler.calls().write, 1);
        assert_eq!(handler.calls().refresh, 0);
        assert_eq!(fx.state(&u1), valid("E2"));
        assert_eq!(
            fx.client.calls_for(&u1),
            vec![FetchCall::Events(u1.clone(), cursor("E1"))]
        );
        assert_eq!(result.events_applied, 1);
        assert!(!result.bootstrapped);
    }

    /// Records the cursor stored at the moment `write` runs.
    struct CursorProbe {
        inner: MemoryEventHandler,
        provider: Arc<InMemoryProvider>,
        seen: Mutex<Vec<Option<String>>>,
    }

    #[async_trait]
    impl EventHandler for CursorProbe {
        async fn refresh_contacts(&self) -> SyncResult<()> {
            self.inner.refresh_contacts().await
        }

        async fn refresh(&self) -> SyncResult<()> {
            self.inner.refresh().await
        }

        async fn stage(&self, events: &[EventRecord]) -> bool {
            self.inner.stage(events).await
        }

        async fn write(&self, batch: &EventBatch) -> SyncResult<()> {
            let stored = self
                .provider
                .open("u1")?
                .get(NEXT_EVENT_CURSOR_KEY)?;
            self.seen.lock().push(stored);
            self.inner.write(batch).await
        }
    }

    #[tokio::test]
    async fn cursor_advances_only_after_write() {
        let client = Arc::new(ScriptedClient::new());
        let provider = Arc::new(InMemoryProvider::new());
        let probe = Arc::new(CursorProbe {
            inner: MemoryEventHandler::new(),
            provider: provider.clone(),
            seen: Mutex::new(Vec::new()),
        });
        let factory_probe = probe.clone();
        let factory = move |_: &AccountId| -> Arc<dyn EventHandler> { factory_probe.clone() };
        let manager = EventManager::new(
            SyncConfig::default(),
            client.clone(),
            Arc::new(factory),
            provider.clone(),
        );

        let u1 = u("u1");
        provider.seed("u1", NEXT_EVENT_CURSOR_KEY, "E1");
        client.push_batch(
            &u1,
            EventBatch::new(vec![add_message("A")], cursor("E2")).with_more(true),
        );
        client.push_batch(&u1, EventBatch::new(vec![add_message("B")], cursor("E3")));

        manager.sync_account(&u1).await.unwrap();

        assert_eq!(
            *probe.seen.lock(),
            vec![Some("E1".to_string()), Some("E2".to_string())]
        );
        assert_eq!(manager.cursors().get(&u1).unwrap(), Some(cursor("E3")));
    }

    #[tokio::test]
    async fn write_failure_keeps_cursor() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.manager.handle(&u1);
        fx.handler(&u1).set_fail_writes(true);
        fx.client
            .push_batch(&u1, EventBatch::new(vec![add_message("X")], cursor("E2")));

        let err = fx.manager.sync_account(&u1).await.unwrap_err();

        assert!(matches!(err, SyncError::Write(_)));
        assert_eq!(fx.state(&u1), valid("E1"));
        let stats = fx.manager.stats(&u1).unwrap();
        assert_eq!(stats.cycles_failed, 1);
        assert!(stats.last_error.unwrap().contains("E2"));
    }

    #[tokio::test]
    async fn staging_rejection_is_silent_and_non_destructive() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        let invalid = EventRecord::create(TargetType::Message, "", vec![1]);
        fx.client.push_batch(
            &u1,
            EventBatch::new(vec![add_message("X"), invalid], cursor("E2")).with_more(true),
        );

        let result = fx.manager.sync_account(&u1).await.unwrap();

        assert!(result.staging_rejected);
        assert_eq!(fx.handler(&u1).calls().write, 0);
        assert!(fx.handler(&u1).is_empty());
        assert_eq!(fx.state(&u1), valid("E1"));
        assert_eq!(fx.client.events_calls(&u1), 1);
        assert_eq!(fx.manager.stats(&u1).unwrap().staging_rejections, 1);
    }

    #[tokio::test]
    async fn full_refresh_short_circuits_the_batch() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.push_batch(
            &u1,
            EventBatch::new(vec![add_message("X")], cursor("E2"))
                .with_more(true)
                .with_full_refresh(),
        );
        fx.client
            .push_batch(&u1, EventBatch::new(vec![add_message("Y")], cursor("E3")));

        let result = fx.manager.sync_account(&u1).await.unwrap();

        let calls = fx.handler(&u1).calls();
        assert_eq!(calls.refresh, 1);
        assert_eq!(calls.stage, 0);
        assert_eq!(calls.write, 0);
        assert_eq!(fx.client.events_calls(&u1), 1);
        assert_eq!(fx.state(&u1), CursorState::Locked);
        assert!(result.full_refresh);
        assert_eq!(result.final_state, CursorState::Locked);
    }

    #[tokio::test]
    async fn drain_loop_follows_has_more() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        for (i, more) in [true, true, false].into_iter().enumerate() {
            let next = format!("E{}", i + 2);
            fx.client.push_batch(
                &u1,
                EventBatch::new(vec![add_message(&next)], cursor(&next)).with_more(more),
            );
        }
        fx.client
            .push_batch(&u1, EventBatch::new(vec![], cursor("never")));

        let result = fx.manager.sync_account(&u1).await.unwrap();

        assert_eq!(fx.client.events_calls(&u1), 3);
        assert_eq!(result.batches_fetched, 3);
        assert_eq!(result.events_applied, 3);
        assert_eq!(fx.state(&u1), valid("E4"));
        assert_eq!(
            fx.client.calls_for(&u1),
            vec![
                FetchCall::Events(u1.clone(), cursor("E1")),
                FetchCall::Events(u1.clone(), cursor("E2")),
                FetchCall::Events(u1.clone(), cursor("E3")),
            ]
        );
    }

    #[tokio::test]
    async fn locked_cursor_bootstraps_like_absent() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "");
        fx.client.push_latest(&u1, cursor("E5"));

        let result = fx.manager.sync_account(&u1).await.unwrap();

        assert_eq!(result.initial_state, CursorState::Locked);
        assert!(result.bootstrapped);
        let calls = fx.handler(&u1).calls();
        assert_eq!((calls.refresh_contacts, calls.refresh), (1, 1));
        assert_eq!(fx.client.events_calls(&u1), 0);
        assert_eq!(fx.state(&u1), valid("E5"));
    }

    #[tokio::test]
    async fn full_refresh_then_next_sync_bootstraps() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client
            .push_batch(&u1, EventBatch::new(vec![], cursor("E2")).with_full_refresh());
        fx.client.push_latest(&u1, cursor("E9"));

        fx.manager.sync_account(&u1).await.unwrap();
        fx.manager.sync_account(&u1).await.unwrap();

        assert_eq!(fx.state(&u1), valid("E9"));
        assert_eq!(fx.handler(&u1).calls().refresh, 2);
    }

    #[tokio::test]
    async fn failed_latest_cursor_leaves_account_locked() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.client.push_latest_error(&u1, 2500, "internal");

        let err = fx.manager.sync_account(&u1).await.unwrap_err();

        assert_eq!(err.remote_code(), Some(2500));
        assert_eq!(fx.state(&u1), CursorState::Locked);
    }

    #[tokio::test]
    async fn remote_error_propagates_and_keeps_cursor() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.push_events_error(&u1, 2001, "invalid cursor");

        let err = fx.manager.sync_account(&u1).await.unwrap_err();

        assert_eq!(err.remote_code(), Some(2001));
        assert_eq!(fx.state(&u1), valid("E1"));
        assert_eq!(fx.handler(&u1).calls().stage, 0);
    }

    #[tokio::test]
    async fn contacts_changed_refreshes_contacts_and_applies() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.push_batch(
            &u1,
            EventBatch::new(vec![add_message("X")], cursor("E2")).with_contacts_changed(),
        );

        let result = fx.manager.sync_account(&u1).await.unwrap();

        let calls = fx.handler(&u1).calls();
        assert_eq!(calls.refresh_contacts, 1);
        assert_eq!(calls.refresh, 0);
        assert_eq!(calls.write, 1);
        assert!(result.contacts_refreshed);
        assert_eq!(fx.state(&u1), valid("E2"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn accounts_are_isolated() {
        let fx = Fixture::new();
        let (u1, u2) = (u("u1"), u("u2"));
        fx.seed_cursor(&u1, "A1");
        fx.seed_cursor(&u2, "B1");
        fx.client.push_events_error(&u1, 2500, "boom");
        fx.client
            .push_batch(&u2, EventBatch::new(vec![add_message("X")], cursor("B2")));

        let summary = fx.manager.sync_accounts([u1.clone(), u2.clone()]).await;

        assert_eq!(summary.len(), 2);
        assert_eq!(summary.succeeded(), 1);
        assert!(summary.get(&u1).unwrap().is_err());
        assert!(summary.get(&u2).unwrap().is_ok());
        assert_eq!(fx.state(&u1), valid("A1"));
        assert_eq!(fx.state(&u2), valid("B2"));
        let failed: Vec<_> = summary.failures().map(|(a, _)| a.clone()).collect();
        assert_eq!(failed, vec![u1]);
        assert!(summary.into_result().is_err());
    }

    #[tokio::test]
    async fn handles_are_created_once() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.push_batch(&u1, EventBatch::new(vec![], cursor("E2")));
        fx.client.push_batch(&u1, EventBatch::new(vec![], cursor("E3")));

        let first = fx.manager.handle(&u1);
        fx.manager.sync_accounts([u1.clone(), u1.clone()]).await;
        fx.manager.sync_accounts([u1.clone()]).await;

        assert_eq!(fx.factory.created(), 1);
        assert!(Arc::ptr_eq(&first, &fx.manager.handle(&u1)));
        assert_eq!(fx.manager.stats(&u1).unwrap().cycles_completed, 2);
    }

    #[tokio::test]
    async fn registered_accounts_are_synced_on_every_round() {
        let fx = Fixture::new();
        let (u1, u2) = (u("u1"), u("u2"));
        fx.client.push_latest(&u1, cursor("A1"));
        fx.client.push_latest(&u2, cursor("B1"));
        fx.client.push_batch(&u1, EventBatch::new(vec![], cursor("A2")));

        fx.manager.sync_accounts([u1.clone()]).await;
        let summary = fx.manager.sync_accounts([u2.clone()]).await;

        assert_eq!(summary.len(), 2);
        assert_eq!(fx.manager.accounts(), vec![u1.clone(), u2.clone()]);
        assert_eq!(fx.state(&u1), valid("A2"));
        assert_eq!(fx.state(&u2), valid("B1"));
        assert_eq!(summary.into_result().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn cancelled_manager_does_not_fetch() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.push_batch(&u1, EventBatch::new(vec![], cursor("E2")));

        fx.manager.cancel();
        assert!(matches!(
            fx.manager.sync_account(&u1).await,
            Err(SyncError::Cancelled)
        ));
        assert!(fx.client.calls().is_empty());

        fx.manager.reset_cancel();
        fx.manager.sync_account(&u1).await.unwrap();
        assert_eq!(fx.state(&u1), valid("E2"));
    }

    #[tokio::test]
    async fn slow_fetch_times_out() {
        let fx = Fixture::with_config(SyncConfig::new().with_timeout(Duration::from_millis(20)));
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.set_delay(Duration::from_millis(500));
        fx.client.push_batch(&u1, EventBatch::new(vec![], cursor("E2")));

        let err = fx.manager.sync_account(&u1).await.unwrap_err();

        assert!(matches!(err, SyncError::Timeout));
        assert!(err.is_retryable());
        assert_eq!(fx.state(&u1), valid("E1"));
    }

    #[tokio::test]
    async fn swapped_client_is_used_and_cursor_kept() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");

        let replacement = Arc::new(ScriptedClient::new());
        replacement.push_batch(&u1, EventBatch::new(vec![], cursor("E2")));
        fx.manager.swap_fetch_client(replacement.clone());
        assert_eq!(fx.state(&u1), valid("E1"));

        fx.manager.sync_account(&u1).await.unwrap();

        assert!(fx.client.calls().is_empty());
        assert_eq!(replacement.events_calls(&u1), 1);
        assert_eq!(fx.state(&u1), valid("E2"));
    }

    #[tokio::test]
    async fn reset_account_forgets_only_that_account() {
        let fx = Fixture::new();
        let (u1, u2) = (u("u1"), u("u2"));
        fx.seed_cursor(&u1, "A1");
        fx.seed_cursor(&u2, "B1");
        fx.manager.handle(&u1);
        fx.manager.handle(&u2);

        fx.manager.reset_account(&u1).await.unwrap();

        assert_eq!(fx.state(&u1), CursorState::Absent);
        assert_eq!(fx.state(&u2), valid("B1"));
        assert_eq!(fx.manager.accounts(), vec![u2]);
    }

    #[tokio::test]
    async fn reset_state_forgets_everything() {
        let fx = Fixture::new();
        fx.seed_cursor(&u("u1"), "A1");
        fx.seed_cursor(&u("u2"), "B1");
        fx.manager.handle(&u("u1"));

        fx.manager.reset_state().await.unwrap();

        assert!(fx.manager.accounts().is_empty());
        assert!(fx.provider.namespaces().unwrap().is_empty());
        assert_eq!(fx.state(&u("u2")), CursorState::Absent);
    }

    #[tokio::test]
    async fn reset_waits_for_running_cycle() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.set_delay(Duration::from_millis(200));
        fx.client
            .push_batch(&u1, EventBatch::new(vec![add_message("X")], cursor("E2")));

        let manager = fx.manager.clone();
        let account = u1.clone();
        let running = tokio::spawn(async move { manager.sync_account(&account).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        fx.manager.reset_account(&u1).await.unwrap();

        assert_eq!(running.await.unwrap().unwrap().final_state, valid("E2"));
        assert_eq!(fx.state(&u1), CursorState::Absent);
        assert!(fx.provider.namespaces().unwrap().is_empty());
        assert!(fx.manager.accounts().is_empty());
    }

    #[tokio::test]
    async fn sync_queued_behind_reset_does_not_run() {
        let fx = Fixture::new();
        let u1 = u("u1");
        fx.seed_cursor(&u1, "E1");
        fx.client.set_delay(Duration::from_millis(200));
        fx.client
            .push_batch(&u1, EventBatch::new(vec![add_message("X")], cursor("E2")));

        let manager = fx.manager.clone();
        let account = u1.clone();
        let first = tokio::spawn(async move { manager.sync_account(&account).await });
        tokio::time::sleep(Duration::from_millis(50)).await;

        let manager = fx.manager.clone();
        let account = u1.clone();
        let reset = tokio::spawn(async move { manager.reset_account(&account).await });
        tokio::time::sleep(Duration::from_millis(10)).await;

        let second = fx.manager.sync_account(&u1).await;
        assert!(matches!(second, Err(SyncError::Cancelled)));
        reset.await.unwrap().unwrap();
        first.await.unwrap().unwrap();

        assert_eq!(fx.client.events_calls(&u1), 1);
        assert_eq!(fx.state(&u1), CursorState::Absent);

        fx.client.push_latest(&u1, cursor("E9"));
        let result = fx.manager.sync_account(&u1).await.unwrap();
        assert!(result.bootstrapped);
        assert_eq!(fx.state(&u1), valid("E9"));
    }

    #[tokio::test]
    async fn reset_state_waits_for_every_running_cycle() {
        let fx = Fixture::new();
        let (u1, u2) = (u("u1"), u("u2"));
        for account in [&u1, &u2] {
            fx.seed_cursor(account, "E1");
            fx.client
                .push_batch(account, EventBatch::new(vec![], cursor("E2")));
        }
        fx.client.set_delay(Duration::from_millis(100));

        let manager = fx.manager.clone();
        let accounts = [u1.clone(), u2.clone()];
        let round = tokio::spawn(async move { manager.sync_accounts(accounts).await });
        tokio::time::sleep(Duration::from_millis(30)).await;

        fx.manager.reset_state().await.unwrap();

        assert_eq!(round.await.unwrap().succeeded(), 2);
        assert!(fx.provider.namespaces().unwrap().is_empty());
        assert_eq!(fx.state(&u1), CursorState::Absent);
        assert_eq!(fx.state(&u2), CursorState::Absent);
    }

    /// Stalls the first `write` so the round can be dropped inside it.
    struct StalledWrite {
        inner: MemoryEventHandler,
        stall: AtomicBool,
    }

    #[async_trait]
    impl EventHandler for StalledWrite {
        async fn refresh_contacts(&self) -> SyncResult<()> {
            self.inner.refresh_contacts().await
        }

        async fn refresh(&self) -> SyncResult<()> {
            self.inner.refresh().await
        }

        async fn stage(&self, events: &[EventRecord]) -> bool {
            self.inner.stage(events).await
        }

        async fn write(&self, batch: &EventBatch) -> SyncResult<()> {
            if self.stall.swap(false, Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
            self.inner.write(batch).await
        }
    }

    #[tokio::test]
    async fn dropped_round_keeps_cursor_of_unfinished_write() {
        let client = Arc::new(ScriptedClient::new());
        let provider = Arc::new(InMemoryProvider::new());
        let handler = Arc::new(StalledWrite {
            inner: MemoryEventHandler::new(),
            stall: AtomicBool::new(true),
        });
        let factory_handler = handler.clone();
        let factory = move |_: &AccountId| -> Arc<dyn EventHandler> { factory_handler.clone() };
        let manager = Arc::new(EventManager::new(
            SyncConfig::default(),
            client.clone(),
            Arc::new(factory),
            provider.clone(),
        ));

        let u1 = u("u1");
        provider.seed("u1", NEXT_EVENT_CURSOR_KEY, "E1");
        let batch = EventBatch::new(vec![add_message("X")], cursor("E2"));
        client.push_batch(&u1, batch.clone());
        client.push_batch(&u1, batch);

        let round =
            tokio::time::timeout(Duration::from_millis(50), manager.sync_accounts([u1.clone()]))
                .await;
        assert!(round.is_err());
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert_eq!(manager.cursors().load(&u1).unwrap(), valid("E1"));
        assert_eq!(manager.handle(&u1).state(), HandlerState::Applying);
        assert!(handler.inner.is_empty());

        let result = manager.sync_account(&u1).await.unwrap();

        assert_eq!(result.events_applied, 1);
        assert_eq!(manager.handle(&u1).state(), HandlerState::Idle);
        assert_eq!(manager.cursors().load(&u1).unwrap(), valid("E2"));
        assert_eq!(
            client.calls_for(&u1),
            vec![
                FetchCall::Events(u1.clone(), cursor("E1")),
                FetchCall::Events(u1.clone(), cursor("E1")),
            ]
        );
        assert_eq!(handler.inner.ids(TargetType::Message), vec!["X".to_string()]);
    }

    /// Tracks how many refreshes run at once across all accounts.
    #[derive(Default)]
    struct GateProbe {
        inner: MemoryEventHandler,
        running: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
    }

    impl GateProbe {
        async fn enter(&self) {
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(10)).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl EventHandler for GateProbe {
        async fn refresh_contacts(&self) -> SyncResult<()> {
            self.enter().await;
            self.inner.refresh_contacts().await
        }

        async fn refresh(&self) -> SyncResult<()> {
            self.enter().await;
            self.inner.refresh().await
        }

        async fn stage(&self, events: &[EventRecord]) -> bool {
            self.inner.stage(events).await
        }

        async fn write(&self, batch: &EventBatch) -> SyncResult<()> {
            self.inner.write(batch).await
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn refreshes_never_overlap_across_accounts() {
        let client = Arc::new(ScriptedClient::new());
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (factory_running, factory_peak) = (running.clone(), peak.clone());
        let factory = move |_: &AccountId| -> Arc<dyn EventHandler> {
            Arc::new(GateProbe {
                inner: MemoryEventHandler::new(),
                running: factory_running.clone(),
                peak: factory_peak.clone(),
            })
        };
        let manager = Arc::new(EventManager::new(
            SyncConfig::default(),
            client.clone(),
            Arc::new(factory),
            Arc::new(InMemoryProvider::new()),
        ));

        let accounts: Vec<_> = (0..6).map(|i| u(&format!("u{i}"))).collect();
        for account in &accounts {
            client.push_latest(account, cursor("E1"));
        }

        let summary = manager.sync_accounts(accounts.clone()).await;

        assert_eq!(summary.succeeded(), 6);
        assert_eq!(peak.load(Ordering::SeqCst), 1);
        assert_eq!(running.load(Ordering::SeqCst), 0);
    }
}
