//! Event fetch client contract.

use crate::error::{SyncError, SyncResult};
use async_trait::async_trait;
use mailsync_protocol::{AccountId, Cursor, EventBatch};
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// Remote side of the event log.
///
/// This trait abstracts the network layer, allowing for different
/// implementations (HTTP, loopback, scripted mock for testing).
///
/// Implementations must report any response whose status differs from the
/// configured success code as [`SyncError::Remote`], even when the body
/// parses.
#[async_trait]
pub trait EventFetchClient: Send + Sync {
    /// Fetches the newest cursor of `account`. Used only to bootstrap.
    async fn fetch_latest_cursor(&self, account: &AccountId) -> SyncResult<Cursor>;

    /// Fetches the page of events after `cursor`.
    async fn fetch_events(&self, account: &AccountId, cursor: &Cursor) -> SyncResult<EventBatch>;
}

/// A call observed by [`ScriptedClient`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchCall {
    /// `fetch_latest_cursor(account)`.
    LatestCursor(AccountId),
    /// `fetch_events(account, cursor)`.
    Events(AccountId, Cursor),
}

type Scripted<T> = Result<T, (u32, String)>;

/// A scripted client for testing.
///
/// Responses are queued per account and consumed in order. An empty queue
/// answers with a non-retryable transport error.
#[derive(Debug, Default)]
pub struct ScriptedClient {
    disconnected: AtomicBool,
    delay: Mutex<Option<Duration>>,
    latest: Mutex<HashMap<AccountId, VecDeque<Scripted<Cursor>>>>,
    events: Mutex<HashMap<AccountId, VecDeque<Scripted<EventBatch>>>>,
    calls: Mutex<Vec<FetchCall>>,
}

impl ScriptedClient {
    /// Creates a client with empty scripts.
    pub fn new() -> Self {
        Self::default()
    }

    /// Queues a latest-cursor answer.
    pub fn push_latest(&self, account: &AccountId, cursor: Cursor) {
        self.latest
            .lock()
            .entry(account.clone())
            .or_default()
            .push_back(Ok(cursor));
    }

    /// Queues a failed latest-cursor answer.
    pub fn push_latest_error(&self, account: &AccountId, code: u32, message: &str) {
        self.latest
            .lock()
            .entry(account.clone())
            .or_default()
            .push_back(Err((code, message.to_string())));
    }

    /// Queues an events page.
    pub fn push_batch(&self, account: &AccountId, batch: EventBatch) {
        self.events
            .lock()
            .entry(account.clone())
            .or_default()
            .push_back(Ok(batch));
    }

    /// Queues a failed events answer.
    pub fn push_events_error(&self, account: &AccountId, code: u32, message: &str) {
        self.events
            .lock()
            .entry(account.clone())
            .or_default()
            .push_back(Err((code, message.to_string())));
    }

    /// Delays every answer, simulating a slow network.
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    /// Sets the connected state.
    pub fn set_connected(&self, connected: bool) {
        self.disconnected.store(!connected, Ordering::SeqCst);
    }

    /// Returns every call made so far.
    pub fn calls(&self) -> Vec<FetchCall> {
        self.calls.lock().clone()
    }

    /// Returns the calls made for one account.
    pub fn calls_for(&self, account: &AccountId) -> Vec<FetchCall> {
        self.calls
            .lock()
            .iter()
            .filter(|call| match call {
                FetchCall::LatestCursor(a) | FetchCall::Events(a, _) => a == account,
            })
            .cloned()
            .collect()
    }

    /// Counts `fetch_events` calls for one account.
    pub fn events_calls(&self, account: &AccountId) -> usize {
        self.calls_for(account)
            .iter()
            .filter(|call| matches!(call, FetchCall::Events(..)))
            .count()
    }

    async fn answer<T>(
        &self,
        call: FetchCall,
        queue: &Mutex<HashMap<AccountId, VecDeque<Scripted<T>>>>,
        account: &AccountId,
    ) -> SyncResult<T> {
        self.calls.lock().push(call);

        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.disconnected.load(Ordering::SeqCst) {
            return Err(SyncError::NotConnected);
        }

        let next = queue
            .lock()
            .get_mut(account)
            .and_then(|answers| answers.pop_front());
        match next {
            Some(Ok(value)) => Ok(value),
            Some(Err((code, message))) => Err(SyncError::remote(code, message)),
            None => Err(SyncError::transport_fatal(format!(
                "no scripted response for {account}"
            ))),
        }
    }
}

#[async_trait]
impl EventFetchClient for ScriptedClient {
    async fn fetch_latest_cursor(&self, account: &AccountId) -> SyncResult<Cursor> {
        self.answer(FetchCall::LatestCursor(account.clone()), &self.latest, account)
            .await
    }

    async fn fetch_events(&self, account: &AccountId, cursor: &Cursor) -> SyncResult<EventBatch> {
        self.answer(
            FetchCall::Events(account.clone(), cursor.clone()),
            &self.events,
            account,
        )
        .await
    }
}
