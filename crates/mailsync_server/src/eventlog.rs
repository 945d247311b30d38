//! Per-account event logs.

use crate::error::{ServerError, ServerResult};
use mailsync_protocol::{refresh, AccountId, Cursor, EventRecord};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::debug;

/// Formats a log position as a cursor token.
fn cursor_at(position: u64) -> ServerResult<Cursor> {
    Ok(Cursor::new(format!("E{position}"))?)
}

fn parse_cursor(token: &str) -> ServerResult<u64> {
    token
        .strip_prefix('E')
        .and_then(|digits| digits.parse().ok())
        .ok_or_else(|| ServerError::InvalidCursor(token.to_string()))
}

/// One account's log. Positions count events from the start of the log;
/// `base` is the position of the oldest retained event.
#[derive(Debug, Default)]
struct AccountLog {
    base: u64,
    events: VecDeque<EventRecord>,
    pending_refresh: u8,
}

impl AccountLog {
    fn head(&self) -> u64 {
        self.base + self.events.len() as u64
    }

    fn compact(&mut self, keep: usize) -> usize {
        let dropped = self.events.len().saturating_sub(keep);
        self.events.drain(..dropped);
        self.base += dropped as u64;
        dropped
    }
}

/// A page of events served to a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Page {
    /// Events after the requested cursor, in log order.
    pub events: Vec<EventRecord>,
    /// Cursor following the last event of the page.
    pub next: Cursor,
    /// More events follow.
    pub more: bool,
    /// Refresh bits delivered with this page.
    pub refresh: u8,
}

/// Server-side event logs, one per account.
///
/// Cursors are positions in an account's log. A cursor older than the
/// compaction horizon can no longer be served incrementally: the client is
/// told to refresh everything and handed the current head.
#[derive(Debug, Default)]
pub struct EventLog {
    accounts: RwLock<HashMap<AccountId, AccountLog>>,
    retain: Option<usize>,
}

impl EventLog {
    /// Creates an empty log that never compacts on its own.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates an empty log keeping at most `retain` events per account.
    pub fn with_retention(retain: Option<usize>) -> Self {
        Self {
            accounts: RwLock::new(HashMap::new()),
            retain,
        }
    }

    /// Creates the log of `account` if needed and returns its head.
    pub fn create_account(&self, account: &AccountId) -> ServerResult<Cursor> {
        let mut accounts = self.accounts.write();
        let log = accounts.entry(account.clone()).or_default();
        cursor_at(log.head())
    }

    /// Returns true if `account` has a log.
    pub fn contains(&self, account: &AccountId) -> bool {
        self.accounts.read().contains_key(account)
    }

    /// Returns the number of retained events of `account`.
    pub fn len(&self, account: &AccountId) -> usize {
        self.accounts
            .read()
            .get(account)
            .map_or(0, |log| log.events.len())
    }

    /// Appends an event, creating the account's log if needed. Returns the
    /// new head.
    pub fn append(&self, account: &AccountId, event: EventRecord) -> ServerResult<Cursor> {
        let mut accounts = self.accounts.write();
        let log = accounts.entry(account.clone()).or_default();
        log.events.push_back(event);
        if let Some(keep) = self.retain {
            log.compact(keep);
        }
        cursor_at(log.head())
    }

    /// Returns the newest cursor of `account`.
    pub fn latest(&self, account: &AccountId) -> ServerResult<Cursor> {
        let accounts = self.accounts.read();
        let log = accounts
            .get(account)
            .ok_or_else(|| ServerError::UnknownAccount(account.clone()))?;
        cursor_at(log.head())
    }

    /// Flags the next page of `account` with refresh bits.
    pub fn request_refresh(&self, account: &AccountId, flags: u8) -> ServerResult<()> {
        let mut accounts = self.accounts.write();
        let log = accounts
            .get_mut(account)
            .ok_or_else(|| ServerError::UnknownAccount(account.clone()))?;
        log.pending_refresh |= flags;
        debug!(%account, flags, "refresh requested");
        Ok(())
    }

    /// Drops all but the newest `keep` events of `account`. Returns the
    /// number of events dropped.
    pub fn compact(&self, account: &AccountId, keep: usize) -> ServerResult<usize> {
        let mut accounts = self.accounts.write();
        let log = accounts
            .get_mut(account)
            .ok_or_else(|| ServerError::UnknownAccount(account.clone()))?;
        let dropped = log.compact(keep);
        debug!(%account, dropped, base = log.base, "log compacted");
        Ok(dropped)
    }

    /// Serves up to `limit` events after `cursor` (from the oldest retained
    /// event when `cursor` is `None`). Pending refresh bits are delivered
    /// and cleared.
    pub fn page(
        &self,
        account: &AccountId,
        cursor: Option<&str>,
        limit: usize,
    ) -> ServerResult<Page> {
        let mut accounts = self.accounts.write();
        let log = accounts
            .get_mut(account)
            .ok_or_else(|| ServerError::UnknownAccount(account.clone()))?;

        let head = log.head();
        let position = match cursor {
            Some(token) => parse_cursor(token)?,
            None => log.base,
        };
        if position > head {
            return Err(ServerError::InvalidCursor(format!(
                "E{position} is past the head E{head}"
            )));
        }

        let pending = std::mem::take(&mut log.pending_refresh);
        if position < log.base {
            debug!(%account, position, base = log.base, "cursor behind compaction horizon");
            return Ok(Page {
                events: Vec::new(),
                next: cursor_at(head)?,
                more: false,
                refresh: refresh::ALL,
            });
        }

        let start = (position - log.base) as usize;
        let events: Vec<_> = log
            .events
            .iter()
            .skip(start)
            .take(limit.max(1))
            .cloned()
            .collect();
        let next = position + events.len() as u64;

        Ok(Page {
            events,
            next: cursor_at(next)?,
            more: next < head,
            refresh: pending,
        })
    }
}
