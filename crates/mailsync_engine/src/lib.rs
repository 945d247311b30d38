//! # MailSync Engine
//!
//! Incremental event-sync engine for MailSync accounts.
//!
//! This crate provides:
//! - Durable per-account cursors ([`CursorStore`])
//! - The fetch client contract and an HTTP transport over CBOR
//! - The event handler contract and its per-account state machine
//!   (idle → staging → applying → idle)
//! - The multi-account [`EventManager`] with its drain loop
//!
//! ## Architecture
//!
//! For every account the manager runs a **drain loop**:
//! 1. No usable cursor: bootstrap (reload contacts, rebuild the mailbox,
//!    store the newest remote cursor) and stop
//! 2. Fetch the page after the stored cursor
//! 3. Apply the refresh flags of the page, or stage and write its events
//! 4. Store the page's cursor, and repeat while the server has more
//!
//! ## Key Invariants
//!
//! - A cursor is stored only after `write` returned successfully
//! - A rejected batch never reaches `write` and never moves the cursor
//! - A full refresh writes the locked marker first; an interrupted refresh
//!   bootstraps again
//! - Refreshes never run concurrently, across all accounts
//! - One account's failure never affects another
//!
//! ## Example
//!
//! ```rust,no_run
//! use mailsync_engine::{EventManager, MemoryHandlerFactory, ScriptedClient, SyncConfig};
//! use mailsync_protocol::AccountId;
//! use mailsync_storage::InMemoryProvider;
//! use std::sync::Arc;
//!
//! # async fn run() {
//! let manager = Arc::new(EventManager::new(
//!     SyncConfig::default(),
//!     Arc::new(ScriptedClient::new()),
//!     Arc::new(MemoryHandlerFactory::new()),
//!     Arc::new(InMemoryProvider::new()),
//! ));
//!
//! let summary = manager.sync_accounts([AccountId::from("u1")]).await;
//! for (account, result) in summary.iter() {
//!     println!("{account}: {}", result.is_ok());
//! }
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod config;
mod cursor;
mod error;
mod handler;
mod http;
mod manager;
mod memory_handler;
mod transport;

pub use config::{RetryConfig, SyncConfig};
pub use cursor::{CursorStore, NEXT_EVENT_CURSOR_KEY};
pub use error::{SyncError, SyncResult};
pub use handler::{EventHandler, EventHandlerFactory, HandlerState, SyncHandle, SyncStats};
pub use http::{
    HttpClient, HttpEventClient, LoopbackClient, LoopbackServer, TokenSource, EVENTS_PATH,
    LATEST_CURSOR_PATH,
};
pub use manager::{CycleResult, EventManager, SyncSummary};
pub use memory_handler::{HandlerCalls, MemoryEventHandler, MemoryHandlerFactory};
pub use transport::{EventFetchClient, FetchCall, ScriptedClient};
