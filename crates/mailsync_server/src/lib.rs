//! # MailSync Server
//!
//! Reference event-log server for MailSync.
//!
//! This crate provides:
//! - The latest-cursor and events endpoints over CBOR
//! - Per-account event logs with paging and refresh flags
//! - Compaction with a full-refresh fallback for stale cursors
//! - Authentication (HMAC-SHA256 tokens bound to one account)
//!
//! # Cursors
//!
//! A cursor names a position in one account's log. The newest cursor is
//! handed out for bootstrap; every page returns the cursor that follows its
//! last event. A cursor from before the compaction horizon is answered with
//! an empty page flagged "refresh everything" and the current head.
//!
//! # Authentication
//!
//! Authentication is optional:
//!
//! ```rust
//! use mailsync_protocol::AccountId;
//! use mailsync_server::{EventServer, ServerConfig};
//!
//! let server = EventServer::new(ServerConfig::new().with_auth(b"server-secret".to_vec()));
//! let token = server.issue_token(&AccountId::from("u1")).unwrap();
//! assert!(!token.is_empty());
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::unwrap_used, clippy::expect_used, clippy::panic)]

mod auth;
mod config;
mod error;
mod eventlog;
mod handler;
mod server;

pub use auth::{AuthConfig, TokenValidator};
pub use config::ServerConfig;
pub use error::{ServerError, ServerResult};
pub use eventlog::{EventLog, Page};
pub use handler::{HandlerContext, RequestHandler};
pub use server::{EventServer, EVENTS_PATH, LATEST_CURSOR_PATH};
