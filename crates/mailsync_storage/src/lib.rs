//! # MailSync Storage
//!
//! Durable key/value storage for MailSync.
//!
//! Storage is split into **namespaces**, one per logged-in account. Each
//! namespace is an independent string-to-string map with commit-on-write
//! durability: once [`StorageBackend::put`] returns, the value survives a
//! process restart.
//!
//! ## Design Principles
//!
//! - Backends store opaque strings; they do not interpret cursors
//! - Every mutation is durable when it returns
//! - Must be `Send + Sync` for concurrent access from account tasks
//! - Providers hand out one shared backend per namespace
//!
//! ## Available Providers
//!
//! - [`InMemoryProvider`] - For testing and ephemeral storage
//! - [`FileProvider`] - One file per namespace under a locked directory
//! - [`EncryptedProvider`] - Wrapper that adds AES-256-GCM encryption of values
//!
//! ## Example
//!
//! ```rust
//! use mailsync_storage::{InMemoryProvider, StorageProvider};
//!
//! let provider = InMemoryProvider::new();
//! let store = provider.open("user-1").unwrap();
//! store.put("latest_event_id", "ev-42").unwrap();
//! assert_eq!(store.get("latest_event_id").unwrap().as_deref(), Some("ev-42"));
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]

mod backend;
#[cfg(feature = "encryption")]
mod encrypted;
mod encoding;
mod error;
mod file;
mod memory;

pub use backend::{StorageBackend, StorageProvider};
#[cfg(feature = "encryption")]
pub use encrypted::{EncryptedBackend, EncryptedProvider, EncryptionKey, KEY_SIZE, NONCE_SIZE};
pub use error::{StorageError, StorageResult};
pub use file::{FileBackend, FileProvider};
pub use memory::{InMemoryBackend, InMemoryProvider};
