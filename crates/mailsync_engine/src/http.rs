//! HTTP transport implementation.
//!
//! This module provides an HTTP-based [`EventFetchClient`]. The actual HTTP
//! client is abstracted via a trait so that any HTTP library (or an
//! in-process loopback) can carry the CBOR bodies.

use crate::config::{RetryConfig, SyncConfig};
use crate::error::{SyncError, SyncResult};
use crate::transport::EventFetchClient;
use async_trait::async_trait;
use mailsync_protocol::{
    AccountId, Cursor, EventBatch, EventsRequest, EventsResponse, LatestCursorRequest,
    LatestCursorResponse, WireMessage,
};
use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Path of the latest-cursor endpoint.
pub const LATEST_CURSOR_PATH: &str = "/events/latest";
/// Path of the events endpoint.
pub const EVENTS_PATH: &str = "/events";

/// HTTP client abstraction.
///
/// Implement this trait to provide the actual HTTP transport.
#[async_trait]
pub trait HttpClient: Send + Sync {
    /// Sends a POST request and returns the response body.
    ///
    /// An `Err` means the request never produced a response body
    /// (connection refused, reset, DNS failure) and may be retried.
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String>;

    /// Checks if the client is connected/healthy.
    fn is_healthy(&self) -> bool;
}

/// Supplies the credentials attached to each request of an account.
pub trait TokenSource: Send + Sync {
    /// Returns the token for `account`, or `None` to send the request bare.
    fn token_for(&self, account: &AccountId) -> Option<Vec<u8>>;
}

impl<F> TokenSource for F
where
    F: Fn(&AccountId) -> Option<Vec<u8>> + Send + Sync,
{
    fn token_for(&self, account: &AccountId) -> Option<Vec<u8>> {
        self(account)
    }
}

/// HTTP-based event fetch client.
///
/// Uses CBOR encoding for request/response bodies. Only the configured
/// success code counts as success; every other code becomes
/// [`SyncError::Remote`] and is never retried here.
pub struct HttpEventClient<C: HttpClient> {
    base_url: String,
    client: C,
    ok_code: u32,
    retry: RetryConfig,
    tokens: Option<Arc<dyn TokenSource>>,
    connected: AtomicBool,
    last_error: RwLock<Option<String>>,
}

impl<C: HttpClient> HttpEventClient<C> {
    /// Creates a client with the default [`SyncConfig`].
    pub fn new(base_url: impl Into<String>, client: C) -> Self {
        Self::with_config(base_url, client, &SyncConfig::default())
    }

    /// Creates a client using the success code and retry policy of `config`.
    pub fn with_config(base_url: impl Into<String>, client: C, config: &SyncConfig) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            client,
            ok_code: config.ok_code,
            retry: config.retry.clone(),
            tokens: None,
            connected: AtomicBool::new(true),
            last_error: RwLock::new(None),
        }
    }

    /// Attaches a credential source.
    pub fn with_tokens(mut self, tokens: Arc<dyn TokenSource>) -> Self {
        self.tokens = Some(tokens);
        self
    }

    /// Returns the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Returns the last transport error message.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    /// Returns true if the client accepts requests.
    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst) && self.client.is_healthy()
    }

    /// Stops accepting requests.
    pub fn close(&self) {
        self.connected.store(false, Ordering::SeqCst);
    }

    fn token(&self, account: &AccountId) -> Option<Vec<u8>> {
        self.tokens.as_ref().and_then(|tokens| tokens.token_for(account))
    }

    async fn post_cbor<Req, Res>(&self, endpoint: &str, request: &Req) -> SyncResult<Res>
    where
        Req: WireMessage + Sync,
        Res: WireMessage,
    {
        let body = request.encode()?;
        let url = format!("{}{}", self.base_url, endpoint);
        let mut delays = self.retry.delays();
        let mut attempt = 1u32;

        loop {
            if !self.is_connected() {
                return Err(SyncError::NotConnected);
            }

            let e = match self.client.post(&url, body.clone()).await {
                Ok(response_body) => {
                    *self.last_error.write() = None;
                    return Ok(Res::decode(&response_body)?);
                }
                Err(e) => e,
            };
            *self.last_error.write() = Some(e.clone());
            let Some(delay) = delays.next() else {
                return Err(SyncError::transport_retryable(e));
            };
            warn!(%url, attempt, ?delay, error = %e, "post failed, retrying");
            tokio::time::sleep(delay).await;
            attempt += 1;
        }
    }

    fn check_code(&self, code: u32, message: Option<String>) -> SyncResult<()> {
        if code == self.ok_code {
            Ok(())
        } else {
            Err(SyncError::remote(code, message.unwrap_or_default()))
        }
    }
}

#[async_trait]
impl<C: HttpClient> EventFetchClient for HttpEventClient<C> {
    async fn fetch_latest_cursor(&self, account: &AccountId) -> SyncResult<Cursor> {
        let mut request = LatestCursorRequest::new(account.clone());
        if let Some(token) = self.token(account) {
            request = request.with_auth_token(token);
        }

        let response: LatestCursorResponse = self.post_cbor(LATEST_CURSOR_PATH, &request).await?;
        self.check_code(response.code, response.error.clone())?;
        let cursor = response.cursor()?;
        debug!(%account, %cursor, "latest cursor fetched");
        Ok(cursor)
    }

    async fn fetch_events(&self, account: &AccountId, cursor: &Cursor) -> SyncResult<EventBatch> {
        let mut request = EventsRequest::new(account.clone(), Some(cursor));
        if let Some(token) = self.token(account) {
            request = request.with_auth_token(token);
        }

        let response: EventsResponse = self.post_cbor(EVENTS_PATH, &request).await?;
        self.check_code(response.code, response.error.clone())?;
        let batch = response.into_batch()?;
        debug!(
            %account,
            events = batch.events.len(),
            next = %batch.next_cursor,
            more = batch.has_more,
            "events page fetched"
        );
        Ok(batch)
    }
}

/// Trait for servers that can handle loopback requests.
pub trait LoopbackServer: Send + Sync {
    /// Handles a POST request and returns the response body.
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String>;
}

impl<S: LoopbackServer + ?Sized> LoopbackServer for Arc<S> {
    fn handle_post(&self, path: &str, body: &[u8]) -> Result<Vec<u8>, String> {
        (**self).handle_post(path, body)
    }
}

/// A loopback HTTP client that routes requests directly to a server.
///
/// Useful for testing without actual network overhead.
pub struct LoopbackClient<S: LoopbackServer> {
    server: S,
    healthy: AtomicBool,
}

impl<S: LoopbackServer> LoopbackClient<S> {
    /// Creates a new loopback client connected to the given server.
    pub fn new(server: S) -> Self {
        Self {
            server,
            healthy: AtomicBool::new(true),
        }
    }

    /// Simulates losing (or regaining) the network.
    pub fn set_healthy(&self, healthy: bool) {
        self.healthy.store(healthy, Ordering::SeqCst);
    }
}

#[async_trait]
impl<S: LoopbackServer> HttpClient for LoopbackClient<S> {
    async fn post(&self, url: &str, body: Vec<u8>) -> Result<Vec<u8>, String> {
        if !self.is_healthy() {
            return Err("network unreachable".into());
        }
        // Route on the endpoint suffix; the base URL may contain anything.
        let path = [LATEST_CURSOR_PATH, EVENTS_PATH]
            .into_iter()
            .find(|endpoint| url.ends_with(endpoint))
            .unwrap_or(url);
        self.server.handle_post(path, &body)
    }

    fn is_healthy(&self) -> bool {
        self.healthy.load(Ordering::SeqCst)
    }
}
