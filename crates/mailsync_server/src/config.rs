//! Server configuration.

use std::time::Duration;

/// Configuration for the event-log server.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Maximum number of events per page.
    pub max_page_size: u32,
    /// Number of events kept per account; older ones are compacted away.
    /// `None` keeps everything.
    pub retain_events: Option<usize>,
    /// Whether to require authentication.
    pub require_auth: bool,
    /// Secret key for token validation (if auth enabled).
    pub auth_secret: Option<Vec<u8>>,
    /// Lifetime of issued tokens.
    pub token_expiry: Duration,
}

impl ServerConfig {
    /// Creates a configuration with default values.
    pub fn new() -> Self {
        Self {
            max_page_size: 50,
            retain_events: None,
            require_auth: false,
            auth_secret: None,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the maximum page size. Zero is treated as one.
    pub fn with_max_page_size(mut self, size: u32) -> Self {
        self.max_page_size = size.max(1);
        self
    }

    /// Keeps at most `count` events per account.
    pub fn with_retained_events(mut self, count: usize) -> Self {
        self.retain_events = Some(count);
        self
    }

    /// Enables authentication with the given secret.
    pub fn with_auth(mut self, secret: Vec<u8>) -> Self {
        self.require_auth = true;
        self.auth_secret = Some(secret);
        self
    }

    /// Sets the token lifetime.
    pub fn with_token_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::new()
    }
}
