//! Authentication support for the event-log server.
//!
//! Tokens are bound to one account and signed with HMAC-SHA256. They carry
//! their issue time so the server can reject expired tokens.
//!
//! ## Token Format
//!
//! - 2 bytes: account id length (big-endian)
//! - N bytes: account id (UTF-8)
//! - 8 bytes: issue time (Unix millis, big-endian)
//! - 32 bytes: HMAC-SHA256 signature over everything before it

use crate::error::{ServerError, ServerResult};
use hmac::{Hmac, Mac};
use mailsync_protocol::AccountId;
use sha2::Sha256;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

type HmacSha256 = Hmac<Sha256>;

const SIGNATURE_LEN: usize = 32;

/// Authentication configuration.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Secret key for HMAC.
    pub secret: Vec<u8>,
    /// Token expiration duration.
    pub token_expiry: Duration,
}

impl AuthConfig {
    /// Creates a new auth configuration with a 24 hour token lifetime.
    pub fn new(secret: Vec<u8>) -> Self {
        Self {
            secret,
            token_expiry: Duration::from_secs(24 * 60 * 60),
        }
    }

    /// Sets the token expiration duration.
    pub fn with_expiry(mut self, expiry: Duration) -> Self {
        self.token_expiry = expiry;
        self
    }
}

/// Issues and checks account tokens.
#[derive(Clone)]
pub struct TokenValidator {
    config: AuthConfig,
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

impl TokenValidator {
    /// Creates a new token validator.
    pub fn new(config: AuthConfig) -> Self {
        Self { config }
    }

    fn mac(&self) -> ServerResult<HmacSha256> {
        HmacSha256::new_from_slice(&self.config.secret)
            .map_err(|e| ServerError::Internal(format!("hmac key: {e}")))
    }

    /// Creates a token for `account`.
    ///
    /// # Errors
    ///
    /// Returns an error if the account id is longer than 65535 bytes.
    pub fn create_token(&self, account: &AccountId) -> ServerResult<Vec<u8>> {
        let id = account.as_str().as_bytes();
        let id_len = u16::try_from(id.len())
            .map_err(|_| ServerError::InvalidRequest("account id too long".into()))?;

        let mut token = Vec::with_capacity(2 + id.len() + 8 + SIGNATURE_LEN);
        token.extend_from_slice(&id_len.to_be_bytes());
        token.extend_from_slice(id);
        token.extend_from_slice(&now_millis().to_be_bytes());

        let mut mac = self.mac()?;
        mac.update(&token);
        token.extend_from_slice(&mac.finalize().into_bytes());
        Ok(token)
    }

    /// Validates a token presented for `expected`.
    pub fn validate_token(&self, token: &[u8], expected: &AccountId) -> ServerResult<()> {
        let invalid = |reason: &str| ServerError::NotAuthorized(reason.to_string());

        if token.len() < 2 + 8 + SIGNATURE_LEN {
            return Err(invalid("token too short"));
        }
        let id_len = u16::from_be_bytes([token[0], token[1]]) as usize;
        if token.len() != 2 + id_len + 8 + SIGNATURE_LEN {
            return Err(invalid("invalid token length"));
        }

        let (signed, signature) = token.split_at(token.len() - SIGNATURE_LEN);
        let mut mac = self.mac()?;
        mac.update(signed);
        mac.verify_slice(signature)
            .map_err(|_| invalid("invalid signature"))?;

        let (id, timestamp) = signed[2..].split_at(id_len);
        if id != expected.as_str().as_bytes() {
            return Err(invalid("account mismatch"));
        }

        let mut millis = [0u8; 8];
        millis.copy_from_slice(timestamp);
        let issued = u64::from_be_bytes(millis);
        let expiry = self.config.token_expiry.as_millis() as u64;
        if now_millis() > issued.saturating_add(expiry) {
            return Err(invalid("token expired"));
        }

        Ok(())
    }
}

impl std::fmt::Debug for TokenValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenValidator")
            .field("token_expiry", &self.config.token_expiry)
            .finish_non_exhaustive()
    }
}
