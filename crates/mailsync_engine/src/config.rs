//! Engine configuration.

use mailsync_protocol::RESPONSE_CODE_OK;
use rand::Rng;
use std::time::Duration;

/// Settings shared by the event manager and its fetch client.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The single response code that counts as success. Anything else,
    /// even with a well-formed body, is a remote failure.
    pub ok_code: u32,
    /// Upper bound on one fetch call, retries included.
    pub request_timeout: Duration,
    /// Backoff for transport failures.
    pub retry: RetryConfig,
}

impl SyncConfig {
    /// Creates the default configuration: OK code 1000, 30 s timeout,
    /// three transport attempts.
    pub fn new() -> Self {
        Self {
            ok_code: RESPONSE_CODE_OK,
            request_timeout: Duration::from_secs(30),
            retry: RetryConfig::default(),
        }
    }

    /// Sets the success response code.
    pub fn with_ok_code(mut self, code: u32) -> Self {
        self.ok_code = code;
        self
    }

    /// Sets the fetch timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the transport backoff.
    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new()
    }
}

/// Exponential backoff for transport failures.
///
/// Remote response codes are never retried; only posts that did not produce
/// a response are.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Total attempts, the first one included. Zero behaves like one.
    pub max_attempts: u32,
    /// Wait before the second attempt.
    pub base_delay: Duration,
    /// Ceiling for any single wait.
    pub max_delay: Duration,
    /// Growth factor between consecutive waits.
    pub factor: f64,
    /// Random extra wait, as a fraction of the computed one (0.0 disables).
    pub jitter: f64,
}

impl RetryConfig {
    /// Creates a backoff with `max_attempts` attempts, starting at 100 ms and
    /// doubling up to 30 s, with 25% jitter.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            factor: 2.0,
            jitter: 0.25,
        }
    }

    /// Creates a configuration that gives up after the first failure.
    pub fn no_retry() -> Self {
        Self::new(1).with_jitter(0.0)
    }

    /// Sets the first wait.
    pub fn with_base_delay(mut self, delay: Duration) -> Self {
        self.base_delay = delay;
        self
    }

    /// Sets the wait ceiling.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Sets the growth factor.
    pub fn with_factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Sets the jitter fraction, clamped to `0.0..=1.0`.
    pub fn with_jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter.clamp(0.0, 1.0);
        self
    }

    /// Returns the waits between attempts: one fewer than `max_attempts`.
    ///
    /// The caller stops retrying when the iterator is exhausted.
    pub fn delays(&self) -> impl Iterator<Item = Duration> + '_ {
        let retries = self.max_attempts.saturating_sub(1);
        (0..retries).map(move |retry| self.delay(retry))
    }

    fn delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let cap = self.max_delay.as_secs_f64();
        let secs = (self.base_delay.as_secs_f64() * self.factor.powi(exponent)).min(cap);
        let extra = if self.jitter > 0.0 {
            secs * self.jitter * rand::thread_rng().gen::<f64>()
        } else {
            0.0
        };
        Duration::from_secs_f64(secs + extra)
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = SyncConfig::default();
        assert_eq!(config.ok_code, 1000);
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.retry.delays().count(), 2);
    }

    #[test]
    fn builder() {
        let config = SyncConfig::new()
            .with_ok_code(200)
            .with_timeout(Duration::from_secs(5))
            .with_retry(RetryConfig::no_retry());

        assert_eq!(config.ok_code, 200);
        assert_eq!(config.request_timeout, Duration::from_secs(5));
        assert_eq!(config.retry.delays().count(), 0);
    }

    #[test]
    fn delays_grow_then_cap() {
        let retry = RetryConfig::new(6)
            .with_base_delay(Duration::from_secs(1))
            .with_max_delay(Duration::from_secs(5))
            .with_jitter(0.0);

        let delays: Vec<u64> = retry.delays().map(|d| d.as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 5, 5]);
    }

    #[test]
    fn jitter_stays_within_fraction() {
        let retry = RetryConfig::new(2).with_base_delay(Duration::from_millis(100));

        for _ in 0..50 {
            let delay = retry.delays().next().unwrap();
            assert!(delay >= Duration::from_millis(100));
            assert!(delay <= Duration::from_millis(125));
        }
    }

    #[test]
    fn zero_attempts_never_waits() {
        assert_eq!(RetryConfig::new(0).delays().count(), 0);
        assert_eq!(RetryConfig::new(4).with_jitter(7.0).jitter, 1.0);
    }
}
