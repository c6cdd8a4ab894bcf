//! Retry classification and high-level retry with exponential backoff
//!
//! Low-level HTTP calls are retried by the [`Pacer`](crate::pacer::Pacer),
//! which dispatches on the [`Attempt`] tag produced by [`should_retry`].
//! Whole operations (open, upload, server-side copy) are retried by
//! [`retry_with_backoff`].

use std::time::Duration;

use crate::error::{Error, Result};

/// HTTP status codes that are worth retrying
pub const RETRY_STATUS_CODES: &[u16] = &[
    429, // Too Many Requests
    500, // Internal Server Error
    502, // Bad Gateway
    503, // Service Unavailable
    504, // Gateway Timeout
    509, // Bandwidth Limit Exceeded
];

/// Outcome of one attempt at a remote operation
#[derive(Debug)]
pub enum Attempt<T> {
    /// The call succeeded
    Success(T),
    /// The call failed but may succeed if repeated
    Retry(Error),
    /// The call failed and repeating it won't help
    Abort(Error),
}

impl<T> Attempt<T> {
    pub fn is_retry(&self) -> bool {
        matches!(self, Attempt::Retry(_))
    }

    pub fn into_result(self) -> Result<T> {
        match self {
            Attempt::Success(value) => Ok(value),
            Attempt::Retry(err) | Attempt::Abort(err) => Err(err),
        }
    }
}

/// Classify the result of a remote call for the pacer
pub fn should_retry<T>(result: Result<T>) -> Attempt<T> {
    match result {
        Ok(value) => Attempt::Success(value),
        Err(e) if is_retryable_error(&e) => {
            tracing::debug!(error = %e, "Should retry");
            Attempt::Retry(e)
        }
        Err(e) => Attempt::Abort(e),
    }
}

/// True if an HTTP status code is in the retryable set
pub fn should_retry_http(status: u16) -> bool {
    RETRY_STATUS_CODES.contains(&status)
}

/// Check if an error is retryable (transient)
pub fn is_retryable_error(error: &Error) -> bool {
    match error.root() {
        Error::Http(http) => {
            (http.status == 401 && http.auth_expired) || should_retry_http(http.status)
        }
        Error::Network(msg) => {
            let msg_lower = msg.to_lowercase();
            msg_lower.contains("timeout")
                || msg_lower.contains("timed out")
                || msg_lower.contains("connection reset")
                || msg_lower.contains("connection refused")
                || msg_lower.contains("connection closed")
                || msg_lower.contains("broken pipe")
                || msg_lower.contains("dns error")
                || msg_lower.contains("failed to lookup address")
                || msg_lower.contains("unexpected eof")
        }
        Error::Io(e) => matches!(
            e.kind(),
            std::io::ErrorKind::ConnectionReset
                | std::io::ErrorKind::ConnectionAborted
                | std::io::ErrorKind::ConnectionRefused
                | std::io::ErrorKind::BrokenPipe
                | std::io::ErrorKind::TimedOut
                | std::io::ErrorKind::Interrupted
                | std::io::ErrorKind::UnexpectedEof
        ),
        // Fatal and sentinel errors are never retried
        _ => false,
    }
}

/// Configuration for high-level retries
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 100,
            max_backoff_ms: 10000,
        }
    }
}

/// Retry a fallible async operation with exponential backoff
///
/// Fatal errors stop immediately regardless of `is_retryable`.
///
/// # Example
/// ```ignore
/// let obj = retry_with_backoff(
///     &config,
///     || async { fdst.put(reader, &src).await },
///     is_retryable_error,
/// ).await?;
/// ```
pub async fn retry_with_backoff<T, F, Fut, R>(
    config: &RetryConfig,
    mut operation: F,
    is_retryable: R,
) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T>>,
    R: Fn(&Error) -> bool,
{
    let mut attempt = 0;

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                if attempt >= config.max_attempts || e.is_fatal() || !is_retryable(&e) {
                    return Err(e);
                }

                let backoff = calculate_backoff(config, attempt);
                tracing::debug!(
                    attempt = attempt,
                    max_attempts = config.max_attempts,
                    backoff_ms = backoff.as_millis(),
                    error = %e,
                    "Retrying after transient error"
                );

                tokio::time::sleep(backoff).await;
            }
        }
    }
}

/// Calculate backoff duration with jitter
fn calculate_backoff(config: &RetryConfig, attempt: u32) -> Duration {
    // Exponential backoff: initial * 2^(attempt-1)
    let base_ms = config.initial_backoff_ms * (1u64 << (attempt - 1).min(10));
    let capped_ms = base_ms.min(config.max_backoff_ms);

    let jitter_ms = rand_jitter(capped_ms);
    Duration::from_millis(capped_ms + jitter_ms)
}

/// Generate pseudo-random jitter without external RNG dependency
fn rand_jitter(max: u64) -> u64 {
    use std::time::SystemTime;
    let nanos = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .unwrap_or_default()
        .subsec_nanos() as u64;
    nanos % max.max(1)
}

/// Retry configuration builder for easy customization
#[derive(Debug, Clone)]
pub struct RetryBuilder {
    max_attempts: u32,
    initial_backoff_ms: u64,
    max_backoff_ms: u64,
}

impl RetryBuilder {
    pub fn new() -> Self {
        let defaults = RetryConfig::default();
        Self {
            max_attempts: defaults.max_attempts,
            initial_backoff_ms: defaults.initial_backoff_ms,
            max_backoff_ms: defaults.max_backoff_ms,
        }
    }

    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = n;
        self
    }

    pub fn initial_backoff_ms(mut self, ms: u64) -> Self {
        self.initial_backoff_ms = ms;
        self
    }

    pub fn max_backoff_ms(mut self, ms: u64) -> Self {
        self.max_backoff_ms = ms;
        self
    }

    pub fn build(self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.max_attempts.max(1),
            initial_backoff_ms: self.initial_backoff_ms,
            max_backoff_ms: self.max_backoff_ms,
        }
    }
}

impl Default for RetryBuilder {
    fn default() -> Self {
        Self::new()
    }
}
