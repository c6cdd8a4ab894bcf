//! Adaptive call pacing and upload concurrency limiting
//!
//! Every backend instance owns one [`Pacer`]. It spaces out dispatched API
//! calls by the current sleep interval, doubles that interval when the
//! remote signals overload and decays it back towards the minimum on
//! success. The pacer only throttles dispatch: it is not a mutex and calls
//! may overlap once dispatched.
//!
//! [`TokenDispenser`] is an independent counting semaphore bounding how
//! many chunked uploads run at once.

use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;

use crate::config::PacerConfig;
use crate::error::{Error, Result};
use crate::retry::Attempt;

#[derive(Debug)]
struct PacerState {
    sleep_time: Duration,
    min_sleep: Duration,
    max_sleep: Duration,
    decay_constant: u32,
    retries: u32,
}

/// Serialises and delays outbound calls for one backend instance
#[derive(Debug)]
pub struct Pacer {
    state: Mutex<PacerState>,
    // Time the previous call was dispatched
    last_dispatch: tokio::sync::Mutex<Option<Instant>>,
    in_flight: AtomicUsize,
}

impl Pacer {
    pub fn new(config: &PacerConfig) -> Self {
        Self {
            state: Mutex::new(PacerState {
                sleep_time: config.min_sleep,
                min_sleep: config.min_sleep,
                max_sleep: config.max_sleep,
                decay_constant: config.decay_constant.max(1),
                retries: config.retries.max(1),
            }),
            last_dispatch: tokio::sync::Mutex::new(None),
            in_flight: AtomicUsize::new(0),
        }
    }

    /// Current gap enforced between dispatches
    pub fn sleep_time(&self) -> Duration {
        self.lock_state().sleep_time
    }

    /// Number of calls dispatched but not yet completed
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Call `f`, retrying while it reports [`Attempt::Retry`]
    ///
    /// Once the retry budget is spent the last error is returned.
    pub async fn call<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let retries = self.lock_state().retries;
        self.call_with_retries(retries, f).await
    }

    /// Call `f` exactly once
    ///
    /// For non-idempotent calls such as streamed uploads, where repeating
    /// the call over a partially consumed body would corrupt data. A retry
    /// signal still adjusts the pacing but surfaces as the final error.
    pub async fn call_no_retry<T, F, Fut>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let _guard = self.begin_call().await;
        let outcome = f().await;
        self.end_attempt(&outcome);
        outcome.into_result()
    }

    async fn call_with_retries<T, F, Fut>(&self, retries: u32, mut f: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Attempt<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let outcome = {
                let _guard = self.begin_call().await;
                let outcome = f().await;
                self.end_attempt(&outcome);
                outcome
            };
            match outcome {
                Attempt::Success(value) => return Ok(value),
                Attempt::Abort(err) => return Err(err),
                Attempt::Retry(err) => {
                    if attempt >= retries {
                        tracing::debug!(attempts = attempt, error = %err, "pacer: retries exhausted");
                        return Err(err);
                    }
                    tracing::debug!(
                        attempt = attempt,
                        retries = retries,
                        error = %err,
                        "pacer: low level retry"
                    );
                }
            }
        }
    }

    // Wait until the gap since the previous dispatch has elapsed
    async fn begin_call(&self) -> InFlight<'_> {
        let mut last = self.last_dispatch.lock().await;
        if let Some(previous) = *last {
            tokio::time::sleep_until(previous + self.sleep_time()).await;
        }
        *last = Some(Instant::now());
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        InFlight(&self.in_flight)
    }

    fn end_attempt<T>(&self, outcome: &Attempt<T>) {
        self.end_call(outcome.is_retry());
        if let Attempt::Retry(err) = outcome {
            if let Some(wait) = err.http().and_then(|http| http.retry_after) {
                self.wait_at_least(wait);
            }
        }
    }

    // A server asking for a pause is honoured up to max_sleep
    fn wait_at_least(&self, wait: Duration) {
        let mut state = self.lock_state();
        let wait = wait.min(state.max_sleep);
        if wait > state.sleep_time {
            state.sleep_time = wait;
            tracing::debug!(sleep_ms = wait.as_millis(), "Server asked to retry after");
        }
    }

    fn end_call(&self, retry: bool) {
        let mut state = self.lock_state();
        let old = state.sleep_time;
        if retry {
            state.sleep_time = (old * 2)
                .max(Duration::from_millis(1))
                .min(state.max_sleep);
            if state.sleep_time != old {
                tracing::debug!(sleep_ms = state.sleep_time.as_millis(), "Rate limited, increasing sleep");
            }
        } else {
            let d = state.decay_constant;
            state.sleep_time = (old * (d - 1) / d).max(state.min_sleep);
            if state.sleep_time != old {
                tracing::trace!(sleep_ms = state.sleep_time.as_millis(), "Reducing sleep");
            }
        }
    }

    fn lock_state(&self) -> std::sync::MutexGuard<'_, PacerState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Counting semaphore limiting concurrent chunked uploads
#[derive(Debug, Clone)]
pub struct TokenDispenser {
    semaphore: Arc<Semaphore>,
    capacity: usize,
    acquisitions: Arc<AtomicU64>,
}

/// A slot taken from a [`TokenDispenser`], released on drop
#[derive(Debug)]
pub struct Token {
    _permit: OwnedSemaphorePermit,
}

impl TokenDispenser {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(capacity)),
            capacity,
            acquisitions: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Wait for a free slot
    pub async fn get(&self) -> Result<Token> {
        let permit = self
            .semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| Error::General("token dispenser is closed".to_string()))?;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(Token { _permit: permit })
    }

    /// Slots currently held
    pub fn in_use(&self) -> usize {
        self.capacity - self.semaphore.available_permits()
    }

    /// Total number of slots handed out so far
    pub fn acquisitions(&self) -> u64 {
        self.acquisitions.load(Ordering::SeqCst)
    }
}
