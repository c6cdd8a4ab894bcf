//! Aggregate bandwidth limiter shared by every transfer of a [`Stats`]
//!
//! [`Stats`]: super::Stats

use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

/// A token bucket refilled at `rate` bytes per second with one second of
/// burst
///
/// Readers pay after the fact: [`TokenBucket::take`] always succeeds and
/// the balance may go negative, in which case the caller is told how long
/// to wait before reading again. This keeps reads unblocked by the limiter
/// while still bounding the aggregate rate.
#[derive(Debug)]
pub struct TokenBucket {
    rate: u64,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: f64,
    last: Instant,
}

impl TokenBucket {
    pub fn new(rate: u64) -> Self {
        Self {
            rate: rate.max(1),
            state: Mutex::new(BucketState {
                tokens: rate.max(1) as f64,
                last: Instant::now(),
            }),
        }
    }

    /// Bytes per second
    pub fn rate(&self) -> u64 {
        self.rate
    }

    /// Charge `n` bytes and return how long the caller should pause
    pub fn take(&self, n: usize) -> Duration {
        let rate = self.rate as f64;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let refill = now.duration_since(state.last).as_secs_f64() * rate;
        state.tokens = (state.tokens + refill).min(rate);
        state.last = now;
        state.tokens -= n as f64;
        if state.tokens >= 0.0 {
            Duration::ZERO
        } else {
            Duration::from_secs_f64(-state.tokens / rate)
        }
    }
}
