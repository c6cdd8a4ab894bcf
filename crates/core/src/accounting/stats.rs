use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, warn};

use super::account::{Account, Progress};
use super::token_bucket::TokenBucket;
use super::{format_duration, format_rate};
use crate::config::AccountingConfig;
use crate::error::Error;
use crate::retry::is_retryable_error;
use crate::traits::BoxReader;

/// Aggregate transfer statistics
///
/// One instance is shared by every [`Account`] created from it. Construct
/// it once per run and pass it (behind an `Arc`) to whatever starts
/// transfers; call [`Stats::reset`] between independent passes.
#[derive(Debug)]
pub struct Stats {
    max_transfer: Option<u64>,
    bwlimit: Option<TokenBucket>,
    bytes: AtomicU64,
    // Bytes read or promised to an in-flight read, checked against max_transfer
    reserved: AtomicU64,
    limit_hit: AtomicBool,
    errors: AtomicU64,
    retry_errors: AtomicU64,
    fatal_errors: AtomicU64,
    checks: AtomicU64,
    transfers: AtomicU64,
    last_error: Mutex<Option<String>>,
    start: Mutex<Instant>,
    in_progress: Mutex<BTreeMap<String, Arc<Progress>>>,
}

impl Stats {
    pub fn new(config: &AccountingConfig) -> Self {
        Self {
            max_transfer: config.max_transfer_bytes(),
            bwlimit: config.bwlimit_bytes().map(TokenBucket::new),
            bytes: AtomicU64::new(0),
            reserved: AtomicU64::new(0),
            limit_hit: AtomicBool::new(false),
            errors: AtomicU64::new(0),
            retry_errors: AtomicU64::new(0),
            fatal_errors: AtomicU64::new(0),
            checks: AtomicU64::new(0),
            transfers: AtomicU64::new(0),
            last_error: Mutex::new(None),
            start: Mutex::new(Instant::now()),
            in_progress: Mutex::new(BTreeMap::new()),
        }
    }

    /// Start accounting a transfer of `size` bytes (if known) named `name`
    ///
    /// The returned [`Account`] is listed as in progress until it is closed
    /// or dropped.
    pub fn new_transfer(
        self: &Arc<Self>,
        reader: BoxReader,
        size: Option<u64>,
        name: impl Into<String>,
    ) -> Account {
        let progress = Arc::new(Progress::new(name.into(), size));
        self.lock_in_progress()
            .insert(progress.name().to_string(), progress.clone());
        debug!(name = %progress.name(), ?size, "transfer started");
        Account::new(reader, progress, self.clone())
    }

    /// Total bytes read through all accounts
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    pub fn errors(&self) -> u64 {
        self.errors.load(Ordering::SeqCst)
    }

    pub fn retry_errors(&self) -> u64 {
        self.retry_errors.load(Ordering::SeqCst)
    }

    pub fn fatal_errors(&self) -> u64 {
        self.fatal_errors.load(Ordering::SeqCst)
    }

    pub fn checks(&self) -> u64 {
        self.checks.load(Ordering::SeqCst)
    }

    /// Completed transfers
    pub fn transfers(&self) -> u64 {
        self.transfers.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> Option<String> {
        self.last_error
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn elapsed(&self) -> Duration {
        self.start.lock().unwrap_or_else(|e| e.into_inner()).elapsed()
    }

    /// Average rate since the last reset, in bytes per second
    pub fn speed(&self) -> f64 {
        let secs = self.elapsed().as_secs_f64();
        if secs > 0.0 {
            self.bytes() as f64 / secs
        } else {
            0.0
        }
    }

    /// Names of the transfers currently in progress, sorted
    pub fn transferring(&self) -> Vec<String> {
        self.lock_in_progress().keys().cloned().collect()
    }

    /// True once the max transfer ceiling has been reached
    pub fn limit_reached(&self) -> bool {
        self.limit_hit.load(Ordering::SeqCst)
    }

    /// Record a failed operation
    pub fn error(&self, err: &Error) {
        self.errors.fetch_add(1, Ordering::SeqCst);
        if err.is_fatal() {
            self.fatal_errors.fetch_add(1, Ordering::SeqCst);
        } else if is_retryable_error(err) {
            self.retry_errors.fetch_add(1, Ordering::SeqCst);
        }
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = Some(err.to_string());
    }

    /// Record a file that was compared without being transferred
    pub fn add_check(&self) {
        self.checks.fetch_add(1, Ordering::SeqCst);
    }

    /// Record a successfully completed transfer
    pub fn add_transfer(&self) {
        self.transfers.fetch_add(1, Ordering::SeqCst);
    }

    /// Zero every counter and restart the clock
    ///
    /// Transfers still in progress stay listed. A reached max transfer
    /// limit is cleared too, so a fresh pass gets a fresh budget.
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::SeqCst);
        self.reserved.store(0, Ordering::SeqCst);
        self.limit_hit.store(false, Ordering::SeqCst);
        self.errors.store(0, Ordering::SeqCst);
        self.retry_errors.store(0, Ordering::SeqCst);
        self.fatal_errors.store(0, Ordering::SeqCst);
        self.checks.store(0, Ordering::SeqCst);
        self.transfers.store(0, Ordering::SeqCst);
        *self.last_error.lock().unwrap_or_else(|e| e.into_inner()) = None;
        *self.start.lock().unwrap_or_else(|e| e.into_inner()) = Instant::now();
    }

    /// Claim up to `want` bytes of the transfer budget for one read
    ///
    /// Unused bytes must be handed back with [`Stats::release`]. Returns
    /// zero once the budget is spent.
    pub(crate) fn reserve(&self, want: usize) -> usize {
        let Some(max) = self.max_transfer else {
            return want;
        };
        let mut granted = 0;
        let _ = self
            .reserved
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                granted = max.saturating_sub(used).min(want as u64);
                Some(used + granted)
            });
        granted as usize
    }

    pub(crate) fn release(&self, unused: usize) {
        if self.max_transfer.is_some() && unused > 0 {
            // A reset between reserve and release already dropped these
            let _ = self
                .reserved
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |used| {
                    Some(used.saturating_sub(unused as u64))
                });
        }
    }

    /// Count bytes delivered to a reader and return the throttle delay
    pub(crate) fn account(&self, n: usize) -> Duration {
        self.bytes.fetch_add(n as u64, Ordering::SeqCst);
        match &self.bwlimit {
            Some(bucket) if n > 0 => bucket.take(n),
            _ => Duration::ZERO,
        }
    }

    pub(crate) fn remove(&self, progress: &Arc<Progress>) -> bool {
        let mut in_progress = self.lock_in_progress();
        match in_progress.get(progress.name()) {
            Some(current) if Arc::ptr_eq(current, progress) => {
                in_progress.remove(progress.name());
                true
            }
            _ => false,
        }
    }

    /// Flag the budget as spent, recording the error the first time
    pub(crate) fn hit_limit(&self) -> Error {
        if !self.limit_hit.swap(true, Ordering::SeqCst) {
            warn!(
                max_transfer = self.max_transfer,
                "max transfer limit reached, aborting transfers"
            );
            self.error(&Error::MaxTransferLimitReached);
        }
        Error::MaxTransferLimitReached
    }

    fn lock_in_progress(&self) -> MutexGuard<'_, BTreeMap<String, Arc<Progress>>> {
        self.in_progress.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for Stats {
    fn default() -> Self {
        Self::new(&AccountingConfig::default())
    }
}

impl fmt::Display for Stats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let elapsed = self.elapsed();
        writeln!(
            f,
            "Transferred:   {} ({})",
            humansize::format_size(self.bytes(), humansize::BINARY),
            format_rate(self.speed())
        )?;
        writeln!(f, "Errors:        {}", self.errors())?;
        writeln!(f, "Checks:        {}", self.checks())?;
        writeln!(f, "Transferred:   {}", self.transfers())?;
        write!(f, "Elapsed time:  {}", format_duration(elapsed))?;

        let in_progress: Vec<Arc<Progress>> = self.lock_in_progress().values().cloned().collect();
        if !in_progress.is_empty() {
            write!(f, "\nTransferring:")?;
            for progress in in_progress {
                write!(f, "\n * {progress}")?;
            }
        }
        Ok(())
    }
}
