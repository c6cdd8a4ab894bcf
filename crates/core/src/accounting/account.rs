use std::fmt;
use std::future::Future;
use std::io;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, ready};
use std::time::Duration;

use bytes::Bytes;
use futures::StreamExt;
use tokio::io::{AsyncRead, ReadBuf};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, Sleep};
use tokio_util::io::{ReaderStream, StreamReader};
use tracing::debug;

use super::stats::Stats;
use super::{format_duration, format_rate};
use crate::error::Error;
use crate::traits::BoxReader;

// Rate samples are taken once per window and smoothed over this many samples
const RATE_WINDOW: Duration = Duration::from_secs(1);
const RATE_SAMPLES: f64 = 16.0;

// Read-ahead only pays off for streams of unknown size or bigger than this
const BUFFER_THRESHOLD: u64 = 128 * 1024;
const BUFFER_CHUNK: usize = 64 * 1024;
const BUFFER_CHUNKS: usize = 16;

/// The shared, displayable half of an [`Account`]
///
/// [`Stats`] keeps one of these per in-progress transfer so it can report on
/// transfers without touching their readers.
#[derive(Debug)]
pub struct Progress {
    name: String,
    size: Option<u64>,
    bytes: AtomicU64,
    cancelled: AtomicBool,
    rate: Mutex<RateState>,
}

#[derive(Debug)]
struct RateState {
    start: Option<Instant>,
    window_start: Instant,
    window_bytes: u64,
    average: Option<f64>,
}

impl Progress {
    pub(crate) fn new(name: String, size: Option<u64>) -> Self {
        Self {
            name,
            size,
            bytes: AtomicU64::new(0),
            cancelled: AtomicBool::new(false),
            rate: Mutex::new(RateState {
                start: None,
                window_start: Instant::now(),
                window_bytes: 0,
                average: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> Option<u64> {
        self.size
    }

    pub fn bytes(&self) -> u64 {
        self.bytes.load(Ordering::SeqCst)
    }

    /// Smoothed rate in bytes per second; zero until a full window has passed
    pub fn speed(&self) -> f64 {
        self.lock_rate().average.unwrap_or(0.0)
    }

    /// Estimated time to completion, if the size and rate are known
    pub fn eta(&self) -> Option<Duration> {
        let size = self.size?;
        let speed = self.speed();
        if speed <= 0.0 {
            return None;
        }
        let remaining = size.saturating_sub(self.bytes());
        Some(Duration::from_secs_f64(remaining as f64 / speed))
    }

    /// Percentage complete, if the size is known
    pub fn percentage(&self) -> Option<u64> {
        match self.size {
            Some(0) => Some(100),
            Some(size) => Some((self.bytes().min(size) * 100) / size),
            None => None,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn record(&self, n: usize) {
        self.bytes.fetch_add(n as u64, Ordering::SeqCst);

        let now = Instant::now();
        let mut rate = self.lock_rate();
        if rate.start.is_none() {
            rate.start = Some(now);
            rate.window_start = now;
        }
        rate.window_bytes += n as u64;
        let elapsed = now.duration_since(rate.window_start);
        if elapsed >= RATE_WINDOW {
            let sample = rate.window_bytes as f64 / elapsed.as_secs_f64();
            rate.average = Some(match rate.average {
                Some(avg) => avg + (sample - avg) * 2.0 / (RATE_SAMPLES + 1.0),
                None => sample,
            });
            rate.window_start = now;
            rate.window_bytes = 0;
        }
    }

    fn lock_rate(&self) -> std::sync::MutexGuard<'_, RateState> {
        self.rate.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl fmt::Display for Progress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let done = humansize::format_size(self.bytes(), humansize::BINARY);
        let percentage = match self.percentage() {
            Some(pct) => format!("{pct:>3}%"),
            None => "  -".to_string(),
        };
        let total = match self.size {
            Some(size) => humansize::format_size(size, humansize::BINARY),
            None => "?".to_string(),
        };
        let eta = match self.eta() {
            Some(eta) => format_duration(eta),
            None => "-".to_string(),
        };
        write!(
            f,
            "{}: {percentage} {done}/{total}, {}, {eta}",
            self.name,
            format_rate(self.speed())
        )
    }
}

/// A byte stream being counted into a [`Stats`]
///
/// Every read adds to the account's own counter and the aggregate. Reads
/// stop with [`Error::MaxTransferLimitReached`] once the aggregate budget
/// is spent, and pause as needed to respect the aggregate bandwidth limit.
/// The account is listed as in progress until [`Account::close`] is called
/// or it is dropped.
pub struct Account {
    inner: BoxReader,
    progress: Arc<Progress>,
    stats: Arc<Stats>,
    throttle: Option<Pin<Box<Sleep>>>,
    buffered: bool,
    closed: bool,
}

impl Account {
    pub(crate) fn new(inner: BoxReader, progress: Arc<Progress>, stats: Arc<Stats>) -> Self {
        Self {
            inner,
            progress,
            stats,
            throttle: None,
            buffered: false,
            closed: false,
        }
    }

    pub fn name(&self) -> &str {
        self.progress.name()
    }

    pub fn size(&self) -> Option<u64> {
        self.progress.size()
    }

    /// Bytes read through this account so far
    pub fn bytes(&self) -> u64 {
        self.progress.bytes()
    }

    pub fn speed(&self) -> f64 {
        self.progress.speed()
    }

    pub fn eta(&self) -> Option<Duration> {
        self.progress.eta()
    }

    pub fn progress(&self) -> &Arc<Progress> {
        &self.progress
    }

    /// Read the source ahead of the consumer on a background task
    ///
    /// Small transfers of known size are left unbuffered. Must be called
    /// from within a Tokio runtime.
    pub fn with_buffer(mut self) -> Self {
        if self.buffered || self.size().is_some_and(|size| size <= BUFFER_THRESHOLD) {
            return self;
        }
        let inner = std::mem::replace(&mut self.inner, Box::pin(tokio::io::empty()));
        self.inner = Box::pin(ReadAhead::spawn(inner));
        self.buffered = true;
        debug!(name = %self.progress.name(), size = ?self.size(), "transfer buffered");
        self
    }

    pub fn is_buffered(&self) -> bool {
        self.buffered
    }

    /// Replace the underlying stream, keeping counters and registration
    ///
    /// Used when a retry reopens the source and continues the same
    /// transfer. A buffered account buffers the new stream too.
    pub fn update_reader(&mut self, reader: BoxReader) -> BoxReader {
        let reader = if self.buffered {
            Box::pin(ReadAhead::spawn(reader))
        } else {
            reader
        };
        std::mem::replace(&mut self.inner, reader)
    }

    /// Make every further read fail with [`Error::Cancelled`]
    pub fn cancel(&self) {
        self.progress.cancel();
    }

    /// Remove this transfer from the in-progress set
    ///
    /// Calling it more than once is harmless.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        if self.stats.remove(&self.progress) {
            debug!(name = %self.progress.name(), bytes = self.progress.bytes(), "transfer closed");
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    fn check_aborted(&self) -> Option<Error> {
        if self.progress.is_cancelled() {
            Some(Error::Cancelled)
        } else if self.stats.limit_reached() {
            Some(Error::MaxTransferLimitReached)
        } else {
            None
        }
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("progress", &self.progress)
            .field("buffered", &self.buffered)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}

impl fmt::Display for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.progress, f)
    }
}

impl AsyncRead for Account {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();

        if let Some(err) = this.check_aborted() {
            return Poll::Ready(Err(err.into()));
        }
        if let Some(throttle) = this.throttle.as_mut() {
            ready!(throttle.as_mut().poll(cx));
            this.throttle = None;
        }
        if buf.remaining() == 0 {
            return Poll::Ready(Ok(()));
        }

        let want = buf.remaining();
        let allowed = this.stats.reserve(want);

        if allowed == 0 {
            // Budget spent: one more byte from the source means the limit
            // is exceeded, end of stream means the transfer fits exactly
            let mut probe = [0u8; 1];
            let mut probe = ReadBuf::new(&mut probe);
            ready!(this.inner.as_mut().poll_read(cx, &mut probe))?;
            if probe.filled().is_empty() {
                this.progress.record(0);
                return Poll::Ready(Ok(()));
            }
            return Poll::Ready(Err(this.stats.hit_limit().into()));
        }

        let (result, n) = if allowed == want {
            let before = buf.filled().len();
            let result = this.inner.as_mut().poll_read(cx, buf);
            (result, buf.filled().len() - before)
        } else {
            // Only offer the inner reader what is left of the budget
            let window = buf.initialize_unfilled_to(allowed);
            let mut limited = ReadBuf::new(window);
            let result = this.inner.as_mut().poll_read(cx, &mut limited);
            let n = limited.filled().len();
            buf.advance(n);
            (result, n)
        };
        this.stats.release(allowed - n);

        match result {
            Poll::Ready(Ok(())) => {
                this.progress.record(n);
                let wait = this.stats.account(n);
                if !wait.is_zero() {
                    this.throttle = Some(Box::pin(tokio::time::sleep(wait)));
                }
                Poll::Ready(Ok(()))
            }
            other => other,
        }
    }
}

/// A reader fed by a task that keeps up to `BUFFER_CHUNKS` chunks queued
struct ReadAhead {
    reader: BoxReader,
    filler: JoinHandle<()>,
}

impl ReadAhead {
    fn spawn(inner: BoxReader) -> Self {
        let (tx, rx) = mpsc::channel::<io::Result<Bytes>>(BUFFER_CHUNKS);
        let filler = tokio::spawn(async move {
            let mut chunks = ReaderStream::with_capacity(inner, BUFFER_CHUNK);
            while let Some(chunk) = chunks.next().await {
                let failed = chunk.is_err();
                if tx.send(chunk).await.is_err() || failed {
                    break;
                }
            }
        });
        let chunks = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|chunk| (chunk, rx))
        });
        Self {
            reader: Box::pin(StreamReader::new(chunks)),
            filler,
        }
    }
}

impl AsyncRead for ReadAhead {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        self.get_mut().reader.as_mut().poll_read(cx, buf)
    }
}

impl Drop for ReadAhead {
    fn drop(&mut self) {
        self.filler.abort();
    }
}

impl Drop for Account {
    fn drop(&mut self) {
        self.close();
    }
}
