//! Transfer accounting
//!
//! Every byte stream moved between backends is wrapped in an [`Account`]
//! created from a shared [`Stats`]. The account counts bytes as they are
//! read, feeds the aggregate counters, enforces the max transfer ceiling
//! and the aggregate bandwidth limit, and provides the progress line shown
//! for each in-flight transfer.

mod account;
mod stats;
mod token_bucket;

use std::time::Duration;

pub use account::{Account, Progress};
pub use stats::Stats;
pub use token_bucket::TokenBucket;

/// Format a rate in bytes per second, e.g. `1.50 MiB/s`
pub(crate) fn format_rate(bytes_per_sec: f64) -> String {
    let rate = if bytes_per_sec.is_finite() && bytes_per_sec > 0.0 {
        bytes_per_sec as u64
    } else {
        0
    };
    format!("{}/s", humansize::format_size(rate, humansize::BINARY))
}

/// Format a duration compactly, e.g. `1h2m3s` or `4.5s`
pub(crate) fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs < 60 {
        return format!("{:.1}s", d.as_secs_f64());
    }
    let (h, m, s) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if h > 0 {
        format!("{h}h{m}m{s}s")
    } else {
        format!("{m}m{s}s")
    }
}
