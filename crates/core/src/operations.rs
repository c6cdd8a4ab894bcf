//! Operations built on the backend contract
//!
//! These are the entry points a sync engine uses to move single objects
//! between backends. They prefer server-side copy/move when the
//! destination offers it and fall back to streaming the bytes through an
//! [`Account`](crate::accounting::Account) otherwise.

use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::accounting::Stats;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::hash::HashType;
use crate::retry::{RetryConfig, is_retryable_error, retry_with_backoff};
use crate::traits::{Fs, Object, StaticObjectInfo};

/// Shared state for a run of operations
#[derive(Debug, Clone)]
pub struct TransferContext {
    pub stats: Arc<Stats>,
    pub retry: RetryConfig,
}

impl TransferContext {
    pub fn new(config: &Config) -> Self {
        Self {
            stats: Arc::new(Stats::new(&config.accounting)),
            retry: RetryConfig {
                max_attempts: config.low_level_retries,
                ..RetryConfig::default()
            },
        }
    }

    pub fn with_stats(stats: Arc<Stats>, retry: RetryConfig) -> Self {
        Self { stats, retry }
    }
}

/// Copy `src` to `remote` on `fdst`
///
/// Uses server-side copy when `fdst` supports it, falling back to a
/// streamed copy when the backend reports [`Error::CantCopy`]. Streamed
/// copies are retried for retryable errors and verified afterwards.
pub async fn copy(
    ctx: &TransferContext,
    fdst: &dyn Fs,
    src: &dyn Object,
    remote: &str,
) -> Result<Box<dyn Object>> {
    let result = copy_inner(ctx, fdst, src, remote).await;
    match &result {
        Ok(_) => ctx.stats.add_transfer(),
        // The accounting layer records fatal errors itself
        Err(e) if !e.is_fatal() => ctx.stats.error(e),
        Err(_) => {}
    }
    result
}

async fn copy_inner(
    ctx: &TransferContext,
    fdst: &dyn Fs,
    src: &dyn Object,
    remote: &str,
) -> Result<Box<dyn Object>> {
    if !src.storable() {
        return Err(Error::NotAFile);
    }

    if fdst.features().copy {
        match fdst.copy(src, remote).await {
            Ok(dst) => {
                debug!(src = %src.remote(), dst = %remote, "server-side copied");
                return Ok(dst);
            }
            Err(e) if matches!(e.root(), Error::CantCopy) => {
                debug!(src = %src.remote(), "server-side copy not possible, streaming");
            }
            Err(e) => return Err(e),
        }
    }

    let dst = retry_with_backoff(
        &ctx.retry,
        || stream_copy(ctx, fdst, src, remote),
        is_retryable_error,
    )
    .await?;

    if let Err(e) = verify(src, dst.as_ref(), fdst).await {
        warn!(dst = %remote, error = %e, "removing corrupted copy");
        if let Err(remove_err) = dst.remove().await {
            warn!(dst = %remote, error = %remove_err, "failed to remove corrupted copy");
        }
        return Err(e);
    }
    Ok(dst)
}

async fn stream_copy(
    ctx: &TransferContext,
    fdst: &dyn Fs,
    src: &dyn Object,
    remote: &str,
) -> Result<Box<dyn Object>> {
    let info = object_info(src, remote).await?;
    let reader = src.open(&[]).await?;
    let account = ctx
        .stats
        .new_transfer(reader, info.size, remote)
        .with_buffer();
    fdst.put(Box::pin(account), &info).await
}

// Check the copy matches the source by size and every hash both sides know
async fn verify(src: &dyn Object, dst: &dyn Object, fdst: &dyn Fs) -> Result<()> {
    let (src_size, dst_size) = (src.size().await?, dst.size().await?);
    if src_size != dst_size {
        return Err(Error::General(format!(
            "corrupted on transfer: sizes differ {src_size} vs {dst_size}"
        )));
    }
    for ty in fdst.hashes().types() {
        let (Some(src_hash), Some(dst_hash)) = (known_hash(src, ty).await?, dst.hash(ty).await?)
        else {
            continue;
        };
        if !src_hash.eq_ignore_ascii_case(&dst_hash) {
            return Err(Error::General(format!(
                "corrupted on transfer: {ty} hashes differ {src_hash:?} vs {dst_hash:?}"
            )));
        }
    }
    Ok(())
}

// A hash the source can't produce is simply not compared
async fn known_hash(obj: &dyn Object, ty: HashType) -> Result<Option<String>> {
    match obj.hash(ty).await {
        Err(e) if matches!(e.root(), Error::HashUnsupported) => Ok(None),
        other => other,
    }
}

/// Move `src` to `remote` on `fdst`
///
/// Uses server-side move when possible, otherwise copies and then removes
/// the source.
pub async fn move_object(
    ctx: &TransferContext,
    fdst: &dyn Fs,
    src: Box<dyn Object>,
    remote: &str,
) -> Result<Box<dyn Object>> {
    if fdst.features().move_object {
        match fdst.move_object(src.as_ref(), remote).await {
            Ok(dst) => {
                info!(src = %src.remote(), dst = %remote, "moved");
                ctx.stats.add_transfer();
                return Ok(dst);
            }
            Err(e) if matches!(e.root(), Error::CantMove) => {
                debug!(src = %src.remote(), "server-side move not possible, copying");
            }
            Err(e) => {
                ctx.stats.error(&e);
                return Err(e);
            }
        }
    }

    let dst = copy(ctx, fdst, src.as_ref(), remote).await?;
    if let Err(e) = src.remove().await {
        ctx.stats.error(&e);
        return Err(e.context(format!("couldn't remove {} after copy", src.remote())));
    }
    info!(src = %src.remote(), dst = %remote, "moved by copy and delete");
    Ok(dst)
}

/// Copy `src` to `remote` unless an identical object is already there
///
/// Objects are considered identical when their sizes match and their
/// modification times agree within the coarser of the two precisions.
/// Returns `None` if the transfer was skipped.
pub async fn copy_file(
    ctx: &TransferContext,
    fdst: &dyn Fs,
    src: &dyn Object,
    remote: &str,
    src_precision: Duration,
) -> Result<Option<Box<dyn Object>>> {
    match fdst.new_object(remote).await {
        Ok(existing) => {
            let precision = src_precision.max(fdst.precision());
            if same_object(src, existing.as_ref(), precision).await? {
                debug!(remote = %remote, "unchanged, skipping");
                ctx.stats.add_check();
                return Ok(None);
            }
        }
        Err(e) if e.is_object_not_found() => {}
        Err(e) => return Err(e),
    }
    copy(ctx, fdst, src, remote).await.map(Some)
}

async fn same_object(src: &dyn Object, dst: &dyn Object, precision: Duration) -> Result<bool> {
    if src.size().await? != dst.size().await? {
        return Ok(false);
    }
    let (a, b) = (src.mod_time().await?, dst.mod_time().await?);
    let delta = a.duration_since(b).unsigned_abs();
    Ok(delta <= precision)
}

/// Describe `obj` for an upload to `remote`
pub async fn object_info(obj: &dyn Object, remote: &str) -> Result<StaticObjectInfo> {
    Ok(StaticObjectInfo::new(
        remote,
        Some(obj.size().await?),
        obj.mod_time().await?,
    ))
}

#[cfg(test)]
#[path = "operations_tests.rs"]
mod tests;
