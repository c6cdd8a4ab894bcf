//! rfs-core: Shared infrastructure for remote storage backends
//!
//! This crate provides what every backend builds on:
//! - The `Fs`/`Object` backend contract
//! - A per-backend call pacer with backoff and an upload token dispenser
//! - A path to directory ID cache for ID-addressed remotes
//! - Transfer accounting: byte counting, bandwidth and volume limits
//! - Retry classification of transport errors
//!
//! It knows nothing about any particular provider's API, so backends can be
//! tested against it in isolation.

pub mod accounting;
pub mod config;
pub mod dircache;
pub mod error;
pub mod hash;
pub mod operations;
pub mod pacer;
pub mod path;
pub mod retry;
pub mod traits;

pub use accounting::{Account, Stats};
pub use config::{AccountingConfig, Config, PacerConfig, SizeSuffix};
pub use dircache::{DirCache, DirCacheBackend};
pub use error::{Error, HttpError, Result, ResultExt};
pub use hash::{HashSet, HashType};
pub use operations::TransferContext;
pub use pacer::{Pacer, Token, TokenDispenser};
pub use retry::{Attempt, RetryBuilder, is_retryable_error, retry_with_backoff, should_retry};
pub use traits::{
    BoxReader, DirEntry, Directory, Features, Fs, Object, ObjectInfo, OpenOption, RootKind,
    StaticObjectInfo,
};
