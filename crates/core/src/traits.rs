//! Backend contract
//!
//! Every storage backend implements [`Fs`] for a configured root and hands
//! out [`Object`]s for the files under it. Optional operations have default
//! implementations returning the matching "can't" sentinel, so callers can
//! fall back (for instance to a stream copy) without knowing the backend.

use std::any::Any;
use std::fmt;
use std::pin::Pin;
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::io::AsyncRead;

use crate::error::{Error, Result};
use crate::hash::{HashSet, HashType};

/// Boxed byte stream passed between backends and the accounting layer
pub type BoxReader = Pin<Box<dyn AsyncRead + Send>>;

/// Optional features a backend supports
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Features {
    /// Paths differing only by case refer to the same item
    pub case_insensitive: bool,
    /// Empty directories exist on their own
    pub can_have_empty_directories: bool,
    pub purge: bool,
    pub copy: bool,
    pub move_object: bool,
    pub dir_move: bool,
    pub put_stream: bool,
    pub dir_cache_flush: bool,
}

/// Whether a backend's configured root names a directory or a file
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RootKind {
    Directory,
    /// The root pointed at a file; the returned Fs is rooted at its parent
    File,
}

/// Options for opening an object
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpenOption {
    /// Start reading at this offset
    Seek(u64),
    /// Read an inclusive byte range; `end: None` reads to the end
    Range { start: u64, end: Option<u64> },
}

impl OpenOption {
    /// Value for an HTTP `Range` header
    pub fn range_header(&self) -> String {
        match *self {
            OpenOption::Seek(offset) => format!("bytes={offset}-"),
            OpenOption::Range { start, end: Some(end) } => format!("bytes={start}-{end}"),
            OpenOption::Range { start, end: None } => format!("bytes={start}-"),
        }
    }
}

/// Description of an object being uploaded
pub trait ObjectInfo: Send + Sync {
    /// Remote path relative to the destination root
    fn remote(&self) -> &str;
    /// Size in bytes if known up front
    fn size(&self) -> Option<u64>;
    fn mod_time(&self) -> Timestamp;
    /// A precomputed content hash, if the source has one
    fn hash(&self, _ty: HashType) -> Option<String> {
        None
    }
}

/// Plain [`ObjectInfo`] for uploads whose source isn't another object
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StaticObjectInfo {
    pub remote: String,
    pub size: Option<u64>,
    pub mod_time: Timestamp,
}

impl StaticObjectInfo {
    pub fn new(remote: impl Into<String>, size: Option<u64>, mod_time: Timestamp) -> Self {
        Self {
            remote: remote.into(),
            size,
            mod_time,
        }
    }
}

impl ObjectInfo for StaticObjectInfo {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn size(&self) -> Option<u64> {
        self.size
    }

    fn mod_time(&self) -> Timestamp {
        self.mod_time
    }
}

/// A directory seen in a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Directory {
    pub remote: String,
    pub mod_time: Option<Timestamp>,
    /// Backend-native ID, if the remote has one
    pub id: Option<String>,
}

/// One entry of a directory listing
#[derive(Debug)]
pub enum DirEntry {
    Object(Box<dyn Object>),
    Dir(Directory),
}

impl DirEntry {
    pub fn remote(&self) -> &str {
        match self {
            DirEntry::Object(o) => o.remote(),
            DirEntry::Dir(d) => &d.remote,
        }
    }

    pub fn is_dir(&self) -> bool {
        matches!(self, DirEntry::Dir(_))
    }
}

/// One remote file
///
/// Metadata is read lazily on first access and then memoised. Mutating
/// calls replace the memoised metadata wholesale with the server's answer,
/// or leave it untouched when they fail. An object must not be shared
/// between concurrent writers, hence `&mut self` on the writers.
#[async_trait]
pub trait Object: fmt::Debug + Send + Sync {
    /// Remote path relative to the owning Fs root
    fn remote(&self) -> &str;

    /// Name of the Fs this object belongs to
    fn fs_name(&self) -> &str;

    async fn size(&self) -> Result<u64>;

    async fn mod_time(&self) -> Result<Timestamp>;

    /// Content hash as lowercase hex; `None` when the remote doesn't know it
    async fn hash(&self, ty: HashType) -> Result<Option<String>>;

    /// Whether the object can be transferred
    fn storable(&self) -> bool {
        true
    }

    async fn set_mod_time(&mut self, mod_time: Timestamp) -> Result<()>;

    async fn open(&self, options: &[OpenOption]) -> Result<BoxReader>;

    /// Replace the object's contents with `input`
    async fn update(&mut self, input: BoxReader, src: &dyn ObjectInfo) -> Result<()>;

    async fn remove(&self) -> Result<()>;

    /// Concrete type access for same-backend checks
    fn as_any(&self) -> &dyn Any;
}

/// A storage backend rooted at a configured path
#[async_trait]
pub trait Fs: fmt::Debug + fmt::Display + Send + Sync {
    /// Name of the remote as configured
    fn name(&self) -> &str;

    /// Configured root path
    fn root(&self) -> &str;

    fn features(&self) -> Features;

    /// Modification time resolution
    fn precision(&self) -> Duration;

    /// Supported content hashes
    fn hashes(&self) -> HashSet;

    /// List `dir`, returning `DirNotFound` if it doesn't exist
    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>>;

    /// Find the object at `remote`, or `ObjectNotFound`
    async fn new_object(&self, remote: &str) -> Result<Box<dyn Object>>;

    /// Upload `input`, replacing any existing object at `src.remote()`
    async fn put(&self, input: BoxReader, src: &dyn ObjectInfo) -> Result<Box<dyn Object>>;

    /// Upload a stream of unknown length
    async fn put_stream(&self, _input: BoxReader, _src: &dyn ObjectInfo) -> Result<Box<dyn Object>> {
        Err(Error::UnsupportedFeature("put_stream".to_string()))
    }

    /// Make a directory, succeeding if it already exists
    async fn mkdir(&self, dir: &str) -> Result<()>;

    /// Remove an empty directory
    async fn rmdir(&self, dir: &str) -> Result<()>;

    /// Delete the root and everything in it
    async fn purge(&self) -> Result<()> {
        Err(Error::CantPurge)
    }

    /// Server-side copy of `src` to `remote`
    async fn copy(&self, _src: &dyn Object, _remote: &str) -> Result<Box<dyn Object>> {
        Err(Error::CantCopy)
    }

    /// Server-side move of `src` to `remote`
    async fn move_object(&self, _src: &dyn Object, _remote: &str) -> Result<Box<dyn Object>> {
        Err(Error::CantMove)
    }

    /// Server-side move of directory `src_remote` in `src` to `dst_remote`
    async fn dir_move(&self, _src: &dyn Fs, _src_remote: &str, _dst_remote: &str) -> Result<()> {
        Err(Error::CantDirMove)
    }

    /// Drop any cached directory IDs
    async fn dir_cache_flush(&self) {}

    /// Concrete type access for same-backend checks
    fn as_any(&self) -> &dyn Any;
}
