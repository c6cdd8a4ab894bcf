use super::*;
use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::io::Cursor;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use jiff::Timestamp;
use tokio::io::AsyncReadExt;

use crate::config::{AccountingConfig, SizeSuffix};
use crate::hash::HashSet;
use crate::traits::{BoxReader, DirEntry, Directory, Features, ObjectInfo, OpenOption};

#[derive(Debug, Clone)]
struct MemFile {
    data: Vec<u8>,
    mod_time: Timestamp,
}

type Files = Arc<Mutex<BTreeMap<String, MemFile>>>;

/// In-memory backend used to drive the operations
#[derive(Debug)]
struct MemFs {
    name: String,
    files: Files,
    features: Features,
    puts: AtomicUsize,
    server_copies: AtomicUsize,
    server_moves: AtomicUsize,
    // Number of upcoming puts that fail after consuming their input
    failing_puts: AtomicUsize,
    fail_with: fn() -> Error,
}

impl MemFs {
    fn new(name: &str, features: Features) -> Self {
        Self {
            name: name.to_string(),
            files: Arc::default(),
            features,
            puts: AtomicUsize::new(0),
            server_copies: AtomicUsize::new(0),
            server_moves: AtomicUsize::new(0),
            failing_puts: AtomicUsize::new(0),
            fail_with: || Error::Network("connection reset by peer".to_string()),
        }
    }

    fn insert(&self, remote: &str, data: &[u8]) -> Box<dyn Object> {
        self.files.lock().unwrap().insert(
            remote.to_string(),
            MemFile {
                data: data.to_vec(),
                mod_time: Timestamp::from_second(1_600_000_000).unwrap(),
            },
        );
        self.object(remote)
    }

    fn data(&self, remote: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(remote).map(|f| f.data.clone())
    }

    fn object(&self, remote: &str) -> Box<dyn Object> {
        Box::new(MemObject {
            fs_name: self.name.clone(),
            remote: remote.to_string(),
            files: self.files.clone(),
        })
    }

    fn same_fs<'a>(&self, src: &'a dyn Object) -> Option<&'a MemObject> {
        src.as_any()
            .downcast_ref::<MemObject>()
            .filter(|o| o.fs_name == self.name)
    }
}

impl fmt::Display for MemFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "mem {}", self.name)
    }
}

#[async_trait]
impl Fs for MemFs {
    fn name(&self) -> &str {
        &self.name
    }

    fn root(&self) -> &str {
        ""
    }

    fn features(&self) -> Features {
        self.features
    }

    fn precision(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn hashes(&self) -> HashSet {
        HashSet::none()
    }

    async fn list(&self, _dir: &str) -> Result<Vec<DirEntry>> {
        let names: Vec<String> = self.files.lock().unwrap().keys().cloned().collect();
        let mut entries: Vec<DirEntry> = names
            .iter()
            .map(|n| DirEntry::Object(self.object(n)))
            .collect();
        entries.push(DirEntry::Dir(Directory {
            remote: "empty".to_string(),
            mod_time: None,
            id: None,
        }));
        Ok(entries)
    }

    async fn new_object(&self, remote: &str) -> Result<Box<dyn Object>> {
        if self.files.lock().unwrap().contains_key(remote) {
            Ok(self.object(remote))
        } else {
            Err(Error::ObjectNotFound)
        }
    }

    async fn put(&self, mut input: BoxReader, src: &dyn ObjectInfo) -> Result<Box<dyn Object>> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let mut data = Vec::new();
        input.read_to_end(&mut data).await?;
        let failing = self
            .failing_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err((self.fail_with)());
        }
        self.files.lock().unwrap().insert(
            src.remote().to_string(),
            MemFile {
                data,
                mod_time: src.mod_time(),
            },
        );
        Ok(self.object(src.remote()))
    }

    async fn mkdir(&self, _dir: &str) -> Result<()> {
        Ok(())
    }

    async fn rmdir(&self, _dir: &str) -> Result<()> {
        Ok(())
    }

    async fn copy(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(src) = self.same_fs(src) else {
            return Err(Error::CantCopy);
        };
        let file = src.file()?;
        self.server_copies.fetch_add(1, Ordering::SeqCst);
        self.files.lock().unwrap().insert(remote.to_string(), file);
        Ok(self.object(remote))
    }

    async fn move_object(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(src) = self.same_fs(src) else {
            return Err(Error::CantMove);
        };
        let mut files = self.files.lock().unwrap();
        let file = files.remove(&src.remote).ok_or(Error::ObjectNotFound)?;
        files.insert(remote.to_string(), file);
        self.server_moves.fetch_add(1, Ordering::SeqCst);
        Ok(self.object(remote))
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[derive(Debug)]
struct MemObject {
    fs_name: String,
    remote: String,
    files: Files,
}

impl MemObject {
    fn file(&self) -> Result<MemFile> {
        self.files
            .lock()
            .unwrap()
            .get(&self.remote)
            .cloned()
            .ok_or(Error::ObjectNotFound)
    }
}

#[async_trait]
impl Object for MemObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn fs_name(&self) -> &str {
        &self.fs_name
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.file()?.data.len() as u64)
    }

    async fn mod_time(&self) -> Result<Timestamp> {
        Ok(self.file()?.mod_time)
    }

    async fn hash(&self, _ty: HashType) -> Result<Option<String>> {
        Err(Error::HashUnsupported)
    }

    async fn set_mod_time(&mut self, mod_time: Timestamp) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let file = files.get_mut(&self.remote).ok_or(Error::ObjectNotFound)?;
        file.mod_time = mod_time;
        Ok(())
    }

    async fn open(&self, _options: &[OpenOption]) -> Result<BoxReader> {
        Ok(Box::pin(Cursor::new(self.file()?.data)))
    }

    async fn update(&mut self, mut input: BoxReader, src: &dyn ObjectInfo) -> Result<()> {
        let mut data = Vec::new();
        input.read_to_end(&mut data).await?;
        self.files.lock().unwrap().insert(
            self.remote.clone(),
            MemFile {
                data,
                mod_time: src.mod_time(),
            },
        );
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.files
            .lock()
            .unwrap()
            .remove(&self.remote)
            .map(|_| ())
            .ok_or(Error::ObjectNotFound)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

fn all_features() -> Features {
    Features {
        copy: true,
        move_object: true,
        ..Features::default()
    }
}

fn context() -> TransferContext {
    TransferContext::with_stats(
        Arc::new(Stats::default()),
        RetryConfig {
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
        },
    )
}

#[tokio::test]
async fn copy_within_same_remote_is_server_side() {
    let ctx = context();
    let fs = MemFs::new("mem", all_features());
    let src = fs.insert("a.txt", b"hello");

    let dst = copy(&ctx, &fs, src.as_ref(), "b.txt").await.unwrap();

    assert_eq!(dst.remote(), "b.txt");
    assert_eq!(fs.data("b.txt").unwrap(), b"hello");
    assert_eq!(fs.server_copies.load(Ordering::SeqCst), 1);
    assert_eq!(fs.puts.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.stats.bytes(), 0);
    assert_eq!(ctx.stats.transfers(), 1);
}

#[tokio::test]
async fn copy_across_remotes_falls_back_to_stream() {
    let ctx = context();
    let src_fs = MemFs::new("src", all_features());
    let dst_fs = MemFs::new("dst", all_features());
    let src = src_fs.insert("dir/a.bin", &[9; 1000]);

    let dst = copy(&ctx, &dst_fs, src.as_ref(), "copied.bin").await.unwrap();

    assert_eq!(dst.size().await.unwrap(), 1000);
    assert_eq!(dst.mod_time().await.unwrap(), src.mod_time().await.unwrap());
    assert_eq!(dst_fs.server_copies.load(Ordering::SeqCst), 0);
    assert_eq!(dst_fs.puts.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.stats.bytes(), 1000);
    assert_eq!(ctx.stats.transfers(), 1);
    assert!(ctx.stats.transferring().is_empty());
}

#[tokio::test]
async fn copy_without_copy_feature_streams() {
    let ctx = context();
    let fs = MemFs::new("mem", Features::default());
    let src = fs.insert("a.txt", b"abc");

    copy(&ctx, &fs, src.as_ref(), "b.txt").await.unwrap();

    assert_eq!(fs.server_copies.load(Ordering::SeqCst), 0);
    assert_eq!(fs.puts.load(Ordering::SeqCst), 1);
    assert_eq!(fs.data("b.txt").unwrap(), b"abc");
}

#[tokio::test]
async fn stream_copy_retries_retryable_errors() {
    let ctx = context();
    let src_fs = MemFs::new("src", Features::default());
    let dst_fs = MemFs::new("dst", Features::default());
    dst_fs.failing_puts.store(1, Ordering::SeqCst);
    let src = src_fs.insert("a.txt", b"retry me");

    copy(&ctx, &dst_fs, src.as_ref(), "a.txt").await.unwrap();

    assert_eq!(dst_fs.puts.load(Ordering::SeqCst), 2);
    assert_eq!(dst_fs.data("a.txt").unwrap(), b"retry me");
    // Both attempts read the source through the accounting layer
    assert_eq!(ctx.stats.bytes(), 16);
    assert_eq!(ctx.stats.errors(), 0);
}

#[tokio::test]
async fn stream_copy_gives_up_on_permanent_errors() {
    let ctx = context();
    let src_fs = MemFs::new("src", Features::default());
    let mut dst_fs = MemFs::new("dst", Features::default());
    dst_fs.fail_with = || Error::Http(crate::error::HttpError::new(403, "forbidden"));
    dst_fs.failing_puts.store(5, Ordering::SeqCst);
    let src = src_fs.insert("a.txt", b"nope");

    let err = copy(&ctx, &dst_fs, src.as_ref(), "a.txt").await.unwrap_err();

    assert_eq!(err.http().map(|h| h.status), Some(403));
    assert_eq!(dst_fs.puts.load(Ordering::SeqCst), 1);
    assert_eq!(ctx.stats.errors(), 1);
    assert_eq!(ctx.stats.transfers(), 0);
    assert!(ctx.stats.last_error().unwrap().contains("forbidden"));
}

#[tokio::test]
async fn max_transfer_stops_copy_without_retry() {
    let stats = Arc::new(Stats::new(&AccountingConfig {
        max_transfer: Some(SizeSuffix(5)),
        bwlimit: None,
    }));
    let ctx = TransferContext::with_stats(stats.clone(), context().retry);
    let src_fs = MemFs::new("src", Features::default());
    let dst_fs = MemFs::new("dst", Features::default());
    let src = src_fs.insert("big.bin", &[1; 10]);

    let err = copy(&ctx, &dst_fs, src.as_ref(), "big.bin").await.unwrap_err();

    assert!(matches!(err, Error::MaxTransferLimitReached));
    assert_eq!(dst_fs.puts.load(Ordering::SeqCst), 1);
    assert!(dst_fs.data("big.bin").is_none());
    assert_eq!(stats.errors(), 1);
    assert_eq!(stats.fatal_errors(), 1);
}

#[tokio::test]
async fn move_within_same_remote_is_server_side() {
    let ctx = context();
    let fs = MemFs::new("mem", all_features());
    let src = fs.insert("old.txt", b"data");

    let dst = move_object(&ctx, &fs, src, "new.txt").await.unwrap();

    assert_eq!(dst.remote(), "new.txt");
    assert!(fs.data("old.txt").is_none());
    assert_eq!(fs.server_moves.load(Ordering::SeqCst), 1);
    assert_eq!(fs.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn move_across_remotes_copies_then_removes() {
    let ctx = context();
    let src_fs = MemFs::new("src", all_features());
    let dst_fs = MemFs::new("dst", all_features());
    let src = src_fs.insert("file.txt", b"payload");

    move_object(&ctx, &dst_fs, src, "file.txt").await.unwrap();

    assert!(src_fs.data("file.txt").is_none());
    assert_eq!(dst_fs.data("file.txt").unwrap(), b"payload");
    assert_eq!(dst_fs.server_moves.load(Ordering::SeqCst), 0);
    assert_eq!(ctx.stats.transfers(), 1);
}

#[tokio::test]
async fn copy_file_skips_identical_destination() {
    let ctx = context();
    let src_fs = MemFs::new("src", Features::default());
    let dst_fs = MemFs::new("dst", Features::default());
    let src = src_fs.insert("same.txt", b"12345");
    dst_fs.insert("same.txt", b"54321");

    let copied = copy_file(&ctx, &dst_fs, src.as_ref(), "same.txt", src_fs.precision())
        .await
        .unwrap();

    assert!(copied.is_none());
    assert_eq!(ctx.stats.checks(), 1);
    assert_eq!(dst_fs.puts.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn copy_file_replaces_changed_destination() {
    let ctx = context();
    let src_fs = MemFs::new("src", Features::default());
    let dst_fs = MemFs::new("dst", Features::default());
    let src = src_fs.insert("f.txt", b"new contents");
    dst_fs.insert("f.txt", b"old");

    let copied = copy_file(&ctx, &dst_fs, src.as_ref(), "f.txt", src_fs.precision())
        .await
        .unwrap();

    assert!(copied.is_some());
    assert_eq!(dst_fs.data("f.txt").unwrap(), b"new contents");
    assert_eq!(ctx.stats.checks(), 0);

    // Missing destinations are copied as well
    let fresh = copy_file(&ctx, &dst_fs, src.as_ref(), "g.txt", src_fs.precision())
        .await
        .unwrap();
    assert!(fresh.is_some());
}

#[test]
fn transfer_context_follows_config() {
    let config = crate::config::Config {
        low_level_retries: 7,
        ..Default::default()
    };
    let ctx = TransferContext::new(&config);
    assert_eq!(ctx.retry.max_attempts, 7);
    assert_eq!(ctx.stats.bytes(), 0);
}
