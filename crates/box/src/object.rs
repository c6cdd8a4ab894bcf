//! Box file objects

use std::any::Any;
use std::fmt;
use std::io;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::TryStreamExt;
use jiff::Timestamp;
use reqwest::Method;
use reqwest::header::RANGE;
use rfs_core::{
    BoxReader, Error, Fs, HashType, Object, ObjectInfo, OpenOption, Result, ResultExt,
};
use tokio_util::io::StreamReader;
use tracing::debug;

use crate::api::{ITEM_FIELDS, Item, UpdateFileModTime};
use crate::client::{Host, transport_error};
use crate::fs::BoxFs;
use crate::upload::{UploadStrategy, UploadTarget};

/// Metadata Box reports for a file
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Metadata {
    pub(crate) id: String,
    pub(crate) size: u64,
    pub(crate) mod_time: Timestamp,
    pub(crate) sha1: Option<String>,
}

impl Metadata {
    fn from_item(item: &Item) -> Result<Self> {
        if !item.is_file() {
            return Err(Error::NotAFile);
        }
        Ok(Self {
            id: item.id.clone(),
            size: item.size(),
            mod_time: item.mod_time().unwrap_or(Timestamp::UNIX_EPOCH),
            sha1: item.sha1.clone().filter(|s| !s.is_empty()),
        })
    }
}

/// A file on Box
pub struct BoxObject {
    fs: BoxFs,
    remote: String,
    // Read on first use, then replaced wholesale by server responses
    meta: Mutex<Option<Metadata>>,
}

impl BoxObject {
    pub(crate) fn new(fs: BoxFs, remote: &str) -> Self {
        Self {
            fs,
            remote: remote.to_string(),
            meta: Mutex::new(None),
        }
    }

    pub(crate) fn from_item(fs: BoxFs, remote: &str, item: &Item) -> Result<Self> {
        let object = Self::new(fs, remote);
        object.set_metadata(item)?;
        Ok(object)
    }

    pub(crate) fn fs(&self) -> &BoxFs {
        &self.fs
    }

    /// Box's ID for this file, if its metadata has been read
    pub fn id(&self) -> Option<String> {
        self.lock_meta().as_ref().map(|m| m.id.clone())
    }

    fn set_metadata(&self, item: &Item) -> Result<()> {
        let meta = Metadata::from_item(item)?;
        *self.lock_meta() = Some(meta);
        Ok(())
    }

    /// Metadata, fetched from Box on first use
    pub(crate) async fn read_metadata(&self) -> Result<Metadata> {
        let cached = self.lock_meta().clone();
        if let Some(meta) = cached {
            return Ok(meta);
        }
        let item = self.read_metadata_for_path().await?;
        let meta = Metadata::from_item(&item)?;
        *self.lock_meta() = Some(meta.clone());
        Ok(meta)
    }

    async fn read_metadata_for_path(&self) -> Result<Item> {
        let (leaf, dir_id) = match self
            .fs
            .dir_cache()
            .find_root_and_path(&self.remote, false)
            .await
        {
            Ok(found) => found,
            Err(e) if e.is_dir_not_found() => return Err(Error::ObjectNotFound),
            Err(e) => return Err(e),
        };

        match self.fs.api().find_file(&dir_id, &leaf).await {
            Ok(Some(item)) => Ok(item),
            Ok(None) => Err(Error::ObjectNotFound),
            Err(e) if is_missing(&e) => Err(Error::ObjectNotFound),
            Err(e) => Err(e),
        }
    }

    fn lock_meta(&self) -> std::sync::MutexGuard<'_, Option<Metadata>> {
        self.meta.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Box answers for deleted or trashed items with these codes
fn is_missing(err: &Error) -> bool {
    err.http().is_some_and(|http| {
        http.status == 404
            || matches!(http.code.as_deref(), Some("not_found") | Some("trashed"))
    })
}

impl fmt::Debug for BoxObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxObject")
            .field("remote", &self.remote)
            .field("meta", &*self.lock_meta())
            .finish()
    }
}

impl fmt::Display for BoxObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.remote)
    }
}

#[async_trait]
impl Object for BoxObject {
    fn remote(&self) -> &str {
        &self.remote
    }

    fn fs_name(&self) -> &str {
        self.fs.name()
    }

    async fn size(&self) -> Result<u64> {
        Ok(self.read_metadata().await?.size)
    }

    async fn mod_time(&self) -> Result<Timestamp> {
        Ok(self.read_metadata().await?.mod_time)
    }

    async fn hash(&self, ty: HashType) -> Result<Option<String>> {
        self.fs.hashes().check(ty)?;
        Ok(self.read_metadata().await?.sha1)
    }

    async fn set_mod_time(&mut self, mod_time: Timestamp) -> Result<()> {
        let meta = self.read_metadata().await?;
        let api = self.fs.api();
        let request = api
            .srv
            .request(Method::PUT, Host::Api, &format!("/files/{}", meta.id))?
            .query(&[("fields", ITEM_FIELDS)])
            .json(&UpdateFileModTime {
                content_modified_at: mod_time.into(),
            });
        let item: Item = api.call_json(request).await?;
        self.set_metadata(&item)
    }

    async fn open(&self, options: &[OpenOption]) -> Result<BoxReader> {
        let meta = self.read_metadata().await?;
        if meta.id.is_empty() {
            return Err(Error::General(format!(
                "can't download {:?}: no id",
                self.remote
            )));
        }

        let api = self.fs.api();
        let mut request = api
            .srv
            .request(Method::GET, Host::Api, &format!("/files/{}/content", meta.id))?;
        if let Some(option) = options.last() {
            request = request.header(RANGE, option.range_header());
        }
        let response = api
            .call(request)
            .await
            .context(format!("opening {:?}", self.remote))?;

        debug!(remote = %self.remote, "Opened for download");
        let stream = response
            .bytes_stream()
            .map_err(|e| io::Error::from(transport_error(e)));
        Ok(Box::pin(StreamReader::new(stream)))
    }

    async fn update(&mut self, input: BoxReader, src: &dyn ObjectInfo) -> Result<()> {
        let (leaf, dir_id) = self
            .fs
            .dir_cache()
            .find_root_and_path(&self.remote, true)
            .await?;
        let existing_id = self.id();
        let target = UploadTarget {
            leaf: &leaf,
            dir_id: &dir_id,
            existing_id: existing_id.as_deref(),
            mod_time: src.mod_time(),
        };

        let api = self.fs.api();
        let cutoff = api.options.upload_cutoff.bytes();
        let item = match (UploadStrategy::choose(src.size(), cutoff), src.size()) {
            (UploadStrategy::Chunked, Some(size)) => api.upload_chunked(input, &target, size).await?,
            _ => api.upload_single(input, &target, src.size()).await?,
        };
        self.set_metadata(&item)
    }

    async fn remove(&self) -> Result<()> {
        let meta = self.read_metadata().await?;
        self.fs.api().delete_file(&meta.id).await
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}
