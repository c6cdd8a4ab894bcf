//! Box filesystem: path resolution, listing and server-side operations

use std::any::Any;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Method, RequestBuilder, Response};
use rfs_core::path::{clean_root, join_path, split_path};
use rfs_core::{
    BoxReader, DirCache, DirCacheBackend, DirEntry, Directory, Error, Features, Fs, HashSet,
    HashType, Object, ObjectInfo, Pacer, Result, RootKind, TokenDispenser, should_retry,
};
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::api::{self, CopyFile, CreateFolder, ITEM_FIELDS, Item, Parent, UpdateFileMove};
use crate::client::{Host, RestClient};
use crate::names::{replace_reserved, restore_reserved};
use crate::object::BoxObject;
use crate::options::{BoxOptions, ROOT_ID};

/// Which item types a listing reports
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ListFilter {
    All,
    DirsOnly,
    FilesOnly,
}

/// Connection state shared by every Fs and object of one remote
pub(crate) struct BoxApi {
    pub(crate) srv: RestClient,
    pub(crate) pacer: Pacer,
    pub(crate) upload_tokens: TokenDispenser,
    pub(crate) options: BoxOptions,
}

impl fmt::Debug for BoxApi {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxApi")
            .field("root_url", &self.options.root_url)
            .field("pacer", &self.pacer)
            .field("upload_tokens", &self.upload_tokens)
            .finish()
    }
}

impl BoxApi {
    fn new(options: BoxOptions) -> Result<Self> {
        Ok(Self {
            srv: RestClient::new(&options.root_url, &options.upload_url, &options.access_token)?,
            pacer: Pacer::new(&options.pacer),
            upload_tokens: TokenDispenser::new(options.transfers),
            options,
        })
    }

    /// Send `request` through the pacer, retrying transient failures
    pub(crate) async fn call(&self, request: RequestBuilder) -> Result<Response> {
        let request = &request;
        self.pacer
            .call(|| async move { should_retry(self.send(request).await) })
            .await
    }

    /// Like [`call`](Self::call), decoding a JSON body
    pub(crate) async fn call_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let request = &request;
        self.pacer
            .call(|| async move {
                let result = match self.send(request).await {
                    Ok(response) => response
                        .json::<T>()
                        .await
                        .map_err(crate::client::transport_error),
                    Err(e) => Err(e),
                };
                should_retry(result)
            })
            .await
    }

    async fn send(&self, request: &RequestBuilder) -> Result<Response> {
        let request = request
            .try_clone()
            .ok_or_else(|| Error::General("request body can't be replayed".to_string()))?;
        self.srv.call(request).await
    }

    /// Walk the entries of folder `dir_id`, page by page
    ///
    /// `f` is called for every active entry passing `filter`, with its name
    /// already mapped back from Box's encoding. Returning true from `f`
    /// stops the walk, and `list_all` then returns true.
    pub(crate) async fn list_all<F>(&self, dir_id: &str, filter: ListFilter, mut f: F) -> Result<bool>
    where
        F: FnMut(Item) -> bool + Send,
    {
        let path = format!("/folders/{dir_id}/items");
        let chunk = u64::from(self.options.list_chunk);
        let mut offset = 0u64;
        loop {
            let request = self
                .srv
                .request(Method::GET, Host::Api, &path)?
                .query(&[("fields", ITEM_FIELDS)])
                .query(&[("limit", chunk), ("offset", offset)]);
            let page: api::FolderItems = self
                .call_json(request)
                .await
                .map_err(|e| e.context("couldn't list files"))?;

            for mut item in page.entries {
                if item.is_folder() {
                    if filter == ListFilter::FilesOnly {
                        continue;
                    }
                } else if item.is_file() {
                    if filter == ListFilter::DirsOnly {
                        continue;
                    }
                } else {
                    debug!(name = %item.name, item_type = %item.item_type, "Ignoring unknown item type");
                    continue;
                }
                if !item.is_active() {
                    continue;
                }
                item.name = restore_reserved(&item.name);
                if f(item) {
                    return Ok(true);
                }
            }

            offset += if page.limit > 0 { page.limit } else { chunk };
            if offset >= page.total_count {
                return Ok(false);
            }
        }
    }

    /// Find the file called `leaf` in folder `dir_id`
    pub(crate) async fn find_file(&self, dir_id: &str, leaf: &str) -> Result<Option<Item>> {
        let mut found = None;
        self.list_all(dir_id, ListFilter::FilesOnly, |item| {
            if item.name == leaf {
                found = Some(item);
                true
            } else {
                false
            }
        })
        .await?;
        Ok(found)
    }

    pub(crate) async fn delete_file(&self, id: &str) -> Result<()> {
        let request = self
            .srv
            .request(Method::DELETE, Host::Api, &format!("/files/{id}"))?;
        self.call(request).await?;
        Ok(())
    }

    async fn delete_folder(&self, id: &str, recursive: bool) -> Result<()> {
        let request = self
            .srv
            .request(Method::DELETE, Host::Api, &format!("/folders/{id}"))?
            .query(&[("recursive", recursive)]);
        self.call(request).await?;
        Ok(())
    }

    async fn copy_file(&self, id: &str, leaf: &str, dir_id: &str) -> Result<Item> {
        let body = CopyFile {
            name: replace_reserved(leaf),
            parent: Parent::new(dir_id),
        };
        let request = self
            .srv
            .request(Method::POST, Host::Api, &format!("/files/{id}/copy"))?
            .query(&[("fields", ITEM_FIELDS)])
            .json(&body);
        self.call_json(request).await
    }

    /// Rename and/or reparent a file or folder
    async fn move_item(&self, endpoint: &str, id: &str, leaf: &str, dir_id: &str) -> Result<Item> {
        let body = UpdateFileMove {
            name: replace_reserved(leaf),
            parent: Parent::new(dir_id),
        };
        let request = self
            .srv
            .request(Method::PUT, Host::Api, &format!("{endpoint}/{id}"))?
            .query(&[("fields", ITEM_FIELDS)])
            .json(&body);
        self.call_json(request).await
    }
}

#[async_trait]
impl DirCacheBackend for BoxApi {
    async fn find_leaf(&self, parent_id: &str, leaf: &str) -> Result<Option<String>> {
        let mut found = None;
        self.list_all(parent_id, ListFilter::DirsOnly, |item| {
            if item.name == leaf {
                found = Some(item.id);
                true
            } else {
                false
            }
        })
        .await?;
        Ok(found)
    }

    async fn create_dir(&self, parent_id: &str, leaf: &str) -> Result<String> {
        let body = CreateFolder {
            name: replace_reserved(leaf),
            parent: Parent::new(parent_id),
        };
        let request = self
            .srv
            .request(Method::POST, Host::Api, "/folders")?
            .query(&[("fields", ITEM_FIELDS)])
            .json(&body);
        let item: Item = self.call_json(request).await?;
        Ok(item.id)
    }
}

struct FsInner {
    name: String,
    root: String,
    api: Arc<BoxApi>,
    dir_cache: DirCache,
}

/// A Box remote rooted at a folder
///
/// Cloning is cheap and clones share the directory cache and the pacer.
#[derive(Clone)]
pub struct BoxFs {
    inner: Arc<FsInner>,
}

impl BoxFs {
    /// Connect to Box with `options`, rooted at `root`
    ///
    /// If `root` names an existing file the returned Fs is rooted at its
    /// parent folder and [`RootKind::File`] is reported.
    pub async fn new(name: &str, root: &str, options: BoxOptions) -> Result<(BoxFs, RootKind)> {
        options.validate()?;
        Self::connect(name, root, options).await
    }

    #[cfg(test)]
    pub(crate) async fn new_unchecked(
        name: &str,
        root: &str,
        options: BoxOptions,
    ) -> Result<(BoxFs, RootKind)> {
        options.validate_limits()?;
        Self::connect(name, root, options).await
    }

    async fn connect(name: &str, root: &str, options: BoxOptions) -> Result<(BoxFs, RootKind)> {
        let api = Arc::new(BoxApi::new(options)?);
        let root = clean_root(root);
        let fs = Self::with_api(name, &root, api.clone());

        let err = match fs.inner.dir_cache.find_root(false).await {
            Ok(()) => return Ok((fs, RootKind::Directory)),
            Err(e) if e.is_not_found() => e,
            Err(e) => return Err(e),
        };

        // The root may be a file, in which case use its parent
        let (parent, leaf) = split_path(&root);
        let parent_fs = Self::with_api(name, parent, api);
        match parent_fs.new_box_object(leaf).await {
            Ok(_) => {
                info!(root = %root, "Root is a file, using its parent");
                Ok((parent_fs, RootKind::File))
            }
            Err(e) if e.is_not_found() => {
                debug!(root = %root, error = %err, "Root doesn't exist yet");
                Ok((fs, RootKind::Directory))
            }
            Err(e) => Err(e),
        }
    }

    fn with_api(name: &str, root: &str, api: Arc<BoxApi>) -> BoxFs {
        let dir_cache = DirCache::new(root, ROOT_ID, api.clone()).case_insensitive(true);
        BoxFs {
            inner: Arc::new(FsInner {
                name: name.to_string(),
                root: root.to_string(),
                api,
                dir_cache,
            }),
        }
    }

    pub(crate) fn api(&self) -> &BoxApi {
        &self.inner.api
    }

    pub(crate) fn dir_cache(&self) -> &DirCache {
        &self.inner.dir_cache
    }

    /// The pacer spacing this remote's API calls
    pub fn pacer(&self) -> &Pacer {
        &self.inner.api.pacer
    }

    /// Slots for concurrent chunked uploads
    pub fn upload_tokens(&self) -> &TokenDispenser {
        &self.inner.api.upload_tokens
    }

    pub(crate) async fn new_box_object(&self, remote: &str) -> Result<BoxObject> {
        let object = BoxObject::new(self.clone(), remote);
        object.read_metadata().await?;
        Ok(object)
    }

    // Remove directory `dir`; with `check` set it must be empty
    async fn purge_check(&self, dir: &str, check: bool) -> Result<()> {
        let root = join_path(&self.inner.root, dir);
        if root.is_empty() {
            return Err(Error::General("can't purge root directory".to_string()));
        }
        let dir_cache = self.dir_cache();
        dir_cache.find_root(false).await?;
        let id = dir_cache.find_dir(dir, false).await?;
        self.api()
            .delete_folder(&id, !check)
            .await
            .map_err(|e| e.context("rmdir failed"))?;
        dir_cache.flush_dir(dir);
        Ok(())
    }

    // Box treats names differing only by case as the same item
    fn check_case_collision(&self, op: &str, src: &BoxObject, remote: &str) -> Result<()> {
        let src_path = join_path(src.fs().root(), src.remote());
        let dst_path = join_path(self.root(), remote);
        if src_path.to_lowercase() == dst_path.to_lowercase() {
            return Err(Error::General(format!(
                "can't {op} {src_path:?} -> {dst_path:?} as they are the same name when lowercase"
            )));
        }
        Ok(())
    }

    // The source must be a Box object of this same remote
    fn same_remote<'a>(&self, src: &'a dyn Object) -> Option<&'a BoxObject> {
        src.as_any()
            .downcast_ref::<BoxObject>()
            .filter(|o| o.fs_name() == self.name())
    }
}

impl fmt::Debug for BoxFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoxFs")
            .field("name", &self.inner.name)
            .field("root", &self.inner.root)
            .field("api", &self.inner.api)
            .finish()
    }
}

impl fmt::Display for BoxFs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "box root '{}'", self.inner.root)
    }
}

#[async_trait]
impl Fs for BoxFs {
    fn name(&self) -> &str {
        &self.inner.name
    }

    fn root(&self) -> &str {
        &self.inner.root
    }

    fn features(&self) -> Features {
        Features {
            case_insensitive: true,
            can_have_empty_directories: true,
            purge: true,
            copy: true,
            move_object: true,
            dir_move: true,
            put_stream: true,
            dir_cache_flush: true,
        }
    }

    fn precision(&self) -> Duration {
        Duration::from_secs(1)
    }

    fn hashes(&self) -> HashSet {
        HashSet::of(&[HashType::Sha1])
    }

    async fn list(&self, dir: &str) -> Result<Vec<DirEntry>> {
        let dir_cache = self.dir_cache();
        dir_cache.find_root(false).await?;
        let dir_id = dir_cache.find_dir(dir, false).await?;

        let mut entries = Vec::new();
        self.api()
            .list_all(&dir_id, ListFilter::All, |item| {
                let remote = join_path(dir, &item.name);
                if item.is_folder() {
                    dir_cache.put(&remote, &item.id);
                    entries.push(DirEntry::Dir(Directory {
                        remote,
                        mod_time: item.mod_time(),
                        id: Some(item.id),
                    }));
                } else {
                    match BoxObject::from_item(self.clone(), &remote, &item) {
                        Ok(object) => entries.push(DirEntry::Object(Box::new(object))),
                        Err(e) => debug!(remote = %remote, error = %e, "Skipping entry"),
                    }
                }
                false
            })
            .await?;
        Ok(entries)
    }

    async fn new_object(&self, remote: &str) -> Result<Box<dyn Object>> {
        Ok(Box::new(self.new_box_object(remote).await?))
    }

    async fn put(&self, input: BoxReader, src: &dyn ObjectInfo) -> Result<Box<dyn Object>> {
        let mut object = match self.new_box_object(src.remote()).await {
            Ok(existing) => existing,
            Err(e) if e.is_object_not_found() => BoxObject::new(self.clone(), src.remote()),
            Err(e) => return Err(e),
        };
        object.update(input, src).await?;
        Ok(Box::new(object))
    }

    async fn put_stream(&self, input: BoxReader, src: &dyn ObjectInfo) -> Result<Box<dyn Object>> {
        self.put(input, src).await
    }

    async fn mkdir(&self, dir: &str) -> Result<()> {
        let dir_cache = self.dir_cache();
        dir_cache.find_root(true).await?;
        if !dir.is_empty() {
            dir_cache.find_dir(dir, true).await?;
        }
        Ok(())
    }

    async fn rmdir(&self, dir: &str) -> Result<()> {
        self.purge_check(dir, true).await
    }

    async fn purge(&self) -> Result<()> {
        self.purge_check("", false).await
    }

    async fn copy(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(src) = self.same_remote(src) else {
            debug!(remote = %remote, "Can't copy, not a Box object of this remote");
            return Err(Error::CantCopy);
        };
        let src_meta = src.read_metadata().await?;
        self.check_case_collision("copy", src, remote)?;

        let (leaf, dir_id) = self.dir_cache().find_root_and_path(remote, true).await?;
        let item = self.api().copy_file(&src_meta.id, &leaf, &dir_id).await?;
        Ok(Box::new(BoxObject::from_item(self.clone(), remote, &item)?))
    }

    async fn move_object(&self, src: &dyn Object, remote: &str) -> Result<Box<dyn Object>> {
        let Some(src) = self.same_remote(src) else {
            debug!(remote = %remote, "Can't move, not a Box object of this remote");
            return Err(Error::CantMove);
        };
        let src_meta = src.read_metadata().await?;
        self.check_case_collision("move", src, remote)?;

        let (leaf, dir_id) = self.dir_cache().find_root_and_path(remote, true).await?;
        let item = self
            .api()
            .move_item("/files", &src_meta.id, &leaf, &dir_id)
            .await?;
        Ok(Box::new(BoxObject::from_item(self.clone(), remote, &item)?))
    }

    async fn dir_move(&self, src: &dyn Fs, src_remote: &str, dst_remote: &str) -> Result<()> {
        let Some(src_fs) = src.as_any().downcast_ref::<BoxFs>() else {
            debug!("Can't move directory, not a Box remote");
            return Err(Error::CantDirMove);
        };
        if src_fs.name() != self.name() {
            debug!(src = %src_fs.name(), dst = %self.name(), "Can't move directory between remotes");
            return Err(Error::CantDirMove);
        }
        let src_path = join_path(src_fs.root(), src_remote);
        let dst_path = join_path(self.root(), dst_remote);
        if src_path.is_empty() || dst_path.is_empty() {
            return Err(Error::General("can't move root directory".to_string()));
        }

        // Find where the directory is going
        let (leaf, dir_id) = if dst_remote.is_empty() {
            match self.dir_cache().find_root(false).await {
                Ok(()) => return Err(Error::DirExists),
                Err(e) if e.is_dir_not_found() => {}
                Err(e) => return Err(e),
            }
            let (parent, leaf) = split_path(self.root());
            let parent_cache = DirCache::new(parent, ROOT_ID, self.inner.api.clone())
                .case_insensitive(true);
            parent_cache.find_root(true).await?;
            (leaf.to_string(), parent_cache.root_id()?)
        } else {
            let dir_cache = self.dir_cache();
            dir_cache.find_root(true).await?;
            match dir_cache.find_dir(dst_remote, false).await {
                Ok(_) => return Err(Error::DirExists),
                Err(e) if e.is_dir_not_found() => {}
                Err(e) => return Err(e),
            }
            dir_cache.find_path(dst_remote, true).await?
        };

        let src_cache = src_fs.dir_cache();
        src_cache.find_root(false).await?;
        let src_id = src_cache.find_dir(src_remote, false).await?;

        self.api()
            .move_item("/folders", &src_id, &leaf, &dir_id)
            .await?;
        src_cache.flush_dir(src_remote);
        debug!(src = %src_path, dst = %dst_path, "Moved directory");
        Ok(())
    }

    async fn dir_cache_flush(&self) {
        self.dir_cache().reset_root();
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

#[cfg(test)]
#[path = "fs_tests.rs"]
mod tests;
