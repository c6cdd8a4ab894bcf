//! Directory path to ID cache
//!
//! Many remotes address folders by opaque IDs rather than by path. The
//! [`DirCache`] maps root-relative directory paths to those IDs, resolving
//! missing entries one component at a time through the backend's
//! [`DirCacheBackend`] primitives and creating directories on demand.
//!
//! Resolution of a given path is serialised so that racing callers issue at
//! most one `find_leaf`/`create_dir` pair for it. Callers resolving disjoint
//! paths don't wait on each other.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::error::{Error, Result};
use crate::path::{PathKey, join_path, split_path};

/// Primitives a backend supplies to the directory cache
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait DirCacheBackend: Send + Sync {
    /// Look for a directory called `leaf` inside `parent_id`
    async fn find_leaf(&self, parent_id: &str, leaf: &str) -> Result<Option<String>>;

    /// Create a directory called `leaf` inside `parent_id`, returning its ID
    async fn create_dir(&self, parent_id: &str, leaf: &str) -> Result<String>;
}

#[derive(Debug, Clone, Default)]
struct RootState {
    root_id: Option<String>,
    root_parent_id: Option<String>,
}

/// Bidirectional cache between directory paths and backend IDs
pub struct DirCache {
    backend: Arc<dyn DirCacheBackend>,
    root: String,
    true_root_id: String,
    keys: PathKey,
    cache: Mutex<HashMap<String, String>>,
    // Per-path locks for paths being resolved right now
    pending: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    root_state: Mutex<RootState>,
    root_lock: tokio::sync::Mutex<()>,
}

impl std::fmt::Debug for DirCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirCache")
            .field("root", &self.root)
            .field("true_root_id", &self.true_root_id)
            .field("entries", &self.len())
            .finish()
    }
}

impl DirCache {
    /// Make a cache for `root`, resolved against the backend's `true_root_id`
    pub fn new(root: &str, true_root_id: &str, backend: Arc<dyn DirCacheBackend>) -> Self {
        Self {
            backend,
            root: root.trim_matches('/').to_string(),
            true_root_id: true_root_id.to_string(),
            keys: PathKey::new(false),
            cache: Mutex::new(HashMap::new()),
            pending: Mutex::new(HashMap::new()),
            root_state: Mutex::new(RootState::default()),
            root_lock: tokio::sync::Mutex::new(()),
        }
    }

    /// Compare paths case-insensitively
    pub fn case_insensitive(mut self, yes: bool) -> Self {
        self.keys = PathKey::new(yes);
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    /// Look up a directory ID without touching the backend
    pub fn get(&self, path: &str) -> Option<String> {
        let key = self.keys.key(path);
        if key.is_empty() {
            return self.lock_root().root_id.clone();
        }
        self.lock_cache().get(&key).cloned()
    }

    /// Record an ID discovered elsewhere, e.g. while listing
    pub fn put(&self, path: &str, id: &str) {
        let key = self.keys.key(path);
        if key.is_empty() {
            return;
        }
        self.lock_cache().insert(key, id.to_string());
    }

    /// Number of cached non-root entries
    pub fn len(&self) -> usize {
        self.lock_cache().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove `path` and everything below it
    ///
    /// Flushing the root resets the whole cache.
    pub fn flush_dir(&self, path: &str) {
        let key = self.keys.key(path);
        if key.is_empty() {
            self.reset_root();
            return;
        }
        let keys = self.keys;
        let mut cache = self.lock_cache();
        let before = cache.len();
        cache.retain(|cached, _| !keys.is_within(cached, &key));
        tracing::debug!(path = %path, removed = before - cache.len(), "Flushed directory cache");
    }

    /// Forget everything, including the resolved root
    pub fn reset_root(&self) {
        self.lock_cache().clear();
        *self.lock_root() = RootState::default();
        tracing::debug!(root = %self.root, "Reset directory cache");
    }

    /// True once the configured root has been resolved
    pub fn found_root(&self) -> bool {
        self.lock_root().root_id.is_some()
    }

    /// The resolved root ID
    pub fn root_id(&self) -> Result<String> {
        self.lock_root().root_id.clone().ok_or(Error::DirNotFound)
    }

    /// ID of the directory holding the configured root, if it was resolved
    pub fn root_parent_id(&self) -> Option<String> {
        self.lock_root().root_parent_id.clone()
    }

    /// Resolve the configured root, creating it if asked
    pub async fn find_root(&self, create: bool) -> Result<()> {
        if self.found_root() {
            return Ok(());
        }
        let _guard = self.root_lock.lock().await;
        if self.found_root() {
            return Ok(());
        }

        let mut parent_id = None;
        let mut id = self.true_root_id.clone();
        if !self.root.is_empty() {
            for leaf in self.root.split('/') {
                let found = self
                    .lookup(&id, leaf, create)
                    .await
                    .map_err(|e| e.context(format!("resolving root {:?}", self.root)))?;
                parent_id = Some(std::mem::replace(&mut id, found));
            }
        }

        tracing::debug!(root = %self.root, root_id = %id, "Found root directory");
        *self.lock_root() = RootState {
            root_id: Some(id),
            root_parent_id: parent_id,
        };
        Ok(())
    }

    /// Find the ID of directory `path`, creating missing components if asked
    pub async fn find_dir(&self, path: &str, create: bool) -> Result<String> {
        self.find_root(create).await?;
        let path = path.trim_matches('/');
        if let Some(id) = self.get(path) {
            return Ok(id);
        }

        let mut id = self.root_id()?;
        let mut resolved = String::new();
        for leaf in path.split('/') {
            resolved = join_path(&resolved, leaf);
            id = self.resolve(&resolved, &id, leaf, create).await?;
        }
        Ok(id)
    }

    /// Split `path` into leaf and parent, resolving the parent's ID
    pub async fn find_path(&self, path: &str, create: bool) -> Result<(String, String)> {
        let (directory, leaf) = split_path(path.trim_matches('/'));
        let directory_id = self.find_dir(directory, create).await?;
        Ok((leaf.to_string(), directory_id))
    }

    /// Resolve the root, then the parent of `path`
    ///
    /// Returns the leaf name and the ID of the directory that holds it.
    pub async fn find_root_and_path(&self, path: &str, create: bool) -> Result<(String, String)> {
        self.find_root(create).await?;
        self.find_path(path, create).await
    }

    // Resolve one component, serialised against other resolvers of `path`
    async fn resolve(&self, path: &str, parent_id: &str, leaf: &str, create: bool) -> Result<String> {
        if let Some(id) = self.get(path) {
            return Ok(id);
        }

        let key = self.keys.key(path);
        let lock = {
            let mut pending = self.lock_pending();
            pending.entry(key.clone()).or_default().clone()
        };
        let entry = PendingEntry {
            cache: self,
            key,
            lock,
        };

        let _guard = entry.lock.lock().await;
        match self.get(path) {
            Some(id) => Ok(id),
            None => {
                let found = self.lookup(parent_id, leaf, create).await;
                if let Ok(id) = &found {
                    self.put(path, id);
                }
                found
            }
        }
    }

    async fn lookup(&self, parent_id: &str, leaf: &str, create: bool) -> Result<String> {
        match self.backend.find_leaf(parent_id, leaf).await {
            Ok(Some(id)) => Ok(id),
            Ok(None) if create => {
                let id = self.backend.create_dir(parent_id, leaf).await?;
                tracing::debug!(parent_id = %parent_id, leaf = %leaf, id = %id, "Created directory");
                Ok(id)
            }
            Ok(None) => Err(Error::DirNotFound),
            // A vanished parent reads as a missing directory
            Err(e) if e.is_not_found() => Err(Error::DirNotFound),
            Err(e) => Err(e),
        }
    }

    fn lock_cache(&self) -> std::sync::MutexGuard<'_, HashMap<String, String>> {
        self.cache.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_pending(
        &self,
    ) -> std::sync::MutexGuard<'_, HashMap<String, Arc<tokio::sync::Mutex<()>>>> {
        self.pending.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn lock_root(&self) -> std::sync::MutexGuard<'_, RootState> {
        self.root_state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// Drops the per-path lock from the pending map once its last user is gone,
// including callers cancelled while waiting
struct PendingEntry<'a> {
    cache: &'a DirCache,
    key: String,
    lock: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for PendingEntry<'_> {
    fn drop(&mut self) {
        let mut pending = self.cache.lock_pending();
        if pending
            .get(&self.key)
            .is_some_and(|held| Arc::ptr_eq(held, &self.lock) && Arc::strong_count(held) <= 2)
        {
            pending.remove(&self.key);
        }
    }
}
