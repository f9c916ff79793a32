//! Size-bounded local artifact cache
//!
//! Binaries and testcases are fetched from the object store on first use and
//! kept on local disk under a byte budget. Eviction is strict least-recently-used
//! and happens synchronously with insertion, deleting the backing file.
//!
//! All index mutations go through one lock. Downloads run outside it; their
//! size is reserved up front so parallel fetches of different keys cannot jointly
//! overshoot the budget. A fetch that finds the budget held only by other
//! downloads waits for one of them to settle. Fetches of the same key are
//! serialized by a per-key lock and the second caller reuses the first caller's
//! result.
//!
//! Versioned objects requested without a version are resolved against the store
//! first, so a newly uploaded version is never shadowed by an older cached one.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{Mutex, MutexGuard, Notify};
use tracing::{debug, instrument, warn};

use crate::storage::{Bucket, ObjectStore, StorageError};

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("object {bucket}/{object_id} (version {version:?}) not found")]
    NotFound {
        bucket: Bucket,
        object_id: String,
        version: Option<String>,
    },

    #[error("object of {size_bytes} bytes cannot fit a cache budget of {budget_bytes} bytes")]
    TooLarge { size_bytes: u64, budget_bytes: u64 },

    #[error("invalid cache configuration: {0}")]
    InvalidConfig(String),

    #[error("storage error: {0}")]
    Storage(StorageError),

    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<StorageError> for CacheError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::NotFound {
                bucket,
                object_id,
                version,
            } => CacheError::NotFound {
                bucket,
                object_id,
                version,
            },
            other => CacheError::Storage(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub bucket: Bucket,
    pub object_id: String,
    pub version_id: Option<String>,
}

impl CacheKey {
    pub fn new(bucket: Bucket, object_id: &str, version_id: Option<&str>) -> Self {
        Self {
            bucket,
            object_id: object_id.to_string(),
            version_id: version_id.map(str::to_string),
        }
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub key: CacheKey,
    pub local_path: PathBuf,
    pub size_bytes: u64,
    /// Access stamp; larger is more recent
    pub last_access: u64,
}

#[derive(Debug, Default)]
struct CacheState {
    entries: HashMap<CacheKey, CacheEntry>,
    /// Access stamp -> key, oldest first
    recency: BTreeMap<u64, CacheKey>,
    resident_bytes: u64,
    /// Bytes promised to downloads in progress
    reserved_bytes: u64,
    clock: u64,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn touch(&mut self, key: &CacheKey) -> Option<PathBuf> {
        let stamp = self.tick();
        let entry = self.entries.get_mut(key)?;
        self.recency.remove(&entry.last_access);
        entry.last_access = stamp;
        self.recency.insert(stamp, key.clone());
        Some(entry.local_path.clone())
    }

    fn insert(&mut self, key: CacheKey, local_path: PathBuf, size_bytes: u64) {
        let stamp = self.tick();
        if let Some(old) = self.entries.remove(&key) {
            self.recency.remove(&old.last_access);
            self.resident_bytes -= old.size_bytes;
        }
        self.recency.insert(stamp, key.clone());
        self.resident_bytes += size_bytes;
        self.entries.insert(
            key.clone(),
            CacheEntry {
                key,
                local_path,
                size_bytes,
                last_access: stamp,
            },
        );
    }

    fn remove(&mut self, key: &CacheKey) -> Option<CacheEntry> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.last_access);
        self.resident_bytes -= entry.size_bytes;
        Some(entry)
    }

    fn oldest(&self) -> Option<CacheKey> {
        self.recency.values().next().cloned()
    }
}

#[derive(Debug)]
pub struct ArtifactCache {
    root: PathBuf,
    budget_bytes: u64,
    safety_margin_bytes: u64,
    store: Arc<dyn ObjectStore>,
    state: Mutex<CacheState>,
    /// Signalled whenever a download releases its reservation
    released: Notify,
    fetch_locks: std::sync::Mutex<HashMap<CacheKey, Arc<Mutex<()>>>>,
}

impl ArtifactCache {
    /// Open a cache rooted at `root`, discarding anything left there
    ///
    /// The index starts empty, so stale files from a previous process would be
    /// invisible to the byte accounting.
    pub async fn open(
        root: impl Into<PathBuf>,
        budget_bytes: u64,
        safety_margin_bytes: u64,
        store: Arc<dyn ObjectStore>,
    ) -> Result<Self, CacheError> {
        if budget_bytes == 0 || safety_margin_bytes >= budget_bytes {
            return Err(CacheError::InvalidConfig(format!(
                "budget {budget_bytes} must exceed safety margin {safety_margin_bytes}"
            )));
        }

        let root = root.into();
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        for bucket in [Bucket::Binaries, Bucket::Testcases] {
            tokio::fs::create_dir_all(root.join(bucket.name())).await?;
        }

        debug!(?root, budget_bytes, "artifact cache opened");
        Ok(Self {
            root,
            budget_bytes,
            safety_margin_bytes,
            store,
            state: Mutex::new(CacheState::default()),
            released: Notify::new(),
            fetch_locks: std::sync::Mutex::new(HashMap::new()),
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn budget_bytes(&self) -> u64 {
        self.budget_bytes
    }

    /// Bytes currently held by cache entries
    pub async fn resident_bytes(&self) -> u64 {
        self.state.lock().await.resident_bytes
    }

    pub async fn len(&self) -> usize {
        self.state.lock().await.entries.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn contains(&self, bucket: Bucket, object_id: &str, version_id: Option<&str>) -> bool {
        let key = CacheKey::new(bucket, object_id, version_id);
        self.state.lock().await.entries.contains_key(&key)
    }

    fn local_path(&self, key: &CacheKey) -> PathBuf {
        let path = self.root.join(key.bucket.name()).join(&key.object_id);
        match &key.version_id {
            Some(version) if key.bucket.is_versioned() => path.join(version),
            _ => path,
        }
    }

    /// Pin a versioned object to a concrete version, asking the store for the newest
    async fn resolve_key(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
    ) -> Result<CacheKey, CacheError> {
        if version_id.is_some() || !bucket.is_versioned() {
            return Ok(CacheKey::new(bucket, object_id, version_id));
        }
        let stat = self.store.stat(bucket, object_id, None).await?;
        debug!(object_id, version_id = %stat.version_id, "resolved newest version");
        Ok(CacheKey::new(bucket, object_id, Some(&stat.version_id)))
    }

    /// Return a local path to the object, downloading it on a miss
    #[instrument(skip(self))]
    pub async fn fetch(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
    ) -> Result<PathBuf, CacheError> {
        let key = self.resolve_key(bucket, object_id, version_id).await?;
        self.fetch_key(&key).await
    }

    async fn fetch_key(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        if let Some(path) = self.state.lock().await.touch(key) {
            debug!("cache hit");
            return Ok(path);
        }

        let lock = self.fetch_lock(key);
        let result = {
            let _guard = lock.lock().await;
            self.fetch_locked(key).await
        };
        self.release_fetch_lock(key, lock);
        result
    }

    /// Copy the object into `dest`, fetching it first if needed
    ///
    /// If the entry is evicted between lookup and copy, it is fetched once more.
    pub async fn fetch_to(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
        dest: &Path,
    ) -> Result<u64, CacheError> {
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let key = self.resolve_key(bucket, object_id, version_id).await?;
        let path = self.fetch_key(&key).await?;
        match tokio::fs::copy(&path, dest).await {
            Ok(size) => return Ok(size),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(?path, "cached artifact vanished before copy, refetching");
                self.remove_entry(&key).await?;
            }
            Err(e) => return Err(e.into()),
        }

        let path = self.fetch_key(&key).await?;
        Ok(tokio::fs::copy(&path, dest).await?)
    }

    /// Drop an entry and its file, e.g. after a newer object was published
    ///
    /// Without a version, every cached version of a versioned object goes.
    pub async fn invalidate(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
    ) -> Result<(), CacheError> {
        if version_id.is_some() || !bucket.is_versioned() {
            return self
                .remove_entry(&CacheKey::new(bucket, object_id, version_id))
                .await;
        }

        let keys: Vec<CacheKey> = {
            let state = self.state.lock().await;
            state
                .entries
                .keys()
                .filter(|key| key.bucket == bucket && key.object_id == object_id)
                .cloned()
                .collect()
        };
        for key in keys {
            self.remove_entry(&key).await?;
        }
        Ok(())
    }

    async fn remove_entry(&self, key: &CacheKey) -> Result<(), CacheError> {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.remove(key) {
            remove_backing_file(&entry.local_path).await?;
            debug!(?key, "cache entry invalidated");
        }
        Ok(())
    }

    fn fetch_lock(&self, key: &CacheKey) -> Arc<Mutex<()>> {
        let mut locks = self
            .fetch_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        locks.entry(key.clone()).or_default().clone()
    }

    fn release_fetch_lock(&self, key: &CacheKey, lock: Arc<Mutex<()>>) {
        let mut locks = self
            .fetch_locks
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        // One reference in the map plus ours means nobody else is waiting
        if Arc::strong_count(&lock) == 2 {
            locks.remove(key);
        }
    }

    async fn fetch_locked(&self, key: &CacheKey) -> Result<PathBuf, CacheError> {
        if let Some(path) = self.state.lock().await.touch(key) {
            debug!("cache filled by concurrent fetch");
            return Ok(path);
        }

        let version = key.version_id.as_deref();
        let stat = self.store.stat(key.bucket, &key.object_id, version).await?;
        self.check_fits(stat.size_bytes)?;
        self.reserve(stat.size_bytes).await?.reserved_bytes += stat.size_bytes;

        let path = self.local_path(key);
        debug!(size_bytes = stat.size_bytes, ?path, "cache miss, downloading");
        let downloaded = self
            .store
            .fetch(key.bucket, &key.object_id, &path, version)
            .await;

        self.state.lock().await.reserved_bytes -= stat.size_bytes;
        self.released.notify_waiters();

        let admitted = match downloaded {
            Ok(()) => self.admit(key, &path).await,
            Err(e) => Err(e.into()),
        };
        if admitted.is_err() {
            let _ = remove_backing_file(&path).await;
        }
        admitted.map(|()| path)
    }

    /// Record a downloaded file, using its real size for the accounting
    async fn admit(&self, key: &CacheKey, path: &Path) -> Result<(), CacheError> {
        let size_bytes = tokio::fs::metadata(path).await?.len();
        self.check_fits(size_bytes)?;
        let mut state = self.reserve(size_bytes).await?;
        state.insert(key.clone(), path.to_path_buf(), size_bytes);
        debug!(
            size_bytes,
            resident_bytes = state.resident_bytes,
            "cache entry admitted"
        );
        Ok(())
    }

    fn check_fits(&self, size_bytes: u64) -> Result<(), CacheError> {
        if size_bytes + self.safety_margin_bytes > self.budget_bytes {
            return Err(CacheError::TooLarge {
                size_bytes,
                budget_bytes: self.budget_bytes,
            });
        }
        Ok(())
    }

    /// Make room for `incoming` bytes and return the locked state
    ///
    /// Waits while the space still missing is held by other downloads.
    async fn reserve(&self, incoming: u64) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        loop {
            let released = self.released.notified();
            let mut state = self.state.lock().await;
            if self.make_room(&mut state, incoming).await? {
                return Ok(state);
            }
            drop(state);
            debug!(incoming, "cache budget held by in-flight fetches, waiting");
            released.await;
        }
    }

    /// Evict oldest entries until `incoming` bytes plus the margin fit
    ///
    /// Returns `false` once nothing is left to evict and reservations still
    /// stand in the way.
    async fn make_room(&self, state: &mut CacheState, incoming: u64) -> Result<bool, CacheError> {
        let needed = incoming + self.safety_margin_bytes;
        while state.resident_bytes + state.reserved_bytes + needed > self.budget_bytes {
            let Some(victim) = state.oldest() else {
                return Ok(false);
            };
            let Some(entry) = state.remove(&victim) else {
                continue;
            };
            if let Err(e) = remove_backing_file(&entry.local_path).await {
                warn!(path = ?entry.local_path, error = %e, "failed to evict cache entry");
                state.insert(entry.key, entry.local_path, entry.size_bytes);
                return Err(e.into());
            }
            debug!(key = ?entry.key, size_bytes = entry.size_bytes, "evicted cache entry");
        }
        Ok(true)
    }
}

async fn remove_backing_file(path: &Path) -> Result<(), std::io::Error> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}
