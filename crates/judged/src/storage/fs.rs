//! Directory-backed object store
//!
//! Layout under the root:
//! - `binaries/<objectId>`
//! - `testcases/<objectId>/<versionId>`

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::storage::{
    Bucket, NULL_VERSION, ObjectStat, ObjectStore, StorageError, validate_object_id,
};

#[derive(Debug, Clone)]
pub struct FsObjectStore {
    root: PathBuf,
}

impl FsObjectStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn object_path(&self, bucket: Bucket, object_id: &str) -> PathBuf {
        self.root.join(bucket.name()).join(object_id)
    }

    fn not_found(bucket: Bucket, object_id: &str, version: Option<&str>) -> StorageError {
        StorageError::NotFound {
            bucket,
            object_id: object_id.to_string(),
            version: version.map(str::to_string),
        }
    }

    /// Version ids sort lexicographically in creation order
    async fn versions(&self, dir: &Path) -> Result<Vec<String>, StorageError> {
        let mut versions = Vec::new();
        let mut entries = match tokio::fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(versions),
            Err(e) => return Err(e.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_file()
                && let Some(name) = entry.file_name().to_str()
                && !name.ends_with(".part")
            {
                versions.push(name.to_string());
            }
        }
        versions.sort();
        Ok(versions)
    }

    /// Resolve an object to its file on disk and the version it represents
    async fn resolve(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
    ) -> Result<(PathBuf, String), StorageError> {
        validate_object_id(object_id)?;
        let path = self.object_path(bucket, object_id);

        if !bucket.is_versioned() {
            if tokio::fs::metadata(&path).await.is_ok_and(|m| m.is_file()) {
                return Ok((path, NULL_VERSION.to_string()));
            }
            return Err(Self::not_found(bucket, object_id, version_id));
        }

        let version = match version_id {
            Some(version) => {
                validate_object_id(version)?;
                version.to_string()
            }
            None => self
                .versions(&path)
                .await?
                .pop()
                .ok_or_else(|| Self::not_found(bucket, object_id, None))?,
        };
        let file = path.join(&version);
        if tokio::fs::metadata(&file).await.is_ok_and(|m| m.is_file()) {
            Ok((file, version))
        } else {
            Err(Self::not_found(bucket, object_id, version_id))
        }
    }
}

/// Copy `source` next to `dest` and rename it into place
async fn copy_atomic(source: &Path, dest: &Path) -> Result<u64, std::io::Error> {
    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut partial = dest.as_os_str().to_owned();
    partial.push(".part");
    let partial = PathBuf::from(partial);

    let size = match tokio::fs::copy(source, &partial).await {
        Ok(size) => size,
        Err(e) => {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }
    };
    tokio::fs::rename(&partial, dest).await?;
    Ok(size)
}

#[async_trait]
impl ObjectStore for FsObjectStore {
    async fn stat(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectStat, StorageError> {
        let (path, version_id) = self.resolve(bucket, object_id, version_id).await?;
        let size_bytes = tokio::fs::metadata(&path).await?.len();
        Ok(ObjectStat {
            size_bytes,
            version_id,
        })
    }

    #[instrument(skip(self))]
    async fn fetch(
        &self,
        bucket: Bucket,
        object_id: &str,
        dest: &Path,
        version_id: Option<&str>,
    ) -> Result<(), StorageError> {
        let (path, _) = self.resolve(bucket, object_id, version_id).await?;
        let size = copy_atomic(&path, dest).await?;
        debug!(size, "fetched object");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn put(
        &self,
        bucket: Bucket,
        object_id: &str,
        source: &Path,
    ) -> Result<ObjectStat, StorageError> {
        validate_object_id(object_id)?;
        let path = self.object_path(bucket, object_id);

        let (dest, version_id) = if bucket.is_versioned() {
            let next = self
                .versions(&path)
                .await?
                .iter()
                .filter_map(|v| v.strip_prefix('v').and_then(|n| n.parse::<u64>().ok()))
                .max()
                .map_or(1, |n| n + 1);
            let version = format!("v{next:010}");
            (path.join(&version), version)
        } else {
            (path, NULL_VERSION.to_string())
        };

        let size_bytes = copy_atomic(source, &dest).await?;
        debug!(size_bytes, version_id, "stored object");
        Ok(ObjectStat {
            size_bytes,
            version_id,
        })
    }
}
