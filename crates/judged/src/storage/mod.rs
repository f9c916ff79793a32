//! Object storage interface
//!
//! The daemon reads binaries and testcases from, and publishes binaries to, a
//! content store with two logical buckets. Only the narrow surface the judge
//! needs is modelled here.

use std::fmt;
use std::path::Path;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::storage::fs::FsObjectStore;

mod fs;

/// Version id reported for objects in an unversioned bucket
pub const NULL_VERSION: &str = "null";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Bucket {
    /// Compiled submissions, keyed by submission id
    Binaries,
    /// Testcase inputs and answers, versioned
    Testcases,
}

impl Bucket {
    pub fn name(&self) -> &'static str {
        match self {
            Bucket::Binaries => "binaries",
            Bucket::Testcases => "testcases",
        }
    }

    pub fn is_versioned(&self) -> bool {
        matches!(self, Bucket::Testcases)
    }
}

impl fmt::Display for Bucket {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ObjectStat {
    pub size_bytes: u64,
    pub version_id: String,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("object {bucket}/{object_id} (version {version:?}) not found")]
    NotFound {
        bucket: Bucket,
        object_id: String,
        version: Option<String>,
    },

    #[error("invalid object id: {0:?}")]
    InvalidObjectId(String),

    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Reads and writes artifacts in the object store
#[async_trait]
pub trait ObjectStore: Send + Sync + fmt::Debug {
    /// Size and resolved version of an object; `None` means the newest version
    async fn stat(
        &self,
        bucket: Bucket,
        object_id: &str,
        version_id: Option<&str>,
    ) -> Result<ObjectStat, StorageError>;

    /// Download an object to `dest`
    async fn fetch(
        &self,
        bucket: Bucket,
        object_id: &str,
        dest: &Path,
        version_id: Option<&str>,
    ) -> Result<(), StorageError>;

    /// Upload the file at `source`; returns the stored object's stat
    async fn put(
        &self,
        bucket: Bucket,
        object_id: &str,
        source: &Path,
    ) -> Result<ObjectStat, StorageError>;
}

/// Reject ids that could escape a directory-backed layout
pub(crate) fn validate_object_id(object_id: &str) -> Result<(), StorageError> {
    let bad = object_id.is_empty()
        || object_id.starts_with('/')
        || object_id.split('/').any(|part| part.is_empty() || part == "." || part == "..");
    if bad {
        return Err(StorageError::InvalidObjectId(object_id.to_string()));
    }
    Ok(())
}
