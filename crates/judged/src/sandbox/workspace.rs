//! Host-side view of a slot's working root

use std::path::{Path, PathBuf};

use tracing::{debug, instrument};

use crate::sandbox::SandboxError;
use crate::types::SlotId;

/// The working root of an initialized slot, as seen from the host
///
/// The sandboxed process sees the same directory as its current directory, so
/// a name passed to [`file_path`](Self::file_path) is also valid inside the
/// sandbox as a relative path.
#[derive(Debug, Clone)]
pub struct Workspace {
    slot: SlotId,
    root: PathBuf,
}

impl Workspace {
    pub fn new(slot: SlotId, root: impl Into<PathBuf>) -> Self {
        Self {
            slot,
            root: root.into(),
        }
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Get the host path to a file inside the workspace
    ///
    /// Returns an error if the path contains path traversal attempts.
    pub fn file_path(&self, name: &str) -> Result<PathBuf, SandboxError> {
        if name.is_empty() || name.contains("..") || name.starts_with('/') {
            return Err(SandboxError::InvalidPath(format!(
                "path traversal not allowed: {name}"
            )));
        }
        Ok(self.root.join(name))
    }

    /// Write a file into the workspace
    #[instrument(skip(self, content), fields(slot = %self.slot))]
    pub async fn write_file(&self, name: &str, content: &[u8]) -> Result<(), SandboxError> {
        let path = self.file_path(name)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        tokio::fs::write(&path, content).await?;
        debug!(?path, len = content.len(), "wrote file to workspace");
        Ok(())
    }

    /// Read a file from the workspace
    pub async fn read_file(&self, name: &str) -> Result<Vec<u8>, SandboxError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::read(&path).await?)
    }

    /// Check if a file exists in the workspace
    pub async fn file_exists(&self, name: &str) -> Result<bool, SandboxError> {
        let path = self.file_path(name)?;
        Ok(tokio::fs::metadata(&path).await.is_ok())
    }

    /// Mark a file as executable by everyone (the sandbox runs as another user)
    pub async fn set_executable(&self, name: &str) -> Result<(), SandboxError> {
        use std::os::unix::fs::PermissionsExt;

        let path = self.file_path(name)?;
        tokio::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).await?;
        Ok(())
    }
}
