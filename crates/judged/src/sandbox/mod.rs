//! Sandbox controller contract
//!
//! A [`Sandbox`] brackets the lifecycle of one isolated execution environment per
//! slot: initialize a clean root, run a command under [`Constraints`], tear down.
//! Over-limit conditions are reported through [`SandboxResult::status`]; an `Err`
//! means the isolation primitive itself failed.

use std::collections::BTreeMap;
use std::path::PathBuf;

use async_trait::async_trait;
use thiserror::Error;

pub use crate::sandbox::workspace::Workspace;
use crate::types::{Constraints, SandboxResult, SlotId};

mod workspace;

/// Errors raised by the sandbox primitive itself
#[derive(Debug, Error)]
pub enum SandboxError {
    #[error("failed to initialize slot {slot}: {message}")]
    InitFailed { slot: SlotId, message: String },

    #[error("failed to tear down slot {slot}: {message}")]
    TeardownFailed { slot: SlotId, message: String },

    #[error("sandbox run in slot {slot} failed: {message}")]
    RunFailed { slot: SlotId, message: String },

    #[error("sandbox command failed: {0}")]
    CommandFailed(String),

    #[error("failed to spawn sandbox process: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sandbox binary not found at {0}")]
    BinaryNotFound(PathBuf),

    #[error("invalid path: {0}")]
    InvalidPath(String),

    #[error("mount source path does not exist: {0}")]
    MountSourceNotFound(String),
}

/// One command to run inside a slot
///
/// Redirection paths are relative to the slot's working root.
#[derive(Debug, Clone)]
pub struct RunRequest {
    pub command: Vec<String>,
    pub constraints: Constraints,
    pub stdin: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl RunRequest {
    pub fn new(command: Vec<String>, constraints: Constraints) -> Self {
        Self {
            command,
            constraints,
            stdin: None,
            stdout: None,
            stderr: None,
            env: BTreeMap::new(),
        }
    }

    pub fn stdin(mut self, path: impl Into<String>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    pub fn stdout(mut self, path: impl Into<String>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    pub fn stderr(mut self, path: impl Into<String>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn envs<'a>(mut self, vars: impl IntoIterator<Item = (&'a String, &'a String)>) -> Self {
        for (key, value) in vars {
            self.env.insert(key.clone(), value.clone());
        }
        self
    }
}

/// Lifecycle of an isolated execution environment
///
/// Implementations must not retain anything about a slot between calls except
/// what the underlying primitive keeps on disk.
#[async_trait]
pub trait Sandbox: Send + Sync + std::fmt::Debug {
    /// Prepare a clean, empty root for `slot` and return its host path.
    ///
    /// Safe to call on a slot left in any state by a previous task.
    async fn initialize(&self, slot: SlotId) -> Result<PathBuf, SandboxError>;

    /// Run a command in `slot`, blocking until it exits or is killed.
    async fn run(&self, slot: SlotId, request: RunRequest) -> Result<SandboxResult, SandboxError>;

    /// Destroy the slot's root and any leftover processes.
    ///
    /// A no-op for a slot that is not initialized.
    async fn teardown(&self, slot: SlotId) -> Result<(), SandboxError>;
}
