//! Compile and grade stages
//!
//! A [`Runner`] executes one task inside a slot that the caller has already
//! initialized, and leaves teardown to the caller.

use std::sync::Arc;

use thiserror::Error;

pub use crate::runner::compare::{ComparisonPolicy, compare_lines, compare_tokens};

mod compare;
mod compile;
mod grade;

use crate::cache::{ArtifactCache, CacheError};
use crate::config::{Config, ConfigError};
use crate::sandbox::{Sandbox, SandboxError, Workspace};
use crate::storage::{ObjectStore, StorageError};
use crate::task::{ResultMessage, Task};

/// Infrastructure failures while running a stage
///
/// Compile errors and wrong answers are not represented here.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("artifact cache error: {0}")]
    Cache(#[from] CacheError),

    #[error("storage error: {0}")]
    Storage(#[from] StorageError),
}

/// Runs compile and grade stages against shared daemon resources
#[derive(Debug, Clone)]
pub struct Runner {
    config: Arc<Config>,
    sandbox: Arc<dyn Sandbox>,
    store: Arc<dyn ObjectStore>,
    cache: Arc<ArtifactCache>,
}

impl Runner {
    pub fn new(
        config: Arc<Config>,
        sandbox: Arc<dyn Sandbox>,
        store: Arc<dyn ObjectStore>,
        cache: Arc<ArtifactCache>,
    ) -> Self {
        Self {
            config,
            sandbox,
            store,
            cache,
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn sandbox(&self) -> &Arc<dyn Sandbox> {
        &self.sandbox
    }

    pub fn cache(&self) -> &Arc<ArtifactCache> {
        &self.cache
    }

    /// Dispatch a task to its stage and wrap the outcome for publishing
    pub async fn execute(
        &self,
        task: &Task,
        workspace: &Workspace,
    ) -> Result<ResultMessage, StageError> {
        match task {
            Task::Compile(task) => Ok(ResultMessage::Compiling {
                submission_id: task.submission_id.clone(),
                result: self.compile(task, workspace).await?,
            }),
            Task::Grade(task) => Ok(ResultMessage::Grading {
                submission_id: task.submission_id.clone(),
                testcase_index: task.testcase_index,
                result: self.grade(task, workspace).await?,
            }),
        }
    }
}
