//! Compile stage

use tracing::{debug, instrument, warn};

use crate::runner::{Runner, StageError};
use crate::sandbox::{RunRequest, Workspace};
use crate::storage::Bucket;
use crate::task::{CompileOutcome, CompileTask};
use crate::types::SandboxResult;

/// Compiler stdout, inside the slot
const COMPILE_STDOUT: &str = "compile.stdout";
/// Compiler stderr, inside the slot
const COMPILE_LOG: &str = "compile.log";

impl Runner {
    /// Compile a submission and publish its artifact on success
    #[instrument(
        skip(self, task, workspace),
        fields(submission_id = %task.submission_id, slot = %workspace.slot())
    )]
    pub async fn compile(
        &self,
        task: &CompileTask,
        workspace: &Workspace,
    ) -> Result<CompileOutcome, StageError> {
        let language = self.config.get_language(&task.language)?;

        let source_name = language.source_name.as_str();
        workspace
            .write_file(source_name, task.source_code.as_bytes())
            .await?;
        debug!(source_name, "wrote source file");

        let Some(command) = language.compile_command() else {
            debug!("interpreted language, publishing source as artifact");
            self.publish_artifact(&task.submission_id, workspace, source_name)
                .await?;
            return Ok(CompileOutcome::CompileSucceeded);
        };

        let constraints =
            language.compile_limits(task.constraints.unwrap_or(language.constraints));
        let mut request = RunRequest::new(command, constraints)
            .stdout(COMPILE_STDOUT)
            .stderr(COMPILE_LOG);
        request.env = language.sandbox_env();

        let result = self.sandbox.run(workspace.slot(), request).await?;
        debug!(
            status = ?result.status,
            time_ms = result.time_ms,
            exit_code = ?result.exit_code,
            "compilation complete"
        );

        if !result.is_success() {
            return Ok(CompileOutcome::failed(read_log(workspace, &result).await));
        }

        let binary_name = language.binary_name.as_str();
        if !workspace.file_exists(binary_name).await? {
            warn!(binary_name, "compiler succeeded without producing a binary");
            return Ok(CompileOutcome::failed(format!(
                "compiler exited successfully but produced no {binary_name}"
            )));
        }

        self.publish_artifact(&task.submission_id, workspace, binary_name)
            .await?;
        Ok(CompileOutcome::CompileSucceeded)
    }

    async fn publish_artifact(
        &self,
        submission_id: &str,
        workspace: &Workspace,
        name: &str,
    ) -> Result<(), StageError> {
        let path = workspace.file_path(name)?;
        let stat = self.store.put(Bucket::Binaries, submission_id, &path).await?;
        // A recompiled submission must not be graded against a stale copy
        self.cache
            .invalidate(Bucket::Binaries, submission_id, None)
            .await?;
        debug!(size_bytes = stat.size_bytes, "published artifact");
        Ok(())
    }
}

/// Compiler output, best effort; falls back to the sandbox's own message
async fn read_log(workspace: &Workspace, result: &SandboxResult) -> String {
    let mut log = String::new();
    for name in [COMPILE_STDOUT, COMPILE_LOG] {
        match workspace.read_file(name).await {
            Ok(bytes) => log.push_str(&String::from_utf8_lossy(&bytes)),
            Err(e) => debug!(file = name, error = %e, "compiler output unreadable"),
        }
    }

    if log.trim().is_empty()
        && let Some(ref message) = result.message
    {
        log = message.clone();
    }
    log
}
