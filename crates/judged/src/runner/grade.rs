//! Grade stage

use tracing::{debug, instrument};

use crate::runner::{Runner, StageError};
use crate::sandbox::{RunRequest, SandboxError, Workspace};
use crate::storage::Bucket;
use crate::task::{GradeTask, GradingResult, Verdict};

const INPUT_FILE: &str = "input.txt";
const OUTPUT_FILE: &str = "output.txt";
const ANSWER_FILE: &str = "answer.txt";

impl Runner {
    /// Run a compiled submission on one testcase and classify the result
    #[instrument(
        skip(self, task, workspace),
        fields(
            submission_id = %task.submission_id,
            testcase_index = task.testcase_index,
            slot = %workspace.slot()
        )
    )]
    pub async fn grade(
        &self,
        task: &GradeTask,
        workspace: &Workspace,
    ) -> Result<GradingResult, StageError> {
        let language = self.config.get_language(&task.language)?;
        let constraints = task.constraints.unwrap_or(language.constraints);

        let artifact = language.artifact_name().as_str();
        let binary = &task.binary_ref;
        self.cache
            .fetch_to(
                Bucket::Binaries,
                &binary.object_id,
                binary.version(),
                &workspace.file_path(artifact)?,
            )
            .await?;
        workspace.set_executable(artifact).await?;

        let input = &task.testcase_ref.input;
        self.cache
            .fetch_to(
                Bucket::Testcases,
                &input.object_id,
                input.version(),
                &workspace.file_path(INPUT_FILE)?,
            )
            .await?;

        let mut request = RunRequest::new(language.execute_command(), constraints)
            .stdin(INPUT_FILE)
            .stdout(OUTPUT_FILE);
        request.env = language.sandbox_env();

        let run = self.sandbox.run(workspace.slot(), request).await?;
        if let Some(verdict) = Verdict::from_unsuccessful(run.status) {
            debug!(?verdict, "run did not succeed, skipping comparison");
            return Ok(GradingResult::new(verdict, &run));
        }

        // Fetched only after the run so the solution cannot read it
        let answer = &task.testcase_ref.output;
        self.cache
            .fetch_to(
                Bucket::Testcases,
                &answer.object_id,
                answer.version(),
                &workspace.file_path(ANSWER_FILE)?,
            )
            .await?;

        let produced = read_output(workspace).await?;
        let expected = workspace.read_file(ANSWER_FILE).await?;
        let verdict = if self.config.comparison.matches(&produced, &expected) {
            Verdict::Accepted
        } else {
            Verdict::WrongAnswer
        };

        debug!(?verdict, time_ms = run.time_ms, memory_kb = run.memory_kb, "graded");
        Ok(GradingResult::new(verdict, &run))
    }
}

/// A program that never opened stdout produced empty output
async fn read_output(workspace: &Workspace) -> Result<Vec<u8>, SandboxError> {
    match workspace.read_file(OUTPUT_FILE).await {
        Ok(bytes) => Ok(bytes),
        Err(SandboxError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}
