//! Broker wire types
//!
//! Tasks arrive as JSON tagged by `"type"`; results go back the same way.

use serde::{Deserialize, Serialize};

use crate::types::{Constraints, SandboxResult, SandboxStatus};

/// Maximum size of a compile log carried in a result message
pub const MAX_COMPILE_LOG_BYTES: usize = 64 * 1024;

/// A unit of work delivered by the broker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum Task {
    Compile(CompileTask),
    Grade(GradeTask),
}

impl Task {
    /// Decode a broker payload
    pub fn from_slice(payload: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(payload)
    }

    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn submission_id(&self) -> &str {
        match self {
            Task::Compile(task) => &task.submission_id,
            Task::Grade(task) => &task.submission_id,
        }
    }

    pub fn testcase_index(&self) -> Option<u32> {
        match self {
            Task::Compile(_) => None,
            Task::Grade(task) => Some(task.testcase_index),
        }
    }

    pub fn language(&self) -> &str {
        match self {
            Task::Compile(task) => &task.language,
            Task::Grade(task) => &task.language,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Task::Compile(_) => "compile",
            Task::Grade(_) => "grade",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompileTask {
    pub submission_id: String,
    pub language: String,
    pub source_code: String,
    /// Overrides the language's configured limits
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradeTask {
    pub submission_id: String,
    pub testcase_index: u32,
    pub language: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub constraints: Option<Constraints>,
    pub binary_ref: ObjectRef,
    pub testcase_ref: TestcaseRef,
}

/// An object in storage, optionally pinned to a version
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRef {
    pub object_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version_id: Option<String>,
}

impl ObjectRef {
    pub fn new(object_id: impl Into<String>) -> Self {
        Self {
            object_id: object_id.into(),
            version_id: None,
        }
    }

    pub fn with_version(mut self, version_id: impl Into<String>) -> Self {
        self.version_id = Some(version_id.into());
        self
    }

    pub fn version(&self) -> Option<&str> {
        self.version_id.as_deref()
    }
}

/// Input and expected answer of one testcase
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestcaseRef {
    pub input: ObjectRef,
    pub output: ObjectRef,
}

/// Outcome of a compile task. A failed compile is a result, not an error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status")]
pub enum CompileOutcome {
    CompileSucceeded,
    CompileFailed { log: String },
}

impl CompileOutcome {
    /// Failed outcome with the log cut to [`MAX_COMPILE_LOG_BYTES`]
    pub fn failed(log: impl Into<String>) -> Self {
        let mut log = log.into();
        if log.len() > MAX_COMPILE_LOG_BYTES {
            let mut end = MAX_COMPILE_LOG_BYTES;
            while !log.is_char_boundary(end) {
                end -= 1;
            }
            log.truncate(end);
        }
        CompileOutcome::CompileFailed { log }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CompileOutcome::CompileSucceeded)
    }
}

/// Final classification of one testcase run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Verdict {
    Accepted,
    WrongAnswer,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    RuntimeError,
    InternalError,
}

impl Verdict {
    /// Verdict for a run that did not succeed; `None` when output must be compared
    pub fn from_unsuccessful(status: SandboxStatus) -> Option<Self> {
        match status {
            SandboxStatus::Succeeded => None,
            SandboxStatus::TimeLimitExceeded => Some(Verdict::TimeLimitExceeded),
            SandboxStatus::MemoryLimitExceeded => Some(Verdict::MemoryLimitExceeded),
            SandboxStatus::RuntimeError => Some(Verdict::RuntimeError),
            SandboxStatus::InternalError => Some(Verdict::InternalError),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GradingResult {
    pub verdict: Verdict,
    pub time_ms: u64,
    pub wall_time_ms: u64,
    #[serde(rename = "memoryKB")]
    pub memory_kb: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signal: Option<i32>,
}

impl GradingResult {
    /// Attach the metrics of `run` to `verdict`
    pub fn new(verdict: Verdict, run: &SandboxResult) -> Self {
        Self {
            verdict,
            time_ms: run.time_ms,
            wall_time_ms: run.wall_time_ms,
            memory_kb: run.memory_kb,
            exit_code: run.exit_code,
            signal: run.signal,
        }
    }
}

/// Message published to the broker once a task completes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ResultMessage {
    Compiling {
        submission_id: String,
        result: CompileOutcome,
    },
    Grading {
        submission_id: String,
        testcase_index: u32,
        result: GradingResult,
    },
}

impl ResultMessage {
    pub fn to_vec(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn submission_id(&self) -> &str {
        match self {
            ResultMessage::Compiling { submission_id, .. }
            | ResultMessage::Grading { submission_id, .. } => submission_id,
        }
    }
}
