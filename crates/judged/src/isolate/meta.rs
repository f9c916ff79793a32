//! Meta file parsing for isolate
//!
//! Parses the meta file produced by isolate after execution to extract time
//! used, memory used, and exit status, and classifies the run.

use std::collections::HashMap;
use std::path::Path;

use crate::sandbox::SandboxError;
use crate::types::{SandboxResult, SandboxStatus};

/// Isolate's two-letter status codes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateStatus {
    Ok,
    RuntimeError,
    TimedOut,
    Signaled,
    InternalError,
}

impl IsolateStatus {
    pub fn from_code(code: &str) -> Self {
        match code {
            "OK" => IsolateStatus::Ok,
            "RE" => IsolateStatus::RuntimeError,
            "TO" => IsolateStatus::TimedOut,
            "SG" => IsolateStatus::Signaled,
            _ => IsolateStatus::InternalError,
        }
    }
}

/// Parsed meta file from Isolate
#[derive(Debug, Clone, Default)]
pub struct MetaFile {
    /// Raw key-value pairs from the meta file
    pub entries: HashMap<String, String>,
}

impl MetaFile {
    /// Parse meta file content, skipping lines without a `key:` prefix
    pub fn parse(content: &str) -> Self {
        let mut entries = HashMap::new();

        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            // The value is everything after the first colon
            if let Some((key, value)) = line.split_once(':') {
                let key = key.trim();
                if !key.is_empty() {
                    entries.insert(key.to_string(), value.trim().to_string());
                }
            }
        }

        Self { entries }
    }

    /// Load and parse a meta file from disk
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, SandboxError> {
        let content = tokio::fs::read_to_string(path.as_ref()).await?;
        Ok(Self::parse(&content))
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(String::as_str)
    }

    pub fn get_f64(&self, key: &str) -> Option<f64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_i32(&self, key: &str) -> Option<i32> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        self.get(key).and_then(|v| v.parse().ok())
    }

    /// Isolate omits `status` on a clean exit
    pub fn status(&self) -> IsolateStatus {
        self.get("status")
            .map(IsolateStatus::from_code)
            .unwrap_or(IsolateStatus::Ok)
    }

    /// CPU time used in seconds
    pub fn time(&self) -> f64 {
        self.get_f64("time").unwrap_or(0.0)
    }

    /// Wall clock time used in seconds
    pub fn wall_time(&self) -> f64 {
        self.get_f64("time-wall").unwrap_or(0.0)
    }

    /// Peak memory usage in kilobytes
    pub fn memory(&self) -> u64 {
        self.get_u64("cg-mem")
            .or_else(|| self.get_u64("max-rss"))
            .unwrap_or(0)
    }

    pub fn exit_code(&self) -> Option<i32> {
        self.get_i32("exitcode")
    }

    pub fn signal(&self) -> Option<i32> {
        self.get_i32("exitsig")
    }

    pub fn message(&self) -> Option<String> {
        self.get("message").map(String::from)
    }

    /// Whether the cgroup OOM killer fired during the run
    pub fn oom_killed(&self) -> bool {
        self.get("cg-oom-killed").is_some()
    }

    fn memory_exceeded(&self, memory_limit_kb: u64) -> bool {
        let message_says_memory = self
            .get("message")
            .map(|msg| msg.to_lowercase().contains("memory"))
            .unwrap_or(false);
        self.oom_killed() || message_says_memory || self.memory() >= memory_limit_kb
    }

    /// Classify the run against the memory limit it was given
    pub fn classify(&self, memory_limit_kb: u64) -> SandboxStatus {
        match self.status() {
            IsolateStatus::Ok => SandboxStatus::Succeeded,
            IsolateStatus::TimedOut => SandboxStatus::TimeLimitExceeded,
            IsolateStatus::RuntimeError | IsolateStatus::Signaled => {
                if self.memory_exceeded(memory_limit_kb) {
                    SandboxStatus::MemoryLimitExceeded
                } else {
                    SandboxStatus::RuntimeError
                }
            }
            IsolateStatus::InternalError => SandboxStatus::InternalError,
        }
    }

    /// Convert to a [`SandboxResult`]
    pub fn to_sandbox_result(&self, memory_limit_kb: u64) -> SandboxResult {
        SandboxResult {
            status: self.classify(memory_limit_kb),
            time_ms: secs_to_ms(self.time()),
            wall_time_ms: secs_to_ms(self.wall_time()),
            memory_kb: self.memory(),
            exit_code: self.exit_code(),
            signal: self.signal(),
            message: self.message(),
        }
    }
}

fn secs_to_ms(secs: f64) -> u64 {
    (secs * 1000.0).round().max(0.0) as u64
}
