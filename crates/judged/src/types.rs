use std::fmt;

use serde::{Deserialize, Serialize};

/// Identifier of an execution slot (`1..=slot_count`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SlotId(pub u32);

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Resource ceilings attached to every sandbox invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Constraints {
    /// CPU time limit in milliseconds
    #[serde(alias = "time_ms")]
    pub time_ms: u64,

    /// Memory limit in kilobytes
    #[serde(rename = "memoryKB", alias = "memory_kb")]
    pub memory_kb: u64,

    /// Largest file the process may write, in kilobytes
    #[serde(rename = "totalStorageKB", alias = "total_storage_kb")]
    pub total_storage_kb: u64,

    /// Maximum number of processes/threads
    #[serde(alias = "max_processes")]
    pub max_processes: u32,
}

impl Constraints {
    /// 1 megabyte in kilobytes
    pub const MB: u64 = 1024;

    /// Set the CPU time limit in milliseconds
    pub fn with_time_ms(mut self, ms: u64) -> Self {
        self.time_ms = ms;
        self
    }

    /// Set the memory limit in kilobytes
    pub fn with_memory_kb(mut self, kb: u64) -> Self {
        self.memory_kb = kb;
        self
    }

    /// Set the storage limit in kilobytes
    pub fn with_total_storage_kb(mut self, kb: u64) -> Self {
        self.total_storage_kb = kb;
        self
    }

    /// Set the maximum number of processes
    pub fn with_max_processes(mut self, count: u32) -> Self {
        self.max_processes = count;
        self
    }

    /// CPU time limit in seconds, as isolate expects it
    pub fn time_secs(&self) -> f64 {
        self.time_ms as f64 / 1000.0
    }

    /// Wall clock limit in seconds: twice the CPU limit plus one second, so a
    /// sleeping or blocked process is still killed.
    pub fn wall_time_secs(&self) -> f64 {
        self.time_secs() * 2.0 + 1.0
    }
}

impl Default for Constraints {
    fn default() -> Self {
        Self {
            time_ms: 2000,
            memory_kb: 256 * Self::MB,
            total_storage_kb: 64 * Self::MB,
            max_processes: 1,
        }
    }
}

/// Classification of one sandbox invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SandboxStatus {
    /// Process exited with code 0
    Succeeded,
    TimeLimitExceeded,
    MemoryLimitExceeded,
    /// Non-zero exit or fatal signal
    RuntimeError,
    /// The sandbox reported an error of its own
    InternalError,
}

impl SandboxStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, SandboxStatus::Succeeded)
    }
}

/// Result of a sandbox invocation
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxResult {
    pub status: SandboxStatus,

    /// CPU time used in milliseconds
    pub time_ms: u64,

    /// Wall clock time used in milliseconds
    pub wall_time_ms: u64,

    /// Peak memory usage in kilobytes (cg-mem preferred, fallback to max-rss)
    pub memory_kb: u64,

    /// Exit code if the program exited normally
    pub exit_code: Option<i32>,

    /// Signal number if the program was killed by a signal
    pub signal: Option<i32>,

    /// Additional message from the sandbox
    pub message: Option<String>,
}

impl SandboxResult {
    /// A result with the given status and zeroed metrics
    pub fn with_status(status: SandboxStatus) -> Self {
        Self {
            status,
            time_ms: 0,
            wall_time_ms: 0,
            memory_kb: 0,
            exit_code: None,
            signal: None,
            message: None,
        }
    }

    #[must_use]
    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }
}

/// Configuration for a directory mount in Isolate
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountConfig {
    /// Source path on the host
    pub source: String,

    /// Target path in the sandbox
    pub target: String,

    /// Whether the mount is read-write (default: read-only)
    #[serde(default)]
    pub writable: bool,

    /// Whether this mount is optional (don't fail if source doesn't exist)
    /// Maps to isolate's `:maybe` flag
    #[serde(default)]
    pub optional: bool,
}
