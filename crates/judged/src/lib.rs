//! Judge daemon core.
//!
//! Consumes compile and grade tasks from a broker, runs untrusted code in
//! IOI Isolate sandboxes over a fixed pool of execution slots, and publishes a
//! structured verdict for every task.
//!
//! # Components
//!
//! - **Sandbox** ([`sandbox`], [`isolate`]): per-slot lifecycle and result classification.
//! - **Artifact cache** ([`cache`]): size-bounded LRU of binaries and testcases.
//! - **Stages** ([`runner`]): compile a submission, or grade it on one testcase.
//! - **Task loop** ([`daemon`]): slot pool, broker flow control, settlement.
//! - **Adapters** ([`storage`], [`broker`]): object store and message broker seams.

pub use broker::{Broker, BrokerError, Delivery, MemoryBroker, SpoolBroker};
pub use cache::{ArtifactCache, CacheError};
pub use config::{Config, ConfigError, EXAMPLE_CONFIG, Language};
pub use daemon::{Daemon, DaemonError, SlotLease, SlotPool, SlotState};
pub use isolate::{IsolateSandbox, prepare_cgroup};
pub use runner::{ComparisonPolicy, Runner, StageError};
pub use sandbox::{RunRequest, Sandbox, SandboxError, Workspace};
pub use storage::{Bucket, FsObjectStore, ObjectStat, ObjectStore, StorageError};
pub use task::{
    CompileOutcome, CompileTask, GradeTask, GradingResult, ObjectRef, ResultMessage, Task,
    TestcaseRef, Verdict,
};
pub use types::{Constraints, MountConfig, SandboxResult, SandboxStatus, SlotId};

pub mod broker;
pub mod cache;
pub mod config;
pub mod daemon;
pub mod isolate;
pub mod runner;
pub mod sandbox;
pub mod storage;
pub mod task;
pub mod types;
