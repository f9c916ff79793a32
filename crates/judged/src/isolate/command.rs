//! Command builder for the Isolate CLI
//!
//! Builds command-line arguments for the Isolate sandbox tool.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::types::{Constraints, MountConfig};

/// Grace period before isolate kills a process over its CPU limit, in seconds
pub const EXTRA_TIME_SECS: f64 = 0.5;

/// Open file descriptor ceiling for sandboxed processes
pub const MAX_OPEN_FILES: u32 = 64;

/// Builder for Isolate command-line arguments
#[derive(Debug)]
pub struct IsolateCommand {
    /// Path to Isolate binary
    isolate_path: PathBuf,
    /// One of --init, --run, --cleanup
    action: IsolateAction,
    /// -b, --box-id
    box_id: u32,
    constraints: Option<Constraints>,
    mounts: Vec<MountConfig>,
    /// -E, --env
    env: BTreeMap<String, String>,
    /// -M, --meta
    meta_file: Option<PathBuf>,
    /// -i, --stdin
    stdin: Option<PathBuf>,
    /// -o, --stdout
    stdout: Option<PathBuf>,
    /// -r, --stderr
    stderr: Option<PathBuf>,
    working_dir: Option<String>,
    command: Vec<String>,
    cgroup: bool,
}

impl IsolateCommand {
    /// Create a new isolate command builder
    pub fn new(isolate_path: impl Into<PathBuf>, box_id: u32) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            action: IsolateAction::Run,
            box_id,
            constraints: None,
            mounts: Vec::new(),
            env: BTreeMap::new(),
            meta_file: None,
            stdin: None,
            stdout: None,
            stderr: None,
            working_dir: None,
            command: Vec::new(),
            cgroup: false,
        }
    }

    /// Set the action to perform
    pub fn action(mut self, action: IsolateAction) -> Self {
        self.action = action;
        self
    }

    /// Set resource constraints
    pub fn constraints(mut self, constraints: Constraints) -> Self {
        self.constraints = Some(constraints);
        self
    }

    /// Add multiple directory mounts
    pub fn mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    /// Set an environment variable
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the meta file path for execution results
    pub fn meta_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.meta_file = Some(path.into());
        self
    }

    /// Set stdin file path
    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = Some(path.into());
        self
    }

    /// Set stdout file path
    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = Some(path.into());
        self
    }

    /// Set stderr file path
    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = Some(path.into());
        self
    }

    /// Set the working directory inside the sandbox
    pub fn working_dir(mut self, dir: impl Into<String>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Set the command to run
    pub fn command(mut self, cmd: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.command = cmd.into_iter().map(Into::into).collect();
        self
    }

    /// Enable cgroup support for memory limiting
    pub fn cgroup(mut self, enable: bool) -> Self {
        self.cgroup = enable;
        self
    }

    /// Build the command-line arguments
    ///
    /// Consumes self to avoid cloning the command vector.
    pub fn build(self) -> Vec<String> {
        let mut args = vec![self.isolate_path.to_string_lossy().into_owned()];

        args.push(format!("--box-id={}", self.box_id));

        if self.cgroup {
            args.push("--cg".to_string());
        }

        match self.action {
            IsolateAction::Init => {
                args.push("--init".to_string());
            }
            IsolateAction::Cleanup => {
                args.push("--cleanup".to_string());
            }
            IsolateAction::Run => {
                args.push("--run".to_string());

                if let Some(constraints) = self.constraints {
                    args.push(format!("--time={}", constraints.time_secs()));
                    args.push(format!("--wall-time={}", constraints.wall_time_secs()));
                    args.push(format!("--extra-time={EXTRA_TIME_SECS}"));
                    if self.cgroup {
                        args.push(format!("--cg-mem={}", constraints.memory_kb));
                    } else {
                        args.push(format!("--mem={}", constraints.memory_kb));
                    }
                    args.push(format!("--stack={}", constraints.memory_kb));
                    args.push(format!("--fsize={}", constraints.total_storage_kb));
                    args.push(format!("--processes={}", constraints.max_processes));
                    args.push(format!("--open-files={MAX_OPEN_FILES}"));
                }

                for mount in &self.mounts {
                    // Skip optional mounts whose source doesn't exist
                    if mount.optional && !Path::new(&mount.source).exists() {
                        continue;
                    }
                    let mut opts = String::new();
                    if mount.writable {
                        opts.push_str(":rw");
                    }
                    if mount.optional {
                        opts.push_str(":maybe");
                    }
                    args.push(format!("--dir={}={}{}", mount.target, mount.source, opts));
                }

                for (key, value) in &self.env {
                    args.push(format!("--env={key}={value}"));
                }

                if let Some(ref meta) = self.meta_file {
                    args.push(format!("--meta={}", meta.display()));
                }

                if let Some(ref stdin) = self.stdin {
                    args.push(format!("--stdin={}", stdin.display()));
                }
                if let Some(ref stdout) = self.stdout {
                    args.push(format!("--stdout={}", stdout.display()));
                }
                if let Some(ref stderr) = self.stderr {
                    args.push(format!("--stderr={}", stderr.display()));
                }

                if let Some(ref dir) = self.working_dir {
                    args.push(format!("--chdir={dir}"));
                }

                args.push("--".to_string());
                args.extend(self.command);
            }
        }

        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IsolateAction {
    /// Initialize a new box
    Init,
    /// Run a command in the box
    Run,
    /// Clean up a box
    Cleanup,
}
