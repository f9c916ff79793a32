//! [`Sandbox`] implementation over IOI Isolate
//!
//! Slot `n` maps to isolate box `n`. Meta files are written to a host directory
//! outside the box so the sandboxed program cannot tamper with them.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, instrument, warn};

use crate::config::Config;
use crate::isolate::command::{IsolateAction, IsolateCommand};
use crate::isolate::meta::MetaFile;
use crate::isolate::{resolve_command, validate_mounts};
use crate::sandbox::{RunRequest, Sandbox, SandboxError};
use crate::types::{MountConfig, SandboxResult, SlotId};

/// Directory inside the sandbox where the box is mounted
const BOX_MOUNT: &str = "/box";

#[derive(Debug, Clone)]
pub struct IsolateSandbox {
    isolate_path: PathBuf,
    cgroup: bool,
    mounts: Vec<MountConfig>,
    meta_dir: PathBuf,
}

impl IsolateSandbox {
    pub fn new(isolate_path: impl Into<PathBuf>, cgroup: bool) -> Self {
        Self {
            isolate_path: isolate_path.into(),
            cgroup,
            mounts: Vec::new(),
            meta_dir: std::env::temp_dir().join("judged-meta"),
        }
    }

    /// Build a sandbox from configuration, checking mount sources up front
    pub fn from_config(config: &Config) -> Result<Self, SandboxError> {
        validate_mounts(&config.sandbox_mounts)?;
        Ok(Self::new(config.isolate_binary(), config.cgroup)
            .with_mounts(config.sandbox_mounts.iter().cloned())
            .with_meta_dir(config.meta_dir.clone()))
    }

    /// Mounts applied to every run
    pub fn with_mounts(mut self, mounts: impl IntoIterator<Item = MountConfig>) -> Self {
        self.mounts.extend(mounts);
        self
    }

    pub fn with_meta_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.meta_dir = dir.into();
        self
    }

    fn meta_path(&self, slot: SlotId) -> PathBuf {
        self.meta_dir.join(format!("slot-{slot}.meta"))
    }

    fn command(&self, slot: SlotId, action: IsolateAction) -> IsolateCommand {
        IsolateCommand::new(&self.isolate_path, slot.0)
            .action(action)
            .cgroup(self.cgroup)
    }

    async fn invoke(&self, command: IsolateCommand) -> Result<std::process::Output, SandboxError> {
        let args = command.build();
        debug!(?args, "invoking isolate");

        let program = args
            .first()
            .ok_or_else(|| SandboxError::CommandFailed("empty command arguments".to_string()))?;
        Command::new(program)
            .args(&args[1..])
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| {
                if e.kind() == std::io::ErrorKind::NotFound {
                    SandboxError::BinaryNotFound(self.isolate_path.clone())
                } else {
                    SandboxError::SpawnFailed(e)
                }
            })
    }
}

fn in_box(name: &str) -> PathBuf {
    Path::new(BOX_MOUNT).join(name)
}

#[async_trait]
impl Sandbox for IsolateSandbox {
    #[instrument(skip(self))]
    async fn initialize(&self, slot: SlotId) -> Result<PathBuf, SandboxError> {
        // A box left behind by a crashed task would make --init reuse it dirty
        if let Err(e) = self.teardown(slot).await {
            warn!(%slot, error = %e, "pre-init cleanup failed");
        }

        let output = self.invoke(self.command(slot, IsolateAction::Init)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::InitFailed {
                slot,
                message: stderr.trim().to_string(),
            });
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let box_path = PathBuf::from(stdout.trim()).join("box");
        if !box_path.exists() {
            return Err(SandboxError::InitFailed {
                slot,
                message: format!("box path does not exist: {}", box_path.display()),
            });
        }

        debug!(?box_path, "slot initialized");
        Ok(box_path)
    }

    #[instrument(skip(self, request), fields(command = ?request.command))]
    async fn run(&self, slot: SlotId, request: RunRequest) -> Result<SandboxResult, SandboxError> {
        let RunRequest {
            mut command,
            constraints,
            stdin,
            stdout,
            stderr,
            env,
        } = request;

        // isolate uses execve, which does not search PATH
        resolve_command(&mut command)?;

        tokio::fs::create_dir_all(&self.meta_dir).await?;
        let meta_path = self.meta_path(slot);
        match tokio::fs::remove_file(&meta_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        let mut isolate = self
            .command(slot, IsolateAction::Run)
            .constraints(constraints)
            .mounts(self.mounts.iter().cloned())
            .meta_file(&meta_path)
            .working_dir(BOX_MOUNT)
            .command(command);
        for (key, value) in env {
            isolate = isolate.env(key, value);
        }
        if let Some(path) = stdin {
            isolate = isolate.stdin(in_box(&path));
        }
        if let Some(path) = stdout {
            isolate = isolate.stdout(in_box(&path));
        }
        if let Some(path) = stderr {
            isolate = isolate.stderr(in_box(&path));
        }

        let output = self.invoke(isolate).await?;

        if !meta_path.exists() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(SandboxError::RunFailed {
                slot,
                message: stderr.trim().to_string(),
            });
        }
        let meta = MetaFile::load(&meta_path).await?;
        let result = meta.to_sandbox_result(constraints.memory_kb);

        debug!(
            status = ?result.status,
            time_ms = result.time_ms,
            memory_kb = result.memory_kb,
            exit_code = ?result.exit_code,
            "run complete"
        );
        Ok(result)
    }

    #[instrument(skip(self))]
    async fn teardown(&self, slot: SlotId) -> Result<(), SandboxError> {
        let output = self.invoke(self.command(slot, IsolateAction::Cleanup)).await?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            warn!(%slot, stderr = %stderr, "cleanup failed");
            return Err(SandboxError::TeardownFailed {
                slot,
                message: stderr.trim().to_string(),
            });
        }
        debug!("slot torn down");
        Ok(())
    }
}
