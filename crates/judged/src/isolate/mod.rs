//! IOI Isolate wrapper
//!
//! This module provides the production [`Sandbox`](crate::sandbox::Sandbox),
//! handling command building, box lifecycle management, and result parsing.
//!
//! References for Isolate's CLI arguments and meta-files:
//! - https://www.ucw.cz/isolate/isolate.1.html
//! - https://github.com/ioi/isolate

use std::fs;
use std::path::Path;

pub use crate::isolate::command::{IsolateAction, IsolateCommand};
pub use crate::isolate::meta::{IsolateStatus, MetaFile};
pub use crate::isolate::sandbox::IsolateSandbox;
use crate::sandbox::SandboxError;
use crate::types::MountConfig;

mod command;
mod meta;
mod sandbox;

/// Attempt to set up the cgroup v2 hierarchy for isolate.
///
/// In container environments, `isolate-cg-keeper` (the systemd service that
/// normally manages isolate's cgroup) is not available. This function replicates
/// its job: creating the cgroup directory at `cg_root` and enabling the memory
/// and pids controllers so that per-box child cgroups work.
///
/// Returns `Ok(true)` if cgroups are ready, `Ok(false)` if setup failed and the
/// caller should fall back to non-cgroup mode (RLIMIT_AS).
pub fn prepare_cgroup(cg_root: &Path) -> Result<bool, SandboxError> {
    let cg_base = Path::new("/sys/fs/cgroup");

    let controllers_path = cg_base.join("cgroup.controllers");
    if !controllers_path.exists() {
        return Ok(false);
    }

    let controllers = fs::read_to_string(&controllers_path)?;
    if !controllers.split_whitespace().any(|c| c == "memory") {
        return Ok(false);
    }

    if cg_root.exists() {
        let subtree = cg_root.join("cgroup.subtree_control");
        if let Ok(content) = fs::read_to_string(&subtree)
            && content.split_whitespace().any(|c| c == "memory")
        {
            return Ok(true);
        }
    }

    // cgroup v2's "no internal process" rule prevents enabling controllers
    // in a cgroup that has processes directly in it.
    let init_cg = cg_base.join("init");
    if !init_cg.exists() {
        fs::create_dir(&init_cg)?;
    }
    fs::write(init_cg.join("cgroup.procs"), std::process::id().to_string())?;

    fs::write(cg_base.join("cgroup.subtree_control"), "+memory +pids")?;

    if !cg_root.exists() {
        fs::create_dir(cg_root)?;
    }

    fs::write(cg_root.join("cgroup.subtree_control"), "+memory +pids")?;

    Ok(true)
}

/// Validate that all mount source paths exist
///
/// Optional mounts are skipped if the source doesn't exist.
pub fn validate_mounts(mounts: &[MountConfig]) -> Result<(), SandboxError> {
    for mount in mounts {
        if mount.optional {
            continue;
        }
        if !Path::new(&mount.source).exists() {
            return Err(SandboxError::MountSourceNotFound(mount.source.clone()));
        }
    }
    Ok(())
}

/// Resolve the program in a command to an absolute path using the host's PATH.
///
/// Commands that already contain a `/` (like `./main` or `/usr/bin/gcc`) are
/// left unchanged.
pub fn resolve_command(command: &mut [String]) -> Result<(), SandboxError> {
    let first = match command.first_mut() {
        Some(first) => first,
        None => return Ok(()),
    };

    if first.contains('/') {
        return Ok(());
    }

    let path_var = std::env::var("PATH").unwrap_or_default();
    for dir in path_var.split(':') {
        let candidate = Path::new(dir).join(&*first);
        if candidate.exists() {
            // Symlinks may point outside the bind mounts visible in the sandbox
            *first = fs::canonicalize(&candidate)
                .unwrap_or(candidate)
                .to_string_lossy()
                .into_owned();
            return Ok(());
        }
    }

    Err(SandboxError::CommandFailed(format!(
        "command '{first}' not found in PATH",
    )))
}
