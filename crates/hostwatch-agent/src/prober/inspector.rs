// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use nix::unistd::{access, AccessFlags};
use tracing::debug;

use crate::subprocess;

/// Result of a probe command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutcome {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

/// Read-only view of the host used by capability checks.
#[async_trait]
pub trait Inspector: Send + Sync {
    fn is_dir(&self, path: &Path) -> bool;

    /// Whether the current user may open `path` for reading (and writing).
    fn accessible(&self, path: &Path, write: bool) -> bool;

    fn read_dir(&self, path: &Path) -> Vec<PathBuf>;

    fn on_path(&self, program: &str) -> bool;

    /// `None` when the command could not be spawned or timed out.
    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Option<CommandOutcome>;
}

/// Inspector backed by the real filesystem and process table.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInspector;

#[async_trait]
impl Inspector for SystemInspector {
    fn is_dir(&self, path: &Path) -> bool {
        path.is_dir()
    }

    fn accessible(&self, path: &Path, write: bool) -> bool {
        let mut mode = AccessFlags::R_OK;
        if write {
            mode |= AccessFlags::W_OK;
        }
        access(path, mode).is_ok()
    }

    fn read_dir(&self, path: &Path) -> Vec<PathBuf> {
        match fs::read_dir(path) {
            Ok(entries) => entries.filter_map(|e| e.ok().map(|e| e.path())).collect(),
            Err(_) => Vec::new(),
        }
    }

    fn on_path(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    async fn run(&self, program: &str, args: &[&str], timeout: Duration) -> Option<CommandOutcome> {
        match subprocess::output(program, args, timeout).await {
            Ok(output) => Some(CommandOutcome {
                success: output.status.success(),
                stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
            }),
            Err(e) => {
                debug!("Probe command failed: {e}");
                None
            }
        }
    }
}
