// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! External commands run by probes and collectors.
//!
//! Loader variables are removed from the child environment so a packaged
//! agent cannot leak its bundled libraries into system tools.

use std::process::{Output, Stdio};
use std::time::Duration;

use tokio::process::Command;

/// Variables stripped from every child environment.
pub const SANITIZED_VARS: [&str; 5] = [
    "LD_LIBRARY_PATH",
    "LD_PRELOAD",
    "LIBPATH",
    "DYLD_LIBRARY_PATH",
    "DYLD_FALLBACK_LIBRARY_PATH",
];

#[derive(Debug, thiserror::Error)]
pub enum CommandError {
    #[error("failed to spawn {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },
}

/// A command with a sanitized environment and no stdin.
pub fn command(program: &str) -> Command {
    let mut command = Command::new(program);
    for var in SANITIZED_VARS {
        command.env_remove(var);
    }
    command
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    command
}

/// Runs `program` to completion, killing it once `timeout` elapses.
pub async fn output(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> Result<Output, CommandError> {
    let child = command(program).args(args).output();
    match tokio::time::timeout(timeout, child).await {
        Ok(result) => result.map_err(|source| CommandError::Spawn {
            program: program.to_string(),
            source,
        }),
        Err(_) => Err(CommandError::Timeout {
            program: program.to_string(),
            timeout,
        }),
    }
}
