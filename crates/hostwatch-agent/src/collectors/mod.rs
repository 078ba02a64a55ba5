// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Bundled metric collectors.
//!
//! Every collector is a plain function returning a JSON value. Collectors run
//! on a blocking thread, one after the other, and must not keep state
//! between ticks.

pub mod cpu;
pub mod memory;
pub mod network;
pub mod ping;
pub mod ports;
pub mod processes;
pub mod sensors;
pub mod services;
pub mod storage;
pub mod system;

use std::fs;
use std::io;
use std::path::Path;

use serde_json::Value;

/// Failure of a single collector call.
#[derive(Debug, thiserror::Error)]
pub enum CollectorError {
    #[error("failed to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("unexpected format in {source_name}: {detail}")]
    Parse {
        source_name: String,
        detail: String,
    },

    #[error("command {command} failed: {detail}")]
    Command { command: String, detail: String },

    #[error("{0}")]
    Unavailable(String),

    #[error("{0}")]
    Protocol(String),
}

impl CollectorError {
    pub fn parse(source_name: impl Into<String>, detail: impl Into<String>) -> Self {
        CollectorError::Parse {
            source_name: source_name.into(),
            detail: detail.into(),
        }
    }
}

pub type CollectResult = Result<Value, CollectorError>;

/// Reads a whole procfs or sysfs file.
pub(crate) fn read_file(path: impl AsRef<Path>) -> Result<String, CollectorError> {
    let path = path.as_ref();
    fs::read_to_string(path).map_err(|source| CollectorError::Read {
        path: path.display().to_string(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_error_names_the_path() {
        let err = read_file("/definitely/not/here").expect_err("missing file");
        assert!(err.to_string().starts_with("failed to read /definitely/not/here"));
    }
}
