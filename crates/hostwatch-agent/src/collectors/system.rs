// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Core metrics collected on every enabled tick.

use serde_json::{json, Value};
use sysinfo::System;

use super::{read_file, CollectResult, CollectorError};
use crate::diagnostics::Diagnostics;

const FILE_NR: &str = "/proc/sys/fs/file-nr";

/// 1, 5 and 15 minute load averages.
pub fn load_average(_: &mut Diagnostics) -> CollectResult {
    let load = System::load_average();
    Ok(json!([load.one, load.five, load.fifteen]))
}

pub fn file_handles_used(_: &mut Diagnostics) -> CollectResult {
    let (used, _) = parse_file_nr(&read_file(FILE_NR)?)?;
    Ok(Value::from(used))
}

pub fn file_handles_limit(_: &mut Diagnostics) -> CollectResult {
    let (_, limit) = parse_file_nr(&read_file(FILE_NR)?)?;
    Ok(Value::from(limit))
}

/// `file-nr` holds allocated handles, free handles and the maximum.
fn parse_file_nr(content: &str) -> Result<(u64, u64), CollectorError> {
    let fields: Vec<u64> = content
        .split_whitespace()
        .map(str::parse)
        .collect::<Result<_, _>>()
        .map_err(|e| CollectorError::parse(FILE_NR, format!("{e}")))?;
    match fields.as_slice() {
        [used, _, limit] => Ok((*used, *limit)),
        _ => Err(CollectorError::parse(
            FILE_NR,
            format!("expected 3 fields, got {}", fields.len()),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_file_nr() {
        assert_eq!(
            parse_file_nr("4128\t0\t9223372036854775807\n").ok(),
            Some((4128, 9_223_372_036_854_775_807))
        );
        assert!(parse_file_nr("1 2\n").is_err());
        assert!(parse_file_nr("a b c\n").is_err());
    }
}
