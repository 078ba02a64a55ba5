// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Temperature and fan sensors.

use std::fs;
use std::path::Path;

use serde_json::{json, Map, Value};
use sysinfo::Components;

use super::{CollectResult, CollectorError};
use crate::diagnostics::Diagnostics;

pub(crate) const HWMON_ROOT: &str = "/sys/class/hwmon";

pub fn temperatures(_: &mut Diagnostics) -> CollectResult {
    let components = Components::new_with_refreshed_list();
    let mut sensors = Map::new();
    for component in components.iter() {
        let temperature = component.temperature();
        if temperature.is_nan() {
            continue;
        }
        sensors.insert(
            component.label().to_string(),
            json!({
                "current": temperature,
                "high": Some(component.max()).filter(|max| !max.is_nan()),
                "critical": component.critical(),
            }),
        );
    }
    Ok(Value::Object(sensors))
}

fn read_trimmed(path: &Path) -> Option<String> {
    fs::read_to_string(path).ok().map(|s| s.trim().to_string())
}

/// Fan speeds (RPM) grouped by hwmon chip name.
pub(crate) fn read_fans(root: &Path) -> Result<Map<String, Value>, CollectorError> {
    let entries = fs::read_dir(root).map_err(|source| CollectorError::Read {
        path: root.display().to_string(),
        source,
    })?;
    let mut chips = Map::new();
    for chip in entries.flatten() {
        let chip_path = chip.path();
        let chip_name = read_trimmed(&chip_path.join("name"))
            .unwrap_or_else(|| chip.file_name().to_string_lossy().into_owned());
        let Ok(files) = fs::read_dir(&chip_path) else {
            continue;
        };
        let mut inputs: Vec<String> = files
            .flatten()
            .map(|f| f.file_name().to_string_lossy().into_owned())
            .filter(|name| name.starts_with("fan") && name.ends_with("_input"))
            .collect();
        inputs.sort();

        let mut fans = Vec::new();
        for input in inputs {
            let Some(rpm) =
                read_trimmed(&chip_path.join(&input)).and_then(|v| v.parse::<u64>().ok())
            else {
                continue;
            };
            let prefix = input.trim_end_matches("_input");
            let label = read_trimmed(&chip_path.join(format!("{prefix}_label")))
                .unwrap_or_default();
            fans.push(json!({ "label": label, "current": rpm }));
        }
        if fans.is_empty() {
            continue;
        }
        if let Some(list) = chips
            .entry(chip_name)
            .or_insert_with(|| Value::Array(Vec::new()))
            .as_array_mut()
        {
            list.extend(fans);
        }
    }
    Ok(chips)
}

pub fn fans(_: &mut Diagnostics) -> CollectResult {
    read_fans(Path::new(HWMON_ROOT)).map(Value::Object)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_fans_from_hwmon_tree() {
        let root = tempfile::tempdir().expect("tempdir");
        let chip = root.path().join("hwmon0");
        fs::create_dir(&chip).expect("chip dir");
        fs::write(chip.join("name"), "nct6775\n").expect("name");
        fs::write(chip.join("fan1_input"), "1200\n").expect("fan1");
        fs::write(chip.join("fan1_label"), "CPU Fan\n").expect("label");
        fs::write(chip.join("fan2_input"), "garbage\n").expect("fan2");
        fs::write(chip.join("temp1_input"), "42000\n").expect("temp");

        let chips = read_fans(root.path()).expect("readable");
        assert_eq!(
            chips["nct6775"],
            json!([{ "label": "CPU Fan", "current": 1200 }])
        );
    }

    #[test]
    fn missing_hwmon_root_is_an_error() {
        assert!(read_fans(Path::new("/nonexistent/hwmon")).is_err());
    }
}
