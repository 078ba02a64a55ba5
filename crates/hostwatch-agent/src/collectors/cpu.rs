// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-core CPU utilisation, cumulative times and processor identity.

use std::thread;

use serde::Serialize;
use serde_json::{json, Value};
use sysinfo::{CpuRefreshKind, RefreshKind, System, MINIMUM_CPU_UPDATE_INTERVAL};

use super::{read_file, CollectResult, CollectorError};
use crate::diagnostics::Diagnostics;

const PROC_STAT: &str = "/proc/stat";

const FIELDS: [&str; 10] = [
    "user",
    "nice",
    "system",
    "idle",
    "iowait",
    "irq",
    "softirq",
    "steal",
    "guest",
    "guest_nice",
];

/// Jiffies spent by one core in each state, in `/proc/stat` order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub(crate) struct CoreTimes([u64; 10]);

impl CoreTimes {
    /// Guest time is already accounted in user and nice.
    fn total(&self) -> u64 {
        self.0[..8].iter().sum()
    }

    fn idle(&self) -> u64 {
        self.0[3] + self.0[4]
    }
}

/// Per-core lines (`cpu0`, `cpu1`, ...), skipping the aggregate line.
pub(crate) fn parse_core_times(stat: &str) -> Result<Vec<CoreTimes>, CollectorError> {
    let mut cores = Vec::new();
    for line in stat.lines() {
        let mut parts = line.split_whitespace();
        let Some(label) = parts.next() else {
            continue;
        };
        if label == "cpu" || !label.starts_with("cpu") {
            continue;
        }
        let mut times = [0u64; 10];
        for (slot, raw) in times.iter_mut().zip(parts) {
            *slot = raw.parse().map_err(|_| {
                CollectorError::parse(PROC_STAT, format!("bad value {raw:?} for {label}"))
            })?;
        }
        cores.push(CoreTimes(times));
    }
    if cores.is_empty() {
        return Err(CollectorError::parse(PROC_STAT, "no per-core lines"));
    }
    Ok(cores)
}

#[derive(Debug, Serialize)]
struct CoreUsage {
    percentage: f64,
    #[serde(flatten)]
    states: serde_json::Map<String, Value>,
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

fn core_usage(before: &CoreTimes, after: &CoreTimes) -> CoreUsage {
    let total = after.total().saturating_sub(before.total());
    let percent_of = |delta: u64| {
        if total == 0 {
            0.0
        } else {
            round2(delta as f64 * 100.0 / total as f64)
        }
    };
    let busy = total.saturating_sub(after.idle().saturating_sub(before.idle()));
    let states = FIELDS
        .iter()
        .enumerate()
        .map(|(i, name)| {
            let delta = after.0[i].saturating_sub(before.0[i]);
            (name.to_string(), json!(percent_of(delta)))
        })
        .collect();
    CoreUsage {
        percentage: percent_of(busy),
        states,
    }
}

/// Utilisation of every core over a short sampling window, with the share of
/// time spent in each state.
pub fn cpu(_: &mut Diagnostics) -> CollectResult {
    let before = parse_core_times(&read_file(PROC_STAT)?)?;
    thread::sleep(MINIMUM_CPU_UPDATE_INTERVAL);
    let after = parse_core_times(&read_file(PROC_STAT)?)?;
    let usage: Vec<CoreUsage> = before
        .iter()
        .zip(after.iter())
        .map(|(b, a)| core_usage(b, a))
        .collect();
    serde_json::to_value(usage).map_err(|e| CollectorError::parse("cpu", e.to_string()))
}

fn clock_ticks() -> f64 {
    match nix::unistd::sysconf(nix::unistd::SysconfVar::CLK_TCK) {
        Ok(Some(ticks)) if ticks > 0 => ticks as f64,
        _ => 100.0,
    }
}

/// Cumulative per-core times, in seconds.
pub fn cpu_usage(_: &mut Diagnostics) -> CollectResult {
    let ticks = clock_ticks();
    let cores = parse_core_times(&read_file(PROC_STAT)?)?;
    let cores: Vec<Value> = cores
        .iter()
        .map(|core| {
            let times: serde_json::Map<String, Value> = FIELDS
                .iter()
                .zip(core.0.iter())
                .map(|(name, jiffies)| (name.to_string(), json!(*jiffies as f64 / ticks)))
                .collect();
            Value::Object(times)
        })
        .collect();
    Ok(Value::Array(cores))
}

pub fn cpu_model(_: &mut Diagnostics) -> CollectResult {
    let system = System::new_with_specifics(
        RefreshKind::new().with_cpu(CpuRefreshKind::new()),
    );
    let model = system
        .cpus()
        .iter()
        .map(|cpu| cpu.brand().trim())
        .find(|brand| !brand.is_empty())
        .unwrap_or("-");
    Ok(Value::from(model))
}

pub fn cpu_count(_: &mut Diagnostics) -> CollectResult {
    Ok(Value::from(num_cpus::get()))
}
