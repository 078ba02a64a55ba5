// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Block device counters and mounted filesystems.

use std::path::Path;

use nix::sys::statvfs::statvfs;
use serde_json::{json, Map, Value};
use sysinfo::Disks;

use super::{read_file, CollectResult, CollectorError};
use crate::diagnostics::Diagnostics;

const DISKSTATS: &str = "/proc/diskstats";
const SECTOR_SIZE: u64 = 512;

const IGNORED_DEVICES: [&str; 2] = ["/loop", "/snap"];
const IGNORED_FILESYSTEMS: [&str; 2] = ["squashfs", "cagefs-skeleton"];

/// Per-device counters from `/proc/diskstats`.
pub(crate) fn parse_diskstats(content: &str) -> Result<Map<String, Value>, CollectorError> {
    let mut devices = Map::new();
    for line in content.lines() {
        let parts: Vec<&str> = line.split_whitespace().collect();
        if parts.len() < 14 {
            continue;
        }
        let field = |i: usize| -> Result<u64, CollectorError> {
            parts[i]
                .parse()
                .map_err(|_| CollectorError::parse(DISKSTATS, format!("bad value {:?}", parts[i])))
        };
        devices.insert(
            parts[2].to_string(),
            json!({
                "read_count": field(3)?,
                "read_merged_count": field(4)?,
                "read_bytes": field(5)? * SECTOR_SIZE,
                "read_time": field(6)?,
                "write_count": field(7)?,
                "write_merged_count": field(8)?,
                "write_bytes": field(9)? * SECTOR_SIZE,
                "write_time": field(10)?,
                "busy_time": field(12)?,
            }),
        );
    }
    Ok(devices)
}

pub fn io(_: &mut Diagnostics) -> CollectResult {
    let devices = parse_diskstats(&read_file(DISKSTATS)?)?;
    Ok(Value::Array(
        devices
            .into_iter()
            .map(|(name, counters)| json!({ name: counters }))
            .collect(),
    ))
}

fn is_ignored(device: &str, fstype: &str) -> bool {
    IGNORED_DEVICES.iter().any(|d| device.contains(d)) || IGNORED_FILESYSTEMS.contains(&fstype)
}

struct Mount {
    device: String,
    mountpoint: String,
    fstype: String,
    removable: bool,
}

fn mounts() -> Vec<Mount> {
    Disks::new_with_refreshed_list()
        .iter()
        .map(|disk| Mount {
            device: disk.name().to_string_lossy().into_owned(),
            mountpoint: disk.mount_point().to_string_lossy().into_owned(),
            fstype: disk.file_system().to_string_lossy().into_owned(),
            removable: disk.is_removable(),
        })
        .filter(|m| !is_ignored(&m.device, &m.fstype))
        .collect()
}

pub fn partitions_metadata(_: &mut Diagnostics) -> CollectResult {
    let partitions: Vec<Value> = mounts()
        .into_iter()
        .map(|m| {
            json!({
                "device": m.device,
                "mountpoint": m.mountpoint,
                "fstype": m.fstype,
                "removable": m.removable,
            })
        })
        .collect();
    Ok(Value::Array(partitions))
}

/// Capacity figures for one mount point, in bytes.
fn usage(mountpoint: &str) -> Result<Value, nix::Error> {
    let stat = statvfs(Path::new(mountpoint))?;
    let fragment = stat.fragment_size() as u64;
    let total = stat.blocks() as u64 * fragment;
    let available = stat.blocks_available() as u64 * fragment;
    let used = (stat.blocks() as u64).saturating_sub(stat.blocks_free() as u64) * fragment;
    let usable = used + available;
    let percent = if usable == 0 {
        0.0
    } else {
        (used as f64 * 1000.0 / usable as f64).round() / 10.0
    };
    Ok(json!({
        "total": total,
        "used": used,
        "free": available,
        "percent": percent,
    }))
}

pub fn partitions_usage(diagnostics: &mut Diagnostics) -> CollectResult {
    let mut usages = Map::new();
    for mount in mounts() {
        match usage(&mount.mountpoint) {
            Ok(value) => {
                usages.insert(mount.mountpoint, value);
            }
            Err(nix::Error::EACCES) | Err(nix::Error::EPERM) => {
                diagnostics.warn(format!("no permission to stat {}", mount.mountpoint));
            }
            Err(e) => diagnostics.error(format!("statvfs {} failed: {e}", mount.mountpoint)),
        }
    }
    Ok(Value::Object(usages))
}
