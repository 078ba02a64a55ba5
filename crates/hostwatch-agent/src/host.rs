// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Static host information gathered once at startup.

use serde::Serialize;
use sysinfo::System;
use tracing::debug;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Uname {
    pub system: String,
    pub node: String,
    pub release: String,
    pub version: String,
    pub machine: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HostInfo {
    pub version: String,
    pub uname: Uname,
    /// Boot time, seconds since the epoch.
    pub boot_time: Option<u64>,
}

impl HostInfo {
    pub fn detect() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            uname: uname(),
            boot_time: boot_time(),
        }
    }

    #[cfg(test)]
    pub(crate) fn for_tests() -> Self {
        Self {
            version: crate::VERSION.to_string(),
            uname: Uname {
                system: "Linux".to_string(),
                node: "test-host".to_string(),
                release: "6.1.0".to_string(),
                version: "#1 SMP".to_string(),
                machine: "x86_64".to_string(),
            },
            boot_time: Some(1_700_000_000),
        }
    }
}

fn uname() -> Uname {
    match nix::sys::utsname::uname() {
        Ok(info) => Uname {
            system: info.sysname().to_string_lossy().into_owned(),
            node: info.nodename().to_string_lossy().into_owned(),
            release: info.release().to_string_lossy().into_owned(),
            version: info.version().to_string_lossy().into_owned(),
            machine: info.machine().to_string_lossy().into_owned(),
        },
        Err(e) => {
            debug!("uname failed: {e}");
            Uname::default()
        }
    }
}

fn boot_time() -> Option<u64> {
    Some(System::boot_time()).filter(|&secs| secs > 0)
}
