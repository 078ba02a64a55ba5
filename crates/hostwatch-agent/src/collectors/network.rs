// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-interface traffic counters.

use std::collections::BTreeSet;

use nix::ifaddrs::getifaddrs;
use nix::net::if_::InterfaceFlags;
use serde_json::{json, Value};
use sysinfo::Networks;

use super::{CollectResult, CollectorError};
use crate::diagnostics::Diagnostics;

/// Interfaces that are up, carry at least one address and are not loopback.
fn working_interfaces() -> Result<BTreeSet<String>, CollectorError> {
    let addresses =
        getifaddrs().map_err(|e| CollectorError::Unavailable(format!("getifaddrs: {e}")))?;
    Ok(addresses
        .filter(|iface| {
            iface.flags.contains(InterfaceFlags::IFF_UP)
                && !iface.flags.contains(InterfaceFlags::IFF_LOOPBACK)
                && iface.address.is_some()
        })
        .map(|iface| iface.interface_name)
        .collect())
}

pub fn network(_: &mut Diagnostics) -> CollectResult {
    let working = working_interfaces()?;
    let networks = Networks::new_with_refreshed_list();
    let counters: Vec<Value> = networks
        .iter()
        .filter(|(name, _)| working.contains(name.as_str()))
        .map(|(name, data)| {
            json!({
                name.as_str(): {
                    "bytes_sent": data.total_transmitted(),
                    "bytes_recv": data.total_received(),
                    "packets_sent": data.total_packets_transmitted(),
                    "packets_recv": data.total_packets_received(),
                    "errin": data.total_errors_on_received(),
                    "errout": data.total_errors_on_transmitted(),
                }
            })
        })
        .collect();
    Ok(Value::Array(counters))
}
