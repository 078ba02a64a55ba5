// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Listening sockets from `/proc/net`.
//!
//! Ephemeral ports are ignored. A TCPv6 socket bound to `::` on a dual-stack
//! host with no matching TCPv4 socket is reported as dual-stack.

use std::collections::{BTreeMap, BTreeSet};
use std::fs;

use serde_json::{json, Value};

use super::CollectResult;
use crate::config::AgentConfig;
use crate::diagnostics::Diagnostics;

const TABLES: [(&str, &str); 4] = [
    ("tcp", "TCP (IPv4)"),
    ("tcp6", "TCP (IPv6)"),
    ("udp", "UDP (IPv4)"),
    ("udp6", "UDP (IPv6)"),
];

const DEFAULT_EPHEMERAL: (u16, u16) = (32768, 60999);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ListeningSocket {
    pub port: u16,
    pub protocol: &'static str,
    pub address: String,
}

fn ephemeral_range() -> (u16, u16) {
    fs::read_to_string("/proc/sys/net/ipv4/ip_local_port_range")
        .ok()
        .and_then(|content| {
            let mut parts = content.split_whitespace().map(str::parse::<u16>);
            match (parts.next(), parts.next()) {
                (Some(Ok(start)), Some(Ok(end))) => Some((start, end)),
                _ => None,
            }
        })
        .unwrap_or(DEFAULT_EPHEMERAL)
}

fn dual_stack_enabled() -> bool {
    fs::read_to_string("/proc/sys/net/ipv6/bindv6only")
        .map(|content| content.trim() == "0")
        .unwrap_or(true)
}

fn ipv4_address(hex: &str) -> Option<String> {
    let raw = u32::from_str_radix(hex, 16).ok()?;
    // Stored in host byte order.
    let bytes = raw.to_le_bytes();
    Some(format!("{}.{}.{}.{}", bytes[0], bytes[1], bytes[2], bytes[3]))
}

fn ipv6_address(hex: &str) -> String {
    if hex.chars().all(|c| c == '0') {
        return "::".to_string();
    }
    hex.as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join(":")
}

/// Listening entries of one `/proc/net` table.
pub(crate) fn parse_table(
    content: &str,
    table: &str,
    protocol: &'static str,
    ephemeral: (u16, u16),
) -> Vec<ListeningSocket> {
    let is_tcp = table.starts_with("tcp");
    let is_v6 = table.ends_with('6');
    content
        .lines()
        .skip(1)
        .filter_map(|line| {
            let parts: Vec<&str> = line.split_whitespace().collect();
            if parts.len() < 4 {
                return None;
            }
            let (addr_hex, port_hex) = parts[1].split_once(':')?;
            let port = u16::from_str_radix(port_hex, 16).ok()?;
            if (ephemeral.0..=ephemeral.1).contains(&port) {
                return None;
            }
            let state = parts[3].to_ascii_uppercase();
            let listening = if is_tcp { state == "0A" } else { state == "07" };
            if !listening {
                return None;
            }
            let address = if is_v6 {
                ipv6_address(addr_hex)
            } else {
                ipv4_address(addr_hex)?
            };
            Some(ListeningSocket {
                port,
                protocol,
                address,
            })
        })
        .collect()
}

/// Relabels wildcard TCPv6 sockets as dual-stack when no TCPv4 socket
/// shares the port.
pub(crate) fn merge_dual_stack(sockets: &mut [ListeningSocket], dual_stack: bool) {
    if !dual_stack {
        return;
    }
    let ipv4_ports: BTreeSet<u16> = sockets
        .iter()
        .filter(|s| s.protocol == "TCP (IPv4)")
        .map(|s| s.port)
        .collect();
    let ipv6_wildcard: BTreeMap<u16, bool> = sockets
        .iter()
        .filter(|s| s.protocol == "TCP (IPv6)")
        .map(|s| (s.port, s.address == "::"))
        .collect();
    for socket in sockets.iter_mut() {
        if socket.protocol == "TCP (IPv6)"
            && !ipv4_ports.contains(&socket.port)
            && ipv6_wildcard.get(&socket.port).copied().unwrap_or(false)
        {
            socket.protocol = "TCP (Dual-Stack)";
        }
    }
}

/// Listening ports as `[port, protocol, address]` triples, restricted to
/// `monitored_ports` when that list is non-empty.
pub fn listening_ports(config: &AgentConfig, diagnostics: &mut Diagnostics) -> CollectResult {
    let monitored: BTreeSet<u16> = config
        .ports
        .as_ref()
        .and_then(|feature| feature.params())
        .map(|params| params.monitored_ports.into_iter().collect())
        .unwrap_or_default();
    let ephemeral = ephemeral_range();

    let mut sockets = Vec::new();
    for (table, protocol) in TABLES {
        let path = format!("/proc/net/{table}");
        match fs::read_to_string(&path) {
            Ok(content) => sockets.extend(parse_table(&content, table, protocol, ephemeral)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => diagnostics.error(format!("failed to read {path}: {e}")),
        }
    }
    merge_dual_stack(&mut sockets, dual_stack_enabled());

    let ports: Vec<Value> = sockets
        .into_iter()
        .filter(|s| monitored.is_empty() || monitored.contains(&s.port))
        .map(|s| json!([s.port, s.protocol, s.address]))
        .collect();
    Ok(Value::Array(ports))
}

#[cfg(test)]
mod tests {
    use super::*;

    const TCP: &str = "  sl  local_address rem_address   st tx_queue rx_queue\n\
   0: 00000000:0016 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0\n\
   1: 0100007F:1F90 00000000:0000 0A 00000000:00000000 00:00000000 00000000     0\n\
   2: 0100007F:9C40 0100007F:1F90 01 00000000:00000000 00:00000000 00000000     0\n";

    const TCP6: &str = "  sl  local_address remote_address st\n\
   0: 00000000000000000000000000000000:0050 00000000000000000000000000000000:0000 0A\n\
   1: 00000000000000000000000000000000:0016 00000000000000000000000000000000:0000 0A\n";

    #[test]
    fn parses_listening_tcp_sockets() {
        let sockets = parse_table(TCP, "tcp", "TCP (IPv4)", DEFAULT_EPHEMERAL);
        assert_eq!(
            sockets,
            vec![
                ListeningSocket {
                    port: 22,
                    protocol: "TCP (IPv4)",
                    address: "0.0.0.0".to_string()
                },
                ListeningSocket {
                    port: 8080,
                    protocol: "TCP (IPv4)",
                    address: "127.0.0.1".to_string()
                },
            ]
        );
    }

    #[test]
    fn ephemeral_ports_are_skipped() {
        let sockets = parse_table(TCP, "tcp", "TCP (IPv4)", (1, 65535));
        assert!(sockets.is_empty());
    }

    #[test]
    fn wildcard_ipv6_without_ipv4_is_dual_stack() {
        let mut sockets = parse_table(TCP, "tcp", "TCP (IPv4)", DEFAULT_EPHEMERAL);
        sockets.extend(parse_table(TCP6, "tcp6", "TCP (IPv6)", DEFAULT_EPHEMERAL));
        merge_dual_stack(&mut sockets, true);
        let http = sockets.iter().find(|s| s.port == 80).expect("port 80");
        assert_eq!(http.protocol, "TCP (Dual-Stack)");
        let ssh_v6 = sockets
            .iter()
            .find(|s| s.port == 22 && s.address == "::")
            .expect("ssh v6");
        assert_eq!(ssh_v6.protocol, "TCP (IPv6)");
    }
}
