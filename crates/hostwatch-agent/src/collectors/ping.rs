// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! TCP connect latency to the regional probe hosts.

use std::net::{TcpStream, ToSocketAddrs};
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use super::CollectResult;
use crate::diagnostics::Diagnostics;

pub const PING_PORT: u16 = 80;
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

/// Milliseconds needed to open a TCP connection to `host:port`, or null
/// when the host cannot be reached within `timeout`.
pub fn tcp_ping(host: &str, port: u16, timeout: Duration) -> Option<f64> {
    let started = Instant::now();
    let addresses = match (host, port).to_socket_addrs() {
        Ok(addresses) => addresses,
        Err(e) => {
            debug!(host, "ping resolution failed: {e}");
            return None;
        }
    };
    for address in addresses {
        let remaining = timeout.saturating_sub(started.elapsed());
        if remaining.is_zero() {
            break;
        }
        match TcpStream::connect_timeout(&address, remaining) {
            Ok(_) => return Some(started.elapsed().as_secs_f64() * 1000.0),
            Err(e) => debug!(host, %address, "ping connect failed: {e}"),
        }
    }
    None
}

/// Collector form used for every `ping_<region>` key.
pub fn ping(host: &str, _: &mut Diagnostics) -> CollectResult {
    Ok(tcp_ping(host, PING_PORT, PING_TIMEOUT).map_or(Value::Null, Value::from))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::TcpListener;

    #[test]
    fn measures_local_listener() {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind");
        let port = listener.local_addr().expect("addr").port();
        let latency = tcp_ping("127.0.0.1", port, Duration::from_secs(1)).expect("reachable");
        assert!(latency >= 0.0);
    }

    #[test]
    fn unresolvable_host_is_null() {
        let value = ping("host.invalid", &mut Diagnostics::new()).expect("never errors");
        assert_eq!(value, Value::Null);
    }
}
