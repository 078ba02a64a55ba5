// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local daemon metrics: redis `INFO` and nginx `stub_status`.
//!
//! Both collectors return null when the daemon binary is not installed.
//! Targets come from the validated configuration and are always loopback.

use std::io::{Read, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::time::Duration;

use serde_json::{Map, Value};
use tokio::runtime::Handle;
use url::Url;

use super::{CollectResult, CollectorError};
use crate::config::AgentConfig;
use crate::diagnostics::Diagnostics;
use crate::subprocess;
use crate::sync::transport::loopback_get;

const SERVICE_TIMEOUT: Duration = Duration::from_secs(5);

fn installed(binary: &str) -> bool {
    which::which(binary).is_ok()
}

/// RESP array form of `AUTH <password>`, safe for any password bytes.
fn auth_command(password: &str) -> String {
    format!("*2\r\n$4\r\nAUTH\r\n${}\r\n{password}\r\n", password.len())
}

fn redis_session(port: u16, password: Option<&str>) -> Result<String, CollectorError> {
    let io = |e: std::io::Error| CollectorError::Protocol(format!("redis on port {port}: {e}"));
    let address = SocketAddr::from((Ipv4Addr::LOCALHOST, port));
    let mut stream = TcpStream::connect_timeout(&address, SERVICE_TIMEOUT).map_err(io)?;
    stream.set_read_timeout(Some(SERVICE_TIMEOUT)).map_err(io)?;
    stream.set_write_timeout(Some(SERVICE_TIMEOUT)).map_err(io)?;

    let mut request = String::new();
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        request.push_str(&auth_command(password));
    }
    request.push_str("INFO\r\nQUIT\r\n");
    stream.write_all(request.as_bytes()).map_err(io)?;

    let mut reply = String::new();
    stream.read_to_string(&mut reply).map_err(io)?;
    Ok(reply)
}

/// Extracts version, client counts and keyspace entries from an `INFO` reply.
pub(crate) fn parse_redis_info(reply: &str) -> Result<Value, CollectorError> {
    if let Some(error) = reply.lines().find(|line| line.starts_with('-')) {
        return Err(CollectorError::Protocol(format!(
            "redis replied {}",
            error.trim_start_matches('-')
        )));
    }

    let mut metrics = Map::new();
    for line in reply.lines() {
        let Some((key, value)) = line.split_once(':') else {
            continue;
        };
        let value = value.trim();
        match key {
            "redis_version" => {
                metrics.insert(key.to_string(), Value::from(value));
            }
            "connected_clients" | "maxclients" => {
                let count: i64 = value
                    .parse()
                    .map_err(|_| CollectorError::parse("redis INFO", format!("{key}={value}")))?;
                metrics.insert(key.to_string(), Value::from(count));
            }
            db if db.starts_with("db") && db[2..].chars().all(|c| c.is_ascii_digit()) => {
                let mut keyspace = Map::new();
                for pair in value.split(',') {
                    let Some((name, count)) = pair.split_once('=') else {
                        continue;
                    };
                    let count: i64 = count
                        .trim()
                        .parse()
                        .map_err(|_| CollectorError::parse("redis INFO", pair.to_string()))?;
                    keyspace.insert(name.to_string(), Value::from(count));
                }
                metrics.insert(db.to_string(), Value::Object(keyspace));
            }
            _ => {}
        }
    }
    Ok(Value::Object(metrics))
}

pub fn redis(config: &AgentConfig, _: &mut Diagnostics) -> CollectResult {
    let Some(params) = config.redis.as_ref().and_then(|feature| feature.params()) else {
        return Ok(Value::Null);
    };
    if !installed("redis-server") {
        return Ok(Value::Null);
    }
    let reply = redis_session(params.port, params.password.as_deref())?;
    parse_redis_info(&reply)
}

fn nginx_version(handle: &Handle) -> Option<String> {
    let output = handle
        .block_on(subprocess::output("nginx", &["-v"], SERVICE_TIMEOUT))
        .ok()?;
    // `nginx version: nginx/1.24.0` goes to stderr.
    let text = String::from_utf8_lossy(&output.stderr);
    text.trim()
        .split_once('/')
        .map(|(_, version)| version.trim().to_string())
}

/// Parses the four-line `stub_status` page.
pub(crate) fn parse_stub_status(body: &str) -> Result<Map<String, Value>, CollectorError> {
    let lines: Vec<&str> = body.lines().filter(|line| !line.trim().is_empty()).collect();
    let invalid = || CollectorError::parse("nginx status page", body.trim().to_string());
    let mut metrics = Map::new();
    if lines.is_empty() {
        return Ok(metrics);
    }

    let active: i64 = lines[0]
        .split_once(':')
        .and_then(|(_, count)| count.trim().parse().ok())
        .ok_or_else(invalid)?;
    metrics.insert("active_connections".to_string(), Value::from(active));

    let states: Vec<&str> = lines.get(3).ok_or_else(invalid)?.split_whitespace().collect();
    for (label, key) in [
        ("Reading:", "reading_connections"),
        ("Writing:", "writing_connections"),
        ("Waiting:", "waiting_connections"),
    ] {
        let count: i64 = states
            .iter()
            .position(|token| *token == label)
            .and_then(|i| states.get(i + 1))
            .and_then(|count| count.parse().ok())
            .ok_or_else(invalid)?;
        metrics.insert(key.to_string(), Value::from(count));
    }
    Ok(metrics)
}

pub fn nginx(config: &AgentConfig, _: &mut Diagnostics) -> CollectResult {
    let Some(params) = config.nginx.as_ref().and_then(|feature| feature.params()) else {
        return Ok(Value::Null);
    };
    if !installed("nginx") {
        return Ok(Value::Null);
    }
    let handle = Handle::try_current()
        .map_err(|e| CollectorError::Unavailable(format!("no runtime for nginx status: {e}")))?;
    let url = Url::parse(&params.status_page_url)
        .map_err(|e| CollectorError::parse("nginx status_page_url", e.to_string()))?;

    let response = handle
        .block_on(loopback_get(&url, SERVICE_TIMEOUT))
        .map_err(|e| CollectorError::Protocol(format!("nginx status page: {e}")))?;
    if !response.status.is_success() {
        return Err(CollectorError::Protocol(format!(
            "nginx status page answered {}",
            response.status
        )));
    }

    let mut metrics = Map::new();
    metrics.insert(
        "nginx_version".to_string(),
        nginx_version(&handle).map_or(Value::Null, Value::from),
    );
    metrics.extend(parse_stub_status(&String::from_utf8_lossy(&response.body))?);
    Ok(Value::Object(metrics))
}
