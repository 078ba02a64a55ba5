// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Sanitization of the configuration returned by the backend.
//!
//! A compromised backend must not be able to point collectors at remote
//! hosts, smuggle protocol commands through credentials or relax TLS
//! verification. Every section is checked here; a section that violates a
//! rule is disabled and a warning is logged, the rest of the config survives.

use std::collections::BTreeMap;
use std::fmt;

use serde_json::{Map, Value};
use tracing::warn;
use url::{Host, Url};

use super::{
    AgentConfig, CaddyParams, DockerParams, Feature, FeatureKey, NginxParams, PackagesParams,
    PortsParams, PostgresqlParams, ProxmoxParams, QemuParams, RedisParams, RequestOptions,
    DEFAULT_INTERVAL,
};

/// Host names collectors are allowed to reach.
pub const LOOPBACK_HOSTS: [&str; 3] = ["localhost", "127.0.0.1", "::1"];

/// libvirt connection URIs accepted for the qemu collector.
pub const ALLOWED_QEMU_URIS: [&str; 2] = ["qemu:///system", "qemu:///session"];

pub const INTERVAL_MIN: i64 = 30;
pub const INTERVAL_MAX: i64 = 3600;
pub const TIMEOUT_MIN: i64 = 1;
pub const TIMEOUT_MAX: i64 = 60;
pub const RETRY_MIN: i64 = 1;
pub const RETRY_MAX: i64 = 10;
pub const RETRY_INTERVAL_MIN: i64 = 1;
pub const RETRY_INTERVAL_MAX: i64 = 120;

/// A rule broken by a feature section. The section is disabled.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    pub feature: FeatureKey,
    pub reason: String,
}

impl Violation {
    fn new(feature: FeatureKey, reason: impl Into<String>) -> Self {
        Self {
            feature,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for Violation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.feature, self.reason)
    }
}

type Sanitized<P> = Result<P, Violation>;

/// Turns a raw backend config into a validated [`AgentConfig`].
///
/// Never fails: anything that is not an object yields the default
/// (disabled) configuration.
pub fn validate_config(raw: &Value) -> AgentConfig {
    let empty = Map::new();
    let raw = raw.as_object().unwrap_or(&empty);

    let enabled = raw.get("enabled").is_some_and(truthy);
    let interval = clamp_number(
        raw.get("interval"),
        INTERVAL_MIN,
        INTERVAL_MAX,
        DEFAULT_INTERVAL as i64,
    ) as u64;
    let request_options = validate_request_options(raw.get("request_options"));

    let mut flags = BTreeMap::new();
    for key in FeatureKey::FLAGS {
        match raw.get(key.as_str()) {
            None | Some(Value::Null) => {}
            Some(value) => {
                flags.insert(key, truthy(value));
            }
        }
    }

    AgentConfig {
        enabled,
        interval,
        request_options,
        flags,
        redis: feature(raw, FeatureKey::Redis, sanitize_redis),
        nginx: feature(raw, FeatureKey::Nginx, sanitize_nginx),
        caddy: feature(raw, FeatureKey::Caddy, sanitize_caddy),
        postgresql: feature(raw, FeatureKey::Postgresql, sanitize_postgresql),
        proxmox: feature(raw, FeatureKey::Proxmox, sanitize_proxmox),
        docker: feature(raw, FeatureKey::Docker, sanitize_docker),
        qemu: feature(raw, FeatureKey::Qemu, sanitize_qemu),
        ports: feature(raw, FeatureKey::Ports, sanitize_ports),
        ping: raw.get("ping").filter(|v| truthy(v)).and_then(sanitize_ping),
        packages: raw.get("packages").and_then(sanitize_packages),
    }
}

fn validate_request_options(raw: Option<&Value>) -> RequestOptions {
    let defaults = RequestOptions::default();
    let Some(opts) = raw.and_then(Value::as_object) else {
        return defaults;
    };
    RequestOptions {
        timeout: clamp_number(
            opts.get("timeout"),
            TIMEOUT_MIN,
            TIMEOUT_MAX,
            defaults.timeout as i64,
        ) as u64,
        retry: clamp_number(
            opts.get("retry"),
            RETRY_MIN,
            RETRY_MAX,
            i64::from(defaults.retry),
        ) as u32,
        retry_interval: clamp_number(
            opts.get("retry_interval"),
            RETRY_INTERVAL_MIN,
            RETRY_INTERVAL_MAX,
            defaults.retry_interval as i64,
        ) as u64,
    }
}

/// Applies the falsy / object / truthy-scalar rule shared by every
/// parameterised feature.
fn feature<P>(
    raw: &Map<String, Value>,
    key: FeatureKey,
    sanitize: fn(&Map<String, Value>) -> Sanitized<P>,
) -> Option<Feature<P>> {
    let value = raw.get(key.as_str())?;
    if value.is_null() {
        return None;
    }
    if !truthy(value) {
        return Some(Feature::Flag(false));
    }
    match value {
        Value::Object(section) => match sanitize(section) {
            Ok(params) => Some(Feature::Params(params)),
            Err(violation) => {
                warn!(
                    feature = %violation.feature,
                    "Rejected backend config section, disabling collector: {}",
                    violation.reason
                );
                None
            }
        },
        _ => Some(Feature::Flag(true)),
    }
}

/// Converts `value` to an integer and clamps it to `[min, max]`.
///
/// Missing, null and non-numeric values yield `default`. Floats are
/// truncated and numeric strings are parsed.
pub fn clamp_number(value: Option<&Value>, min: i64, max: i64, default: i64) -> i64 {
    match value.and_then(as_integer) {
        Some(n) => n.clamp(min, max),
        None => default,
    }
}

fn as_integer(value: &Value) -> Option<i64> {
    match value {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_u64().map(|_| i64::MAX))
            .or_else(|| n.as_f64().map(|f| f.trunc() as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
}

/// JSON truthiness: null, false, zero, empty strings and empty containers
/// are falsy.
fn truthy(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::Number(n) => n.as_f64().is_some_and(|f| f != 0.0),
        Value::String(s) => !s.is_empty(),
        Value::Array(a) => !a.is_empty(),
        Value::Object(o) => !o.is_empty(),
    }
}

/// Removes every carriage return and line feed.
pub fn strip_crlf(value: &str) -> String {
    value.chars().filter(|c| *c != '\r' && *c != '\n').collect()
}

/// True when `host` is one of [`LOOPBACK_HOSTS`], ignoring case.
pub fn is_loopback_host(host: &str) -> bool {
    let host = host.to_ascii_lowercase();
    LOOPBACK_HOSTS.contains(&host.as_str())
}

/// True when `url` parses and its host is a loopback name.
pub fn is_loopback_url(url: &str) -> bool {
    let Ok(parsed) = Url::parse(url) else {
        return false;
    };
    match parsed.host() {
        Some(Host::Domain(domain)) => is_loopback_host(domain),
        Some(Host::Ipv4(ip)) => is_loopback_host(&ip.to_string()),
        Some(Host::Ipv6(ip)) => is_loopback_host(&ip.to_string()),
        None => false,
    }
}

fn port(section: &Map<String, Value>, feature: FeatureKey, default: u16) -> Sanitized<u16> {
    let Some(value) = section.get("port") else {
        return Ok(default);
    };
    let n = as_integer(value)
        .ok_or_else(|| Violation::new(feature, format!("port {value} is invalid")))?;
    u16::try_from(n)
        .ok()
        .filter(|p| *p >= 1)
        .ok_or_else(|| Violation::new(feature, format!("port {n} out of range")))
}

/// Optional string field: missing or null is `None`, other types violate.
fn optional_string(
    section: &Map<String, Value>,
    feature: FeatureKey,
    field: &str,
) -> Sanitized<Option<String>> {
    match section.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(_) => Err(Violation::new(feature, format!("{field} must be a string"))),
    }
}

/// String field with a default: present but not a string violates.
fn string_or(
    section: &Map<String, Value>,
    feature: FeatureKey,
    field: &str,
    default: String,
) -> Sanitized<String> {
    match section.get(field) {
        None => Ok(default),
        Some(Value::String(s)) => Ok(s.clone()),
        Some(_) => Err(Violation::new(feature, format!("{field} must be a string"))),
    }
}

fn loopback_host(
    section: &Map<String, Value>,
    feature: FeatureKey,
    default: String,
) -> Sanitized<String> {
    let host = match section.get("host") {
        None => default,
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    };
    if is_loopback_host(&host) {
        Ok(host)
    } else {
        Err(Violation::new(feature, format!("host {host:?} is not loopback")))
    }
}

fn loopback_url(
    section: &Map<String, Value>,
    feature: FeatureKey,
    field: &str,
    default: String,
) -> Sanitized<String> {
    match section.get(field) {
        None => Ok(default),
        Some(Value::String(url)) if is_loopback_url(url) => Ok(url.clone()),
        Some(other) => Err(Violation::new(
            feature,
            format!("{field} {other} is not loopback"),
        )),
    }
}

fn sanitize_redis(section: &Map<String, Value>) -> Sanitized<RedisParams> {
    let defaults = RedisParams::default();
    Ok(RedisParams {
        port: port(section, FeatureKey::Redis, defaults.port)?,
        password: optional_string(section, FeatureKey::Redis, "password")?
            .map(|p| strip_crlf(&p)),
    })
}

fn sanitize_nginx(section: &Map<String, Value>) -> Sanitized<NginxParams> {
    Ok(NginxParams {
        status_page_url: loopback_url(
            section,
            FeatureKey::Nginx,
            "status_page_url",
            NginxParams::default().status_page_url,
        )?,
    })
}

fn sanitize_caddy(section: &Map<String, Value>) -> Sanitized<CaddyParams> {
    Ok(CaddyParams {
        admin_api_url: loopback_url(
            section,
            FeatureKey::Caddy,
            "admin_api_url",
            CaddyParams::default().admin_api_url,
        )?,
    })
}

fn sanitize_postgresql(section: &Map<String, Value>) -> Sanitized<PostgresqlParams> {
    let key = FeatureKey::Postgresql;
    let defaults = PostgresqlParams::default();
    Ok(PostgresqlParams {
        host: loopback_host(section, key, defaults.host)?,
        port: port(section, key, defaults.port)?,
        user: string_or(section, key, "user", defaults.user)?,
        database: string_or(section, key, "database", defaults.database)?,
        password: optional_string(section, key, "password")?.map(|p| strip_crlf(&p)),
    })
}

fn sanitize_proxmox(section: &Map<String, Value>) -> Sanitized<ProxmoxParams> {
    let key = FeatureKey::Proxmox;
    let defaults = ProxmoxParams::default();
    let params = ProxmoxParams {
        host: loopback_host(section, key, defaults.host)?,
        port: port(section, key, defaults.port)?,
        token_id: optional_string(section, key, "token_id")?,
        token_secret: optional_string(section, key, "token_secret")?,
        verify_ssl: true,
    };
    if section.get("verify_ssl") == Some(&Value::Bool(false)) {
        warn!(feature = %key, "verify_ssl=false rejected, forcing certificate verification");
    }
    Ok(params)
}

fn sanitize_docker(section: &Map<String, Value>) -> Sanitized<DockerParams> {
    let socket_url = match section.get("socket_url") {
        None | Some(Value::Null) => None,
        Some(Value::String(url)) if url.starts_with("unix://") => Some(url.clone()),
        Some(other) => {
            return Err(Violation::new(
                FeatureKey::Docker,
                format!("socket_url {other} must use unix://"),
            ))
        }
    };
    Ok(DockerParams { socket_url })
}

fn sanitize_qemu(section: &Map<String, Value>) -> Sanitized<QemuParams> {
    let uri = match section.get("uri") {
        None | Some(Value::Null) => None,
        Some(Value::String(uri)) if ALLOWED_QEMU_URIS.contains(&uri.as_str()) => {
            Some(uri.clone())
        }
        Some(other) => {
            return Err(Violation::new(
                FeatureKey::Qemu,
                format!("uri {other} is not allowed"),
            ))
        }
    };
    Ok(QemuParams { uri })
}

fn sanitize_ports(section: &Map<String, Value>) -> Sanitized<PortsParams> {
    let entries = match section.get("monitored_ports") {
        None => return Ok(PortsParams::default()),
        Some(Value::Array(entries)) => entries,
        Some(_) => {
            return Err(Violation::new(
                FeatureKey::Ports,
                "monitored_ports must be a list",
            ))
        }
    };
    let monitored_ports = entries
        .iter()
        .filter_map(|entry| {
            let port = as_integer(entry)
                .and_then(|n| u16::try_from(n).ok())
                .filter(|p| *p >= 1);
            if port.is_none() {
                warn!(feature = "ports", "Skipping invalid monitored port {entry}");
            }
            port
        })
        .collect();
    Ok(PortsParams { monitored_ports })
}

fn sanitize_ping(raw: &Value) -> Option<BTreeMap<String, String>> {
    let Some(entries) = raw.as_object() else {
        warn!(feature = "ping", "ping config must be a map, disabling");
        return None;
    };
    let hosts: BTreeMap<String, String> = entries
        .iter()
        .filter_map(|(region, host)| match host {
            Value::String(host) if !host.is_empty() => Some((region.clone(), host.clone())),
            other => {
                warn!(feature = "ping", region = %region, "Skipping invalid ping host {other}");
                None
            }
        })
        .collect();
    (!hosts.is_empty()).then_some(hosts)
}

fn sanitize_packages(raw: &Value) -> Option<PackagesParams> {
    let section = raw.as_object()?;
    Some(PackagesParams {
        scan: section.get("scan").is_some_and(truthy),
        last_package_hash: section
            .get("last_package_hash")
            .and_then(Value::as_str)
            .map(str::to_string),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use serde_json::json;

    #[test]
    fn non_object_yields_default_config() {
        assert_eq!(validate_config(&json!("nope")), AgentConfig::default());
        assert_eq!(validate_config(&Value::Null), AgentConfig::default());
    }

    #[test]
    fn clamps_interval_and_request_options() {
        let config = validate_config(&json!({
            "enabled": true,
            "interval": 5,
            "request_options": {"timeout": 600, "retry": 0, "retry_interval": "7"}
        }));
        assert!(config.enabled);
        assert_eq!(config.interval, 30);
        assert_eq!(config.request_options.timeout, 60);
        assert_eq!(config.request_options.retry, 1);
        assert_eq!(config.request_options.retry_interval, 7);
    }

    #[test]
    fn non_numeric_interval_falls_back_to_default() {
        let config = validate_config(&json!({"interval": "soon"}));
        assert_eq!(config.interval, 60);
        let config = validate_config(&json!({"interval": 90.9}));
        assert_eq!(config.interval, 90);
    }

    #[test]
    fn unknown_keys_are_dropped() {
        let config = validate_config(&json!({"enabled": true, "shell": "rm -rf /"}));
        let serialized = serde_json::to_value(&config).expect("serializes");
        assert!(serialized.get("shell").is_none());
    }

    #[test]
    fn boolean_flags_follow_truthiness() {
        let config = validate_config(&json!({"cpu": 1, "memory": "", "io": null}));
        assert_eq!(config.flags.get(&FeatureKey::Cpu), Some(&true));
        assert_eq!(config.flags.get(&FeatureKey::Memory), Some(&false));
        assert!(!config.flags.contains_key(&FeatureKey::Io));
        assert!(config.is_enabled(FeatureKey::Cpu));
    }

    #[test]
    fn nginx_remote_url_disables_collector() {
        let config = validate_config(&json!({
            "nginx": {"status_page_url": "http://169.254.169.254/latest/meta-data"}
        }));
        assert_eq!(config.nginx, None);
        assert!(!config.is_enabled(FeatureKey::Nginx));
    }

    #[test]
    fn nginx_loopback_url_is_kept() {
        let config = validate_config(&json!({
            "nginx": {"status_page_url": "http://127.0.0.1:8080/status"}
        }));
        assert_eq!(
            config.nginx,
            Some(Feature::Params(NginxParams {
                status_page_url: "http://127.0.0.1:8080/status".to_string()
            }))
        );
    }

    #[test]
    fn loopback_url_checks_the_real_host() {
        assert!(is_loopback_url("http://LOCALHOST:2019"));
        assert!(is_loopback_url("http://[::1]:8080/status"));
        assert!(!is_loopback_url("http://127.0.0.1@evil.example/"));
        assert!(!is_loopback_url("127.0.0.1:8080"));
        assert!(!is_loopback_url("http://127.0.0.2/"));
    }

    #[test]
    fn redis_password_loses_line_breaks() {
        let config = validate_config(&json!({
            "redis": {"port": "6380", "password": "secret\r\nFLUSHALL"}
        }));
        assert_eq!(
            config.redis,
            Some(Feature::Params(RedisParams {
                port: 6380,
                password: Some("secretFLUSHALL".to_string()),
            }))
        );
    }

    #[test]
    fn redis_invalid_port_disables_collector() {
        let config = validate_config(&json!({"redis": {"port": 70000}}));
        assert_eq!(config.redis, None);
        let config = validate_config(&json!({"redis": {"port": "abc"}}));
        assert_eq!(config.redis, None);
        let config = validate_config(&json!({"redis": {"password": 42}}));
        assert_eq!(config.redis, None);
    }

    #[test]
    fn scalar_and_falsy_features_are_preserved() {
        let config = validate_config(&json!({"redis": true, "nginx": false, "docker": {}}));
        assert_eq!(config.redis, Some(Feature::Flag(true)));
        assert_eq!(config.nginx, Some(Feature::Flag(false)));
        assert_eq!(config.docker, Some(Feature::Flag(false)));
        assert_eq!(config.caddy, None);
    }

    #[test]
    fn proxmox_forces_certificate_verification() {
        let config = validate_config(&json!({
            "proxmox": {"host": "localhost", "verify_ssl": false, "token_id": "root@pam!agent"}
        }));
        let Some(Feature::Params(params)) = config.proxmox else {
            panic!("proxmox should stay enabled");
        };
        assert!(params.verify_ssl);
        assert_eq!(params.port, 8006);
        assert_eq!(params.token_id.as_deref(), Some("root@pam!agent"));
    }

    #[test]
    fn postgresql_remote_host_disables_collector() {
        let config = validate_config(&json!({"postgresql": {"host": "db.internal"}}));
        assert_eq!(config.postgresql, None);
        let config = validate_config(&json!({"postgresql": {"host": "::1", "user": 3}}));
        assert_eq!(config.postgresql, None);
    }

    #[test]
    fn docker_requires_unix_socket() {
        let config = validate_config(&json!({"docker": {"socket_url": "tcp://10.0.0.1:2375"}}));
        assert_eq!(config.docker, None);
        let config =
            validate_config(&json!({"docker": {"socket_url": "unix:///var/run/docker.sock"}}));
        assert!(config.is_enabled(FeatureKey::Docker));
    }

    #[test]
    fn qemu_uri_must_be_allowed() {
        let config = validate_config(&json!({"qemu": {"uri": "qemu+ssh://host/system"}}));
        assert_eq!(config.qemu, None);
        let config = validate_config(&json!({"qemu": {"uri": "qemu:///session"}}));
        assert_eq!(
            config.qemu,
            Some(Feature::Params(QemuParams {
                uri: Some("qemu:///session".to_string())
            }))
        );
    }

    #[test]
    fn ports_drops_invalid_entries() {
        let config = validate_config(
            &json!({"ports": {"monitored_ports": [22, "80", 0, 70000, "x"]}}),
        );
        assert_eq!(
            config.ports,
            Some(Feature::Params(PortsParams {
                monitored_ports: vec![22, 80]
            }))
        );
        let config = validate_config(&json!({"ports": {"monitored_ports": "22"}}));
        assert_eq!(config.ports, None);
    }

    #[test]
    fn ping_keeps_only_non_empty_hosts() {
        let config = validate_config(&json!({"ping": {"eu": "eu.example.com", "us": "", "ap": 3}}));
        let ping = config.ping.expect("ping should be kept");
        assert_eq!(ping.len(), 1);
        assert_eq!(ping.get("eu").map(String::as_str), Some("eu.example.com"));

        let config = validate_config(&json!({"ping": {"us": ""}}));
        assert_eq!(config.ping, None);
    }

    #[test]
    fn packages_section_is_typed() {
        let config =
            validate_config(&json!({"packages": {"scan": true, "last_package_hash": "abc"}}));
        assert!(config.wants_package_scan());
        assert_eq!(
            config.packages.and_then(|p| p.last_package_hash).as_deref(),
            Some("abc")
        );
    }

    proptest! {
        #[test]
        fn interval_always_within_bounds(n in any::<i64>()) {
            let config = validate_config(&json!({"interval": n}));
            prop_assert!((INTERVAL_MIN as u64..=INTERVAL_MAX as u64).contains(&config.interval));
        }

        #[test]
        fn redis_password_never_contains_line_breaks(password in ".*") {
            let config = validate_config(&json!({"redis": {"password": password}}));
            if let Some(Feature::Params(params)) = config.redis {
                let password = params.password.unwrap_or_default();
                prop_assert!(!password.contains('\r') && !password.contains('\n'));
            }
        }
    }
}
