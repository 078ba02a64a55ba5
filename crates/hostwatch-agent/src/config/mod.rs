// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Backend-provided agent configuration.
//!
//! The backend returns a configuration object with every `/collect` response.
//! It is never trusted as-is: [`validator::validate_config`] turns the raw JSON
//! into an [`AgentConfig`] where every numeric setting is clamped, every
//! endpoint is loopback-only and unknown keys are gone.

pub mod validator;

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;

pub use validator::validate_config;

/// Seconds between two collection ticks when the backend omits `interval`.
pub const DEFAULT_INTERVAL: u64 = 60;

/// HTTP behaviour of the synchronizer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RequestOptions {
    /// Per-request timeout, seconds.
    pub timeout: u64,
    /// Attempts per payload.
    pub retry: u32,
    /// Base backoff, seconds. Attempt `n` waits `n * retry_interval`.
    pub retry_interval: u64,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            timeout: 5,
            retry: 3,
            retry_interval: 5,
        }
    }
}

impl RequestOptions {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    /// Backoff to wait after the given failed attempt (1-based).
    pub fn backoff(&self, attempt: u32) -> Duration {
        Duration::from_secs(self.retry_interval.saturating_mul(u64::from(attempt)))
    }
}

/// State of a feature that accepts parameters.
///
/// A feature absent from the raw config is represented by `None` at the
/// [`AgentConfig`] level.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Feature<P> {
    /// A scalar value: truthy enables the feature with default parameters.
    Flag(bool),
    Params(P),
}

impl<P: Default + Clone> Feature<P> {
    pub fn is_enabled(&self) -> bool {
        matches!(self, Feature::Flag(true) | Feature::Params(_))
    }

    /// Parameters to run with, `None` when the feature is disabled.
    pub fn params(&self) -> Option<P> {
        match self {
            Feature::Flag(true) => Some(P::default()),
            Feature::Flag(false) => None,
            Feature::Params(params) => Some(params.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RedisParams {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for RedisParams {
    fn default() -> Self {
        Self {
            port: 6379,
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct NginxParams {
    pub status_page_url: String,
}

impl Default for NginxParams {
    fn default() -> Self {
        Self {
            status_page_url: "http://127.0.0.1:8080/nginx_status".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CaddyParams {
    pub admin_api_url: String,
}

impl Default for CaddyParams {
    fn default() -> Self {
        Self {
            admin_api_url: "http://localhost:2019".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PostgresqlParams {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub database: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
}

impl Default for PostgresqlParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 5432,
            user: "postgres".to_string(),
            database: "postgres".to_string(),
            password: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ProxmoxParams {
    pub host: String,
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub token_secret: Option<String>,
    /// Always true once validated.
    pub verify_ssl: bool,
}

impl Default for ProxmoxParams {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8006,
            token_id: None,
            token_secret: None,
            verify_ssl: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DockerParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub socket_url: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QemuParams {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uri: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PortsParams {
    pub monitored_ports: Vec<u16>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PackagesParams {
    pub scan: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_package_hash: Option<String>,
}

/// Feature keys a collector row can be gated on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FeatureKey {
    Cpu,
    Memory,
    Network,
    Partitions,
    Io,
    SmartStorageHealth,
    RaidStorageHealth,
    Processes,
    Temperatures,
    Fans,
    Fail2ban,
    Ipv4,
    Ipv6,
    Gpu,
    Redis,
    Nginx,
    Caddy,
    Postgresql,
    Proxmox,
    Docker,
    Qemu,
    Ports,
}

impl FeatureKey {
    /// Keys that are plain on/off switches.
    pub const FLAGS: [FeatureKey; 14] = [
        FeatureKey::Cpu,
        FeatureKey::Memory,
        FeatureKey::Network,
        FeatureKey::Partitions,
        FeatureKey::Io,
        FeatureKey::SmartStorageHealth,
        FeatureKey::RaidStorageHealth,
        FeatureKey::Processes,
        FeatureKey::Temperatures,
        FeatureKey::Fans,
        FeatureKey::Fail2ban,
        FeatureKey::Ipv4,
        FeatureKey::Ipv6,
        FeatureKey::Gpu,
    ];

    pub const fn as_str(self) -> &'static str {
        match self {
            FeatureKey::Cpu => "cpu",
            FeatureKey::Memory => "memory",
            FeatureKey::Network => "network",
            FeatureKey::Partitions => "partitions",
            FeatureKey::Io => "io",
            FeatureKey::SmartStorageHealth => "smart_storage_health",
            FeatureKey::RaidStorageHealth => "raid_storage_health",
            FeatureKey::Processes => "processes",
            FeatureKey::Temperatures => "temperatures",
            FeatureKey::Fans => "fans",
            FeatureKey::Fail2ban => "fail2ban",
            FeatureKey::Ipv4 => "ipv4",
            FeatureKey::Ipv6 => "ipv6",
            FeatureKey::Gpu => "gpu",
            FeatureKey::Redis => "redis",
            FeatureKey::Nginx => "nginx",
            FeatureKey::Caddy => "caddy",
            FeatureKey::Postgresql => "postgresql",
            FeatureKey::Proxmox => "proxmox",
            FeatureKey::Docker => "docker",
            FeatureKey::Qemu => "qemu",
            FeatureKey::Ports => "ports",
        }
    }
}

impl std::fmt::Display for FeatureKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated configuration. Only [`validate_config`] builds one from backend
/// data; [`Default`] is the pre-handshake state (disabled).
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentConfig {
    pub enabled: bool,
    pub interval: u64,
    pub request_options: RequestOptions,
    /// Boolean switches present in the raw config.
    pub flags: BTreeMap<FeatureKey, bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub redis: Option<Feature<RedisParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub nginx: Option<Feature<NginxParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub caddy: Option<Feature<CaddyParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub postgresql: Option<Feature<PostgresqlParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proxmox: Option<Feature<ProxmoxParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub docker: Option<Feature<DockerParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub qemu: Option<Feature<QemuParams>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ports: Option<Feature<PortsParams>>,
    /// Region name to host, never empty when present.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ping: Option<BTreeMap<String, String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub packages: Option<PackagesParams>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval: DEFAULT_INTERVAL,
            request_options: RequestOptions::default(),
            flags: BTreeMap::new(),
            redis: None,
            nginx: None,
            caddy: None,
            postgresql: None,
            proxmox: None,
            docker: None,
            qemu: None,
            ports: None,
            ping: None,
            packages: None,
        }
    }
}

fn feature_enabled<P: Default + Clone>(feature: &Option<Feature<P>>) -> bool {
    feature.as_ref().is_some_and(Feature::is_enabled)
}

impl AgentConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval)
    }

    /// Whether the feature is switched on.
    pub fn is_enabled(&self, key: FeatureKey) -> bool {
        match key {
            FeatureKey::Redis => feature_enabled(&self.redis),
            FeatureKey::Nginx => feature_enabled(&self.nginx),
            FeatureKey::Caddy => feature_enabled(&self.caddy),
            FeatureKey::Postgresql => feature_enabled(&self.postgresql),
            FeatureKey::Proxmox => feature_enabled(&self.proxmox),
            FeatureKey::Docker => feature_enabled(&self.docker),
            FeatureKey::Qemu => feature_enabled(&self.qemu),
            FeatureKey::Ports => feature_enabled(&self.ports),
            flag => self.flags.get(&flag).copied().unwrap_or(false),
        }
    }

    /// Whether the backend asked for an inventory scan.
    pub fn wants_package_scan(&self) -> bool {
        self.packages.as_ref().is_some_and(|p| p.scan)
    }
}
