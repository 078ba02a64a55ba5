// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Local, agent-side settings read from the environment at startup.
//!
//! These never come from the backend. The backend-provided configuration is
//! [`crate::config::AgentConfig`].

use std::env;
use std::fs;
use std::io;
use std::net::IpAddr;
use std::path::PathBuf;

use url::{Host, Url};

pub const DEFAULT_API_URL: &str = "api.hostwatch.io";
pub const DEFAULT_CONFIG_DIR: &str = "/etc/hostwatch";
pub const DEFAULT_LOG_LEVEL: &str = "info";
pub const TOKEN_FILE: &str = "TOKEN";

/// Host that is reached over plaintext HTTP instead of TLS.
pub const PLAINTEXT_HOST: &str = "localhost";

const HTTPS_PORT: u16 = 443;
const HTTP_PORT: u16 = 80;

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error("{} file is missing", path.display())]
    MissingCredential { path: PathBuf },

    #[error("failed to read {}: {source}", path.display())]
    UnreadableCredential {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("{} is empty", path.display())]
    EmptyCredential { path: PathBuf },

    #[error("invalid API_URL {0:?}")]
    InvalidApiUrl(String),
}

/// Backend address, `host[:port]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiTarget {
    host: String,
    port: u16,
    authority: String,
}

impl ApiTarget {
    pub fn parse(raw: &str) -> Result<Self, SettingsError> {
        let authority = raw.trim().trim_end_matches('/').to_string();
        let invalid = || SettingsError::InvalidApiUrl(raw.to_string());
        if authority.is_empty() || authority.contains("://") {
            return Err(invalid());
        }
        // A non-special scheme keeps explicit default ports like `:443`.
        let url = Url::parse(&format!("hostwatch://{authority}")).map_err(|_| invalid())?;
        if !url.path().is_empty() || url.query().is_some() || !url.username().is_empty() {
            return Err(invalid());
        }
        let host = match url.host() {
            Some(Host::Domain(domain)) => domain.to_string(),
            Some(Host::Ipv4(ip)) => ip.to_string(),
            Some(Host::Ipv6(ip)) => ip.to_string(),
            None => return Err(invalid()),
        };
        let default_port = if host == PLAINTEXT_HOST {
            HTTP_PORT
        } else {
            HTTPS_PORT
        };
        Ok(Self {
            port: url.port().unwrap_or(default_port),
            host,
            authority,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// The configured value, sent as the `Host` header.
    pub fn authority(&self) -> &str {
        &self.authority
    }

    /// Literal match on [`PLAINTEXT_HOST`]; `127.0.0.1` still uses TLS.
    pub fn is_plaintext(&self) -> bool {
        self.host == PLAINTEXT_HOST
    }

    pub fn ip(&self) -> Option<IpAddr> {
        self.host.parse().ok()
    }
}

#[derive(Debug, Clone)]
pub struct AgentSettings {
    pub api: ApiTarget,
    pub config_dir: PathBuf,
    pub log_level: String,
    pub dry_run: bool,
}

impl AgentSettings {
    /// Reads `API_URL`, `CONFIG_DIR`, `LOG_LEVEL` and `DRY_RUN`.
    pub fn from_env() -> Result<Self, SettingsError> {
        let api_url = env::var("API_URL").unwrap_or_else(|_| DEFAULT_API_URL.to_string());
        let config_dir = env::var("CONFIG_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from(DEFAULT_CONFIG_DIR));
        let log_level = env::var("LOG_LEVEL")
            .map(|val| val.to_lowercase())
            .unwrap_or_else(|_| DEFAULT_LOG_LEVEL.to_string());
        let dry_run = env::var("DRY_RUN")
            .map(|val| matches!(val.to_lowercase().as_str(), "true" | "1" | "yes"))
            .unwrap_or(false);

        Ok(Self {
            api: ApiTarget::parse(&api_url)?,
            config_dir,
            log_level,
            dry_run,
        })
    }

    pub fn token_path(&self) -> PathBuf {
        self.config_dir.join(TOKEN_FILE)
    }

    /// Reads the bearer credential. Surrounding whitespace is trimmed.
    pub fn load_token(&self) -> Result<String, SettingsError> {
        let path = self.token_path();
        let token = match fs::read_to_string(&path) {
            Ok(token) => token.trim().to_string(),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(SettingsError::MissingCredential { path })
            }
            Err(source) => return Err(SettingsError::UnreadableCredential { path, source }),
        };
        if token.is_empty() {
            return Err(SettingsError::EmptyCredential { path });
        }
        Ok(token)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    #[test]
    fn parses_host_only() {
        let target = ApiTarget::parse("api.hostwatch.io").expect("valid");
        assert_eq!(target.host(), "api.hostwatch.io");
        assert_eq!(target.port(), 443);
        assert!(!target.is_plaintext());
        assert_eq!(target.authority(), "api.hostwatch.io");
    }

    #[test]
    fn localhost_is_plaintext() {
        let target = ApiTarget::parse("localhost:3000").expect("valid");
        assert!(target.is_plaintext());
        assert_eq!(target.port(), 3000);
        assert_eq!(ApiTarget::parse("localhost").expect("valid").port(), 80);
    }

    #[test]
    fn loopback_ip_is_not_plaintext() {
        let target = ApiTarget::parse("127.0.0.1:8443").expect("valid");
        assert!(!target.is_plaintext());
        assert_eq!(target.ip(), "127.0.0.1".parse().ok());
        let target = ApiTarget::parse("[::1]:8443").expect("valid");
        assert_eq!(target.host(), "::1");
    }

    #[test]
    fn rejects_urls_with_scheme_or_path() {
        assert!(ApiTarget::parse("https://api.hostwatch.io").is_err());
        assert!(ApiTarget::parse("api.hostwatch.io/v1").is_err());
        assert!(ApiTarget::parse("").is_err());
    }

    #[test]
    #[serial]
    fn settings_from_env() {
        env::set_var("API_URL", "localhost:8080");
        env::set_var("CONFIG_DIR", "/tmp/hostwatch-test");
        env::set_var("DRY_RUN", "true");
        env::remove_var("LOG_LEVEL");
        let settings = AgentSettings::from_env().expect("valid settings");
        env::remove_var("API_URL");
        env::remove_var("CONFIG_DIR");
        env::remove_var("DRY_RUN");

        assert!(settings.api.is_plaintext());
        assert!(settings.dry_run);
        assert_eq!(settings.log_level, "info");
        assert_eq!(settings.token_path(), PathBuf::from("/tmp/hostwatch-test/TOKEN"));
    }

    #[test]
    #[serial]
    fn defaults_without_env() {
        env::remove_var("API_URL");
        env::remove_var("CONFIG_DIR");
        env::remove_var("DRY_RUN");
        let settings = AgentSettings::from_env().expect("valid settings");
        assert_eq!(settings.api.host(), DEFAULT_API_URL);
        assert_eq!(settings.config_dir, PathBuf::from(DEFAULT_CONFIG_DIR));
        assert!(!settings.dry_run);
    }

    #[test]
    fn token_is_trimmed_and_required() {
        let dir = tempfile::tempdir().expect("tempdir");
        let settings = AgentSettings {
            api: ApiTarget::parse("localhost").expect("valid"),
            config_dir: dir.path().to_path_buf(),
            log_level: "info".to_string(),
            dry_run: false,
        };
        assert!(matches!(
            settings.load_token(),
            Err(SettingsError::MissingCredential { .. })
        ));

        fs::write(settings.token_path(), "  \n").expect("write");
        assert!(matches!(
            settings.load_token(),
            Err(SettingsError::EmptyCredential { .. })
        ));

        fs::write(settings.token_path(), "abc123\n").expect("write");
        assert_eq!(settings.load_token().expect("token"), "abc123");
    }
}
