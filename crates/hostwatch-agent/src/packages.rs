// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Installed package inventory for the backend's vulnerability scanning.
//!
//! The inventory is only posted when its hash differs from the one the
//! backend last acknowledged (`packages.last_package_hash`).

use std::fs;
use std::time::Duration;

use serde::Serialize;
use sha2::{Digest, Sha256};
use tracing::debug;

use crate::subprocess;

/// Package managers in detection order.
pub const PACKAGE_MANAGERS: [&str; 5] = ["dpkg-query", "rpm", "apk", "pacman", "synopkg"];

const LIST_TIMEOUT: Duration = Duration::from_secs(30);
const OS_RELEASE: &str = "/etc/os-release";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize)]
pub struct Package {
    pub name: String,
    pub version: String,
}

impl Package {
    fn new(name: &str, version: &str) -> Self {
        Self {
            name: name.to_string(),
            version: version.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PackagesPayload {
    pub distro: String,
    pub packages_hash: String,
    pub packages: Vec<Package>,
}

#[derive(Debug, thiserror::Error)]
pub enum PackagesError {
    #[error(transparent)]
    Command(#[from] subprocess::CommandError),

    #[error("{manager} exited with {status}: {stderr}")]
    Failed {
        manager: &'static str,
        status: std::process::ExitStatus,
        stderr: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PackageManager {
    Dpkg,
    Rpm,
    Apk,
    Pacman,
    Synopkg,
}

impl PackageManager {
    pub fn detect() -> Option<Self> {
        PACKAGE_MANAGERS
            .iter()
            .position(|cmd| which::which(cmd).is_ok())
            .map(|i| match i {
                0 => PackageManager::Dpkg,
                1 => PackageManager::Rpm,
                2 => PackageManager::Apk,
                3 => PackageManager::Pacman,
                _ => PackageManager::Synopkg,
            })
    }

    pub const fn program(self) -> &'static str {
        match self {
            PackageManager::Dpkg => "dpkg-query",
            PackageManager::Rpm => "rpm",
            PackageManager::Apk => "apk",
            PackageManager::Pacman => "pacman",
            PackageManager::Synopkg => "synopkg",
        }
    }

    const fn args(self) -> &'static [&'static str] {
        match self {
            PackageManager::Dpkg => &["-W", "-f", "${Package}\t${Version}\n"],
            PackageManager::Rpm => &["-qa", "--queryformat", "%{NAME}\t%{VERSION}-%{RELEASE}\n"],
            PackageManager::Apk => &["list", "--installed"],
            PackageManager::Pacman => &["-Q"],
            PackageManager::Synopkg => &["list"],
        }
    }

    /// Parses the listing printed by [`Self::program`].
    pub fn parse(self, output: &str) -> Vec<Package> {
        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match self {
                PackageManager::Dpkg | PackageManager::Rpm => line
                    .split_once('\t')
                    .map(|(name, version)| Package::new(name, version)),
                PackageManager::Pacman => line
                    .split_once(' ')
                    .map(|(name, version)| Package::new(name, version)),
                PackageManager::Apk => parse_apk_line(line),
                PackageManager::Synopkg => {
                    let mut parts = line.split_whitespace();
                    match (parts.next(), parts.next()) {
                        (Some(name), Some(version)) => Some(Package::new(name, version)),
                        _ => None,
                    }
                }
            })
            .collect()
    }

    /// Lists installed packages sorted by name.
    pub async fn installed(self) -> Result<Vec<Package>, PackagesError> {
        let output = subprocess::output(self.program(), self.args(), LIST_TIMEOUT).await?;
        if !output.status.success() {
            return Err(PackagesError::Failed {
                manager: self.program(),
                status: output.status,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        let mut packages = self.parse(&String::from_utf8_lossy(&output.stdout));
        packages.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(packages)
    }
}

/// `name-version-release arch {origin} (license)`; the last two hyphens
/// separate the version.
fn parse_apk_line(line: &str) -> Option<Package> {
    let id = line.split(' ').next()?;
    let mut segments = id.rsplitn(3, '-');
    let last = segments.next()?;
    let middle = segments.next();
    let first = segments.next();
    match (first, middle) {
        (Some(name), Some(version)) => Some(Package::new(name, &format!("{version}-{last}"))),
        (None, Some(name)) => Some(Package::new(name, last)),
        _ => None,
    }
}

/// Hex SHA-256 over `name=version\n` lines, in list order.
pub fn packages_hash(packages: &[Package]) -> String {
    let mut hasher = Sha256::new();
    for package in packages {
        hasher.update(package.name.as_bytes());
        hasher.update(b"=");
        hasher.update(package.version.as_bytes());
        hasher.update(b"\n");
    }
    hasher
        .finalize()
        .iter()
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// `id:version_id` from os-release content, `unknown` without an `ID`.
pub fn parse_distro(os_release: &str) -> String {
    let field = |key: &str| {
        os_release.lines().find_map(|line| {
            line.strip_prefix(key)
                .and_then(|rest| rest.strip_prefix('='))
                .map(|value| value.trim().trim_matches('"').to_lowercase())
        })
    };
    match (field("ID"), field("VERSION_ID")) {
        (Some(id), Some(version)) if !id.is_empty() && !version.is_empty() => {
            format!("{id}:{version}")
        }
        (Some(id), _) if !id.is_empty() => id,
        _ => "unknown".to_string(),
    }
}

pub fn distro() -> String {
    match fs::read_to_string(OS_RELEASE) {
        Ok(content) => parse_distro(&content),
        Err(e) => {
            debug!("Failed to read {OS_RELEASE}: {e}");
            "unknown".to_string()
        }
    }
}

/// Builds the payload to post, or `None` when there is nothing new to send.
pub fn build_payload(
    distro: String,
    packages: Vec<Package>,
    last_hash: Option<&str>,
) -> Option<PackagesPayload> {
    if packages.is_empty() {
        debug!("Packages synchronization: no packages found");
        return None;
    }
    let packages_hash = packages_hash(&packages);
    if last_hash == Some(packages_hash.as_str()) {
        debug!("Packages synchronization: packages unchanged, skipping");
        return None;
    }
    Some(PackagesPayload {
        distro,
        packages_hash,
        packages,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_dpkg_listing() {
        let packages = PackageManager::Dpkg.parse("bash\t5.2-1\ncoreutils\t9.1-1\nbroken line\n");
        assert_eq!(
            packages,
            vec![Package::new("bash", "5.2-1"), Package::new("coreutils", "9.1-1")]
        );
    }

    #[test]
    fn parses_apk_listing() {
        let packages = PackageManager::Apk.parse(
            "musl-1.2.4-r2 x86_64 {musl} (MIT)\n\
             busybox-binsh-1.36.1-r5 x86_64 {busybox} (GPL-2.0-only)\n",
        );
        assert_eq!(
            packages,
            vec![
                Package::new("musl", "1.2.4-r2"),
                Package::new("busybox-binsh", "1.36.1-r5")
            ]
        );
    }

    #[test]
    fn parses_pacman_and_synopkg() {
        assert_eq!(
            PackageManager::Pacman.parse("linux 6.6.1.arch1-1\n"),
            vec![Package::new("linux", "6.6.1.arch1-1")]
        );
        assert_eq!(
            PackageManager::Synopkg.parse("Docker 20.10.3-1308 Container manager\n"),
            vec![Package::new("Docker", "20.10.3-1308")]
        );
    }

    #[test]
    fn hash_matches_line_format() {
        let packages = vec![Package::new("a", "1"), Package::new("b", "2")];
        let expected: String = Sha256::digest(b"a=1\nb=2\n")
            .iter()
            .map(|byte| format!("{byte:02x}"))
            .collect();
        assert_eq!(packages_hash(&packages), expected);
        assert_eq!(packages_hash(&[]).len(), 64);
    }

    #[test]
    fn distro_from_os_release() {
        let content = "NAME=\"Debian GNU/Linux\"\nID=debian\nVERSION_ID=\"12\"\n";
        assert_eq!(parse_distro(content), "debian:12");
        assert_eq!(parse_distro("ID=Arch\n"), "arch");
        assert_eq!(parse_distro("NAME=foo\n"), "unknown");
        // ID_LIKE must not be mistaken for ID.
        assert_eq!(parse_distro("ID_LIKE=debian\n"), "unknown");
    }

    #[test]
    fn unchanged_inventory_is_skipped() {
        let packages = vec![Package::new("a", "1")];
        let hash = packages_hash(&packages);
        assert!(build_payload("debian:12".into(), packages.clone(), Some(&hash)).is_none());
        let payload = build_payload("debian:12".into(), packages, Some("stale")).expect("changed");
        assert_eq!(payload.packages_hash, hash);
        assert!(build_payload("debian:12".into(), Vec::new(), None).is_none());
    }
}
