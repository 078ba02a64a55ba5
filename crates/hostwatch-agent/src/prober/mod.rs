// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Detection of the optional features the current permissions allow.
//!
//! Every check is read-only and bounded: filesystem access tests, `which`
//! lookups and short non-interactive commands (`sudo -n`). Results live in a
//! [`CapabilitySet`] owned by the [`CapabilityProber`], which is re-evaluated
//! every [`REPROBE_INTERVAL`] or on demand.

pub mod inspector;

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio::time::Instant;
use tracing::{debug, info};

pub use inspector::{CommandOutcome, Inspector, SystemInspector};

use crate::collectors::sensors::HWMON_ROOT;
use crate::packages::PACKAGE_MANAGERS;

pub const REPROBE_INTERVAL: Duration = Duration::from_secs(300);
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(5);

const DOCKER_SOCKET: &str = "/var/run/docker.sock";
const LIBVIRT_SOCKET: &str = "/var/run/libvirt/libvirt-sock";
const PVE_DIR: &str = "/etc/pve";
const NVML_LIBRARIES: [&str; 4] = [
    "/usr/lib/x86_64-linux-gnu/libnvidia-ml.so.1",
    "/usr/lib/aarch64-linux-gnu/libnvidia-ml.so.1",
    "/usr/lib64/libnvidia-ml.so.1",
    "/usr/lib/libnvidia-ml.so.1",
];

/// A single side-effect-free test.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Check {
    /// Every path is readable.
    Readable(&'static [&'static str]),
    /// Some `<hwmon>/<prefix>*_input` file is readable.
    Hwmon(&'static str),
    /// `sudo -n <args>` exits successfully.
    Sudo(&'static [&'static str]),
    /// `zpool list -H` succeeds or reports that no pool exists.
    Zpool,
    /// The unix socket can be opened for reading, and writing if asked.
    Socket { path: &'static str, write: bool },
    /// The directory exists or the program is on `PATH`.
    DirOrProgram {
        dir: &'static str,
        program: &'static str,
    },
    /// Any program is on `PATH` or any file is readable.
    AnyOf {
        programs: &'static [&'static str],
        files: &'static [&'static str],
    },
}

/// The battery run on every probe, keyed by capability name.
pub fn default_checks() -> Vec<(&'static str, Check)> {
    vec![
        ("cpu", Check::Readable(&["/proc/stat", "/proc/cpuinfo"])),
        ("memory", Check::Readable(&["/proc/meminfo"])),
        ("load_average", Check::Readable(&["/proc/loadavg"])),
        ("io", Check::Readable(&["/proc/diskstats"])),
        ("network", Check::Readable(&["/proc/net/dev"])),
        ("partitions", Check::Readable(&["/proc/mounts"])),
        ("file_handles", Check::Readable(&["/proc/sys/fs/file-nr"])),
        ("ports", Check::Readable(&["/proc/net/tcp"])),
        ("processes", Check::Readable(&["/proc/self/status"])),
        ("temperatures", Check::Hwmon("temp")),
        ("fans", Check::Hwmon("fan")),
        ("smart_storage", Check::Sudo(&["smartctl", "--version"])),
        ("raid_storage", Check::Sudo(&["mdadm", "--version"])),
        ("fail2ban", Check::Sudo(&["fail2ban-client", "status"])),
        ("zfs", Check::Zpool),
        (
            "docker",
            Check::Socket {
                path: DOCKER_SOCKET,
                write: true,
            },
        ),
        (
            "qemu",
            Check::Socket {
                path: LIBVIRT_SOCKET,
                write: false,
            },
        ),
        (
            "proxmox",
            Check::DirOrProgram {
                dir: PVE_DIR,
                program: "pvesh",
            },
        ),
        (
            "packages",
            Check::AnyOf {
                programs: &PACKAGE_MANAGERS,
                files: &[],
            },
        ),
        (
            "gpu",
            Check::AnyOf {
                programs: &["nvidia-smi"],
                files: &NVML_LIBRARIES,
            },
        ),
    ]
}

async fn evaluate(inspector: &dyn Inspector, check: &Check) -> bool {
    match check {
        Check::Readable(paths) => paths
            .iter()
            .all(|path| inspector.accessible(Path::new(path), false)),
        Check::Hwmon(prefix) => inspector
            .read_dir(Path::new(HWMON_ROOT))
            .iter()
            .flat_map(|chip| inspector.read_dir(chip))
            .any(|file| {
                let name = file.file_name().and_then(|n| n.to_str()).unwrap_or_default();
                name.starts_with(prefix)
                    && name.ends_with("_input")
                    && inspector.accessible(&file, false)
            }),
        Check::Sudo(args) => {
            let mut sudo_args = vec!["-n"];
            sudo_args.extend_from_slice(args);
            inspector
                .run("sudo", &sudo_args, PROBE_TIMEOUT)
                .await
                .is_some_and(|outcome| outcome.success)
        }
        Check::Zpool => inspector
            .run("zpool", &["list", "-H"], PROBE_TIMEOUT)
            .await
            .is_some_and(|outcome| {
                outcome.success || outcome.stderr.contains("no pools available")
            }),
        Check::Socket { path, write } => inspector.accessible(Path::new(path), *write),
        Check::DirOrProgram { dir, program } => {
            inspector.is_dir(Path::new(dir)) || inspector.on_path(program)
        }
        Check::AnyOf { programs, files } => {
            programs.iter().any(|program| inspector.on_path(program))
                || files
                    .iter()
                    .any(|file| inspector.accessible(Path::new(file), false))
        }
    }
}

/// Capability name to availability, plus when it was last evaluated.
#[derive(Debug, Clone, Default)]
pub struct CapabilitySet {
    entries: BTreeMap<String, bool>,
    last_probed: Option<Instant>,
}

impl CapabilitySet {
    pub fn get(&self, name: &str) -> Option<bool> {
        self.entries.get(name).copied()
    }

    pub fn last_probed(&self) -> Option<Instant> {
        self.last_probed
    }

    pub fn entries(&self) -> &BTreeMap<String, bool> {
        &self.entries
    }
}

/// A capability whose availability flipped between two probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityChange {
    pub name: String,
    pub available: bool,
}

pub struct CapabilityProber {
    inspector: Arc<dyn Inspector>,
    checks: Vec<(&'static str, Check)>,
    set: CapabilitySet,
    ttl: Duration,
}

impl CapabilityProber {
    pub fn new(inspector: Arc<dyn Inspector>) -> Self {
        Self::with_checks(inspector, default_checks(), REPROBE_INTERVAL)
    }

    pub fn with_checks(
        inspector: Arc<dyn Inspector>,
        checks: Vec<(&'static str, Check)>,
        ttl: Duration,
    ) -> Self {
        Self {
            inspector,
            checks,
            set: CapabilitySet::default(),
            ttl,
        }
    }

    /// Re-evaluates every check and returns the capabilities that changed
    /// since the previous probe. The first probe reports no changes.
    pub async fn probe_all(&mut self) -> Vec<CapabilityChange> {
        let first = self.set.last_probed.is_none();
        let mut changes = Vec::new();
        for (name, check) in &self.checks {
            let available = evaluate(self.inspector.as_ref(), check).await;
            let previous = self.set.entries.insert((*name).to_string(), available);
            if !first && previous != Some(available) {
                if available {
                    info!(capability = name, "Capability gained");
                } else {
                    info!(capability = name, "Capability lost");
                }
                changes.push(CapabilityChange {
                    name: (*name).to_string(),
                    available,
                });
            }
        }
        self.set.last_probed = Some(Instant::now());
        debug!(changed = changes.len(), "Capabilities probed");
        changes
    }

    /// Probes when never probed or once the TTL has elapsed.
    pub async fn refresh_if_needed(&mut self) -> Vec<CapabilityChange> {
        match self.set.last_probed {
            Some(at) if at.elapsed() < self.ttl => Vec::new(),
            _ => self.probe_all().await,
        }
    }

    pub async fn force_refresh(&mut self) -> Vec<CapabilityChange> {
        info!("Re-probing capabilities");
        self.probe_all().await
    }

    /// `None` for names outside the battery.
    pub fn get(&self, name: &str) -> Option<bool> {
        self.set.get(name)
    }

    pub fn capabilities(&self) -> &CapabilitySet {
        &self.set
    }

    pub fn snapshot(&self) -> BTreeMap<String, bool> {
        self.set.entries.clone()
    }

    pub fn available(&self) -> Vec<&str> {
        self.filtered(true)
    }

    pub fn unavailable(&self) -> Vec<&str> {
        self.filtered(false)
    }

    fn filtered(&self, wanted: bool) -> Vec<&str> {
        self.set
            .entries
            .iter()
            .filter(|(_, available)| **available == wanted)
            .map(|(name, _)| name.as_str())
            .collect()
    }

    /// Startup summary of the probe results.
    pub fn log_banner(&self) {
        info!(available = %self.available().join(", "), "Capabilities available");
        let unavailable = self.unavailable();
        if !unavailable.is_empty() {
            info!(unavailable = %unavailable.join(", "), "Capabilities unavailable");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::BTreeSet;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;
    use tracing_test::traced_test;

    #[derive(Default)]
    struct FakeInspector {
        readable: Mutex<BTreeSet<PathBuf>>,
        dirs: BTreeMap<PathBuf, Vec<PathBuf>>,
        programs: BTreeSet<String>,
        commands: BTreeMap<String, CommandOutcome>,
        runs: AtomicUsize,
    }

    impl FakeInspector {
        fn grant(&self, path: &str) {
            self.readable.lock().expect("lock").insert(PathBuf::from(path));
        }

        fn revoke(&self, path: &str) {
            self.readable.lock().expect("lock").remove(Path::new(path));
        }
    }

    #[async_trait]
    impl Inspector for FakeInspector {
        fn is_dir(&self, path: &Path) -> bool {
            self.dirs.contains_key(path)
        }

        fn accessible(&self, path: &Path, _: bool) -> bool {
            self.readable.lock().expect("lock").contains(path)
        }

        fn read_dir(&self, path: &Path) -> Vec<PathBuf> {
            self.dirs.get(path).cloned().unwrap_or_default()
        }

        fn on_path(&self, program: &str) -> bool {
            self.programs.contains(program)
        }

        async fn run(&self, program: &str, args: &[&str], _: Duration) -> Option<CommandOutcome> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let key = std::iter::once(program)
                .chain(args.iter().copied())
                .collect::<Vec<_>>()
                .join(" ");
            self.commands.get(&key).cloned()
        }
    }

    fn prober(inspector: Arc<FakeInspector>) -> CapabilityProber {
        CapabilityProber::with_checks(inspector, default_checks(), REPROBE_INTERVAL)
    }

    #[tokio::test]
    async fn evaluates_the_battery() {
        let mut fake = FakeInspector::default();
        fake.dirs.insert(
            PathBuf::from(HWMON_ROOT),
            vec![PathBuf::from("/sys/class/hwmon/hwmon0")],
        );
        fake.dirs.insert(
            PathBuf::from("/sys/class/hwmon/hwmon0"),
            vec![PathBuf::from("/sys/class/hwmon/hwmon0/temp1_input")],
        );
        fake.programs.insert("dpkg-query".to_string());
        fake.commands.insert(
            "sudo -n smartctl --version".to_string(),
            CommandOutcome {
                success: true,
                ..CommandOutcome::default()
            },
        );
        fake.commands.insert(
            "zpool list -H".to_string(),
            CommandOutcome {
                success: false,
                stderr: "no pools available\n".to_string(),
                ..CommandOutcome::default()
            },
        );
        let fake = Arc::new(fake);
        fake.grant("/proc/stat");
        fake.grant("/proc/cpuinfo");
        fake.grant("/sys/class/hwmon/hwmon0/temp1_input");

        let mut prober = prober(fake);
        assert!(prober.probe_all().await.is_empty());
        assert_eq!(prober.get("cpu"), Some(true));
        assert_eq!(prober.get("memory"), Some(false));
        assert_eq!(prober.get("temperatures"), Some(true));
        assert_eq!(prober.get("fans"), Some(false));
        assert_eq!(prober.get("smart_storage"), Some(true));
        assert_eq!(prober.get("raid_storage"), Some(false));
        assert_eq!(prober.get("zfs"), Some(true));
        assert_eq!(prober.get("packages"), Some(true));
        assert_eq!(prober.get("docker"), Some(false));
        assert_eq!(prober.get("unknown"), None);
        assert_eq!(
            prober.available().len() + prober.unavailable().len(),
            default_checks().len()
        );
    }

    #[tokio::test]
    #[traced_test]
    async fn reports_gained_and_lost_capabilities() {
        let fake = Arc::new(FakeInspector::default());
        fake.grant("/proc/meminfo");
        let mut prober = prober(Arc::clone(&fake));
        prober.probe_all().await;

        fake.revoke("/proc/meminfo");
        fake.grant("/proc/loadavg");
        let changes = prober.force_refresh().await;
        assert_eq!(
            changes,
            vec![
                CapabilityChange {
                    name: "memory".to_string(),
                    available: false
                },
                CapabilityChange {
                    name: "load_average".to_string(),
                    available: true
                },
            ]
        );
        assert!(logs_contain("Capability lost"));
        assert!(logs_contain("Capability gained"));
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_respects_ttl() {
        let fake = Arc::new(FakeInspector::default());
        let mut prober = prober(Arc::clone(&fake));
        prober.refresh_if_needed().await;
        let runs = fake.runs.load(Ordering::SeqCst);
        assert!(runs > 0);

        tokio::time::advance(Duration::from_secs(10)).await;
        prober.refresh_if_needed().await;
        assert_eq!(fake.runs.load(Ordering::SeqCst), runs);

        tokio::time::advance(REPROBE_INTERVAL).await;
        prober.refresh_if_needed().await;
        assert_eq!(fake.runs.load(Ordering::SeqCst), runs * 2);

        prober.force_refresh().await;
        assert_eq!(fake.runs.load(Ordering::SeqCst), runs * 3);
    }
}
