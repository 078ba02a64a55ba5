// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The tick loop.
//!
//! Each tick reads the live configuration. While the backend keeps the agent
//! disabled, a tick only asks for a fresh configuration and idles for
//! [`DISABLED_POLL_INTERVAL`]. Otherwise every enabled collector runs, one
//! after the other on a blocking thread, and the snapshot is handed to the
//! [`Synchronizer`] through the delivery queue.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::AgentConfig;
use crate::diagnostics::Diagnostics;
use crate::host::HostInfo;
use crate::packages::{self, PackageManager};
use crate::prober::CapabilityProber;
use crate::queue::DeliveryQueue;
use crate::registry::{CollectionRun, CollectorRegistry};
use crate::snapshot::{MetricTelemetry, Snapshot};
use crate::sync::{QueueEntry, Synchronizer};
use crate::watchdog;

/// Idle time between configuration polls while collection is disabled.
pub const DISABLED_POLL_INTERVAL: Duration = Duration::from_secs(25);
/// Lower bound of the sleep between two enabled ticks.
pub const MIN_SLEEP: Duration = Duration::from_millis(100);

const PACKAGES_SYNC_KEY: &str = "packages_sync";

enum Wake {
    Elapsed,
    Reprobe,
    Shutdown,
}

pub struct Agent {
    host: HostInfo,
    queue: Arc<DeliveryQueue<QueueEntry>>,
    synchronizer: Arc<Synchronizer>,
    registry: Arc<CollectorRegistry>,
    prober: CapabilityProber,
    shutdown: CancellationToken,
    reprobe: Arc<Notify>,
    dry_run: bool,
}

impl Agent {
    pub fn new(
        host: HostInfo,
        synchronizer: Arc<Synchronizer>,
        queue: Arc<DeliveryQueue<QueueEntry>>,
        registry: CollectorRegistry,
        prober: CapabilityProber,
    ) -> Self {
        Self {
            host,
            queue,
            synchronizer,
            registry: Arc::new(registry),
            prober,
            shutdown: CancellationToken::new(),
            reprobe: Arc::new(Notify::new()),
            dry_run: false,
        }
    }

    /// In dry-run mode package inventories are logged instead of posted.
    #[must_use]
    pub fn with_dry_run(mut self, dry_run: bool) -> Self {
        self.dry_run = dry_run;
        self
    }

    /// Cancelling this token stops [`Agent::run`] at its next wait point.
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Notifying this handle re-probes capabilities without a restart.
    pub fn reprobe_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.reprobe)
    }

    pub fn prober(&self) -> &CapabilityProber {
        &self.prober
    }

    /// Runs one tick and returns how long to wait before the next one.
    pub async fn tick(&mut self) -> Duration {
        let config = self.synchronizer.get_config().await;
        if !config.enabled {
            debug!("Collection disabled, requesting configuration");
            self.queue.put(QueueEntry::RequestConfig);
            return DISABLED_POLL_INTERVAL;
        }

        let started = Instant::now();
        let snapshot = self.collect(&config).await;
        self.queue.put(QueueEntry::Snapshot(Box::new(snapshot)));
        config
            .interval()
            .saturating_sub(started.elapsed())
            .max(MIN_SLEEP)
    }

    /// Runs every enabled collector and builds the snapshot.
    pub async fn collect(&mut self, config: &Arc<AgentConfig>) -> Snapshot {
        let ts = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0.0, |elapsed| elapsed.as_secs_f64());
        let started = Instant::now();

        self.prober.refresh_if_needed().await;
        let capabilities = self.prober.snapshot();
        let registry = Arc::clone(&self.registry);
        let collect_config = Arc::clone(config);
        let mut run = match tokio::task::spawn_blocking(move || {
            registry.collect(&collect_config, &capabilities)
        })
        .await
        {
            Ok(run) => run,
            Err(e) => {
                error!("Collection task failed: {e}");
                CollectionRun::default()
            }
        };

        if config.wants_package_scan() {
            let telemetry = self.sync_packages(config).await;
            run.telemetry.insert(PACKAGES_SYNC_KEY.to_string(), telemetry);
        }

        Snapshot::builder(self.host.clone(), ts)
            .metrics(run.metrics)
            .telemetry(run.telemetry)
            .build(started.elapsed().as_secs_f64())
    }

    async fn sync_packages(&self, config: &AgentConfig) -> MetricTelemetry {
        let started = Instant::now();
        let mut diagnostics = Diagnostics::new();
        let last_hash = config
            .packages
            .as_ref()
            .and_then(|params| params.last_package_hash.as_deref());

        match PackageManager::detect() {
            None => debug!("Packages synchronization skipped: no supported package manager"),
            Some(manager) => match manager.installed().await {
                Err(e) => diagnostics.error(format!("Failed to list installed packages: {e}")),
                Ok(installed) => {
                    if let Some(payload) =
                        packages::build_payload(packages::distro(), installed, last_hash)
                    {
                        let count = payload.packages.len();
                        if self.dry_run {
                            debug!(
                                count,
                                distro = %payload.distro,
                                hash = %payload.packages_hash,
                                "Dry run: packages not sent"
                            );
                        } else if self.synchronizer.send_packages(&payload).await.is_some() {
                            info!(count, "Packages synchronized");
                        } else {
                            diagnostics.error("Packages synchronization failed, will retry");
                        }
                    }
                }
            },
        }

        MetricTelemetry {
            duration_ms: started.elapsed().as_secs_f64() * 1000.0,
            errors: diagnostics.into_errors(),
        }
    }

    async fn wait(&self, deadline: tokio::time::Instant) -> Wake {
        tokio::select! {
            () = self.shutdown.cancelled() => Wake::Shutdown,
            () = tokio::time::sleep_until(deadline) => Wake::Elapsed,
            () = self.reprobe.notified() => Wake::Reprobe,
        }
    }

    /// Runs until the shutdown token is cancelled, then drains the
    /// synchronizer.
    pub async fn run(mut self) {
        self.prober.probe_all().await;
        self.prober.log_banner();
        let synchronizer = self.synchronizer.start();
        watchdog::ready();
        info!("Agent started");

        let shutdown = self.shutdown.clone();
        'ticks: loop {
            let pause = tokio::select! {
                () = shutdown.cancelled() => break 'ticks,
                pause = self.tick() => pause,
            };
            watchdog::heartbeat();
            let deadline = tokio::time::Instant::now() + pause;
            loop {
                match self.wait(deadline).await {
                    Wake::Elapsed => break,
                    Wake::Shutdown => break 'ticks,
                    Wake::Reprobe => {
                        tokio::select! {
                            () = shutdown.cancelled() => break 'ticks,
                            _ = self.prober.force_refresh() => {}
                        }
                    }
                }
            }
        }

        info!("Shutting down");
        self.queue.clear();
        self.synchronizer.stop();
        self.queue.put(QueueEntry::Shutdown);
        if let Err(e) = synchronizer.await {
            warn!("Synchronizer task ended abnormally: {e}");
        }
        info!("Agent stopped");
    }

    /// Fetches the configuration and runs a single collection, sending
    /// nothing.
    pub async fn dry_run(mut self) -> Snapshot {
        self.dry_run = true;
        self.prober.probe_all().await;
        self.prober.log_banner();
        let config = self.synchronizer.get_config().await;
        if !config.enabled {
            warn!("Collection is disabled by the backend");
        }
        self.collect(&config).await
    }
}
