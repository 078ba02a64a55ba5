// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Service manager notifications.
//!
//! When the agent runs under systemd with `NOTIFY_SOCKET` set, it reports
//! `READY=1` once capabilities are known and `WATCHDOG=1` on every tick.
//! Without the variable both calls do nothing.

use sd_notify::NotifyState;
use tracing::debug;

fn notify(state: NotifyState<'_>) {
    if let Err(e) = sd_notify::notify(false, &[state]) {
        debug!("Service manager notification failed: {e}");
    }
}

/// Startup finished.
pub fn ready() {
    notify(NotifyState::Ready);
}

/// Keeps the service manager's watchdog from firing.
pub fn heartbeat() {
    notify(NotifyState::Watchdog);
}
