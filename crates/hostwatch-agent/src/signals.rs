// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Process signals: SIGTERM, SIGINT and SIGHUP request shutdown, SIGUSR1
//! asks for an immediate capability re-probe.

use std::io;
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Installs the handlers and spawns the task serving them. The task ends
/// once `shutdown` is cancelled, by a signal or otherwise.
pub fn spawn_signal_handler(
    shutdown: CancellationToken,
    reprobe: Arc<Notify>,
) -> io::Result<JoinHandle<()>> {
    let mut terminate = signal(SignalKind::terminate())?;
    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut hangup = signal(SignalKind::hangup())?;
    let mut user1 = signal(SignalKind::user_defined1())?;

    Ok(tokio::spawn(async move {
        loop {
            let name = tokio::select! {
                () = shutdown.cancelled() => return,
                _ = terminate.recv() => "SIGTERM",
                _ = interrupt.recv() => "SIGINT",
                _ = hangup.recv() => "SIGHUP",
                _ = user1.recv() => {
                    info!("Received SIGUSR1, scheduling capability re-probe");
                    reprobe.notify_one();
                    continue;
                }
            };
            info!("Received {name}, shutting down");
            shutdown.cancel();
            return;
        }
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use nix::sys::signal::{raise, Signal};
    use serial_test::serial;
    use std::time::Duration;

    #[tokio::test]
    #[serial]
    async fn sigusr1_requests_reprobe() {
        let shutdown = CancellationToken::new();
        let reprobe = Arc::new(Notify::new());
        let handle = spawn_signal_handler(shutdown.clone(), Arc::clone(&reprobe)).expect("install");

        raise(Signal::SIGUSR1).expect("raise");
        tokio::time::timeout(Duration::from_secs(5), reprobe.notified())
            .await
            .expect("re-probe requested");
        assert!(!shutdown.is_cancelled());

        shutdown.cancel();
        handle.await.expect("handler exits");
    }

    #[tokio::test]
    #[serial]
    async fn sigterm_cancels_shutdown_token() {
        let shutdown = CancellationToken::new();
        let handle =
            spawn_signal_handler(shutdown.clone(), Arc::new(Notify::new())).expect("install");

        raise(Signal::SIGTERM).expect("raise");
        tokio::time::timeout(Duration::from_secs(5), shutdown.cancelled())
            .await
            .expect("shutdown requested");
        handle.await.expect("handler exits");
    }
}
