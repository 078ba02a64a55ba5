// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

use std::process::ExitCode;
use std::sync::Arc;

use anyhow::{anyhow, Context};
use clap::Parser;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use hostwatch_agent::{
    agent::Agent,
    host::HostInfo,
    logger::Formatter,
    prober::{CapabilityProber, SystemInspector},
    queue::{DeliveryQueue, DEFAULT_CAPACITY},
    registry::CollectorRegistry,
    settings::AgentSettings,
    signals::spawn_signal_handler,
    sync::{HttpsTransport, Synchronizer},
    VERSION,
};

/// Exit code when the credential file is missing or unusable.
const EXIT_MISSING_CREDENTIAL: u8 = 2;

#[derive(Debug, Parser)]
#[command(name = "hostwatch", version, about = "Host telemetry agent")]
struct Cli {
    /// Collect once, print the snapshot as JSON and exit without sending it.
    #[arg(long)]
    dry_run: bool,
}

fn init_logging(settings: &AgentSettings) -> anyhow::Result<()> {
    let level = if settings.dry_run {
        "debug"
    } else {
        settings.log_level.as_str()
    };
    let env_filter =
        format!("hyper=off,rustls=off,hickory_proto=off,hickory_resolver=warn,{level}");
    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_env_filter(
            EnvFilter::try_new(env_filter).context("could not parse LOG_LEVEL")?,
        )
        .with_writer(std::io::stderr)
        .event_format(Formatter)
        .finish();
    tracing::subscriber::set_global_default(subscriber)
        .context("setting default subscriber failed")?;
    debug!("Logging subsystem enabled");
    Ok(())
}

async fn run(settings: AgentSettings, token: String) -> anyhow::Result<()> {
    info!(
        version = VERSION,
        api = settings.api.authority(),
        dry_run = settings.dry_run,
        "Starting hostwatch"
    );

    hostwatch_tls::prepare_client_provider()
        .map_err(|e| anyhow!("failed to prepare TLS provider: {e}"))?;
    let tls = hostwatch_tls::create_tls_client_config()
        .map_err(|e| anyhow!("failed to build TLS configuration: {e}"))?;
    let transport = Arc::new(HttpsTransport::new(settings.api.clone(), tls));
    let queue = Arc::new(DeliveryQueue::new(DEFAULT_CAPACITY));
    let synchronizer = Arc::new(Synchronizer::new(transport, token, Arc::clone(&queue)));
    let prober = CapabilityProber::new(Arc::new(SystemInspector));
    let agent = Agent::new(
        HostInfo::detect(),
        synchronizer,
        queue,
        CollectorRegistry::builtin(),
        prober,
    )
    .with_dry_run(settings.dry_run);

    if settings.dry_run {
        let snapshot = agent.dry_run().await;
        let rendered =
            serde_json::to_string_pretty(&snapshot).context("failed to render snapshot")?;
        println!("{rendered}");
        return Ok(());
    }

    let signals = spawn_signal_handler(agent.shutdown_token(), agent.reprobe_handle())
        .context("failed to install signal handlers")?;
    agent.run().await;
    signals.abort();
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let mut settings = match AgentSettings::from_env() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("hostwatch: {e}");
            return ExitCode::FAILURE;
        }
    };
    settings.dry_run |= cli.dry_run;

    if let Err(e) = init_logging(&settings) {
        eprintln!("hostwatch: {e:#}");
        return ExitCode::FAILURE;
    }

    let token = match settings.load_token() {
        Ok(token) => token,
        Err(e) => {
            error!("{e}");
            return ExitCode::from(EXIT_MISSING_CREDENTIAL);
        }
    };

    match run(settings, token).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
