// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

#![cfg_attr(not(test), deny(clippy::panic))]
#![cfg_attr(not(test), deny(clippy::unwrap_used))]
#![cfg_attr(not(test), deny(clippy::expect_used))]
#![cfg_attr(not(test), deny(clippy::todo))]
#![cfg_attr(not(test), deny(clippy::unimplemented))]

//! Host telemetry agent.
//!
//! The agent periodically samples host metrics, buffers the resulting
//! snapshots in a bounded queue and ships them to the backend, which answers
//! every delivery with the configuration the agent must run with next.

pub mod agent;
pub mod collectors;
pub mod config;
pub mod diagnostics;
pub mod host;
pub mod logger;
pub mod packages;
pub mod prober;
pub mod queue;
pub mod registry;
pub mod settings;
pub mod signals;
pub mod snapshot;
pub mod subprocess;
pub mod sync;
pub mod watchdog;

/// Agent version reported in every snapshot and at startup.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
