// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Declarative table of collectors and the per-call fault isolation wrapper.
//!
//! A row ties a config gate to one or more output keys. Adding a collector
//! is adding a row. Each call is timed, and any error (or panic) is turned
//! into a null value plus an entry in that key's telemetry.

use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::time::Instant;

use serde_json::{Map, Value};
use tracing::{debug, debug_span};

use crate::collectors::{
    cpu, memory, network, ping, ports, processes, sensors, services, storage, system,
    CollectResult,
};
use crate::config::{AgentConfig, FeatureKey};
use crate::diagnostics::Diagnostics;
use crate::snapshot::MetricTelemetry;

/// A collector entry point.
#[derive(Clone, Copy)]
pub enum Collector {
    Plain(fn(&mut Diagnostics) -> CollectResult),
    /// Receives the validated configuration to read its parameters from.
    Configured(fn(&AgentConfig, &mut Diagnostics) -> CollectResult),
}

impl Collector {
    fn call(self, config: &AgentConfig, diagnostics: &mut Diagnostics) -> CollectResult {
        match self {
            Collector::Plain(f) => f(diagnostics),
            Collector::Configured(f) => f(config, diagnostics),
        }
    }
}

impl std::fmt::Debug for Collector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Collector::Plain(_) => f.write_str("Collector::Plain"),
            Collector::Configured(_) => f.write_str("Collector::Configured"),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct Output {
    pub key: &'static str,
    pub collector: Collector,
}

impl Output {
    pub const fn plain(key: &'static str, f: fn(&mut Diagnostics) -> CollectResult) -> Self {
        Self {
            key,
            collector: Collector::Plain(f),
        }
    }

    pub const fn configured(
        key: &'static str,
        f: fn(&AgentConfig, &mut Diagnostics) -> CollectResult,
    ) -> Self {
        Self {
            key,
            collector: Collector::Configured(f),
        }
    }
}

/// When a row runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    /// Every enabled tick.
    Always,
    Feature(FeatureKey),
}

#[derive(Debug, Clone)]
pub struct CollectorRow {
    pub gate: Gate,
    /// Capability the row depends on; rows whose capability probed as
    /// unavailable are skipped.
    pub capability: Option<&'static str>,
    pub outputs: Vec<Output>,
}

impl CollectorRow {
    pub fn new(gate: Gate, capability: Option<&'static str>, outputs: Vec<Output>) -> Self {
        Self {
            gate,
            capability,
            outputs,
        }
    }

    fn is_enabled(&self, config: &AgentConfig) -> bool {
        match self.gate {
            Gate::Always => true,
            Gate::Feature(key) => config.is_enabled(key),
        }
    }
}

/// Metric values and telemetry gathered during one tick.
#[derive(Debug, Default)]
pub struct CollectionRun {
    pub metrics: Map<String, Value>,
    pub telemetry: BTreeMap<String, MetricTelemetry>,
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("collector panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("collector panicked: {message}")
    } else {
        "collector panicked".to_string()
    }
}

impl CollectionRun {
    /// Runs `f` for `key`, timing it and capturing its errors. Nothing
    /// escapes: a failure stores null under `key`.
    pub fn record<F>(&mut self, key: &str, f: F)
    where
        F: FnOnce(&mut Diagnostics) -> CollectResult,
    {
        let _span = debug_span!("collector", key).entered();
        let mut diagnostics = Diagnostics::new();
        let started = Instant::now();
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| f(&mut diagnostics)));
        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;

        let value = match outcome {
            Ok(Ok(value)) => value,
            Ok(Err(e)) => {
                diagnostics.error(e.to_string());
                Value::Null
            }
            Err(payload) => {
                diagnostics.error(panic_message(payload.as_ref()));
                Value::Null
            }
        };
        debug!(duration_ms, "Collected");

        self.metrics.insert(key.to_string(), value);
        self.telemetry.insert(
            key.to_string(),
            MetricTelemetry {
                duration_ms,
                errors: diagnostics.into_errors(),
            },
        );
    }
}

#[derive(Debug, Clone)]
pub struct CollectorRegistry {
    rows: Vec<CollectorRow>,
}

impl CollectorRegistry {
    pub fn new(rows: Vec<CollectorRow>) -> Self {
        Self { rows }
    }

    /// The bundled collectors.
    pub fn builtin() -> Self {
        use FeatureKey::*;
        Self::new(vec![
            CollectorRow::new(
                Gate::Always,
                Some("load_average"),
                vec![Output::plain("load_average", system::load_average)],
            ),
            CollectorRow::new(
                Gate::Always,
                Some("file_handles"),
                vec![
                    Output::plain("file_handles_used", system::file_handles_used),
                    Output::plain("file_handles_limit", system::file_handles_limit),
                ],
            ),
            CollectorRow::new(
                Gate::Feature(Cpu),
                Some("cpu"),
                vec![
                    Output::plain("cpu", cpu::cpu),
                    Output::plain("cpu_usage", cpu::cpu_usage),
                    Output::plain("cpu_model", cpu::cpu_model),
                    Output::plain("cpu_count", cpu::cpu_count),
                ],
            ),
            CollectorRow::new(
                Gate::Feature(Memory),
                Some("memory"),
                vec![
                    Output::plain("memory", memory::memory),
                    Output::plain("swap", memory::swap),
                ],
            ),
            CollectorRow::new(
                Gate::Feature(Network),
                Some("network"),
                vec![Output::plain("network", network::network)],
            ),
            CollectorRow::new(
                Gate::Feature(Partitions),
                Some("partitions"),
                vec![
                    Output::plain("partitions_metadata", storage::partitions_metadata),
                    Output::plain("partitions_usage", storage::partitions_usage),
                ],
            ),
            CollectorRow::new(
                Gate::Feature(Io),
                Some("io"),
                vec![Output::plain("io", storage::io)],
            ),
            CollectorRow::new(
                Gate::Feature(Processes),
                Some("processes"),
                vec![Output::plain("processes", processes::processes)],
            ),
            CollectorRow::new(
                Gate::Feature(Ports),
                Some("ports"),
                vec![Output::configured("ports", ports::listening_ports)],
            ),
            CollectorRow::new(
                Gate::Feature(Temperatures),
                Some("temperatures"),
                vec![Output::plain("temperatures", sensors::temperatures)],
            ),
            CollectorRow::new(
                Gate::Feature(Fans),
                Some("fans"),
                vec![Output::plain("fans", sensors::fans)],
            ),
            CollectorRow::new(
                Gate::Feature(Redis),
                None,
                vec![Output::configured("redis", services::redis)],
            ),
            CollectorRow::new(
                Gate::Feature(Nginx),
                None,
                vec![Output::configured("nginx", services::nginx)],
            ),
        ])
    }

    pub fn rows(&self) -> &[CollectorRow] {
        &self.rows
    }

    /// Runs every enabled row in table order, then one `ping_<region>` per
    /// configured ping target. Blocking; call from a blocking thread.
    pub fn collect(
        &self,
        config: &AgentConfig,
        capabilities: &BTreeMap<String, bool>,
    ) -> CollectionRun {
        let mut run = CollectionRun::default();
        for row in &self.rows {
            if !row.is_enabled(config) {
                continue;
            }
            if let Some(capability) = row.capability {
                if capabilities.get(capability) == Some(&false) {
                    debug!(capability, "Skipping collector, capability unavailable");
                    continue;
                }
            }
            for output in &row.outputs {
                let collector = output.collector;
                run.record(output.key, |diagnostics| collector.call(config, diagnostics));
            }
        }

        if let Some(targets) = &config.ping {
            for (region, host) in targets {
                run.record(&format!("ping_{region}"), |diagnostics| {
                    ping::ping(host, diagnostics)
                });
            }
        }
        run
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collectors::CollectorError;
    use serde_json::json;

    fn ok(_: &mut Diagnostics) -> CollectResult {
        Ok(json!(42))
    }

    fn failing(_: &mut Diagnostics) -> CollectResult {
        Err(CollectorError::Unavailable("sensor offline".to_string()))
    }

    fn panicking(_: &mut Diagnostics) -> CollectResult {
        panic!("index out of bounds")
    }

    fn reports_and_succeeds(diagnostics: &mut Diagnostics) -> CollectResult {
        diagnostics.error("one disk unreadable");
        Ok(json!([]))
    }

    fn uses_interval(config: &AgentConfig, _: &mut Diagnostics) -> CollectResult {
        Ok(json!(config.interval))
    }

    fn enabled_with(flags: &[FeatureKey]) -> AgentConfig {
        let mut config = AgentConfig::default();
        config.enabled = true;
        for flag in flags {
            config.flags.insert(*flag, true);
        }
        config
    }

    #[test]
    fn failing_collector_is_isolated() {
        let registry = CollectorRegistry::new(vec![CollectorRow::new(
            Gate::Always,
            None,
            vec![
                Output::plain("before", ok),
                Output::plain("broken", failing),
                Output::plain("after", ok),
            ],
        )]);
        let run = registry.collect(&enabled_with(&[]), &BTreeMap::new());

        assert_eq!(run.metrics["before"], json!(42));
        assert_eq!(run.metrics["broken"], Value::Null);
        assert_eq!(run.metrics["after"], json!(42));
        assert_eq!(run.telemetry["broken"].errors, ["sensor offline"]);
        assert!(run.telemetry["after"].errors.is_empty());
    }

    #[test]
    fn panicking_collector_is_isolated() {
        let registry = CollectorRegistry::new(vec![CollectorRow::new(
            Gate::Always,
            None,
            vec![Output::plain("boom", panicking), Output::plain("fine", ok)],
        )]);
        let run = registry.collect(&enabled_with(&[]), &BTreeMap::new());
        assert_eq!(run.metrics["boom"], Value::Null);
        assert!(run.telemetry["boom"].errors[0].contains("index out of bounds"));
        assert_eq!(run.metrics["fine"], json!(42));
    }

    #[test]
    fn diagnostics_reach_telemetry_without_nulling_value() {
        let mut run = CollectionRun::default();
        run.record("partitions_usage", reports_and_succeeds);
        assert_eq!(run.metrics["partitions_usage"], json!([]));
        assert_eq!(run.telemetry["partitions_usage"].errors, ["one disk unreadable"]);
        assert!(run.telemetry["partitions_usage"].duration_ms >= 0.0);
    }

    #[test]
    fn gates_and_capabilities_select_rows() {
        let registry = CollectorRegistry::new(vec![
            CollectorRow::new(
                Gate::Feature(FeatureKey::Cpu),
                Some("cpu"),
                vec![Output::plain("cpu", ok)],
            ),
            CollectorRow::new(
                Gate::Feature(FeatureKey::Memory),
                None,
                vec![Output::plain("memory", ok)],
            ),
            CollectorRow::new(
                Gate::Feature(FeatureKey::Fans),
                Some("fans"),
                vec![Output::plain("fans", ok)],
            ),
            CollectorRow::new(
                Gate::Always,
                None,
                vec![Output::configured("interval", uses_interval)],
            ),
        ]);
        let config = enabled_with(&[FeatureKey::Cpu, FeatureKey::Fans]);
        let capabilities = BTreeMap::from([("fans".to_string(), false)]);
        let run = registry.collect(&config, &capabilities);

        // Unknown capabilities do not block a row.
        assert!(run.metrics.contains_key("cpu"));
        assert!(!run.metrics.contains_key("memory"));
        assert!(!run.metrics.contains_key("fans"));
        assert_eq!(run.metrics["interval"], json!(60));
    }

    #[test]
    fn ping_targets_get_their_own_keys() {
        let registry = CollectorRegistry::new(Vec::new());
        let mut config = enabled_with(&[]);
        config.ping = Some(BTreeMap::from([("eu".to_string(), "host.invalid".to_string())]));
        let run = registry.collect(&config, &BTreeMap::new());
        assert_eq!(run.metrics["ping_eu"], Value::Null);
        assert!(run.telemetry.contains_key("ping_eu"));
    }

    #[test]
    fn builtin_table_covers_core_metrics() {
        let registry = CollectorRegistry::builtin();
        let always: Vec<&str> = registry
            .rows()
            .iter()
            .filter(|row| row.gate == Gate::Always)
            .flat_map(|row| row.outputs.iter().map(|o| o.key))
            .collect();
        assert_eq!(always, ["load_average", "file_handles_used", "file_handles_limit"]);
    }
}
