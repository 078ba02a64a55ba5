// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! The unit of data shipped to `/collect`.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};

use crate::host::HostInfo;

/// Timing and error report for one metric key.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MetricTelemetry {
    pub duration_ms: f64,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// One collection tick. Immutable once built.
///
/// Serializes as a flat object: host info and metric keys at the top level
/// next to `ts`, `running_time` and `telemetry`.
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    #[serde(flatten)]
    host: HostInfo,
    #[serde(flatten)]
    metrics: Map<String, Value>,
    ts: f64,
    running_time: f64,
    telemetry: BTreeMap<String, MetricTelemetry>,
}

impl Snapshot {
    pub fn builder(host: HostInfo, ts: f64) -> SnapshotBuilder {
        SnapshotBuilder {
            host,
            ts,
            metrics: Map::new(),
            telemetry: BTreeMap::new(),
        }
    }

    pub fn metric(&self, key: &str) -> Option<&Value> {
        self.metrics.get(key)
    }

    pub fn metrics(&self) -> &Map<String, Value> {
        &self.metrics
    }

    pub fn telemetry(&self) -> &BTreeMap<String, MetricTelemetry> {
        &self.telemetry
    }

    pub fn ts(&self) -> f64 {
        self.ts
    }

    /// Seconds spent producing this snapshot.
    pub fn running_time(&self) -> f64 {
        self.running_time
    }
}

#[derive(Debug)]
pub struct SnapshotBuilder {
    host: HostInfo,
    ts: f64,
    metrics: Map<String, Value>,
    telemetry: BTreeMap<String, MetricTelemetry>,
}

impl SnapshotBuilder {
    pub fn metrics(mut self, metrics: Map<String, Value>) -> Self {
        self.metrics.extend(metrics);
        self
    }

    pub fn telemetry(mut self, telemetry: BTreeMap<String, MetricTelemetry>) -> Self {
        self.telemetry.extend(telemetry);
        self
    }

    pub fn build(self, running_time: f64) -> Snapshot {
        Snapshot {
            host: self.host,
            metrics: self.metrics,
            ts: self.ts,
            running_time,
            telemetry: self.telemetry,
        }
    }
}
