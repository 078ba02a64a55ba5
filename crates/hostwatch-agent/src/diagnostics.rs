// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Per-collector error sink.
//!
//! Collectors report recoverable problems through a [`Diagnostics`] handle
//! instead of failing outright. Everything recorded here is logged and ends
//! up in the `errors` list of the collector's telemetry entry.

use tracing::{error, warn};

#[derive(Debug, Default)]
pub struct Diagnostics {
    errors: Vec<String>,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logs at error level and records the message in telemetry.
    pub fn error(&mut self, message: impl Into<String>) {
        let message = message.into();
        error!("{message}");
        self.errors.push(message);
    }

    /// Logs at warn level. Warnings are not part of telemetry.
    pub fn warn(&self, message: impl AsRef<str>) {
        warn!("{}", message.as_ref());
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }

    pub fn into_errors(self) -> Vec<String> {
        self.errors
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_test::traced_test;

    #[test]
    #[traced_test]
    fn errors_are_recorded_and_logged() {
        let mut diagnostics = Diagnostics::new();
        diagnostics.error("smartctl exited with status 2");
        diagnostics.warn("sensor missing");
        assert_eq!(diagnostics.errors(), ["smartctl exited with status 2"]);
        assert!(logs_contain("smartctl exited with status 2"));
        assert!(logs_contain("sensor missing"));
    }
}
