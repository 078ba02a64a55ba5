// Copyright 2023-Present Datadog, Inc. https://www.datadoghq.com/
// SPDX-License-Identifier: Apache-2.0

//! Log line format for the agent.
//!
//! ```text
//! HOSTWATCH | LEVEL | component[ span=value...] | message fields
//! ```
//!
//! The component is the emitting module relative to the agent crate, so
//! `hostwatch_agent::sync::transport` shows as `sync::transport`. Spans
//! contribute their fields; the per-collector span shows the metric key.
//!
//! ```text
//! HOSTWATCH | WARN | sync | Synchronization attempt failed: timed out endpoint=/collect
//! HOSTWATCH | ERROR | registry collector{key="redis"} | redis on port 6379: Connection refused
//! ```

use std::fmt;

use tracing_core::{Event, Subscriber};
use tracing_subscriber::fmt::{
    format::{self, FormatEvent, FormatFields},
    FmtContext, FormattedFields,
};
use tracing_subscriber::registry::LookupSpan;

pub const LOG_PREFIX: &str = "HOSTWATCH";

const CRATE_TARGETS: [&str; 2] = ["hostwatch_agent", "hostwatch"];

/// Strips the agent's crate name from a tracing target. Targets of other
/// crates are kept whole.
fn component(target: &str) -> &str {
    for krate in CRATE_TARGETS {
        if target == krate {
            return "main";
        }
        if let Some(rest) = target
            .strip_prefix(krate)
            .and_then(|rest| rest.strip_prefix("::"))
        {
            return rest;
        }
    }
    target
}

#[derive(Debug, Clone, Copy)]
pub struct Formatter;

impl<S, N> FormatEvent<S, N> for Formatter
where
    S: Subscriber + for<'a> LookupSpan<'a>,
    N: for<'a> FormatFields<'a> + 'static,
{
    fn format_event(
        &self,
        ctx: &FmtContext<'_, S, N>,
        mut writer: format::Writer<'_>,
        event: &Event<'_>,
    ) -> fmt::Result {
        let metadata = event.metadata();
        write!(
            writer,
            "{LOG_PREFIX} | {} | {}",
            metadata.level(),
            component(metadata.target())
        )?;

        if let Some(scope) = ctx.event_scope() {
            for span in scope.from_root() {
                write!(writer, " {}", span.name())?;
                if let Some(fields) = span.extensions().get::<FormattedFields<N>>() {
                    if !fields.is_empty() {
                        write!(writer, "{{{fields}}}")?;
                    }
                }
            }
        }

        write!(writer, " | ")?;
        ctx.field_format().format_fields(writer.by_ref(), event)?;
        writeln!(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::sync::{Arc, Mutex};
    use tracing::{debug_span, warn};
    use tracing_subscriber::fmt::MakeWriter;

    #[derive(Clone, Default)]
    struct Buffer(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Buffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().expect("lock").extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'a> MakeWriter<'a> for Buffer {
        type Writer = Buffer;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn capture(emit: impl FnOnce()) -> String {
        let buffer = Buffer::default();
        let subscriber = tracing_subscriber::fmt()
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .event_format(Formatter)
            .with_writer(buffer.clone())
            .finish();
        tracing::subscriber::with_default(subscriber, emit);
        let bytes = buffer.0.lock().expect("lock").clone();
        String::from_utf8(bytes).expect("utf8")
    }

    #[test]
    fn component_is_relative_to_the_agent() {
        assert_eq!(component("hostwatch_agent::sync::transport"), "sync::transport");
        assert_eq!(component("hostwatch_agent"), "main");
        assert_eq!(component("hostwatch"), "main");
        assert_eq!(component("hickory_resolver::lookup"), "hickory_resolver::lookup");
        assert_eq!(component("hostwatch_agentx"), "hostwatch_agentx");
    }

    #[test]
    fn collector_span_sits_between_component_and_message() {
        let output = capture(|| {
            let _span = debug_span!("collector", key = "redis").entered();
            warn!(port = 6379, "Connection refused");
        });

        assert!(output.starts_with("HOSTWATCH | WARN | logger::tests collector{"));
        assert!(output.contains("redis"));
        assert!(output.contains("} | Connection refused"));
        assert!(output.ends_with('\n'));
    }

    #[test]
    fn events_outside_spans_have_no_span_section() {
        let output = capture(|| warn!("Backend toggled collection"));
        assert_eq!(
            output,
            "HOSTWATCH | WARN | logger::tests | Backend toggled collection\n"
        );
    }
}
