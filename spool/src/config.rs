// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Plain-data reporter settings, loadable from configuration files.
//!
//! ```
//! # #[cfg(feature = "serde")]
//! # {
//! use spool::config::{MetricsKind, ReporterProperties};
//!
//! let properties: ReporterProperties = serde_json::from_str(
//!     r#"{ "overflow_policy": "BackPressure", "queued_max_messages": 500, "metrics": "in-memory" }"#,
//! )
//! .unwrap();
//! assert_eq!(properties.queued_max_messages, 500);
//! assert_eq!(properties.metrics, MetricsKind::InMemory);
//! // everything else keeps its default
//! assert_eq!(properties.buffered_max_messages, 100);
//! # }
//! ```

use std::{sync::Arc, time::Duration};

use spool_core::{Message, OverflowPolicy};

use crate::{
    metrics::{InMemoryMetrics, LogExporter, NoopMetrics},
    reporter::{Reporter, ReporterBuilder},
    sender::Sender,
};

/// Which [`ReporterMetrics`](crate::metrics::ReporterMetrics) a reporter records into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(rename_all = "kebab-case")
)]
pub enum MetricsKind {
    #[default]
    Noop,
    InMemory,
}

/// Which [`MetricsExporter`](crate::metrics::MetricsExporter) publishes them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(rename_all = "kebab-case")
)]
pub enum ExporterKind {
    #[default]
    Noop,
    Log,
}

/// Reporter settings as plain data. Durations are in milliseconds.
///
/// Missing fields take the same defaults as [`ReporterBuilder`]. Validation happens in [`ReporterBuilder::build`].
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Deserialize, serde::Serialize),
    serde(default, deny_unknown_fields)
)]
pub struct ReporterProperties {
    pub name: Option<String>,
    pub overflow_policy: OverflowPolicy,
    pub queued_max_messages: usize,
    pub buffered_max_messages: usize,
    pub total_queued_messages: usize,
    pub message_timeout_ms: u64,
    pub sender_threads: usize,
    pub flush_threads: usize,
    pub timer_threads: usize,
    pub queued_keep_alive_ms: u64,
    pub tick_duration_ms: u64,
    pub ticks_per_wheel: usize,
    pub metrics: MetricsKind,
    pub metrics_exporter: ExporterKind,
    /// Only used by the log exporter. Must be positive.
    pub metrics_export_interval_ms: u64,
}

impl Default for ReporterProperties {
    fn default() -> Self {
        Self {
            name: None,
            overflow_policy: OverflowPolicy::DropHead,
            queued_max_messages: 10_000,
            buffered_max_messages: 100,
            total_queued_messages: 100_000,
            message_timeout_ms: 1_000,
            sender_threads: 1,
            flush_threads: 1,
            timer_threads: 1,
            queued_keep_alive_ms: 60_000,
            tick_duration_ms: 100,
            ticks_per_wheel: 512,
            metrics: MetricsKind::Noop,
            metrics_exporter: ExporterKind::Noop,
            metrics_export_interval_ms: 5_000,
        }
    }
}

impl ReporterProperties {
    /// A builder for a reporter sending through `sender` with these settings.
    pub fn into_builder<M: Message, S: Sender<M>>(self, sender: S) -> ReporterBuilder<M, S> {
        let mut builder = Reporter::builder(sender)
            .overflow_policy(self.overflow_policy)
            .queued_max_messages(self.queued_max_messages)
            .buffered_max_messages(self.buffered_max_messages)
            .total_queued_messages(self.total_queued_messages)
            .message_timeout(Duration::from_millis(self.message_timeout_ms))
            .sender_threads(self.sender_threads)
            .flush_threads(self.flush_threads)
            .timer_threads(self.timer_threads)
            .queued_keep_alive(Duration::from_millis(self.queued_keep_alive_ms))
            .tick_duration(Duration::from_millis(self.tick_duration_ms))
            .ticks_per_wheel(self.ticks_per_wheel);
        if let Some(name) = self.name {
            builder = builder.name(name);
        }
        builder = match self.metrics {
            MetricsKind::Noop => builder.metrics(Arc::new(NoopMetrics)),
            MetricsKind::InMemory => builder.metrics(Arc::new(InMemoryMetrics::<M::Key>::new())),
        };
        match self.metrics_exporter {
            ExporterKind::Noop => builder,
            ExporterKind::Log => builder.metrics_exporter(LogExporter::new(Duration::from_millis(
                self.metrics_export_interval_ms,
            ))),
        }
    }
}

#[cfg(all(test, feature = "serde"))]
mod tests {
    use spool_core::Cause;

    use super::*;
    use crate::{metrics::ReporterMetrics, queue::tests::Msg, reporter::ReporterState};

    struct Discard;

    impl Sender<Msg> for Discard {
        type Output = ();

        fn send(&self, messages: &[Msg]) -> Result<Vec<Result<(), Cause>>, Cause> {
            Ok(messages.iter().map(|_| Ok(())).collect())
        }
    }

    #[test]
    fn parses_toml_with_defaults() {
        let properties: ReporterProperties = toml::from_str(
            r#"
            name = "orders"
            overflow_policy = "DropNew"
            queued_max_messages = 50
            total_queued_messages = 500
            message_timeout_ms = 0
            metrics = "in-memory"
            metrics_exporter = "log"
            "#,
        )
        .unwrap();
        assert_eq!(
            properties,
            ReporterProperties {
                name: Some("orders".to_owned()),
                overflow_policy: OverflowPolicy::DropNew,
                queued_max_messages: 50,
                total_queued_messages: 500,
                message_timeout_ms: 0,
                metrics: MetricsKind::InMemory,
                metrics_exporter: ExporterKind::Log,
                ..ReporterProperties::default()
            }
        );
    }

    #[test]
    fn rejects_unknown_fields() {
        let err = toml::from_str::<ReporterProperties>("queue_size = 5").unwrap_err();
        assert!(err.to_string().contains("queue_size"), "{err}");
    }

    #[test]
    fn builds_a_reporter() {
        let properties = ReporterProperties {
            name: Some("configured".to_owned()),
            message_timeout_ms: 0,
            metrics: MetricsKind::InMemory,
            ..ReporterProperties::default()
        };
        let reporter = properties.into_builder::<Msg, _>(Discard).build().unwrap();
        assert_eq!(reporter.name(), "configured");
        assert_eq!(reporter.state(), ReporterState::Init);

        let future = reporter.report(Msg { key: "k", id: 1 }).unwrap();
        reporter.flush_all();
        assert!(future.wait().is_ok());
        assert_eq!(reporter.metrics().messages(), 1);
    }

    #[test]
    fn invalid_values_fail_at_build() {
        let properties = ReporterProperties {
            queued_max_messages: 10,
            total_queued_messages: 1,
            ..ReporterProperties::default()
        };
        assert!(properties.into_builder::<Msg, _>(Discard).build().is_err());

        let properties = ReporterProperties {
            metrics_exporter: ExporterKind::Log,
            metrics_export_interval_ms: 0,
            ..ReporterProperties::default()
        };
        assert!(properties.into_builder::<Msg, _>(Discard).build().is_err());
    }
}
