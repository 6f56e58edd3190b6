// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt, hash::Hash};

use super::{InMemoryMetrics, ReporterMetrics};

/// Callbacks a metrics backend implements to receive reporter metrics.
///
/// Every metric carries the reporter name as its `reporter` dimension. This trait does not depend on metrics.rs;
/// the bridges for metrics.rs 0.24 are enabled with the `metrics-rs-024` feature.
pub trait MetricRecorder: Send + Sync {
    fn increment_counter(&self, metric: &'static str, reporter: &str, value: u64);

    fn set_gauge(&self, metric: &'static str, reporter: &str, value: f64);
}

/// Counter of reported messages.
pub const MESSAGES: &str = "spool_messages";
/// Counter of dropped messages.
pub const MESSAGES_DROPPED: &str = "spool_messages_dropped";
/// Gauge of messages queued across all keys.
pub const QUEUED_MESSAGES: &str = "spool_queued_messages";

/// Metadata for the metrics emitted by [`MetricsRsMetrics`], for implementing a custom describe function.
pub const REPORTER_METRICS: &[DescribedMetric] = &[
    DescribedMetric {
        name: MESSAGES,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of messages reported",
    },
    DescribedMetric {
        name: MESSAGES_DROPPED,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Counter,
        description: "Number of messages dropped by overflow policies, failed sends or shutdown",
    },
    DescribedMetric {
        name: QUEUED_MESSAGES,
        unit: MetricsRsUnit::Count,
        r#type: MetricsRsType::Gauge,
        description: "Number of messages waiting in the reporter's queues",
    },
];

/// Describes a metrics.rs unit in a non-exhaustive fashion
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub enum MetricsRsUnit {
    Count,
}

/// Describes a metrics.rs metric type in a non-exhaustive fashion
#[non_exhaustive]
#[derive(Copy, Clone, Debug)]
pub enum MetricsRsType {
    Gauge,
    Counter,
}

#[derive(Copy, Clone, Debug)]
#[non_exhaustive]
pub struct DescribedMetric {
    pub name: &'static str,
    pub unit: MetricsRsUnit,
    pub r#type: MetricsRsType,
    pub description: &'static str,
}

/// [`ReporterMetrics`] that keeps in-memory totals and forwards every update to a [`MetricRecorder`].
pub struct MetricsRsMetrics<K> {
    totals: InMemoryMetrics<K>,
    name: String,
    recorder: Box<dyn MetricRecorder>,
}

impl<K: Eq + Hash> MetricsRsMetrics<K> {
    /// Forward to `recorder`, labelling every metric with `name`.
    pub fn with_recorder(name: impl Into<String>, recorder: Box<dyn MetricRecorder>) -> Self {
        Self {
            totals: InMemoryMetrics::new(),
            name: name.into(),
            recorder,
        }
    }

    /// Forward to the global metrics.rs 0.24 recorder.
    ///
    /// The recorder is resolved on every update, so one installed after the reporter was built still receives
    /// metrics.
    #[cfg(feature = "metrics-rs-024")]
    pub fn global(name: impl Into<String>) -> Self {
        Self::with_recorder(name, Box::new(GlobalMetricsRs024Bridge))
    }

    /// Forward to a local metrics.rs 0.24 recorder.
    #[cfg(feature = "metrics-rs-024")]
    pub fn local<R: metrics_024::Recorder + Send + Sync + 'static>(
        name: impl Into<String>,
        recorder: R,
    ) -> Self {
        Self::with_recorder(name, Box::new(LocalMetricsRs024Bridge(recorder)))
    }

    pub fn totals(&self) -> &InMemoryMetrics<K> {
        &self.totals
    }
}

impl<K: Clone + Eq + Hash + Send + Sync> ReporterMetrics<K> for MetricsRsMetrics<K> {
    fn increment_messages(&self, n: u64) {
        self.totals.increment_messages(n);
        self.recorder.increment_counter(MESSAGES, &self.name, n);
    }

    fn increment_messages_dropped(&self, n: u64) {
        self.totals.increment_messages_dropped(n);
        self.recorder
            .increment_counter(MESSAGES_DROPPED, &self.name, n);
    }

    fn messages(&self) -> u64 {
        self.totals.messages()
    }

    fn messages_dropped(&self) -> u64 {
        self.totals.messages_dropped()
    }

    fn queued_messages(&self) -> u64 {
        self.totals.queued_messages()
    }

    fn update_queued_messages(&self, key: &K, queued: usize) {
        self.totals.update_queued_messages(key, queued);
        self.recorder.set_gauge(
            QUEUED_MESSAGES,
            &self.name,
            self.totals.queued_messages() as f64,
        );
    }

    fn remove_queued_messages(&self, key: &K) {
        self.totals.remove_queued_messages(key);
        self.recorder.set_gauge(
            QUEUED_MESSAGES,
            &self.name,
            self.totals.queued_messages() as f64,
        );
    }
}

impl<K> fmt::Debug for MetricsRsMetrics<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsRsMetrics")
            .field("name", &self.name)
            .field("totals", &self.totals)
            .finish_non_exhaustive()
    }
}

#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone)]
struct GlobalMetricsRs024Bridge;

#[cfg(feature = "metrics-rs-024")]
impl MetricRecorder for GlobalMetricsRs024Bridge {
    fn increment_counter(&self, metric: &'static str, reporter: &str, value: u64) {
        metrics_024::counter!(metric, "reporter" => reporter.to_owned()).increment(value);
    }

    fn set_gauge(&self, metric: &'static str, reporter: &str, value: f64) {
        metrics_024::gauge!(metric, "reporter" => reporter.to_owned()).set(value);
    }
}

#[cfg(feature = "metrics-rs-024")]
#[derive(Debug, Copy, Clone)]
struct LocalMetricsRs024Bridge<R>(R);

#[cfg(feature = "metrics-rs-024")]
impl<R> LocalMetricsRs024Bridge<R> {
    fn key(metric: &'static str, reporter: &str) -> metrics_024::Key {
        metrics_024::Key::from_parts(
            metric,
            vec![metrics_024::Label::new("reporter", reporter.to_owned())],
        )
    }

    fn metadata() -> metrics_024::Metadata<'static> {
        metrics_024::Metadata::new(
            module_path!(),
            metrics_024::Level::INFO,
            Some(module_path!()),
        )
    }
}

#[cfg(feature = "metrics-rs-024")]
impl<R: metrics_024::Recorder + Send + Sync> MetricRecorder for LocalMetricsRs024Bridge<R> {
    fn increment_counter(&self, metric: &'static str, reporter: &str, value: u64) {
        self.0
            .register_counter(&Self::key(metric, reporter), &Self::metadata())
            .increment(value);
    }

    fn set_gauge(&self, metric: &'static str, reporter: &str, value: f64) {
        self.0
            .register_gauge(&Self::key(metric, reporter), &Self::metadata())
            .set(value);
    }
}

/// Register units and descriptions of [`REPORTER_METRICS`] with the global metrics.rs 0.24 recorder.
///
/// Call it once per recorder, some recorders are not idempotent in describe.
///
/// ```no_run
/// spool::metrics::describe_reporter_metrics();
/// ```
#[cfg(feature = "metrics-rs-024")]
pub fn describe_reporter_metrics() {
    for metric in REPORTER_METRICS {
        let unit = match metric.unit {
            MetricsRsUnit::Count => metrics_024::Unit::Count,
        };
        match metric.r#type {
            MetricsRsType::Counter => {
                metrics_024::describe_counter!(metric.name, unit, metric.description)
            }
            MetricsRsType::Gauge => {
                metrics_024::describe_gauge!(metric.name, unit, metric.description)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{Arc, Mutex};

    use super::*;

    #[derive(Default)]
    struct Recorded(Mutex<Vec<(&'static str, String, f64)>>);

    impl MetricRecorder for Arc<Recorded> {
        fn increment_counter(&self, metric: &'static str, reporter: &str, value: u64) {
            self.0
                .lock()
                .unwrap()
                .push((metric, reporter.to_owned(), value as f64));
        }

        fn set_gauge(&self, metric: &'static str, reporter: &str, value: f64) {
            self.0
                .lock()
                .unwrap()
                .push((metric, reporter.to_owned(), value));
        }
    }

    #[test]
    fn forwards_updates_with_reporter_label() {
        let recorded = Arc::new(Recorded::default());
        let metrics = MetricsRsMetrics::with_recorder("spans", Box::new(recorded.clone()));
        metrics.increment_messages(2);
        metrics.increment_messages_dropped(1);
        metrics.update_queued_messages(&"a", 4);
        metrics.update_queued_messages(&"b", 1);
        metrics.remove_queued_messages(&"a");

        assert_eq!(metrics.messages(), 2);
        assert_eq!(metrics.queued_messages(), 1);
        assert_eq!(
            *recorded.0.lock().unwrap(),
            [
                (MESSAGES, "spans".to_owned(), 2.0),
                (MESSAGES_DROPPED, "spans".to_owned(), 1.0),
                (QUEUED_MESSAGES, "spans".to_owned(), 4.0),
                (QUEUED_MESSAGES, "spans".to_owned(), 5.0),
                (QUEUED_MESSAGES, "spans".to_owned(), 1.0),
            ]
        );
    }

    #[cfg(feature = "metrics-rs-024")]
    #[test]
    fn bridges_to_a_local_metrics_rs_recorder() {
        use metrics_util_020::debugging::{DebugValue, DebuggingRecorder};

        let recorder = DebuggingRecorder::new();
        let snapshotter = recorder.snapshotter();
        let metrics = MetricsRsMetrics::local("spans", recorder);
        metrics.increment_messages(3);
        metrics.increment_messages_dropped(1);
        metrics.update_queued_messages(&"a", 2);

        let snapshot = snapshotter.snapshot().into_vec();
        let value = |name: &str| {
            snapshot
                .iter()
                .find(|(key, _, _, _)| {
                    key.key().name() == name
                        && key
                            .key()
                            .labels()
                            .any(|l| l.key() == "reporter" && l.value() == "spans")
                })
                .map(|(_, _, _, value)| match value {
                    DebugValue::Counter(c) => DebugValue::Counter(*c),
                    DebugValue::Gauge(g) => DebugValue::Gauge(*g),
                    DebugValue::Histogram(h) => DebugValue::Histogram(h.clone()),
                })
        };
        assert_eq!(value(MESSAGES), Some(DebugValue::Counter(3)));
        assert_eq!(value(MESSAGES_DROPPED), Some(DebugValue::Counter(1)));
        assert_eq!(
            value(QUEUED_MESSAGES),
            Some(DebugValue::Gauge(2.0.into()))
        );
    }
}
