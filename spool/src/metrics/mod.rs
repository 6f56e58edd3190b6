// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Reporter metrics.
//!
//! A reporter records three things: how many messages were reported, how many were dropped (by an overflow policy,
//! a failed send, or shutdown), and how many are currently queued, per key and in aggregate. Recording goes through
//! [`ReporterMetrics`]; [`NoopMetrics`] is the default.

mod exporter;
mod in_memory;
mod recorder;

pub use exporter::{ExporterHandle, LogExporter, MetricsExporter, NoopExporter};
pub use in_memory::InMemoryMetrics;
#[cfg(feature = "metrics-rs-024")]
pub use recorder::describe_reporter_metrics;
pub use recorder::{
    DescribedMetric, MetricRecorder, MetricsRsMetrics, MetricsRsType, MetricsRsUnit,
    REPORTER_METRICS,
};

/// Counters and gauges updated by a reporter.
pub trait ReporterMetrics<K>: Send + Sync {
    fn increment_messages(&self, n: u64);

    fn increment_messages_dropped(&self, n: u64);

    /// Total messages reported.
    fn messages(&self) -> u64;

    /// Total messages dropped.
    fn messages_dropped(&self) -> u64;

    /// Messages currently queued across all keys.
    fn queued_messages(&self) -> u64;

    /// Set the number of messages queued for `key`.
    fn update_queued_messages(&self, key: &K, queued: usize);

    /// Forget `key`, called when its queue is evicted.
    fn remove_queued_messages(&self, key: &K);

    fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            messages: self.messages(),
            messages_dropped: self.messages_dropped(),
            queued_messages: self.queued_messages(),
        }
    }
}

/// Point-in-time totals, as published by a [`MetricsExporter`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub messages: u64,
    pub messages_dropped: u64,
    pub queued_messages: u64,
}

/// Source of [`MetricsSnapshot`]s for an exporter.
pub trait SnapshotSource: Send + Sync {
    fn snapshot(&self) -> MetricsSnapshot;
}

impl<F: Fn() -> MetricsSnapshot + Send + Sync> SnapshotSource for F {
    fn snapshot(&self) -> MetricsSnapshot {
        self()
    }
}

/// Records nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopMetrics;

impl<K> ReporterMetrics<K> for NoopMetrics {
    fn increment_messages(&self, _n: u64) {}

    fn increment_messages_dropped(&self, _n: u64) {}

    fn messages(&self) -> u64 {
        0
    }

    fn messages_dropped(&self) -> u64 {
        0
    }

    fn queued_messages(&self) -> u64 {
        0
    }

    fn update_queued_messages(&self, _key: &K, _queued: usize) {}

    fn remove_queued_messages(&self, _key: &K) {}
}
