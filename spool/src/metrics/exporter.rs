// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};

use super::SnapshotSource;
use crate::error::BuildError;

/// Periodically publishes reporter metrics somewhere.
pub trait MetricsExporter: Send + Sync {
    /// Start exporting snapshots from `source`. Exporting stops when the returned handle is dropped.
    fn start(&self, name: &str, source: Arc<dyn SnapshotSource>) -> Result<ExporterHandle, BuildError>;
}

/// Exports nothing. The default.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopExporter;

impl MetricsExporter for NoopExporter {
    fn start(&self, _name: &str, _source: Arc<dyn SnapshotSource>) -> Result<ExporterHandle, BuildError> {
        Ok(ExporterHandle::noop())
    }
}

/// Logs a snapshot as a [`tracing`] event at a fixed interval.
#[derive(Debug, Clone, Copy)]
pub struct LogExporter {
    interval: Duration,
}

impl Default for LogExporter {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
        }
    }
}

impl LogExporter {
    /// Log every `interval`. Defaults to every 5 seconds. A zero interval is rejected by
    /// [`start`](MetricsExporter::start).
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }
}

impl MetricsExporter for LogExporter {
    fn start(&self, name: &str, source: Arc<dyn SnapshotSource>) -> Result<ExporterHandle, BuildError> {
        if self.interval.is_zero() {
            return Err(BuildError::invalid("metrics export interval must be positive"));
        }
        let parker = Parker::new();
        let unparker = parker.unparker().clone();
        let stop = Arc::new(AtomicBool::new(false));
        let interval = self.interval;
        let reporter = name.to_owned();
        let thread_name = format!("{name}-metrics");
        let handle = {
            let stop = Arc::clone(&stop);
            thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || {
                    let span = tracing::span!(tracing::Level::TRACE, "spool metrics exporter", reporter = %reporter);
                    let _enter = span.enter();
                    loop {
                        let next = Instant::now() + interval;
                        while Instant::now() < next && !stop.load(Ordering::Acquire) {
                            parker.park_deadline(next);
                        }
                        if stop.load(Ordering::Acquire) {
                            return;
                        }
                        let snapshot = source.snapshot();
                        tracing::info!(
                            messages = snapshot.messages,
                            messages_dropped = snapshot.messages_dropped,
                            queued_messages = snapshot.queued_messages,
                            "reporter metrics"
                        );
                    }
                })
                .map_err(|err| BuildError::spawn(thread_name, err))?
        };
        Ok(ExporterHandle {
            running: Some(Running {
                stop,
                unparker,
                handle,
            }),
        })
    }
}

struct Running {
    stop: Arc<AtomicBool>,
    unparker: Unparker,
    handle: thread::JoinHandle<()>,
}

/// Guard for a started exporter. Dropping it stops the exporter and waits for its thread.
#[must_use = "the exporter stops when the handle is dropped"]
pub struct ExporterHandle {
    running: Option<Running>,
}

impl ExporterHandle {
    /// A handle with nothing to stop.
    pub fn noop() -> Self {
        Self { running: None }
    }

    pub fn is_running(&self) -> bool {
        self.running.is_some()
    }

    /// Alias for `drop(handle)`.
    pub fn shut_down(self) {}

    fn stop(&mut self) {
        if let Some(running) = self.running.take() {
            running.stop.store(true, Ordering::Release);
            running.unparker.unpark();
            if running.handle.thread().id() != thread::current().id() && running.handle.join().is_err() {
                tracing::warn!("metrics exporter thread panicked");
            }
        }
    }
}

impl Drop for ExporterHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

impl fmt::Debug for ExporterHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExporterHandle")
            .field("running", &self.is_running())
            .finish()
    }
}
