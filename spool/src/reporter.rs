// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The [`Reporter`]: keyed, bounded, batching delivery of messages.

use std::{
    fmt,
    sync::{
        Arc, Condvar, Mutex, Weak,
        atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering},
    },
    thread,
    time::Duration,
};

use crossbeam_utils::Backoff;
use spool_core::{CapacityError, Cause, Closed, DroppedError, Future, Message, OverflowPolicy, Promise};

use crate::{
    buffer::BufferPool,
    error::{BuildError, OfferError},
    limiter::MemoryLimiter,
    manager::QueueManager,
    metrics::{ExporterHandle, MetricsExporter, NoopExporter, NoopMetrics, ReporterMetrics},
    queue::{Pending, SizeBoundedQueue},
    rate_limit::rate_limited,
    sender::{AsyncSender, Sender, SenderPool},
    sync::{deadline_after, lock, wait_until},
    synchronizer::{FlushSynchronizer, InFlight},
    time::TimeSource,
    timer::{KeyedTimers, Timer, WheelTimer},
};

type Queue<M, S> = SizeBoundedQueue<M, <S as Sender<M>>::Output>;

/// Lifecycle of a [`Reporter`]. Transitions only move forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReporterState {
    /// Built, nothing reported yet. No flush threads are running.
    Init = 0,
    /// The first message was reported and the flush threads were started.
    Started = 1,
    /// Closed. New messages are failed with [`Closed`].
    Shutdown = 2,
}

impl ReporterState {
    fn from_u8(state: u8) -> Self {
        match state {
            0 => Self::Init,
            1 => Self::Started,
            _ => Self::Shutdown,
        }
    }
}

/// Builder for [`Reporter`]. Created with [`Reporter::builder`].
pub struct ReporterBuilder<M: Message, S> {
    sender: Arc<S>,
    name: Option<String>,
    policy: OverflowPolicy,
    queued_max_messages: usize,
    buffered_max_messages: usize,
    total_queued_messages: usize,
    message_timeout: Duration,
    sender_threads: usize,
    flush_threads: usize,
    timer_threads: usize,
    keep_alive: Duration,
    tick_duration: Duration,
    ticks_per_wheel: usize,
    metrics: Arc<dyn ReporterMetrics<M::Key>>,
    exporter: Box<dyn MetricsExporter>,
    timer: Option<Arc<dyn Timer>>,
    sender_pool: Option<SenderPool>,
    time: TimeSource,
}

impl<M: Message, S: Sender<M>> ReporterBuilder<M, S> {
    fn new(sender: Arc<S>) -> Self {
        Self {
            sender,
            name: None,
            policy: OverflowPolicy::default(),
            queued_max_messages: 10_000,
            buffered_max_messages: 100,
            total_queued_messages: 100_000,
            message_timeout: Duration::from_secs(1),
            sender_threads: 1,
            flush_threads: 1,
            timer_threads: 1,
            keep_alive: Duration::from_secs(60),
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            metrics: Arc::new(NoopMetrics),
            exporter: Box::new(NoopExporter),
            timer: None,
            sender_pool: None,
            time: TimeSource::System,
        }
    }

    /// Prefix of the reporter's thread names, also used as the metrics label. Defaults to `spool-<n>`.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// What a full per-key queue does with a new message. Defaults to [`OverflowPolicy::DropHead`].
    pub fn overflow_policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Capacity of each per-key queue. A queue that reaches it is handed to a flush thread. Defaults to 10 000.
    pub fn queued_max_messages(mut self, max: usize) -> Self {
        self.queued_max_messages = max;
        self
    }

    /// Largest batch handed to the sender. Defaults to 100.
    pub fn buffered_max_messages(mut self, max: usize) -> Self {
        self.buffered_max_messages = max;
        self
    }

    /// Cap on messages queued across all keys, after which producers block. Defaults to 100 000.
    pub fn total_queued_messages(mut self, max: usize) -> Self {
        self.total_queued_messages = max;
        self
    }

    /// Interval of the per-key flush timers, and how long flush threads wait for work. Zero disables the timers,
    /// so queues are only flushed when full or by [`Reporter::flush_all`]. Defaults to 1 second.
    pub fn message_timeout(mut self, timeout: Duration) -> Self {
        self.message_timeout = timeout;
        self
    }

    /// Threads of the sender pool. Ignored when a shared pool is given. Defaults to 1.
    pub fn sender_threads(mut self, threads: usize) -> Self {
        self.sender_threads = threads;
        self
    }

    pub fn flush_threads(mut self, threads: usize) -> Self {
        self.flush_threads = threads;
        self
    }

    /// Runner threads of the reporter's own timer. Ignored when a shared timer is given. Defaults to 1.
    pub fn timer_threads(mut self, threads: usize) -> Self {
        self.timer_threads = threads;
        self
    }

    /// How long an empty queue may stay idle before it is evicted. Defaults to 60 seconds.
    pub fn queued_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    pub fn ticks_per_wheel(mut self, ticks_per_wheel: usize) -> Self {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn ReporterMetrics<M::Key>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Exporter started when the reporter is built and stopped when it is closed.
    pub fn metrics_exporter(mut self, exporter: impl MetricsExporter + 'static) -> Self {
        self.exporter = Box::new(exporter);
        self
    }

    /// Use a shared timer instead of starting one. The reporter never shuts a shared timer down.
    pub fn timer(mut self, timer: Arc<dyn Timer>) -> Self {
        self.timer = Some(timer);
        self
    }

    /// Use a shared sender pool instead of starting one. The reporter never shuts a shared pool down.
    pub fn sender_pool(mut self, pool: SenderPool) -> Self {
        self.sender_pool = Some(pool);
        self
    }

    /// Clock used for idle eviction.
    pub fn time_source(mut self, time: TimeSource) -> Self {
        self.time = time;
        self
    }

    fn validate(&self) -> Result<(), BuildError> {
        let positive = [
            ("queued_max_messages", self.queued_max_messages),
            ("buffered_max_messages", self.buffered_max_messages),
            ("total_queued_messages", self.total_queued_messages),
            ("sender_threads", self.sender_threads),
            ("flush_threads", self.flush_threads),
            ("timer_threads", self.timer_threads),
            ("ticks_per_wheel", self.ticks_per_wheel),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(BuildError::invalid(format!("{name} must be positive")));
            }
        }
        if self.tick_duration.is_zero() {
            return Err(BuildError::invalid("tick_duration must be positive"));
        }
        if self.keep_alive.is_zero() {
            return Err(BuildError::invalid("queued_keep_alive must be positive"));
        }
        if self.total_queued_messages < self.queued_max_messages {
            return Err(BuildError::invalid(format!(
                "total_queued_messages ({}) must not be less than queued_max_messages ({})",
                self.total_queued_messages, self.queued_max_messages
            )));
        }
        Ok(())
    }

    /// Validate the settings and start the reporter's timer, sender pool and metrics exporter.
    ///
    /// Flush threads are only started by the first [`Reporter::report`].
    pub fn build(self) -> Result<Reporter<M, S>, BuildError> {
        self.validate()?;
        let name = self.name.unwrap_or_else(|| {
            static NEXT_ID: AtomicUsize = AtomicUsize::new(0);
            format!("spool-{}", NEXT_ID.fetch_add(1, Ordering::Relaxed))
        });

        let (timer, owned_timer): (Arc<dyn Timer>, _) = match self.timer {
            Some(timer) => (timer, None),
            None => {
                let timer = WheelTimer::builder()
                    .name(format!("{name}-timer"))
                    .tick_duration(self.tick_duration)
                    .ticks_per_wheel(self.ticks_per_wheel)
                    .threads(self.timer_threads)
                    .build()?;
                (Arc::new(timer.clone()) as Arc<dyn Timer>, Some(timer))
            }
        };
        let (pool, owns_pool) = match self.sender_pool {
            Some(pool) => (pool, false),
            None => (SenderPool::new(self.sender_threads, name.clone())?, true),
        };

        let limiter = Arc::new(MemoryLimiter::new(self.total_queued_messages));
        let metrics = self.metrics;
        let message_timeout = self.message_timeout;

        let inner = Arc::new_cyclic(|me: &Weak<Inner<M, S>>| {
            let on_create = me.clone();
            let on_evict = me.clone();
            let manager = QueueManager::builder(Arc::clone(&timer))
                .max_size(self.queued_max_messages)
                .policy(self.policy)
                .keep_alive(self.keep_alive)
                .limiter(Arc::clone(&limiter))
                .time_source(self.time)
                .metrics(Arc::clone(&metrics))
                .on_create(move |queue: &Arc<Queue<M, S>>| {
                    if let Some(inner) = on_create.upgrade() {
                        inner.arm_timer(queue);
                    }
                })
                .on_evict(move |queue: &Arc<Queue<M, S>>| {
                    if let Some(inner) = on_evict.upgrade() {
                        inner.disarm_timer(queue);
                    }
                })
                .build();
            Inner {
                me: me.clone(),
                name: name.clone(),
                state: AtomicU8::new(ReporterState::Init as u8),
                registry_cleared: AtomicBool::new(false),
                queued_max_messages: self.queued_max_messages,
                message_timeout,
                flush_threads: self.flush_threads,
                limiter,
                manager,
                synchronizer: FlushSynchronizer::new(),
                buffers: BufferPool::new(self.flush_threads, self.buffered_max_messages),
                sender: AsyncSender::new(self.sender, pool),
                owns_pool,
                sender_closed: AtomicBool::new(false),
                timers: KeyedTimers::new(timer),
                owned_timer,
                metrics: Arc::clone(&metrics),
                flushers: Mutex::new(Vec::new()),
                running: Latch::default(),
                exporter: Mutex::new(None),
            }
        });

        let source = Arc::clone(&metrics);
        let exporter = match self.exporter.start(&inner.name, Arc::new(move || source.snapshot())) {
            Ok(exporter) => exporter,
            Err(err) => {
                inner.close();
                return Err(err);
            }
        };
        *lock(&inner.exporter) = Some(exporter);

        tracing::debug!(reporter = %inner.name, "reporter built");
        Ok(Reporter { inner })
    }
}

impl<M: Message, S> fmt::Debug for ReporterBuilder<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReporterBuilder")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .field("queued_max_messages", &self.queued_max_messages)
            .field("buffered_max_messages", &self.buffered_max_messages)
            .field("total_queued_messages", &self.total_queued_messages)
            .field("message_timeout", &self.message_timeout)
            .field("flush_threads", &self.flush_threads)
            .finish_non_exhaustive()
    }
}

/// Groups reported messages by key into bounded queues and sends them in batches.
///
/// [`report`](Self::report) returns immediately with a [`Future`] that completes once the message's batch was sent,
/// or fails if the message was dropped. A per-key queue is flushed when it reaches
/// [`queued_max_messages`](ReporterBuilder::queued_max_messages), when its periodic timer fires, or on
/// [`flush_all`](Self::flush_all).
///
/// Dropping the reporter closes it.
pub struct Reporter<M: Message, S: Sender<M>> {
    inner: Arc<Inner<M, S>>,
}

struct Inner<M: Message, S: Sender<M>> {
    me: Weak<Inner<M, S>>,
    name: String,
    state: AtomicU8,
    // set by close right before it empties the registry
    registry_cleared: AtomicBool,
    queued_max_messages: usize,
    message_timeout: Duration,
    flush_threads: usize,
    limiter: Arc<MemoryLimiter>,
    manager: Arc<QueueManager<M, S::Output>>,
    synchronizer: FlushSynchronizer<Queue<M, S>>,
    buffers: BufferPool<Pending<M, S::Output>>,
    sender: AsyncSender<M, S>,
    owns_pool: bool,
    sender_closed: AtomicBool,
    timers: KeyedTimers<M::Key>,
    owned_timer: Option<WheelTimer>,
    metrics: Arc<dyn ReporterMetrics<M::Key>>,
    flushers: Mutex<Vec<thread::JoinHandle<()>>>,
    running: Latch,
    exporter: Mutex<Option<ExporterHandle>>,
}

impl<M: Message, S: Sender<M>> Reporter<M, S> {
    pub fn builder(sender: S) -> ReporterBuilder<M, S> {
        ReporterBuilder::new(Arc::new(sender))
    }

    /// Like [`Reporter::builder`], for a sender that is shared with other code.
    pub fn builder_shared(sender: Arc<S>) -> ReporterBuilder<M, S> {
        ReporterBuilder::new(sender)
    }

    /// Queue `message` for delivery.
    ///
    /// Blocks while the reporter-wide cap is reached and, under [`OverflowPolicy::BackPressure`], while the
    /// message's queue is full. Every other outcome, including drops and shutdown, is reported through the returned
    /// future. The only synchronous error is [`CapacityError`] under [`OverflowPolicy::Fail`], which hands the
    /// message back.
    pub fn report(&self, message: M) -> Result<Future<S::Output>, CapacityError<M>> {
        let inner = &self.inner;
        inner.metrics.increment_messages(1);

        if inner.state() == ReporterState::Shutdown {
            inner.metrics.increment_messages_dropped(1);
            return Ok(Future::failed(closed(vec![message])));
        }
        if inner.transition(ReporterState::Init, ReporterState::Started) {
            inner.start_flushers();
        }

        let key = message.key();
        let promise = Promise::new();
        let future = promise.future().clone();
        let metrics = Arc::clone(&inner.metrics);
        future.add_listener(move |future| {
            if future.is_failed() {
                metrics.increment_messages_dropped(1);
            }
        });
        let mut pending = Pending::new(message, promise);

        if inner.limiter.block_until_below_limit().is_err() {
            fail_closed(vec![pending]);
            return Ok(future);
        }

        let queue = loop {
            let queue = inner.manager.get_or_create(&key);
            match queue.offer(pending) {
                Ok(()) => break queue,
                // evicted between lookup and offer
                Err(OfferError::Retired(item)) => pending = item,
                Err(OfferError::Closed(item)) => {
                    fail_closed(vec![item]);
                    return Ok(future);
                }
                Err(OfferError::Full(err)) => {
                    inner.metrics.increment_messages_dropped(1);
                    return Err(err.map(|item| item.into_parts().0));
                }
            }
        };
        inner.metrics.update_queued_messages(&key, queue.len());

        if inner.state() == ReporterState::Shutdown {
            // raced with close: a queue still in the registry is flushed or failed by close, one created after
            // close emptied the registry would be leaked
            if inner.registry_cleared.load(Ordering::SeqCst) {
                inner.drop_queued(&queue);
            }
            return Ok(future);
        }
        if queue.len() >= inner.queued_max_messages {
            inner.synchronizer.offer(&queue);
        }
        Ok(future)
    }

    /// Flush the queue of `key` now. Returns `None` if there is no such queue.
    ///
    /// If a flush thread is draining the queue, waits for it to finish first, so batches of one key are handed to
    /// the sender in queue order. Must not be called from a [`Sender`].
    pub fn flush(&self, key: &M::Key) -> Option<Future<()>> {
        let queue = self.inner.manager.peek(key)?;
        Some(self.inner.flush_exclusive(&queue))
    }

    /// Send one batch from every queue, waiting for each to complete.
    ///
    /// A queue holding more than [`buffered_max_messages`](ReporterBuilder::buffered_max_messages) keeps the rest.
    /// Like [`flush`](Self::flush), waits for flush threads draining the same queue.
    pub fn flush_all(&self) {
        for queue in self.inner.manager.elements() {
            let _ = self.inner.flush_exclusive(&queue).wait();
        }
    }

    /// Health check of the sender.
    pub fn check(&self) -> Result<(), Cause> {
        self.inner.sender.sender().check()
    }

    pub fn state(&self) -> ReporterState {
        self.inner.state()
    }

    pub fn metrics(&self) -> &Arc<dyn ReporterMetrics<M::Key>> {
        &self.inner.metrics
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Number of live per-key queues.
    pub fn queues(&self) -> usize {
        self.inner.manager.len()
    }

    /// Messages queued across all keys.
    pub fn queued_messages(&self) -> usize {
        self.inner.limiter.total()
    }

    /// Send a last batch from every queue, stop the background threads and close the sender.
    ///
    /// Messages that are still queued afterwards fail with [`Closed`], as do producers blocked in `report`. Calling
    /// `close` again only makes sure the sender is closed.
    pub fn close(&self) {
        self.inner.close();
    }
}

impl<M: Message, S: Sender<M>> Drop for Reporter<M, S> {
    fn drop(&mut self) {
        self.inner.close();
    }
}

impl<M: Message, S: Sender<M>> fmt::Debug for Reporter<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Reporter")
            .field("name", &self.inner.name)
            .field("state", &self.inner.state())
            .field("queues", &self.inner.manager.len())
            .field("queued_messages", &self.inner.limiter.total())
            .finish()
    }
}

impl<M: Message, S: Sender<M>> Inner<M, S> {
    fn state(&self) -> ReporterState {
        ReporterState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn transition(&self, from: ReporterState, to: ReporterState) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    /// How long flush threads wait for a ready queue before checking for shutdown.
    fn poll_interval(&self) -> Duration {
        if self.message_timeout.is_zero() {
            Duration::from_secs(1)
        } else {
            self.message_timeout
        }
    }

    fn start_flushers(&self) {
        let Some(me) = self.me.upgrade() else {
            return;
        };
        let mut flushers = lock(&self.flushers);
        for i in 0..self.flush_threads {
            let thread_name = format!("{}-flusher-{i}", self.name);
            let inner = Arc::clone(&me);
            self.running.count_up();
            match thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || inner.run_flusher())
            {
                Ok(handle) => flushers.push(handle),
                Err(err) => {
                    self.running.count_down();
                    tracing::error!(reporter = %self.name, thread = %thread_name, %err, "failed to spawn flush thread");
                }
            }
        }
        tracing::info!(reporter = %self.name, flush_threads = flushers.len(), "reporter started");
    }

    fn run_flusher(&self) {
        let span = tracing::span!(tracing::Level::TRACE, "spool flusher", reporter = %self.name);
        let _enter = span.enter();
        while self.state() != ReporterState::Shutdown {
            let Some(queue) = self.synchronizer.poll(self.poll_interval()) else {
                continue;
            };
            while queue.len() >= self.queued_max_messages && self.state() != ReporterState::Shutdown {
                self.arm_timer(&queue);
                self.flush(&queue);
            }
            self.synchronizer.release(&queue);
            self.offer_if_full(&queue);
        }
        self.running.count_down();
    }

    /// (Re)start the periodic flush timer of `queue`.
    fn arm_timer(&self, queue: &Arc<Queue<M, S>>) {
        if self.message_timeout.is_zero() || self.state() == ReporterState::Shutdown || !queue.is_open() {
            return;
        }
        let me = self.me.clone();
        let target = Arc::downgrade(queue);
        let handle = self
            .timers
            .schedule_periodically(queue.key().clone(), self.message_timeout, move || {
                if let (Some(inner), Some(queue)) = (me.upgrade(), target.upgrade()) {
                    inner.on_timer(&queue);
                }
            });
        if let Some(previous) = queue.replace_flush_timer(handle) {
            previous.cancel();
        }
    }

    /// Cancel the flush timer of an evicted queue. A queue created for the same key since keeps its own timer.
    fn disarm_timer(&self, queue: &Queue<M, S>) {
        if let Some(handle) = queue.take_flush_timer() {
            self.timers.cancel_handle(queue.key(), &handle);
        }
    }

    fn on_timer(&self, queue: &Arc<Queue<M, S>>) {
        if self.state() == ReporterState::Shutdown {
            return;
        }
        // a flush thread already owns the queue
        if queue.is_empty() || !queue.try_mark_in_flight() {
            return;
        }
        self.flush(queue);
        queue.clear_in_flight();
        self.offer_if_full(queue);
    }

    /// Hand `queue` to the flush threads if it reached the threshold while it was in flight.
    fn offer_if_full(&self, queue: &Arc<Queue<M, S>>) {
        if queue.len() >= self.queued_max_messages && self.state() != ReporterState::Shutdown {
            self.synchronizer.offer(queue);
        }
    }

    /// [`Self::flush`] while holding the queue's in-flight mark, waiting for a flush thread or timer that holds it.
    fn flush_exclusive(&self, queue: &Arc<Queue<M, S>>) -> Future<()> {
        let backoff = Backoff::new();
        while !queue.try_mark_in_flight() {
            // closed or evicted: nothing left to send
            if !queue.is_open() {
                return Future::succeeded(());
            }
            backoff.snooze();
        }
        let flushed = self.flush(queue);
        queue.clear_in_flight();
        self.offer_if_full(queue);
        flushed
    }

    /// Drain one batch from `queue` and send it.
    fn flush(&self, queue: &Arc<Queue<M, S>>) -> Future<()> {
        let mut buffer = self.buffers.acquire();
        let drained = queue.drain_to(&mut buffer);
        let batch: Vec<_> = buffer.drain().collect();
        self.buffers.release(buffer);
        if drained == 0 {
            return Future::succeeded(());
        }

        let result = self.sender.send(batch);
        self.metrics.update_queued_messages(queue.key(), queue.len());
        self.limiter.signal_if_below_limit();

        let name = self.name.clone();
        result.add_listener(move |future| {
            if let Some(cause) = future.cause() {
                rate_limited!(
                    Duration::from_secs(1),
                    skipped => tracing::warn!(reporter = %name, err = %cause, skipped, "batch failed")
                );
            }
        });
        result.future().clone()
    }

    /// Last pass of `close`. Does not wait for in-flight marks: a queue may still sit marked in the ready list with
    /// no flush thread left to poll it.
    fn flush_remaining(&self) {
        for queue in self.manager.elements() {
            let _ = self.flush(&queue).wait();
        }
    }

    fn close(&self) {
        let previous = ReporterState::from_u8(self.state.swap(ReporterState::Shutdown as u8, Ordering::SeqCst));
        if previous == ReporterState::Shutdown {
            self.close_sender();
            return;
        }

        self.limiter.close();
        self.flush_remaining();

        self.synchronizer.wake_all();
        let timeout = self.poll_interval() * 2;
        if !self.running.wait_timeout(timeout) {
            tracing::warn!(reporter = %self.name, ?timeout, "timed out waiting for flush threads to stop");
        }
        let current = thread::current().id();
        for handle in lock(&self.flushers).drain(..) {
            // still running if the wait above timed out
            if handle.is_finished() && handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!(reporter = %self.name, "flush thread panicked");
            }
        }
        self.synchronizer.clear();

        self.timers.clear();
        if let Some(timer) = &self.owned_timer {
            timer.shutdown();
        }
        if self.owns_pool {
            self.sender.pool().shutdown();
        }
        self.close_sender();

        self.registry_cleared.store(true, Ordering::SeqCst);
        let mut dropped = 0;
        for queue in self.manager.clear() {
            dropped += self.drop_queued(&queue);
            self.metrics.remove_queued_messages(queue.key());
        }
        if dropped > 0 {
            tracing::warn!(reporter = %self.name, dropped, "dropped queued messages on close");
        }

        if let Some(exporter) = lock(&self.exporter).take() {
            exporter.shut_down();
        }
        tracing::info!(reporter = %self.name, "reporter shut down");
    }

    fn close_sender(&self) {
        if !self.sender_closed.swap(true, Ordering::SeqCst) {
            self.sender.sender().close();
        }
    }

    /// Close `queue` and fail whatever it still holds. Returns the number of failed messages.
    fn drop_queued(&self, queue: &Queue<M, S>) -> usize {
        queue.close();
        let items = queue.clear();
        let count = items.len();
        if count > 0 {
            fail_closed(items);
        }
        count
    }
}

fn closed<M: Message>(messages: Vec<M>) -> Cause {
    Arc::new(DroppedError::caused_by(Arc::new(Closed), messages))
}

/// Fail every item with one shared [`Closed`] drop.
fn fail_closed<M: Message, R: Send + Sync + 'static>(items: Vec<Pending<M, R>>) {
    let (messages, promises): (Vec<M>, Vec<Promise<R>>) = items.into_iter().map(Pending::into_parts).unzip();
    let cause = closed(messages);
    for promise in promises {
        promise.try_fail(Arc::clone(&cause));
    }
}

/// Counts running flush threads.
#[derive(Default)]
struct Latch {
    running: Mutex<usize>,
    stopped: Condvar,
}

impl Latch {
    fn count_up(&self) {
        *lock(&self.running) += 1;
    }

    fn count_down(&self) {
        let mut running = lock(&self.running);
        *running = running.saturating_sub(1);
        if *running == 0 {
            self.stopped.notify_all();
        }
    }

    /// Wait until the count reaches zero. Returns false on timeout.
    fn wait_timeout(&self, timeout: Duration) -> bool {
        let deadline = deadline_after(timeout);
        let mut running = lock(&self.running);
        while *running > 0 {
            let (guard, timed_out) = wait_until(&self.stopped, running, deadline);
            running = guard;
            if timed_out {
                return *running == 0;
            }
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::{
        metrics::InMemoryMetrics,
        queue::tests::{Msg, msg},
        synchronizer::InFlight,
        time::fakes::ManualClock,
    };

    #[derive(Default)]
    struct Collect {
        sent: Mutex<Vec<Vec<usize>>>,
        closed: AtomicUsize,
    }

    impl Sender<Msg> for Collect {
        type Output = usize;

        fn send(&self, messages: &[Msg]) -> Result<Vec<Result<usize, Cause>>, Cause> {
            lock(&self.sent).push(messages.iter().map(|m| m.id).collect());
            Ok(messages.iter().map(|m| Ok(m.id)).collect())
        }

        fn close(&self) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn quiet(sender: Arc<Collect>) -> ReporterBuilder<Msg, Collect> {
        Reporter::builder_shared(sender)
            .message_timeout(Duration::ZERO)
            .queued_max_messages(1000)
            .buffered_max_messages(10)
    }

    #[test]
    fn lifecycle_moves_forward() {
        let sender = Arc::new(Collect::default());
        let reporter = quiet(sender.clone()).build().unwrap();
        assert_eq!(reporter.state(), ReporterState::Init);

        reporter.report(msg(1)).unwrap();
        assert_eq!(reporter.state(), ReporterState::Started);

        reporter.close();
        assert_eq!(reporter.state(), ReporterState::Shutdown);
        reporter.close();
        assert_eq!(sender.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn close_before_first_report_closes_sender() {
        let sender = Arc::new(Collect::default());
        let reporter = quiet(sender.clone()).build().unwrap();
        drop(reporter);
        assert_eq!(sender.closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn flush_all_sends_in_batches() {
        let sender = Arc::new(Collect::default());
        let reporter = quiet(sender.clone()).build().unwrap();
        let futures: Vec<_> = (0..25).map(|i| reporter.report(msg(i)).unwrap()).collect();
        assert_eq!(reporter.queued_messages(), 25);

        reporter.flush_all();
        assert_eq!(reporter.queued_messages(), 15);
        reporter.flush_all();
        reporter.flush_all();
        for (i, future) in futures.iter().enumerate() {
            assert_eq!(future.wait().ok(), Some(&i));
        }
        let sizes: Vec<_> = lock(&sender.sent).iter().map(Vec::len).collect();
        assert_eq!(sizes, vec![10, 10, 5]);
        assert_eq!(reporter.queued_messages(), 0);
    }

    #[test]
    fn flush_of_unknown_key_is_none() {
        let reporter = quiet(Arc::new(Collect::default())).build().unwrap();
        assert!(reporter.flush(&"missing").is_none());
        reporter.report(msg(0)).unwrap();
        let flushed = reporter.flush(&"k").unwrap();
        assert!(flushed.wait_timeout(Duration::from_secs(60)));
        // nothing left to send
        assert!(reporter.flush(&"k").unwrap().is_success());
    }

    #[test]
    fn report_after_close_fails_with_closed() {
        let metrics = Arc::new(InMemoryMetrics::<&'static str>::new());
        let reporter = quiet(Arc::new(Collect::default()))
            .metrics(metrics.clone())
            .build()
            .unwrap();
        reporter.close();
        let future = reporter.report(msg(1)).unwrap();
        let dropped = future
            .cause()
            .unwrap()
            .downcast_ref::<DroppedError>()
            .unwrap();
        assert!(dropped.cause().unwrap().is::<Closed>());
        assert_eq!(metrics.messages(), 1);
        assert_eq!(metrics.messages_dropped(), 1);
    }

    #[test]
    fn fail_policy_hands_message_back() {
        let metrics = Arc::new(InMemoryMetrics::<&'static str>::new());
        let reporter = quiet(Arc::new(Collect::default()))
            .queued_max_messages(2)
            .overflow_policy(OverflowPolicy::Fail)
            .flush_threads(1)
            .metrics(metrics.clone())
            .build()
            .unwrap();
        // keep the flush thread from draining by holding the queue in flight
        reporter.report(msg(0)).unwrap();
        let queue = reporter.inner.manager.peek(&"k").unwrap();
        assert!(queue.try_mark_in_flight());
        reporter.report(msg(1)).unwrap();

        let err = reporter.report(msg(2)).unwrap_err();
        assert_eq!(err.max_size(), 2);
        assert_eq!(err.into_inner().id, 2);
        assert_eq!(metrics.messages_dropped(), 1);
        queue.clear_in_flight();
    }

    #[test]
    fn flush_waits_for_the_queue_to_leave_flight() {
        let sender = Arc::new(Collect::default());
        let reporter = quiet(sender.clone()).build().unwrap();
        let future = reporter.report(msg(0)).unwrap();
        let queue = reporter.inner.manager.peek(&"k").unwrap();
        assert!(queue.try_mark_in_flight());

        thread::scope(|scope| {
            let flusher = scope.spawn(|| reporter.flush(&"k").unwrap());
            thread::sleep(Duration::from_millis(20));
            assert!(lock(&sender.sent).is_empty());
            assert_eq!(queue.len(), 1);

            queue.clear_in_flight();
            let flushed = flusher.join().unwrap();
            assert!(flushed.wait_timeout(Duration::from_secs(60)));
        });
        assert_eq!(future.wait().ok(), Some(&0));
        assert_eq!(*lock(&sender.sent), vec![vec![0]]);
        assert!(!queue.is_in_flight());
    }

    #[test]
    fn full_queue_is_handed_over_when_released() {
        let sender = Arc::new(Collect::default());
        let reporter = quiet(sender.clone()).queued_max_messages(2).build().unwrap();
        reporter.report(msg(0)).unwrap();
        let queue = reporter.inner.manager.peek(&"k").unwrap();
        // held by someone else while it fills up: the threshold offer is lost
        assert!(queue.try_mark_in_flight());
        let future = reporter.report(msg(1)).unwrap();
        thread::sleep(Duration::from_millis(20));
        assert!(lock(&sender.sent).is_empty());

        reporter.inner.synchronizer.release(&queue);
        reporter.inner.offer_if_full(&queue);
        assert!(future.wait_timeout(Duration::from_secs(60)));
        assert_eq!(*lock(&sender.sent), vec![vec![0, 1]]);
    }

    /// Runs a hook when a key's gauge is removed, right after its queue left the registry.
    #[derive(Default)]
    struct OnRemove {
        hook: Mutex<Option<Box<dyn FnOnce() + Send>>>,
    }

    impl ReporterMetrics<&'static str> for OnRemove {
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

        fn update_queued_messages(&self, _key: &&'static str, _queued: usize) {}

        fn remove_queued_messages(&self, _key: &&'static str) {
            let hook = lock(&self.hook).take();
            if let Some(hook) = hook {
                hook();
            }
        }
    }

    #[test]
    fn eviction_keeps_the_timer_of_a_recreated_queue() {
        let clock = ManualClock::new();
        let metrics = Arc::new(OnRemove::default());
        let reporter = Arc::new(
            quiet(Arc::new(Collect::default()))
                .message_timeout(Duration::from_secs(3600))
                .time_source(TimeSource::custom(clock.clone()))
                .metrics(metrics.clone())
                .build()
                .unwrap(),
        );
        reporter.report(msg(0)).unwrap();
        reporter.flush_all();
        let evicted = reporter.inner.manager.peek(&"k").unwrap();
        assert!(reporter.inner.timers.is_active(&"k"));

        // a producer recreates the queue after it left the registry, before the eviction callback runs
        let producer = Arc::clone(&reporter);
        *lock(&metrics.hook) = Some(Box::new(move || {
            producer.report(msg(1)).unwrap();
        }));
        clock.advance(Duration::from_secs(61));
        assert_eq!(reporter.inner.manager.evict_if_idle(&evicted), None);

        let recreated = reporter.inner.manager.peek(&"k").unwrap();
        assert!(!Arc::ptr_eq(&evicted, &recreated));
        assert_eq!(recreated.len(), 1);
        assert!(reporter.inner.timers.is_active(&"k"));
        assert!(evicted.take_flush_timer().is_none());
        let timer = recreated.take_flush_timer().unwrap();
        assert!(!timer.is_cancelled());
        reporter.close();
    }

    #[test]
    fn invalid_settings_are_rejected() {
        let err = quiet(Arc::new(Collect::default()))
            .queued_max_messages(10)
            .total_queued_messages(5)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("total_queued_messages"));

        let err = quiet(Arc::new(Collect::default()))
            .flush_threads(0)
            .build()
            .unwrap_err();
        assert!(err.to_string().contains("flush_threads must be positive"));
    }

    #[test]
    fn latch_waits_for_count_down() {
        let latch = Arc::new(Latch::default());
        assert!(latch.wait_timeout(Duration::ZERO));
        latch.count_up();
        assert!(!latch.wait_timeout(Duration::from_millis(10)));
        let counter = latch.clone();
        let handle = thread::spawn(move || counter.count_down());
        assert!(latch.wait_timeout(Duration::from_secs(60)));
        handle.join().unwrap();
    }
}
