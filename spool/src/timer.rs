// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Delayed task scheduling.
//!
//! The reporter only depends on the [`Timer`] contract: run a task once after a delay, unless its [`TimerHandle`]
//! was cancelled first. Recurring work (idle eviction, periodic per-key flushes) is built on top with
//! [`schedule_recurring`], where each run decides whether and when to run again.
//!
//! [`WheelTimer`] is the default implementation, a hashed timing wheel driven by one thread, with tasks run on a
//! small pool of runner threads so a slow task does not delay the wheel.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex, Weak,
        atomic::{AtomicBool, Ordering},
        mpsc,
    },
    thread,
    time::{Duration, Instant},
};

use crossbeam_utils::sync::{Parker, Unparker};
use spool_core::panic_message;

use crate::{
    error::BuildError,
    sync::lock,
};

pub type TimerTask = Box<dyn FnOnce(&dyn Timer) + Send>;

/// Schedules tasks to run once after a delay.
///
/// Tasks receive the timer that ran them, so they can schedule follow-up work.
pub trait Timer: Send + Sync {
    /// Run `task` after `delay` unless `handle` is cancelled before then.
    fn schedule_with(&self, delay: Duration, handle: TimerHandle, task: TimerTask);

    /// Run `task` after `delay`. The returned handle cancels it.
    fn schedule_once(&self, delay: Duration, task: TimerTask) -> TimerHandle {
        let handle = TimerHandle::new();
        self.schedule_with(delay, handle.clone(), task);
        handle
    }
}

/// Shared cancellation flag for scheduled tasks. A cancelled task never runs.
#[derive(Debug, Clone, Default)]
pub struct TimerHandle(Arc<AtomicBool>);

impl TimerHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }

    /// Whether both handles cancel the same task.
    pub fn ptr_eq(&self, other: &TimerHandle) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}

/// Run `task` after `delay`, then again after whatever delay it returns, until it returns `None` or `handle` is
/// cancelled.
pub fn schedule_recurring<F>(timer: &dyn Timer, handle: TimerHandle, delay: Duration, task: F)
where
    F: FnMut() -> Option<Duration> + Send + 'static,
{
    let next_handle = handle.clone();
    timer.schedule_with(
        delay,
        handle,
        Box::new(move |timer| run_recurring(timer, next_handle, task)),
    );
}

fn run_recurring<F>(timer: &dyn Timer, handle: TimerHandle, mut task: F)
where
    F: FnMut() -> Option<Duration> + Send + 'static,
{
    if handle.is_cancelled() {
        return;
    }
    if let Some(next) = task() {
        schedule_recurring(timer, handle, next, task);
    }
}

/// Builder for [`WheelTimer`].
pub struct WheelTimerBuilder {
    tick_duration: Duration,
    ticks_per_wheel: usize,
    threads: usize,
    name: String,
}

impl Default for WheelTimerBuilder {
    fn default() -> Self {
        Self {
            tick_duration: Duration::from_millis(100),
            ticks_per_wheel: 512,
            threads: 1,
            name: "spool-timer".into(),
        }
    }
}

impl WheelTimerBuilder {
    /// Timer resolution. Defaults to 100ms. Tasks run at most one tick late.
    pub fn tick_duration(mut self, tick_duration: Duration) -> Self {
        self.tick_duration = tick_duration;
        self
    }

    /// Number of wheel slots, rounded up to a power of two. Defaults to 512.
    pub fn ticks_per_wheel(mut self, ticks_per_wheel: usize) -> Self {
        self.ticks_per_wheel = ticks_per_wheel;
        self
    }

    /// Number of threads running due tasks. Defaults to 1.
    pub fn threads(mut self, threads: usize) -> Self {
        self.threads = threads;
        self
    }

    /// Prefix for the names of the timer's threads.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    pub fn build(self) -> Result<WheelTimer, BuildError> {
        if self.tick_duration.is_zero() {
            return Err(BuildError::invalid("timer tick duration must be positive"));
        }
        if self.ticks_per_wheel == 0 || self.ticks_per_wheel > 1 << 30 {
            return Err(BuildError::invalid(format!(
                "ticks per wheel must be in 1..=2^30, not {}",
                self.ticks_per_wheel
            )));
        }
        if self.threads == 0 {
            return Err(BuildError::invalid("timer threads must be positive"));
        }
        WheelTimer::start(self)
    }
}

struct Scheduled {
    deadline: Instant,
    handle: TimerHandle,
    task: TimerTask,
}

struct Shared {
    name: String,
    // tasks scheduled since the last tick, moved into the wheel by the wheel thread
    incoming: Mutex<Vec<Scheduled>>,
    unparker: Unparker,
    shutdown: AtomicBool,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

impl Drop for Shared {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::Release);
        self.unparker.unpark();
    }
}

/// Hashed-wheel [`Timer`].
///
/// Cloning is cheap and every clone drives the same wheel, so one timer can be shared by several reporters. The
/// threads stop when [`WheelTimer::shutdown`] is called or the last clone is dropped.
#[derive(Clone)]
pub struct WheelTimer(Arc<Shared>);

impl WheelTimer {
    pub fn builder() -> WheelTimerBuilder {
        WheelTimerBuilder::default()
    }

    fn start(config: WheelTimerBuilder) -> Result<Self, BuildError> {
        let parker = Parker::new();
        let shared = Arc::new(Shared {
            name: config.name.clone(),
            incoming: Mutex::new(Vec::new()),
            unparker: parker.unparker().clone(),
            shutdown: AtomicBool::new(false),
            threads: Mutex::new(Vec::new()),
        });
        let timer = Self(shared);

        let (due_tx, due_rx) = mpsc::channel::<Scheduled>();
        let due_rx = Arc::new(Mutex::new(due_rx));
        let mut threads = Vec::with_capacity(config.threads + 1);
        for i in 0..config.threads {
            let name = format!("{}-runner-{i}", config.name);
            let weak = Arc::downgrade(&timer.0);
            let due_rx = Arc::clone(&due_rx);
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || run_tasks(weak, due_rx))
                .map_err(|err| BuildError::spawn(name, err))?;
            threads.push(handle);
        }

        let wheel = Wheel::new(
            config.tick_duration,
            config.ticks_per_wheel.next_power_of_two(),
        );
        let name = format!("{}-wheel", config.name);
        let weak = Arc::downgrade(&timer.0);
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || wheel.run(weak, parker, due_tx))
            .map_err(|err| BuildError::spawn(name, err))?;
        threads.push(handle);

        *lock(&timer.0.threads) = threads;
        tracing::debug!(timer = %config.name, "timer started");
        Ok(timer)
    }

    /// Stop the wheel and its runner threads, waiting for them to exit. Tasks that have not run yet are discarded.
    ///
    /// Idempotent. When called from one of the timer's own tasks, that thread is not waited for.
    pub fn shutdown(&self) {
        if self.0.shutdown.swap(true, Ordering::AcqRel) {
            return;
        }
        self.0.unparker.unpark();
        let current = thread::current().id();
        let threads: Vec<_> = lock(&self.0.threads).drain(..).collect();
        for handle in threads {
            if handle.thread().id() == current {
                continue;
            }
            if handle.join().is_err() {
                tracing::warn!(timer = %self.0.name, "timer thread panicked");
            }
        }
        tracing::info!(timer = %self.0.name, "timer stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        self.0.shutdown.load(Ordering::Acquire)
    }
}

impl Timer for WheelTimer {
    fn schedule_with(&self, delay: Duration, handle: TimerHandle, task: TimerTask) {
        if self.is_shutdown() {
            tracing::debug!(timer = %self.0.name, "timer is stopped, discarding task");
            return;
        }
        let deadline = crate::sync::deadline_after(delay);
        lock(&self.0.incoming).push(Scheduled {
            deadline,
            handle,
            task,
        });
    }
}

impl fmt::Debug for WheelTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WheelTimer")
            .field("name", &self.0.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

struct Wheel {
    tick_duration: Duration,
    mask: u64,
    slots: Vec<Vec<(u64, Scheduled)>>,
    start: Instant,
    tick: u64,
    next_tick: Instant,
}

impl Wheel {
    fn new(tick_duration: Duration, len: usize) -> Self {
        let start = Instant::now();
        Self {
            tick_duration,
            mask: len as u64 - 1,
            slots: (0..len).map(|_| Vec::new()).collect(),
            start,
            tick: 0,
            next_tick: start + tick_duration,
        }
    }

    fn run(mut self, shared: Weak<Shared>, parker: Parker, due: mpsc::Sender<Scheduled>) {
        let name = shared
            .upgrade()
            .map(|shared| shared.name.clone())
            .unwrap_or_default();
        let span = tracing::span!(tracing::Level::TRACE, "spool timer wheel", timer = %name);
        let _enter = span.enter();

        loop {
            while Instant::now() < self.next_tick {
                parker.park_deadline(self.next_tick);
                if is_shutdown(&shared) {
                    return;
                }
            }
            let Some(strong) = shared.upgrade() else {
                return;
            };
            if strong.shutdown.load(Ordering::Acquire) {
                return;
            }
            let incoming = std::mem::take(&mut *lock(&strong.incoming));
            drop(strong);

            self.tick += 1;
            self.next_tick += self.tick_duration;
            for scheduled in incoming {
                self.insert(scheduled);
            }
            let slot = (self.tick & self.mask) as usize;
            let current = self.tick;
            let mut remaining = Vec::new();
            for (target, scheduled) in self.slots[slot].drain(..) {
                if scheduled.handle.is_cancelled() {
                    continue;
                }
                if target <= current {
                    if due.send(scheduled).is_err() {
                        return;
                    }
                } else {
                    remaining.push((target, scheduled));
                }
            }
            self.slots[slot] = remaining;
        }
    }

    fn insert(&mut self, scheduled: Scheduled) {
        if scheduled.handle.is_cancelled() {
            return;
        }
        let since_start = scheduled.deadline.saturating_duration_since(self.start);
        let tick_nanos = self.tick_duration.as_nanos().max(1);
        let ticks = since_start.as_nanos().div_ceil(tick_nanos);
        // never schedule into the past, the current slot was already processed
        let target = u64::try_from(ticks).unwrap_or(u64::MAX).max(self.tick);
        self.slots[(target & self.mask) as usize].push((target, scheduled));
    }
}

fn is_shutdown(shared: &Weak<Shared>) -> bool {
    shared
        .upgrade()
        .is_none_or(|shared| shared.shutdown.load(Ordering::Acquire))
}

fn run_tasks(shared: Weak<Shared>, due: Arc<Mutex<mpsc::Receiver<Scheduled>>>) {
    loop {
        let scheduled = match lock(&due).recv() {
            Ok(scheduled) => scheduled,
            Err(_) => return,
        };
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.shutdown.load(Ordering::Acquire) {
            return;
        }
        if scheduled.handle.is_cancelled() {
            continue;
        }
        let span = tracing::span!(tracing::Level::TRACE, "spool timer task", timer = %shared.name);
        let _enter = span.enter();
        let timer = WheelTimer(shared);
        let task = scheduled.task;
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| task(&timer))) {
            tracing::warn!(panic = panic_message(&*panic), "timer task panicked");
        }
    }
}

/// Periodic timers keyed by queue key.
///
/// Arming a key that already has a timer replaces it, so a timer can be pushed back by re-arming it.
pub struct KeyedTimers<K> {
    timer: Arc<dyn Timer>,
    handles: Mutex<HashMap<K, TimerHandle, ahash::RandomState>>,
}

impl<K: Clone + Eq + Hash + Send + 'static> KeyedTimers<K> {
    pub fn new(timer: Arc<dyn Timer>) -> Self {
        Self {
            timer,
            handles: Mutex::new(HashMap::default()),
        }
    }

    /// Run `task` every `period` for `key`, cancelling whatever timer `key` had before. Returns the new timer's
    /// handle.
    pub fn schedule_periodically(
        &self,
        key: K,
        period: Duration,
        mut task: impl FnMut() + Send + 'static,
    ) -> TimerHandle {
        let handle = TimerHandle::new();
        if let Some(previous) = lock(&self.handles).insert(key, handle.clone()) {
            previous.cancel();
        }
        schedule_recurring(&*self.timer, handle.clone(), period, move || {
            task();
            Some(period)
        });
        handle
    }

    /// Cancel the timer of `key`. Returns whether there was one.
    pub fn cancel(&self, key: &K) -> bool {
        match lock(&self.handles).remove(key) {
            Some(handle) => {
                handle.cancel();
                true
            }
            None => false,
        }
    }

    /// Cancel `handle` and forget it as the timer of `key`. A newer timer armed for `key` in the meantime is left
    /// alone. Returns whether `handle` was still the timer of `key`.
    pub fn cancel_handle(&self, key: &K, handle: &TimerHandle) -> bool {
        handle.cancel();
        let mut handles = lock(&self.handles);
        match handles.get(key) {
            Some(current) if current.ptr_eq(handle) => {
                handles.remove(key);
                true
            }
            _ => false,
        }
    }

    pub fn is_active(&self, key: &K) -> bool {
        lock(&self.handles)
            .get(key)
            .is_some_and(|handle| !handle.is_cancelled())
    }

    /// Cancel every timer.
    pub fn clear(&self) {
        for (_, handle) in lock(&self.handles).drain() {
            handle.cancel();
        }
    }

    pub fn len(&self) -> usize {
        lock(&self.handles).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
