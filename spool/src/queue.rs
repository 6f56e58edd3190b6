// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Bounded per-key queue of pending messages.

use std::{
    collections::VecDeque,
    fmt,
    sync::{
        Arc, Condvar, Mutex, MutexGuard,
        atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering},
    },
    time::{Duration, Instant},
};

use spool_core::{CapacityError, DroppedError, Message, OverflowPolicy, Promise};

use crate::{
    buffer::Accept,
    error::OfferError,
    limiter::MemoryLimiter,
    rate_limit::rate_limited,
    sync::{lock, wait},
    synchronizer::InFlight,
    time::TimeSource,
    timer::TimerHandle,
};

/// A message waiting to be sent, with the promise resolved by its delivery.
pub struct Pending<M, R> {
    pub message: M,
    pub promise: Promise<R>,
}

impl<M, R> Pending<M, R> {
    pub fn new(message: M, promise: Promise<R>) -> Self {
        Self { message, promise }
    }

    pub fn into_parts(self) -> (M, Promise<R>) {
        (self.message, self.promise)
    }
}

impl<M: Message, R: Send + Sync + 'static> Pending<M, R> {
    /// Fail the promise because an overflow policy dropped this message.
    pub fn drop_overflow(self, policy: OverflowPolicy) {
        let (message, promise) = self.into_parts();
        promise.try_fail(Arc::new(DroppedError::overflow(policy, vec![message])));
    }
}

impl<M: fmt::Debug, R> fmt::Debug for Pending<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Pending")
            .field("message", &self.message)
            .field("promise", &self.promise)
            .finish()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    // evicted for idleness, producers should look the key up again
    Retired,
    Closed,
}

struct Elements<T> {
    items: VecDeque<T>,
    state: State,
}

/// Bounded FIFO of [`Pending`] messages sharing one key.
///
/// All mutations happen under the queue's own lock, which also keeps the reporter-wide [`MemoryLimiter`] total in
/// step with the contents. [`SizeBoundedQueue::len`] is readable without the lock.
///
/// Messages dropped by the overflow policy are failed after the lock is released, so promise listeners never run
/// under it.
pub struct SizeBoundedQueue<M: Message, R> {
    key: M::Key,
    max_size: usize,
    policy: OverflowPolicy,
    size: AtomicUsize,
    elements: Mutex<Elements<Pending<M, R>>>,
    not_full: Condvar,
    in_flight: AtomicBool,
    limiter: Arc<MemoryLimiter>,
    time: TimeSource,
    created: Instant,
    last_access_nanos: AtomicU64,
    eviction: TimerHandle,
    // periodic flush timer armed by the reporter, if any
    flush_timer: Mutex<Option<TimerHandle>>,
}

enum Overflowed<T> {
    None,
    One(T),
    Many(Vec<T>),
}

impl<M: Message, R: Send + Sync + 'static> SizeBoundedQueue<M, R> {
    pub fn new(
        key: M::Key,
        max_size: usize,
        policy: OverflowPolicy,
        limiter: Arc<MemoryLimiter>,
        time: TimeSource,
    ) -> Self {
        let created = time.now();
        Self {
            key,
            max_size: max_size.max(1),
            policy,
            size: AtomicUsize::new(0),
            elements: Mutex::new(Elements {
                items: VecDeque::new(),
                state: State::Open,
            }),
            not_full: Condvar::new(),
            in_flight: AtomicBool::new(false),
            limiter,
            time,
            created,
            last_access_nanos: AtomicU64::new(0),
            eviction: TimerHandle::new(),
            flush_timer: Mutex::new(None),
        }
    }

    /// Insert `item`, applying the overflow policy if the queue is full.
    ///
    /// Under the drop policies the call always succeeds, failing whichever message the policy selected. Under
    /// [`OverflowPolicy::Fail`] a full queue hands the item back in [`OfferError::Full`]. Under
    /// [`OverflowPolicy::BackPressure`] the caller blocks until a drain makes room or the queue is closed.
    pub fn offer(&self, item: Pending<M, R>) -> Result<(), OfferError<Pending<M, R>>> {
        self.touch();
        let mut elements = lock(&self.elements);
        let overflowed = loop {
            match elements.state {
                State::Open => {}
                State::Retired => return Err(OfferError::Retired(item)),
                State::Closed => return Err(OfferError::Closed(item)),
            }
            let len = elements.items.len();
            if len < self.max_size {
                self.push(&mut elements, item);
                break Overflowed::None;
            }
            match self.policy {
                OverflowPolicy::DropNew => break Overflowed::One(item),
                OverflowPolicy::Fail => {
                    return Err(OfferError::Full(CapacityError::new(item, self.max_size, len)));
                }
                OverflowPolicy::DropHead => {
                    let head = elements.items.pop_front();
                    elements.items.push_back(item);
                    break head.map_or(Overflowed::None, Overflowed::One);
                }
                OverflowPolicy::DropTail => {
                    let tail = elements.items.pop_back();
                    elements.items.push_back(item);
                    break tail.map_or(Overflowed::None, Overflowed::One);
                }
                OverflowPolicy::DropBuffer => {
                    let dropped: Vec<_> = elements.items.drain(..).collect();
                    self.limiter.release(dropped.len());
                    self.push(&mut elements, item);
                    break Overflowed::Many(dropped);
                }
                OverflowPolicy::BackPressure => {
                    elements = wait(&self.not_full, elements);
                }
            }
        };
        drop(elements);

        let dropped = match overflowed {
            Overflowed::None => return Ok(()),
            Overflowed::One(item) => {
                item.drop_overflow(self.policy);
                1
            }
            Overflowed::Many(items) => {
                let n = items.len();
                for item in items {
                    item.drop_overflow(self.policy);
                }
                n
            }
        };
        rate_limited!(
            Duration::from_secs(1),
            skipped => tracing::warn!(
                key = ?self.key,
                policy = %self.policy,
                dropped,
                skipped,
                "queue is full, dropping messages"
            )
        );
        Ok(())
    }

    fn push(&self, elements: &mut MutexGuard<'_, Elements<Pending<M, R>>>, item: Pending<M, R>) {
        elements.items.push_back(item);
        self.size.store(elements.items.len(), Ordering::Release);
        self.limiter.acquire(1);
    }

    /// Move items from the head of the queue into `target` until it refuses one, which is put back.
    ///
    /// Returns the number of items moved. Under [`OverflowPolicy::BackPressure`] up to that many blocked producers
    /// are woken.
    pub fn drain_to(&self, target: &mut impl Accept<Pending<M, R>>) -> usize {
        let mut elements = lock(&self.elements);
        let mut drained = 0;
        while let Some(item) = elements.items.pop_front() {
            if let Err(item) = target.accept(item) {
                elements.items.push_front(item);
                break;
            }
            drained += 1;
        }
        if drained > 0 {
            self.size.store(elements.items.len(), Ordering::Release);
            self.limiter.release(drained);
            if self.policy.is_back_pressure() {
                for _ in 0..drained {
                    self.not_full.notify_one();
                }
            }
        }
        drained
    }

    /// Remove and return every queued item.
    pub fn clear(&self) -> Vec<Pending<M, R>> {
        let mut elements = lock(&self.elements);
        let items: Vec<_> = elements.items.drain(..).collect();
        self.size.store(0, Ordering::Release);
        self.limiter.release(items.len());
        self.not_full.notify_all();
        items
    }

    /// Stop accepting items and release producers blocked by back pressure. Queued items stay queued.
    pub fn close(&self) {
        lock(&self.elements).state = State::Closed;
        self.not_full.notify_all();
    }

    /// Retire the queue if it is empty. Returns false if an item slipped in.
    pub(crate) fn retire_if_empty(&self) -> bool {
        let mut elements = lock(&self.elements);
        if !elements.items.is_empty() || elements.state != State::Open {
            return false;
        }
        elements.state = State::Retired;
        self.not_full.notify_all();
        true
    }

    pub fn is_closed(&self) -> bool {
        lock(&self.elements).state == State::Closed
    }

    /// Neither retired nor closed.
    pub fn is_open(&self) -> bool {
        lock(&self.elements).state == State::Open
    }
}

impl<M: Message, R> SizeBoundedQueue<M, R> {
    pub fn key(&self) -> &M::Key {
        &self.key
    }

    pub fn len(&self) -> usize {
        self.size.load(Ordering::Acquire)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Returns true once the queue holds at least `max_size` items.
    pub fn is_full(&self) -> bool {
        self.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn policy(&self) -> OverflowPolicy {
        self.policy
    }

    /// Record an access for idle tracking.
    pub fn touch(&self) {
        let elapsed = self.time.now().saturating_duration_since(self.created);
        let nanos = u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX);
        self.last_access_nanos.fetch_max(nanos, Ordering::Relaxed);
    }

    /// Time elapsed since the last access, measured at `now`.
    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.created + Duration::from_nanos(self.last_access_nanos.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    pub fn is_in_flight(&self) -> bool {
        self.in_flight.load(Ordering::Acquire)
    }

    pub(crate) fn eviction_handle(&self) -> &TimerHandle {
        &self.eviction
    }

    /// Remember `handle` as this queue's flush timer, returning the one it replaces.
    pub(crate) fn replace_flush_timer(&self, handle: TimerHandle) -> Option<TimerHandle> {
        lock(&self.flush_timer).replace(handle)
    }

    pub(crate) fn take_flush_timer(&self) -> Option<TimerHandle> {
        lock(&self.flush_timer).take()
    }
}

impl<M: Message, R> InFlight for SizeBoundedQueue<M, R> {
    fn try_mark_in_flight(&self) -> bool {
        self.in_flight
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn clear_in_flight(&self) {
        self.in_flight.store(false, Ordering::Release);
    }
}

impl<M: Message, R> fmt::Debug for SizeBoundedQueue<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SizeBoundedQueue")
            .field("key", &self.key)
            .field("len", &self.len())
            .field("max_size", &self.max_size)
            .field("policy", &self.policy)
            .field("in_flight", &self.is_in_flight())
            .finish()
    }
}
