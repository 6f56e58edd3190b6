// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::VecDeque,
    sync::{Arc, Condvar, Mutex},
    time::Duration,
};

use crate::sync::{deadline_after, lock, wait_until};

/// Something that can be checked out for exclusive draining.
pub trait InFlight {
    /// Set the in-flight mark. Returns false if it was already set.
    fn try_mark_in_flight(&self) -> bool;

    fn clear_in_flight(&self);
}

/// Hands queues that are ready to drain to flush workers.
///
/// A queue is marked in flight when it is offered, and stays marked until the worker that polled it calls
/// [`FlushSynchronizer::release`]. Offering a queue that is already marked is a no-op, so no queue is ever drained
/// by two workers at once.
pub struct FlushSynchronizer<T> {
    ready: Mutex<ReadyQueues<T>>,
    available: Condvar,
}

struct ReadyQueues<T> {
    queues: VecDeque<Arc<T>>,
    // bumped by wake_all
    wakeups: u64,
}

impl<T> Default for FlushSynchronizer<T> {
    fn default() -> Self {
        Self {
            ready: Mutex::new(ReadyQueues {
                queues: VecDeque::new(),
                wakeups: 0,
            }),
            available: Condvar::new(),
        }
    }
}

impl<T: InFlight> FlushSynchronizer<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Enqueue `queue` unless it is already in flight, waking one waiting worker. Returns whether it was enqueued.
    pub fn offer(&self, queue: &Arc<T>) -> bool {
        if !queue.try_mark_in_flight() {
            return false;
        }
        lock(&self.ready).queues.push_back(Arc::clone(queue));
        self.available.notify_one();
        true
    }

    /// Wait up to `timeout` for a ready queue. Returns early with whatever is ready after [`Self::wake_all`].
    pub fn poll(&self, timeout: Duration) -> Option<Arc<T>> {
        let deadline = deadline_after(timeout);
        let mut ready = lock(&self.ready);
        let wakeups = ready.wakeups;
        loop {
            if let Some(queue) = ready.queues.pop_front() {
                return Some(queue);
            }
            let (guard, timed_out) = wait_until(&self.available, ready, deadline);
            ready = guard;
            if timed_out || ready.wakeups != wakeups {
                return ready.queues.pop_front();
            }
        }
    }

    /// Allow `queue` to be offered again.
    pub fn release(&self, queue: &T) {
        queue.clear_in_flight();
    }

    /// Drop every ready queue, clearing their marks.
    pub fn clear(&self) {
        let ready: Vec<_> = lock(&self.ready).queues.drain(..).collect();
        for queue in ready {
            queue.clear_in_flight();
        }
    }

    /// Wake every waiting worker, so they can notice shutdown before their poll times out.
    pub fn wake_all(&self) {
        lock(&self.ready).wakeups += 1;
        self.available.notify_all();
    }

    pub fn len(&self) -> usize {
        lock(&self.ready).queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
