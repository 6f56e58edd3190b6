// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    fmt,
    sync::{Arc, RwLock, Weak},
    time::Duration,
};

use spool_core::{Message, OverflowPolicy};

use crate::{
    limiter::MemoryLimiter,
    metrics::ReporterMetrics,
    queue::SizeBoundedQueue,
    sync::{read, write},
    time::TimeSource,
    timer::{Timer, schedule_recurring},
};

type Queue<M, R> = SizeBoundedQueue<M, R>;
type Callback<T> = Box<dyn Fn(&T) + Send + Sync>;

/// Registry of per-key queues.
///
/// Queues are created on first use. Each queue gets a recurring eviction check on the shared timer: once a queue is
/// empty and has not been accessed for `keep_alive`, it is retired and removed. A producer still holding a retired
/// queue sees [`OfferError::Retired`](crate::error::OfferError::Retired) and looks the key up again.
pub struct QueueManager<M: Message, R> {
    queues: RwLock<HashMap<M::Key, Arc<Queue<M, R>>, ahash::RandomState>>,
    max_size: usize,
    policy: OverflowPolicy,
    keep_alive: Duration,
    limiter: Arc<MemoryLimiter>,
    time: TimeSource,
    timer: Arc<dyn Timer>,
    metrics: Arc<dyn ReporterMetrics<M::Key>>,
    on_create: Option<Callback<Arc<Queue<M, R>>>>,
    on_evict: Option<Callback<Arc<Queue<M, R>>>>,
}

/// Settings shared by every queue of a [`QueueManager`].
pub struct QueueManagerBuilder<M: Message, R> {
    max_size: usize,
    policy: OverflowPolicy,
    keep_alive: Duration,
    limiter: Arc<MemoryLimiter>,
    time: TimeSource,
    timer: Arc<dyn Timer>,
    metrics: Arc<dyn ReporterMetrics<M::Key>>,
    on_create: Option<Callback<Arc<Queue<M, R>>>>,
    on_evict: Option<Callback<Arc<Queue<M, R>>>>,
}

impl<M: Message, R: Send + Sync + 'static> QueueManagerBuilder<M, R> {
    pub fn max_size(mut self, max_size: usize) -> Self {
        self.max_size = max_size;
        self
    }

    pub fn policy(mut self, policy: OverflowPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// How long an empty queue may stay idle before it is evicted.
    pub fn keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn limiter(mut self, limiter: Arc<MemoryLimiter>) -> Self {
        self.limiter = limiter;
        self
    }

    pub fn time_source(mut self, time: TimeSource) -> Self {
        self.time = time;
        self
    }

    pub fn metrics(mut self, metrics: Arc<dyn ReporterMetrics<M::Key>>) -> Self {
        self.metrics = metrics;
        self
    }

    /// Called once for every newly created queue.
    pub fn on_create(mut self, f: impl Fn(&Arc<Queue<M, R>>) + Send + Sync + 'static) -> Self {
        self.on_create = Some(Box::new(f));
        self
    }

    /// Called with every evicted queue, after it left the registry.
    pub fn on_evict(mut self, f: impl Fn(&Arc<Queue<M, R>>) + Send + Sync + 'static) -> Self {
        self.on_evict = Some(Box::new(f));
        self
    }

    pub fn build(self) -> Arc<QueueManager<M, R>> {
        Arc::new(QueueManager {
            queues: RwLock::new(HashMap::default()),
            max_size: self.max_size,
            policy: self.policy,
            keep_alive: self.keep_alive,
            limiter: self.limiter,
            time: self.time,
            timer: self.timer,
            metrics: self.metrics,
            on_create: self.on_create,
            on_evict: self.on_evict,
        })
    }
}

impl<M: Message, R: Send + Sync + 'static> QueueManager<M, R> {
    pub fn builder(timer: Arc<dyn Timer>) -> QueueManagerBuilder<M, R> {
        QueueManagerBuilder {
            max_size: 10_000,
            policy: OverflowPolicy::default(),
            keep_alive: Duration::from_secs(60),
            limiter: Arc::new(MemoryLimiter::new(100_000)),
            time: TimeSource::System,
            timer,
            metrics: Arc::new(crate::metrics::NoopMetrics),
            on_create: None,
            on_evict: None,
        }
    }

    /// The queue for `key`, if it exists. Records an access.
    pub fn get(&self, key: &M::Key) -> Option<Arc<Queue<M, R>>> {
        let queue = read(&self.queues).get(key).cloned()?;
        queue.touch();
        Some(queue)
    }

    /// The queue for `key`, if it exists, without recording an access.
    pub fn peek(&self, key: &M::Key) -> Option<Arc<Queue<M, R>>> {
        read(&self.queues).get(key).cloned()
    }

    /// The queue for `key`, created (and armed for eviction) if needed. Records an access.
    pub fn get_or_create(self: &Arc<Self>, key: &M::Key) -> Arc<Queue<M, R>> {
        if let Some(queue) = self.get(key) {
            return queue;
        }
        let queue = {
            let mut queues = write(&self.queues);
            if let Some(queue) = queues.get(key) {
                queue.touch();
                return Arc::clone(queue);
            }
            let queue = Arc::new(SizeBoundedQueue::new(
                key.clone(),
                self.max_size,
                self.policy,
                Arc::clone(&self.limiter),
                self.time.clone(),
            ));
            queue.touch();
            queues.insert(key.clone(), Arc::clone(&queue));
            queue
        };
        tracing::debug!(?key, "created queue");

        let manager = Arc::downgrade(self);
        let evicted = Arc::downgrade(&queue);
        schedule_recurring(
            &*self.timer,
            queue.eviction_handle().clone(),
            self.keep_alive,
            move || check_idle(&manager, &evicted),
        );
        if let Some(on_create) = &self.on_create {
            on_create(&queue);
        }
        queue
    }

    /// Evict the queue if it is empty and idle past the keep-alive. Returns the delay until the next check, or
    /// `None` if the queue is gone.
    pub fn evict_if_idle(&self, queue: &Arc<Queue<M, R>>) -> Option<Duration> {
        let idle = queue.idle_for(self.time.now());
        if !queue.is_empty() || idle < self.keep_alive {
            let remaining = self.keep_alive.saturating_sub(idle);
            return Some(if remaining.is_zero() {
                self.keep_alive
            } else {
                remaining
            });
        }

        let key = queue.key();
        {
            let mut queues = write(&self.queues);
            match queues.get(key) {
                Some(current) if Arc::ptr_eq(current, queue) => {}
                // replaced or already removed
                _ => return None,
            }
            if !queue.retire_if_empty() {
                return Some(self.keep_alive);
            }
            queues.remove(key);
        }
        queue.eviction_handle().cancel();
        self.metrics.remove_queued_messages(key);
        if let Some(on_evict) = &self.on_evict {
            on_evict(queue);
        }
        tracing::debug!(?key, ?idle, "evicted idle queue");
        None
    }

    /// Snapshot of every queue.
    pub fn elements(&self) -> Vec<Arc<Queue<M, R>>> {
        read(&self.queues).values().cloned().collect()
    }

    /// Remove every queue, cancelling their eviction checks. Returns the removed queues.
    pub fn clear(&self) -> Vec<Arc<Queue<M, R>>> {
        let queues: Vec<_> = write(&self.queues).drain().map(|(_, queue)| queue).collect();
        for queue in &queues {
            queue.eviction_handle().cancel();
        }
        queues
    }

    pub fn len(&self) -> usize {
        read(&self.queues).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

fn check_idle<M: Message, R: Send + Sync + 'static>(
    manager: &Weak<QueueManager<M, R>>,
    queue: &Weak<Queue<M, R>>,
) -> Option<Duration> {
    let manager = manager.upgrade()?;
    let queue = queue.upgrade()?;
    manager.evict_if_idle(&queue)
}

impl<M: Message, R> fmt::Debug for QueueManager<M, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("QueueManager")
            .field("queues", &read(&self.queues).len())
            .field("max_size", &self.max_size)
            .field("policy", &self.policy)
            .field("keep_alive", &self.keep_alive)
            .finish_non_exhaustive()
    }
}
