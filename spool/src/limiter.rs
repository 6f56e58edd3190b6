// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::{
    Condvar, Mutex,
    atomic::{AtomicBool, AtomicUsize, Ordering},
};

use spool_core::Closed;

use crate::sync::{lock, wait};

/// Absolute ceiling on messages queued by one reporter, whatever the configuration says.
pub const MAX_TOTAL_MESSAGES: usize = 1_000_000;

/// Global cap on messages queued across every key of a reporter.
///
/// Queues add to the total when they accept a message and subtract when they drain or evict. Producers call
/// [`MemoryLimiter::block_until_below_limit`] before offering, and flushes call
/// [`MemoryLimiter::signal_if_below_limit`] after draining.
#[derive(Debug)]
pub struct MemoryLimiter {
    max: usize,
    total: AtomicUsize,
    waiters: AtomicUsize,
    closed: AtomicBool,
    lock: Mutex<()>,
    below_limit: Condvar,
}

impl MemoryLimiter {
    /// `max` is clamped to `1..=MAX_TOTAL_MESSAGES`.
    pub fn new(max: usize) -> Self {
        Self {
            max: max.clamp(1, MAX_TOTAL_MESSAGES),
            total: AtomicUsize::new(0),
            waiters: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            lock: Mutex::new(()),
            below_limit: Condvar::new(),
        }
    }

    pub fn max(&self) -> usize {
        self.max
    }

    /// Messages currently queued across all keys.
    pub fn total(&self) -> usize {
        self.total.load(Ordering::SeqCst)
    }

    pub fn is_at_limit(&self) -> bool {
        self.total() >= self.max
    }

    /// Park the calling thread while the total is at or above the cap.
    ///
    /// Returns [`Closed`] if the limiter is closed before (or while) waiting.
    pub fn block_until_below_limit(&self) -> Result<(), Closed> {
        if !self.is_at_limit() {
            return Ok(());
        }
        let mut guard = lock(&self.lock);
        // registered before the re-check so a concurrent release either sees us or we see its decrement
        self.waiters.fetch_add(1, Ordering::SeqCst);
        while self.is_at_limit() && !self.closed.load(Ordering::SeqCst) {
            guard = wait(&self.below_limit, guard);
        }
        self.waiters.fetch_sub(1, Ordering::SeqCst);
        drop(guard);
        if self.closed.load(Ordering::SeqCst) {
            Err(Closed)
        } else {
            Ok(())
        }
    }

    /// Wake blocked producers, but only if there are any and the total is below the cap.
    pub fn signal_if_below_limit(&self) {
        if self.waiters.load(Ordering::SeqCst) > 0 && !self.is_at_limit() {
            let _guard = lock(&self.lock);
            self.below_limit.notify_all();
        }
    }

    pub(crate) fn acquire(&self, n: usize) {
        self.total.fetch_add(n, Ordering::SeqCst);
    }

    pub(crate) fn release(&self, n: usize) {
        let _ = self
            .total
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |total| {
                Some(total.saturating_sub(n))
            });
    }

    /// Release every blocked producer with [`Closed`]; later waits fail immediately.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let _guard = lock(&self.lock);
        self.below_limit.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{Arc, mpsc},
        thread,
        time::Duration,
    };

    use super::*;

    #[test]
    fn clamps_configuration() {
        assert_eq!(MemoryLimiter::new(0).max(), 1);
        assert_eq!(MemoryLimiter::new(usize::MAX).max(), MAX_TOTAL_MESSAGES);
        assert_eq!(MemoryLimiter::new(10).max(), 10);
    }

    #[test]
    fn limit_tracks_total() {
        let limiter = MemoryLimiter::new(2);
        limiter.acquire(1);
        assert!(!limiter.is_at_limit());
        limiter.acquire(1);
        assert!(limiter.is_at_limit());
        limiter.release(5);
        assert_eq!(limiter.total(), 0);
        assert_eq!(limiter.block_until_below_limit(), Ok(()));
    }

    #[test]
    fn blocks_until_drained_below_limit() {
        let limiter = Arc::new(MemoryLimiter::new(2));
        limiter.acquire(2);
        let (tx, rx) = mpsc::channel();
        let blocked = {
            let limiter = limiter.clone();
            thread::spawn(move || {
                let result = limiter.block_until_below_limit();
                tx.send(()).unwrap();
                result
            })
        };
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());

        // still at the limit: no wake up
        limiter.signal_if_below_limit();
        assert!(rx.recv_timeout(Duration::from_millis(20)).is_err());

        limiter.release(1);
        limiter.signal_if_below_limit();
        rx.recv_timeout(Duration::from_secs(60))
            .expect("producer was never released");
        assert_eq!(blocked.join().unwrap(), Ok(()));
    }

    #[test]
    fn close_releases_blocked_producers() {
        let limiter = Arc::new(MemoryLimiter::new(1));
        limiter.acquire(1);
        let blocked = {
            let limiter = limiter.clone();
            thread::spawn(move || limiter.block_until_below_limit())
        };
        thread::sleep(Duration::from_millis(20));
        limiter.close();
        assert_eq!(blocked.join().unwrap(), Err(Closed));
        assert_eq!(limiter.block_until_below_limit(), Err(Closed));
    }
}
