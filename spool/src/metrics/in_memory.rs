// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{
        Mutex,
        atomic::{AtomicU64, Ordering},
    },
};

use super::ReporterMetrics;
use crate::sync::lock;

/// [`ReporterMetrics`] kept in memory, readable at any time.
pub struct InMemoryMetrics<K> {
    messages: AtomicU64,
    messages_dropped: AtomicU64,
    queued_total: AtomicU64,
    queued: Mutex<HashMap<K, usize, ahash::RandomState>>,
}

impl<K> Default for InMemoryMetrics<K> {
    fn default() -> Self {
        Self {
            messages: AtomicU64::new(0),
            messages_dropped: AtomicU64::new(0),
            queued_total: AtomicU64::new(0),
            queued: Mutex::new(HashMap::default()),
        }
    }
}

impl<K: Eq + Hash> InMemoryMetrics<K> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Messages queued for `key`, as last reported.
    pub fn queued_messages_for(&self, key: &K) -> Option<usize> {
        lock(&self.queued).get(key).copied()
    }

    /// Number of keys with a queued-messages gauge.
    pub fn keys(&self) -> usize {
        lock(&self.queued).len()
    }
}

impl<K: Clone + Eq + Hash + Send + Sync> ReporterMetrics<K> for InMemoryMetrics<K> {
    fn increment_messages(&self, n: u64) {
        self.messages.fetch_add(n, Ordering::Relaxed);
    }

    fn increment_messages_dropped(&self, n: u64) {
        self.messages_dropped.fetch_add(n, Ordering::Relaxed);
    }

    fn messages(&self) -> u64 {
        self.messages.load(Ordering::Relaxed)
    }

    fn messages_dropped(&self) -> u64 {
        self.messages_dropped.load(Ordering::Relaxed)
    }

    fn queued_messages(&self) -> u64 {
        self.queued_total.load(Ordering::Relaxed)
    }

    fn update_queued_messages(&self, key: &K, queued: usize) {
        let mut map = lock(&self.queued);
        let previous = map.insert(key.clone(), queued).unwrap_or(0);
        // the aggregate is only written under the map lock
        let total = self.queued_total.load(Ordering::Relaxed);
        self.queued_total.store(
            total.saturating_sub(previous as u64) + queued as u64,
            Ordering::Relaxed,
        );
    }

    fn remove_queued_messages(&self, key: &K) {
        let mut map = lock(&self.queued);
        if let Some(previous) = map.remove(key) {
            let total = self.queued_total.load(Ordering::Relaxed);
            self.queued_total
                .store(total.saturating_sub(previous as u64), Ordering::Relaxed);
        }
    }
}

impl<K> fmt::Debug for InMemoryMetrics<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryMetrics")
            .field("messages", &self.messages.load(Ordering::Relaxed))
            .field("messages_dropped", &self.messages_dropped.load(Ordering::Relaxed))
            .field("queued_messages", &self.queued_total.load(Ordering::Relaxed))
            .finish()
    }
}
