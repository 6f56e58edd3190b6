// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::{
        Arc,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use derive_where::derive_where;

use crate::{
    error::Cause,
    future::{Future, Promise},
};

/// Aggregate over an ordered list of child futures.
///
/// The aggregate succeeds once every child succeeded, and fails with the first child failure it observes. Children
/// stay individually addressable by their position, so a caller that sent a batch can find out exactly which
/// messages were delivered.
#[derive_where(Clone)]
pub struct CompositeFuture<V> {
    children: Arc<[Future<V>]>,
    aggregate: Future<()>,
}

impl<V: Send + Sync + 'static> CompositeFuture<V> {
    /// Combine `children` in order. An empty list yields an already succeeded aggregate.
    pub fn all(children: impl IntoIterator<Item = Future<V>>) -> Self {
        let children: Arc<[Future<V>]> = children.into_iter().collect();
        if children.is_empty() {
            return Self {
                children,
                aggregate: Future::succeeded(()),
            };
        }

        let promise = Promise::new();
        let remaining = Arc::new(AtomicUsize::new(children.len()));
        for child in children.iter() {
            let promise = promise.clone();
            let remaining = Arc::clone(&remaining);
            child.add_listener(move |child| match child.cause() {
                Some(cause) => {
                    promise.try_fail(Arc::clone(cause));
                }
                None => {
                    if remaining.fetch_sub(1, Ordering::AcqRel) == 1 {
                        // no-op if a sibling already failed the aggregate
                        promise.try_succeed(());
                    }
                }
            });
        }
        Self {
            children,
            aggregate: promise.future().clone(),
        }
    }

    /// Register a listener on the aggregate outcome.
    pub fn add_listener(&self, listener: impl FnOnce(&Future<()>) + Send + 'static) -> &Self {
        self.aggregate.add_listener(listener);
        self
    }
}

impl<V> CompositeFuture<V> {
    /// The aggregate future.
    pub fn future(&self) -> &Future<()> {
        &self.aggregate
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn children(&self) -> &[Future<V>] {
        &self.children
    }

    /// The child at `index`, or `None` when `index >= len()`.
    pub fn child(&self, index: usize) -> Option<&Future<V>> {
        self.children.get(index)
    }

    /// Whether the child at `index` is done.
    pub fn is_complete(&self, index: usize) -> Option<bool> {
        self.child(index).map(Future::is_done)
    }

    /// Whether the child at `index` succeeded.
    pub fn succeeded(&self, index: usize) -> Option<bool> {
        self.child(index).map(Future::is_success)
    }

    /// The failure cause of the child at `index`, if it failed.
    pub fn cause_at(&self, index: usize) -> Option<&Cause> {
        self.child(index).and_then(Future::cause)
    }

    /// The value of the child at `index`, if it succeeded.
    pub fn result_at(&self, index: usize) -> Option<&V> {
        self.child(index).and_then(Future::value)
    }

    pub fn is_done(&self) -> bool {
        self.aggregate.is_done()
    }

    pub fn is_success(&self) -> bool {
        self.aggregate.is_success()
    }

    /// The aggregate failure cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        self.aggregate.cause()
    }

    /// Block until the aggregate is done.
    pub fn wait(&self) -> Result<(), &Cause> {
        self.aggregate.wait().map(|_| ())
    }

    /// Block until the aggregate is done or `timeout` elapses. Returns whether it is done.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        self.aggregate.wait_timeout(timeout)
    }
}

impl<V> std::fmt::Debug for CompositeFuture<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompositeFuture")
            .field("aggregate", &self.aggregate)
            .field("children", &self.children)
            .finish()
    }
}
