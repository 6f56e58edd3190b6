// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Single-assignment completion handles.
//!
//! A [`Promise`] is the write side: it moves from pending to exactly one terminal state, either succeeded with a value
//! or failed with a [`Cause`]. A [`Future`] is the read-only view handed to callers. Both are cheap to clone and share
//! the same state.
//!
//! Listeners registered with [`Future::add_listener`] run exactly once, after the terminal transition, on the
//! promise's [`Executor`]. A listener registered on an already completed future runs immediately.

use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    pin::Pin,
    sync::{Arc, Condvar, Mutex, MutexGuard, OnceLock, PoisonError},
    task::{Context, Poll, Waker},
    time::{Duration, Instant},
};

use derive_where::derive_where;
use smallvec::{SmallVec, smallvec};

use crate::error::{AlreadyComplete, Cancelled, Cause};

/// Runs listener notifications somewhere other than the completing thread.
pub trait Execute: Send + Sync {
    fn execute(&self, task: Box<dyn FnOnce() + Send>);
}

/// Where listeners of a promise are invoked.
#[derive(Clone, Default)]
pub enum Executor {
    /// On the thread that completed the promise (or that added the listener, if the promise was already complete).
    #[default]
    Inline,
    /// Handed to an injected executor.
    Spawn(Arc<dyn Execute>),
}

impl Executor {
    pub fn new(execute: impl Execute + 'static) -> Self {
        Self::Spawn(Arc::new(execute))
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Inline => f.write_str("Executor::Inline"),
            Self::Spawn(_) => f.write_str("Executor::Spawn(...)"),
        }
    }
}

type Listener<V> = Box<dyn FnOnce(&Future<V>) + Send>;

enum Outcome<V> {
    Succeeded(V),
    Failed(Cause),
}

struct Shared<V> {
    outcome: OnceLock<Outcome<V>>,
    // Guards listener registration and the terminal transition together, so a listener can never be queued after
    // the completing thread took the list.
    listeners: Mutex<SmallVec<[Listener<V>; 2]>>,
    done: Condvar,
    executor: Executor,
}

impl<V> Shared<V> {
    fn new(executor: Executor) -> Self {
        Self {
            outcome: OnceLock::new(),
            listeners: Mutex::new(SmallVec::new()),
            done: Condvar::new(),
            executor,
        }
    }

    fn completed(outcome: Outcome<V>) -> Self {
        let shared = Self::new(Executor::Inline);
        let _ = shared.outcome.set(outcome);
        shared
    }

    fn lock(&self) -> MutexGuard<'_, SmallVec<[Listener<V>; 2]>> {
        self.listeners.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Read-only view of a [`Promise`].
#[derive_where(Clone)]
pub struct Future<V>(Arc<Shared<V>>);

/// Write side of a single-assignment completion handle.
#[derive_where(Clone)]
pub struct Promise<V> {
    future: Future<V>,
}

impl<V> Future<V> {
    /// A future that is already succeeded. No listener queue is used and waiting never blocks.
    pub fn succeeded(value: V) -> Self {
        Self(Arc::new(Shared::completed(Outcome::Succeeded(value))))
    }

    /// A future that is already failed with `cause`.
    pub fn failed(cause: Cause) -> Self {
        Self(Arc::new(Shared::completed(Outcome::Failed(cause))))
    }

    /// Returns true once the future reached a terminal state.
    pub fn is_done(&self) -> bool {
        self.0.outcome.get().is_some()
    }

    pub fn is_success(&self) -> bool {
        matches!(self.0.outcome.get(), Some(Outcome::Succeeded(_)))
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.0.outcome.get(), Some(Outcome::Failed(_)))
    }

    /// Returns true if the future failed because it was cancelled.
    pub fn is_cancelled(&self) -> bool {
        self.cause().is_some_and(|cause| cause.is::<Cancelled>())
    }

    /// The failure cause, if the future failed.
    pub fn cause(&self) -> Option<&Cause> {
        match self.0.outcome.get() {
            Some(Outcome::Failed(cause)) => Some(cause),
            _ => None,
        }
    }

    /// The value, if the future succeeded.
    pub fn value(&self) -> Option<&V> {
        match self.0.outcome.get() {
            Some(Outcome::Succeeded(value)) => Some(value),
            _ => None,
        }
    }

    /// The outcome, or `None` while pending.
    pub fn result(&self) -> Option<Result<&V, &Cause>> {
        self.0.outcome.get().map(|outcome| match outcome {
            Outcome::Succeeded(value) => Ok(value),
            Outcome::Failed(cause) => Err(cause),
        })
    }

    /// Block the calling thread until the future is done, then return its outcome.
    pub fn wait(&self) -> Result<&V, &Cause> {
        if let Some(result) = self.result() {
            return result;
        }
        let mut guard = self.0.lock();
        while !self.is_done() {
            guard = self
                .0
                .done
                .wait(guard)
                .unwrap_or_else(PoisonError::into_inner);
        }
        drop(guard);
        match self.result() {
            Some(result) => result,
            None => unreachable!("woken without a terminal outcome"),
        }
    }

    /// Block the calling thread until the future is done or `timeout` elapses.
    ///
    /// Returns whether the future is done. Timing out does not change the state of the underlying promise.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        if self.is_done() {
            return true;
        }
        let deadline = Instant::now() + timeout;
        let mut guard = self.0.lock();
        while !self.is_done() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            guard = self
                .0
                .done
                .wait_timeout(guard, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        true
    }
}

impl<V: Send + Sync + 'static> Future<V> {
    /// Register `listener` to run once this future is done.
    ///
    /// If the future is already done the listener is invoked right away on the promise's executor. Panics raised by
    /// listeners are caught and logged; they never affect the promise or other listeners.
    pub fn add_listener(&self, listener: impl FnOnce(&Future<V>) + Send + 'static) -> &Self {
        let listener: Listener<V> = Box::new(listener);
        if !self.is_done() {
            let mut listeners = self.0.lock();
            if !self.is_done() {
                listeners.push(listener);
                return self;
            }
        }
        self.notify(smallvec![listener]);
        self
    }

    /// Adapt this future into a [`std::future::Future`] for async callers.
    pub fn wait_async(&self) -> WaitAsync<V> {
        WaitAsync {
            future: self.clone(),
            waker: None,
        }
    }

    fn notify(&self, listeners: SmallVec<[Listener<V>; 2]>) {
        if listeners.is_empty() {
            return;
        }
        match &self.0.executor {
            Executor::Inline => invoke_all(self, listeners),
            Executor::Spawn(executor) => {
                let future = self.clone();
                executor.execute(Box::new(move || invoke_all(&future, listeners)));
            }
        }
    }
}

fn invoke_all<V>(future: &Future<V>, listeners: SmallVec<[Listener<V>; 2]>) {
    for listener in listeners {
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(|| listener(future))) {
            tracing::warn!(
                panic = panic_message(&*panic),
                "a future listener panicked, ignoring"
            );
        }
    }
}

/// Best-effort text of a caught panic payload.
#[doc(hidden)]
pub fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "<non-string panic payload>"
    }
}

impl<V> fmt::Debug for Future<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = match self.0.outcome.get() {
            None => "pending".to_owned(),
            Some(Outcome::Succeeded(_)) => "succeeded".to_owned(),
            Some(Outcome::Failed(cause)) => format!("failed({cause})"),
        };
        f.debug_tuple("Future").field(&format_args!("{state}")).finish()
    }
}

impl<V> Default for Promise<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> Promise<V> {
    /// A pending promise whose listeners run inline.
    pub fn new() -> Self {
        Self::with_executor(Executor::Inline)
    }

    /// A pending promise whose listeners run on `executor`.
    pub fn with_executor(executor: Executor) -> Self {
        Self {
            future: Future(Arc::new(Shared::new(executor))),
        }
    }

    /// The read-only view of this promise.
    pub fn future(&self) -> &Future<V> {
        &self.future
    }

    pub fn is_done(&self) -> bool {
        self.future.is_done()
    }
}

impl<V: Send + Sync + 'static> Promise<V> {
    /// Succeed the promise. Returns whether this call performed the terminal transition.
    pub fn try_succeed(&self, value: V) -> bool {
        self.complete(Outcome::Succeeded(value))
    }

    /// Fail the promise. Returns whether this call performed the terminal transition.
    pub fn try_fail(&self, cause: Cause) -> bool {
        self.complete(Outcome::Failed(cause))
    }

    /// Like [`Promise::try_succeed`], but reports an already completed promise as an error.
    pub fn succeed(&self, value: V) -> Result<(), AlreadyComplete> {
        if self.try_succeed(value) {
            Ok(())
        } else {
            Err(AlreadyComplete)
        }
    }

    /// Like [`Promise::try_fail`], but reports an already completed promise as an error.
    pub fn fail(&self, cause: Cause) -> Result<(), AlreadyComplete> {
        if self.try_fail(cause) {
            Ok(())
        } else {
            Err(AlreadyComplete)
        }
    }

    /// Fail the promise with [`Cancelled`]. Returns whether this call performed the terminal transition.
    pub fn cancel(&self) -> bool {
        self.try_fail(Arc::new(Cancelled))
    }

    fn complete(&self, outcome: Outcome<V>) -> bool {
        let shared = &self.future.0;
        let listeners = {
            let mut listeners = shared.lock();
            if shared.outcome.set(outcome).is_err() {
                return false;
            }
            shared.done.notify_all();
            std::mem::take(&mut *listeners)
        };
        self.future.notify(listeners);
        true
    }
}

impl<V> fmt::Debug for Promise<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Promise").field(&self.future).finish()
    }
}

/// [`std::future::Future`] adapter returned by [`Future::wait_async`].
#[must_use = "future does nothing unless polled"]
pub struct WaitAsync<V> {
    future: Future<V>,
    waker: Option<Arc<Mutex<Option<Waker>>>>,
}

impl<V: Clone + Send + Sync + 'static> std::future::Future for WaitAsync<V> {
    type Output = Result<V, Cause>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if let Some(result) = self.future.result() {
            return Poll::Ready(result.cloned().map_err(Arc::clone));
        }
        match &self.waker {
            Some(slot) => {
                *slot.lock().unwrap_or_else(PoisonError::into_inner) = Some(cx.waker().clone());
            }
            None => {
                let slot = Arc::new(Mutex::new(Some(cx.waker().clone())));
                let listener_slot = Arc::clone(&slot);
                self.future.add_listener(move |_| {
                    let waker = listener_slot
                        .lock()
                        .unwrap_or_else(PoisonError::into_inner)
                        .take();
                    if let Some(waker) = waker {
                        waker.wake();
                    }
                });
                self.waker = Some(slot);
            }
        }
        // the listener may have fired before the waker was stored
        match self.future.result() {
            Some(result) => Poll::Ready(result.cloned().map_err(Arc::clone)),
            None => Poll::Pending,
        }
    }
}
