// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Transport plumbing.
//!
//! A [`Sender`] delivers one batch of messages sharing a key. [`AsyncSender`] runs it on a [`SenderPool`] thread and
//! fans the outcome back out to the promise of every message in the batch.

use std::{
    fmt,
    marker::PhantomData,
    panic::{self, AssertUnwindSafe},
    sync::{
        Arc, Mutex,
        mpsc::{self, TrySendError},
    },
    thread,
};

use spool_core::{
    BatchSizeMismatch, Cause, CompositeFuture, DroppedError, Message, Promise, TransportPanicked, panic_message,
};

use crate::{
    error::BuildError,
    queue::Pending,
    rate_limit::rate_limited,
    sync::lock,
};

/// Delivers batches of messages.
///
/// Implementations are called from [`SenderPool`] threads, possibly concurrently for different keys.
pub trait Sender<M>: Send + Sync + 'static {
    /// Value a successfully delivered message resolves to.
    type Output: Send + Sync + 'static;

    /// Deliver `messages`, returning one result per message, in order.
    ///
    /// Returning `Err` fails the whole batch with that cause. A per-message `Err` fails only that message.
    fn send(&self, messages: &[M]) -> Result<Vec<Result<Self::Output, Cause>>, Cause>;

    /// Health check of the underlying transport.
    fn check(&self) -> Result<(), Cause> {
        Ok(())
    }

    /// Release transport resources. Called once when the reporter shuts down.
    fn close(&self) {}
}

impl<M, S: Sender<M> + ?Sized> Sender<M> for Arc<S> {
    type Output = S::Output;

    fn send(&self, messages: &[M]) -> Result<Vec<Result<Self::Output, Cause>>, Cause> {
        (**self).send(messages)
    }

    fn check(&self) -> Result<(), Cause> {
        (**self).check()
    }

    fn close(&self) {
        (**self).close()
    }
}

type Job = Box<dyn FnOnce() + Send>;

struct PoolShared {
    name: String,
    jobs: Mutex<Option<mpsc::SyncSender<Job>>>,
    threads: Mutex<Vec<thread::JoinHandle<()>>>,
}

/// Fixed pool of transport threads.
///
/// A job is handed directly to an idle thread. When every thread is busy (or the pool is shut down) the job runs on
/// the calling thread instead, which slows the flush worker down rather than queueing unboundedly.
///
/// Cloning is cheap; clones share the same threads so several reporters can use one pool.
#[derive(Clone)]
pub struct SenderPool(Arc<PoolShared>);

impl SenderPool {
    pub fn new(threads: usize, name: impl Into<String>) -> Result<Self, BuildError> {
        let name = name.into();
        if threads == 0 {
            return Err(BuildError::invalid("sender threads must be positive"));
        }
        let (tx, rx) = mpsc::sync_channel::<Job>(0);
        let rx = Arc::new(Mutex::new(rx));
        let mut handles = Vec::with_capacity(threads);
        for i in 0..threads {
            let thread_name = format!("{name}-sender-{i}");
            let rx = Arc::clone(&rx);
            let handle = thread::Builder::new()
                .name(thread_name.clone())
                .spawn(move || run_jobs(rx))
                .map_err(|err| BuildError::spawn(thread_name, err))?;
            handles.push(handle);
        }
        Ok(Self(Arc::new(PoolShared {
            name,
            jobs: Mutex::new(Some(tx)),
            threads: Mutex::new(handles),
        })))
    }

    /// Run `job` on an idle pool thread, or on the calling thread if none is idle.
    pub fn execute(&self, job: impl FnOnce() + Send + 'static) {
        let job: Job = Box::new(job);
        let job = match &*lock(&self.0.jobs) {
            Some(jobs) => match jobs.try_send(job) {
                Ok(()) => return,
                Err(TrySendError::Full(job) | TrySendError::Disconnected(job)) => job,
            },
            None => job,
        };
        job();
    }

    /// Stop the pool threads once their current job is done, and wait for them. Idempotent.
    pub fn shutdown(&self) {
        if lock(&self.0.jobs).take().is_none() {
            return;
        }
        let current = thread::current().id();
        let threads: Vec<_> = lock(&self.0.threads).drain(..).collect();
        for handle in threads {
            if handle.thread().id() != current && handle.join().is_err() {
                tracing::warn!(pool = %self.0.name, "sender thread panicked");
            }
        }
        tracing::debug!(pool = %self.0.name, "sender pool stopped");
    }

    pub fn is_shutdown(&self) -> bool {
        lock(&self.0.jobs).is_none()
    }
}

impl fmt::Debug for SenderPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SenderPool")
            .field("name", &self.0.name)
            .field("shutdown", &self.is_shutdown())
            .finish()
    }
}

fn run_jobs(jobs: Arc<Mutex<mpsc::Receiver<Job>>>) {
    loop {
        let job = match lock(&jobs).recv() {
            Ok(job) => job,
            Err(_) => return,
        };
        if let Err(panic) = panic::catch_unwind(AssertUnwindSafe(job)) {
            tracing::warn!(panic = panic_message(&*panic), "sender job panicked");
        }
    }
}

/// Sends drained batches on a [`SenderPool`] and resolves their promises.
pub struct AsyncSender<M, S> {
    sender: Arc<S>,
    pool: SenderPool,
    _message: PhantomData<fn(M)>,
}

impl<M: Message, S: Sender<M>> AsyncSender<M, S> {
    pub fn new(sender: Arc<S>, pool: SenderPool) -> Self {
        Self {
            sender,
            pool,
            _message: PhantomData,
        }
    }

    pub fn sender(&self) -> &Arc<S> {
        &self.sender
    }

    pub fn pool(&self) -> &SenderPool {
        &self.pool
    }

    /// Send `batch`, returning a future over the per-message outcomes in batch order.
    ///
    /// The transport never fails this call: batch errors, result-count mismatches and panics are all converted
    /// into failed promises carrying a [`DroppedError`].
    pub fn send(&self, batch: Vec<Pending<M, S::Output>>) -> CompositeFuture<S::Output> {
        let (messages, promises): (Vec<M>, Vec<Promise<S::Output>>) =
            batch.into_iter().map(Pending::into_parts).unzip();
        let result = CompositeFuture::all(promises.iter().map(|promise| promise.future().clone()));
        if messages.is_empty() {
            return result;
        }
        let sender = Arc::clone(&self.sender);
        self.pool
            .execute(move || deliver(&*sender, messages, promises));
        result
    }
}

impl<M, S> fmt::Debug for AsyncSender<M, S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncSender")
            .field("pool", &self.pool)
            .finish_non_exhaustive()
    }
}

fn deliver<M: Message, S: Sender<M>>(sender: &S, messages: Vec<M>, promises: Vec<Promise<S::Output>>) {
    tracing::debug!(batch = messages.len(), "sending batch");
    let sent = panic::catch_unwind(AssertUnwindSafe(|| sender.send(&messages)));
    let cause: Cause = match sent {
        Ok(Ok(results)) if results.len() == promises.len() => {
            for ((message, promise), result) in messages.into_iter().zip(promises).zip(results) {
                match result {
                    Ok(value) => {
                        promise.try_succeed(value);
                    }
                    Err(cause) => {
                        promise.try_fail(Arc::new(DroppedError::caused_by(cause, vec![message])));
                    }
                }
            }
            return;
        }
        Ok(Ok(results)) => Arc::new(BatchSizeMismatch {
            expected: promises.len(),
            actual: results.len(),
        }) as Cause,
        Ok(Err(cause)) => cause,
        Err(panic) => Arc::new(TransportPanicked(panic_message(&*panic).to_owned())) as Cause,
    };
    rate_limited!(
        std::time::Duration::from_secs(1),
        skipped => tracing::warn!(err = %cause, batch = promises.len(), skipped, "failed to send batch")
    );
    let count = messages.len();
    let dropped: Cause = Arc::new(DroppedError::caused_by_shared(cause, count, Arc::new(messages)));
    for promise in promises {
        promise.try_fail(Arc::clone(&dropped));
    }
}
