// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Error types shared by the completion engine and the reporter.
//!
//! Per-message failures are never returned synchronously from a report call. They are stored in the message's
//! [`Promise`](crate::Promise) as a [`Cause`] and observed through its [`Future`](crate::Future). The only synchronous
//! rejection is [`CapacityError`], raised under [`OverflowPolicy::Fail`].

use std::{error::Error, fmt, sync::Arc};

use crate::OverflowPolicy;

/// Shareable failure cause stored in a failed promise.
///
/// Causes are reference counted because a single batch-level failure is fanned out to every promise in the batch.
pub type Cause = Arc<dyn Error + Send + Sync + 'static>;

/// Why a set of messages was dropped.
#[derive(Clone)]
pub enum DropReason {
    /// Dropped purely because a per-key queue was full, carries the policy that evicted it.
    Overflow(OverflowPolicy),
    /// Dropped because of a downstream failure (transport error, closed reporter, ...).
    Cause(Cause),
}

impl fmt::Debug for DropReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Overflow(policy) => f.debug_tuple("Overflow").field(policy).finish(),
            Self::Cause(cause) => f.debug_tuple("Cause").field(&cause.to_string()).finish(),
        }
    }
}

/// A message (or group of messages) was dropped without being delivered.
///
/// Unlike the happy path, errors are free to allocate. The affected messages are kept behind a shared [`fmt::Debug`]
/// view so a whole batch can be reported without cloning it once per promise.
#[derive(Clone)]
pub struct DroppedError {
    reason: DropReason,
    count: usize,
    messages: Arc<dyn fmt::Debug + Send + Sync>,
}

impl DroppedError {
    /// Messages dropped by an overflow policy.
    pub fn overflow<M: fmt::Debug + Send + Sync + 'static>(policy: OverflowPolicy, messages: Vec<M>) -> Self {
        Self {
            reason: DropReason::Overflow(policy),
            count: messages.len(),
            messages: Arc::new(messages),
        }
    }

    /// Messages dropped because of `cause`.
    pub fn caused_by<M: fmt::Debug + Send + Sync + 'static>(cause: Cause, messages: Vec<M>) -> Self {
        Self {
            reason: DropReason::Cause(cause),
            count: messages.len(),
            messages: Arc::new(messages),
        }
    }

    /// Messages dropped because of `cause`, sharing an already collected list of messages.
    pub fn caused_by_shared(
        cause: Cause,
        count: usize,
        messages: Arc<dyn fmt::Debug + Send + Sync>,
    ) -> Self {
        Self {
            reason: DropReason::Cause(cause),
            count,
            messages,
        }
    }

    pub fn reason(&self) -> &DropReason {
        &self.reason
    }

    /// Returns true if this drop was caused by an overflow policy rather than a downstream failure.
    pub fn is_overflow(&self) -> bool {
        matches!(self.reason, DropReason::Overflow(_))
    }

    /// The overflow policy that dropped the messages, if any.
    pub fn policy(&self) -> Option<OverflowPolicy> {
        match self.reason {
            DropReason::Overflow(policy) => Some(policy),
            DropReason::Cause(_) => None,
        }
    }

    /// The downstream cause, if any.
    pub fn cause(&self) -> Option<&Cause> {
        match &self.reason {
            DropReason::Overflow(_) => None,
            DropReason::Cause(cause) => Some(cause),
        }
    }

    /// Number of messages affected by this drop.
    pub fn count(&self) -> usize {
        self.count
    }

    /// Debug view of the affected messages.
    pub fn messages(&self) -> &(dyn fmt::Debug + Send + Sync) {
        &*self.messages
    }
}

impl fmt::Debug for DroppedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DroppedError")
            .field("reason", &self.reason)
            .field("count", &self.count)
            .field("messages", &self.messages)
            .finish()
    }
}

impl fmt::Display for DroppedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.reason {
            DropReason::Overflow(policy) => write!(
                f,
                "dropped {} messages: overflow, policy is {policy}",
                self.count
            ),
            DropReason::Cause(cause) => write!(f, "dropped {} messages: {cause}", self.count),
        }
    }
}

impl Error for DroppedError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.reason {
            DropReason::Overflow(_) => None,
            DropReason::Cause(cause) => Some(&**cause as &(dyn Error + 'static)),
        }
    }
}

/// The reporter has been closed and no longer accepts messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Closed;

impl fmt::Display for Closed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("closed")
    }
}

impl Error for Closed {}

/// The promise was cancelled before completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Cancelled;

impl fmt::Display for Cancelled {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("cancelled")
    }
}

impl Error for Cancelled {}

/// A promise was asked to complete but had already reached a terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AlreadyComplete;

impl fmt::Display for AlreadyComplete {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("promise is already complete")
    }
}

impl Error for AlreadyComplete {}

/// Synchronous rejection of an insert into a full queue under [`OverflowPolicy::Fail`].
///
/// Ownership of the rejected item is handed back to the caller.
pub struct CapacityError<T> {
    item: T,
    max_size: usize,
    size: usize,
}

impl<T> CapacityError<T> {
    pub fn new(item: T, max_size: usize, size: usize) -> Self {
        Self {
            item,
            max_size,
            size,
        }
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// Queue size observed when the insert was rejected.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn into_inner(self) -> T {
        self.item
    }

    /// Replace the rejected item, keeping the sizes.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> CapacityError<U> {
        CapacityError {
            item: f(self.item),
            max_size: self.max_size,
            size: self.size,
        }
    }
}

impl<T> fmt::Debug for CapacityError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CapacityError")
            .field("max_size", &self.max_size)
            .field("size", &self.size)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for CapacityError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "max size of {} is reached, current size is {}",
            self.max_size, self.size
        )
    }
}

impl<T> Error for CapacityError<T> {}

/// The transport returned a different number of results than messages it was given.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchSizeMismatch {
    pub expected: usize,
    pub actual: usize,
}

impl fmt::Display for BatchSizeMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "transport returned {} results for a batch of {} messages",
            self.actual, self.expected
        )
    }
}

impl Error for BatchSizeMismatch {}

/// The transport panicked while sending a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportPanicked(pub String);

impl fmt::Display for TransportPanicked {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport panicked: {}", self.0)
    }
}

impl Error for TransportPanicked {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overflow_drop_names_policy() {
        let err = DroppedError::overflow(OverflowPolicy::DropHead, vec!["a"]);
        assert!(err.is_overflow());
        assert_eq!(err.policy(), Some(OverflowPolicy::DropHead));
        assert_eq!(err.count(), 1);
        assert_eq!(
            err.to_string(),
            "dropped 1 messages: overflow, policy is DropHead"
        );
        assert!(err.source().is_none());
    }

    #[test]
    fn cause_drop_exposes_source() {
        let err = DroppedError::caused_by(Arc::new(Closed), vec![1, 2, 3]);
        assert!(!err.is_overflow());
        assert_eq!(err.count(), 3);
        assert_eq!(err.to_string(), "dropped 3 messages: closed");
        assert_eq!(err.source().unwrap().to_string(), "closed");
        assert_eq!(format!("{:?}", err.messages()), "[1, 2, 3]");
    }

    #[test]
    fn capacity_error_returns_item() {
        let err = CapacityError::new("message", 4, 4);
        assert_eq!(err.to_string(), "max size of 4 is reached, current size is 4");
        let err = err.map(|m| m.len());
        assert_eq!(err.into_inner(), 7);
    }
}
