// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{error::Error, fmt, io};

use spool_core::CapacityError;

/// Failure to build a reporter, timer or sender pool.
#[derive(Debug)]
pub enum BuildError {
    /// A setting is out of range.
    InvalidConfig(String),
    /// A background thread could not be spawned.
    Spawn { thread: String, source: io::Error },
}

impl BuildError {
    pub(crate) fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidConfig(message.into())
    }

    pub(crate) fn spawn(thread: impl Into<String>, source: io::Error) -> Self {
        let thread = thread.into();
        tracing::error!(%thread, err = %source, "failed to spawn thread");
        Self::Spawn { thread, source }
    }
}

impl fmt::Display for BuildError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidConfig(message) => write!(f, "invalid configuration: {message}"),
            Self::Spawn { thread, source } => write!(f, "failed to spawn thread `{thread}`: {source}"),
        }
    }
}

impl Error for BuildError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match self {
            Self::InvalidConfig(_) => None,
            Self::Spawn { source, .. } => Some(source),
        }
    }
}

/// Why a bounded queue refused an item. Ownership of the item is handed back.
pub enum OfferError<T> {
    /// The queue is full and its policy is [`OverflowPolicy::Fail`](spool_core::OverflowPolicy::Fail).
    Full(CapacityError<T>),
    /// The queue was evicted for being idle; the item should be offered to a fresh queue for the same key.
    Retired(T),
    /// The queue was closed because its reporter shut down.
    Closed(T),
}

impl<T> OfferError<T> {
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(err) => err.into_inner(),
            Self::Retired(item) | Self::Closed(item) => item,
        }
    }
}

impl<T> fmt::Debug for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(err) => f.debug_tuple("Full").field(err).finish(),
            Self::Retired(_) => f.write_str("Retired"),
            Self::Closed(_) => f.write_str("Closed"),
        }
    }
}

impl<T> fmt::Display for OfferError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Full(err) => fmt::Display::fmt(err, f),
            Self::Retired(_) => f.write_str("queue was retired"),
            Self::Closed(_) => f.write_str("closed"),
        }
    }
}

impl<T> Error for OfferError<T> {}
