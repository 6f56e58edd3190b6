// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{fmt::Debug, hash::Hash};

/// A unit of work submitted to a reporter.
///
/// Messages are partitioned by [`Message::key`]: every distinct key gets its own bounded queue, and a batch handed to
/// the transport only ever contains messages that share a key.
///
/// ```
/// # use spool_core::Message;
/// #[derive(Debug)]
/// struct Span {
///     service: &'static str,
///     payload: Vec<u8>,
/// }
///
/// impl Message for Span {
///     type Key = &'static str;
///
///     fn key(&self) -> Self::Key {
///         self.service
///     }
/// }
/// ```
pub trait Message: Debug + Send + Sync + 'static {
    /// Opaque grouping key. Two messages belong to the same queue iff their keys are equal.
    type Key: Clone + Eq + Hash + Debug + Send + Sync + 'static;

    fn key(&self) -> Self::Key;
}
