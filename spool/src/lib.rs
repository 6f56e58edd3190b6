// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use spool_core::{
    AlreadyComplete, BatchSizeMismatch, Cancelled, CapacityError, Cause, Closed, CompositeFuture, DropReason,
    DroppedError, Execute, Executor, Future, Message, OverflowPolicy, Promise, TransportPanicked, UnknownPolicy,
    WaitAsync,
};

pub use crate::error::{BuildError, OfferError};
pub use crate::reporter::{Reporter, ReporterBuilder, ReporterState};
pub use crate::sender::{Sender, SenderPool};

pub mod buffer;
pub mod config;
pub mod error;
pub mod limiter;
pub mod manager;
pub mod metrics;
pub mod queue;
pub(crate) mod rate_limit;
pub mod reporter;
pub mod sender;
pub(crate) mod sync;
pub mod synchronizer;
pub mod time;
pub mod timer;

#[doc(hidden)]
pub use spool_core as core;
