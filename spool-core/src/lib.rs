// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![doc = include_str!("../README.md")]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use crate::composite::CompositeFuture;
pub use crate::error::{
    AlreadyComplete, BatchSizeMismatch, CapacityError, Cancelled, Cause, Closed, DropReason, DroppedError,
    TransportPanicked,
};
pub use crate::future::{Execute, Executor, Future, Promise, WaitAsync};
#[doc(hidden)]
pub use crate::future::panic_message;
pub use crate::message::Message;
pub use crate::policy::{OverflowPolicy, UnknownPolicy};

pub mod composite;
pub mod error;
pub mod future;
mod message;
mod policy;
