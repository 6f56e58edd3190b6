// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Monotonic time used for idle tracking.
//!
//! Queue access times and keep-alive checks read the clock through a [`TimeSource`], so tests can drive eviction
//! deterministically with [`fakes::ManualClock`].

use std::{fmt::Debug, sync::Arc, time::Instant};

/// A monotonic clock.
pub trait Clock: Send + Sync + Debug {
    fn now(&self) -> Instant;
}

/// Where the reporter reads the current time from.
#[derive(Debug, Clone, Default)]
pub enum TimeSource {
    /// [`Instant::now`]
    #[default]
    System,
    Custom(Arc<dyn Clock>),
}

impl TimeSource {
    pub fn custom(clock: impl Clock + 'static) -> Self {
        Self::Custom(Arc::new(clock))
    }

    pub fn now(&self) -> Instant {
        match self {
            Self::System => Instant::now(),
            Self::Custom(clock) => clock.now(),
        }
    }
}

#[cfg(any(test, feature = "test-util"))]
pub mod fakes {
    //! Test clocks.

    use std::{
        sync::{Arc, Mutex, PoisonError},
        time::{Duration, Instant},
    };

    use super::Clock;

    /// A clock that only moves when told to. Clones share the same time.
    #[derive(Debug, Clone)]
    pub struct ManualClock(Arc<Mutex<Instant>>);

    impl Default for ManualClock {
        fn default() -> Self {
            Self::new()
        }
    }

    impl ManualClock {
        /// A clock frozen at the current instant.
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(Instant::now())))
        }

        pub fn advance(&self, by: Duration) {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner) += by;
        }
    }

    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            *self.0.lock().unwrap_or_else(PoisonError::into_inner)
        }
    }
}
