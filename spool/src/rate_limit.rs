// Copyright Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::{
    sync::OnceLock,
    time::{Duration, Instant},
};

#[doc(hidden)]
pub(crate) fn millis_since_start() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    let elapsed = Instant::now().duration_since(*START.get_or_init(Instant::now));
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

/// `rate_limited!(interval, skipped => expr)` evaluates `expr` at most once per `interval` for each call site, across
/// all threads. `skipped` is bound to the number of calls that were suppressed since the last evaluation.
///
/// Used for logs on hot paths (overflow drops, failed sends) that would otherwise flood the application log.
macro_rules! rate_limited {
    ($interval:expr, $skipped:ident => $call:expr) => {{
        use std::sync::atomic::{AtomicU64, Ordering};
        static NEXT_CALL_MS: AtomicU64 = AtomicU64::new(0);
        static SKIPPED: AtomicU64 = AtomicU64::new(0);
        let interval: std::time::Duration = $interval;

        let now = $crate::rate_limit::millis_since_start();
        let next = NEXT_CALL_MS.load(Ordering::Relaxed);
        let interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        if next <= now
            && NEXT_CALL_MS
                .compare_exchange(next, now.saturating_add(interval_ms), Ordering::Relaxed, Ordering::Relaxed)
                .is_ok()
        {
            #[allow(unused_variables)]
            let $skipped = SKIPPED.swap(0, Ordering::Relaxed);
            $call;
        } else {
            SKIPPED.fetch_add(1, Ordering::Relaxed);
        }
    }};
}
pub(crate) use rate_limited;
