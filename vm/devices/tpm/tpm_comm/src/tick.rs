// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Monotonic millisecond tick sources.

use std::time::Instant;

/// A monotonic millisecond counter.
///
/// Only differences between two readings are meaningful. Consumers compute
/// them with wrapping arithmetic, so the counter may wrap.
pub trait TickSource {
    /// Returns the current tick count in milliseconds.
    fn now_ms(&self) -> u64;
}

/// A [`TickSource`] backed by [`Instant`].
#[derive(Debug)]
pub struct MonotonicTicks {
    start: Instant,
}

impl MonotonicTicks {
    /// Creates a tick source that starts counting now.
    pub fn new() -> Self {
        Self {
            start: Instant::now(),
        }
    }
}

impl Default for MonotonicTicks {
    fn default() -> Self {
        Self::new()
    }
}

impl TickSource for MonotonicTicks {
    fn now_ms(&self) -> u64 {
        self.start.elapsed().as_millis() as u64
    }
}

/// Whole seconds elapsed between two tick readings.
pub(crate) fn elapsed_secs(start_ms: u64, now_ms: u64) -> u64 {
    now_ms.wrapping_sub(start_ms) / 1000
}
