// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Turns a pumped [`AsyncIo`] into blocking calls.

use crate::io::AsyncIo;
use crate::io::IoCallbacks;
use crate::tick::TickSource;
use crate::tick::elapsed_secs;
use std::num::NonZeroU32;
use thiserror::Error;

/// Default bound on a single wait, in seconds.
pub const DEFAULT_TIMEOUT_SECS: NonZeroU32 = NonZeroU32::new(20).unwrap();

/// A wait that did not reach its completion condition.
#[derive(Debug, Error)]
pub enum WaitError {
    /// The condition did not become true in time.
    #[error("timed out after {0} seconds")]
    Timeout(u32),
    /// The connection reported an error.
    #[error("the connection is in an error state")]
    Failed,
}

/// Pumps `io` until `done(state)` holds.
///
/// Fails without pumping if `failed(state)` already holds on entry. After
/// that, a pump that satisfies `done` succeeds even if it also reported an
/// error, so bytes delivered just before a peer close are not lost. Fails
/// with [`WaitError::Timeout`] once `timeout` whole seconds of ticks have
/// elapsed. This is the only place the transport suspends.
pub(crate) fn wait_until<I, S>(
    io: &mut I,
    ticks: &dyn TickSource,
    timeout: NonZeroU32,
    state: &mut S,
    done: impl Fn(&S) -> bool,
    failed: impl Fn(&S) -> bool,
) -> Result<(), WaitError>
where
    I: AsyncIo + ?Sized,
    S: IoCallbacks,
{
    if failed(state) {
        return Err(WaitError::Failed);
    }
    let start = ticks.now_ms();
    loop {
        if done(state) {
            return Ok(());
        }
        if failed(state) {
            return Err(WaitError::Failed);
        }
        if elapsed_secs(start, ticks.now_ms()) >= u64::from(timeout.get()) {
            return Err(WaitError::Timeout(timeout.get()));
        }
        io.do_work(state);
    }
}
