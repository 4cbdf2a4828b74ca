// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Power-on sequencing over the simulator's platform port.
//!
//! The platform socket only lives for the duration of [`power_on`]. Each
//! signal is answered by a bare 4-byte status, which is collected into a
//! capture of its own rather than the command port's receive buffer.

use super::channel::PendingSend;
use super::protocol::ACK_SUCCESS;
use super::protocol::SimulatorCommand;
use crate::io::AsyncIo;
use crate::io::IoCallbacks;
use crate::io::SendId;
use crate::tick::TickSource;
use crate::wait::WaitError;
use crate::wait::wait_until;
use std::io;
use std::num::NonZeroU32;
use thiserror::Error;
use zerocopy::FromBytes;
use zerocopy::big_endian::U32;

/// A failed power-on sequence.
#[derive(Debug, Error)]
pub enum PowerError {
    /// The platform socket could not start opening.
    #[error("failed to start opening the platform port")]
    Open(#[source] io::Error),
    /// The platform socket did not connect.
    #[error("failed to connect to the platform port")]
    Connect(#[source] WaitError),
    /// A signal could not be queued.
    #[error("failed to queue {command:?}")]
    Queue {
        /// The signal being sent.
        command: SimulatorCommand,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// A signal was not sent.
    #[error("failed to send {command:?}")]
    Send {
        /// The signal being sent.
        command: SimulatorCommand,
        /// The underlying error.
        #[source]
        source: WaitError,
    },
    /// No status arrived for a signal.
    #[error("no status received for {command:?}")]
    Ack {
        /// The signal being acknowledged.
        command: SimulatorCommand,
        /// The underlying error.
        #[source]
        source: WaitError,
    },
    /// The simulator rejected a signal.
    #[error("{command:?} failed with status {status:#x}")]
    Rejected {
        /// The rejected signal.
        command: SimulatorCommand,
        /// The status the simulator returned.
        status: u32,
    },
}

#[derive(Debug, Default)]
struct PlatformState {
    connected: bool,
    errored: bool,
    send: PendingSend,
    capture: Vec<u8>,
}

impl PlatformState {
    /// The first status word captured since the last signal.
    fn status(&self) -> Option<u32> {
        U32::read_from_prefix(&self.capture)
            .ok()
            .map(|(status, _)| status.get())
    }
}

impl IoCallbacks for PlatformState {
    fn on_open_complete(&mut self, result: io::Result<()>) {
        match result {
            Ok(()) => self.connected = true,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to open simulator platform port"
                );
                self.errored = true;
            }
        }
    }

    fn on_bytes_received(&mut self, data: &[u8]) {
        if self.capture.try_reserve(data.len()).is_err() {
            tracing::error!(len = data.len(), "failed to capture platform status");
            self.errored = true;
            return;
        }
        self.capture.extend_from_slice(data);
    }

    fn on_send_complete(&mut self, id: SendId, result: io::Result<()>) {
        self.send.complete(id, result);
    }

    fn on_error(&mut self, error: io::Error) {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "simulator platform port failed"
        );
        self.errored = true;
    }

    fn on_close_complete(&mut self) {
        self.connected = false;
    }
}

/// Powers the simulated TPM on and enables its NV memory.
///
/// `platform` is always closed and dropped before returning.
pub(crate) fn power_on<P: AsyncIo>(
    mut platform: P,
    ticks: &dyn TickSource,
    timeout: NonZeroU32,
) -> Result<(), PowerError> {
    let mut state = PlatformState::default();
    let result = sequence(&mut platform, ticks, timeout, &mut state);
    platform.close();
    platform.do_work(&mut state);
    result
}

fn sequence<P: AsyncIo>(
    platform: &mut P,
    ticks: &dyn TickSource,
    timeout: NonZeroU32,
    state: &mut PlatformState,
) -> Result<(), PowerError> {
    platform.open().map_err(PowerError::Open)?;
    wait_until(platform, ticks, timeout, state, |s| s.connected, |s| s.errored)
        .map_err(PowerError::Connect)?;

    for command in [SimulatorCommand::SignalPowerOn, SimulatorCommand::SignalNvOn] {
        signal(platform, ticks, timeout, state, command)?;
    }
    tracing::debug!("simulator powered on");
    Ok(())
}

fn signal<P: AsyncIo>(
    platform: &mut P,
    ticks: &dyn TickSource,
    timeout: NonZeroU32,
    state: &mut PlatformState,
    command: SimulatorCommand,
) -> Result<(), PowerError> {
    state.capture.clear();
    let id = platform
        .send(&command.to_be_bytes())
        .map_err(|source| PowerError::Queue { command, source })?;
    state.send = PendingSend::new(id);

    wait_until(
        platform,
        ticks,
        timeout,
        state,
        |s| s.send.completed,
        |s| s.errored || s.send.failed,
    )
    .map_err(|source| PowerError::Send { command, source })?;

    wait_until(
        platform,
        ticks,
        timeout,
        state,
        |s| s.status().is_some(),
        |s| s.errored,
    )
    .map_err(|source| PowerError::Ack { command, source })?;

    match state.status() {
        Some(ACK_SUCCESS) => {
            tracing::trace!(?command, "platform signal acknowledged");
            Ok(())
        }
        Some(status) => Err(PowerError::Rejected { command, status }),
        None => Err(PowerError::Ack {
            command,
            source: WaitError::Failed,
        }),
    }
}
