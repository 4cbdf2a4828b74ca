// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Blocking framed reads and writes over the simulator's command port.

use super::protocol::SimulatorCommand;
use crate::io::AsyncIo;
use crate::io::IoCallbacks;
use crate::io::SendId;
use crate::recv_buffer::RecvBuffer;
use crate::tick::TickSource;
use crate::wait::WaitError;
use crate::wait::wait_until;
use std::io;
use std::num::NonZeroU32;
use thiserror::Error;
use zerocopy::IntoBytes;
use zerocopy::big_endian::U32;

/// A failed read or write on a simulator socket.
#[derive(Debug, Error)]
pub enum TransportError {
    /// The socket could not start opening.
    #[error("failed to start opening the socket")]
    Open(#[source] io::Error),
    /// The data could not be queued for sending.
    #[error("failed to queue data for sending")]
    Send(#[source] io::Error),
    /// The operation did not complete.
    #[error("socket operation did not complete")]
    Wait(#[from] WaitError),
}

/// Completion tracking for the one send in flight.
#[derive(Debug, Default)]
pub(crate) struct PendingSend {
    id: Option<SendId>,
    pub completed: bool,
    pub failed: bool,
}

impl PendingSend {
    pub fn new(id: SendId) -> Self {
        Self {
            id: Some(id),
            completed: false,
            failed: false,
        }
    }

    /// Records the completion of `id` if it is the send being tracked.
    pub fn complete(&mut self, id: SendId, result: io::Result<()>) {
        if self.id != Some(id) {
            return;
        }
        match result {
            Ok(()) => self.completed = true,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "simulator send failed"
                );
                self.failed = true;
            }
        }
    }
}

/// Connection state updated from I/O callbacks.
#[derive(Debug, Default)]
pub(crate) struct PortState {
    pub recv: RecvBuffer,
    pub connected: bool,
    pub errored: bool,
    pub send: PendingSend,
}

impl IoCallbacks for PortState {
    fn on_open_complete(&mut self, result: io::Result<()>) {
        match result {
            Ok(()) => self.connected = true,
            Err(err) => {
                tracing::error!(
                    error = &err as &dyn std::error::Error,
                    "failed to open simulator command port"
                );
                self.connected = false;
                self.errored = true;
            }
        }
    }

    fn on_bytes_received(&mut self, data: &[u8]) {
        if let Err(err) = self.recv.append(data) {
            tracing::error!(
                error = &err as &dyn std::error::Error,
                len = data.len(),
                "failed to buffer received bytes"
            );
            self.errored = true;
        }
    }

    fn on_send_complete(&mut self, id: SendId, result: io::Result<()>) {
        self.send.complete(id, result);
    }

    fn on_error(&mut self, error: io::Error) {
        tracing::error!(
            error = &error as &dyn std::error::Error,
            "simulator command port failed"
        );
        self.errored = true;
    }

    fn on_close_complete(&mut self) {
        self.connected = false;
    }
}

/// The command-port socket together with the state its callbacks update.
pub(crate) struct Channel<I> {
    io: I,
    ticks: Box<dyn TickSource + Send>,
    timeout: NonZeroU32,
    state: PortState,
}

impl<I: AsyncIo> Channel<I> {
    pub fn new(io: I, ticks: Box<dyn TickSource + Send>, timeout: NonZeroU32) -> Self {
        Self {
            io,
            ticks,
            timeout,
            state: PortState::default(),
        }
    }

    pub fn ticks(&self) -> &dyn TickSource {
        &*self.ticks
    }

    pub fn timeout(&self) -> NonZeroU32 {
        self.timeout
    }

    pub fn is_connected(&self) -> bool {
        self.state.connected
    }

    /// Marks the connection failed. Every later wait fails immediately.
    pub fn set_errored(&mut self) {
        self.state.errored = true;
    }

    fn wait(
        &mut self,
        done: impl Fn(&PortState) -> bool,
        failed: impl Fn(&PortState) -> bool,
    ) -> Result<(), WaitError> {
        wait_until(
            &mut self.io,
            &*self.ticks,
            self.timeout,
            &mut self.state,
            done,
            failed,
        )
    }

    /// Opens the socket and waits for the connection.
    pub fn open(&mut self) -> Result<(), TransportError> {
        self.io.open().map_err(TransportError::Open)?;
        self.wait(|s| s.connected, |s| s.errored)?;
        Ok(())
    }

    /// Starts an asynchronous close without waiting for it.
    pub fn close(&mut self) {
        self.io.close();
    }

    pub fn send_exact(&mut self, data: &[u8]) -> Result<(), TransportError> {
        self.send_tracked(data, |s| s.errored || s.send.failed)
    }

    fn send_tracked(
        &mut self,
        data: &[u8],
        failed: impl Fn(&PortState) -> bool,
    ) -> Result<(), TransportError> {
        let id = self.io.send(data).map_err(TransportError::Send)?;
        self.state.send = PendingSend::new(id);
        self.wait(|s| s.send.completed, failed)?;
        Ok(())
    }

    pub fn send_u32(&mut self, value: u32) -> Result<(), TransportError> {
        self.send_exact(U32::new(value).as_bytes())
    }

    pub fn send_command(&mut self, command: SimulatorCommand) -> Result<(), TransportError> {
        tracing::trace!(?command, "sending simulator command");
        self.send_exact(&command.to_be_bytes())
    }

    /// Sends `command` on a connection that may already be poisoned.
    ///
    /// The error flag left by an earlier failure is ignored, so the socket
    /// is pumped until the bytes are written, the send itself fails, or the
    /// timeout elapses.
    pub fn send_final_command(&mut self, command: SimulatorCommand) -> Result<(), TransportError> {
        tracing::trace!(?command, "sending final simulator command");
        self.send_tracked(&command.to_be_bytes(), |s| s.send.failed)
    }

    /// Fills `buf` from the receive buffer, waiting for as many deliveries
    /// as it takes.
    pub fn read_exact(&mut self, buf: &mut [u8]) -> Result<(), TransportError> {
        let len = buf.len();
        if self.state.recv.available() < len {
            self.wait(|s| s.recv.available() >= len, |s| s.errored)?;
        }
        let filled = self.state.recv.read_into(buf);
        debug_assert!(filled);
        Ok(())
    }

    pub fn read_u32(&mut self) -> Result<u32, TransportError> {
        let mut word = U32::ZERO;
        self.read_exact(word.as_mut_bytes())?;
        Ok(word.get())
    }
}
