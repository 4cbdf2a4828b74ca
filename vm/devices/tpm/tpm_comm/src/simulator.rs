// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transport to a TPM 2.0 simulator over its TCP interface.
//!
//! The simulator exposes two ports. The command port carries the version
//! handshake and, afterwards, one command envelope at a time:
//!
//! ```text
//! C: [8][locality: u8][len][command bytes]
//! S: [len][response bytes][ack]
//! ```
//!
//! The platform port is only used while connecting, to signal power-on and
//! NV availability. All calls block on the caller's thread by pumping the
//! underlying [`AsyncIo`] until the step completes or the configured timeout
//! elapses.

mod channel;
mod handshake;
mod power;
pub mod protocol;

pub use channel::TransportError;
pub use handshake::HandshakeError;
pub use power::PowerError;

use crate::io::AsyncIo;
use crate::tcp::TcpSocketIo;
use crate::tick::MonotonicTicks;
use crate::tick::TickSource;
use crate::wait::DEFAULT_TIMEOUT_SECS;
use channel::Channel;
use protocol::ACK_SUCCESS;
use protocol::COMMAND_LOCALITY;
use protocol::SimulatorCommand;
use std::io;
use std::num::NonZeroU32;
use thiserror::Error;

/// Where and how to reach a simulator.
#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    /// Host name or address of the simulator.
    pub host: String,
    /// Command port.
    pub command_port: u16,
    /// Platform port. Defaults to the port after `command_port`.
    pub platform_port: Option<u16>,
    /// Bound on each blocking step, in seconds.
    pub timeout: NonZeroU32,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            host: protocol::DEFAULT_HOST.into(),
            command_port: protocol::DEFAULT_COMMAND_PORT,
            platform_port: None,
            timeout: DEFAULT_TIMEOUT_SECS,
        }
    }
}

impl SimulatorConfig {
    /// The platform port to connect to, if there is one.
    pub fn platform_port(&self) -> Option<u16> {
        self.platform_port.or_else(|| self.command_port.checked_add(1))
    }
}

/// Failure to establish a simulator connection.
#[derive(Debug, Error)]
pub enum ConnectError {
    /// The simulator address could not be resolved.
    #[error("invalid simulator address {host}:{port}")]
    Address {
        /// The configured host.
        host: String,
        /// The port being resolved.
        port: u16,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// No platform port was configured and none follows the command port.
    #[error("no platform port follows command port {0}")]
    NoPlatformPort(u16),
    /// The command port did not connect.
    #[error("failed to connect to the simulator command port")]
    Connect(#[source] TransportError),
    /// The interface handshake failed.
    #[error("simulator handshake failed")]
    Handshake(#[source] HandshakeError),
    /// The simulator could not be powered on.
    #[error("failed to power on the simulator")]
    PowerOn(#[source] PowerError),
}

/// Failure to run a command on the simulator.
#[derive(Debug, Error)]
pub enum SubmitError {
    /// No command bytes were provided.
    #[error("command is empty")]
    EmptyCommand,
    /// The command does not fit the 32-bit length field.
    #[error("command of {0} bytes is too large")]
    CommandTooLarge(usize),
    /// The envelope opcode was not sent.
    #[error("failed to send the command opcode")]
    SendOpcode(#[source] TransportError),
    /// The locality byte was not sent.
    #[error("failed to send the command locality")]
    SendLocality(#[source] TransportError),
    /// The command length was not sent.
    #[error("failed to send the command length")]
    SendLength(#[source] TransportError),
    /// The command bytes were not sent.
    #[error("failed to send the command body")]
    SendBody(#[source] TransportError),
    /// The response length was not received.
    #[error("failed to read the response length")]
    ReadLength(#[source] TransportError),
    /// The response does not fit the caller's buffer.
    #[error("response of {len} bytes exceeds buffer of {capacity} bytes")]
    ResponseTooLarge {
        /// Response length reported by the simulator.
        len: u32,
        /// Size of the caller's buffer.
        capacity: usize,
    },
    /// The response bytes were not received.
    #[error("failed to read the response body")]
    ReadBody(#[source] TransportError),
    /// The trailing acknowledgement was not received.
    #[error("failed to read the response acknowledgement")]
    ReadAck(#[source] TransportError),
    /// The trailing acknowledgement reported failure.
    #[error("command acknowledged with status {0:#x}")]
    BadAck(u32),
}

/// An established connection to a TPM simulator.
///
/// The simulator is handshaken with and powered on while connecting, so a
/// value of this type is ready for [`submit`](Self::submit). Dropping it ends
/// the session and closes the socket.
///
/// After any failed submission the connection is poisoned: every later
/// operation fails without waiting. Drop it and connect again. Dropping a
/// poisoned connection still ends the session if the socket is up.
pub struct SimulatorConnection<I: AsyncIo = TcpSocketIo> {
    channel: Channel<I>,
    session_open: bool,
    version: u32,
    tpm_info: u32,
}

impl SimulatorConnection {
    /// Connects to the simulator described by `config` over TCP.
    pub fn connect(config: &SimulatorConfig) -> Result<Self, ConnectError> {
        let platform_port = config
            .platform_port()
            .ok_or(ConnectError::NoPlatformPort(config.command_port))?;
        let resolve = |port| {
            TcpSocketIo::new(&config.host, port).map_err(|source| ConnectError::Address {
                host: config.host.clone(),
                port,
                source,
            })
        };
        let command = resolve(config.command_port)?;
        let platform = resolve(platform_port)?;

        tracing::info!(
            host = %config.host,
            command_port = config.command_port,
            platform_port,
            "connecting to tpm simulator"
        );
        Self::establish(
            command,
            platform,
            Box::new(MonotonicTicks::new()),
            config.timeout,
        )
    }
}

impl<I: AsyncIo> SimulatorConnection<I> {
    /// Establishes a connection over caller-supplied sockets.
    ///
    /// Opens `io`, performs the interface handshake on it, then powers the
    /// simulator on through `platform`, which is closed before returning.
    /// On failure everything acquired so far is released.
    pub fn establish<P: AsyncIo>(
        io: I,
        platform: P,
        ticks: Box<dyn TickSource + Send>,
        timeout: NonZeroU32,
    ) -> Result<Self, ConnectError> {
        let mut this = Self {
            channel: Channel::new(io, ticks, timeout),
            session_open: false,
            version: 0,
            tpm_info: 0,
        };

        this.channel.open().map_err(ConnectError::Connect)?;
        let negotiated =
            handshake::handshake(&mut this.channel).map_err(ConnectError::Handshake)?;
        power::power_on(platform, this.channel.ticks(), this.channel.timeout())
            .map_err(ConnectError::PowerOn)?;

        this.session_open = true;
        this.version = negotiated.version;
        this.tpm_info = negotiated.tpm_info;
        tracing::info!(
            version = this.version,
            tpm_info = this.tpm_info,
            "tpm simulator ready"
        );
        Ok(this)
    }

    /// The interface version agreed during the handshake.
    pub fn protocol_version(&self) -> u32 {
        self.version
    }

    /// The opaque TPM info word the simulator reported during the handshake.
    pub fn tpm_info(&self) -> u32 {
        self.tpm_info
    }

    /// Sends `command` to the TPM and reads the response into `response`.
    ///
    /// Returns the length of the response. A response longer than
    /// `response` fails with [`SubmitError::ResponseTooLarge`] without being
    /// read. On failure the contents of `response` are unspecified and the
    /// connection is poisoned.
    pub fn submit(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, SubmitError> {
        if command.is_empty() {
            return Err(SubmitError::EmptyCommand);
        }
        let len = u32::try_from(command.len())
            .map_err(|_| SubmitError::CommandTooLarge(command.len()))?;

        let result = self.exchange(command, len, response);
        if let Err(err) = &result {
            tracing::error!(
                error = err as &dyn std::error::Error,
                "tpm simulator command failed"
            );
            self.channel.set_errored();
        }
        result
    }

    fn exchange(
        &mut self,
        command: &[u8],
        len: u32,
        response: &mut [u8],
    ) -> Result<usize, SubmitError> {
        let channel = &mut self.channel;
        channel
            .send_command(SimulatorCommand::SendCommand)
            .map_err(SubmitError::SendOpcode)?;
        channel
            .send_exact(&[COMMAND_LOCALITY])
            .map_err(SubmitError::SendLocality)?;
        channel.send_u32(len).map_err(SubmitError::SendLength)?;
        channel.send_exact(command).map_err(SubmitError::SendBody)?;

        let response_len = channel.read_u32().map_err(SubmitError::ReadLength)?;
        let capacity = response.len();
        let response = usize::try_from(response_len)
            .ok()
            .and_then(|n| response.get_mut(..n))
            .ok_or(SubmitError::ResponseTooLarge {
                len: response_len,
                capacity,
            })?;
        channel.read_exact(response).map_err(SubmitError::ReadBody)?;

        let ack = channel.read_u32().map_err(SubmitError::ReadAck)?;
        if ack != ACK_SUCCESS {
            return Err(SubmitError::BadAck(ack));
        }

        tracing::trace!(
            command_len = len,
            response_len,
            "tpm simulator command complete"
        );
        Ok(response.len())
    }
}

impl<I: AsyncIo> Drop for SimulatorConnection<I> {
    fn drop(&mut self) {
        if self.session_open && self.channel.is_connected() {
            if let Err(err) = self.channel.send_final_command(SimulatorCommand::SessionEnd) {
                tracing::debug!(
                    error = &err as &dyn std::error::Error,
                    "failed to end simulator session"
                );
            }
        }
        self.channel.close();
        tracing::debug!("tpm simulator connection closed");
    }
}
