// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Interface version negotiation on the command port.

use super::channel::Channel;
use super::channel::TransportError;
use super::protocol::ACK_SUCCESS;
use super::protocol::CLIENT_PROTOCOL_VERSION;
use super::protocol::SimulatorCommand;
use crate::io::AsyncIo;
use thiserror::Error;

/// A failed interface handshake.
#[derive(Debug, Error)]
pub enum HandshakeError {
    /// The handshake opcode was not sent.
    #[error("failed to send the handshake command")]
    SendCommand(#[source] TransportError),
    /// The client version was not sent.
    #[error("failed to send the client version")]
    SendVersion(#[source] TransportError),
    /// The server version was not received.
    #[error("failed to read the server version")]
    ReadVersion(#[source] TransportError),
    /// The server speaks a different interface version.
    #[error("client version {client} does not match server version {server}")]
    VersionMismatch {
        /// Version offered by this client.
        client: u32,
        /// Version reported by the simulator.
        server: u32,
    },
    /// The TPM info word was not received.
    #[error("failed to read the tpm info word")]
    ReadInfo(#[source] TransportError),
    /// The trailing acknowledgement was not received.
    #[error("failed to read the handshake acknowledgement")]
    ReadAck(#[source] TransportError),
    /// The trailing acknowledgement reported failure.
    #[error("handshake acknowledged with status {0:#x}")]
    BadAck(u32),
}

/// What the simulator reported during the handshake.
#[derive(Debug, Copy, Clone)]
pub(crate) struct Negotiated {
    pub version: u32,
    pub tpm_info: u32,
}

/// Runs `C:[15][version] -> S:[version][tpm info][ack]`.
pub(crate) fn handshake<I: AsyncIo>(
    channel: &mut Channel<I>,
) -> Result<Negotiated, HandshakeError> {
    channel
        .send_command(SimulatorCommand::Handshake)
        .map_err(HandshakeError::SendCommand)?;
    channel
        .send_u32(CLIENT_PROTOCOL_VERSION)
        .map_err(HandshakeError::SendVersion)?;

    let server = channel.read_u32().map_err(HandshakeError::ReadVersion)?;
    if server != CLIENT_PROTOCOL_VERSION {
        return Err(HandshakeError::VersionMismatch {
            client: CLIENT_PROTOCOL_VERSION,
            server,
        });
    }

    let tpm_info = channel.read_u32().map_err(HandshakeError::ReadInfo)?;
    let ack = channel.read_u32().map_err(HandshakeError::ReadAck)?;
    if ack != ACK_SUCCESS {
        return Err(HandshakeError::BadAck(ack));
    }

    tracing::debug!(version = server, tpm_info, "simulator handshake complete");
    Ok(Negotiated {
        version: server,
        tpm_info,
    })
}
