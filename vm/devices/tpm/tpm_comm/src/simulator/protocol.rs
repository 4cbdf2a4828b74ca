// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Wire constants for the TPM simulator's TCP interface.
//!
//! Every integer on the wire is a 4-byte big-endian value, except the
//! single locality byte of a command envelope.

/// Default TCP port of the simulator's command interface.
pub const DEFAULT_COMMAND_PORT: u16 = 2321;

/// Default TCP port of the simulator's platform (power control) interface.
pub const DEFAULT_PLATFORM_PORT: u16 = 2322;

/// Default simulator address.
pub const DEFAULT_HOST: &str = "127.0.0.1";

/// Interface version this client speaks during the handshake.
pub const CLIENT_PROTOCOL_VERSION: u32 = 1;

/// Locality sent with every command.
pub const COMMAND_LOCALITY: u8 = 0;

/// Value of a successful trailing acknowledgement word.
pub const ACK_SUCCESS: u32 = 0;

/// Opcodes understood by the simulator.
#[repr(u32)]
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum SimulatorCommand {
    /// Platform port: power the TPM on.
    SignalPowerOn = 1,
    /// Command port: submit a TPM command envelope.
    SendCommand = 8,
    /// Platform port: make NV memory available.
    SignalNvOn = 11,
    /// Command port: negotiate the interface version.
    Handshake = 15,
    /// Command port: end the session before disconnecting.
    SessionEnd = 20,
}

impl SimulatorCommand {
    /// The opcode as it appears on the wire.
    pub fn to_be_bytes(self) -> [u8; 4] {
        (self as u32).to_be_bytes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn opcodes_match_simulator_numbering() {
        assert_eq!(SimulatorCommand::SignalPowerOn.to_be_bytes(), [0, 0, 0, 1]);
        assert_eq!(SimulatorCommand::SendCommand.to_be_bytes(), [0, 0, 0, 8]);
        assert_eq!(SimulatorCommand::SignalNvOn.to_be_bytes(), [0, 0, 0, 11]);
        assert_eq!(SimulatorCommand::Handshake.to_be_bytes(), [0, 0, 0, 15]);
        assert_eq!(SimulatorCommand::SessionEnd.to_be_bytes(), [0, 0, 0, 20]);
    }
}
