// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Transports for submitting raw TPM 2.0 commands.
//!
//! A TPM is reached through one of three backends:
//!
//! * a TPM simulator over TCP ([`simulator`]),
//! * the operating system's raw TPM device ([`device`]),
//! * the operating system's TPM resource manager, which is `/dev/tpmrm0`
//!   on Linux and TPM Base Services on Windows.
//!
//! [`open`] picks the backend from a [`TpmCommConfig`] and hands back a
//! [`TpmComm`], which moves opaque command and response buffers. Nothing
//! here parses TPM structures.

pub mod device;
pub mod io;
mod recv_buffer;
pub mod simulator;
#[cfg(windows)]
pub mod tbs;
pub mod tcp;
#[cfg(test)]
mod testing;
pub mod tick;
mod wait;

pub use wait::DEFAULT_TIMEOUT_SECS;
pub use wait::WaitError;

use device::DeviceError;
use device::DeviceTpm;
use io::AsyncIo;
use simulator::ConnectError;
use simulator::SimulatorConfig;
use simulator::SimulatorConnection;
use simulator::SubmitError;
use std::fmt;
use std::path::PathBuf;
use thiserror::Error;

/// The kind of TPM a [`TpmComm`] talks to.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum BackendKind {
    /// A TPM simulator reached over TCP.
    Emulator,
    /// The operating system's raw TPM device.
    OsDevice,
    /// The operating system's TPM resource manager.
    OsResourceManager,
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(match self {
            BackendKind::Emulator => "emulator",
            BackendKind::OsDevice => "os-device",
            BackendKind::OsResourceManager => "os-resource-manager",
        })
    }
}

/// Which backend [`open`] should use, and how to reach it.
#[derive(Debug, Clone)]
pub enum TpmCommConfig {
    /// Connect to a TPM simulator.
    Emulator(SimulatorConfig),
    /// Open a raw TPM device node.
    OsDevice(PathBuf),
    /// Use the platform resource manager.
    OsResourceManager,
}

/// Failure to open a backend.
#[derive(Debug, Error)]
pub enum OpenError {
    /// The simulator connection could not be established.
    #[error("failed to connect to the tpm simulator")]
    Simulator(#[from] ConnectError),
    /// The TPM device could not be opened.
    #[error("failed to open the tpm device")]
    Device(#[from] DeviceError),
    /// TPM Base Services could not be opened.
    #[cfg(windows)]
    #[error("failed to open tpm base services")]
    Tbs(#[from] tbs::TbsError),
}

/// Failure to run a command on a backend.
#[derive(Debug, Error)]
pub enum Error {
    /// The simulator exchange failed.
    #[error("tpm simulator command failed")]
    Simulator(#[from] SubmitError),
    /// The device exchange failed.
    #[error("tpm device command failed")]
    Device(#[from] DeviceError),
    /// The TPM Base Services submission failed.
    #[cfg(windows)]
    #[error("tbs command failed")]
    Tbs(#[from] tbs::TbsError),
}

/// A channel that carries raw TPM commands and responses.
pub trait TpmComm: Send {
    /// The kind of backend behind this channel.
    fn kind(&self) -> BackendKind;

    /// Runs `command` and writes the response into `response`, returning the
    /// response length.
    fn submit_command(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, Error>;
}

impl<I: AsyncIo + Send> TpmComm for SimulatorConnection<I> {
    fn kind(&self) -> BackendKind {
        BackendKind::Emulator
    }

    fn submit_command(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        Ok(self.submit(command, response)?)
    }
}

impl<F: std::io::Read + std::io::Write + Send> TpmComm for DeviceTpm<F> {
    fn kind(&self) -> BackendKind {
        DeviceTpm::kind(self)
    }

    fn submit_command(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        Ok(self.submit(command, response)?)
    }
}

#[cfg(windows)]
impl TpmComm for tbs::TbsTpm {
    fn kind(&self) -> BackendKind {
        BackendKind::OsResourceManager
    }

    fn submit_command(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, Error> {
        Ok(self.submit(command, response)?)
    }
}

/// Opens the backend described by `config`.
pub fn open(config: &TpmCommConfig) -> Result<Box<dyn TpmComm>, OpenError> {
    let tpm: Box<dyn TpmComm> = match config {
        TpmCommConfig::Emulator(config) => Box::new(SimulatorConnection::connect(config)?),
        TpmCommConfig::OsDevice(path) => Box::new(DeviceTpm::open(path, BackendKind::OsDevice)?),
        TpmCommConfig::OsResourceManager => open_resource_manager()?,
    };
    tracing::info!(kind = %tpm.kind(), "tpm backend ready");
    Ok(tpm)
}

#[cfg(windows)]
fn open_resource_manager() -> Result<Box<dyn TpmComm>, OpenError> {
    Ok(Box::new(tbs::TbsTpm::open()?))
}

#[cfg(not(windows))]
fn open_resource_manager() -> Result<Box<dyn TpmComm>, OpenError> {
    Ok(Box::new(DeviceTpm::open(
        device::TPM_RM_DEVICE_PATH,
        BackendKind::OsResourceManager,
    )?))
}
