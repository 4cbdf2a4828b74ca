// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM access through an operating system character device.
//!
//! Each command is written to the device in a single write and the full
//! response is returned by a single read.

use crate::BackendKind;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Read;
use std::io::Write;
use std::path::Path;
use std::path::PathBuf;
use thiserror::Error;

/// The raw TPM device.
pub const TPM_DEVICE_PATH: &str = "/dev/tpm0";

/// The kernel resource manager's TPM device.
pub const TPM_RM_DEVICE_PATH: &str = "/dev/tpmrm0";

/// Size of a TPM response header. Anything shorter is not a response.
const RESPONSE_HEADER_LEN: usize = 10;

/// Failure to run a command on a TPM device.
#[derive(Debug, Error)]
pub enum DeviceError {
    /// The device could not be opened.
    #[error("failed to open tpm device {}", path.display())]
    Open {
        /// Path of the device.
        path: PathBuf,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// No command bytes were provided.
    #[error("command is empty")]
    EmptyCommand,
    /// The command could not be written.
    #[error("failed to write the command")]
    Write(#[source] io::Error),
    /// The device accepted only part of the command.
    #[error("device accepted {written} of {len} command bytes")]
    ShortWrite {
        /// Bytes accepted.
        written: usize,
        /// Bytes in the command.
        len: usize,
    },
    /// The response could not be read.
    #[error("failed to read the response")]
    Read(#[source] io::Error),
    /// The response was shorter than a TPM response header.
    #[error("response of {0} bytes is too short")]
    ShortResponse(usize),
}

/// A TPM reached through a device node.
pub struct DeviceTpm<F = File> {
    device: F,
    kind: BackendKind,
}

impl DeviceTpm {
    /// Opens the device at `path` for reading and writing.
    pub fn open(path: impl AsRef<Path>, kind: BackendKind) -> Result<Self, DeviceError> {
        let path = path.as_ref();
        let device = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|source| DeviceError::Open {
                path: path.to_owned(),
                source,
            })?;
        tracing::info!(path = %path.display(), %kind, "opened tpm device");
        Ok(Self::from_device(device, kind))
    }
}

impl<F: Read + Write> DeviceTpm<F> {
    /// Wraps an already open device.
    pub fn from_device(device: F, kind: BackendKind) -> Self {
        Self { device, kind }
    }

    /// The backend this device was opened as.
    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    /// Writes `command` and reads the response into `response`, returning
    /// its length.
    pub fn submit(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, DeviceError> {
        if command.is_empty() {
            return Err(DeviceError::EmptyCommand);
        }

        let written = self.device.write(command).map_err(DeviceError::Write)?;
        if written != command.len() {
            return Err(DeviceError::ShortWrite {
                written,
                len: command.len(),
            });
        }

        let len = self.device.read(response).map_err(DeviceError::Read)?;
        if len < RESPONSE_HEADER_LEN {
            return Err(DeviceError::ShortResponse(len));
        }
        tracing::trace!(
            command_len = command.len(),
            response_len = len,
            "tpm device command complete"
        );
        Ok(len)
    }
}
