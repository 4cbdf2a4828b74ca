// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! TPM access through the Windows TPM Base Services resource manager.

#![expect(unsafe_code)]

use std::ffi::c_void;
use thiserror::Error;
use windows_sys::Win32::System::TpmBaseServices::TBS_COMMAND_LOCALITY_ZERO;
use windows_sys::Win32::System::TpmBaseServices::TBS_COMMAND_PRIORITY_NORMAL;
use windows_sys::Win32::System::TpmBaseServices::TBS_CONTEXT_PARAMS;
use windows_sys::Win32::System::TpmBaseServices::TBS_CONTEXT_PARAMS2;
use windows_sys::Win32::System::TpmBaseServices::TBS_CONTEXT_PARAMS2_0;
use windows_sys::Win32::System::TpmBaseServices::TBS_CONTEXT_VERSION_TWO;
use windows_sys::Win32::System::TpmBaseServices::TBS_SUCCESS;
use windows_sys::Win32::System::TpmBaseServices::TPM_DEVICE_INFO;
use windows_sys::Win32::System::TpmBaseServices::TPM_VERSION_20;
use windows_sys::Win32::System::TpmBaseServices::Tbsi_Context_Create;
use windows_sys::Win32::System::TpmBaseServices::Tbsi_GetDeviceInfo;
use windows_sys::Win32::System::TpmBaseServices::Tbsip_Context_Close;
use windows_sys::Win32::System::TpmBaseServices::Tbsip_Submit_Command;

/// `includeTpm20` in the context parameter flags.
const INCLUDE_TPM20: u32 = 1 << 2;

/// Failure reported by TPM Base Services.
#[derive(Debug, Error)]
pub enum TbsError {
    /// No TBS context could be created.
    #[error("failed to create a tbs context: {0:#x}")]
    Context(u32),
    /// The device information query failed.
    #[error("failed to query tpm device information: {0:#x}")]
    DeviceInfo(u32),
    /// The platform TPM is not a TPM 2.0.
    #[error("unsupported tpm version {0}")]
    UnsupportedVersion(u32),
    /// No command bytes were provided.
    #[error("command is empty")]
    EmptyCommand,
    /// The command or response buffer does not fit a 32-bit length.
    #[error("buffer of {0} bytes is too large")]
    TooLarge(usize),
    /// The command could not be submitted.
    #[error("tbs command submission failed: {0:#x}")]
    Submit(u32),
}

/// A TBS context for the platform TPM 2.0.
pub struct TbsTpm {
    context: *mut c_void,
}

// SAFETY: a TBS context handle is not tied to the thread that created it.
unsafe impl Send for TbsTpm {}

impl TbsTpm {
    /// Creates a context on the platform TPM, which must be a TPM 2.0.
    pub fn open() -> Result<Self, TbsError> {
        let mut info = TPM_DEVICE_INFO {
            structVersion: 0,
            tpmVersion: 0,
            tpmInterfaceType: 0,
            tpmImpRevision: 0,
        };
        // SAFETY: `info` is a valid, writable TPM_DEVICE_INFO of the size
        // passed.
        let result = unsafe {
            Tbsi_GetDeviceInfo(
                size_of::<TPM_DEVICE_INFO>() as u32,
                std::ptr::from_mut(&mut info).cast(),
            )
        };
        if result != TBS_SUCCESS {
            return Err(TbsError::DeviceInfo(result));
        }
        if info.tpmVersion != TPM_VERSION_20 {
            return Err(TbsError::UnsupportedVersion(info.tpmVersion));
        }

        let params = TBS_CONTEXT_PARAMS2 {
            version: TBS_CONTEXT_VERSION_TWO,
            Anonymous: TBS_CONTEXT_PARAMS2_0 {
                asUINT32: INCLUDE_TPM20,
            },
        };
        let mut context = std::ptr::null_mut();
        // SAFETY: `params` is a version two parameter block, which TBS reads
        // through a pointer to the version one header. `context` is a valid
        // out pointer.
        let result = unsafe {
            Tbsi_Context_Create(
                std::ptr::from_ref(&params).cast::<TBS_CONTEXT_PARAMS>(),
                &mut context,
            )
        };
        if result != TBS_SUCCESS {
            return Err(TbsError::Context(result));
        }
        tracing::info!("opened tbs context");
        Ok(Self { context })
    }

    /// Submits `command` and writes the response into `response`, returning
    /// its length.
    pub fn submit(&mut self, command: &[u8], response: &mut [u8]) -> Result<usize, TbsError> {
        if command.is_empty() {
            return Err(TbsError::EmptyCommand);
        }
        let command_len =
            u32::try_from(command.len()).map_err(|_| TbsError::TooLarge(command.len()))?;
        let mut response_len =
            u32::try_from(response.len()).map_err(|_| TbsError::TooLarge(response.len()))?;

        // SAFETY: the context is open, and both buffers are valid for the
        // lengths passed.
        let result = unsafe {
            Tbsip_Submit_Command(
                self.context,
                TBS_COMMAND_LOCALITY_ZERO,
                TBS_COMMAND_PRIORITY_NORMAL,
                command.as_ptr(),
                command_len,
                response.as_mut_ptr(),
                &mut response_len,
            )
        };
        if result != TBS_SUCCESS {
            return Err(TbsError::Submit(result));
        }
        tracing::trace!(command_len, response_len, "tbs command complete");
        Ok(response_len as usize)
    }
}

impl Drop for TbsTpm {
    fn drop(&mut self) {
        // SAFETY: the context is open and is not used after this.
        let result = unsafe { Tbsip_Context_Close(self.context) };
        if result != TBS_SUCCESS {
            tracing::debug!(result, "failed to close tbs context");
        }
    }
}
