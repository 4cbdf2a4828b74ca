// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! FIFO accumulation of bytes delivered by the I/O layer.

use std::collections::TryReserveError;

/// Bytes received but not yet consumed, oldest first.
///
/// Payloads on this path are small (a TPM response plus a few framing
/// words), so this is a plain vector rather than a ring.
#[derive(Debug, Default)]
pub(crate) struct RecvBuffer {
    data: Vec<u8>,
}

impl RecvBuffer {
    /// Appends `bytes` at the tail. On allocation failure the buffered data
    /// is left untouched.
    pub fn append(&mut self, bytes: &[u8]) -> Result<(), TryReserveError> {
        self.data.try_reserve(bytes.len())?;
        self.data.extend_from_slice(bytes);
        Ok(())
    }

    pub fn available(&self) -> usize {
        self.data.len()
    }

    /// Moves the first `buf.len()` bytes into `buf`.
    ///
    /// Returns false, consuming nothing, if fewer bytes are buffered.
    pub fn read_into(&mut self, buf: &mut [u8]) -> bool {
        if self.data.len() < buf.len() {
            return false;
        }
        buf.copy_from_slice(&self.data[..buf.len()]);
        self.consume(buf.len());
        true
    }

    /// Drops the first `n` bytes.
    ///
    /// Panics if fewer than `n` bytes are buffered.
    pub fn consume(&mut self, n: usize) {
        assert!(n <= self.data.len(), "consuming more than is buffered");
        if n == self.data.len() {
            self.data = Vec::new();
        } else {
            self.data = self.data.split_off(n);
        }
    }
}
