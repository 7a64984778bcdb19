//! Long register reads assembled from short block transfers.
//!
//! SMBus block transfers carry at most 32 bytes, and the 32-byte variant of
//! the i2c-dev block read goes through the kernel's "broken" block mode,
//! which some controllers botch badly enough to leave the device in a bad
//! state. Reads are therefore split into chunks of at most 31 bytes, each
//! starting at the register after the last byte received; the device is
//! expected to auto-increment its register pointer.

use super::Bus;
use crate::{
    error::{Error, Result},
    hw_trait::SmbusTransport,
    tracing::prelude::*,
    types::DeviceAddress,
};
use std::io;

/// Largest single transfer issued by the chunker.
pub const BLOCK_CHUNK_MAX: usize = 31;

/// Largest logical read accepted by [`Bus::read_block`].
pub const BLOCK_READ_MAX: usize = 256;

impl<T: SmbusTransport> Bus<T> {
    /// Read `length` bytes (1..=256) starting at register `start`.
    ///
    /// If the first chunk fails the whole read fails. If a later chunk fails,
    /// the bytes gathered so far are returned as a successful short read, so
    /// callers that need every byte must compare the returned length with
    /// `length`.
    pub fn read_block(&mut self, address: DeviceAddress, start: u8, length: usize) -> Result<Vec<u8>> {
        if length == 0 || length > BLOCK_READ_MAX {
            return Err(Error::InvalidLength {
                len: length,
                max: BLOCK_READ_MAX,
            });
        }

        let mut data = Vec::with_capacity(length);
        let mut chunk = [0u8; BLOCK_CHUNK_MAX];

        while data.len() < length {
            let want = (length - data.len()).min(BLOCK_CHUNK_MAX);
            // Register space is 8 bits; a read running past 0xFF wraps.
            let reg = start.wrapping_add(data.len() as u8);
            let buf = &mut chunk[..want];

            let result = self
                .dispatch(address.get(), |t| t.smbus_read_i2c_block_data(reg, buf))
                .and_then(|count| match count {
                    0 => Err(io::Error::new(io::ErrorKind::UnexpectedEof, "empty block").into()),
                    n => Ok(n),
                });

            match result {
                Ok(count) => data.extend_from_slice(&chunk[..count]),
                Err(e) if data.is_empty() => {
                    debug!(
                        bus = %self.name,
                        address = %address,
                        register = format_args!("0x{:02X}", reg),
                        error = %e,
                        "Block read failed"
                    );
                    return Err(e);
                }
                Err(e) => {
                    warn!(
                        bus = %self.name,
                        address = %address,
                        start = format_args!("0x{:02X}", start),
                        register = format_args!("0x{:02X}", reg),
                        requested = length,
                        received = data.len(),
                        error = %e,
                        "Short block read"
                    );
                    break;
                }
            }
        }

        Ok(data)
    }

    /// Read four bytes at `reg` and pack them little-endian.
    pub fn read_u32_le(&mut self, address: DeviceAddress, reg: u8) -> Result<u32> {
        let data = self.read_block(address, reg, 4)?;
        let bytes: [u8; 4] = data.as_slice().try_into().map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                format!("short read: {} of 4 bytes", data.len()),
            ))
        })?;
        Ok(u32::from_le_bytes(bytes))
    }
}
