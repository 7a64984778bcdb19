//! Hardware abstraction layer traits.
//!
//! This module defines the SMBus/I2C primitive interface that the bus engine
//! drives. Implementations exist for the Linux i2c-dev character device and
//! for an in-memory mock used by tests and dry runs.

use bitflags::bitflags;
use std::io;

/// Largest payload of a single SMBus block transfer.
pub const SMBUS_BLOCK_MAX: usize = 32;

/// Data direction bit of a quick command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Write,
    Read,
}

bitflags! {
    /// Adapter functionality as reported by `I2C_FUNCS`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Functionality: u64 {
        const I2C = 0x0000_0001;
        const TEN_BIT_ADDR = 0x0000_0002;
        const PROTOCOL_MANGLING = 0x0000_0004;
        const SMBUS_PEC = 0x0000_0008;
        const NOSTART = 0x0000_0010;
        const SLAVE = 0x0000_0020;
        const SMBUS_BLOCK_PROC_CALL = 0x0000_8000;
        const SMBUS_QUICK = 0x0001_0000;
        const SMBUS_READ_BYTE = 0x0002_0000;
        const SMBUS_WRITE_BYTE = 0x0004_0000;
        const SMBUS_READ_BYTE_DATA = 0x0008_0000;
        const SMBUS_WRITE_BYTE_DATA = 0x0010_0000;
        const SMBUS_READ_WORD_DATA = 0x0020_0000;
        const SMBUS_WRITE_WORD_DATA = 0x0040_0000;
        const SMBUS_PROC_CALL = 0x0080_0000;
        const SMBUS_READ_BLOCK_DATA = 0x0100_0000;
        const SMBUS_WRITE_BLOCK_DATA = 0x0200_0000;
        const SMBUS_READ_I2C_BLOCK = 0x0400_0000;
        const SMBUS_WRITE_I2C_BLOCK = 0x0800_0000;
        const SMBUS_HOST_NOTIFY = 0x1000_0000;
    }
}

impl Functionality {
    /// Human-readable names of the set flags, for logging.
    pub fn describe(&self) -> Vec<&'static str> {
        self.iter_names().map(|(name, _)| name).collect()
    }
}

/// Primitive operations of an open I2C adapter.
///
/// Every method is one blocking OS call (or its mock equivalent). None of
/// them validate addresses or lengths beyond what the OS would; that is the
/// job of [`crate::bus::Bus`]. Transactions target whatever address the last
/// successful [`set_slave_address`](Self::set_slave_address) selected.
pub trait SmbusTransport: Send {
    /// Select the target device for subsequent transactions (`I2C_SLAVE`).
    fn set_slave_address(&mut self, address: u8) -> io::Result<()>;

    /// Address-only transaction carrying a single direction bit.
    fn smbus_quick(&mut self, direction: Direction) -> io::Result<()>;

    /// Read one byte without sending a command code.
    fn smbus_read_byte(&mut self) -> io::Result<u8>;

    /// Read one byte from register `command`.
    fn smbus_read_byte_data(&mut self, command: u8) -> io::Result<u8>;

    /// Write one byte to register `command`.
    fn smbus_write_byte_data(&mut self, command: u8, value: u8) -> io::Result<()>;

    /// Read a 16-bit word from register `command`, as the driver delivers it.
    fn smbus_read_word_data(&mut self, command: u8) -> io::Result<u16>;

    /// Write a 16-bit word to register `command`.
    fn smbus_write_word_data(&mut self, command: u8, value: u16) -> io::Result<()>;

    /// I2C block read of `buf.len()` bytes (at most [`SMBUS_BLOCK_MAX`])
    /// starting at register `command`. Returns the byte count the adapter
    /// reported, which may be less than requested.
    fn smbus_read_i2c_block_data(&mut self, command: u8, buf: &mut [u8]) -> io::Result<usize>;

    /// Plain `read()` on the device, no SMBus framing.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Plain `write()` on the device, no SMBus framing.
    fn write(&mut self, data: &[u8]) -> io::Result<usize>;

    /// Query adapter functionality (`I2C_FUNCS`).
    fn functionality(&mut self) -> io::Result<Functionality>;

    /// Whether the adapter exposes a kernel-side bus recovery operation.
    fn supports_kernel_recovery(&self) -> bool {
        false
    }

    /// Ask the kernel to recover the bus (clock pulses, controller reset).
    fn kernel_recover(&mut self) -> io::Result<()> {
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "kernel bus recovery not available",
        ))
    }
}
