//! Linux i2c-dev transport.
//!
//! Talks to `/dev/i2c-N` through the ioctls documented in the kernel's
//! `Documentation/i2c/dev-interface.rst`. The SMBus ioctl structures are
//! mirrored from `<linux/i2c.h>` and `<linux/i2c-dev.h>`.

use crate::hw_trait::{Direction, Functionality, SmbusTransport, SMBUS_BLOCK_MAX};
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::ptr;

const I2C_SLAVE: u16 = 0x0703;
const I2C_FUNCS: u16 = 0x0705;
const I2C_SMBUS: u16 = 0x0720;

const I2C_SMBUS_READ: u8 = 1;
const I2C_SMBUS_WRITE: u8 = 0;

const I2C_SMBUS_QUICK: u32 = 0;
const I2C_SMBUS_BYTE: u32 = 1;
const I2C_SMBUS_BYTE_DATA: u32 = 2;
const I2C_SMBUS_WORD_DATA: u32 = 3;
// I2C_SMBUS_I2C_BLOCK_BROKEN (6) is deliberately absent: the 32-byte mode
// corrupts device state on some controllers.
const I2C_SMBUS_I2C_BLOCK_DATA: u32 = 8;

// Mirrors of the kernel structures, kept out of the public API.
mod ffi {
    use super::{I2C_FUNCS, I2C_SLAVE, I2C_SMBUS, SMBUS_BLOCK_MAX};

    #[repr(C)]
    pub union I2cSmbusData {
        pub byte: u8,
        pub word: u16,
        pub block: [u8; SMBUS_BLOCK_MAX + 2],
    }

    impl I2cSmbusData {
        pub fn zeroed() -> Self {
            I2cSmbusData {
                block: [0; SMBUS_BLOCK_MAX + 2],
            }
        }
    }

    #[repr(C)]
    pub struct I2cSmbusIoctlData {
        pub read_write: u8,
        pub command: u8,
        pub size: u32,
        pub data: *mut I2cSmbusData,
    }

    nix::ioctl_write_int_bad!(ioctl_set_slave, I2C_SLAVE);
    nix::ioctl_read_bad!(ioctl_funcs, I2C_FUNCS, libc::c_ulong);
    nix::ioctl_readwrite_bad!(ioctl_smbus, I2C_SMBUS, I2cSmbusIoctlData);
}

use ffi::{ioctl_funcs, ioctl_set_slave, ioctl_smbus, I2cSmbusData, I2cSmbusIoctlData};

/// An open i2c-dev character device.
pub struct I2cDev {
    file: File,
    path: PathBuf,
    recover_request: Option<u64>,
}

impl I2cDev {
    /// Open the adapter at `path` (e.g. `/dev/i2c-1`) for reading and writing.
    pub fn open(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        Ok(Self {
            file,
            path: path.to_path_buf(),
            recover_request: None,
        })
    }

    /// Enable kernel-assisted recovery through a driver-specific ioctl
    /// request number. Mainline i2c-dev has no such request, so this is
    /// only set when the platform's driver is known to provide one.
    pub fn with_recover_request(mut self, request: Option<u64>) -> Self {
        self.recover_request = request;
        self
    }

    /// Device path this adapter was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn smbus_access(
        &mut self,
        read_write: u8,
        command: u8,
        size: u32,
        data: Option<&mut I2cSmbusData>,
    ) -> io::Result<()> {
        let mut args = I2cSmbusIoctlData {
            read_write,
            command,
            size,
            data: data.map_or(ptr::null_mut(), |d| d as *mut I2cSmbusData),
        };
        // SAFETY: args and the data union it points to outlive the call, and
        // the union is large enough for any SMBus transfer size.
        unsafe { ioctl_smbus(self.file.as_raw_fd(), &mut args) }?;
        Ok(())
    }
}

impl SmbusTransport for I2cDev {
    fn set_slave_address(&mut self, address: u8) -> io::Result<()> {
        // SAFETY: I2C_SLAVE takes its argument by value.
        unsafe { ioctl_set_slave(self.file.as_raw_fd(), libc::c_int::from(address)) }?;
        Ok(())
    }

    fn smbus_quick(&mut self, direction: Direction) -> io::Result<()> {
        let read_write = match direction {
            Direction::Write => I2C_SMBUS_WRITE,
            Direction::Read => I2C_SMBUS_READ,
        };
        self.smbus_access(read_write, 0, I2C_SMBUS_QUICK, None)
    }

    fn smbus_read_byte(&mut self) -> io::Result<u8> {
        let mut data = I2cSmbusData::zeroed();
        self.smbus_access(I2C_SMBUS_READ, 0, I2C_SMBUS_BYTE, Some(&mut data))?;
        // SAFETY: every field of the union is plain bytes.
        Ok(unsafe { data.byte })
    }

    fn smbus_read_byte_data(&mut self, command: u8) -> io::Result<u8> {
        let mut data = I2cSmbusData::zeroed();
        self.smbus_access(I2C_SMBUS_READ, command, I2C_SMBUS_BYTE_DATA, Some(&mut data))?;
        // SAFETY: see smbus_read_byte.
        Ok(unsafe { data.byte })
    }

    fn smbus_write_byte_data(&mut self, command: u8, value: u8) -> io::Result<()> {
        let mut data = I2cSmbusData::zeroed();
        data.byte = value;
        self.smbus_access(I2C_SMBUS_WRITE, command, I2C_SMBUS_BYTE_DATA, Some(&mut data))
    }

    fn smbus_read_word_data(&mut self, command: u8) -> io::Result<u16> {
        let mut data = I2cSmbusData::zeroed();
        self.smbus_access(I2C_SMBUS_READ, command, I2C_SMBUS_WORD_DATA, Some(&mut data))?;
        // SAFETY: see smbus_read_byte.
        Ok(unsafe { data.word })
    }

    fn smbus_write_word_data(&mut self, command: u8, value: u16) -> io::Result<()> {
        let mut data = I2cSmbusData::zeroed();
        data.word = value;
        self.smbus_access(I2C_SMBUS_WRITE, command, I2C_SMBUS_WORD_DATA, Some(&mut data))
    }

    fn smbus_read_i2c_block_data(&mut self, command: u8, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() || buf.len() > SMBUS_BLOCK_MAX {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("block length {} outside 1..={}", buf.len(), SMBUS_BLOCK_MAX),
            ));
        }

        let mut data = I2cSmbusData::zeroed();
        // SAFETY: writing through the block view of a zeroed union.
        unsafe { data.block[0] = buf.len() as u8 };
        self.smbus_access(
            I2C_SMBUS_READ,
            command,
            I2C_SMBUS_I2C_BLOCK_DATA,
            Some(&mut data),
        )?;

        // SAFETY: the kernel filled block[0] with the count and the
        // following bytes with payload.
        let block = unsafe { &data.block };
        let count = usize::from(block[0]).min(buf.len());
        buf[..count].copy_from_slice(&block[1..=count]);
        Ok(count)
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.file.read(buf)
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        self.file.write(data)
    }

    fn functionality(&mut self) -> io::Result<Functionality> {
        let mut funcs: libc::c_ulong = 0;
        // SAFETY: I2C_FUNCS writes one unsigned long through the pointer.
        unsafe { ioctl_funcs(self.file.as_raw_fd(), &mut funcs) }?;
        Ok(Functionality::from_bits_truncate(u64::from(funcs)))
    }

    fn supports_kernel_recovery(&self) -> bool {
        self.recover_request.is_some()
    }

    fn kernel_recover(&mut self) -> io::Result<()> {
        let Some(request) = self.recover_request else {
            return Err(io::Error::new(
                io::ErrorKind::Unsupported,
                "kernel bus recovery not configured",
            ));
        };
        // SAFETY: a recovery request takes no argument; the request number
        // comes from configuration for a driver known to implement it.
        let rc = unsafe { libc::ioctl(self.file.as_raw_fd(), request as _) };
        if rc < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}
