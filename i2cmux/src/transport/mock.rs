//! Mock I2C adapter for testing.
//!
//! Models a bus of loopback register-file devices. Every primitive call is
//! recorded with start/finish timestamps so tests can verify ordering and
//! pacing, and individual operations can be made to fail. The state lives
//! behind an `Arc`, so a clone kept by the test still observes the adapter
//! after it has been moved into a [`Bus`](crate::bus::Bus) or onto the bus
//! thread.

use crate::hw_trait::{Direction, Functionality, SmbusTransport, SMBUS_BLOCK_MAX};
use nix::errno::Errno;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::io;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One primitive call as seen by the adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockOp {
    SetSlave(u8),
    Quick { addr: u8, direction: Direction },
    ReadByte { addr: u8 },
    ReadByteData { addr: u8, reg: u8 },
    WriteByteData { addr: u8, reg: u8, value: u8 },
    ReadWordData { addr: u8, reg: u8 },
    WriteWordData { addr: u8, reg: u8, value: u16 },
    ReadI2cBlock { addr: u8, reg: u8, len: usize },
    RawRead { addr: u8, len: usize },
    RawWrite { addr: u8, data: Vec<u8> },
    Functionality,
    KernelRecover,
}

/// A logged call with its outcome.
#[derive(Debug, Clone)]
pub struct MockRecord {
    pub op: MockOp,
    pub ok: bool,
    pub started: Instant,
    pub finished: Instant,
}

/// A simulated device: 256 byte-wide registers with auto-increment.
#[derive(Debug, Clone)]
pub struct MockDevice {
    pub registers: [u8; 256],
    /// Register pointer used by raw reads, set by a raw one-byte write.
    pub pointer: u8,
    /// Acknowledge quick commands with the write bit
    pub ack_quick_write: bool,
    /// Acknowledge quick commands with the read bit
    pub ack_quick_read: bool,
    /// Acknowledge command-less byte reads
    pub ack_read_byte: bool,
}

impl Default for MockDevice {
    fn default() -> Self {
        Self {
            registers: [0; 256],
            pointer: 0,
            ack_quick_write: true,
            ack_quick_read: true,
            ack_read_byte: true,
        }
    }
}

/// Predicate selecting which calls fail.
type FailRule = Box<dyn Fn(&MockOp, usize) -> bool + Send>;

#[derive(Default)]
struct MockState {
    devices: HashMap<u8, MockDevice>,
    active: Option<u8>,
    log: Vec<MockRecord>,
    block_reads: usize,
    fail_rules: Vec<FailRule>,
    short_blocks: HashMap<usize, usize>,
    stall: Duration,
    funcs: Option<Functionality>,
    kernel_recovery: Option<bool>,
}

/// Cloneable handle onto a simulated adapter.
#[derive(Clone, Default)]
pub struct MockBus {
    state: Arc<Mutex<MockState>>,
}

impl MockBus {
    /// An empty bus: no devices, full SMBus functionality, no kernel recovery.
    pub fn new() -> Self {
        let bus = Self::default();
        bus.state.lock().funcs = Some(Functionality::I2C | smbus_funcs());
        bus
    }

    /// Attach a default loopback device at `addr`.
    pub fn add_device(&self, addr: u8) -> &Self {
        self.add_device_with(addr, MockDevice::default())
    }

    /// Attach a custom device at `addr`.
    pub fn add_device_with(&self, addr: u8, device: MockDevice) -> &Self {
        self.state.lock().devices.insert(addr, device);
        self
    }

    /// Detach the device at `addr`.
    pub fn remove_device(&self, addr: u8) {
        self.state.lock().devices.remove(&addr);
    }

    /// Preload registers of the device at `addr` starting at `reg`.
    pub fn set_registers(&self, addr: u8, reg: u8, data: &[u8]) {
        let mut state = self.state.lock();
        let device = state.devices.entry(addr).or_default();
        for (i, b) in data.iter().enumerate() {
            device.registers[usize::from(reg.wrapping_add(i as u8))] = *b;
        }
    }

    /// Snapshot of one register.
    pub fn register(&self, addr: u8, reg: u8) -> Option<u8> {
        self.state
            .lock()
            .devices
            .get(&addr)
            .map(|d| d.registers[usize::from(reg)])
    }

    /// Make every call matching `rule` fail with EIO. The second argument is
    /// the zero-based index of block reads issued so far (for block reads,
    /// the index of the current one).
    pub fn fail_when(&self, rule: impl Fn(&MockOp, usize) -> bool + Send + 'static) {
        self.state.lock().fail_rules.push(Box::new(rule));
    }

    /// Fail the `n`th I2C block read (zero-based).
    pub fn fail_block_read(&self, n: usize) {
        self.fail_when(move |op, index| matches!(op, MockOp::ReadI2cBlock { .. }) && index == n);
    }

    /// Make the `n`th I2C block read return only `count` bytes.
    pub fn short_block_read(&self, n: usize, count: usize) {
        self.state.lock().short_blocks.insert(n, count);
    }

    /// Sleep this long inside every call, simulating a slow or wedged driver.
    pub fn set_stall(&self, stall: Duration) {
        self.state.lock().stall = stall;
    }

    /// Override the reported functionality; `None` makes the query fail.
    pub fn set_functionality(&self, funcs: Option<Functionality>) {
        self.state.lock().funcs = funcs;
    }

    /// Advertise kernel recovery; the flag says whether it will succeed.
    pub fn set_kernel_recovery(&self, succeeds: Option<bool>) {
        self.state.lock().kernel_recovery = succeeds;
    }

    /// Every call made so far.
    pub fn records(&self) -> Vec<MockRecord> {
        self.state.lock().log.clone()
    }

    /// Every call made so far, without timing.
    pub fn ops(&self) -> Vec<MockOp> {
        self.state.lock().log.iter().map(|r| r.op.clone()).collect()
    }

    /// Forget the call log.
    pub fn clear_log(&self) {
        let mut state = self.state.lock();
        state.log.clear();
        state.block_reads = 0;
    }

    // Run one primitive: stall, check fail rules and presence, apply `f`,
    // log the result.
    fn transact<T>(
        &mut self,
        op: MockOp,
        f: impl FnOnce(&mut MockState) -> io::Result<T>,
    ) -> io::Result<T> {
        let started = Instant::now();
        let stall = self.state.lock().stall;
        if !stall.is_zero() {
            std::thread::sleep(stall);
        }

        let mut state = self.state.lock();
        let block_index = state.block_reads;
        if matches!(op, MockOp::ReadI2cBlock { .. }) {
            state.block_reads += 1;
        }

        let result = if state.fail_rules.iter().any(|rule| rule(&op, block_index)) {
            Err(Errno::EIO.into())
        } else {
            f(&mut *state)
        };

        state.log.push(MockRecord {
            op,
            ok: result.is_ok(),
            started,
            finished: Instant::now(),
        });
        result
    }

    fn active(state: &MockState) -> io::Result<u8> {
        state.active.ok_or_else(|| Errno::EINVAL.into())
    }

    fn device(state: &mut MockState, addr: u8) -> io::Result<&mut MockDevice> {
        state.devices.get_mut(&addr).ok_or_else(|| Errno::ENXIO.into())
    }

    fn active_addr(&self) -> u8 {
        self.state.lock().active.unwrap_or(0xFF)
    }
}

fn smbus_funcs() -> Functionality {
    Functionality::SMBUS_QUICK
        | Functionality::SMBUS_READ_BYTE
        | Functionality::SMBUS_WRITE_BYTE
        | Functionality::SMBUS_READ_BYTE_DATA
        | Functionality::SMBUS_WRITE_BYTE_DATA
        | Functionality::SMBUS_READ_WORD_DATA
        | Functionality::SMBUS_WRITE_WORD_DATA
        | Functionality::SMBUS_READ_I2C_BLOCK
        | Functionality::SMBUS_WRITE_I2C_BLOCK
}

impl SmbusTransport for MockBus {
    fn set_slave_address(&mut self, address: u8) -> io::Result<()> {
        self.transact(MockOp::SetSlave(address), |state| {
            // i2c-dev rejects anything wider than 7 bits
            if address > 0x7F {
                return Err(Errno::EINVAL.into());
            }
            state.active = Some(address);
            Ok(())
        })
    }

    fn smbus_quick(&mut self, direction: Direction) -> io::Result<()> {
        let addr = self.active_addr();
        self.transact(MockOp::Quick { addr, direction }, |state| {
            let addr = Self::active(state)?;
            let device = Self::device(state, addr)?;
            let acked = match direction {
                Direction::Write => device.ack_quick_write,
                Direction::Read => device.ack_quick_read,
            };
            if acked {
                Ok(())
            } else {
                Err(Errno::ENXIO.into())
            }
        })
    }

    fn smbus_read_byte(&mut self) -> io::Result<u8> {
        let addr = self.active_addr();
        self.transact(MockOp::ReadByte { addr }, |state| {
            let addr = Self::active(state)?;
            let device = Self::device(state, addr)?;
            if !device.ack_read_byte {
                return Err(Errno::ENXIO.into());
            }
            let value = device.registers[usize::from(device.pointer)];
            device.pointer = device.pointer.wrapping_add(1);
            Ok(value)
        })
    }

    fn smbus_read_byte_data(&mut self, reg: u8) -> io::Result<u8> {
        let addr = self.active_addr();
        self.transact(MockOp::ReadByteData { addr, reg }, |state| {
            let addr = Self::active(state)?;
            Ok(Self::device(state, addr)?.registers[usize::from(reg)])
        })
    }

    fn smbus_write_byte_data(&mut self, reg: u8, value: u8) -> io::Result<()> {
        let addr = self.active_addr();
        self.transact(MockOp::WriteByteData { addr, reg, value }, |state| {
            let addr = Self::active(state)?;
            Self::device(state, addr)?.registers[usize::from(reg)] = value;
            Ok(())
        })
    }

    fn smbus_read_word_data(&mut self, reg: u8) -> io::Result<u16> {
        let addr = self.active_addr();
        self.transact(MockOp::ReadWordData { addr, reg }, |state| {
            let addr = Self::active(state)?;
            let regs = &Self::device(state, addr)?.registers;
            let lo = regs[usize::from(reg)];
            let hi = regs[usize::from(reg.wrapping_add(1))];
            Ok(u16::from_le_bytes([lo, hi]))
        })
    }

    fn smbus_write_word_data(&mut self, reg: u8, value: u16) -> io::Result<()> {
        let addr = self.active_addr();
        self.transact(MockOp::WriteWordData { addr, reg, value }, |state| {
            let addr = Self::active(state)?;
            let regs = &mut Self::device(state, addr)?.registers;
            let [lo, hi] = value.to_le_bytes();
            regs[usize::from(reg)] = lo;
            regs[usize::from(reg.wrapping_add(1))] = hi;
            Ok(())
        })
    }

    fn smbus_read_i2c_block_data(&mut self, reg: u8, buf: &mut [u8]) -> io::Result<usize> {
        let addr = self.active_addr();
        let len = buf.len();
        self.transact(MockOp::ReadI2cBlock { addr, reg, len }, |state| {
            if len == 0 || len > SMBUS_BLOCK_MAX {
                return Err(Errno::EINVAL.into());
            }
            let index = state.block_reads - 1;
            let count = state.short_blocks.get(&index).copied().unwrap_or(len).min(len);
            let addr = Self::active(state)?;
            let regs = &Self::device(state, addr)?.registers;
            for (i, slot) in buf[..count].iter_mut().enumerate() {
                *slot = regs[usize::from(reg.wrapping_add(i as u8))];
            }
            Ok(count)
        })
    }

    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let addr = self.active_addr();
        let len = buf.len();
        self.transact(MockOp::RawRead { addr, len }, |state| {
            let addr = Self::active(state)?;
            let device = Self::device(state, addr)?;
            for slot in buf.iter_mut() {
                *slot = device.registers[usize::from(device.pointer)];
                device.pointer = device.pointer.wrapping_add(1);
            }
            Ok(len)
        })
    }

    fn write(&mut self, data: &[u8]) -> io::Result<usize> {
        let addr = self.active_addr();
        let op = MockOp::RawWrite {
            addr,
            data: data.to_vec(),
        };
        self.transact(op, |state| {
            let addr = Self::active(state)?;
            let device = Self::device(state, addr)?;
            // First byte selects the register, the rest are written from there
            if let Some((&pointer, rest)) = data.split_first() {
                device.pointer = pointer;
                for (i, b) in rest.iter().enumerate() {
                    device.registers[usize::from(pointer.wrapping_add(i as u8))] = *b;
                }
            }
            Ok(data.len())
        })
    }

    fn functionality(&mut self) -> io::Result<Functionality> {
        self.transact(MockOp::Functionality, |state| {
            state.funcs.ok_or_else(|| Errno::EIO.into())
        })
    }

    fn supports_kernel_recovery(&self) -> bool {
        self.state.lock().kernel_recovery.is_some()
    }

    fn kernel_recover(&mut self) -> io::Result<()> {
        self.transact(MockOp::KernelRecover, |state| match state.kernel_recovery {
            Some(true) => Ok(()),
            Some(false) => Err(Errno::ETIMEDOUT.into()),
            None => Err(Errno::ENOTTY.into()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_device_nacks() {
        let mut bus = MockBus::new();
        bus.set_slave_address(0x50).unwrap();
        let err = bus.smbus_quick(Direction::Write).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(Errno::ENXIO as i32));
    }

    #[test]
    fn test_word_is_little_endian_in_registers() {
        let mut bus = MockBus::new();
        bus.add_device(0x40);
        bus.set_slave_address(0x40).unwrap();
        bus.smbus_write_word_data(0x10, 0xBEEF).unwrap();
        assert_eq!(bus.register(0x40, 0x10), Some(0xEF));
        assert_eq!(bus.register(0x40, 0x11), Some(0xBE));
    }

    #[test]
    fn test_raw_write_sets_pointer_for_raw_read() {
        let mut bus = MockBus::new();
        bus.add_device(0x44);
        bus.set_registers(0x44, 0x20, &[1, 2, 3]);
        bus.set_slave_address(0x44).unwrap();
        bus.write(&[0x20]).unwrap();
        let mut buf = [0u8; 3];
        assert_eq!(bus.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
    }

    #[test]
    fn test_fail_rule_and_log() {
        let mut bus = MockBus::new();
        bus.add_device(0x40);
        bus.fail_block_read(1);
        bus.set_slave_address(0x40).unwrap();
        let mut buf = [0u8; 4];
        assert!(bus.smbus_read_i2c_block_data(0, &mut buf).is_ok());
        assert!(bus.smbus_read_i2c_block_data(4, &mut buf).is_err());
        assert!(bus.smbus_read_i2c_block_data(8, &mut buf).is_ok());

        let ok: Vec<bool> = bus.records().iter().map(|r| r.ok).collect();
        assert_eq!(ok, vec![true, true, false, true]);
    }

    #[test]
    fn test_shared_state_across_clones() {
        let observer = MockBus::new();
        let mut moved = observer.clone();
        moved.add_device(0x30);
        moved.set_slave_address(0x30).unwrap();
        assert_eq!(observer.ops(), vec![MockOp::SetSlave(0x30)]);
    }
}
