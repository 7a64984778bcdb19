//! Shared I2C bus access.
//!
//! A [`Bus`] is one open adapter shared by every device behind it. Each
//! transaction names its target device; the bus switches the adapter's
//! active address and performs the transfer as one paced unit, so callers
//! never depend on what a previous caller left selected.
//!
//! The long-read chunker, the presence scanner and bus recovery live in the
//! submodules and extend `Bus` with further methods.

pub mod block;
pub mod rate_limit;
pub mod recovery;
pub mod scan;

use crate::{
    error::{Error, Result},
    hw_trait::{Direction, Functionality, SmbusTransport, SMBUS_BLOCK_MAX},
    tracing::prelude::*,
    types::DeviceAddress,
};
use std::io;
use std::sync::Arc;
use std::time::Duration;

pub use block::{BLOCK_CHUNK_MAX, BLOCK_READ_MAX};
pub use rate_limit::{RateLimiter, DEFAULT_MIN_INTERVAL};
pub use recovery::RecoveryStrategy;
pub use scan::Presence;

/// Longest plain read accepted by [`Bus::raw_read`].
pub const RAW_READ_MAX: usize = SMBUS_BLOCK_MAX;

/// Default pause before the last recovery attempt.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(1);

/// Tunables for a [`Bus`].
#[derive(Debug, Clone)]
pub struct BusOptions {
    /// Name used in log events, usually the device path
    pub name: String,
    /// Minimum spacing between transactions
    pub min_interval: Duration,
    /// Pause between the liveness query and the final general call during
    /// recovery
    pub settle_delay: Duration,
}

impl Default for BusOptions {
    fn default() -> Self {
        Self {
            name: "i2c".to_string(),
            min_interval: DEFAULT_MIN_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// One open I2C adapter, shared by the devices on it.
pub struct Bus<T: SmbusTransport> {
    transport: Option<T>,
    limiter: Arc<RateLimiter>,
    active: Option<u8>,
    strategies: Vec<RecoveryStrategy>,
    settle_delay: Duration,
    name: String,
}

#[cfg(target_os = "linux")]
impl Bus<crate::transport::I2cDev> {
    /// Open the i2c-dev adapter at `path` and select `initial` on it.
    pub fn open(
        path: impl AsRef<std::path::Path>,
        initial: DeviceAddress,
        recover_request: Option<u64>,
        options: BusOptions,
    ) -> Result<Self> {
        let path = path.as_ref();
        let dev = crate::transport::I2cDev::open(path)
            .map_err(|e| {
                error!(bus = %path.display(), error = %e, "Failed to open I2C bus");
                e
            })?
            .with_recover_request(recover_request);
        Self::new(dev, initial, options)
    }
}

impl<T: SmbusTransport> Bus<T> {
    /// Wrap an open adapter with its own rate limiter.
    pub fn new(transport: T, initial: DeviceAddress, options: BusOptions) -> Result<Self> {
        let limiter = Arc::new(RateLimiter::new(options.min_interval));
        Self::with_limiter(transport, initial, options, limiter)
    }

    /// Wrap an open adapter, pacing against a limiter shared with other
    /// handles on the same physical bus.
    pub fn with_limiter(
        mut transport: T,
        initial: DeviceAddress,
        options: BusOptions,
        limiter: Arc<RateLimiter>,
    ) -> Result<Self> {
        transport.set_slave_address(initial.get()).map_err(|e| {
            error!(bus = %options.name, address = %initial, error = %e, "Failed to select initial device");
            e
        })?;

        let strategies = recovery::detect_strategies(&mut transport);
        let funcs = transport.functionality().ok();

        info!(
            bus = %options.name,
            address = %initial,
            min_interval_us = limiter.min_interval().as_micros() as u64,
            recovery = ?strategies,
            "I2C bus opened"
        );
        if let Some(funcs) = funcs {
            debug!(bus = %options.name, funcs = ?funcs.describe(), "Adapter functionality");
            if !funcs.contains(Functionality::SMBUS_QUICK) {
                warn!(bus = %options.name, "Adapter lacks SMBus quick; probes and recovery may fail");
            }
        }

        Ok(Self {
            transport: Some(transport),
            limiter,
            active: Some(initial.get()),
            strategies,
            settle_delay: options.settle_delay,
            name: options.name,
        })
    }

    /// Name used in log events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Whether the handle is still usable.
    pub fn is_open(&self) -> bool {
        self.transport.is_some()
    }

    /// Release the adapter. Every later operation fails with
    /// [`Error::InvalidHandle`].
    pub fn close(&mut self) -> Result<()> {
        match self.transport.take() {
            Some(transport) => {
                drop(transport);
                self.active = None;
                info!(bus = %self.name, "I2C bus closed");
                Ok(())
            }
            None => Err(Error::InvalidHandle),
        }
    }

    /// The limiter pacing this handle.
    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Raw address currently selected on the adapter.
    pub fn active_address(&self) -> Option<u8> {
        self.active
    }

    /// Recovery strategies detected when the handle was opened, in the
    /// order they will be tried.
    pub fn recovery_strategies(&self) -> &[RecoveryStrategy] {
        &self.strategies
    }

    /// Select `address` as the target of subsequent raw reads and writes.
    pub fn switch_address(&mut self, address: DeviceAddress) -> Result<()> {
        self.select(address.get())?;
        debug!(bus = %self.name, address = %address, "Switched device address");
        Ok(())
    }

    /// Read one byte from register `reg`.
    pub fn read_byte(&mut self, address: DeviceAddress, reg: u8) -> Result<u8> {
        self.dispatch(address.get(), |t| t.smbus_read_byte_data(reg))
    }

    /// Write one byte to register `reg`.
    pub fn write_byte(&mut self, address: DeviceAddress, reg: u8, value: u8) -> Result<()> {
        self.dispatch(address.get(), |t| t.smbus_write_byte_data(reg, value))
    }

    /// Read a 16-bit word from register `reg`, in the byte order the
    /// driver delivers.
    pub fn read_word(&mut self, address: DeviceAddress, reg: u8) -> Result<u16> {
        self.dispatch(address.get(), |t| t.smbus_read_word_data(reg))
    }

    /// Write a 16-bit word to register `reg`.
    pub fn write_word(&mut self, address: DeviceAddress, reg: u8, value: u16) -> Result<()> {
        self.dispatch(address.get(), |t| t.smbus_write_word_data(reg, value))
    }

    /// Address-only write; succeeds iff the device acknowledged.
    pub fn quick_write(&mut self, address: DeviceAddress) -> Result<()> {
        self.dispatch(address.get(), |t| t.smbus_quick(Direction::Write))
    }

    /// Command-less single byte read, used as a presence probe.
    pub fn probe_read_byte(&mut self, address: DeviceAddress) -> Result<u8> {
        self.dispatch(address.get(), |t| t.smbus_read_byte())
    }

    /// Plain read of `len` bytes (1..=32) from the active device, bypassing
    /// SMBus framing. Meant for fetching a response after a command was
    /// sent with [`raw_write`](Self::raw_write). May return fewer bytes
    /// than asked; zero bytes is an error.
    pub fn raw_read(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = raw_buffer(len)?;
        let count = self.dispatch_active(|t| t.read(&mut buf))?;
        self.finish_raw_read(buf, count)
    }

    /// Like [`raw_read`](Self::raw_read), but selects `address` first. The
    /// switch and the read are one paced operation.
    pub fn raw_read_from(&mut self, address: DeviceAddress, len: usize) -> Result<Vec<u8>> {
        let mut buf = raw_buffer(len)?;
        let count = self.dispatch(address.get(), |t| t.read(&mut buf))?;
        self.finish_raw_read(buf, count)
    }

    /// Plain one-byte write to the active device.
    pub fn raw_write(&mut self, value: u8) -> Result<()> {
        let written = self.dispatch_active(|t| t.write(&[value]))?;
        check_written(written)
    }

    /// Plain one-byte write to `address`, switch and write paced together.
    pub fn raw_write_to(&mut self, address: DeviceAddress, value: u8) -> Result<()> {
        let written = self.dispatch(address.get(), |t| t.write(&[value]))?;
        check_written(written)
    }

    fn finish_raw_read(&self, mut buf: Vec<u8>, count: usize) -> Result<Vec<u8>> {
        if count == 0 {
            return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "no bytes read").into());
        }
        buf.truncate(count);
        debug!(bus = %self.name, count, "Raw read");
        Ok(buf)
    }

    /// Adapter functionality. This is an ioctl, not bus traffic, so it is
    /// not paced.
    pub fn functionality(&mut self) -> Result<Functionality> {
        Ok(self.transport_mut()?.functionality()?)
    }

    fn transport_mut(&mut self) -> Result<&mut T> {
        self.transport.as_mut().ok_or(Error::InvalidHandle)
    }

    // Switch the adapter to a raw address, unpaced.
    fn select(&mut self, address: u8) -> Result<()> {
        let transport = self.transport_mut()?;
        transport.set_slave_address(address)?;
        self.active = Some(address);
        Ok(())
    }

    // One logical operation: address switch plus transaction, paced once.
    // A closed handle is rejected before the limiter is touched.
    fn dispatch<R>(
        &mut self,
        address: u8,
        transaction: impl FnOnce(&mut T) -> io::Result<R>,
    ) -> Result<R> {
        self.transport_mut()?;
        let limiter = Arc::clone(&self.limiter);
        let result = limiter.pace(|| -> Result<R> {
            self.select(address)?;
            trace!(bus = %self.name, address = format_args!("0x{:02X}", address), "Dispatch");
            Ok(transaction(self.transport_mut()?)?)
        });
        if let Err(e) = &result {
            trace!(bus = %self.name, address = format_args!("0x{:02X}", address), error = %e, "Transaction failed");
        }
        result
    }

    // Paced transaction on whatever address is already selected.
    fn dispatch_active<R>(&mut self, transaction: impl FnOnce(&mut T) -> io::Result<R>) -> Result<R> {
        let limiter = Arc::clone(&self.limiter);
        let transport = self.transport_mut()?;
        Ok(limiter.pace(|| transaction(transport))?)
    }
}

fn raw_buffer(len: usize) -> Result<Vec<u8>> {
    if len == 0 || len > RAW_READ_MAX {
        return Err(Error::InvalidLength {
            len,
            max: RAW_READ_MAX,
        });
    }
    Ok(vec![0u8; len])
}

fn check_written(written: usize) -> Result<()> {
    if written != 1 {
        return Err(io::Error::from(io::ErrorKind::WriteZero).into());
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::transport::mock::{MockBus, MockOp};
    use serial_test::serial;

    pub(crate) fn addr(raw: u8) -> DeviceAddress {
        DeviceAddress::new(raw).unwrap()
    }

    pub(crate) fn open_mock(mock: &MockBus) -> Bus<MockBus> {
        let bus = Bus::new(mock.clone(), addr(0x08), BusOptions::default()).unwrap();
        mock.clear_log();
        bus
    }

    #[test]
    fn test_word_round_trip() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        let mut bus = open_mock(&mock);

        bus.write_word(addr(0x40), 0x10, 0x1234).unwrap();
        assert_eq!(bus.read_word(addr(0x40), 0x10).unwrap(), 0x1234);
    }

    #[test]
    fn test_byte_round_trip() {
        let mock = MockBus::new();
        mock.add_device(0x1D);
        let mut bus = open_mock(&mock);

        bus.write_byte(addr(0x1D), 0x2A, 0x5A).unwrap();
        assert_eq!(bus.read_byte(addr(0x1D), 0x2A).unwrap(), 0x5A);
        assert_eq!(mock.register(0x1D, 0x2A), Some(0x5A));
    }

    #[test]
    fn test_every_dispatch_switches_address_first() {
        let mock = MockBus::new();
        mock.add_device(0x40).add_device(0x41);
        let mut bus = open_mock(&mock);

        bus.read_byte(addr(0x40), 1).unwrap();
        bus.read_byte(addr(0x41), 2).unwrap();
        bus.read_byte(addr(0x41), 3).unwrap();

        assert_eq!(
            mock.ops(),
            vec![
                MockOp::SetSlave(0x40),
                MockOp::ReadByteData { addr: 0x40, reg: 1 },
                MockOp::SetSlave(0x41),
                MockOp::ReadByteData { addr: 0x41, reg: 2 },
                MockOp::SetSlave(0x41),
                MockOp::ReadByteData { addr: 0x41, reg: 3 },
            ]
        );
    }

    #[test]
    fn test_missing_device_is_io_error_without_retry() {
        let mock = MockBus::new();
        let mut bus = open_mock(&mock);

        assert!(matches!(bus.read_word(addr(0x50), 0), Err(Error::Io(_))));
        assert_eq!(mock.ops().len(), 2);
    }

    #[test]
    fn test_closed_handle_never_touches_hardware() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        let mut bus = open_mock(&mock);
        bus.close().unwrap();

        assert!(matches!(bus.read_byte(addr(0x40), 0), Err(Error::InvalidHandle)));
        assert!(matches!(bus.switch_address(addr(0x40)), Err(Error::InvalidHandle)));
        assert!(matches!(bus.raw_write(0), Err(Error::InvalidHandle)));
        assert!(matches!(bus.read_block(addr(0x40), 0, 8), Err(Error::InvalidHandle)));
        assert!(matches!(bus.close(), Err(Error::InvalidHandle)));
        assert!(mock.ops().is_empty());
        assert!(bus.limiter().last_completed().is_none());
    }

    #[test]
    fn test_initial_address_failure_fails_open() {
        let mock = MockBus::new();
        mock.fail_when(|op, _| matches!(op, MockOp::SetSlave(_)));
        assert!(matches!(
            Bus::new(mock, addr(0x20), BusOptions::default()),
            Err(Error::Io(_))
        ));
    }

    #[test]
    fn test_switch_address_is_not_paced() {
        let mock = MockBus::new();
        let mut bus = open_mock(&mock);
        bus.switch_address(addr(0x33)).unwrap();
        assert_eq!(bus.active_address(), Some(0x33));
        assert!(bus.limiter().last_completed().is_none());
    }

    #[test]
    fn test_raw_command_then_continuation_read() {
        let mock = MockBus::new();
        mock.add_device(0x62);
        mock.set_registers(0x62, 0xEC, &[0x80, 0x0E, 0x41]);
        let mut bus = open_mock(&mock);

        bus.switch_address(addr(0x62)).unwrap();
        bus.raw_write(0xEC).unwrap();
        assert_eq!(bus.raw_read(3).unwrap(), vec![0x80, 0x0E, 0x41]);
    }

    #[test]
    fn test_addressed_raw_ops_select_target_first() {
        let mock = MockBus::new();
        mock.add_device(0x62).add_device(0x50);
        mock.set_registers(0x62, 0xEC, &[0x80, 0x0E]);
        let mut bus = open_mock(&mock);

        bus.raw_write_to(addr(0x62), 0xEC).unwrap();
        bus.read_byte(addr(0x50), 0).unwrap();
        assert_eq!(bus.raw_read_from(addr(0x62), 2).unwrap(), vec![0x80, 0x0E]);

        let ops = mock.ops();
        assert_eq!(ops[0], MockOp::SetSlave(0x62));
        assert_eq!(
            ops[1],
            MockOp::RawWrite {
                addr: 0x62,
                data: vec![0xEC]
            }
        );
        assert_eq!(ops[4], MockOp::SetSlave(0x62));
        assert_eq!(ops[5], MockOp::RawRead { addr: 0x62, len: 2 });
    }

    #[test]
    fn test_raw_read_length_bounds() {
        let mock = MockBus::new();
        let mut bus = open_mock(&mock);
        assert!(matches!(
            bus.raw_read(0),
            Err(Error::InvalidLength { len: 0, max: 32 })
        ));
        assert!(matches!(
            bus.raw_read(33),
            Err(Error::InvalidLength { len: 33, max: 32 })
        ));
        assert!(mock.ops().is_empty());
    }

    #[test]
    #[serial]
    fn test_transactions_are_spaced_by_min_interval() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        let mut bus = open_mock(&mock);

        for reg in 0..5 {
            bus.read_byte(addr(0x40), reg).unwrap();
        }

        // Each logical op is two primitive calls: switch, then transfer.
        let records = mock.records();
        for pair in records.chunks(2).collect::<Vec<_>>().windows(2) {
            let previous_done = pair[0][1].finished;
            let next_start = pair[1][0].started;
            assert!(
                next_start.duration_since(previous_done) >= DEFAULT_MIN_INTERVAL,
                "gap {:?} below floor",
                next_start.duration_since(previous_done)
            );
        }
    }

    #[test]
    fn test_shared_limiter_paces_across_handles() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        let limiter = Arc::new(RateLimiter::default());
        let mut a = Bus::with_limiter(mock.clone(), addr(0x40), BusOptions::default(), limiter.clone()).unwrap();
        let mut b = Bus::with_limiter(mock.clone(), addr(0x40), BusOptions::default(), limiter.clone()).unwrap();

        a.read_byte(addr(0x40), 0).unwrap();
        let after_a = limiter.last_completed().unwrap();
        b.read_byte(addr(0x40), 0).unwrap();
        let after_b = limiter.last_completed().unwrap();
        assert!(after_b.duration_since(after_a) >= DEFAULT_MIN_INTERVAL);
    }

    #[test]
    fn test_functionality_passthrough() {
        let mock = MockBus::new();
        let mut bus = open_mock(&mock);
        assert!(bus.functionality().unwrap().contains(Functionality::SMBUS_QUICK));
    }
}
