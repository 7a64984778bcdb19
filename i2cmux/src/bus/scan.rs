//! Device presence detection, the way `i2cdetect` does it.
//!
//! Some devices acknowledge a quick write but not a read, others only answer
//! reads, so a probe tries the quick write first and falls back to a
//! single-byte read before declaring the address empty.

use super::Bus;
use crate::{hw_trait::SmbusTransport, tracing::prelude::*, types::DeviceAddress};
use strum::Display;

/// Outcome of probing one address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Presence {
    /// A device acknowledged one of the probes
    Detected,
    /// Neither probe was acknowledged
    NotDetected,
    /// Reserved or out-of-range address; nothing was sent
    Invalid,
}

/// Which probe found a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
enum Probe {
    QuickWrite,
    ReadByte,
}

impl<T: SmbusTransport> Bus<T> {
    /// Probe a single raw address.
    ///
    /// Addresses outside `0x08..=0x77` report [`Presence::Invalid`] without
    /// any bus traffic. [`Presence`] has no failure outcome: on a closed
    /// handle the scan sends nothing, logs a warning and reports
    /// [`Presence::NotDetected`]. Callers that must tell the two apart
    /// check [`is_open`](Self::is_open) first.
    pub fn scan_address(&mut self, address: u8) -> Presence {
        let Ok(address) = DeviceAddress::new(address) else {
            return Presence::Invalid;
        };
        if !self.is_open() {
            warn!(bus = %self.name, address = %address, "Scan on closed bus handle");
            return Presence::NotDetected;
        }

        let found = if self.quick_write(address).is_ok() {
            Some(Probe::QuickWrite)
        } else if self.probe_read_byte(address).is_ok() {
            Some(Probe::ReadByte)
        } else {
            None
        };

        match found {
            Some(probe) => {
                info!(bus = %self.name, address = %address, %probe, "Device found");
                Presence::Detected
            }
            None => {
                debug!(bus = %self.name, address = %address, "No device");
                Presence::NotDetected
            }
        }
    }

    /// Probe every legal address and return the ones that answered.
    pub fn scan_range(&mut self) -> Vec<DeviceAddress> {
        if !self.is_open() {
            warn!(bus = %self.name, "Scan on closed bus handle");
            return Vec::new();
        }
        let found: Vec<DeviceAddress> = DeviceAddress::all()
            .filter(|address| self.scan_address(address.get()) == Presence::Detected)
            .collect();
        info!(bus = %self.name, count = found.len(), "Bus scan complete");
        found
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::open_mock;
    use crate::hw_trait::Direction;
    use crate::transport::mock::{MockBus, MockDevice, MockOp};
    use test_case::test_case;

    #[test]
    fn test_invalid_iff_outside_legal_range() {
        let mock = MockBus::new();
        let mut bus = open_mock(&mock);

        for a in 0..=u8::MAX {
            let presence = bus.scan_address(a);
            let expected_invalid = a < 0x08 || a > 0x77;
            assert_eq!(presence == Presence::Invalid, expected_invalid, "address 0x{a:02X}");
        }
    }

    #[test_case(0x00 ; "general call")]
    #[test_case(0x07 ; "reserved low")]
    #[test_case(0x78 ; "reserved high")]
    #[test_case(0x80 ; "eight bit")]
    fn test_invalid_sends_nothing(a: u8) {
        let mock = MockBus::new();
        mock.add_device(a);
        let mut bus = open_mock(&mock);

        assert_eq!(bus.scan_address(a), Presence::Invalid);
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_quick_write_ack_detects_without_fallback() {
        let mock = MockBus::new();
        mock.add_device(0x48);
        let mut bus = open_mock(&mock);

        assert_eq!(bus.scan_address(0x48), Presence::Detected);
        assert_eq!(
            mock.ops(),
            vec![
                MockOp::SetSlave(0x48),
                MockOp::Quick {
                    addr: 0x48,
                    direction: Direction::Write
                },
            ]
        );
    }

    #[test]
    fn test_read_byte_fallback_detects() {
        let mock = MockBus::new();
        mock.add_device_with(
            0x50,
            MockDevice {
                ack_quick_write: false,
                ..MockDevice::default()
            },
        );
        let mut bus = open_mock(&mock);

        assert_eq!(bus.scan_address(0x50), Presence::Detected);
        assert!(mock.ops().contains(&MockOp::ReadByte { addr: 0x50 }));
    }

    #[test]
    fn test_neither_probe_answers() {
        let mock = MockBus::new();
        mock.add_device_with(
            0x51,
            MockDevice {
                ack_quick_write: false,
                ack_read_byte: false,
                ..MockDevice::default()
            },
        );
        let mut bus = open_mock(&mock);

        assert_eq!(bus.scan_address(0x51), Presence::NotDetected);
        assert_eq!(bus.scan_address(0x52), Presence::NotDetected);
    }

    #[test]
    fn test_scan_range_lists_devices() {
        let mock = MockBus::new();
        mock.add_device(0x08).add_device(0x3C).add_device(0x77).add_device(0x78);
        let mut bus = open_mock(&mock);

        let found: Vec<u8> = bus.scan_range().into_iter().map(DeviceAddress::get).collect();
        assert_eq!(found, vec![0x08, 0x3C, 0x77]);
    }

    #[test]
    fn test_closed_handle_detects_nothing_and_sends_nothing() {
        let mock = MockBus::new();
        mock.add_device(0x48);
        let mut bus = open_mock(&mock);
        bus.close().unwrap();

        assert_eq!(bus.scan_address(0x48), Presence::NotDetected);
        assert_eq!(bus.scan_address(0x03), Presence::Invalid);
        assert!(bus.scan_range().is_empty());
        assert!(mock.ops().is_empty());
    }

    #[test]
    fn test_presence_display() {
        assert_eq!(Presence::NotDetected.to_string(), "not_detected");
    }
}
