//! Device address type for 7-bit I2C targets.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::ops::RangeInclusive;

/// 7-bit I2C device address.
///
/// Only `0x08..=0x77` can be constructed. The ranges `0x00..=0x07`
/// (general call, CBUS, reserved) and `0x78..=0x7F` (10-bit prefix,
/// reserved) are never legal transaction targets, so holding a
/// `DeviceAddress` is proof that the value was checked.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct DeviceAddress(u8);

impl DeviceAddress {
    /// Lowest address a device may use.
    pub const FIRST: u8 = 0x08;
    /// Highest address a device may use.
    pub const LAST: u8 = 0x77;
    /// Broadcast address, only ever used by bus recovery.
    pub const GENERAL_CALL: u8 = 0x00;
    /// The lowest device address, already validated.
    pub const LOWEST: DeviceAddress = DeviceAddress(Self::FIRST);

    /// Validate a raw address.
    pub fn new(address: u8) -> Result<Self> {
        if Self::is_valid(address) {
            Ok(Self(address))
        } else {
            Err(Error::InvalidAddress(address))
        }
    }

    /// Whether `address` is a legal transaction target.
    pub const fn is_valid(address: u8) -> bool {
        address >= Self::FIRST && address <= Self::LAST
    }

    /// Every legal device address, in ascending order.
    pub fn all() -> impl Iterator<Item = DeviceAddress> {
        Self::range().map(DeviceAddress)
    }

    /// The legal range as raw values.
    pub const fn range() -> RangeInclusive<u8> {
        Self::FIRST..=Self::LAST
    }

    /// Raw 7-bit value.
    pub const fn get(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for DeviceAddress {
    type Error = Error;

    fn try_from(value: u8) -> Result<Self> {
        Self::new(value)
    }
}

impl From<DeviceAddress> for u8 {
    fn from(address: DeviceAddress) -> u8 {
        address.0
    }
}

impl std::fmt::Display for DeviceAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "0x{:02X}", self.0)
    }
}

impl std::str::FromStr for DeviceAddress {
    type Err = Error;

    /// Accepts `0x`-prefixed hex or plain decimal.
    fn from_str(s: &str) -> Result<Self> {
        let s = s.trim();
        let parsed = match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
            Some(hex) => u8::from_str_radix(hex, 16),
            None => s.parse::<u8>(),
        };
        let value =
            parsed.map_err(|e| Error::Config(format!("bad device address '{}': {}", s, e)))?;
        Self::new(value)
    }
}
