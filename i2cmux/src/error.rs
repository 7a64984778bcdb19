//! Common error types for i2cmux.
//!
//! This module provides a centralized Error enum using thiserror, with
//! conversions from the OS-level error types returned by the bus transports.

use std::time::Duration;
use thiserror::Error;

/// Main error type for i2cmux operations.
#[derive(Error, Debug)]
pub enum Error {
    /// The bus handle was closed (or never opened)
    #[error("Invalid bus handle")]
    InvalidHandle,

    /// Address outside the legal 7-bit device range, or reserved
    #[error("Invalid device address 0x{0:02X}")]
    InvalidAddress(u8),

    /// Block or raw read length outside its bounds
    #[error("Invalid length {len} (must be 1..={max})")]
    InvalidLength { len: usize, max: usize },

    /// Underlying transaction or ioctl failure
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Every recovery strategy was tried and none unstuck the bus
    #[error("Bus recovery failed")]
    RecoveryFailed,

    /// A coordinated transaction did not complete in time
    #[error("Bus transaction timed out after {0:?}")]
    Timeout(Duration),

    /// The handle timed out earlier and has not been recovered since
    #[error("Bus is degraded, recovery required")]
    Degraded,

    /// The bus thread is gone
    #[error("Bus coordinator is not running")]
    CoordinatorClosed,

    /// Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),
}

impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        Error::Io(errno.into())
    }
}

impl Error {
    /// True for errors raised by the hardware path, as opposed to argument
    /// validation. Callers use this to decide whether recovery is worth it.
    pub fn is_bus_fault(&self) -> bool {
        matches!(self, Error::Io(_) | Error::Timeout(_) | Error::Degraded)
    }
}

/// Convenience type alias for Results using our Error type.
pub type Result<T> = std::result::Result<T, Error>;
