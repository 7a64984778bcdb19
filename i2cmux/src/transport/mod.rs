//! Concrete I2C adapters.
//!
//! This module provides the implementations of
//! [`SmbusTransport`](crate::hw_trait::SmbusTransport): the Linux i2c-dev
//! character device used in production, and an in-memory mock used by tests
//! and for dry runs of the tools.

#[cfg(target_os = "linux")]
pub mod linux;
pub mod mock;

#[cfg(target_os = "linux")]
pub use linux::I2cDev;
pub use mock::MockBus;
