//! Small value types shared across the crate.

pub mod address;

pub use address::DeviceAddress;
