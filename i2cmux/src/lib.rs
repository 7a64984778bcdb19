//! i2cmux: shared, rate-limited access to one I2C bus.
//!
//! Many logical devices share a single adapter. The [`bus::Bus`] engine
//! serializes and paces their transactions, splits long register reads into
//! safe block transfers, probes for devices and unsticks a frozen bus. The
//! [`coordinator`] puts the engine behind an async command queue for the
//! polling daemon.

pub mod bus;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod hw_trait;
pub mod poller;
pub mod sched;
pub mod tracing;
pub mod transport;
pub mod types;
