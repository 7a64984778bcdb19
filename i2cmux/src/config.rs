//! Configuration management for i2cmux.
//!
//! Configuration is a JSON document with a `bus` section and a list of
//! `devices` for the polling daemon. A few bus settings can be overridden
//! from the environment, which is handy for one-off runs under systemd:
//!
//! - `I2CMUX_BUS`: adapter device path
//! - `I2CMUX_MIN_INTERVAL_US`: minimum spacing between transactions
//! - `I2CMUX_TIMEOUT_MS`: coordinator transaction timeout

use crate::{
    bus::{BusOptions, BLOCK_READ_MAX, DEFAULT_MIN_INTERVAL, DEFAULT_SETTLE_DELAY},
    error::{Error, Result},
    types::DeviceAddress,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/i2cmux/i2cmux.json";

/// Main configuration structure.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Bus configuration
    #[serde(default)]
    pub bus: BusConfig,

    /// Devices polled by the daemon
    #[serde(default)]
    pub devices: Vec<DeviceConfig>,
}

/// Adapter and engine settings.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BusConfig {
    /// Adapter device path
    #[serde(default = "default_bus_path")]
    pub path: PathBuf,

    /// Device selected when the bus is opened. Defaults to the first
    /// configured device.
    #[serde(default)]
    pub initial_address: Option<DeviceAddress>,

    /// Minimum spacing between transactions (µs)
    #[serde(default = "default_min_interval_us")]
    pub min_interval_us: u64,

    /// Pause before the final recovery attempt (µs)
    #[serde(default = "default_settle_delay_us")]
    pub settle_delay_us: u64,

    /// How long a coordinated transaction may take before the bus is
    /// declared degraded (ms)
    #[serde(default = "default_timeout_ms")]
    pub transaction_timeout_ms: u64,

    /// How long a request may wait behind others for the bus thread (ms)
    #[serde(default = "default_queue_timeout_ms")]
    pub queue_timeout_ms: u64,

    /// Driver-specific ioctl request for kernel bus recovery, if the
    /// platform has one
    #[serde(default)]
    pub kernel_recover_request: Option<u64>,

    /// Run the bus thread in the idle scheduling class
    #[serde(default)]
    pub background_priority: bool,
}

fn default_bus_path() -> PathBuf {
    PathBuf::from("/dev/i2c-1")
}

fn default_min_interval_us() -> u64 {
    DEFAULT_MIN_INTERVAL.as_micros() as u64
}

fn default_settle_delay_us() -> u64 {
    DEFAULT_SETTLE_DELAY.as_micros() as u64
}

fn default_timeout_ms() -> u64 {
    1000
}

fn default_queue_timeout_ms() -> u64 {
    10_000
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            path: default_bus_path(),
            initial_address: None,
            min_interval_us: default_min_interval_us(),
            settle_delay_us: default_settle_delay_us(),
            transaction_timeout_ms: default_timeout_ms(),
            queue_timeout_ms: default_queue_timeout_ms(),
            kernel_recover_request: None,
            background_priority: false,
        }
    }
}

impl BusConfig {
    /// Engine tunables derived from this section.
    pub fn options(&self) -> BusOptions {
        BusOptions {
            name: self.path.display().to_string(),
            min_interval: Duration::from_micros(self.min_interval_us),
            settle_delay: Duration::from_micros(self.settle_delay_us),
        }
    }

    /// Coordinator transaction timeout.
    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transaction_timeout_ms)
    }

    /// Coordinator queue wait limit.
    pub fn queue_timeout(&self) -> Duration {
        Duration::from_millis(self.queue_timeout_ms)
    }
}

/// What to read from a polled device.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ReadKind {
    Byte,
    Word,
    /// Little-endian 32-bit value from a 4-byte block read
    U32,
    Block { length: usize },
}

/// One device polled by the daemon.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DeviceConfig {
    /// Label used in log events
    pub name: String,

    pub address: DeviceAddress,

    /// Register (command code) to read
    pub register: u8,

    pub read: ReadKind,

    /// Poll period (ms)
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive failures before bus recovery is attempted
    #[serde(default = "default_failures_before_recovery")]
    pub failures_before_recovery: u32,
}

fn default_interval_ms() -> u64 {
    1000
}

fn default_failures_before_recovery() -> u32 {
    3
}

impl DeviceConfig {
    /// Poll period.
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms)
    }
}

impl Config {
    /// Load configuration from `I2CMUX_CONFIG`, or the default location if
    /// that file exists, or built-in defaults.
    pub fn load() -> Result<Self> {
        if let Ok(path) = std::env::var("I2CMUX_CONFIG") {
            return Self::load_from(path);
        }
        if Path::new(DEFAULT_CONFIG_PATH).exists() {
            return Self::load_from(DEFAULT_CONFIG_PATH);
        }
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("reading {}: {}", path.display(), e)))?;
        let mut config = Self::parse(&text)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON document without consulting the environment.
    pub fn parse(text: &str) -> Result<Self> {
        serde_json::from_str(text).map_err(|e| Error::Config(e.to_string()))
    }

    /// Apply environment overrides on top of the loaded values.
    pub fn apply_env(&mut self) -> Result<()> {
        if let Some(path) = env_override::<PathBuf>("I2CMUX_BUS")? {
            self.bus.path = path;
        }
        if let Some(us) = env_override::<u64>("I2CMUX_MIN_INTERVAL_US")? {
            self.bus.min_interval_us = us;
        }
        if let Some(ms) = env_override::<u64>("I2CMUX_TIMEOUT_MS")? {
            self.bus.transaction_timeout_ms = ms;
        }
        Ok(())
    }

    /// Reject settings the engine cannot honor.
    pub fn validate(&self) -> Result<()> {
        if self.bus.transaction_timeout_ms == 0 || self.bus.queue_timeout_ms == 0 {
            return Err(Error::Config("bus timeouts must be positive".into()));
        }
        for device in &self.devices {
            if device.interval_ms == 0 {
                return Err(Error::Config(format!(
                    "device '{}': interval_ms must be positive",
                    device.name
                )));
            }
            if let ReadKind::Block { length } = device.read {
                if length == 0 || length > BLOCK_READ_MAX {
                    return Err(Error::Config(format!(
                        "device '{}': block length {} outside 1..={}",
                        device.name, length, BLOCK_READ_MAX
                    )));
                }
            }
        }
        Ok(())
    }

    /// Address to select when opening the bus.
    pub fn initial_address(&self) -> DeviceAddress {
        self.bus
            .initial_address
            .or_else(|| self.devices.first().map(|d| d.address))
            .unwrap_or(DeviceAddress::LOWEST)
    }
}

// Parse an environment variable if set. Set but malformed is an error
// rather than silently ignored.
fn env_override<T: FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value
            .parse::<T>()
            .map(Some)
            .map_err(|e| Error::Config(format!("{}='{}': {}", name, value, e))),
        Err(_) => Ok(None),
    }
}
