//! Unsticking a frozen bus.
//!
//! A slave that lost track of the clock mid-byte can hold SDA low and wedge
//! every later transfer. Recovery walks an ordered list of increasingly
//! indirect remedies and stops at the first one that gets a transaction
//! through. The list is built once, when the handle is opened, from what the
//! adapter can do.

use super::Bus;
use crate::{
    error::{Error, Result},
    hw_trait::{Direction, SmbusTransport},
    tracing::prelude::*,
    types::DeviceAddress,
};
use std::thread;
use strum::Display;

/// Spacing of the addresses touched by [`RecoveryStrategy::AddressSweep`].
pub const SWEEP_STRIDE: usize = 8;

/// One remedy for a stuck bus.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display)]
#[strum(serialize_all = "snake_case")]
pub enum RecoveryStrategy {
    /// Driver-level recovery: clock pulses on SCL, controller reset
    KernelAssisted,
    /// Quick write to the general-call address
    GeneralCall,
    /// Quick reads across the address space until something answers
    AddressSweep,
    /// Check the driver still answers, let the lines settle, then one last
    /// general call
    FunctionalityProbe,
}

/// Strategies available on `transport`, in the order they are tried.
pub(crate) fn detect_strategies<T: SmbusTransport>(transport: &mut T) -> Vec<RecoveryStrategy> {
    let mut strategies = Vec::with_capacity(4);
    if transport.supports_kernel_recovery() {
        strategies.push(RecoveryStrategy::KernelAssisted);
    }
    strategies.extend([
        RecoveryStrategy::GeneralCall,
        RecoveryStrategy::AddressSweep,
        RecoveryStrategy::FunctionalityProbe,
    ]);
    strategies
}

impl<T: SmbusTransport> Bus<T> {
    /// Try every recovery strategy in order until one succeeds.
    ///
    /// Returns the strategy that worked. On [`Error::RecoveryFailed`] the bus
    /// should be considered unusable until something outside this process
    /// (power cycle, driver reload) intervenes. The previously selected
    /// device address is restored afterwards either way.
    pub fn recover_bus(&mut self) -> Result<RecoveryStrategy> {
        self.transport_mut()?;
        info!(bus = %self.name, "Attempting I2C bus recovery");

        let previous = self.active;
        let strategies = self.strategies.clone();
        let mut recovered = None;

        for strategy in strategies {
            debug!(bus = %self.name, %strategy, "Trying recovery strategy");
            match self.attempt(strategy) {
                Ok(()) => {
                    recovered = Some(strategy);
                    break;
                }
                Err(e) => {
                    debug!(bus = %self.name, %strategy, error = %e, "Recovery strategy failed");
                }
            }
        }

        if let Some(address) = previous {
            if let Err(e) = self.select(address) {
                warn!(
                    bus = %self.name,
                    address = format_args!("0x{:02X}", address),
                    error = %e,
                    "Failed to reselect device after recovery"
                );
            }
        }

        match recovered {
            Some(strategy) => {
                info!(bus = %self.name, %strategy, "I2C bus recovered");
                Ok(strategy)
            }
            None => {
                error!(bus = %self.name, "All I2C bus recovery methods failed");
                Err(Error::RecoveryFailed)
            }
        }
    }

    fn attempt(&mut self, strategy: RecoveryStrategy) -> Result<()> {
        match strategy {
            RecoveryStrategy::KernelAssisted => {
                self.transport_mut()?.kernel_recover()?;
                Ok(())
            }
            RecoveryStrategy::GeneralCall => {
                self.dispatch(DeviceAddress::GENERAL_CALL, |t| t.smbus_quick(Direction::Write))
            }
            RecoveryStrategy::AddressSweep => {
                let mut last_error = Error::RecoveryFailed;
                for address in DeviceAddress::range().step_by(SWEEP_STRIDE) {
                    match self.dispatch(address, |t| t.smbus_quick(Direction::Read)) {
                        Ok(()) => {
                            debug!(
                                bus = %self.name,
                                address = format_args!("0x{:02X}", address),
                                "Sweep probe answered"
                            );
                            return Ok(());
                        }
                        Err(e) => last_error = e,
                    }
                }
                Err(last_error)
            }
            RecoveryStrategy::FunctionalityProbe => {
                let funcs = self.transport_mut()?.functionality()?;
                debug!(bus = %self.name, funcs = ?funcs.describe(), "Driver responsive");
                self.select(DeviceAddress::GENERAL_CALL)?;
                thread::sleep(self.settle_delay);
                self.dispatch_active(|t| t.smbus_quick(Direction::Write))
            }
        }
    }
}
