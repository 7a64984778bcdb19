//! Periodic device polling for the daemon.
//!
//! Each configured device gets its own task that reads one register on a
//! fixed period through the shared [`BusClient`]. Consecutive bus faults
//! trigger a bus recovery and one immediate retry; a device that still
//! fails is reported offline until it answers again.

use crate::{
    config::{DeviceConfig, ReadKind},
    coordinator::BusClient,
    error::Result,
    tracing::prelude::*,
};
use std::fmt;
use tokio::time::{self, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

/// One value read from a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sample {
    Byte(u8),
    Word(u16),
    U32(u32),
    Block(Vec<u8>),
}

impl fmt::Display for Sample {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sample::Byte(v) => write!(f, "0x{:02x}", v),
            Sample::Word(v) => write!(f, "0x{:04x}", v),
            Sample::U32(v) => write!(f, "0x{:08x}", v),
            Sample::Block(data) => write!(f, "{}", hex::encode(data)),
        }
    }
}

/// Counters reported when a poll task exits.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PollStats {
    pub samples: u64,
    pub failures: u64,
    pub recoveries: u64,
    /// Times the device was declared offline
    pub went_offline: u64,
    /// Times an offline device answered again
    pub came_back: u64,
}

/// Read the configured register once.
pub async fn read_once(client: &BusClient, device: &DeviceConfig) -> Result<Sample> {
    let (address, reg) = (device.address, device.register);
    Ok(match device.read {
        ReadKind::Byte => Sample::Byte(client.read_byte(address, reg).await?),
        ReadKind::Word => Sample::Word(client.read_word(address, reg).await?),
        ReadKind::U32 => Sample::U32(client.read_u32_le(address, reg).await?),
        ReadKind::Block { length } => {
            let data = client.read_block(address, reg, length).await?;
            if data.len() < length {
                warn!(device = %device.name, requested = length, received = data.len(), "Partial sample");
            }
            Sample::Block(data)
        }
    })
}

/// Poll `device` until `running` is cancelled.
pub async fn task(client: BusClient, device: DeviceConfig, running: CancellationToken) -> PollStats {
    let mut ticker = time::interval(device.interval());
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let mut stats = PollStats::default();
    let mut consecutive = 0u32;
    let mut offline = false;

    info!(device = %device.name, address = %device.address, interval = ?device.interval(), "Polling started");

    loop {
        tokio::select! {
            _ = running.cancelled() => break,
            _ = ticker.tick() => {}
        }

        let mut result = read_once(&client, &device).await;

        if let Err(e) = &result {
            stats.failures += 1;
            if !e.is_bus_fault() {
                warn!(device = %device.name, error = %e, "Poll failed");
                continue;
            }
            consecutive += 1;
            debug!(device = %device.name, error = %e, consecutive, "Poll failed");

            if consecutive < device.failures_before_recovery {
                continue;
            }

            consecutive = 0;
            match client.recover_bus().await {
                Ok(strategy) => {
                    stats.recoveries += 1;
                    debug!(device = %device.name, %strategy, "Retrying after recovery");
                }
                Err(e) => warn!(device = %device.name, error = %e, "Recovery failed"),
            }
            result = read_once(&client, &device).await;
        }

        match result {
            Ok(sample) => {
                if offline {
                    info!(device = %device.name, "Device back online");
                    offline = false;
                    stats.came_back += 1;
                }
                consecutive = 0;
                stats.samples += 1;
                info!(device = %device.name, value = %sample, "Sample");
            }
            Err(e) => {
                stats.failures += 1;
                if !offline {
                    error!(device = %device.name, address = %device.address, error = %e, "Device offline");
                    offline = true;
                    stats.went_offline += 1;
                }
            }
        }
    }

    info!(
        device = %device.name,
        samples = stats.samples,
        failures = stats.failures,
        recoveries = stats.recoveries,
        went_offline = stats.went_offline,
        came_back = stats.came_back,
        "Polling stopped"
    );
    stats
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::addr;
    use crate::bus::{Bus, BusOptions};
    use crate::coordinator::{self, CoordinatorOptions};
    use crate::hw_trait::Direction;
    use crate::transport::mock::{MockBus, MockOp};
    use std::time::Duration;

    fn device(address: u8, read: ReadKind, threshold: u32) -> DeviceConfig {
        DeviceConfig {
            name: format!("dev{:02x}", address),
            address: addr(address),
            register: 0x00,
            read,
            interval_ms: 5,
            failures_before_recovery: threshold,
        }
    }

    fn client_for(mock: &MockBus) -> BusClient {
        let bus = Bus::new(mock.clone(), addr(0x08), BusOptions::default()).unwrap();
        mock.clear_log();
        let (client, _handle) = coordinator::spawn(bus, CoordinatorOptions::default()).unwrap();
        client
    }

    #[test]
    fn test_sample_display() {
        assert_eq!(Sample::Byte(0x0a).to_string(), "0x0a");
        assert_eq!(Sample::Word(0x1234).to_string(), "0x1234");
        assert_eq!(Sample::U32(0xdead_beef).to_string(), "0xdeadbeef");
        assert_eq!(Sample::Block(vec![0x01, 0xff]).to_string(), "01ff");
    }

    #[tokio::test]
    async fn test_read_once_kinds() {
        let mock = MockBus::new();
        mock.add_device(0x48);
        mock.set_registers(0x48, 0x00, &[0x34, 0x12, 0x00, 0x00, 0x99]);
        let client = client_for(&mock);

        assert_eq!(
            read_once(&client, &device(0x48, ReadKind::Word, 3)).await.unwrap(),
            Sample::Word(0x1234)
        );
        assert_eq!(
            read_once(&client, &device(0x48, ReadKind::U32, 3)).await.unwrap(),
            Sample::U32(0x1234)
        );
        assert_eq!(
            read_once(&client, &device(0x48, ReadKind::Block { length: 5 }, 3))
                .await
                .unwrap(),
            Sample::Block(vec![0x34, 0x12, 0x00, 0x00, 0x99])
        );
    }

    #[tokio::test]
    async fn test_healthy_device_never_recovers() {
        let mock = MockBus::new();
        mock.add_device(0x48);
        let client = client_for(&mock);
        let running = CancellationToken::new();

        let poll = tokio::spawn(task(client, device(0x48, ReadKind::Byte, 2), running.clone()));
        time::sleep(Duration::from_millis(60)).await;
        running.cancel();
        let stats = poll.await.unwrap();

        assert!(stats.samples >= 3);
        assert_eq!(stats.failures, 0);
        assert_eq!(stats.recoveries, 0);
    }

    #[tokio::test]
    async fn test_repeated_failures_trigger_recovery() {
        let mock = MockBus::new();
        // Answers the general call so recovery succeeds, but the polled
        // device is missing
        mock.add_device(0x00);
        let client = client_for(&mock);
        let running = CancellationToken::new();

        let poll = tokio::spawn(task(client, device(0x48, ReadKind::Byte, 2), running.clone()));
        time::sleep(Duration::from_millis(80)).await;
        running.cancel();
        let stats = poll.await.unwrap();

        assert_eq!(stats.samples, 0);
        assert!(stats.recoveries >= 1);
        assert!(mock.ops().contains(&MockOp::Quick {
            addr: 0x00,
            direction: Direction::Write
        }));
    }

    #[tokio::test]
    async fn test_retry_after_recovery_succeeds() {
        let mock = MockBus::new();
        mock.add_device(0x00).add_device(0x48);
        mock.set_registers(0x48, 0x00, &[0x42]);
        // First two reads fail, everything after works
        mock.fail_when({
            let reads = std::sync::Mutex::new(0usize);
            move |op, _| {
                if !matches!(op, MockOp::ReadByteData { .. }) {
                    return false;
                }
                let mut n = reads.lock().unwrap();
                *n += 1;
                *n <= 2
            }
        });
        let client = client_for(&mock);
        let running = CancellationToken::new();

        let poll = tokio::spawn(task(client, device(0x48, ReadKind::Byte, 2), running.clone()));
        time::sleep(Duration::from_millis(60)).await;
        running.cancel();
        let stats = poll.await.unwrap();

        assert_eq!(stats.failures, 2);
        assert_eq!(stats.recoveries, 1);
        assert!(stats.samples >= 1);
        assert_eq!(stats.went_offline, 0);
    }

    #[tokio::test]
    async fn test_offline_device_comes_back() {
        let mock = MockBus::new();
        mock.add_device(0x00).add_device(0x48);
        // Two failures trigger recovery, the retry fails too, then the
        // device recovers on its own
        mock.fail_when({
            let reads = std::sync::Mutex::new(0usize);
            move |op, _| {
                if !matches!(op, MockOp::ReadByteData { .. }) {
                    return false;
                }
                let mut n = reads.lock().unwrap();
                *n += 1;
                *n <= 3
            }
        });
        let client = client_for(&mock);
        let running = CancellationToken::new();

        let poll = tokio::spawn(task(client, device(0x48, ReadKind::Byte, 2), running.clone()));
        time::sleep(Duration::from_millis(80)).await;
        running.cancel();
        let stats = poll.await.unwrap();

        assert_eq!(stats.went_offline, 1);
        assert_eq!(stats.came_back, 1);
        assert_eq!(stats.failures, 3);
        assert!(stats.samples >= 1);
    }
}
