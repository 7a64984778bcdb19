//! Single-owner bus thread with an async command queue.
//!
//! The [`Bus`] engine is blocking and needs `&mut self`, so one dedicated
//! thread owns it and executes [`BusCommand`]s one at a time. Async code
//! talks to that thread through a cloneable [`BusClient`], which bounds
//! every request with a timeout.
//!
//! Every command names its target device, so the address switch and the
//! transfer always run back to back on the bus thread. There is no
//! standalone "select" command: another client's request could land
//! between it and the transfer that depends on it.
//!
//! A request has two limits. Waiting in the queue is bounded by
//! `queue_timeout`; execution, counted from the moment the bus thread picks
//! the command up, is bounded by `timeout`. Only an execution timeout means
//! a transaction is hung. A blocking ioctl cannot be interrupted, so the
//! client then marks the bus degraded and later requests fail immediately
//! with [`Error::Degraded`] instead of piling up behind it. A successful
//! [`BusClient::recover_bus`] clears the mark.

use crate::{
    bus::{Bus, Presence, RecoveryStrategy},
    error::{Error, Result},
    hw_trait::{Functionality, SmbusTransport},
    sched,
    tracing::prelude::*,
    types::DeviceAddress,
};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time;

/// Depth of the command queue.
const QUEUE_DEPTH: usize = 32;

type Respond<R> = oneshot::Sender<Result<R>>;

/// Commands executed on the bus thread.
#[derive(Debug)]
pub enum BusCommand {
    ReadByte {
        address: DeviceAddress,
        reg: u8,
        respond: Respond<u8>,
    },
    WriteByte {
        address: DeviceAddress,
        reg: u8,
        value: u8,
        respond: Respond<()>,
    },
    ReadWord {
        address: DeviceAddress,
        reg: u8,
        respond: Respond<u16>,
    },
    WriteWord {
        address: DeviceAddress,
        reg: u8,
        value: u16,
        respond: Respond<()>,
    },
    ReadBlock {
        address: DeviceAddress,
        start: u8,
        length: usize,
        respond: Respond<Vec<u8>>,
    },
    ReadU32 {
        address: DeviceAddress,
        reg: u8,
        respond: Respond<u32>,
    },
    RawRead {
        address: DeviceAddress,
        len: usize,
        respond: Respond<Vec<u8>>,
    },
    RawWrite {
        address: DeviceAddress,
        value: u8,
        respond: Respond<()>,
    },
    ScanAddress {
        address: u8,
        respond: Respond<Presence>,
    },
    ScanRange {
        respond: Respond<Vec<DeviceAddress>>,
    },
    Recover {
        respond: Respond<RecoveryStrategy>,
    },
    Functionality {
        respond: Respond<Functionality>,
    },
}

// A command plus the signal sent when the bus thread starts on it.
#[derive(Debug)]
struct Envelope {
    command: BusCommand,
    picked_up: oneshot::Sender<()>,
}

/// Bus thread settings.
#[derive(Debug, Clone)]
pub struct CoordinatorOptions {
    /// Longest a command may execute once the bus thread has picked it up
    pub timeout: Duration,
    /// Longest a request may wait in the queue
    pub queue_timeout: Duration,
    /// Move the bus thread to the idle scheduling class
    pub background_priority: bool,
}

impl Default for CoordinatorOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(1),
            queue_timeout: Duration::from_secs(10),
            background_priority: false,
        }
    }
}

/// Start the bus thread.
///
/// The thread runs until every [`BusClient`] clone is dropped, then closes
/// the bus and exits.
pub fn spawn<T>(bus: Bus<T>, options: CoordinatorOptions) -> Result<(BusClient, JoinHandle<()>)>
where
    T: SmbusTransport + 'static,
{
    let (tx, rx) = mpsc::channel(QUEUE_DEPTH);
    let name: Arc<str> = Arc::from(bus.name());
    let background = options.background_priority;

    let handle = thread::Builder::new()
        .name(format!("i2c:{}", name))
        .spawn(move || run(bus, rx, background))?;

    let client = BusClient {
        tx,
        degraded: Arc::new(AtomicBool::new(false)),
        timeout: options.timeout,
        queue_timeout: options.queue_timeout,
        name,
    };
    Ok((client, handle))
}

fn run<T: SmbusTransport>(mut bus: Bus<T>, mut rx: mpsc::Receiver<Envelope>, background: bool) {
    if background {
        // Failure is logged inside; the thread keeps normal priority.
        let _ = sched::set_background_priority();
    }
    debug!(bus = %bus.name(), "Bus coordinator started");

    while let Some(envelope) = rx.blocking_recv() {
        // The requester gave up while queued; don't touch the bus for it.
        if envelope.picked_up.send(()).is_err() {
            trace!(bus = %bus.name(), "Dropping abandoned command");
            continue;
        }
        execute(&mut bus, envelope.command);
    }

    if let Err(e) = bus.close() {
        debug!(bus = %bus.name(), error = %e, "Bus already closed");
    }
    debug!(bus = %bus.name(), "Bus coordinator stopped");
}

// A dropped receiver means the requester timed out; the result is discarded.
fn execute<T: SmbusTransport>(bus: &mut Bus<T>, command: BusCommand) {
    match command {
        BusCommand::ReadByte { address, reg, respond } => {
            let _ = respond.send(bus.read_byte(address, reg));
        }
        BusCommand::WriteByte {
            address,
            reg,
            value,
            respond,
        } => {
            let _ = respond.send(bus.write_byte(address, reg, value));
        }
        BusCommand::ReadWord { address, reg, respond } => {
            let _ = respond.send(bus.read_word(address, reg));
        }
        BusCommand::WriteWord {
            address,
            reg,
            value,
            respond,
        } => {
            let _ = respond.send(bus.write_word(address, reg, value));
        }
        BusCommand::ReadBlock {
            address,
            start,
            length,
            respond,
        } => {
            let _ = respond.send(bus.read_block(address, start, length));
        }
        BusCommand::ReadU32 { address, reg, respond } => {
            let _ = respond.send(bus.read_u32_le(address, reg));
        }
        BusCommand::RawRead { address, len, respond } => {
            let _ = respond.send(bus.raw_read_from(address, len));
        }
        BusCommand::RawWrite {
            address,
            value,
            respond,
        } => {
            let _ = respond.send(bus.raw_write_to(address, value));
        }
        BusCommand::ScanAddress { address, respond } => {
            let _ = respond.send(Ok(bus.scan_address(address)));
        }
        BusCommand::ScanRange { respond } => {
            let _ = respond.send(Ok(bus.scan_range()));
        }
        BusCommand::Recover { respond } => {
            let _ = respond.send(bus.recover_bus());
        }
        BusCommand::Functionality { respond } => {
            let _ = respond.send(bus.functionality());
        }
    }
}

/// Async handle to the bus thread. Cheap to clone.
#[derive(Debug, Clone)]
pub struct BusClient {
    tx: mpsc::Sender<Envelope>,
    degraded: Arc<AtomicBool>,
    timeout: Duration,
    queue_timeout: Duration,
    name: Arc<str>,
}

impl BusClient {
    /// Bus name, for log events.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// True after a timeout, until a recovery succeeds.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Acquire)
    }

    pub async fn read_byte(&self, address: DeviceAddress, reg: u8) -> Result<u8> {
        self.request(|respond| BusCommand::ReadByte { address, reg, respond })
            .await
    }

    pub async fn write_byte(&self, address: DeviceAddress, reg: u8, value: u8) -> Result<()> {
        self.request(|respond| BusCommand::WriteByte {
            address,
            reg,
            value,
            respond,
        })
        .await
    }

    pub async fn read_word(&self, address: DeviceAddress, reg: u8) -> Result<u16> {
        self.request(|respond| BusCommand::ReadWord { address, reg, respond })
            .await
    }

    pub async fn write_word(&self, address: DeviceAddress, reg: u8, value: u16) -> Result<()> {
        self.request(|respond| BusCommand::WriteWord {
            address,
            reg,
            value,
            respond,
        })
        .await
    }

    /// See [`Bus::read_block`]; short reads are returned as success.
    pub async fn read_block(&self, address: DeviceAddress, start: u8, length: usize) -> Result<Vec<u8>> {
        self.request(|respond| BusCommand::ReadBlock {
            address,
            start,
            length,
            respond,
        })
        .await
    }

    pub async fn read_u32_le(&self, address: DeviceAddress, reg: u8) -> Result<u32> {
        self.request(|respond| BusCommand::ReadU32 { address, reg, respond })
            .await
    }

    /// Unframed read from `address`; see [`Bus::raw_read_from`].
    pub async fn raw_read(&self, address: DeviceAddress, len: usize) -> Result<Vec<u8>> {
        self.request(|respond| BusCommand::RawRead { address, len, respond })
            .await
    }

    /// Unframed one-byte write to `address`; see [`Bus::raw_write_to`].
    pub async fn raw_write(&self, address: DeviceAddress, value: u8) -> Result<()> {
        self.request(|respond| BusCommand::RawWrite {
            address,
            value,
            respond,
        })
        .await
    }

    pub async fn scan_address(&self, address: u8) -> Result<Presence> {
        self.request(|respond| BusCommand::ScanAddress { address, respond })
            .await
    }

    pub async fn scan_range(&self) -> Result<Vec<DeviceAddress>> {
        self.request(|respond| BusCommand::ScanRange { respond }).await
    }

    pub async fn functionality(&self) -> Result<Functionality> {
        self.request(|respond| BusCommand::Functionality { respond })
            .await
    }

    /// Run bus recovery. Allowed while degraded; success clears the degraded
    /// mark, total failure sets it.
    pub async fn recover_bus(&self) -> Result<RecoveryStrategy> {
        let result = self.submit(|respond| BusCommand::Recover { respond }).await;
        match &result {
            Ok(strategy) => {
                if self.degraded.swap(false, Ordering::AcqRel) {
                    info!(bus = %self.name, %strategy, "Bus no longer degraded");
                }
            }
            Err(Error::RecoveryFailed) => self.degraded.store(true, Ordering::Release),
            Err(_) => {}
        }
        result
    }

    async fn request<R>(&self, build: impl FnOnce(Respond<R>) -> BusCommand) -> Result<R> {
        if self.is_degraded() {
            return Err(Error::Degraded);
        }
        self.submit(build).await
    }

    async fn submit<R>(&self, build: impl FnOnce(Respond<R>) -> BusCommand) -> Result<R> {
        let (respond, response) = oneshot::channel();
        let (picked_up, started) = oneshot::channel();
        let envelope = Envelope {
            command: build(respond),
            picked_up,
        };

        let queued = async {
            self.tx
                .send(envelope)
                .await
                .map_err(|_| Error::CoordinatorClosed)?;
            started.await.map_err(|_| Error::CoordinatorClosed)
        };
        match time::timeout(self.queue_timeout, queued).await {
            Ok(result) => result?,
            Err(_) => {
                warn!(bus = %self.name, timeout = ?self.queue_timeout, "Bus queue wait timed out");
                return Err(Error::Timeout(self.queue_timeout));
            }
        }

        match time::timeout(self.timeout, response).await {
            Ok(result) => result.map_err(|_| Error::CoordinatorClosed)?,
            Err(_) => {
                if !self.degraded.swap(true, Ordering::AcqRel) {
                    error!(bus = %self.name, timeout = ?self.timeout, "Bus transaction timed out; bus degraded");
                }
                Err(Error::Timeout(self.timeout))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::tests::addr;
    use crate::bus::BusOptions;
    use crate::transport::mock::{MockBus, MockOp};

    fn start(mock: &MockBus, timeout: Duration) -> (BusClient, JoinHandle<()>) {
        let bus = Bus::new(mock.clone(), addr(0x08), BusOptions::default()).unwrap();
        mock.clear_log();
        spawn(
            bus,
            CoordinatorOptions {
                timeout,
                ..CoordinatorOptions::default()
            },
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_requests_reach_bus() {
        let mock = MockBus::new();
        mock.add_device(0x40).add_device(0x50);
        mock.set_registers(0x50, 0x00, &[0x78, 0x56, 0x34, 0x12]);
        let (client, _handle) = start(&mock, Duration::from_secs(1));

        client.write_word(addr(0x40), 0x10, 0xBEEF).await.unwrap();
        assert_eq!(client.read_word(addr(0x40), 0x10).await.unwrap(), 0xBEEF);
        assert_eq!(client.read_u32_le(addr(0x50), 0x00).await.unwrap(), 0x1234_5678);
        assert_eq!(client.scan_address(0x50).await.unwrap(), Presence::Detected);
        assert_eq!(client.scan_address(0x03).await.unwrap(), Presence::Invalid);
    }

    #[tokio::test]
    async fn test_bus_errors_pass_through_without_degrading() {
        let mock = MockBus::new();
        let (client, _handle) = start(&mock, Duration::from_secs(1));

        assert!(matches!(client.read_byte(addr(0x33), 0).await, Err(Error::Io(_))));
        assert!(matches!(
            client.read_block(addr(0x33), 0, 0).await,
            Err(Error::InvalidLength { .. })
        ));
        assert!(!client.is_degraded());
    }

    #[tokio::test]
    async fn test_timeout_degrades_until_recovered() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        let (client, _handle) = start(&mock, Duration::from_millis(50));

        mock.set_stall(Duration::from_millis(200));
        assert!(matches!(client.read_byte(addr(0x40), 0).await, Err(Error::Timeout(_))));
        assert!(client.is_degraded());
        mock.set_stall(Duration::ZERO);

        // Fails fast without queueing anything
        let before = mock.ops().len();
        assert!(matches!(client.read_byte(addr(0x40), 0).await, Err(Error::Degraded)));
        assert_eq!(mock.ops().len(), before);

        // Let the hung transaction drain before recovering
        time::sleep(Duration::from_millis(600)).await;
        client.recover_bus().await.unwrap();
        assert!(!client.is_degraded());
        client.read_byte(addr(0x40), 0).await.unwrap();
    }

    #[tokio::test]
    async fn test_failed_recovery_degrades() {
        let mock = MockBus::new();
        mock.set_functionality(None);
        let (client, _handle) = start(&mock, Duration::from_secs(1));

        assert!(matches!(client.recover_bus().await, Err(Error::RecoveryFailed)));
        assert!(client.is_degraded());
        assert!(matches!(client.scan_range().await, Err(Error::Degraded)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_clients_never_overlap() {
        let mock = MockBus::new();
        mock.add_device(0x20).add_device(0x21).add_device(0x22).add_device(0x23);
        let (client, _handle) = start(&mock, Duration::from_secs(5));

        let mut tasks = Vec::new();
        for device in 0x20..=0x23u8 {
            let client = client.clone();
            tasks.push(tokio::spawn(async move {
                for reg in 0..10u8 {
                    client.write_byte(addr(device), reg, device ^ reg).await.unwrap();
                    assert_eq!(client.read_byte(addr(device), reg).await.unwrap(), device ^ reg);
                }
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        let records = mock.records();
        for pair in records.windows(2) {
            assert!(pair[0].finished <= pair[1].started);
        }
    }

    #[tokio::test]
    async fn test_raw_ops_reach_their_device_between_other_clients() {
        let mock = MockBus::new();
        mock.add_device(0x44).add_device(0x50);
        mock.set_registers(0x44, 0xEC, &[0x12, 0x34]);
        let (a, _handle) = start(&mock, Duration::from_secs(1));
        let b = a.clone();

        a.raw_write(addr(0x44), 0xEC).await.unwrap();
        b.read_byte(addr(0x50), 0).await.unwrap();
        assert_eq!(a.raw_read(addr(0x44), 2).await.unwrap(), vec![0x12, 0x34]);

        assert_eq!(
            mock.ops(),
            vec![
                MockOp::SetSlave(0x44),
                MockOp::RawWrite {
                    addr: 0x44,
                    data: vec![0xEC]
                },
                MockOp::SetSlave(0x50),
                MockOp::ReadByteData { addr: 0x50, reg: 0 },
                MockOp::SetSlave(0x44),
                MockOp::RawRead { addr: 0x44, len: 2 },
            ]
        );
    }

    #[tokio::test]
    async fn test_queue_wait_does_not_count_as_hang() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        // Each read is two 60 ms primitives: 120 ms of execution, well under
        // the limit, but the last request queues behind three others.
        mock.set_stall(Duration::from_millis(60));
        let (client, _handle) = start(&mock, Duration::from_millis(250));
        let (c1, c2, c3) = (client.clone(), client.clone(), client.clone());

        let (r0, r1, r2, r3) = tokio::join!(
            client.read_byte(addr(0x40), 0),
            c1.read_byte(addr(0x40), 1),
            c2.read_byte(addr(0x40), 2),
            c3.read_byte(addr(0x40), 3),
        );
        for result in [r0, r1, r2, r3] {
            result.unwrap();
        }
        assert!(!client.is_degraded());
    }

    #[tokio::test]
    async fn test_abandoned_queued_command_never_runs() {
        let mock = MockBus::new();
        mock.add_device(0x40);
        mock.set_stall(Duration::from_millis(100));
        let bus = Bus::new(mock.clone(), addr(0x08), BusOptions::default()).unwrap();
        mock.clear_log();
        let (client, _handle) = spawn(
            bus,
            CoordinatorOptions {
                timeout: Duration::from_secs(2),
                queue_timeout: Duration::from_millis(50),
                ..CoordinatorOptions::default()
            },
        )
        .unwrap();
        let other = client.clone();

        let (first, second) = tokio::join!(
            client.read_byte(addr(0x40), 0),
            other.write_byte(addr(0x40), 7, 0xAA),
        );
        first.unwrap();
        assert!(matches!(second, Err(Error::Timeout(_))));
        assert!(!client.is_degraded());

        mock.set_stall(Duration::ZERO);
        client.read_byte(addr(0x40), 1).await.unwrap();
        assert!(!mock
            .ops()
            .iter()
            .any(|op| matches!(op, MockOp::WriteByteData { .. })));
    }

    #[test]
    fn test_dropping_clients_stops_thread() {
        let mock = MockBus::new();
        let (client, handle) = start(&mock, Duration::from_secs(1));
        let second = client.clone();
        drop(client);
        drop(second);
        handle.join().unwrap();
    }

    #[tokio::test]
    async fn test_closed_coordinator() {
        let mock = MockBus::new();
        let (client, handle) = start(&mock, Duration::from_secs(1));
        let (tx, rx) = mpsc::channel(1);
        drop(rx);
        let orphan = BusClient { tx, ..client.clone() };
        drop(client);
        handle.join().unwrap();

        assert!(matches!(orphan.read_byte(addr(0x20), 0).await, Err(Error::CoordinatorClosed)));
    }
}
