//! i2cmux polling daemon.
//!
//! Opens one I2C bus, scans it once, then polls every configured device
//! until SIGINT or SIGTERM.

use anyhow::{Context, Result};
use clap::{App, Arg};
use std::time::Duration;
use tokio::signal::unix::{self, SignalKind};
use tokio::time;
use tokio_util::{sync::CancellationToken, task::TaskTracker};

use i2cmux::bus::Bus;
use i2cmux::config::Config;
use i2cmux::coordinator::{self, CoordinatorOptions};
use i2cmux::poller;
use i2cmux::tracing::{self, prelude::*};

#[tokio::main]
async fn main() -> Result<()> {
    tracing::init_journald_or_stdout();

    let matches = App::new("i2cmuxd")
        .version(env!("CARGO_PKG_VERSION"))
        .about("Poll devices on a shared I2C bus")
        .arg(
            Arg::with_name("config")
                .short("c")
                .long("config")
                .value_name("FILE")
                .help("Configuration file (JSON)")
                .takes_value(true),
        )
        .get_matches();

    let config = match matches.value_of("config") {
        Some(path) => Config::load_from(path),
        None => Config::load(),
    }
    .context("loading configuration")?;

    let bus = Bus::open(
        &config.bus.path,
        config.initial_address(),
        config.bus.kernel_recover_request,
        config.bus.options(),
    )
    .with_context(|| format!("opening {}", config.bus.path.display()))?;

    let (client, bus_thread) = coordinator::spawn(
        bus,
        CoordinatorOptions {
            timeout: config.bus.transaction_timeout(),
            queue_timeout: config.bus.queue_timeout(),
            background_priority: config.bus.background_priority,
        },
    )?;

    match client.scan_range().await {
        Ok(found) => {
            let listed: Vec<String> = found.iter().map(ToString::to_string).collect();
            info!(devices = ?listed, "Initial scan");
        }
        Err(e) => warn!(error = %e, "Initial scan failed"),
    }

    if config.devices.is_empty() {
        warn!("No devices configured; idling.");
    }

    let running = CancellationToken::new();
    let tracker = TaskTracker::new();
    for device in config.devices {
        tracker.spawn(poller::task(client.clone(), device, running.clone()));
    }
    tracker.close();
    // Pollers hold the remaining clients; the bus thread exits after them.
    drop(client);
    info!("Started.");

    let mut sigint = unix::signal(SignalKind::interrupt())?;
    let mut sigterm = unix::signal(SignalKind::terminate())?;
    tokio::select! {
        _ = sigint.recv() => {},
        _ = sigterm.recv() => {},
    }

    trace!("Shutting down.");
    running.cancel();
    tracker.wait().await;

    // A transaction hung in the kernel keeps the bus thread alive; don't
    // wait on it forever.
    let deadline = time::Instant::now() + Duration::from_secs(2);
    while !bus_thread.is_finished() && time::Instant::now() < deadline {
        time::sleep(Duration::from_millis(10)).await;
    }
    if bus_thread.is_finished() {
        let _ = bus_thread.join();
    } else {
        warn!("Bus thread still busy at exit");
    }
    info!("Exiting.");
    Ok(())
}
