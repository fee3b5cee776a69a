//! mvirt-vpn - TUN packet ingestion for the user-space VPN data path.
//!
//! Opens a TUN device, runs the packet reader on a dedicated thread and
//! drains the TCP/UDP device-to-network queues until SIGINT/SIGTERM.

use anyhow::{Context, Result};
use clap::Parser;
use crossbeam_channel::Receiver;
use mvirt_vpn::{
    BufferPool, HealthCounters, Packet, ReaderConfig, ReaderHandle, TunDevice, TunPacketReader,
    device_to_network_queues,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::signal::unix::{SignalKind, signal};
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

/// Default TUN device name.
const TUN_NAME: &str = "mvirt-vpn0";

/// How often the main loop checks that the reader thread is alive.
const READER_CHECK_INTERVAL: Duration = Duration::from_millis(100);

#[derive(Parser)]
#[command(name = "mvirt-vpn")]
#[command(version)]
#[command(about = "Read packets from a TUN device and dispatch them by protocol")]
struct Args {
    /// TUN device to open (created if missing)
    #[arg(long, default_value = TUN_NAME)]
    tun: String,

    /// Set the interface up after opening it
    #[arg(long)]
    bring_up: bool,

    /// JSON reader configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Frame buffer size in bytes
    #[arg(long)]
    buffer_size: Option<usize>,

    /// Maximum number of frame buffers
    #[arg(long)]
    max_buffers: Option<usize>,

    /// Capacity of each protocol queue
    #[arg(long)]
    queue_capacity: Option<usize>,

    /// Seconds between health counter reports
    #[arg(long, default_value_t = 30)]
    stats_interval: u64,
}

impl Args {
    fn reader_config(&self) -> Result<ReaderConfig> {
        let mut config = match &self.config {
            Some(path) => ReaderConfig::from_file(path)
                .with_context(|| format!("loading {}", path.display()))?,
            None => ReaderConfig::default(),
        };

        if let Some(size) = self.buffer_size {
            config.buffer_size = size;
        }
        if let Some(max) = self.max_buffers {
            config.max_buffers = max;
        }
        if let Some(capacity) = self.queue_capacity {
            config.queue_capacity = capacity;
        }

        config.validate()?;
        Ok(config)
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let config = args.reader_config()?;

    let tun = match TunDevice::open(&args.tun) {
        Ok(tun) => tun,
        Err(e) => {
            error!(error = %e, name = %args.tun, "Failed to open TUN device");
            error!("Do you have root privileges? Try running with 'sudo'.");
            std::process::exit(1);
        }
    };
    if args.bring_up {
        tun.bring_up().context("bringing TUN device up")?;
    }

    let pool = Arc::new(BufferPool::new(config.buffer_size, config.max_buffers));
    let health = Arc::new(HealthCounters::new());
    let (queues, receivers) = device_to_network_queues(config.queue_capacity);

    let drains = [
        ("tcp", spawn_drain("tcp", receivers.tcp)?),
        ("udp", spawn_drain("udp", receivers.udp)?),
    ];

    let reader =
        TunPacketReader::with_config(tun, Arc::clone(&pool), queues, health.clone(), &config)?;
    let handle = reader.start()?;

    info!(tun = %args.tun, ?config, "TUN ingestion running");

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut stats = tokio::time::interval(Duration::from_secs(args.stats_interval.max(1)));
    let mut liveness = tokio::time::interval(READER_CHECK_INTERVAL);

    loop {
        tokio::select! {
            _ = sigint.recv() => {
                info!("Received SIGINT, shutting down...");
                break;
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
                break;
            }
            _ = stats.tick() => {
                let snapshot = health.snapshot();
                info!(
                    received = snapshot.tun_packets_received,
                    queued = snapshot.device_to_network_queued,
                    buffers_in_flight = pool.in_flight(),
                    "TUN health"
                );
            }
            _ = liveness.tick() => {
                if !handle.is_running() {
                    error!("TUN reader exited");
                    break;
                }
            }
        }
    }

    let result = shut_down(handle, drains);

    let snapshot = health.snapshot();
    info!(
        received = snapshot.tun_packets_received,
        queued = snapshot.device_to_network_queued,
        "Stopped"
    );

    // A failed reader exits non-zero
    result
}

/// Stop the reader and wait for it and the drain threads.
///
/// Returns the error that ended the reader, if any.
fn shut_down(handle: ReaderHandle, drains: [(&'static str, JoinHandle<()>); 2]) -> Result<()> {
    // Also wakes a reader waiting on an idle TUN, so the join is prompt
    handle.stop();
    let result = handle.join();
    if let Err(e) = &result {
        error!(error = %e, "TUN reader failed");
    }

    for (name, drain) in drains {
        if drain.join().is_err() {
            error!(queue = name, "Drain thread panicked");
        }
    }

    result.context("TUN reader failed")
}

/// Consume one protocol queue, standing in for the network stack.
fn spawn_drain(name: &'static str, rx: Receiver<Packet>) -> Result<JoinHandle<()>> {
    let handle = thread::Builder::new()
        .name(format!("{name}-drain"))
        .spawn(move || {
            // Ends once the reader drops its queue senders
            for packet in rx {
                debug!(
                    queue = name,
                    src = %packet.source(),
                    dst = %packet.destination(),
                    len = packet.len(),
                    "Packet dequeued"
                );
            }
        })
        .with_context(|| format!("spawning {name} drain thread"))?;
    Ok(handle)
}
