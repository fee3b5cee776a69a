//! TUN packet reader
//!
//! Reads packets that local applications send into the TUN device, sorts
//! them by transport protocol and hands them to the device-to-network
//! queues. Runs on its own thread:
//!
//! ```text
//! TUN fd ──read──> PoolBuffer ──classify──> TCP queue ─┐
//!                                     └───> UDP queue ─┴─> network stack
//! ```
//!
//! A bad frame never stops the reader. Only an interrupted read, a stop
//! request or a failing TUN descriptor end the loop; the descriptor is
//! closed when the loop exits.
//!
//! The reader polls the TUN descriptor together with a stop eventfd before
//! every read, so `ReaderHandle::stop` also ends a wait on an idle tunnel.

use std::any::Any;
use std::fmt;
use std::io::{self, Read};
use std::os::fd::AsFd;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::thread::{self, JoinHandle};

use nix::errno::Errno;
use nix::libc;
use nix::poll::{PollFd, PollFlags, PollTimeout, poll};
use nix::sys::eventfd::{EfdFlags, EventFd};
use thiserror::Error;
use tracing::{debug, error, info, trace, warn};

use crate::buffer::{BufferPool, PoolError};
use crate::config::ReaderConfig;
use crate::health::HealthMetrics;
use crate::packet::{Packet, PacketError, Protocol};
use crate::queue::VpnQueues;

/// Reader errors that end the loop or prevent it from starting.
#[derive(Debug, Error)]
pub enum ReaderError {
    #[error("TUN read failed: {0}")]
    Read(#[source] io::Error),

    #[error("Failed to spawn reader thread: {0}")]
    Spawn(#[source] io::Error),

    #[error("Failed to create stop eventfd: {0}")]
    Wake(#[source] io::Error),

    #[error("Reader thread panicked: {0}")]
    Panicked(String),
}

/// Failures confined to a single frame. The loop logs them and moves on.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error(transparent)]
    Packet(#[from] PacketError),
}

/// Lifecycle of a reader
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ReaderState {
    Created = 0,
    Running = 1,
    /// Terminal
    Stopped = 2,
}

impl ReaderState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ReaderState::Created,
            1 => ReaderState::Running,
            _ => ReaderState::Stopped,
        }
    }
}

impl fmt::Display for ReaderState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ReaderState::Created => write!(f, "created"),
            ReaderState::Running => write!(f, "running"),
            ReaderState::Stopped => write!(f, "stopped"),
        }
    }
}

/// Frames discarded before classification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    /// Read returned no bytes (or nothing was ready on a non-blocking fd)
    NoData,
    /// First byte zero: a TUN control message, not an IP packet
    ControlFrame,
}

/// Classified packets that were not queued
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Neither TCP nor UDP
    Unclassified(u8),
    /// The target queue rejected the packet
    QueueFull(Protocol),
}

/// Outcome of one read-classify-dispatch iteration
#[derive(Debug)]
pub enum Step {
    Dispatched(Protocol),
    Dropped(DropReason),
    Skipped(SkipReason),
    Failed(FrameError),
    /// The blocking read was interrupted or a stop woke the wait for a
    /// frame; the loop should stop.
    Interrupted,
    /// The TUN descriptor failed; the loop must stop.
    Fatal(io::Error),
}

/// State shared between the reader thread and its handle
struct Shared {
    running: AtomicBool,
    state: AtomicU8,
    /// Signalled on stop; stays readable once written
    wake: EventFd,
}

impl Shared {
    fn new() -> Result<Self, ReaderError> {
        let flags = EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_NONBLOCK;
        let wake =
            EventFd::from_value_and_flags(0, flags).map_err(|e| ReaderError::Wake(e.into()))?;

        Ok(Self {
            running: AtomicBool::new(false),
            state: AtomicU8::new(ReaderState::Created as u8),
            wake,
        })
    }

    fn wake(&self) {
        if let Err(e) = self.wake.write(1) {
            warn!(error = %e, "Failed to signal reader stop");
        }
    }

    fn state(&self) -> ReaderState {
        ReaderState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: ReaderState) {
        self.state.store(state as u8, Ordering::Release);
    }
}

/// Marks the reader stopped when the loop exits, including by panic.
struct StoppedGuard(Arc<Shared>);

impl Drop for StoppedGuard {
    fn drop(&mut self) {
        self.0.running.store(false, Ordering::Release);
        self.0.set_state(ReaderState::Stopped);
        warn!("TunPacketReader stopped");
    }
}

/// Reads packets from a TUN device and dispatches them by protocol
///
/// Owns the device for its whole life. `start` consumes the reader; a
/// stopped reader cannot be restarted.
pub struct TunPacketReader<R> {
    tun: R,
    pool: Arc<BufferPool>,
    queues: VpnQueues,
    health: Arc<dyn HealthMetrics>,
    shared: Arc<Shared>,
    thread_name: String,
    nice: Option<i32>,
}

impl<R: Read + AsFd + Send + 'static> TunPacketReader<R> {
    /// Create a reader with the default thread settings.
    pub fn new(
        tun: R,
        pool: Arc<BufferPool>,
        queues: VpnQueues,
        health: Arc<dyn HealthMetrics>,
    ) -> Result<Self, ReaderError> {
        Self::with_config(tun, pool, queues, health, &ReaderConfig::default())
    }

    /// Create a reader using the thread name and priority from `config`.
    pub fn with_config(
        tun: R,
        pool: Arc<BufferPool>,
        queues: VpnQueues,
        health: Arc<dyn HealthMetrics>,
        config: &ReaderConfig,
    ) -> Result<Self, ReaderError> {
        Ok(Self {
            tun,
            pool,
            queues,
            health,
            shared: Arc::new(Shared::new()?),
            thread_name: config.thread_name.clone(),
            nice: Some(config.nice),
        })
    }

    /// Skip the priority change on start.
    pub fn without_priority(mut self) -> Self {
        self.nice = None;
        self
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Spawn the reader thread.
    pub fn start(self) -> Result<ReaderHandle, ReaderError> {
        let shared = Arc::clone(&self.shared);
        let name = self.thread_name.clone();

        // Set before spawning so a stop() right after start() is not lost.
        shared.running.store(true, Ordering::Release);

        let thread = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run())
            .map_err(|e| {
                shared.running.store(false, Ordering::Release);
                shared.set_state(ReaderState::Stopped);
                ReaderError::Spawn(e)
            })?;

        Ok(ReaderHandle {
            thread: Some(thread),
            shared,
            name,
        })
    }

    fn run(self) -> Result<(), ReaderError> {
        let guard = StoppedGuard(Arc::clone(&self.shared));
        let mut reader = self;

        reader.shared.set_state(ReaderState::Running);
        if let Some(nice) = reader.nice {
            raise_thread_priority(nice);
        }
        warn!("TunPacketReader started");

        let result = reader.run_loop();

        // Closes the TUN descriptor before the state flips to Stopped
        drop(reader);
        drop(guard);
        result
    }

    fn run_loop(&mut self) -> Result<(), ReaderError> {
        while self.shared.running.load(Ordering::Acquire) {
            let step = match panic::catch_unwind(AssertUnwindSafe(|| self.step())) {
                Ok(step) => step,
                Err(payload) => {
                    let msg = panic_message(payload);
                    error!(panic = %msg, "Reader iteration panicked");
                    return Err(ReaderError::Panicked(msg));
                }
            };

            match step {
                Step::Dispatched(_) | Step::Dropped(_) | Step::Skipped(_) => {}
                Step::Failed(e) => {
                    warn!(error = %e, "Failed while reading from the TUN");
                }
                Step::Interrupted => {
                    info!("TUN read interrupted");
                    return Ok(());
                }
                Step::Fatal(e) => {
                    error!(error = %e, "Fatal error encountered");
                    return Err(ReaderError::Read(e));
                }
            }
        }

        debug!("Stop request observed");
        Ok(())
    }

    /// Read one frame from the TUN device and dispatch it.
    ///
    /// Blocks until a frame arrives or a stop is signalled. Every buffer
    /// acquired here is either handed to a queue or back in the pool when
    /// this returns.
    pub fn step(&mut self) -> Step {
        match self.wait_readable() {
            Ok(true) => {}
            Ok(false) => return Step::Interrupted,
            Err(e) => return Step::Fatal(e),
        }

        let mut buffer = match self.pool.acquire() {
            Ok(buffer) => buffer,
            Err(e) => return Step::Failed(e.into()),
        };

        let len = match self.tun.read(buffer.write_area()) {
            Ok(len) => len,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => return Step::Interrupted,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                trace!("Spurious TUN wakeup");
                return Step::Skipped(SkipReason::NoData);
            }
            Err(e) => return Step::Fatal(e),
        };

        if len == 0 {
            return Step::Skipped(SkipReason::NoData);
        }
        buffer.set_len(len);

        if buffer.data()[0] == 0 {
            trace!(len, "Control message; ignore this");
            return Step::Skipped(SkipReason::ControlFrame);
        }

        self.health.on_tun_packet_received();

        let packet = match Packet::new(buffer) {
            Ok(packet) => packet,
            Err(e) => return Step::Failed(e.into()),
        };

        let protocol = packet.protocol();
        let queue = match protocol {
            Protocol::Udp => &self.queues.udp_device_to_network,
            Protocol::Tcp => &self.queues.tcp_device_to_network,
            Protocol::Other(number) => {
                trace!(protocol = number, "Not TCP or UDP, dropping");
                return Step::Dropped(DropReason::Unclassified(number));
            }
        };

        if queue.offer(packet) {
            self.health.on_written_to_device_to_network_queue();
            Step::Dispatched(protocol)
        } else {
            debug!(%protocol, "Device-to-network queue full, dropping packet");
            Step::Dropped(DropReason::QueueFull(protocol))
        }
    }

    /// Wait until the TUN has a frame (true) or a stop was signalled (false).
    fn wait_readable(&self) -> io::Result<bool> {
        loop {
            let mut fds = [
                PollFd::new(self.tun.as_fd(), PollFlags::POLLIN),
                PollFd::new(self.shared.wake.as_fd(), PollFlags::POLLIN),
            ];
            match poll(&mut fds, PollTimeout::NONE) {
                Ok(_) => {}
                // poll is never restarted after a signal handler runs
                Err(Errno::EINTR) => continue,
                Err(e) => return Err(e.into()),
            }

            if is_ready(&fds[1]) {
                return Ok(false);
            }
            // POLLERR/POLLHUP count too: the read reports them
            if is_ready(&fds[0]) {
                return Ok(true);
            }
        }
    }
}

/// Control surface of a started reader
pub struct ReaderHandle {
    thread: Option<JoinHandle<Result<(), ReaderError>>>,
    shared: Arc<Shared>,
    name: String,
}

impl ReaderHandle {
    /// Ask the reader to stop.
    ///
    /// Takes effect at the next iteration boundary, or right away when the
    /// reader is waiting on an idle tunnel. A frame already being processed
    /// is dispatched first.
    pub fn stop(&self) {
        if self.shared.running.swap(false, Ordering::AcqRel) {
            info!(thread = %self.name, "TunPacketReader stop requested");
        }
        self.shared.wake();
    }

    pub fn state(&self) -> ReaderState {
        self.shared.state()
    }

    /// Check if the reader thread is still running
    pub fn is_running(&self) -> bool {
        self.thread.as_ref().is_some_and(|h| !h.is_finished())
            && self.state() != ReaderState::Stopped
    }

    pub fn thread_name(&self) -> &str {
        &self.name
    }

    /// Wait for the reader thread to exit.
    ///
    /// Returns the error that ended the loop, if any. Does not stop the
    /// reader by itself.
    pub fn join(mut self) -> Result<(), ReaderError> {
        match self.thread.take() {
            Some(handle) => handle
                .join()
                .map_err(|payload| ReaderError::Panicked(panic_message(payload)))?,
            None => Ok(()),
        }
    }
}

impl Drop for ReaderHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

fn is_ready(fd: &PollFd<'_>) -> bool {
    fd.revents().is_some_and(|r| !r.is_empty())
}

/// Best-effort nice value for the calling thread.
fn raise_thread_priority(nice: i32) {
    // With who = 0, PRIO_PROCESS targets the calling thread on Linux.
    let ret = unsafe { libc::setpriority(libc::PRIO_PROCESS, 0, nice) };
    if ret < 0 {
        warn!(
            nice,
            error = %io::Error::last_os_error(),
            "Failed to raise reader thread priority"
        );
    } else {
        debug!(nice, "Reader thread priority set");
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
