//! Channel-fed fake TUN device
//!
//! `ScriptedTunnel` blocks in `read` until the test pushes the next frame
//! through its `TunnelScript`, like a real TUN fd waiting for traffic. A
//! semaphore eventfd counts scripted reads, so the tunnel polls readable
//! exactly while one is pending.

use std::io::{self, Read};
use std::os::fd::{AsFd, BorrowedFd};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender, unbounded};
use nix::sys::eventfd::{EfdFlags, EventFd};

type ScriptedRead = io::Result<Vec<u8>>;

/// Create a connected tunnel / script pair.
pub fn scripted_tunnel() -> (ScriptedTunnel, TunnelScript) {
    let (tx, rx) = unbounded();
    let ready = EventFd::from_value_and_flags(0, EfdFlags::EFD_CLOEXEC | EfdFlags::EFD_SEMAPHORE)
        .expect("Failed to create eventfd");
    let ready = Arc::new(ready);
    let reads = Arc::new(AtomicUsize::new(0));
    let closed = Arc::new(AtomicUsize::new(0));

    (
        ScriptedTunnel {
            rx,
            ready: Arc::clone(&ready),
            reads: Arc::clone(&reads),
            closed: Arc::clone(&closed),
        },
        TunnelScript {
            tx,
            ready,
            reads,
            closed,
        },
    )
}

/// Read side, handed to the reader under test
pub struct ScriptedTunnel {
    rx: Receiver<ScriptedRead>,
    ready: Arc<EventFd>,
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl Read for ScriptedTunnel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        // Blocks until the script pushes; takes one count
        self.ready.read()?;
        match self.rx.recv() {
            Ok(Ok(frame)) => {
                let n = frame.len().min(buf.len());
                buf[..n].copy_from_slice(&frame[..n]);
                Ok(n)
            }
            Ok(Err(e)) => Err(e),
            // Script dropped: behave like a read interrupted for shutdown
            Err(_) => Err(io::Error::new(
                io::ErrorKind::Interrupted,
                "tunnel script closed",
            )),
        }
    }
}

impl AsFd for ScriptedTunnel {
    fn as_fd(&self) -> BorrowedFd<'_> {
        self.ready.as_fd()
    }
}

impl Drop for ScriptedTunnel {
    fn drop(&mut self) {
        self.closed.fetch_add(1, Ordering::SeqCst);
    }
}

/// Test side: feeds reads and observes the tunnel
pub struct TunnelScript {
    tx: Sender<ScriptedRead>,
    ready: Arc<EventFd>,
    reads: Arc<AtomicUsize>,
    closed: Arc<AtomicUsize>,
}

impl TunnelScript {
    fn push(&self, read: ScriptedRead) {
        if self.tx.send(read).is_ok() {
            let _ = self.ready.write(1);
        }
    }

    /// Deliver one frame to the next read.
    pub fn frame(&self, frame: &[u8]) {
        self.push(Ok(frame.to_vec()));
    }

    /// Make the next read return zero bytes.
    pub fn zero_read(&self) {
        self.push(Ok(Vec::new()));
    }

    /// Make the next read fail with `kind`.
    pub fn error(&self, kind: io::ErrorKind) {
        self.push(Err(io::Error::new(kind, "scripted failure")));
    }

    /// Make the next read report an interruption.
    pub fn interrupt(&self) {
        self.error(io::ErrorKind::Interrupted);
    }

    /// Number of read calls started so far
    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }

    /// Number of times the tunnel was closed (dropped)
    pub fn close_count(&self) -> usize {
        self.closed.load(Ordering::SeqCst)
    }

    /// Reads delivered but not yet consumed
    pub fn pending(&self) -> usize {
        self.tx.len()
    }

    /// Poll until at least `n` reads have started. Returns false on timeout.
    pub fn wait_for_reads(&self, n: usize, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while self.reads() < n {
            if Instant::now() >= deadline {
                return false;
            }
            std::thread::sleep(Duration::from_millis(1));
        }
        true
    }
}

impl Drop for TunnelScript {
    fn drop(&mut self) {
        // Lets a pending read observe the closed script
        let _ = self.ready.write(1);
    }
}
