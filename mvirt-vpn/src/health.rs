//! Health counters for the TUN ingestion path
//!
//! Counters only ever increase. A stalled tunnel shows up as counters that
//! stop moving; observers poll [`HealthCounters::snapshot`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Sink for ingestion health events. Must never block.
pub trait HealthMetrics: Send + Sync {
    /// A data frame was read from the TUN device.
    fn on_tun_packet_received(&self);

    /// A packet was accepted by a device-to-network queue.
    fn on_written_to_device_to_network_queue(&self);
}

/// Process-wide atomic counters
#[derive(Debug, Default)]
pub struct HealthCounters {
    tun_packets_received: AtomicU64,
    device_to_network_queued: AtomicU64,
}

/// Point-in-time copy of [`HealthCounters`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HealthSnapshot {
    pub tun_packets_received: u64,
    pub device_to_network_queued: u64,
}

impl HealthCounters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> HealthSnapshot {
        HealthSnapshot {
            tun_packets_received: self.tun_packets_received.load(Ordering::Relaxed),
            device_to_network_queued: self.device_to_network_queued.load(Ordering::Relaxed),
        }
    }
}

impl HealthMetrics for HealthCounters {
    #[inline]
    fn on_tun_packet_received(&self) {
        self.tun_packets_received.fetch_add(1, Ordering::Relaxed);
    }

    #[inline]
    fn on_written_to_device_to_network_queue(&self) {
        self.device_to_network_queued.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_counters_start_at_zero() {
        assert_eq!(HealthCounters::new().snapshot(), HealthSnapshot::default());
    }

    #[test]
    fn test_counters_increment_independently() {
        let counters = HealthCounters::new();
        counters.on_tun_packet_received();
        counters.on_tun_packet_received();
        counters.on_written_to_device_to_network_queue();

        let snapshot = counters.snapshot();
        assert_eq!(snapshot.tun_packets_received, 2);
        assert_eq!(snapshot.device_to_network_queued, 1);
    }

    #[test]
    fn test_counters_shared_across_threads() {
        let counters = Arc::new(HealthCounters::new());
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let counters = Arc::clone(&counters);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        counters.on_tun_packet_received();
                    }
                })
            })
            .collect();
        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(counters.snapshot().tun_packets_received, 4000);
    }
}
