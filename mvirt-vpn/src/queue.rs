//! Device-to-network protocol queues
//!
//! The reader hands classified packets to the network stack through two
//! insertion points, one for TCP and one for UDP. Insertion never blocks:
//! a full queue rejects the packet and its buffer goes back to the pool.

use std::sync::Arc;

use crossbeam_channel::{Receiver, Sender, TrySendError, bounded};
use tracing::trace;

use crate::packet::Packet;

/// Non-blocking insertion point of a protocol queue
pub trait PacketSink: Send + Sync {
    /// Try to enqueue `packet`. Returns whether it was accepted.
    ///
    /// A rejected packet is dropped, returning its buffer to the pool.
    fn offer(&self, packet: Packet) -> bool;
}

/// Bounded FIFO backed by a crossbeam channel
#[derive(Clone)]
pub struct ProtocolQueue {
    name: &'static str,
    tx: Sender<Packet>,
}

impl ProtocolQueue {
    /// Create a queue holding at most `capacity` packets.
    pub fn bounded(name: &'static str, capacity: usize) -> (Self, Receiver<Packet>) {
        let (tx, rx) = bounded(capacity);
        (Self { name, tx }, rx)
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.tx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tx.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.tx.is_full()
    }
}

impl PacketSink for ProtocolQueue {
    fn offer(&self, packet: Packet) -> bool {
        match self.tx.try_send(packet) {
            Ok(()) => true,
            Err(TrySendError::Full(packet)) => {
                trace!(queue = self.name, len = packet.len(), "Queue full, dropping packet");
                false
            }
            Err(TrySendError::Disconnected(_)) => {
                trace!(queue = self.name, "Queue consumer gone, dropping packet");
                false
            }
        }
    }
}

/// Queues the reader dispatches into
#[derive(Clone)]
pub struct VpnQueues {
    pub tcp_device_to_network: Arc<dyn PacketSink>,
    pub udp_device_to_network: Arc<dyn PacketSink>,
}

/// Consumer ends of the queues created by [`device_to_network_queues`]
pub struct QueueReceivers {
    pub tcp: Receiver<Packet>,
    pub udp: Receiver<Packet>,
}

/// Create the TCP and UDP device-to-network queues, each bounded to `capacity`.
pub fn device_to_network_queues(capacity: usize) -> (VpnQueues, QueueReceivers) {
    let (tcp, tcp_rx) = ProtocolQueue::bounded("tcp", capacity);
    let (udp, udp_rx) = ProtocolQueue::bounded("udp", capacity);

    (
        VpnQueues {
            tcp_device_to_network: Arc::new(tcp),
            udp_device_to_network: Arc::new(udp),
        },
        QueueReceivers {
            tcp: tcp_rx,
            udp: udp_rx,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::test_util::packets::create_udp_packet;

    fn udp_packet(pool: &Arc<BufferPool>) -> Packet {
        let frame = create_udp_packet([10, 0, 0, 2], [1, 1, 1, 1], b"q");
        let mut buf = pool.acquire().unwrap();
        buf.write_area()[..frame.len()].copy_from_slice(&frame);
        buf.set_len(frame.len());
        Packet::new(buf).unwrap()
    }

    #[test]
    fn test_offer_preserves_order() {
        let pool = Arc::new(BufferPool::new(256, 8));
        let (queue, rx) = ProtocolQueue::bounded("udp", 4);

        let first = udp_packet(&pool);
        let mut second = udp_packet(&pool).into_buffer();
        second.data_mut()[4] = 0xaa; // distinguish by IP identification
        let second = Packet::new(second).unwrap();

        assert!(queue.offer(first));
        assert!(queue.offer(second));
        assert_eq!(queue.len(), 2);

        assert_ne!(rx.recv().unwrap().data()[4], 0xaa);
        assert_eq!(rx.recv().unwrap().data()[4], 0xaa);
    }

    #[test]
    fn test_full_queue_rejects_and_releases() {
        let pool = Arc::new(BufferPool::new(256, 8));
        let (queue, _rx) = ProtocolQueue::bounded("udp", 1);

        assert!(queue.offer(udp_packet(&pool)));
        assert!(queue.is_full());
        assert!(!queue.offer(udp_packet(&pool)));

        // Only the queued packet still holds a buffer
        assert_eq!(pool.in_flight(), 1);
    }

    #[test]
    fn test_disconnected_queue_rejects() {
        let pool = Arc::new(BufferPool::new(256, 8));
        let (queue, rx) = ProtocolQueue::bounded("tcp", 4);
        drop(rx);

        assert!(!queue.offer(udp_packet(&pool)));
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_device_to_network_queues() {
        let pool = Arc::new(BufferPool::new(256, 8));
        let (queues, receivers) = device_to_network_queues(2);

        assert!(queues.udp_device_to_network.offer(udp_packet(&pool)));
        assert_eq!(receivers.udp.len(), 1);
        assert!(receivers.tcp.is_empty());
    }
}
