//! Parsed IP packets read from the TUN device
//!
//! Only the IP header is inspected: enough to route a frame to the TCP or
//! UDP side of the network stack. Transport headers are left to consumers.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use smoltcp::wire::{IpProtocol, Ipv4Packet, Ipv6Packet};
use thiserror::Error;

use crate::buffer::PoolBuffer;

/// Packet parsing errors.
#[derive(Debug, Error)]
pub enum PacketError {
    #[error("Empty frame")]
    Empty,

    #[error("Unsupported IP version: {0}")]
    UnsupportedVersion(u8),

    #[error("Malformed IPv{version} header: {source}")]
    Malformed {
        version: u8,
        #[source]
        source: smoltcp::wire::Error,
    },
}

/// IP version of a parsed packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpVersion {
    V4,
    V6,
}

/// Transport protocol carried by a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protocol {
    Tcp,
    Udp,
    /// Anything else (ICMP, IPv6 extension headers, ...), by protocol number
    Other(u8),
}

impl Protocol {
    fn from_ip(protocol: IpProtocol) -> Self {
        match protocol {
            IpProtocol::Tcp => Protocol::Tcp,
            IpProtocol::Udp => Protocol::Udp,
            other => Protocol::Other(other.into()),
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Protocol::Tcp => write!(f, "TCP"),
            Protocol::Udp => write!(f, "UDP"),
            Protocol::Other(n) => write!(f, "proto({n})"),
        }
    }
}

/// Header fields derived from a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    pub version: IpVersion,
    pub protocol: Protocol,
    pub source: IpAddr,
    pub destination: IpAddr,
}

impl PacketInfo {
    /// Inspect the IP header at the start of `data`.
    pub fn parse(data: &[u8]) -> Result<Self, PacketError> {
        let first = *data.first().ok_or(PacketError::Empty)?;

        match first >> 4 {
            4 => {
                let packet = Ipv4Packet::new_checked(data)
                    .map_err(|source| PacketError::Malformed { version: 4, source })?;
                Ok(Self {
                    version: IpVersion::V4,
                    protocol: Protocol::from_ip(packet.next_header()),
                    source: IpAddr::V4(ipv4_at(data, 12)),
                    destination: IpAddr::V4(ipv4_at(data, 16)),
                })
            }
            6 => {
                let packet = Ipv6Packet::new_checked(data)
                    .map_err(|source| PacketError::Malformed { version: 6, source })?;
                Ok(Self {
                    version: IpVersion::V6,
                    protocol: Protocol::from_ip(packet.next_header()),
                    source: IpAddr::V6(ipv6_at(data, 8)),
                    destination: IpAddr::V6(ipv6_at(data, 24)),
                })
            }
            version => Err(PacketError::UnsupportedVersion(version)),
        }
    }
}

// Callers have already length-checked the header.
fn ipv4_at(data: &[u8], offset: usize) -> Ipv4Addr {
    let mut octets = [0u8; 4];
    octets.copy_from_slice(&data[offset..offset + 4]);
    Ipv4Addr::from(octets)
}

fn ipv6_at(data: &[u8], offset: usize) -> Ipv6Addr {
    let mut octets = [0u8; 16];
    octets.copy_from_slice(&data[offset..offset + 16]);
    Ipv6Addr::from(octets)
}

/// An IP packet backed by a pool buffer
///
/// Owns the buffer: whoever holds the packet holds the buffer, and dropping
/// the packet returns the buffer to its pool.
pub struct Packet {
    buffer: PoolBuffer,
    info: PacketInfo,
}

impl Packet {
    /// Parse the valid data of `buffer`.
    ///
    /// On error the buffer is dropped and goes back to its pool.
    pub fn new(buffer: PoolBuffer) -> Result<Self, PacketError> {
        let info = PacketInfo::parse(buffer.data())?;
        Ok(Self { buffer, info })
    }

    /// Raw packet bytes, starting at the IP header
    #[inline]
    pub fn data(&self) -> &[u8] {
        self.buffer.data()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    #[inline]
    pub fn info(&self) -> &PacketInfo {
        &self.info
    }

    #[inline]
    pub fn version(&self) -> IpVersion {
        self.info.version
    }

    #[inline]
    pub fn protocol(&self) -> Protocol {
        self.info.protocol
    }

    #[inline]
    pub fn is_tcp(&self) -> bool {
        self.info.protocol == Protocol::Tcp
    }

    #[inline]
    pub fn is_udp(&self) -> bool {
        self.info.protocol == Protocol::Udp
    }

    pub fn source(&self) -> IpAddr {
        self.info.source
    }

    pub fn destination(&self) -> IpAddr {
        self.info.destination
    }

    /// Give up the parsed view and take back the buffer.
    pub fn into_buffer(self) -> PoolBuffer {
        self.buffer
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("protocol", &self.info.protocol)
            .field("source", &self.info.source)
            .field("destination", &self.info.destination)
            .field("len", &self.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::BufferPool;
    use crate::test_util::packets::{
        create_ipv4_packet, create_ipv6_packet, create_tcp_packet, create_udp_packet,
    };
    use smoltcp::wire::IpProtocol;
    use std::sync::Arc;

    fn packet_from(pool: &Arc<BufferPool>, frame: &[u8]) -> Result<Packet, PacketError> {
        let mut buf = pool.acquire().unwrap();
        buf.write_area()[..frame.len()].copy_from_slice(frame);
        buf.set_len(frame.len());
        Packet::new(buf)
    }

    #[test]
    fn test_classify_udp() {
        let pool = Arc::new(BufferPool::new(2048, 4));
        let frame = create_udp_packet([10, 0, 0, 2], [1, 1, 1, 1], b"query");
        let packet = packet_from(&pool, &frame).unwrap();

        assert!(packet.is_udp());
        assert!(!packet.is_tcp());
        assert_eq!(packet.version(), IpVersion::V4);
        assert_eq!(packet.source(), IpAddr::V4(Ipv4Addr::new(10, 0, 0, 2)));
        assert_eq!(packet.destination(), IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1)));
        assert_eq!(packet.data(), &frame[..]);
    }

    #[test]
    fn test_classify_tcp() {
        let pool = Arc::new(BufferPool::new(2048, 4));
        let frame = create_tcp_packet([10, 0, 0, 2], [93, 184, 216, 34], b"GET /");
        let packet = packet_from(&pool, &frame).unwrap();

        assert!(packet.is_tcp());
        assert_eq!(packet.protocol(), Protocol::Tcp);
    }

    #[test]
    fn test_classify_other() {
        let pool = Arc::new(BufferPool::new(2048, 4));
        let frame = create_ipv4_packet([10, 0, 0, 2], [8, 8, 8, 8], IpProtocol::Icmp, &[0; 8]);
        let packet = packet_from(&pool, &frame).unwrap();

        assert_eq!(packet.protocol(), Protocol::Other(1));
        assert!(!packet.is_tcp() && !packet.is_udp());
    }

    #[test]
    fn test_classify_ipv6_udp() {
        let pool = Arc::new(BufferPool::new(2048, 4));
        let frame = create_ipv6_packet(IpProtocol::Udp, &[0; 16]);
        let packet = packet_from(&pool, &frame).unwrap();

        assert_eq!(packet.version(), IpVersion::V6);
        assert!(packet.is_udp());
        assert!(packet.source().is_ipv6());
    }

    #[test]
    fn test_truncated_header_is_malformed() {
        let pool = Arc::new(BufferPool::new(2048, 4));
        let frame = create_udp_packet([10, 0, 0, 2], [1, 1, 1, 1], b"query");
        let err = packet_from(&pool, &frame[..12]).unwrap_err();

        assert!(matches!(err, PacketError::Malformed { version: 4, .. }));
        // Buffer went back to the pool with the failed parse
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_unsupported_version() {
        let err = PacketInfo::parse(&[0x55, 0, 0, 0]).unwrap_err();
        assert!(matches!(err, PacketError::UnsupportedVersion(5)));
    }

    #[test]
    fn test_empty_frame() {
        assert!(matches!(PacketInfo::parse(&[]), Err(PacketError::Empty)));
    }

    #[test]
    fn test_into_buffer_keeps_bytes() {
        let pool = Arc::new(BufferPool::new(2048, 4));
        let frame = create_udp_packet([10, 0, 0, 2], [1, 1, 1, 1], b"x");
        let packet = packet_from(&pool, &frame).unwrap();

        let buf = packet.into_buffer();
        assert_eq!(buf.data(), &frame[..]);
        assert_eq!(pool.in_flight(), 1);
    }
}
