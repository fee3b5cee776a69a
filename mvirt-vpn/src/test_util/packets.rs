//! IP packet builders for tests
//!
//! Frames look exactly like what a TUN device opened with IFF_NO_PI hands
//! out: a bare IP header followed by the transport payload.

use smoltcp::phy::ChecksumCapabilities;
use smoltcp::wire::{
    IpProtocol, Ipv4Address, Ipv4Packet, Ipv4Repr, Ipv6Address, Ipv6Packet, Ipv6Repr, UdpPacket,
    UdpRepr,
};

/// IPv4 header size (without options)
pub const IP_HDR_SIZE: usize = 20;

/// IPv6 fixed header size
pub const IPV6_HDR_SIZE: usize = 40;

/// UDP header size
pub const UDP_HDR_SIZE: usize = 8;

/// TCP header size (without options)
pub const TCP_HDR_SIZE: usize = 20;

/// Source port used by the builders
pub const CLIENT_PORT: u16 = 49152;

/// Create an IPv4 packet carrying `payload` as protocol `protocol`.
pub fn create_ipv4_packet(
    src_ip: [u8; 4],
    dst_ip: [u8; 4],
    protocol: IpProtocol,
    payload: &[u8],
) -> Vec<u8> {
    let mut packet = vec![0u8; IP_HDR_SIZE + payload.len()];

    let ip_repr = Ipv4Repr {
        src_addr: ipv4(src_ip),
        dst_addr: ipv4(dst_ip),
        next_header: protocol,
        payload_len: payload.len(),
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut packet[..]);
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());
    ip_packet.payload_mut().copy_from_slice(payload);

    packet
}

/// Create an IPv4/UDP datagram to port 53 of `dst_ip`.
pub fn create_udp_packet(src_ip: [u8; 4], dst_ip: [u8; 4], data: &[u8]) -> Vec<u8> {
    let udp_len = UDP_HDR_SIZE + data.len();
    let mut packet = vec![0u8; IP_HDR_SIZE + udp_len];

    let ip_repr = Ipv4Repr {
        src_addr: ipv4(src_ip),
        dst_addr: ipv4(dst_ip),
        next_header: IpProtocol::Udp,
        payload_len: udp_len,
        hop_limit: 64,
    };
    let mut ip_packet = Ipv4Packet::new_unchecked(&mut packet[..]);
    ip_repr.emit(&mut ip_packet, &ChecksumCapabilities::default());

    let udp_repr = UdpRepr {
        src_port: CLIENT_PORT,
        dst_port: 53,
    };
    let mut udp_packet = UdpPacket::new_unchecked(ip_packet.payload_mut());
    udp_repr.emit(
        &mut udp_packet,
        &ip_repr.src_addr.into(),
        &ip_repr.dst_addr.into(),
        data.len(),
        |buf| buf.copy_from_slice(data),
        &ChecksumCapabilities::default(),
    );

    packet
}

/// Create an IPv4/TCP segment (PSH|ACK) to port 443 of `dst_ip`.
///
/// The TCP checksum is left zero; nothing on the ingestion path checks it.
pub fn create_tcp_packet(src_ip: [u8; 4], dst_ip: [u8; 4], data: &[u8]) -> Vec<u8> {
    let mut segment = vec![0u8; TCP_HDR_SIZE + data.len()];
    segment[0..2].copy_from_slice(&CLIENT_PORT.to_be_bytes());
    segment[2..4].copy_from_slice(&443u16.to_be_bytes());
    segment[4..8].copy_from_slice(&1u32.to_be_bytes()); // seq
    segment[8..12].copy_from_slice(&1u32.to_be_bytes()); // ack
    segment[12] = ((TCP_HDR_SIZE / 4) as u8) << 4;
    segment[13] = 0x18; // PSH | ACK
    segment[14..16].copy_from_slice(&65535u16.to_be_bytes());
    segment[TCP_HDR_SIZE..].copy_from_slice(data);

    create_ipv4_packet(src_ip, dst_ip, IpProtocol::Tcp, &segment)
}

/// Create an IPv6 packet between two ULA addresses.
pub fn create_ipv6_packet(next_header: IpProtocol, payload: &[u8]) -> Vec<u8> {
    let mut packet = vec![0u8; IPV6_HDR_SIZE + payload.len()];

    let ip_repr = Ipv6Repr {
        src_addr: Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 2),
        dst_addr: Ipv6Address::new(0xfd00, 0, 0, 0, 0, 0, 0, 1),
        next_header,
        payload_len: payload.len(),
        hop_limit: 64,
    };
    let mut ip_packet = Ipv6Packet::new_unchecked(&mut packet[..]);
    ip_repr.emit(&mut ip_packet);
    ip_packet.payload_mut().copy_from_slice(payload);

    packet
}

/// A non-data frame as emitted by some TUN implementations (first byte zero).
pub fn create_control_frame(len: usize) -> Vec<u8> {
    let mut frame = vec![0xffu8; len.max(1)];
    frame[0] = 0;
    frame
}

fn ipv4(octets: [u8; 4]) -> Ipv4Address {
    Ipv4Address::new(octets[0], octets[1], octets[2], octets[3])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_udp_packet_layout() {
        let packet = create_udp_packet([10, 0, 0, 2], [1, 1, 1, 1], b"abc");
        assert_eq!(packet.len(), IP_HDR_SIZE + UDP_HDR_SIZE + 3);
        assert_eq!(packet[0] >> 4, 4);
        assert_eq!(packet[9], 17);
        assert_eq!(&packet[packet.len() - 3..], b"abc");
    }

    #[test]
    fn test_tcp_packet_layout() {
        let packet = create_tcp_packet([10, 0, 0, 2], [1, 1, 1, 1], b"abc");
        assert_eq!(packet[9], 6);
        assert_eq!(packet[IP_HDR_SIZE + 12] >> 4, 5);
    }

    #[test]
    fn test_control_frame() {
        let frame = create_control_frame(4);
        assert_eq!(frame, vec![0, 0xff, 0xff, 0xff]);
        assert_eq!(create_control_frame(0), vec![0]);
    }
}
