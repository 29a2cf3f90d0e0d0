//! IP packet synthesis for frames written back to the interface

use std::net::{IpAddr, SocketAddr};

use crate::common::Result;
use crate::error::Error;

use super::checksum::{ipv4_header_checksum, transport_checksum};
use super::{PROTO_TCP, PROTO_UDP};

const DEFAULT_TTL: u8 = 64;

/// TCP header fields of a synthesized segment
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpFields {
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    /// Emitted as an MSS option when set
    pub mss: Option<u16>,
}

/// Build an IPv4 or IPv6 TCP frame from `src` to `dst`.
pub fn build_tcp(
    src: SocketAddr,
    dst: SocketAddr,
    fields: &TcpFields,
    payload: &[u8],
) -> Result<Vec<u8>> {
    let options_len = if fields.mss.is_some() { 4 } else { 0 };
    let header_len = 20 + options_len;

    let mut segment = vec![0u8; header_len + payload.len()];
    segment[0..2].copy_from_slice(&src.port().to_be_bytes());
    segment[2..4].copy_from_slice(&dst.port().to_be_bytes());
    segment[4..8].copy_from_slice(&fields.seq.to_be_bytes());
    segment[8..12].copy_from_slice(&fields.ack.to_be_bytes());
    segment[12] = ((header_len / 4) as u8) << 4;
    segment[13] = fields.flags;
    segment[14..16].copy_from_slice(&fields.window.to_be_bytes());
    if let Some(mss) = fields.mss {
        segment[20] = 2;
        segment[21] = 4;
        segment[22..24].copy_from_slice(&mss.to_be_bytes());
    }
    segment[header_len..].copy_from_slice(payload);

    let csum = transport_checksum(src.ip(), dst.ip(), PROTO_TCP, &segment);
    segment[16..18].copy_from_slice(&csum.to_be_bytes());

    wrap_ip(src.ip(), dst.ip(), PROTO_TCP, &segment)
}

/// Build an IPv4 or IPv6 UDP frame from `src` to `dst`.
pub fn build_udp(src: SocketAddr, dst: SocketAddr, payload: &[u8]) -> Result<Vec<u8>> {
    let len = 8 + payload.len();
    if len > u16::MAX as usize {
        return Err(Error::MalformedPacket("UDP payload too large"));
    }

    let mut segment = vec![0u8; len];
    segment[0..2].copy_from_slice(&src.port().to_be_bytes());
    segment[2..4].copy_from_slice(&dst.port().to_be_bytes());
    segment[4..6].copy_from_slice(&(len as u16).to_be_bytes());
    segment[8..].copy_from_slice(payload);

    let csum = match transport_checksum(src.ip(), dst.ip(), PROTO_UDP, &segment) {
        // zero means "no checksum" in UDP
        0 => 0xFFFF,
        c => c,
    };
    segment[6..8].copy_from_slice(&csum.to_be_bytes());

    wrap_ip(src.ip(), dst.ip(), PROTO_UDP, &segment)
}

fn wrap_ip(src: IpAddr, dst: IpAddr, protocol: u8, segment: &[u8]) -> Result<Vec<u8>> {
    match (src, dst) {
        (IpAddr::V4(s), IpAddr::V4(d)) => {
            let total_len = 20 + segment.len();
            if total_len > u16::MAX as usize {
                return Err(Error::MalformedPacket("IPv4 packet too large"));
            }

            let mut packet = vec![0u8; total_len];
            packet[0] = 0x45;
            packet[2..4].copy_from_slice(&(total_len as u16).to_be_bytes());
            // don't fragment
            packet[6] = 0x40;
            packet[8] = DEFAULT_TTL;
            packet[9] = protocol;
            packet[12..16].copy_from_slice(&s.octets());
            packet[16..20].copy_from_slice(&d.octets());

            let csum = ipv4_header_checksum(&packet[..20]);
            packet[10..12].copy_from_slice(&csum.to_be_bytes());
            packet[20..].copy_from_slice(segment);
            Ok(packet)
        }
        (IpAddr::V6(s), IpAddr::V6(d)) => {
            if segment.len() > u16::MAX as usize {
                return Err(Error::MalformedPacket("IPv6 payload too large"));
            }

            let mut packet = vec![0u8; 40 + segment.len()];
            packet[0] = 0x60;
            packet[4..6].copy_from_slice(&(segment.len() as u16).to_be_bytes());
            packet[6] = protocol;
            packet[7] = DEFAULT_TTL;
            packet[8..24].copy_from_slice(&s.octets());
            packet[24..40].copy_from_slice(&d.octets());
            packet[40..].copy_from_slice(segment);
            Ok(packet)
        }
        _ => Err(Error::MalformedPacket("mixed IP families")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::checksum::{finish, sum_words};
    use crate::packet::tcp_flags;

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_build_tcp_ipv4_layout() {
        let fields = TcpFields {
            seq: 100,
            ack: 200,
            flags: tcp_flags::PSH | tcp_flags::ACK,
            window: 65535,
            mss: None,
        };
        let packet =
            build_tcp(addr("1.1.1.1:443"), addr("10.0.0.2:50000"), &fields, b"hello").unwrap();

        assert_eq!(packet[0] >> 4, 4);
        assert_eq!(packet[9], PROTO_TCP);
        assert_eq!(u16::from_be_bytes([packet[20], packet[21]]), 443);
        assert_eq!(u16::from_be_bytes([packet[22], packet[23]]), 50000);
        assert_eq!(u32::from_be_bytes([packet[24], packet[25], packet[26], packet[27]]), 100);
        assert_eq!(u32::from_be_bytes([packet[28], packet[29], packet[30], packet[31]]), 200);
        assert_eq!(packet[33], 0x18);
        assert_eq!(&packet[40..], b"hello");

        // header checksum verifies
        assert_eq!(ipv4_header_checksum(&packet[..20]), 0);
        // transport checksum verifies over the pseudo header
        assert_eq!(
            transport_checksum(
                "1.1.1.1".parse().unwrap(),
                "10.0.0.2".parse().unwrap(),
                PROTO_TCP,
                &packet[20..]
            ),
            0
        );
    }

    #[test]
    fn test_build_tcp_syn_ack_carries_mss() {
        let fields = TcpFields {
            seq: 1,
            ack: 2,
            flags: tcp_flags::SYN | tcp_flags::ACK,
            window: 65535,
            mss: Some(1400),
        };
        let packet =
            build_tcp(addr("[2001:db8::1]:80"), addr("[fd00::2]:4000"), &fields, b"").unwrap();

        assert_eq!(packet[0] >> 4, 6);
        assert_eq!(packet[6], PROTO_TCP);
        assert_eq!(u16::from_be_bytes([packet[4], packet[5]]), 24);
        assert_eq!(packet[40 + 12] >> 4, 6);
        assert_eq!(&packet[60..64], &[2, 4, 0x05, 0x78]);
        assert_eq!(
            transport_checksum(
                "2001:db8::1".parse().unwrap(),
                "fd00::2".parse().unwrap(),
                PROTO_TCP,
                &packet[40..]
            ),
            0
        );
    }

    #[test]
    fn test_build_udp_checksum() {
        let packet = build_udp(addr("8.8.8.8:53"), addr("10.0.0.2:5353"), b"answer").unwrap();
        assert_eq!(packet.len(), 20 + 8 + 6);
        assert_eq!(u16::from_be_bytes([packet[24], packet[25]]), 14);
        assert_ne!(u16::from_be_bytes([packet[26], packet[27]]), 0);
        assert_eq!(finish(sum_words(&packet[..20], 0)), 0);
    }

    #[test]
    fn test_mixed_families_rejected() {
        assert!(build_udp(addr("8.8.8.8:53"), addr("[fd00::2]:53"), b"").is_err());
    }
}
