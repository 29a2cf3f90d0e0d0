//! Zero-copy IP / TCP / UDP header parsing

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use crate::common::Result;
use crate::error::Error;

use super::{tcp_flags, PROTO_TCP, PROTO_UDP};

const IPV4_MIN_HEADER: usize = 20;
const IPV6_HEADER: usize = 40;
const TCP_MIN_HEADER: usize = 20;
const UDP_HEADER: usize = 8;

const TCP_OPT_END: u8 = 0;
const TCP_OPT_NOP: u8 = 1;
const TCP_OPT_MSS: u8 = 2;

/// A parsed IP frame. `payload` is the transport segment.
#[derive(Debug, Clone, Copy)]
pub struct IpPacket<'a> {
    pub src: IpAddr,
    pub dst: IpAddr,
    pub protocol: u8,
    pub payload: &'a [u8],
}

impl<'a> IpPacket<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        match frame.first().map(|b| b >> 4) {
            Some(4) => Self::parse_v4(frame),
            Some(6) => Self::parse_v6(frame),
            Some(_) => Err(Error::MalformedPacket("unknown IP version")),
            None => Err(Error::MalformedPacket("empty frame")),
        }
    }

    fn parse_v4(frame: &'a [u8]) -> Result<Self> {
        if frame.len() < IPV4_MIN_HEADER {
            return Err(Error::MalformedPacket("truncated IPv4 header"));
        }

        let ihl = (frame[0] & 0x0F) as usize * 4;
        if ihl < IPV4_MIN_HEADER || ihl > frame.len() {
            return Err(Error::MalformedPacket("bad IPv4 header length"));
        }

        let total_len = u16::from_be_bytes([frame[2], frame[3]]) as usize;
        if total_len < ihl || total_len > frame.len() {
            return Err(Error::MalformedPacket("bad IPv4 total length"));
        }

        let flags_fragment = u16::from_be_bytes([frame[6], frame[7]]);
        let more_fragments = flags_fragment & 0x2000 != 0;
        let offset = flags_fragment & 0x1FFF;
        if more_fragments || offset != 0 {
            return Err(Error::MalformedPacket("fragmented IPv4 packet"));
        }

        let src = Ipv4Addr::new(frame[12], frame[13], frame[14], frame[15]);
        let dst = Ipv4Addr::new(frame[16], frame[17], frame[18], frame[19]);

        Ok(Self {
            src: IpAddr::V4(src),
            dst: IpAddr::V4(dst),
            protocol: frame[9],
            payload: &frame[ihl..total_len],
        })
    }

    fn parse_v6(frame: &'a [u8]) -> Result<Self> {
        if frame.len() < IPV6_HEADER {
            return Err(Error::MalformedPacket("truncated IPv6 header"));
        }

        let payload_len = u16::from_be_bytes([frame[4], frame[5]]) as usize;
        if IPV6_HEADER + payload_len > frame.len() {
            return Err(Error::MalformedPacket("bad IPv6 payload length"));
        }

        let mut src = [0u8; 16];
        src.copy_from_slice(&frame[8..24]);
        let mut dst = [0u8; 16];
        dst.copy_from_slice(&frame[24..40]);

        Ok(Self {
            src: IpAddr::V6(Ipv6Addr::from(src)),
            dst: IpAddr::V6(Ipv6Addr::from(dst)),
            protocol: frame[6],
            payload: &frame[IPV6_HEADER..IPV6_HEADER + payload_len],
        })
    }
}

/// A parsed TCP segment
#[derive(Debug, Clone, Copy)]
pub struct TcpSegment<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub seq: u32,
    pub ack: u32,
    pub flags: u8,
    pub window: u16,
    pub mss: Option<u16>,
    pub payload: &'a [u8],
}

impl<'a> TcpSegment<'a> {
    pub fn parse(segment: &'a [u8]) -> Result<Self> {
        if segment.len() < TCP_MIN_HEADER {
            return Err(Error::MalformedPacket("truncated TCP header"));
        }

        let data_offset = (segment[12] >> 4) as usize * 4;
        if data_offset < TCP_MIN_HEADER || data_offset > segment.len() {
            return Err(Error::MalformedPacket("bad TCP data offset"));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            seq: u32::from_be_bytes([segment[4], segment[5], segment[6], segment[7]]),
            ack: u32::from_be_bytes([segment[8], segment[9], segment[10], segment[11]]),
            flags: segment[13],
            window: u16::from_be_bytes([segment[14], segment[15]]),
            mss: parse_mss(&segment[TCP_MIN_HEADER..data_offset]),
            payload: &segment[data_offset..],
        })
    }

    pub fn has(&self, flag: u8) -> bool {
        self.flags & flag != 0
    }

    pub fn is_syn(&self) -> bool {
        self.has(tcp_flags::SYN) && !self.has(tcp_flags::ACK)
    }

    /// Sequence space consumed: payload plus one each for SYN and FIN.
    pub fn seq_len(&self) -> u32 {
        let mut len = self.payload.len() as u32;
        if self.has(tcp_flags::SYN) {
            len += 1;
        }
        if self.has(tcp_flags::FIN) {
            len += 1;
        }
        len
    }
}

fn parse_mss(mut options: &[u8]) -> Option<u16> {
    while let Some(&kind) = options.first() {
        match kind {
            TCP_OPT_END => return None,
            TCP_OPT_NOP => options = &options[1..],
            _ => {
                let len = *options.get(1)? as usize;
                if len < 2 || len > options.len() {
                    return None;
                }
                if kind == TCP_OPT_MSS && len == 4 {
                    return Some(u16::from_be_bytes([options[2], options[3]]));
                }
                options = &options[len..];
            }
        }
    }
    None
}

/// A parsed UDP datagram
#[derive(Debug, Clone, Copy)]
pub struct UdpDatagram<'a> {
    pub src_port: u16,
    pub dst_port: u16,
    pub payload: &'a [u8],
}

impl<'a> UdpDatagram<'a> {
    pub fn parse(segment: &'a [u8]) -> Result<Self> {
        if segment.len() < UDP_HEADER {
            return Err(Error::MalformedPacket("truncated UDP header"));
        }

        let len = u16::from_be_bytes([segment[4], segment[5]]) as usize;
        if len < UDP_HEADER || len > segment.len() {
            return Err(Error::MalformedPacket("bad UDP length"));
        }

        Ok(Self {
            src_port: u16::from_be_bytes([segment[0], segment[1]]),
            dst_port: u16::from_be_bytes([segment[2], segment[3]]),
            payload: &segment[UDP_HEADER..len],
        })
    }
}

/// Classified frame
#[derive(Debug, Clone, Copy)]
pub enum Packet<'a> {
    Tcp {
        src: SocketAddr,
        dst: SocketAddr,
        segment: TcpSegment<'a>,
    },
    Udp {
        src: SocketAddr,
        dst: SocketAddr,
        payload: &'a [u8],
    },
    /// Any other transport protocol
    Unsupported(u8),
}

impl<'a> Packet<'a> {
    pub fn parse(frame: &'a [u8]) -> Result<Self> {
        let ip = IpPacket::parse(frame)?;

        match ip.protocol {
            PROTO_TCP => {
                let segment = TcpSegment::parse(ip.payload)?;
                Ok(Packet::Tcp {
                    src: SocketAddr::new(ip.src, segment.src_port),
                    dst: SocketAddr::new(ip.dst, segment.dst_port),
                    segment,
                })
            }
            PROTO_UDP => {
                let datagram = UdpDatagram::parse(ip.payload)?;
                Ok(Packet::Udp {
                    src: SocketAddr::new(ip.src, datagram.src_port),
                    dst: SocketAddr::new(ip.dst, datagram.dst_port),
                    payload: datagram.payload,
                })
            }
            other => Ok(Packet::Unsupported(other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::{build_tcp, build_udp, TcpFields};

    fn addr(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_parse_tcp_syn_with_mss() {
        let fields = TcpFields {
            seq: 1000,
            ack: 0,
            flags: tcp_flags::SYN,
            window: 64240,
            mss: Some(1460),
        };
        let frame = build_tcp(addr("10.0.0.2:50000"), addr("1.1.1.1:443"), &fields, b"").unwrap();

        match Packet::parse(&frame).unwrap() {
            Packet::Tcp { src, dst, segment } => {
                assert_eq!(src, addr("10.0.0.2:50000"));
                assert_eq!(dst, addr("1.1.1.1:443"));
                assert!(segment.is_syn());
                assert_eq!(segment.seq, 1000);
                assert_eq!(segment.window, 64240);
                assert_eq!(segment.mss, Some(1460));
                assert_eq!(segment.seq_len(), 1);
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_parse_udp_v6() {
        let frame = build_udp(addr("[fd00::2]:5353"), addr("[2001:db8::1]:53"), b"dns").unwrap();
        match Packet::parse(&frame).unwrap() {
            Packet::Udp { src, dst, payload } => {
                assert_eq!(src, addr("[fd00::2]:5353"));
                assert_eq!(dst, addr("[2001:db8::1]:53"));
                assert_eq!(payload, b"dns");
            }
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_trailing_padding_ignored() {
        let mut frame = build_udp(addr("10.0.0.2:1000"), addr("8.8.8.8:53"), b"q").unwrap();
        frame.extend_from_slice(&[0, 0, 0]);
        match Packet::parse(&frame).unwrap() {
            Packet::Udp { payload, .. } => assert_eq!(payload, b"q"),
            other => panic!("unexpected packet: {:?}", other),
        }
    }

    #[test]
    fn test_malformed_frames() {
        assert!(Packet::parse(&[]).is_err());
        assert!(Packet::parse(&[0x45, 0, 0]).is_err());
        assert!(Packet::parse(&[0x70; 40]).is_err());

        let mut frame = build_udp(addr("10.0.0.2:1000"), addr("8.8.8.8:53"), b"q").unwrap();
        // claim more bytes than present
        frame[2..4].copy_from_slice(&200u16.to_be_bytes());
        assert!(Packet::parse(&frame).is_err());

        // IHL below minimum
        let mut frame = build_udp(addr("10.0.0.2:1000"), addr("8.8.8.8:53"), b"q").unwrap();
        frame[0] = 0x44;
        assert!(Packet::parse(&frame).is_err());
    }

    #[test]
    fn test_fragment_rejected() {
        let mut frame = build_udp(addr("10.0.0.2:1000"), addr("8.8.8.8:53"), b"q").unwrap();
        frame[6] |= 0x20;
        assert!(matches!(
            Packet::parse(&frame),
            Err(Error::MalformedPacket("fragmented IPv4 packet"))
        ));
    }

    #[test]
    fn test_unsupported_protocol() {
        let mut frame = build_udp(addr("10.0.0.2:1000"), addr("8.8.8.8:53"), b"q").unwrap();
        frame[9] = 1; // ICMP
        assert!(matches!(Packet::parse(&frame).unwrap(), Packet::Unsupported(1)));
    }

    #[test]
    fn test_mss_option_walk() {
        assert_eq!(parse_mss(&[1, 1, 2, 4, 0x05, 0xb4]), Some(1460));
        assert_eq!(parse_mss(&[0, 2, 4, 0x05, 0xb4]), None);
        assert_eq!(parse_mss(&[3, 3, 7, 2, 4, 0x02, 0x18]), Some(536));
        assert_eq!(parse_mss(&[8, 40]), None);
    }
}
