//! IP packet handling
//!
//! Parsing borrows from the frame buffer; nothing is copied until a payload
//! is handed to a flow. Builders produce complete frames with valid IPv4
//! header and TCP/UDP pseudo-header checksums.

mod build;
mod checksum;
mod parse;

pub use build::{build_tcp, build_udp, TcpFields};
pub use parse::{IpPacket, Packet, TcpSegment, UdpDatagram};

pub const PROTO_TCP: u8 = 6;
pub const PROTO_UDP: u8 = 17;

/// TCP header flag bits
pub mod tcp_flags {
    pub const FIN: u8 = 0x01;
    pub const SYN: u8 = 0x02;
    pub const RST: u8 = 0x04;
    pub const PSH: u8 = 0x08;
    pub const ACK: u8 = 0x10;
}
