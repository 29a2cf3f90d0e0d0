//! Proxy Protocol Layer
//!
//! Responsibilities:
//! - SOCKS5 method negotiation and authentication
//! - CONNECT / UDP ASSOCIATE requests
//! - UDP relay datagram framing
//!
//! This layer only speaks the client side; it never owns a socket.

mod socks5;

pub use socks5::{decode_udp_datagram, encode_udp_datagram, Socks5Client};

/// SOCKS5 configuration
#[derive(Debug, Clone, Default)]
pub struct Socks5Config {
    /// Username for authentication (optional)
    pub username: Option<String>,
    /// Password for authentication (optional)
    pub password: Option<String>,
}
