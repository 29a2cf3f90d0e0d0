//! Transport Layer
//!
//! Responsibilities:
//! - Establish raw TCP connections to the proxy server
//! - Keep a bounded pool of live proxy connections
//!
//! This layer ONLY deals with raw byte transport; SOCKS5 lives in
//! `protocol`.

mod connector;
mod pool;
mod tcp;

pub use connector::ProxyConnector;
pub use pool::{ConnectionPool, PoolStats, PooledConnection};
pub use tcp::TcpTransport;

use async_trait::async_trait;

use crate::common::{Address, Result, Stream};

/// Transport trait for establishing raw connections
///
/// Implementations should ONLY handle connection establishment,
/// not encryption or protocol handling.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect to a remote address
    async fn connect(&self, addr: &Address) -> Result<Stream>;
}
