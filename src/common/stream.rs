//! Stream abstraction
//!
//! Proxy connections are handled as boxed async byte streams so the pool and
//! the SOCKS5 client never depend on a concrete socket type.

use tokio::io::{AsyncRead, AsyncWrite};

/// The byte stream type carried by proxy connections.
pub type Stream = Box<dyn AsyncReadWrite + Unpin + Send>;

/// Combined trait for async read + write
pub trait AsyncReadWrite: AsyncRead + AsyncWrite {}

impl<T: AsyncRead + AsyncWrite> AsyncReadWrite for T {}
