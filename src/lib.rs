//! sockstun - SOCKS5 tunnel engine for virtual network interfaces
//!
//! # Architecture
//!
//! ```text
//! interface (TUN fd)
//! → PacketReader → Demux (5-tuple) → per-flow Session
//! → ConnectionPool → SOCKS5 → proxy server
//! ```
//!
//! Replies travel back the same way: the session builds IP frames and
//! hands them to the shared `PacketWriter`.
//!
//! ## Module Structure
//!
//! ```text
//! src/
//! ├── common/          # Core types: Stream, FlowKey, Address
//! ├── config.rs        # key=value config, validation cache
//! ├── device/          # Interface devices and descriptor resolution
//! ├── packet/          # IPv4/IPv6, TCP, UDP parsing and building
//! ├── protocol/        # SOCKS5 client
//! ├── transport/       # TCP transport, proxy connector, connection pool
//! ├── session/         # Per-flow TCP/UDP sessions, retry table
//! ├── stack/           # Demultiplexer and packet writer
//! └── app/             # Engine controller and metrics
//! ```

// Core types
pub mod common;
pub mod error;

// Layered architecture
pub mod device;
pub mod packet;
pub mod transport;
pub mod protocol;
pub mod session;
pub mod stack;
pub mod app;

// Supporting modules
pub mod config;

// Re-exports for convenience
pub use app::{Engine, MetricsSnapshot};
pub use common::{Address, FlowKey, Network, Stream};
pub use config::{Config, ConfigSource, ConfigValidator};
pub use device::{FixedResolver, InterfaceResolver, ScanResolver, TunDevice};
pub use error::{Error, Result};
