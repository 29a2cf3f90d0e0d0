//! Packet Reader/Writer
//!
//! A [`TunDevice`] moves whole IP frames in and out of the virtual
//! interface, one frame per call. Two implementations:
//! - `FdDevice`: a host-owned non-blocking descriptor driven by `AsyncFd`
//! - `MemoryDevice`: channel-backed, for tests and embedding

mod fd;
mod memory;
mod resolver;

pub use fd::FdDevice;
pub use memory::{MemoryDevice, MemoryHandle};
pub use resolver::{Descriptor, DescriptorProbe, FixedResolver, InterfaceResolver, ScanResolver};

use async_trait::async_trait;

use crate::common::Result;

/// Virtual interface frame I/O
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Device name for logs
    fn name(&self) -> &str;

    /// Read one frame into `buf`, returning its length.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize>;

    /// Write one frame, returning the number of bytes written.
    async fn write_packet(&self, packet: &[u8]) -> Result<usize>;
}
