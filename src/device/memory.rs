//! Channel-backed device

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, Mutex};

use crate::common::Result;
use crate::error::Error;

use super::TunDevice;

/// In-memory interface. Frames pushed through the [`MemoryHandle`] are read
/// by the engine; frames the engine writes are collected on the handle.
pub struct MemoryDevice {
    name: String,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::UnboundedSender<Bytes>,
}

/// The far side of a [`MemoryDevice`]
pub struct MemoryHandle {
    injector: mpsc::Sender<Bytes>,
    collector: mpsc::UnboundedReceiver<Bytes>,
}

impl MemoryDevice {
    pub fn pair(capacity: usize) -> (MemoryDevice, MemoryHandle) {
        let (injector, inbound) = mpsc::channel(capacity);
        let (outbound, collector) = mpsc::unbounded_channel();

        let device = MemoryDevice {
            name: "memory".to_string(),
            inbound: Mutex::new(inbound),
            outbound,
        };
        (device, MemoryHandle { injector, collector })
    }
}

#[async_trait]
impl TunDevice for MemoryDevice {
    fn name(&self) -> &str {
        &self.name
    }

    /// Frames longer than `buf` are truncated, like a datagram read.
    async fn read_packet(&self, buf: &mut [u8]) -> Result<usize> {
        let frame = self
            .inbound
            .lock()
            .await
            .recv()
            .await
            .ok_or(Error::ConnectionClosed)?;

        let n = frame.len().min(buf.len());
        buf[..n].copy_from_slice(&frame[..n]);
        Ok(n)
    }

    async fn write_packet(&self, packet: &[u8]) -> Result<usize> {
        self.outbound
            .send(Bytes::copy_from_slice(packet))
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(packet.len())
    }
}

impl MemoryHandle {
    /// Queue a frame for the engine to read.
    pub async fn inject(&self, frame: impl Into<Bytes>) -> Result<()> {
        self.injector
            .send(frame.into())
            .await
            .map_err(|_| Error::ConnectionClosed)
    }

    /// Next frame written by the engine, `None` once the device is gone.
    pub async fn next_packet(&mut self) -> Option<Bytes> {
        self.collector.recv().await
    }

    pub fn try_next_packet(&mut self) -> Option<Bytes> {
        self.collector.try_recv().ok()
    }
}
