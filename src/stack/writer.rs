//! Shared write side of the interface

use std::sync::Arc;

use crate::app::EngineMetrics;
use crate::common::Result;
use crate::device::TunDevice;

/// Writes frames to the device and counts them as inbound traffic.
#[derive(Clone)]
pub struct PacketWriter {
    device: Arc<dyn TunDevice>,
    metrics: Arc<EngineMetrics>,
}

impl PacketWriter {
    pub fn new(device: Arc<dyn TunDevice>, metrics: Arc<EngineMetrics>) -> Self {
        Self { device, metrics }
    }

    pub async fn write(&self, frame: &[u8]) -> Result<()> {
        let n = self.device.write_packet(frame).await?;
        self.metrics.record_inbound(n);
        Ok(())
    }
}
