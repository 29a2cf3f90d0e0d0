//! Prometheus-based metrics module
//!
//! Each engine owns its own `Registry`, so several engines in one process
//! never share counters. Snapshots for the host are cut from the same
//! counters.

use prometheus::{
    Encoder, Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    TextEncoder,
};
use serde::Serialize;

use crate::error::Error;

/// Packet and byte counts for one direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct DataFlow {
    pub packets: u64,
    pub bytes: u64,
}

/// Point-in-time traffic counters.
///
/// `outbound` counts frames read from the interface, `inbound` counts
/// frames written back to it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MetricsSnapshot {
    pub outbound: DataFlow,
    pub inbound: DataFlow,
}

impl MetricsSnapshot {
    pub fn total_bytes(&self) -> u64 {
        self.outbound.bytes + self.inbound.bytes
    }
}

/// Counters of one engine instance
pub struct EngineMetrics {
    registry: Registry,

    // === Interface traffic ===
    pub outbound_packets: IntCounter,
    pub outbound_bytes: IntCounter,
    pub inbound_packets: IntCounter,
    pub inbound_bytes: IntCounter,

    // === Demultiplexer ===
    pub packets_malformed: IntCounter,
    pub packets_unsupported: IntCounter,
    pub packets_dropped: IntCounter,
    pub flows_rejected: IntCounter,
    pub flows_total: IntCounterVec,
    pub flows_active: IntGauge,

    // === Sessions ===
    pub session_retries: IntCounter,
    pub session_failures: IntCounterVec,
    pub handshake_seconds: Histogram,
    pub proxy_bytes_sent: IntCounter,
    pub proxy_bytes_received: IntCounter,
}

impl EngineMetrics {
    pub fn new() -> Result<Self, Error> {
        let registry = Registry::new_custom(Some("sockstun".to_string()), None)?;

        let metrics = Self {
            outbound_packets: IntCounter::new(
                "outbound_packets_total",
                "Frames read from the interface",
            )?,
            outbound_bytes: IntCounter::new(
                "outbound_bytes_total",
                "Bytes read from the interface",
            )?,
            inbound_packets: IntCounter::new(
                "inbound_packets_total",
                "Frames written to the interface",
            )?,
            inbound_bytes: IntCounter::new(
                "inbound_bytes_total",
                "Bytes written to the interface",
            )?,
            packets_malformed: IntCounter::new(
                "packets_malformed_total",
                "Frames dropped because they could not be parsed",
            )?,
            packets_unsupported: IntCounter::new(
                "packets_unsupported_total",
                "Frames dropped because the transport is not TCP or UDP",
            )?,
            packets_dropped: IntCounter::new(
                "packets_dropped_total",
                "Frames dropped because the flow queue was full",
            )?,
            flows_rejected: IntCounter::new(
                "flows_rejected_total",
                "New flows refused at the flow limit",
            )?,
            flows_total: IntCounterVec::new(
                Opts::new("flows_total", "Flows created per network"),
                &["network"],
            )?,
            flows_active: IntGauge::new("flows_active", "Flows currently tracked")?,
            session_retries: IntCounter::new(
                "session_retries_total",
                "Proxy session establishment retries",
            )?,
            session_failures: IntCounterVec::new(
                Opts::new("session_failures_total", "Flows torn down after a failure"),
                &["kind"],
            )?,
            handshake_seconds: Histogram::with_opts(
                HistogramOpts::new(
                    "handshake_seconds",
                    "Time from pool acquire to a completed SOCKS5 reply",
                )
                .buckets(vec![0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
            )?,
            proxy_bytes_sent: IntCounter::new(
                "proxy_bytes_sent_total",
                "Payload bytes relayed to the proxy",
            )?,
            proxy_bytes_received: IntCounter::new(
                "proxy_bytes_received_total",
                "Payload bytes relayed from the proxy",
            )?,
            registry,
        };

        metrics.register()?;
        Ok(metrics)
    }

    fn register(&self) -> Result<(), Error> {
        let r = &self.registry;
        r.register(Box::new(self.outbound_packets.clone()))?;
        r.register(Box::new(self.outbound_bytes.clone()))?;
        r.register(Box::new(self.inbound_packets.clone()))?;
        r.register(Box::new(self.inbound_bytes.clone()))?;
        r.register(Box::new(self.packets_malformed.clone()))?;
        r.register(Box::new(self.packets_unsupported.clone()))?;
        r.register(Box::new(self.packets_dropped.clone()))?;
        r.register(Box::new(self.flows_rejected.clone()))?;
        r.register(Box::new(self.flows_total.clone()))?;
        r.register(Box::new(self.flows_active.clone()))?;
        r.register(Box::new(self.session_retries.clone()))?;
        r.register(Box::new(self.session_failures.clone()))?;
        r.register(Box::new(self.handshake_seconds.clone()))?;
        r.register(Box::new(self.proxy_bytes_sent.clone()))?;
        r.register(Box::new(self.proxy_bytes_received.clone()))?;
        Ok(())
    }

    pub fn record_outbound(&self, bytes: usize) {
        self.outbound_packets.inc();
        self.outbound_bytes.inc_by(bytes as u64);
    }

    pub fn record_inbound(&self, bytes: usize) {
        self.inbound_packets.inc();
        self.inbound_bytes.inc_by(bytes as u64);
    }

    pub fn record_failure(&self, error: &Error) {
        self.session_failures.with_label_values(&[error.kind()]).inc();
    }

    pub fn failures_total(&self) -> u64 {
        self.registry
            .gather()
            .iter()
            .filter(|family| family.get_name().ends_with("session_failures_total"))
            .flat_map(|family| family.get_metric().iter())
            .map(|metric| metric.get_counter().get_value() as u64)
            .sum()
    }

    /// Mean handshake time in seconds, zero before the first session
    pub fn mean_handshake_secs(&self) -> f64 {
        let count = self.handshake_seconds.get_sample_count();
        if count == 0 {
            return 0.0;
        }
        self.handshake_seconds.get_sample_sum() / count as f64
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            outbound: DataFlow {
                packets: self.outbound_packets.get(),
                bytes: self.outbound_bytes.get(),
            },
            inbound: DataFlow {
                packets: self.inbound_packets.get(),
                bytes: self.inbound_bytes.get(),
            },
        }
    }

    /// Text exposition of every counter
    pub fn encode_text(&self) -> Result<String, Error> {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        encoder.encode(&self.registry.gather(), &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}

/// Format bytes to human readable string
pub fn format_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * 1024;
    const GB: u64 = 1024 * 1024 * 1024;

    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}
