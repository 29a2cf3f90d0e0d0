//! Application Layer
//!
//! - Engine: lifecycle, main loop, diagnostics
//! - Metrics: per-engine Prometheus counters and traffic snapshots

mod engine;
pub mod metrics;
mod resource;

pub use engine::{Engine, PerformanceSample, HEARTBEAT_INTERVAL, PERFORMANCE_HISTORY};
pub use metrics::{format_bytes, DataFlow, EngineMetrics, MetricsSnapshot};
