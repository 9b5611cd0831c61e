//! Observability for the cache
//!
//! ```text
//!   request path ──┐
//!                  ├──▶ CacheMetrics (atomic counters) ──▶ PrometheusExporter ──▶ /metrics
//!   readahead ─────┘
//! ```

pub mod metrics;
pub mod prometheus_exporter;

pub use metrics::{CacheMetrics, CacheMetricsSnapshot};
pub use prometheus_exporter::{PrometheusConfig, PrometheusExporter};
