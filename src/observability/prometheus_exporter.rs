//! Prometheus metrics exporter for the cache
//!
//! Renders [`CacheMetrics`] in the Prometheus text exposition format,
//! followed by anything registered in the global `prometheus` registry.

use std::fmt::Write;
use std::sync::Arc;

use prometheus::{Encoder, TextEncoder};

use super::metrics::{CacheMetrics, CacheMetricsSnapshot};

/// Configuration for Prometheus exporter
#[derive(Debug, Clone)]
pub struct PrometheusConfig {
    /// Prefix for all metric names (default: "tscache")
    pub metric_prefix: String,
}

impl Default for PrometheusConfig {
    fn default() -> Self {
        Self {
            metric_prefix: "tscache".to_string(),
        }
    }
}

/// Prometheus metrics exporter
pub struct PrometheusExporter {
    config: PrometheusConfig,
    metrics: Arc<CacheMetrics>,
}

impl PrometheusExporter {
    pub fn new(config: PrometheusConfig, metrics: Arc<CacheMetrics>) -> Self {
        Self { config, metrics }
    }

    /// Export metrics in Prometheus text format
    pub fn export(&self) -> String {
        let mut output = String::new();
        let snapshot = self.metrics.snapshot();

        self.export_cache_metrics(&mut output, &self.config.metric_prefix, &snapshot);

        if let Ok(global_metrics) = self.export_global_metrics() {
            output.push_str(&global_metrics);
        }

        output
    }

    fn export_cache_metrics(&self, output: &mut String, prefix: &str, s: &CacheMetricsSnapshot) {
        // One labelled counter for the cache mode of every datapoint query
        let _ = writeln!(
            output,
            "# HELP {}_queries_total Datapoint queries by cache mode",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_queries_total counter", prefix);
        for (mode, value) in [
            ("hot", s.hot),
            ("warm_before", s.warm_before),
            ("warm_after", s.warm_after),
            ("cold", s.cold),
            ("cold_overwrite", s.cold_overwrite),
        ] {
            let _ = writeln!(output, "{}_queries_total{{mode=\"{}\"}} {}", prefix, mode, value);
        }
        output.push('\n');

        let _ = writeln!(
            output,
            "# HELP {}_metadata_requests_total Metadata requests by cache outcome",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_metadata_requests_total counter", prefix);
        let _ = writeln!(
            output,
            "{}_metadata_requests_total{{outcome=\"hit\"}} {}",
            prefix, s.metadata_hits
        );
        let _ = writeln!(
            output,
            "{}_metadata_requests_total{{outcome=\"miss\"}} {}\n",
            prefix, s.metadata_misses
        );

        let counters = [
            ("samples_served_total", "Samples returned to clients", s.samples_served),
            ("backend_failures_total", "Failed KairosDB queries", s.backend_failures),
            ("store_errors_total", "Cache store errors contained", s.store_errors),
            ("merges_applied_total", "Series merges that changed cached data", s.merges_applied),
            ("merges_aborted_total", "Series merges abandoned at the cutoff", s.merges_aborted),
            ("readahead_admitted_total", "Queries added to the readahead set", s.readahead_admitted),
            ("readahead_cycles_total", "Readahead cycles run as leader", s.readahead_cycles),
            ("readahead_refreshed_total", "Queries refreshed by readahead", s.readahead_refreshed),
            ("readahead_failed_total", "Readahead refreshes that failed", s.readahead_failed),
        ];
        for (name, help, value) in counters {
            let _ = writeln!(output, "# HELP {}_{} {}", prefix, name, help);
            let _ = writeln!(output, "# TYPE {}_{} counter", prefix, name);
            let _ = writeln!(output, "{}_{} {}\n", prefix, name, value);
        }

        let total = s.hot + s.warm_before + s.warm_after + s.cold + s.cold_overwrite;
        let hit_rate = if total == 0 {
            0.0
        } else {
            (s.hot + s.warm_before + s.warm_after) as f64 / total as f64
        };
        let _ = writeln!(
            output,
            "# HELP {}_hit_rate Share of queries served without a full fetch (0.0-1.0)",
            prefix
        );
        let _ = writeln!(output, "# TYPE {}_hit_rate gauge", prefix);
        let _ = writeln!(output, "{}_hit_rate {:.4}\n", prefix, hit_rate);

        let _ = writeln!(output, "# HELP {}_uptime_seconds Process uptime in seconds", prefix);
        let _ = writeln!(output, "# TYPE {}_uptime_seconds gauge", prefix);
        let _ = writeln!(output, "{}_uptime_seconds {}\n", prefix, s.uptime.as_secs());
    }

    /// Export global metrics from prometheus crate registry
    fn export_global_metrics(&self) -> Result<String, String> {
        let encoder = TextEncoder::new();
        let metric_families = prometheus::gather();
        let mut buffer = vec![];

        encoder
            .encode(&metric_families, &mut buffer)
            .map_err(|e| format!("Failed to encode metrics: {}", e))?;

        String::from_utf8(buffer).map_err(|e| format!("Metrics contain invalid UTF-8: {}", e))
    }

    /// Export metrics as HTTP response body with correct content type
    pub fn export_http(&self) -> (String, &'static str) {
        (self.export(), "text/plain; version=0.0.4; charset=utf-8")
    }
}
