//! Prometheus counters and histograms for the pipeline

use crate::types::{LaneResult, Mode};
use prometheus::{
    Histogram, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use tracing::warn;

pub struct Metrics {
    registry: Registry,
    pub queries_total: IntCounterVec,
    pub lane_outcomes_total: IntCounterVec,
    pub events_emitted_total: IntCounterVec,
    pub ttft_seconds: Histogram,
    pub query_latency_seconds: HistogramVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let queries_total = IntCounterVec::new(
            Opts::new("quorum_queries_total", "Queries by mode and outcome"),
            &["mode", "outcome"],
        )?;
        let lane_outcomes_total = IntCounterVec::new(
            Opts::new("quorum_lane_outcomes_total", "Lane results by lane and status"),
            &["lane", "status"],
        )?;
        let events_emitted_total = IntCounterVec::new(
            Opts::new("quorum_stream_events_total", "Streamed events by kind"),
            &["kind"],
        )?;
        let ttft_seconds = Histogram::with_opts(
            HistogramOpts::new("quorum_ttft_seconds", "Time to first streamed event")
                .buckets(vec![0.05, 0.1, 0.25, 0.5, 1.0, 1.5, 2.0, 5.0]),
        )?;
        let query_latency_seconds = HistogramVec::new(
            HistogramOpts::new("quorum_query_latency_seconds", "End-to-end query latency")
                .buckets(vec![0.25, 0.5, 1.0, 2.0, 3.0, 5.0, 7.0, 10.0, 15.0]),
            &["mode"],
        )?;

        registry.register(Box::new(queries_total.clone()))?;
        registry.register(Box::new(lane_outcomes_total.clone()))?;
        registry.register(Box::new(events_emitted_total.clone()))?;
        registry.register(Box::new(ttft_seconds.clone()))?;
        registry.register(Box::new(query_latency_seconds.clone()))?;

        Ok(Self {
            registry,
            queries_total,
            lane_outcomes_total,
            events_emitted_total,
            ttft_seconds,
            query_latency_seconds,
        })
    }

    pub fn observe_query(&self, mode: Mode, outcome: &str, latency_ms: u64, ttft_ms: Option<u64>) {
        self.queries_total.with_label_values(&[mode.as_str(), outcome]).inc();
        self.query_latency_seconds
            .with_label_values(&[mode.as_str()])
            .observe(latency_ms as f64 / 1000.0);
        if let Some(ttft) = ttft_ms {
            self.ttft_seconds.observe(ttft as f64 / 1000.0);
        }
    }

    pub fn observe_lane(&self, result: &LaneResult) {
        let status = serde_json::to_value(result.status)
            .ok()
            .and_then(|v| v.as_str().map(|s| s.to_string()))
            .unwrap_or_else(|| "unknown".to_string());
        self.lane_outcomes_total
            .with_label_values(&[result.lane_id.as_str(), &status])
            .inc();
    }

    /// Render the registry in the Prometheus text exposition format
    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        match encoder.encode_to_string(&self.registry.gather()) {
            Ok(text) => text,
            Err(e) => {
                warn!("metrics encoding failed: {}", e);
                String::new()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{LaneId, LaneStatus};

    #[test]
    fn metrics_render_includes_counters() {
        let metrics = Metrics::new().unwrap();
        metrics.observe_query(Mode::Simple, "ok", 1200, Some(80));
        metrics.observe_lane(&LaneResult {
            lane_id: LaneId::Web,
            status: LaneStatus::Success,
            documents: vec![],
            latency_ms: 10,
            error: None,
        });
        let rendered = metrics.render();
        assert!(rendered.contains("quorum_queries_total"));
        assert!(rendered.contains("quorum_lane_outcomes_total"));
        assert!(rendered.contains("quorum_ttft_seconds"));
    }
}
