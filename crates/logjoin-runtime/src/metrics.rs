//! Prometheus metrics for the log join

use prometheus::{Gauge, IntCounter, IntCounterVec, IntGauge, Opts, Registry};
use std::path::Path;
use std::sync::Arc;

/// Metrics collection for the join service
#[derive(Clone)]
pub struct JoinMetrics {
    registry: Arc<Registry>,
    pub loglines_total: IntCounter,
    pub loglines_invalid: IntCounterVec,
    pub joined_sessions: IntCounter,
    pub joined_queries: IntCounter,
    pub joined_item_visits: IntCounter,
    pub late_events_dropped: IntCounter,
    pub active_sessions: IntGauge,
    pub stream_time: Gauge,
    pub feature_cache_hits: IntCounter,
    pub feature_cache_misses: IntCounter,
}

impl JoinMetrics {
    pub fn new() -> Self {
        let registry = Registry::new();

        let loglines_total = IntCounter::new("logjoin_loglines_total", "Total log lines received")
            .expect("failed to create loglines_total counter");

        let loglines_invalid = IntCounterVec::new(
            Opts::new("logjoin_loglines_invalid_total", "Log lines rejected by the decoder"),
            &["reason"],
        )
        .expect("failed to create loglines_invalid counter");

        let joined_sessions =
            IntCounter::new("logjoin_joined_sessions_total", "Sessions flushed downstream")
                .expect("failed to create joined_sessions counter");

        let joined_queries =
            IntCounter::new("logjoin_joined_queries_total", "Queries flushed downstream")
                .expect("failed to create joined_queries counter");

        let joined_item_visits = IntCounter::new(
            "logjoin_joined_item_visits_total",
            "Item visits emitted downstream",
        )
        .expect("failed to create joined_item_visits counter");

        let late_events_dropped = IntCounter::new(
            "logjoin_late_events_dropped_total",
            "Events discarded because their query was already flushed",
        )
        .expect("failed to create late_events_dropped counter");

        let active_sessions = IntGauge::new("logjoin_active_sessions", "Sessions currently open")
            .expect("failed to create active_sessions gauge");

        let stream_time = Gauge::new(
            "logjoin_stream_time_seconds",
            "Current stream clock watermark as unix seconds",
        )
        .expect("failed to create stream_time gauge");

        let feature_cache_hits = IntCounter::new(
            "logjoin_feature_cache_hits_total",
            "Feature lookups served from cache",
        )
        .expect("failed to create feature_cache_hits counter");

        let feature_cache_misses = IntCounter::new(
            "logjoin_feature_cache_misses_total",
            "Feature lookups forwarded to the store",
        )
        .expect("failed to create feature_cache_misses counter");

        registry
            .register(Box::new(loglines_total.clone()))
            .expect("failed to register loglines_total");
        registry
            .register(Box::new(loglines_invalid.clone()))
            .expect("failed to register loglines_invalid");
        registry
            .register(Box::new(joined_sessions.clone()))
            .expect("failed to register joined_sessions");
        registry
            .register(Box::new(joined_queries.clone()))
            .expect("failed to register joined_queries");
        registry
            .register(Box::new(joined_item_visits.clone()))
            .expect("failed to register joined_item_visits");
        registry
            .register(Box::new(late_events_dropped.clone()))
            .expect("failed to register late_events_dropped");
        registry
            .register(Box::new(active_sessions.clone()))
            .expect("failed to register active_sessions");
        registry
            .register(Box::new(stream_time.clone()))
            .expect("failed to register stream_time");
        registry
            .register(Box::new(feature_cache_hits.clone()))
            .expect("failed to register feature_cache_hits");
        registry
            .register(Box::new(feature_cache_misses.clone()))
            .expect("failed to register feature_cache_misses");

        Self {
            registry: Arc::new(registry),
            loglines_total,
            loglines_invalid,
            joined_sessions,
            joined_queries,
            joined_item_visits,
            late_events_dropped,
            active_sessions,
            stream_time,
            feature_cache_hits,
            feature_cache_misses,
        }
    }

    /// Record a line rejected by the decoder
    pub fn record_invalid(&self, reason: &str) {
        self.loglines_invalid.with_label_values(&[reason]).inc();
    }

    /// Get Prometheus text output
    pub fn gather(&self) -> String {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if encoder.encode(&metric_families, &mut buffer).is_err() {
            return String::new();
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Write the Prometheus text output to `path`
    pub fn export(&self, path: impl AsRef<Path>) -> std::io::Result<()> {
        std::fs::write(path, self.gather())
    }
}

impl Default for JoinMetrics {
    fn default() -> Self {
        Self::new()
    }
}
