//! Prometheus metrics for ArenaCache

use crate::cache::{CacheSnapshot, Stats};
use prometheus::{
    Histogram, HistogramOpts, IntCounter, IntCounterVec, IntGauge, Opts, Registry,
    core::Collector,
};
use std::collections::BTreeSet;

/// Global metrics instance
pub struct Metrics {
    pub registry: Registry,

    /// Commands executed, labelled by command name
    pub commands: IntCounterVec,

    // Hit/miss counters
    pub get_hits: IntCounter,
    pub get_misses: IntCounter,

    // Connection metrics
    pub active_connections: IntGauge,
    pub total_connections: IntCounter,
    pub rejected_connections: IntCounter,

    // Bytes counters
    pub bytes_read: IntCounter,
    pub bytes_written: IntCounter,

    // Latency histograms
    pub cmd_latency: Histogram,

    // Error counters
    pub protocol_errors: IntCounter,
    pub storage_errors: IntCounter,

    // Cache gauges, sampled from the storage on scrape
    pub curr_items: IntGauge,
    pub current_bytes: IntGauge,
    pub limit_maxbytes: IntGauge,
    pub evictions: IntGauge,
}

fn register<T: Collector + Clone + 'static>(registry: &Registry, metric: T) -> prometheus::Result<T> {
    registry.register(Box::new(metric.clone()))?;
    Ok(metric)
}

fn gauge_value(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

impl Metrics {
    /// Create and register every metric
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new();
        let counter = |name: &str, help: &str| -> prometheus::Result<IntCounter> {
            register(&registry, IntCounter::new(name, help)?)
        };
        let gauge = |name: &str, help: &str| -> prometheus::Result<IntGauge> {
            register(&registry, IntGauge::new(name, help)?)
        };

        let commands = register(
            &registry,
            IntCounterVec::new(
                Opts::new("arenacache_commands_total", "Total commands by name"),
                &["command"],
            )?,
        )?;

        let cmd_latency = register(
            &registry,
            Histogram::with_opts(
                HistogramOpts::new(
                    "arenacache_cmd_latency_seconds",
                    "Command latency in seconds",
                )
                .buckets(vec![
                    0.00001, 0.00005, 0.0001, 0.0005, 0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0,
                ]),
            )?,
        )?;

        Ok(Self {
            commands,
            get_hits: counter("arenacache_get_hits_total", "Total GET hits")?,
            get_misses: counter("arenacache_get_misses_total", "Total GET misses")?,
            active_connections: gauge("arenacache_active_connections", "Current active connections")?,
            total_connections: counter("arenacache_connections_total", "Total connections accepted")?,
            rejected_connections: counter(
                "arenacache_rejected_connections_total",
                "Total connections rejected",
            )?,
            bytes_read: counter("arenacache_bytes_read_total", "Total bytes read")?,
            bytes_written: counter("arenacache_bytes_written_total", "Total bytes written")?,
            cmd_latency,
            protocol_errors: counter("arenacache_protocol_errors_total", "Total protocol errors")?,
            storage_errors: counter("arenacache_storage_errors_total", "Total storage errors")?,
            curr_items: gauge("arenacache_curr_items", "Items currently stored")?,
            current_bytes: gauge("arenacache_current_bytes", "Bytes holding stored values")?,
            limit_maxbytes: gauge("arenacache_limit_maxbytes", "Bytes available for values")?,
            evictions: gauge("arenacache_evictions", "Items evicted to respect limits")?,
            registry,
        })
    }

    /// Record one executed command
    pub fn record_command(&self, name: &str) {
        self.commands.with_label_values(&[name]).inc();
    }

    /// Refresh the cache gauges
    pub fn observe_cache(&self, snapshot: CacheSnapshot) {
        self.curr_items.set(gauge_value(snapshot.curr_items));
        self.current_bytes.set(gauge_value(snapshot.current_bytes));
        self.limit_maxbytes.set(gauge_value(snapshot.limit_maxbytes));
        self.evictions.set(gauge_value(snapshot.evictions));
    }

    /// Add the connection-level entries to a `stats` response
    pub fn extend_stats(&self, stats: &mut Stats) {
        let mut put = |name: &str, value: u64| {
            stats.insert(name.to_string(), BTreeSet::from([value.to_string()]));
        };
        put(
            "curr_connections",
            u64::try_from(self.active_connections.get()).unwrap_or(0),
        );
        put("total_connections", self.total_connections.get());
        put("bytes_read", self.bytes_read.get());
        put("bytes_written", self.bytes_written.get());
    }

    /// Get Prometheus formatted metrics
    pub fn gather(&self) -> prometheus::Result<String> {
        use prometheus::Encoder;
        let encoder = prometheus::TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        encoder.encode(&metric_families, &mut buffer)?;
        Ok(String::from_utf8_lossy(&buffer).into_owned())
    }
}
