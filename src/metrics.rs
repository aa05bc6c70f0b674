//! Metrics Module - Prometheus Instrumentation
//!
//! One process-wide registry covering the index engine's own health
//! signals: throughput (levels processed, handler fires), and the
//! control-flow events that should be rare and worth alerting on (rollbacks,
//! reindex triggers). Follows the same lazy_static + prometheus registry
//! pattern as the rest of the ambient stack.

use prometheus::{
    Collector, Encoder, HistogramOpts, HistogramVec, IntCounterVec, Opts, Registry, TextEncoder,
};
use lazy_static::lazy_static;
use std::time::Instant;

const LATENCY_BUCKETS: &[f64] = &[0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 10.0, 30.0, 60.0];

lazy_static! {
    /// Global Prometheus registry.
    pub static ref REGISTRY: Registry = Registry::new();

    /// Levels committed per index. Labels: index, kind.
    pub static ref LEVELS_PROCESSED: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_levels_processed_total", "Total block levels committed, by index and kind"),
        &["index", "kind"]
    ).unwrap();

    /// Handler fires. Labels: index, callback.
    pub static ref HANDLER_FIRES: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_handler_fires_total", "Total handler invocations, by index and callback"),
        &["index", "callback"]
    ).unwrap();

    /// Single-level rollbacks armed or resolved. Labels: index, outcome (armed, reconciled, reindex).
    pub static ref ROLLBACKS: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_rollbacks_total", "Total single-level rollback events, by index and outcome"),
        &["index", "outcome"]
    ).unwrap();

    /// Reindex triggers. Labels: index, reason.
    pub static ref REINDEX_TRIGGERS: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_reindex_total", "Total reindex triggers, by index and reason"),
        &["index", "reason"]
    ).unwrap();

    /// Level-processing latency (fetch through commit). Labels: index.
    pub static ref LEVEL_PROCESS_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("indexer_level_process_duration_seconds", "Per-level processing latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["index"]
    ).unwrap();

    /// Datasource call latency. Labels: method.
    pub static ref DATASOURCE_CALL_DURATION: HistogramVec = HistogramVec::new(
        HistogramOpts::new("indexer_datasource_call_duration_seconds", "Datasource call latency")
            .buckets(LATENCY_BUCKETS.to_vec()),
        &["method"]
    ).unwrap();

    /// Handler / invalid-data errors. Labels: index, kind (handler, invalid_data).
    pub static ref INDEX_ERRORS: IntCounterVec = IntCounterVec::new(
        Opts::new("indexer_errors_total", "Errors surfaced while processing a level, by index and kind"),
        &["index", "kind"]
    ).unwrap();
}

/// Registers one collector with the global registry, tolerating a
/// `AlreadyReg` error so repeated calls (multiple tests in one process, or a
/// caller that re-inits defensively) stay idempotent rather than panicking.
fn register(collector: impl Collector + 'static) -> Result<(), Box<dyn std::error::Error>> {
    match REGISTRY.register(Box::new(collector)) {
        Ok(()) | Err(prometheus::Error::AlreadyReg) => Ok(()),
        Err(e) => Err(Box::new(e)),
    }
}

/// Registers all metrics with the global registry. Idempotent: safe to call
/// more than once in the same process.
pub fn init_metrics() -> Result<(), Box<dyn std::error::Error>> {
    register(LEVELS_PROCESSED.clone())?;
    register(HANDLER_FIRES.clone())?;
    register(ROLLBACKS.clone())?;
    register(REINDEX_TRIGGERS.clone())?;
    register(LEVEL_PROCESS_DURATION.clone())?;
    register(DATASOURCE_CALL_DURATION.clone())?;
    register(INDEX_ERRORS.clone())?;
    Ok(())
}

/// Gather metrics in Prometheus text format.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = REGISTRY.gather();
    let mut buffer = vec![];
    encoder.encode(&metric_families, &mut buffer).unwrap();
    String::from_utf8(buffer).unwrap()
}

/// Timer for measuring durations.
pub struct Timer {
    start: Instant,
}

impl Timer {
    pub fn new() -> Self {
        Self { start: Instant::now() }
    }

    pub fn elapsed_secs(&self) -> f64 {
        self.start.elapsed().as_secs_f64()
    }
}

impl Default for Timer {
    fn default() -> Self {
        Self::new()
    }
}

pub fn record_level_processed(index: &str, kind: &str) {
    LEVELS_PROCESSED.with_label_values(&[index, kind]).inc();
}

pub fn record_handler_fire(index: &str, callback: &str) {
    HANDLER_FIRES.with_label_values(&[index, callback]).inc();
}

pub fn record_rollback(index: &str, outcome: &str) {
    ROLLBACKS.with_label_values(&[index, outcome]).inc();
}

pub fn record_reindex(index: &str, reason: &str) {
    REINDEX_TRIGGERS.with_label_values(&[index, reason]).inc();
}

pub fn record_level_process_duration(index: &str, duration_secs: f64) {
    LEVEL_PROCESS_DURATION.with_label_values(&[index]).observe(duration_secs);
}

pub fn record_datasource_call_duration(method: &str, duration_secs: f64) {
    DATASOURCE_CALL_DURATION.with_label_values(&[method]).observe(duration_secs);
}

pub fn record_index_error(index: &str, kind: &str) {
    INDEX_ERRORS.with_label_values(&[index, kind]).inc();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_init_metrics() {
        init_metrics().unwrap();
    }

    #[test]
    fn test_gather_metrics() {
        init_metrics().unwrap();
        record_level_processed("test_index", "operation");
        record_handler_fire("test_index", "on_transfer");

        let output = gather_metrics();
        assert!(output.contains("indexer_levels_processed_total"));
        assert!(output.contains("indexer_handler_fires_total"));
    }

    #[test]
    fn test_timer() {
        let timer = Timer::new();
        std::thread::sleep(std::time::Duration::from_millis(10));
        assert!(timer.elapsed_secs() >= 0.01);
    }
}
