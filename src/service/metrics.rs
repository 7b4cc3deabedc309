//! Minimal metrics emission helpers.
//!
//! Emissions go through tracing by default (target `metrics`); a test sink
//! can be installed to capture them in unit tests.

use std::sync::{Arc, RwLock};
use std::time::Duration;

use super::worker::WorkerStats;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MetricValue {
    Counter(u64),
    Gauge(u64),
    Histogram(u64),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MetricEvent {
    pub name: &'static str,
    pub value: MetricValue,
}

pub trait MetricSink: Send + Sync {
    fn record(&self, event: MetricEvent);
}

struct TracingSink;

impl MetricSink for TracingSink {
    fn record(&self, event: MetricEvent) {
        match event.value {
            MetricValue::Counter(value) | MetricValue::Gauge(value) | MetricValue::Histogram(value) => {
                tracing::info!(target: "metrics", metric = event.name, value);
            }
        }
    }
}

static METRIC_SINK: std::sync::OnceLock<RwLock<Arc<dyn MetricSink>>> = std::sync::OnceLock::new();

fn sink() -> Arc<dyn MetricSink> {
    METRIC_SINK
        .get_or_init(|| RwLock::new(Arc::new(TracingSink)))
        .read()
        .expect("metrics sink lock poisoned")
        .clone()
}

pub fn set_sink(new_sink: Arc<dyn MetricSink>) {
    let lock = METRIC_SINK.get_or_init(|| RwLock::new(Arc::new(TracingSink)));
    *lock.write().expect("metrics sink lock poisoned") = new_sink;
}

fn emit(name: &'static str, value: MetricValue) {
    sink().record(MetricEvent { name, value });
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

pub fn heartbeat_ok(duration: Duration) {
    emit("heartbeat_ok", MetricValue::Counter(1));
    emit(
        "heartbeat_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

pub fn heartbeat_err() {
    emit("heartbeat_err", MetricValue::Counter(1));
}

pub fn time_sync_err() {
    emit("time_sync_err", MetricValue::Counter(1));
}

pub fn broadcast_ok(duration: Duration) {
    emit("broadcast_ok", MetricValue::Counter(1));
    emit(
        "broadcast_duration",
        MetricValue::Histogram(duration_ms(duration)),
    );
}

/// Report cluster-wide worker totals collected by the stats timer.
pub fn report_worker_totals(totals: &WorkerStats) {
    emit("batches_issued", MetricValue::Gauge(totals.batches_issued));
    emit(
        "timestamps_issued",
        MetricValue::Gauge(totals.timestamps_issued),
    );
    emit(
        "rejected_not_ready",
        MetricValue::Gauge(totals.rejected_not_ready),
    );
    emit(
        "control_updates",
        MetricValue::Gauge(totals.control_updates),
    );
}
