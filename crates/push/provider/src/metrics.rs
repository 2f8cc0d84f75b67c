//! Metrics sink collaborator.

/// Receives counters and gauges, e.g. a StatsD client.
pub trait MetricsSink: Send + Sync {
    /// Add `n` to the counter at `path`.
    fn increment(&self, path: &str, n: u64);

    /// Set the gauge at `path`.
    fn gauge(&self, path: &str, value: f64);
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopMetrics;

impl MetricsSink for NoopMetrics {
    fn increment(&self, _path: &str, _n: u64) {}

    fn gauge(&self, _path: &str, _value: f64) {}
}

/// Writes metrics as trace-level log events.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMetrics;

impl MetricsSink for TracingMetrics {
    fn increment(&self, path: &str, n: u64) {
        tracing::trace!(metric = path, n, "increment");
    }

    fn gauge(&self, path: &str, value: f64) {
        tracing::trace!(metric = path, value, "gauge");
    }
}
