//! Process-wide export statistics and performance instrumentation

use metrics::{Counter, Gauge, Histogram};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Monotonic export counters, shared by every dispatcher call
///
/// All counters are monotonic except through `reset()`. `spent_average()` is
/// derived from `time_spent` over `performed_exports`.
#[derive(Debug, Default)]
pub struct ExportStats {
    export_attempts: AtomicUsize,
    performed_exports: AtomicUsize,
    dropped_exports: AtomicUsize,
    export_from_svg_attempts: AtomicUsize,
    time_spent_ms: AtomicU64,
}

impl ExportStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_attempt(&self) {
        self.export_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_svg_attempt(&self) {
        self.export_from_svg_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self, elapsed: Duration) {
        self.performed_exports.fetch_add(1, Ordering::Relaxed);
        self.time_spent_ms
            .fetch_add(elapsed.as_millis() as u64, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.dropped_exports.fetch_add(1, Ordering::Relaxed);
    }

    pub fn export_attempts(&self) -> usize {
        self.export_attempts.load(Ordering::Relaxed)
    }

    pub fn performed_exports(&self) -> usize {
        self.performed_exports.load(Ordering::Relaxed)
    }

    pub fn dropped_exports(&self) -> usize {
        self.dropped_exports.load(Ordering::Relaxed)
    }

    pub fn export_from_svg_attempts(&self) -> usize {
        self.export_from_svg_attempts.load(Ordering::Relaxed)
    }

    pub fn time_spent(&self) -> Duration {
        Duration::from_millis(self.time_spent_ms.load(Ordering::Relaxed))
    }

    /// Mean wall-clock per successful export, in milliseconds.
    pub fn spent_average(&self) -> f64 {
        let performed = self.performed_exports.load(Ordering::Relaxed);
        if performed == 0 {
            return 0.0;
        }
        self.time_spent_ms.load(Ordering::Relaxed) as f64 / performed as f64
    }

    pub fn reset(&self) {
        self.export_attempts.store(0, Ordering::Relaxed);
        self.performed_exports.store(0, Ordering::Relaxed);
        self.dropped_exports.store(0, Ordering::Relaxed);
        self.export_from_svg_attempts.store(0, Ordering::Relaxed);
        self.time_spent_ms.store(0, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            export_attempts: self.export_attempts(),
            performed_exports: self.performed_exports(),
            dropped_exports: self.dropped_exports(),
            export_from_svg_attempts: self.export_from_svg_attempts(),
            time_spent: self.time_spent(),
            spent_average_ms: self.spent_average(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub export_attempts: usize,
    pub performed_exports: usize,
    pub dropped_exports: usize,
    pub export_from_svg_attempts: usize,
    pub time_spent: Duration,
    pub spent_average_ms: f64,
}

/// `metrics`-crate instruments published alongside the raw counters
pub struct Metrics {
    pub exports_performed: Counter,
    pub exports_dropped: Counter,
    pub export_duration: Histogram,
    pub pool_utilization: Gauge,
    pub pool_size: Gauge,
    pub workers_recycled: Counter,
    pub workers_reaped: Counter,
    pub browser_restarts: Counter,
    pub acquire_timeouts: Counter,
    pub rasterization_timeouts: Counter,
}

impl Metrics {
    pub fn new() -> Self {
        Self {
            exports_performed: Counter::noop(),
            exports_dropped: Counter::noop(),
            export_duration: Histogram::noop(),
            pool_utilization: Gauge::noop(),
            pool_size: Gauge::noop(),
            workers_recycled: Counter::noop(),
            workers_reaped: Counter::noop(),
            browser_restarts: Counter::noop(),
            acquire_timeouts: Counter::noop(),
            rasterization_timeouts: Counter::noop(),
        }
    }

    pub fn record_export(&self, duration: Duration, success: bool) {
        if success {
            self.exports_performed.increment(1);
        } else {
            self.exports_dropped.increment(1);
        }
        self.export_duration.record(duration.as_secs_f64());
    }

    pub fn record_pool_usage(&self, in_use: usize, total: usize) {
        self.pool_size.set(total as f64);
        if total > 0 {
            self.pool_utilization
                .set((in_use as f64 / total as f64) * 100.0);
        }
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Install the Prometheus recorder; call once at startup when monitoring
/// is enabled.
pub fn install_prometheus_recorder() -> Result<(), Box<dyn std::error::Error>> {
    let recorder = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();
    metrics::set_boxed_recorder(Box::new(recorder))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stats_accounting() {
        let stats = ExportStats::new();
        stats.record_attempt();
        stats.record_attempt();
        stats.record_success(Duration::from_millis(100));
        stats.record_failure();

        assert_eq!(stats.export_attempts(), 2);
        assert_eq!(stats.performed_exports(), 1);
        assert_eq!(stats.dropped_exports(), 1);
        assert_eq!(stats.time_spent(), Duration::from_millis(100));
    }

    #[test]
    fn test_spent_average() {
        let stats = ExportStats::new();
        assert_eq!(stats.spent_average(), 0.0);

        stats.record_success(Duration::from_millis(100));
        stats.record_success(Duration::from_millis(300));
        assert_eq!(stats.spent_average(), 200.0);
    }

    #[test]
    fn test_svg_attempts_tracked_separately() {
        let stats = ExportStats::new();
        stats.record_attempt();
        stats.record_svg_attempt();
        assert_eq!(stats.export_attempts(), 1);
        assert_eq!(stats.export_from_svg_attempts(), 1);
    }

    #[test]
    fn test_reset() {
        let stats = ExportStats::new();
        stats.record_attempt();
        stats.record_success(Duration::from_millis(50));
        stats.reset();

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.export_attempts, 0);
        assert_eq!(snapshot.performed_exports, 0);
        assert_eq!(snapshot.time_spent, Duration::ZERO);
        assert_eq!(snapshot.spent_average_ms, 0.0);
    }
}
