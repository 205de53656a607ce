use crate::{ExportService, PoolStats, StatsSnapshot};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::interval;
use tracing::{error, info, warn};

/// Thresholds the health checker evaluates the service against
#[derive(Debug, Clone)]
pub struct HealthThresholds {
    /// Minimum free-or-creatable workers before the pool counts as starved
    pub min_available_workers: usize,
    /// Dropped/attempted ratio above which exports count as degraded
    pub max_drop_rate: f64,
    /// Mean export duration above which throughput counts as degraded
    pub max_average_duration: Duration,
}

impl Default for HealthThresholds {
    fn default() -> Self {
        Self {
            min_available_workers: 1,
            max_drop_rate: 0.1,
            max_average_duration: Duration::from_secs(10),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum HealthLevel {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone)]
pub struct HealthStatus {
    pub overall: HealthLevel,
    pub pool: HealthLevel,
    pub exports: HealthLevel,
    pub pool_stats: PoolStats,
    pub export_stats: StatsSnapshot,
    pub timestamp: std::time::SystemTime,
}

/// Periodic health evaluation over the pool and export statistics
pub struct HealthMonitor {
    service: Arc<ExportService>,
    thresholds: HealthThresholds,
}

impl HealthMonitor {
    pub fn new(service: Arc<ExportService>) -> Self {
        Self {
            service,
            thresholds: HealthThresholds::default(),
        }
    }

    pub fn with_thresholds(service: Arc<ExportService>, thresholds: HealthThresholds) -> Self {
        Self {
            service,
            thresholds,
        }
    }

    pub async fn check(&self) -> HealthStatus {
        let pool_stats = self.service.pool_stats().await;
        let export_stats = self.service.stats();

        let pool = self.check_pool(&pool_stats);
        let exports = self.check_exports(&export_stats);

        let overall = if pool == HealthLevel::Critical || exports == HealthLevel::Critical {
            HealthLevel::Critical
        } else if pool == HealthLevel::Warning || exports == HealthLevel::Warning {
            HealthLevel::Warning
        } else {
            HealthLevel::Healthy
        };

        HealthStatus {
            overall,
            pool,
            exports,
            pool_stats,
            export_stats,
            timestamp: std::time::SystemTime::now(),
        }
    }

    fn check_pool(&self, stats: &PoolStats) -> HealthLevel {
        if stats.alive == 0 {
            error!("Pool health critical: no live workers");
            return HealthLevel::Critical;
        }

        let available = stats.alive.saturating_sub(stats.in_use);
        if available < self.thresholds.min_available_workers {
            warn!(
                "Pool health warning: {} workers available, threshold {}",
                available, self.thresholds.min_available_workers
            );
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    fn check_exports(&self, stats: &StatsSnapshot) -> HealthLevel {
        if stats.export_attempts == 0 {
            return HealthLevel::Healthy;
        }

        let drop_rate = stats.dropped_exports as f64 / stats.export_attempts as f64;
        if drop_rate > 0.5 {
            error!(
                "Export health critical: drop rate {:.1}%",
                drop_rate * 100.0
            );
            return HealthLevel::Critical;
        }
        if drop_rate > self.thresholds.max_drop_rate {
            warn!("Export health warning: drop rate {:.1}%", drop_rate * 100.0);
            return HealthLevel::Warning;
        }

        if stats.spent_average_ms > self.thresholds.max_average_duration.as_millis() as f64 {
            warn!(
                "Export health warning: average duration {:.0}ms",
                stats.spent_average_ms
            );
            return HealthLevel::Warning;
        }

        HealthLevel::Healthy
    }

    /// Run checks forever at the given cadence, logging transitions.
    pub async fn run(&self, period: Duration) {
        let mut ticker = interval(period);
        loop {
            ticker.tick().await;
            let status = self.check().await;
            match status.overall {
                HealthLevel::Healthy => info!("System health: OK"),
                HealthLevel::Warning => warn!(
                    "System health: WARNING - pool: {:?}, exports: {:?}",
                    status.pool, status.exports
                ),
                HealthLevel::Critical => error!(
                    "System health: CRITICAL - pool: {:?}, exports: {:?}",
                    status.pool, status.exports
                ),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thresholds_default() {
        let thresholds = HealthThresholds::default();
        assert_eq!(thresholds.min_available_workers, 1);
        assert!(thresholds.max_drop_rate > 0.0);
    }
}
