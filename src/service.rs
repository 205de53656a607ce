//! Export service: the single render entry point
//!
//! `ExportService` is the root object wiring the asset cache, browser
//! supervisor, and worker pool together. `export()` validates the request
//! before any page is acquired, runs the render protocol under an overall
//! deadline, routes the lease back through release or destroy, and keeps the
//! process-wide statistics current.

use crate::utils::find_private_address;
use crate::{
    render_on_lease, AssetCache, BrowserState, BrowserSupervisor, ExportConfig, ExportError,
    ExportRequest, ExportResult, ExportStats, Metrics, PoolStats, RenderPlan, StatsSnapshot,
    WorkerPool,
};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// Wall-clock granted on top of the rasterization deadline for viewport
/// setup, option installation, and export readback.
const SETUP_BUDGET: Duration = Duration::from_secs(3);

/// High-level chart export service with pooled browser pages
///
/// # Examples
///
/// ```rust,no_run
/// use chart_export_server::{ExportConfig, ExportRequest, ExportService};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let config = ExportConfig::default();
///     let service = ExportService::new(config).await?;
///
///     let request = ExportRequest {
///         options: Some(serde_json::json!({
///             "title": {"text": "Chart"},
///             "series": [{"data": [1, 2, 3]}]
///         })),
///         ..Default::default()
///     };
///     let result = service.export(request).await?;
///     println!("Exported {} ({})", result.data.len(), result.mime_type);
///
///     service.shutdown().await;
///     Ok(())
/// }
/// ```
pub struct ExportService {
    config: ExportConfig,
    assets: Arc<AssetCache>,
    supervisor: Arc<BrowserSupervisor>,
    pool: Arc<WorkerPool>,
    stats: Arc<ExportStats>,
    metrics: Arc<Metrics>,
}

impl ExportService {
    /// Assemble the asset bundle, launch the browser, and warm up the pool.
    pub async fn new(config: ExportConfig) -> Result<Self, ExportError> {
        config
            .validate()
            .map_err(ExportError::ConfigurationError)?;

        let assets = Arc::new(AssetCache::initialize(config.highcharts.clone()).await?);

        let supervisor = Arc::new(BrowserSupervisor::new(config.browser.clone()));
        supervisor.start().await?;

        let pool = WorkerPool::init(
            config.pool.clone(),
            supervisor.clone(),
            assets.clone(),
        )
        .await;

        let service = Self {
            config,
            assets,
            supervisor,
            pool,
            stats: Arc::new(ExportStats::new()),
            metrics: Arc::new(Metrics::new()),
        };
        service.watch_browser_state();
        Ok(service)
    }

    /// Invalidate pooled pages when the browser drops; their tabs are gone
    /// with the process and recreation happens lazily on the next acquire.
    fn watch_browser_state(&self) {
        let mut state_rx = self.supervisor.subscribe();
        let pool = self.pool.clone();
        let metrics = self.metrics.clone();

        tokio::spawn(async move {
            while state_rx.changed().await.is_ok() {
                let state = *state_rx.borrow();
                if state == BrowserState::Disconnected {
                    warn!("Browser disconnected, invalidating pooled pages");
                    metrics.browser_restarts.increment(1);
                    pool.invalidate_free().await;
                }
                if state == BrowserState::Closed {
                    break;
                }
            }
        });
    }

    /// Render one request to output bytes.
    pub async fn export(&self, request: ExportRequest) -> Result<ExportResult, ExportError> {
        let started = Instant::now();
        self.stats.record_attempt();

        let result = self.export_inner(&request, started).await;

        match &result {
            Ok(output) => {
                self.stats.record_success(output.elapsed);
                self.metrics.record_export(output.elapsed, true);
                debug!(
                    request = %request.request_id,
                    worker = %output.produced_by,
                    mime = output.mime_type,
                    elapsed = ?output.elapsed,
                    "Export complete"
                );
            }
            Err(e) => {
                self.stats.record_failure();
                self.metrics.record_export(started.elapsed(), false);
                match e {
                    ExportError::AcquireTimeout(_) => self.metrics.acquire_timeouts.increment(1),
                    ExportError::RasterizationTimeout(_) => {
                        self.metrics.rasterization_timeouts.increment(1)
                    }
                    _ => {}
                }
                warn!(request = %request.request_id, "Export failed: {}", e);
            }
        }

        let pool_stats = self.pool.stats().await;
        self.metrics
            .record_pool_usage(pool_stats.in_use, pool_stats.alive);

        result
    }

    async fn export_inner(
        &self,
        request: &ExportRequest,
        started: Instant,
    ) -> Result<ExportResult, ExportError> {
        // Everything that can be refused without a page is refused here.
        let plan = RenderPlan::from_request(request, &self.config.export)?;

        if let Some(svg) = &request.svg {
            self.stats.record_svg_attempt();
            if let Some(url) = find_private_address(svg) {
                return Err(ExportError::InvalidRenderInput(format!(
                    "svg references private address {url}"
                )));
            }
        }

        let lease = self.pool.acquire().await?;
        let produced_by = lease.worker_id();

        let deadline = plan.rasterization_timeout + SETUP_BUDGET;
        let outcome = match timeout(
            deadline,
            render_on_lease(&lease, request, &plan, self.config.browser.slow_mo),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => {
                // The protocol overran its whole budget; whatever state the
                // page is in, it does not come back into rotation.
                lease.mark_unhealthy();
                Err(ExportError::RasterizationTimeout(deadline))
            }
        };

        // Release in every path; the pool decides reset versus destroy.
        self.pool.release(lease).await;

        let outcome = outcome?;
        Ok(ExportResult {
            request_id: request.request_id.clone(),
            data: outcome.data,
            mime_type: outcome.mime_type,
            produced_by,
            elapsed: started.elapsed(),
        })
    }

    /// Re-pin the charting library and refresh the pool. Renders that
    /// started before the switch finish on the old bundle; renders that
    /// start after it see the new one.
    pub async fn update_version(&self, new_version: &str) -> Result<String, ExportError> {
        let bundle = self.assets.update_version(new_version).await?;
        self.pool.refresh_free().await;
        info!(version = %bundle.version, "Active library version updated");
        Ok(bundle.version.clone())
    }

    /// Version string of the active bundle.
    pub async fn active_version(&self) -> String {
        self.assets.current().await.version.clone()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn pool_stats(&self) -> PoolStats {
        self.pool.stats().await
    }

    pub async fn shutdown(&self) {
        info!("Shutting down export service...");
        self.pool.shutdown().await;
        self.supervisor.close().await;
        info!("Export service shutdown complete");
    }
}
