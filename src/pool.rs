//! Worker pool of page resources
//!
//! Bounds render concurrency, hides page creation cost, recycles workers
//! after `work_limit` renders, and reaps idle resources back down to
//! `min_workers`. Acquire order among waiters is FIFO: permits come from a
//! fair semaphore sized at `max_workers`, so a permit means either a free
//! resource exists or there is headroom to create one.

use crate::{AssetCache, BrowserSupervisor, ExportError, PageResource, PoolConfig};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, OwnedSemaphorePermit, Semaphore};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

/// Exclusive lease on one page resource, issued by [`WorkerPool::acquire`]
///
/// Leases normally return through [`WorkerPool::release`]. A lease dropped
/// mid-render (caller cancelled) takes the destroy path instead: the page
/// may hold a half-built chart and is never reused.
pub struct PageLease {
    resource: Option<PageResource>,
    pool: Weak<WorkerPool>,
    _permit: OwnedSemaphorePermit,
}

impl Drop for PageLease {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            resource.mark_unhealthy();
            if let Some(pool) = self.pool.upgrade() {
                tokio::spawn(async move {
                    pool.destroy_resource(resource).await;
                });
            }
        }
    }
}

impl PageLease {
    pub fn worker_id(&self) -> uuid::Uuid {
        self.resource.as_ref().map(|r| r.id).unwrap_or_default()
    }

    pub fn resource(&self) -> &PageResource {
        self.resource.as_ref().expect("lease already released")
    }

    /// Mark the leased page as corrupt; release will destroy it.
    pub fn mark_unhealthy(&self) {
        if let Some(resource) = &self.resource {
            resource.mark_unhealthy();
        }
    }
}

#[derive(Debug, Default)]
struct PoolCounters {
    created_total: AtomicUsize,
    destroyed_total: AtomicUsize,
    recycled: AtomicUsize,
    reaped: AtomicUsize,
}

/// Point-in-time view of the pool, for health checks and the CLI
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub alive: usize,
    pub free: usize,
    pub in_use: usize,
    pub created_total: usize,
    pub destroyed_total: usize,
    pub recycled: usize,
    pub reaped: usize,
}

pub struct WorkerPool {
    config: PoolConfig,
    supervisor: Arc<BrowserSupervisor>,
    assets: Arc<AssetCache>,
    free: Arc<Mutex<VecDeque<PageResource>>>,
    semaphore: Arc<Semaphore>,
    alive: Arc<AtomicUsize>,
    counters: Arc<PoolCounters>,
    shutting_down: Arc<AtomicBool>,
    reaper_task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl WorkerPool {
    /// Build the pool and eagerly create `min_workers` resources. Individual
    /// creation failures are logged and skipped; init only fails when the
    /// browser itself is unusable.
    pub async fn init(
        config: PoolConfig,
        supervisor: Arc<BrowserSupervisor>,
        assets: Arc<AssetCache>,
    ) -> Arc<Self> {
        let config = config.normalized();
        let pool = Arc::new(Self {
            semaphore: Arc::new(Semaphore::new(config.max_workers)),
            config,
            supervisor,
            assets,
            free: Arc::new(Mutex::new(VecDeque::new())),
            alive: Arc::new(AtomicUsize::new(0)),
            counters: Arc::new(PoolCounters::default()),
            shutting_down: Arc::new(AtomicBool::new(false)),
            reaper_task: Mutex::new(None),
        });

        let warmups: Vec<_> = (0..pool.config.min_workers)
            .map(|i| {
                let pool = pool.clone();
                tokio::spawn(async move {
                    match pool.create_resource().await {
                        Ok(resource) => {
                            pool.free.lock().await.push_back(resource);
                        }
                        Err(e) => {
                            warn!(slot = i, "Initial worker creation failed: {}", e);
                        }
                    }
                })
            })
            .collect();
        for warmup in warmups {
            let _ = warmup.await;
        }

        info!(
            workers = pool.alive.load(Ordering::Relaxed),
            min = pool.config.min_workers,
            max = pool.config.max_workers,
            "Worker pool initialized"
        );

        pool.start_reaper().await;
        pool
    }

    /// Acquire a page resource, FIFO among waiters, bounded by
    /// `acquire_timeout`.
    pub async fn acquire(self: &Arc<Self>) -> Result<PageLease, ExportError> {
        if self.shutting_down.load(Ordering::Relaxed) {
            return Err(ExportError::BrowserUnavailable);
        }

        let started = Instant::now();
        let permit = match timeout(
            self.config.acquire_timeout,
            self.semaphore.clone().acquire_owned(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => return Err(ExportError::BrowserUnavailable),
            Err(_) => return Err(ExportError::AcquireTimeout(self.config.acquire_timeout)),
        };

        let active_version = self.assets.current().await.version.clone();

        // Drain stale entries from the free set: unhealthy pages and pages
        // carrying a superseded bundle are destroyed, not reused.
        let resource = loop {
            let candidate = self.free.lock().await.pop_front();
            match candidate {
                Some(r) if r.is_healthy() && r.bundle_version == active_version => break Some(r),
                Some(r) => {
                    debug!(worker = %r.id, "Discarding stale pooled resource");
                    self.destroy_resource(r).await;
                }
                None => break None,
            }
        };

        let mut resource = match resource {
            Some(resource) => resource,
            None => self.create_with_retry().await?,
        };
        resource.mark_used();

        if self.config.benchmarking {
            debug!(
                worker = %resource.id,
                elapsed = ?started.elapsed(),
                work_count = resource.work_count,
                "Acquired worker"
            );
        }

        Ok(PageLease {
            resource: Some(resource),
            pool: Arc::downgrade(self),
            _permit: permit,
        })
    }

    /// Return a lease. Resources that have reached their work limit, are
    /// marked unhealthy, or fail their soft reset are destroyed; the rest
    /// go back to the free set.
    pub async fn release(&self, mut lease: PageLease) {
        let Some(mut resource) = lease.resource.take() else {
            return;
        };

        if self.shutting_down.load(Ordering::Relaxed) {
            self.destroy_resource(resource).await;
            return;
        }

        // work_count was incremented at acquire, so a resource returning
        // from its work_limit-th render is destroyed here, never reused.
        if resource.work_count >= self.config.work_limit {
            debug!(
                worker = %resource.id,
                work_count = resource.work_count,
                "Work limit reached, recycling worker"
            );
            self.counters.recycled.fetch_add(1, Ordering::Relaxed);
            self.destroy_resource(resource).await;
            return;
        }

        if !resource.is_healthy() {
            self.destroy_resource(resource).await;
            return;
        }

        match resource.soft_reset().await {
            Ok(()) => {
                resource.last_used_at = Instant::now();
                self.free.lock().await.push_back(resource);
            }
            Err(e) => {
                warn!(worker = %resource.id, "Soft reset failed, destroying: {}", e);
                self.destroy_resource(resource).await;
            }
        }
    }

    /// Force-destroy a lease without the release triage.
    pub async fn destroy(&self, mut lease: PageLease) {
        if let Some(resource) = lease.resource.take() {
            self.destroy_resource(resource).await;
        }
    }

    async fn destroy_resource(&self, resource: PageResource) {
        let id = resource.id;
        self.alive.fetch_sub(1, Ordering::Relaxed);
        self.counters.destroyed_total.fetch_add(1, Ordering::Relaxed);

        match timeout(self.config.destroy_timeout, resource.close()).await {
            Ok(()) => debug!(worker = %id, "Worker destroyed"),
            Err(_) => warn!(
                worker = %id,
                "Worker destroy exceeded {:?}, abandoning page",
                self.config.destroy_timeout
            ),
        }
    }

    async fn create_resource(&self) -> Result<PageResource, ExportError> {
        let bundle = self.assets.current().await;
        let page = self.supervisor.new_page().await?;
        let resource = match PageResource::new(page, &bundle).await {
            Ok(resource) => resource,
            Err(e) => return Err(e),
        };
        self.alive.fetch_add(1, Ordering::Relaxed);
        self.counters.created_total.fetch_add(1, Ordering::Relaxed);
        Ok(resource)
    }

    /// On-demand creation under an already-held permit, retried every
    /// `create_retry_interval` within the `create_timeout` budget. Exhaustion
    /// surfaces as `AcquireTimeout`: to the caller the pool simply had no
    /// worker to give.
    async fn create_with_retry(&self) -> Result<PageResource, ExportError> {
        let deadline = Instant::now() + self.config.create_timeout;
        let mut last_error: Option<ExportError> = None;

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match timeout(remaining, self.create_resource()).await {
                Ok(Ok(resource)) => return Ok(resource),
                Ok(Err(e)) => {
                    warn!("Worker creation failed, retrying: {}", e);
                    last_error = Some(e);
                }
                Err(_) => break,
            }
            if Instant::now() + self.config.create_retry_interval >= deadline {
                break;
            }
            sleep(self.config.create_retry_interval).await;
        }

        let detail = last_error
            .map(|e| e.to_string())
            .unwrap_or_else(|| "create budget exhausted".to_string());
        debug!("Worker creation budget exhausted: {}", detail);
        Err(ExportError::AcquireTimeout(self.config.create_timeout))
    }

    async fn start_reaper(self: &Arc<Self>) {
        let pool = self.clone();
        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(pool.config.reaper_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if pool.shutting_down.load(Ordering::Relaxed) {
                    break;
                }
                pool.reap_idle().await;
            }
        });
        *self.reaper_task.lock().await = Some(task);
    }

    /// Destroy free resources idle beyond `idle_timeout`, never dropping the
    /// pool below `min_workers` (in-use resources count toward the floor).
    async fn reap_idle(&self) {
        let mut victims = Vec::new();
        {
            let mut free = self.free.lock().await;
            let mut alive = self.alive.load(Ordering::Relaxed);
            let mut index = 0;
            while index < free.len() {
                if alive <= self.config.min_workers {
                    break;
                }
                if free[index].idle_time() > self.config.idle_timeout {
                    if let Some(resource) = free.remove(index) {
                        victims.push(resource);
                        alive -= 1;
                        continue;
                    }
                }
                index += 1;
            }
        }

        for resource in victims {
            debug!(worker = %resource.id, idle = ?resource.idle_time(), "Reaping idle worker");
            self.counters.reaped.fetch_add(1, Ordering::Relaxed);
            self.destroy_resource(resource).await;
        }
    }

    /// Drop all free resources. Used when the browser disconnected and the
    /// pooled tabs died with it; recreation happens lazily on acquire.
    pub async fn invalidate_free(&self) {
        let drained: Vec<_> = {
            let mut free = self.free.lock().await;
            free.drain(..).collect()
        };
        for resource in drained {
            self.destroy_resource(resource).await;
        }
    }

    /// Hard-reset all free resources onto the active bundle, keeping their
    /// tabs. In-flight renders finish on the bundle they started with; their
    /// pages are discarded by the stale-version check on the next acquire.
    pub async fn refresh_free(&self) {
        let bundle = self.assets.current().await;
        let drained: Vec<_> = {
            let mut free = self.free.lock().await;
            free.drain(..).collect()
        };

        for mut resource in drained {
            match resource.hard_reset(&bundle).await {
                Ok(()) => {
                    debug!(worker = %resource.id, version = %bundle.version, "Worker rebased");
                    self.free.lock().await.push_back(resource);
                }
                Err(e) => {
                    warn!(worker = %resource.id, "Hard reset failed, destroying: {}", e);
                    self.destroy_resource(resource).await;
                }
            }
        }
    }

    pub async fn shutdown(&self) {
        info!("Shutting down worker pool...");
        self.shutting_down.store(true, Ordering::Relaxed);

        if let Some(task) = self.reaper_task.lock().await.take() {
            task.abort();
        }

        // Give in-flight leases a moment to come back through release.
        let deadline = Instant::now() + self.config.destroy_timeout;
        while self.in_use() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(100)).await;
        }

        self.invalidate_free().await;
        self.semaphore.close();
        info!("Worker pool shutdown complete");
    }

    fn in_use(&self) -> usize {
        self.config
            .max_workers
            .saturating_sub(self.semaphore.available_permits())
    }

    pub async fn stats(&self) -> PoolStats {
        let free = self.free.lock().await.len();
        let alive = self.alive.load(Ordering::Relaxed);
        PoolStats {
            alive,
            free,
            in_use: alive.saturating_sub(free),
            created_total: self.counters.created_total.load(Ordering::Relaxed),
            destroyed_total: self.counters.destroyed_total.load(Ordering::Relaxed),
            recycled: self.counters.recycled.load(Ordering::Relaxed),
            reaped: self.counters.reaped.load(Ordering::Relaxed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pool_stats_shape() {
        let stats = PoolStats {
            alive: 4,
            free: 1,
            in_use: 3,
            created_total: 10,
            destroyed_total: 6,
            recycled: 4,
            reaped: 2,
        };
        assert_eq!(stats.alive - stats.free, stats.in_use);
    }

    #[test]
    fn test_counters_default_zero() {
        let counters = PoolCounters::default();
        assert_eq!(counters.created_total.load(Ordering::Relaxed), 0);
        assert_eq!(counters.recycled.load(Ordering::Relaxed), 0);
    }
}
