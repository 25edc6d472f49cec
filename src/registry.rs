//! Pool Registry / Scheduler: maps image reference -> Pool, routes requests to a pool lease or
//! the ephemeral (ungated) sandbox path, and owns startup warm-up and shutdown drain.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tracing::{info, warn};

use crate::config::Config;
use crate::engine::{ExecutionEngine, ExecutionRequest, ExecutionResult};
use crate::error::ExecutorError;
use crate::image::ImageResolver;
use crate::metrics::{Metrics, MetricsSnapshot, PoolMetrics};
use crate::pool::Pool;
use crate::sandbox::SandboxFactory;

pub struct PoolRegistry {
    pools: HashMap<String, Arc<Pool>>,
    /// Insertion-ordered list of distinct pools, for warm-up/drain/metrics iteration.
    distinct_pools: Vec<Arc<Pool>>,
    default_pool_key: String,
    resolver: Arc<ImageResolver>,
    factory: Arc<SandboxFactory>,
    engine: Arc<ExecutionEngine>,
    metrics: Arc<Metrics>,
    acquire_timeout: Duration,
}

impl PoolRegistry {
    /// Builds the default pool plus every `CUSTOM_POOLS` entry, registers each under both its
    /// raw and resolver-canonical key, pulls each pool's image, and starts background
    /// replenishment. Returns once registry membership is fixed — individual pools may still be
    /// below target size; acquires against them simply wait for replenishment to catch up.
    pub async fn bootstrap(
        config: &Config,
        resolver: Arc<ImageResolver>,
        factory: Arc<SandboxFactory>,
        engine: Arc<ExecutionEngine>,
        metrics: Arc<Metrics>,
    ) -> Result<Arc<Self>, ExecutorError> {
        let mut pools = HashMap::new();
        let mut distinct_pools = Vec::new();
        let mut canonical_seen = HashMap::new();

        let mut entries = vec![(config.base_image.clone(), config.pool_size)];
        entries.extend(config.custom_pools.iter().cloned());

        for (raw_image, size) in entries {
            let canonical = resolver.canonicalize(&raw_image)?;
            if let Some(existing) = canonical_seen.get(&canonical) {
                return Err(ExecutorError::Validation(format!(
                    "pool for '{raw_image}' duplicates already-registered pool '{existing}' (canonical '{canonical}')"
                )));
            }
            canonical_seen.insert(canonical.clone(), raw_image.clone());

            info!(image = %raw_image, canonical = %canonical, size, "resolving pool image");
            if let Err(err) = resolver.ensure(&canonical).await {
                warn!(image = %canonical, error = %err, "initial image pull failed, pool will retry during replenish");
            }

            let pool = Pool::new(raw_image.clone(), canonical.clone(), size, Arc::clone(&factory), Arc::clone(&metrics));
            pool.spawn_replenish_task();

            pools.insert(raw_image.clone(), Arc::clone(&pool));
            pools.insert(canonical, Arc::clone(&pool));
            distinct_pools.push(pool);
        }

        let default_pool_key = config.base_image.clone();
        let acquire_timeout = config.timeout;

        Ok(Arc::new(Self {
            pools,
            distinct_pools,
            default_pool_key,
            resolver,
            factory,
            engine,
            metrics,
            acquire_timeout,
        }))
    }

    /// Routes one request: leases from a matching pool if one exists, otherwise resolves/pulls
    /// the image and runs it in a single-use sandbox that is always destroyed afterward.
    pub async fn dispatch(&self, request: ExecutionRequest) -> ExecutionResult {
        if request.script.trim().is_empty() {
            return error_result(ExecutorError::Validation("script must not be empty".to_string()));
        }

        let image_key = request.image.clone().unwrap_or_else(|| self.default_pool_key.clone());

        let pool = self.pools.get(&image_key).cloned().or_else(|| {
            self.resolver
                .canonicalize(&image_key)
                .ok()
                .and_then(|canonical| self.pools.get(&canonical).cloned())
        });

        let result = match pool {
            Some(pool) => self.dispatch_pooled(pool, &request).await,
            None => self.dispatch_ephemeral(&image_key, &request).await,
        };

        self.metrics.record_execution(result.success, result.timed_out, duration_from_secs(result.execution_time));
        result
    }

    async fn dispatch_pooled(&self, pool: Arc<Pool>, request: &ExecutionRequest) -> ExecutionResult {
        let mut handle = match pool.acquire(self.acquire_timeout).await {
            Ok(handle) => handle,
            Err(err) => return error_result(err),
        };

        let result = self
            .engine
            .execute(&mut handle, &request.script, &request.stdin, self.acquire_timeout)
            .await;

        let clean = !handle.should_recycle();
        pool.release(handle, clean).await;
        result
    }

    async fn dispatch_ephemeral(&self, image_ref: &str, request: &ExecutionRequest) -> ExecutionResult {
        let canonical = match self.resolver.canonicalize(image_ref) {
            Ok(c) => c,
            Err(err) => return error_result(err),
        };
        if let Err(err) = self.resolver.ensure(&canonical).await {
            return error_result(err);
        }

        let mut handle = match self.factory.create(&canonical, None).await {
            Ok(handle) => handle,
            Err(err) => return error_result(err),
        };

        let result = self
            .engine
            .execute(&mut handle, &request.script, &request.stdin, self.acquire_timeout)
            .await;

        self.factory.destroy(&handle).await;
        result
    }

    pub async fn metrics_snapshot(&self) -> MetricsSnapshot {
        let mut pool_metrics = HashMap::new();
        let mut total_available = 0;
        for pool in &self.distinct_pools {
            let stats = pool.stats().await;
            total_available += stats.available_containers;
            pool_metrics.insert(
                pool.image().to_string(),
                PoolMetrics {
                    pool_size: stats.pool_size,
                    available_containers: stats.available_containers,
                    total_executions: stats.total_executions,
                },
            );
        }
        MetricsSnapshot {
            pools_active: self.distinct_pools.len(),
            total_available_containers: total_available,
            pool_metrics,
            counters: self.metrics.counters(),
        }
    }

    pub async fn drain_all(&self, grace: Duration) {
        let futures = self.distinct_pools.iter().map(|pool| pool.drain(grace));
        futures_util::future::join_all(futures).await;
    }
}

fn error_result(err: ExecutorError) -> ExecutionResult {
    ExecutionResult {
        success: false,
        stdout: String::new(),
        stderr: String::new(),
        exit_code: -1,
        execution_time: 0.0,
        error: Some(err.user_message()),
        timed_out: matches!(err, ExecutorError::ExecutionTimeout),
    }
}

fn duration_from_secs(secs: f64) -> Duration {
    Duration::from_secs_f64(secs.max(0.0))
}
