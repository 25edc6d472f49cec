//! Metrics Aggregator: process-wide counters plus a live snapshot of per-pool gauges.
//!
//! Counters are plain atomics so recording them never blocks a request's hot path. Per-pool
//! gauges are not stored here — they're queried live from the [`crate::registry::PoolRegistry`]
//! at snapshot time, since a pool's idle/in-flight counts are already a self-contained, per-pool
//! state owned by the pool itself.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::Serialize;

#[derive(Default)]
pub struct Metrics {
    executions_total: AtomicU64,
    executions_success: AtomicU64,
    executions_failed: AtomicU64,
    executions_timeout: AtomicU64,
    containers_created: AtomicU64,
    containers_destroyed: AtomicU64,
    image_pulls: AtomicU64,
    image_pull_failures: AtomicU64,
    pool_acquire_timeouts: AtomicU64,
    execution_time_sum_millis: AtomicU64,
    execution_time_count: AtomicU64,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_execution(&self, success: bool, timed_out: bool, duration: std::time::Duration) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);
        if success {
            self.executions_success.fetch_add(1, Ordering::Relaxed);
        } else {
            self.executions_failed.fetch_add(1, Ordering::Relaxed);
        }
        if timed_out {
            self.executions_timeout.fetch_add(1, Ordering::Relaxed);
        }
        self.execution_time_sum_millis
            .fetch_add(duration.as_millis() as u64, Ordering::Relaxed);
        self.execution_time_count.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_container_created(&self) {
        self.containers_created.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_container_destroyed(&self) {
        self.containers_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_image_pull(&self, success: bool) {
        self.image_pulls.fetch_add(1, Ordering::Relaxed);
        if !success {
            self.image_pull_failures.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn record_acquire_timeout(&self) {
        self.pool_acquire_timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn counters(&self) -> GlobalCounters {
        let count = self.execution_time_count.load(Ordering::Relaxed);
        let sum_millis = self.execution_time_sum_millis.load(Ordering::Relaxed);
        let avg_execution_time_secs = if count > 0 {
            (sum_millis as f64 / count as f64) / 1000.0
        } else {
            0.0
        };
        GlobalCounters {
            executions_total: self.executions_total.load(Ordering::Relaxed),
            executions_success: self.executions_success.load(Ordering::Relaxed),
            executions_failed: self.executions_failed.load(Ordering::Relaxed),
            executions_timeout: self.executions_timeout.load(Ordering::Relaxed),
            containers_created: self.containers_created.load(Ordering::Relaxed),
            containers_destroyed: self.containers_destroyed.load(Ordering::Relaxed),
            image_pulls: self.image_pulls.load(Ordering::Relaxed),
            image_pull_failures: self.image_pull_failures.load(Ordering::Relaxed),
            pool_acquire_timeouts: self.pool_acquire_timeouts.load(Ordering::Relaxed),
            avg_execution_time_secs,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct GlobalCounters {
    pub executions_total: u64,
    pub executions_success: u64,
    pub executions_failed: u64,
    pub executions_timeout: u64,
    pub containers_created: u64,
    pub containers_destroyed: u64,
    pub image_pulls: u64,
    pub image_pull_failures: u64,
    pub pool_acquire_timeouts: u64,
    pub avg_execution_time_secs: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolMetrics {
    pub pool_size: usize,
    pub available_containers: usize,
    pub total_executions: u64,
}

#[derive(Debug, Serialize)]
pub struct MetricsSnapshot {
    pub pools_active: usize,
    pub total_available_containers: usize,
    pub pool_metrics: std::collections::HashMap<String, PoolMetrics>,
    #[serde(flatten)]
    pub counters: GlobalCounters,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn records_and_snapshots_counters() {
        let metrics = Metrics::new();
        metrics.record_execution(true, false, Duration::from_millis(200));
        metrics.record_execution(false, true, Duration::from_millis(400));
        metrics.record_container_created();
        metrics.record_container_destroyed();
        metrics.record_image_pull(true);
        metrics.record_image_pull(false);
        metrics.record_acquire_timeout();

        let counters = metrics.counters();
        assert_eq!(counters.executions_total, 2);
        assert_eq!(counters.executions_success, 1);
        assert_eq!(counters.executions_failed, 1);
        assert_eq!(counters.executions_timeout, 1);
        assert_eq!(counters.containers_created, 1);
        assert_eq!(counters.containers_destroyed, 1);
        assert_eq!(counters.image_pulls, 2);
        assert_eq!(counters.image_pull_failures, 1);
        assert_eq!(counters.pool_acquire_timeouts, 1);
        assert!((counters.avg_execution_time_secs - 0.3).abs() < 1e-9);
    }
}
