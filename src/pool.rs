//! Pool: a bounded, per-image set of pre-warmed sandbox handles.
//!
//! Idle handles and FIFO waiters share one mutex so a pop-from-idle and a waiter registration can
//! never race each other. A waiter is a one-shot handoff channel rather than a condition
//! variable: `Release` (or a successful background replenish) hands a handle straight to the
//! oldest waiter without it ever touching the idle queue, which is what gives exact FIFO
//! ordering among acquirers.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::{oneshot, Mutex, Notify};
use tracing::warn;

use crate::error::ExecutorError;
use crate::metrics::Metrics;
use crate::sandbox::{SandboxFactory, SandboxHandle};

const REPLENISH_IDLE_POLL: Duration = Duration::from_millis(500);
const REPLENISH_FAILURE_BACKOFF: Duration = Duration::from_secs(1);
const REPLENISH_PAUSE_AFTER_FAILURES: u32 = 3;
const REPLENISH_PAUSE_DURATION: Duration = Duration::from_secs(10);

#[derive(Default)]
struct PoolState {
    idle: VecDeque<SandboxHandle>,
    waiters: VecDeque<oneshot::Sender<SandboxHandle>>,
    in_flight: usize,
    draining: bool,
}

/// Hands `handle` to the oldest live waiter if one exists, otherwise stores it idle. Returns
/// `true` if it was handed off (the handle remains leased), `false` if it went idle.
fn place_or_queue(state: &mut PoolState, mut handle: SandboxHandle) -> bool {
    while let Some(tx) = state.waiters.pop_front() {
        match tx.send(handle) {
            Ok(()) => return true,
            Err(returned) => {
                handle = returned;
                continue;
            }
        }
    }
    state.idle.push_back(handle);
    false
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStats {
    pub pool_size: usize,
    pub available_containers: usize,
    pub in_flight: usize,
    pub total_executions: u64,
}

pub struct Pool {
    /// Opaque key used both as the map key in the registry and as `SandboxHandle.pool_key`.
    key: String,
    image: String,
    target_size: usize,
    state: Mutex<PoolState>,
    replenish_notify: Notify,
    factory: Arc<SandboxFactory>,
    metrics: Arc<Metrics>,
    created_total: AtomicU64,
    destroyed_total: AtomicU64,
    executions_total: AtomicU64,
}

impl Pool {
    pub fn new(
        key: impl Into<String>,
        image: impl Into<String>,
        target_size: usize,
        factory: Arc<SandboxFactory>,
        metrics: Arc<Metrics>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key: key.into(),
            image: image.into(),
            target_size,
            state: Mutex::new(PoolState::default()),
            replenish_notify: Notify::new(),
            factory,
            metrics,
            created_total: AtomicU64::new(0),
            destroyed_total: AtomicU64::new(0),
            executions_total: AtomicU64::new(0),
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    /// Spawns the background replenishment task. Idempotent to call once per pool at startup.
    pub fn spawn_replenish_task(self: &Arc<Self>) {
        let pool = Arc::clone(self);
        tokio::spawn(async move { pool.replenish_loop().await });
    }

    /// Leases an idle handle, waiting up to `timeout` if none is immediately available. Acquire
    /// never creates a container itself — it only ever hands out what replenishment already
    /// produced or what a prior release returned.
    pub async fn acquire(&self, timeout: Duration) -> Result<SandboxHandle, ExecutorError> {
        let receiver = {
            let mut state = self.state.lock().await;
            if state.draining {
                return Err(ExecutorError::ShuttingDown);
            }
            if let Some(handle) = state.idle.pop_front() {
                state.in_flight += 1;
                return Ok(handle);
            }
            let (tx, rx) = oneshot::channel();
            state.waiters.push_back(tx);
            rx
        };

        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(handle)) => Ok(handle),
            Ok(Err(_)) => Err(ExecutorError::ShuttingDown),
            Err(_) => {
                self.metrics.record_acquire_timeout();
                Err(ExecutorError::PoolExhausted { pool: self.key.clone() })
            }
        }
    }

    /// Returns a handle after use. `clean` handles go back to the oldest waiter (if any) or the
    /// idle queue; tainted handles are destroyed and a replenish pass is triggered.
    pub async fn release(&self, handle: SandboxHandle, clean: bool) {
        self.executions_total.fetch_add(1, Ordering::Relaxed);

        if !clean {
            {
                let mut state = self.state.lock().await;
                state.in_flight -= 1;
            }
            self.factory.destroy(&handle).await;
            self.destroyed_total.fetch_add(1, Ordering::Relaxed);
            self.replenish_notify.notify_one();
            return;
        }

        let mut state = self.state.lock().await;
        let handed_off = place_or_queue(&mut state, handle);
        if !handed_off {
            state.in_flight -= 1;
        }
    }

    pub async fn stats(&self) -> PoolStats {
        let state = self.state.lock().await;
        PoolStats {
            pool_size: self.target_size,
            available_containers: state.idle.len(),
            in_flight: state.in_flight,
            total_executions: self.executions_total.load(Ordering::Relaxed),
        }
    }

    /// Stops accepting new acquires, destroys idle handles immediately, then waits up to `grace`
    /// for in-flight handles to return before destroying whatever is left.
    pub async fn drain(&self, grace: Duration) {
        let idle_handles: Vec<SandboxHandle> = {
            let mut state = self.state.lock().await;
            state.draining = true;
            while let Some(tx) = state.waiters.pop_front() {
                drop(tx);
            }
            state.idle.drain(..).collect()
        };
        for handle in idle_handles {
            self.factory.destroy(&handle).await;
            self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        }

        let deadline = tokio::time::Instant::now() + grace;
        loop {
            let remaining = self.state.lock().await.in_flight;
            if remaining == 0 || tokio::time::Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }

        let leftover: Vec<SandboxHandle> = self.state.lock().await.idle.drain(..).collect();
        for handle in leftover {
            self.factory.destroy(&handle).await;
            self.destroyed_total.fetch_add(1, Ordering::Relaxed);
        }
    }

    async fn replenish_loop(self: Arc<Self>) {
        let mut consecutive_failures: u32 = 0;
        loop {
            let (need, draining) = {
                let state = self.state.lock().await;
                (
                    self.target_size.saturating_sub(state.idle.len() + state.in_flight),
                    state.draining,
                )
            };
            if draining {
                return;
            }
            if need == 0 {
                tokio::select! {
                    _ = self.replenish_notify.notified() => {}
                    _ = tokio::time::sleep(REPLENISH_IDLE_POLL) => {}
                }
                continue;
            }

            match self.factory.create(&self.image, Some(&self.key)).await {
                Ok(handle) => {
                    consecutive_failures = 0;
                    self.created_total.fetch_add(1, Ordering::Relaxed);
                    let mut state = self.state.lock().await;
                    if state.draining {
                        drop(state);
                        self.factory.destroy(&handle).await;
                        continue;
                    }
                    if place_or_queue(&mut state, handle) {
                        state.in_flight += 1;
                    }
                }
                Err(err) => {
                    consecutive_failures += 1;
                    warn!(pool = %self.key, image = %self.image, error = %err, "replenish create failed");
                    if consecutive_failures >= REPLENISH_PAUSE_AFTER_FAILURES {
                        warn!(pool = %self.key, "pausing replenishment after repeated failures");
                        tokio::time::sleep(REPLENISH_PAUSE_DURATION).await;
                        consecutive_failures = 0;
                    } else {
                        tokio::time::sleep(REPLENISH_FAILURE_BACKOFF).await;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn fake_handle(n: u32) -> SandboxHandle {
        SandboxHandle {
            container_id: format!("fake-{n}"),
            image: "alpine:latest".to_string(),
            created_at: Utc::now(),
            last_use: Utc::now(),
            exec_count: 0,
            tainted: false,
            pool_key: Some("test-pool".to_string()),
        }
    }

    /// Exercises the FIFO handoff state machine directly (no factory/replenish task involved),
    /// mirroring `Pool::acquire`/`Pool::release` exactly against a bare `PoolState`.
    struct StateHarness(Mutex<PoolState>);

    impl StateHarness {
        fn new() -> Self {
            Self(Mutex::new(PoolState::default()))
        }

        async fn acquire(&self, timeout: Duration) -> Result<SandboxHandle, ExecutorError> {
            let receiver = {
                let mut state = self.0.lock().await;
                if let Some(handle) = state.idle.pop_front() {
                    state.in_flight += 1;
                    return Ok(handle);
                }
                let (tx, rx) = oneshot::channel();
                state.waiters.push_back(tx);
                rx
            };
            match tokio::time::timeout(timeout, receiver).await {
                Ok(Ok(handle)) => Ok(handle),
                Ok(Err(_)) => Err(ExecutorError::ShuttingDown),
                Err(_) => Err(ExecutorError::PoolExhausted { pool: "test".to_string() }),
            }
        }

        async fn release(&self, handle: SandboxHandle) {
            let mut state = self.0.lock().await;
            let handed_off = place_or_queue(&mut state, handle);
            if !handed_off {
                state.in_flight -= 1;
            }
        }
    }

    #[tokio::test]
    async fn acquire_returns_idle_handle_immediately() {
        let harness = StateHarness::new();
        harness.0.lock().await.idle.push_back(fake_handle(1));
        let handle = harness.acquire(Duration::from_millis(50)).await.unwrap();
        assert_eq!(handle.container_id, "fake-1");
        assert_eq!(harness.0.lock().await.in_flight, 1);
    }

    #[tokio::test]
    async fn acquire_times_out_when_pool_empty() {
        let harness = StateHarness::new();
        let err = harness.acquire(Duration::from_millis(20)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn waiters_are_served_in_fifo_order() {
        let harness = Arc::new(StateHarness::new());

        let h1 = {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.acquire(Duration::from_secs(2)).await })
        };
        let h2 = {
            let harness = Arc::clone(&harness);
            tokio::spawn(async move { harness.acquire(Duration::from_secs(2)).await })
        };

        // give both tasks a chance to register as waiters before releasing anything
        tokio::task::yield_now().await;
        tokio::time::sleep(Duration::from_millis(20)).await;

        harness.release(fake_handle(1)).await;
        harness.release(fake_handle(2)).await;

        let first = h1.await.unwrap().unwrap();
        let second = h2.await.unwrap().unwrap();
        assert_eq!(first.container_id, "fake-1");
        assert_eq!(second.container_id, "fake-2");
    }

    #[tokio::test]
    async fn release_goes_idle_when_no_waiters() {
        let harness = StateHarness::new();
        harness.release(fake_handle(1)).await;
        let state = harness.0.lock().await;
        assert_eq!(state.idle.len(), 1);
        assert_eq!(state.in_flight, 0);
    }

    #[test]
    fn stale_waiter_is_skipped_by_place_or_queue() {
        // constructing state synchronously to test that a dropped receiver doesn't eat a handle
        let mut state = PoolState::default();
        let (tx, rx) = oneshot::channel::<SandboxHandle>();
        state.waiters.push_back(tx);
        drop(rx); // receiver gone before the handle arrives

        let handed_off = place_or_queue(&mut state, fake_handle(9));
        assert!(!handed_off);
        assert_eq!(state.idle.len(), 1);
    }
}
