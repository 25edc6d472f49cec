//! Sandbox Factory and the Sandbox Handle it produces.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::warn;

use crate::config::Config;
use crate::error::ExecutorError;
use crate::metrics::Metrics;
use crate::runtime::{ContainerRuntime, ContainerSpec, ContainerState};

const START_POLL_INTERVAL: Duration = Duration::from_millis(100);
const START_POLL_DEADLINE: Duration = Duration::from_secs(3);
const MAX_EXECUTIONS_BEFORE_RECYCLE: u32 = 100;

/// One runtime container owned by the scheduler. A handle in a pool's idle set is always
/// running and clean; a leased handle is exclusively owned by the execution holding it.
#[derive(Debug, Clone)]
pub struct SandboxHandle {
    pub container_id: String,
    pub image: String,
    pub created_at: DateTime<Utc>,
    pub last_use: DateTime<Utc>,
    pub exec_count: u32,
    pub tainted: bool,
    /// Opaque id of the owning pool. `None` for ephemeral, single-use handles.
    pub pool_key: Option<String>,
}

impl SandboxHandle {
    pub fn should_recycle(&self) -> bool {
        self.tainted || self.exec_count >= MAX_EXECUTIONS_BEFORE_RECYCLE
    }
}

pub struct SandboxFactory {
    client: Arc<dyn ContainerRuntime>,
    config: Arc<Config>,
    metrics: Arc<Metrics>,
}

impl SandboxFactory {
    pub fn new(client: Arc<dyn ContainerRuntime>, config: Arc<Config>, metrics: Arc<Metrics>) -> Self {
        Self { client, config, metrics }
    }

    /// Creates, starts, and waits for a fresh container to report "running". Assumes the image
    /// is already present locally — callers resolve/pull via the Image Resolver first.
    pub async fn create(&self, image: &str, pool_key: Option<&str>) -> Result<SandboxHandle, ExecutorError> {
        let nano_cpus = (self.config.cpu_limit * 1_000_000_000.0) as i64;
        let mut labels = HashMap::new();
        labels.insert("execpool.managed".to_string(), "true".to_string());
        if let Some(key) = pool_key {
            labels.insert("execpool.pool".to_string(), key.to_string());
        }

        let spec = ContainerSpec {
            image: image.to_string(),
            memory_bytes: self.config.memory_limit_bytes,
            nano_cpus,
            labels,
        };

        let container_id = self.client.create_container(&spec).await?;

        if let Err(err) = self.client.start_container(&container_id).await {
            let _ = self.client.remove_container(&container_id, true).await;
            return Err(err);
        }

        if let Err(err) = self.wait_until_running(&container_id).await {
            let _ = self.client.remove_container(&container_id, true).await;
            return Err(err);
        }

        self.metrics.record_container_created();
        let now = Utc::now();
        Ok(SandboxHandle {
            container_id,
            image: image.to_string(),
            created_at: now,
            last_use: now,
            exec_count: 0,
            tainted: false,
            pool_key: pool_key.map(|s| s.to_string()),
        })
    }

    async fn wait_until_running(&self, container_id: &str) -> Result<(), ExecutorError> {
        let deadline = tokio::time::Instant::now() + START_POLL_DEADLINE;
        loop {
            match self.client.inspect_state(container_id).await? {
                ContainerState::Running => return Ok(()),
                ContainerState::Missing => {
                    return Err(ExecutorError::SandboxCreation(
                        "container disappeared before reporting running".to_string(),
                    ));
                }
                ContainerState::Exited => {
                    if tokio::time::Instant::now() >= deadline {
                        return Err(ExecutorError::SandboxCreation(
                            "container did not reach running state before deadline".to_string(),
                        ));
                    }
                    tokio::time::sleep(START_POLL_INTERVAL).await;
                }
            }
        }
    }

    /// Destroys a handle unconditionally; used both for tainted releases and for ephemeral
    /// (non-pooled) sandboxes once their single execution completes.
    pub async fn destroy(&self, handle: &SandboxHandle) {
        if let Err(err) = self.client.stop_container(&handle.container_id, Duration::from_secs(2)).await {
            warn!(container_id = %handle.container_id, error = %err, "stop_container failed during destroy");
        }
        if let Err(err) = self.client.remove_container(&handle.container_id, true).await {
            warn!(container_id = %handle.container_id, error = %err, "remove_container failed during destroy");
        }
        self.metrics.record_container_destroyed();
    }
}
