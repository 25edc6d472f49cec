//! Image Resolver: canonicalizes image references and ensures the local runtime has the image
//! before a sandbox is created from it, deduplicating concurrent pulls of the same reference.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, warn};

use crate::error::ExecutorError;
use crate::metrics::Metrics;
use crate::runtime::ContainerRuntime;

const BACKOFF_BASE: Duration = Duration::from_secs(1);
const BACKOFF_FACTOR: u32 = 2;
const JITTER_FRACTION: f64 = 0.25;

pub struct ImageResolver {
    client: Arc<dyn ContainerRuntime>,
    default_registry: Option<String>,
    pull_timeout: Duration,
    pull_retries: u32,
    inflight: DashMap<String, Arc<AsyncMutex<()>>>,
    metrics: Arc<Metrics>,
}

impl ImageResolver {
    pub fn new(
        client: Arc<dyn ContainerRuntime>,
        default_registry: Option<String>,
        pull_timeout: Duration,
        pull_retries: u32,
        metrics: Arc<Metrics>,
    ) -> Self {
        Self {
            client,
            default_registry,
            pull_timeout,
            pull_retries,
            inflight: DashMap::new(),
            metrics,
        }
    }

    /// Applies the default registry prefix when `reference` is bare and a default is configured.
    /// Leaves registry-qualified references untouched.
    pub fn canonicalize(&self, reference: &str) -> Result<String, ExecutorError> {
        let reference = reference.trim();
        if reference.is_empty() {
            return Err(ExecutorError::Validation("image reference must not be empty".to_string()));
        }
        if has_registry_host(reference) {
            return Ok(reference.to_string());
        }
        match &self.default_registry {
            Some(registry) => Ok(format!("{registry}/{reference}")),
            None => Ok(reference.to_string()),
        }
    }

    /// Ensures the canonical reference is present locally, pulling it if necessary. Concurrent
    /// calls for the same reference share one underlying pull: the second caller blocks behind
    /// the first's mutex and then observes the image already present.
    pub async fn ensure(&self, canonical_ref: &str) -> Result<bool, ExecutorError> {
        let lock = self
            .inflight
            .entry(canonical_ref.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        if self.client.image_exists(canonical_ref).await? {
            return Ok(false);
        }

        self.pull_with_retry(canonical_ref).await?;
        Ok(true)
    }

    async fn pull_with_retry(&self, canonical_ref: &str) -> Result<(), ExecutorError> {
        let mut attempt = 0u32;
        let mut delay = BACKOFF_BASE;
        loop {
            attempt += 1;
            match self.client.pull_image(canonical_ref, self.pull_timeout).await {
                Ok(()) => {
                    self.metrics.record_image_pull(true);
                    debug!(image = canonical_ref, attempt, "image pull succeeded");
                    return Ok(());
                }
                Err(err @ ExecutorError::ImageResolve(_)) => {
                    self.metrics.record_image_pull(false);
                    return Err(err);
                }
                Err(err) => {
                    self.metrics.record_image_pull(false);
                    if attempt >= self.pull_retries {
                        warn!(image = canonical_ref, attempt, error = %err, "image pull exhausted retries");
                        return Err(err);
                    }
                    warn!(image = canonical_ref, attempt, error = %err, "image pull failed, retrying");
                    tokio::time::sleep(jittered(delay)).await;
                    delay = delay.saturating_mul(BACKOFF_FACTOR);
                }
            }
        }
    }
}

/// Applies up to +/-25% jitter to a backoff delay, so repeated callers don't retry in lockstep.
/// Draws its randomness from a fresh UUIDv4 (the same `uuid` dependency already used for
/// handle/work-dir ids) rather than from the delay value itself, which for this backoff schedule
/// (exact multiples of `BACKOFF_BASE`) never varies and would make the "jitter" deterministic.
fn jittered(delay: Duration) -> Duration {
    let bytes = uuid::Uuid::new_v4().into_bytes();
    let random = u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]);
    let spread = random as f64 / u32::MAX as f64; // uniform in [0, 1]
    let factor = 1.0 - JITTER_FRACTION + spread * (2.0 * JITTER_FRACTION);
    Duration::from_secs_f64(delay.as_secs_f64() * factor)
}

/// A reference carries an explicit registry host when it has at least one `/` and the segment
/// before the first `/` contains a `.` or `:`, or is literally `localhost` — matching the
/// heuristic real registries use to tell `library/ubuntu` (no registry) from
/// `registry.example.com/ubuntu` (explicit registry) apart.
fn has_registry_host(reference: &str) -> bool {
    match reference.split_once('/') {
        None => false,
        Some((first_segment, _)) => {
            first_segment == "localhost" || first_segment.contains('.') || first_segment.contains(':')
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_reference_has_no_registry_host() {
        assert!(!has_registry_host("alpine"));
        assert!(!has_registry_host("alpine:latest"));
        assert!(!has_registry_host("library/ubuntu"));
    }

    #[test]
    fn dotted_or_port_qualified_first_segment_is_a_registry_host() {
        assert!(has_registry_host("registry.example.com/ubuntu"));
        assert!(has_registry_host("host:5000/image"));
        assert!(has_registry_host("localhost/image"));
        assert!(has_registry_host("localhost:5000/image"));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        for _ in 0..50 {
            let base = Duration::from_secs(4);
            let j = jittered(base);
            assert!(j.as_secs_f64() >= base.as_secs_f64() * 0.75 - 0.001);
            assert!(j.as_secs_f64() <= base.as_secs_f64() * 1.25 + 0.001);
        }
    }

    #[test]
    fn jitter_actually_varies_across_calls() {
        let base = Duration::from_secs(4);
        let samples: std::collections::HashSet<_> = (0..20).map(|_| jittered(base).as_nanos()).collect();
        assert!(samples.len() > 1, "jitter should not be deterministic across calls");
    }
}
