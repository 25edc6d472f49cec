//! End-to-end scenarios against a real Docker daemon. Ignored by default since they need one
//! running locally with network access to pull `alpine:latest`.
//!
//! Run with: cargo test --test live_docker_test -- --ignored --nocapture

use std::sync::Arc;
use std::time::Duration;

use execpool::config::Config;
use execpool::engine::{ExecutionEngine, ExecutionRequest};
use execpool::image::ImageResolver;
use execpool::metrics::Metrics;
use execpool::registry::PoolRegistry;
use execpool::runtime::{ContainerRuntime, RuntimeClient};
use execpool::sandbox::SandboxFactory;

async fn live_registry(base_image: &str, pool_size: usize) -> (Arc<PoolRegistry>, tokio::sync::watch::Sender<bool>) {
    std::env::set_var("BASE_IMAGE", base_image);
    std::env::set_var("POOL_SIZE", pool_size.to_string());
    std::env::set_var("CUSTOM_POOLS", "");
    let config = Config::from_env().expect("fixed test env parses");

    let client: Arc<dyn ContainerRuntime> =
        Arc::new(RuntimeClient::connect().await.expect("docker daemon must be reachable"));
    let metrics = Arc::new(Metrics::new());
    let resolver = Arc::new(ImageResolver::new(
        Arc::clone(&client),
        config.custom_image_registry.clone(),
        config.custom_image_pull_timeout,
        config.custom_image_pull_retries,
        Arc::clone(&metrics),
    ));
    let factory = Arc::new(SandboxFactory::new(Arc::clone(&client), Arc::new(config.clone()), Arc::clone(&metrics)));
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let engine = Arc::new(ExecutionEngine::new(Arc::clone(&client), shutdown_rx));

    let registry = PoolRegistry::bootstrap(&config, resolver, factory, engine, metrics)
        .await
        .expect("bootstrap against a live daemon");
    (registry, shutdown_tx)
}

fn request(script: &str) -> ExecutionRequest {
    serde_json::from_value(serde_json::json!({ "script": script })).unwrap()
}

#[tokio::test]
#[ignore]
async fn echo_hello_succeeds() {
    let (registry, _shutdown_tx) = live_registry("alpine:latest", 2).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let result = registry.dispatch(request("echo hello")).await;
    assert!(result.success);
    assert_eq!(result.stdout.trim(), "hello");
}

#[tokio::test]
#[ignore]
async fn cat_reads_from_stdin() {
    let (registry, _shutdown_tx) = live_registry("alpine:latest", 2).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let mut req = request("cat");
    req.stdin = "piped input\n".to_string();
    let result = registry.dispatch(req).await;
    assert!(result.success);
    assert_eq!(result.stdout, "piped input\n");
}

#[tokio::test]
#[ignore]
async fn sleeping_past_the_timeout_is_killed() {
    std::env::set_var("TIMEOUT", "1");
    let (registry, _shutdown_tx) = live_registry("alpine:latest", 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let result = registry.dispatch(request("sleep 10")).await;
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("execution timeout"));
}

#[tokio::test]
#[ignore]
async fn twenty_concurrent_echoes_against_a_pool_of_five() {
    let (registry, _shutdown_tx) = live_registry("alpine:latest", 5).await;
    tokio::time::sleep(Duration::from_secs(3)).await;

    let mut handles = Vec::new();
    for i in 0..20 {
        let registry = Arc::clone(&registry);
        handles.push(tokio::spawn(async move {
            registry.dispatch(request(&format!("echo {i}"))).await
        }));
    }
    for handle in handles {
        let result = handle.await.unwrap();
        assert!(result.success);
    }
}

#[tokio::test]
#[ignore]
async fn shutdown_during_execution_drains_cleanly() {
    let (registry, shutdown_tx) = live_registry("alpine:latest", 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let dispatcher = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.dispatch(request("sleep 2")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    let _ = shutdown_tx.send(true);
    registry.drain_all(Duration::from_secs(10)).await;

    let result = dispatcher.await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("execution canceled: service shutting down"));
    // the script sleeps for 2s; a correctly-canceled execution returns well before that elapses
    // instead of waiting out the script or the full drain grace.
    assert!(started.elapsed() < Duration::from_secs(2));
}

#[tokio::test]
#[ignore]
async fn long_running_script_outliving_shutdown_is_killed_before_drain_returns() {
    let (registry, shutdown_tx) = live_registry("alpine:latest", 1).await;
    tokio::time::sleep(Duration::from_secs(2)).await;

    let dispatcher = {
        let registry = Arc::clone(&registry);
        tokio::spawn(async move { registry.dispatch(request("sleep 999")).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;

    let started = std::time::Instant::now();
    let _ = shutdown_tx.send(true);
    registry.drain_all(Duration::from_secs(10)).await;
    let drain_elapsed = started.elapsed();

    let result = dispatcher.await.unwrap();
    assert!(!result.success);
    assert_eq!(result.error.as_deref(), Some("execution canceled: service shutting down"));
    // drain must not block for anywhere near the script's 999s runtime or the 10s grace.
    assert!(drain_elapsed < Duration::from_secs(5));
}
