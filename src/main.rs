use std::net::SocketAddr;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use execpool::config::Config;
use execpool::engine::ExecutionEngine;
use execpool::handler::{run_server, AppState};
use execpool::image::ImageResolver;
use execpool::metrics::Metrics;
use execpool::registry::PoolRegistry;
use execpool::runtime::{ContainerRuntime, RuntimeClient};
use execpool::sandbox::SandboxFactory;

const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::from_env().context("invalid configuration")?;

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_new(&config.log_level).unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    info!(
        pool_size = config.pool_size,
        base_image = %config.base_image,
        custom_pools = config.custom_pools.len(),
        host_port = config.host_port,
        "starting execpool"
    );

    let client: Arc<dyn ContainerRuntime> =
        Arc::new(RuntimeClient::connect().await.context("failed to connect to container runtime")?);
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

    let registry = PoolRegistry::bootstrap(&config, resolver, factory, engine, Arc::clone(&metrics))
        .await
        .context("failed to bootstrap pool registry")?;

    let state = Arc::new(AppState { registry: Arc::clone(&registry), shutting_down: AtomicBool::new(false) });
    let addr = SocketAddr::from(([0, 0, 0, 0], config.host_port));

    let server_state = Arc::clone(&state);
    let server = tokio::spawn(async move {
        if let Err(e) = run_server(addr, server_state).await {
            error!(error = %e, "http server exited with error");
        }
    });

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("received shutdown signal");
        }
        _ = terminate_signal() => {
            info!("received SIGTERM");
        }
    }

    state.shutting_down.store(true, std::sync::atomic::Ordering::Relaxed);
    // Cancels every in-flight `ExecutionEngine::execute` exec (SIGTERM->SIGKILL in-container,
    // handle tainted) before draining, so a script that outlives the grace period below doesn't
    // leave its container behind.
    let _ = shutdown_tx.send(true);
    info!("draining pools");
    registry.drain_all(SHUTDOWN_GRACE).await;
    server.abort();

    Ok(())
}

#[cfg(unix)]
async fn terminate_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut stream) => {
            stream.recv().await;
        }
        Err(_) => std::future::pending::<()>().await,
    }
}

#[cfg(not(unix))]
async fn terminate_signal() {
    std::future::pending::<()>().await
}
