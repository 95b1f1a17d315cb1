//! Endpoint Orchestrator Service
//!
//! REST API for managing model endpoints and batch completion jobs

use anyhow::{Context, Result};
use endpoint_common::ModelBundle;
use endpoint_orchestrator::{
    create_router, Components, Config, HttpInfraGateway, InMemoryBatchJobRepository,
    InMemoryBundleRepository, InMemoryConflictGuard, InMemoryEndpointRepository,
    RedisConflictGuard, RedisStorage, SimulatedInfraGateway,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "endpoint_orchestrator=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env().context("Failed to load configuration")?;

    info!("Starting Endpoint Orchestrator Service");
    info!("Mock mode: {}", config.mock_mode);
    info!("Listening on {}", config.api_address());

    let bundles = match &config.bundles_file {
        Some(path) => load_bundles(path).await?,
        None => Vec::new(),
    };

    let components = if config.mock_mode {
        warn!("Running with in-memory storage and simulated infrastructure");

        Components {
            endpoints: Arc::new(InMemoryEndpointRepository::new()),
            bundles: Arc::new(InMemoryBundleRepository::with_bundles(bundles)),
            batch_jobs: Arc::new(InMemoryBatchJobRepository::new()),
            gateway: Arc::new(SimulatedInfraGateway::new(Duration::from_millis(
                config.mock_convergence_ms,
            ))),
            guard: Arc::new(InMemoryConflictGuard::new(config.lock_lease())),
        }
    } else {
        info!("Redis URL: {}", config.redis_url);

        let storage = RedisStorage::new(&config.redis_url)
            .await
            .context("Failed to initialize storage")?;
        for bundle in &bundles {
            storage.put_bundle(bundle).await?;
        }

        // Checked by Config::validate
        let gateway_url = config
            .infra_gateway_url
            .clone()
            .context("INFRA_GATEWAY_URL is required when MOCK_MODE=false")?;
        info!("Infrastructure gateway: {}", gateway_url);

        let storage = Arc::new(storage);
        Components {
            endpoints: storage.clone(),
            bundles: storage.clone(),
            batch_jobs: storage.clone(),
            gateway: Arc::new(HttpInfraGateway::new(gateway_url)),
            guard: Arc::new(RedisConflictGuard::new(
                storage.connection(),
                config.lock_lease(),
            )),
        }
    };

    // Background status reconciler
    let shutdown = CancellationToken::new();
    let reconciler = components.reconciler(config.reconcile_interval());
    let reconciler_handle = tokio::spawn(reconciler.run(shutdown.clone()));

    let app = create_router(components.app_state());

    let addr = config.api_address();
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    info!("Endpoint Orchestrator Service running on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    shutdown.cancel();
    if let Err(e) = reconciler_handle.await {
        warn!("Reconciler task ended abnormally: {}", e);
    }

    info!("Endpoint Orchestrator Service stopped");
    Ok(())
}

/// Read a JSON array of model bundles
async fn load_bundles(path: &str) -> Result<Vec<ModelBundle>> {
    let data = tokio::fs::read_to_string(path)
        .await
        .with_context(|| format!("Failed to read bundles file {}", path))?;

    let bundles: Vec<ModelBundle> =
        serde_json::from_str(&data).context("Failed to parse bundles file")?;

    info!("Loaded {} model bundle(s) from {}", bundles.len(), path);
    Ok(bundles)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
