//! Inference Forwarder Service
//!
//! HTTP forwarder placed in front of a model server.

use anyhow::{Context, Result};
use clap::Parser;
use inference_forwarder::{config::collect_overrides, create_router, AppState, ForwarderConfig};
use std::env;
use std::path::PathBuf;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "inference-forwarder")]
#[command(about = "Admission-controlled forwarder for model endpoints")]
struct Args {
    /// Path to the forwarder config file (YAML or JSON)
    #[arg(long)]
    config: PathBuf,

    /// Worker threads for the runtime
    #[arg(long, default_value_t = 1)]
    num_workers: usize,

    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    #[arg(long, default_value_t = 5000)]
    port: u16,

    /// Config override `key.path=value`, may be repeated
    #[arg(long = "set", value_name = "KEY=VALUE")]
    set: Vec<String>,

    /// Seconds to wait for background hook work at shutdown
    #[arg(long, default_value_t = 600)]
    graceful_timeout: u64,
}

fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "inference_forwarder=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load .env file if it exists (for local development)
    dotenvy::dotenv().ok();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .worker_threads(args.num_workers.max(1))
        .enable_all()
        .build()
        .context("Failed to build runtime")?;

    runtime.block_on(run(args))
}

async fn run(args: Args) -> Result<()> {
    let overrides = collect_overrides(&args.set, env::var("CONFIG_OVERRIDES").ok().as_deref());
    let mut config = ForwarderConfig::load(&args.config, &overrides)
        .context("Failed to load configuration")?;

    if let Ok(blob) = env::var("ENDPOINT_CONFIG") {
        config.endpoint_config = Some(blob);
    }

    info!("Starting Inference Forwarder");
    info!("Sync backend: {}", config.sync.predict_url());
    info!("Stream backend: {}", config.stream.predict_url());
    info!(
        "Max concurrency: {} (fail fast: {})",
        config.max_concurrency, config.fail_on_concurrency_limit
    );

    let state = AppState::from_config(&config)
        .await
        .context("Failed to initialize forwarder")?;
    let hooks = state.hooks.clone();
    if !hooks.hooks().is_empty() {
        info!("Post-inference hooks: {}", hooks.hooks().join(", "));
    }

    let app = create_router(state);

    let addr = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    info!("Inference Forwarder listening on http://{}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("Gracefully stopping http server");
    hooks.drain(Duration::from_secs(args.graceful_timeout)).await;

    info!("Inference Forwarder stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("Failed to listen for shutdown signal: {}", e);
        std::future::pending::<()>().await;
    }
    info!("Shutdown signal received");
}
