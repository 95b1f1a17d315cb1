//! Inference Forwarder
//!
//! Data plane sidecar placed in front of a model server. Every request passes
//! an admission limiter and is then forwarded to the backend, either awaiting
//! the full response or relaying the backend's event stream chunk by chunk.
//! Post-inference hooks run in the background once a request finishes.
//!
//! ## Endpoints
//!
//! - `GET /healthz`, `GET /readyz` - Liveness and readiness
//! - `POST /predict` - Sync forwarding
//! - `POST /stream` - Streaming forwarding (server-sent events)
//! - `POST <extra route>` - Sync or streaming, selected by `args.stream`

pub mod config;
pub mod error;
pub mod forwarder;
pub mod handlers;
pub mod hooks;
pub mod limiter;
pub mod router;

use anyhow::Result;
use axum::{
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;

pub use config::{ChannelConfig, ForwarderConfig, SharedLimiterConfig};
pub use error::ForwardError;
pub use forwarder::{PredictRequest, StreamingForwarder, SyncForwarder};
pub use handlers::AppState;
pub use hooks::{HookOutcome, PostInferenceHooks};
pub use limiter::{AdmissionLimiter, LimiterError, Permit};
pub use router::{Dispatch, RouteTable};

impl AppState {
    /// Assemble the forwarder from its configuration
    pub async fn from_config(config: &ForwarderConfig) -> Result<Self> {
        let client = reqwest::Client::new();

        let limiter = match &config.shared_limiter {
            Some(shared) => {
                info!("Using shared admission counter {}", shared.key);
                AdmissionLimiter::shared(
                    shared,
                    config.max_concurrency,
                    config.fail_on_concurrency_limit,
                )
                .await?
            }
            None => AdmissionLimiter::local(config.max_concurrency, config.fail_on_concurrency_limit),
        };

        let hooks = PostInferenceHooks::from_blob(config.endpoint_config.as_deref(), client.clone())?;

        Ok(Self {
            routes: RouteTable::from_config(config, &client),
            limiter,
            hooks,
        })
    }
}

/// Create the forwarder router
pub fn create_router(state: AppState) -> Router {
    let extra_routes: Vec<String> = state.routes.extra_routes().map(str::to_string).collect();
    let state = Arc::new(state);

    let mut router = Router::new()
        .route("/healthz", get(handlers::health_handler))
        .route("/readyz", get(handlers::health_handler))
        .route("/predict", post(handlers::predict_handler))
        .route("/stream", post(handlers::stream_handler));

    for route in extra_routes {
        info!("Adding route {}", route);
        router = router.route(&route, post(handlers::extra_route_handler));
    }

    router
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
