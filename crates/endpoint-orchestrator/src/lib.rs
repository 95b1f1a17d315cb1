//! Endpoint Orchestrator Service
//!
//! Control plane for model endpoints: lifecycle use cases guarded by a
//! per-endpoint mutation lock, a status reconciler, and batch-job CRUD,
//! exposed over a REST API.

pub mod batch_jobs;
pub mod config;
pub mod conflict_guard;
pub mod desired;
pub mod error;
pub mod gateway;
pub mod handlers;
pub mod memory;
pub mod mock_gateway;
pub mod models;
pub mod reconciler;
pub mod repository;
pub mod storage;
pub mod use_cases;
pub mod validation;

use axum::{
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

pub use batch_jobs::BatchJobUseCases;
pub use config::Config;
pub use conflict_guard::{ConflictGuard, InMemoryConflictGuard, RedisConflictGuard};
pub use error::UseCaseError;
pub use gateway::{HttpInfraGateway, InfraGateway, InfraObservation, InfraPhase};
pub use handlers::AppState;
pub use memory::{InMemoryBatchJobRepository, InMemoryBundleRepository, InMemoryEndpointRepository};
pub use mock_gateway::SimulatedInfraGateway;
pub use reconciler::Reconciler;
pub use repository::{BatchJobRepository, BundleRepository, EndpointRepository};
pub use storage::RedisStorage;
pub use use_cases::EndpointUseCases;

/// The pluggable collaborators the service is assembled from
#[derive(Clone)]
pub struct Components {
    pub endpoints: Arc<dyn EndpointRepository>,
    pub bundles: Arc<dyn BundleRepository>,
    pub batch_jobs: Arc<dyn BatchJobRepository>,
    pub gateway: Arc<dyn InfraGateway>,
    pub guard: Arc<dyn ConflictGuard>,
}

impl Components {
    pub fn app_state(&self) -> AppState {
        AppState {
            endpoints: EndpointUseCases::new(
                self.endpoints.clone(),
                self.bundles.clone(),
                self.gateway.clone(),
                self.guard.clone(),
            ),
            batch_jobs: BatchJobUseCases::new(self.batch_jobs.clone()),
        }
    }

    pub fn reconciler(&self, interval: Duration) -> Reconciler {
        Reconciler::new(
            self.endpoints.clone(),
            self.gateway.clone(),
            self.guard.clone(),
            interval,
        )
    }
}

/// Create the application router
pub fn create_router(state: AppState) -> Router {
    let shared_state = Arc::new(state);

    Router::new()
        .route("/health", get(handlers::health_handler))
        .route(
            "/v1/model-endpoints",
            post(handlers::create_endpoint_handler).get(handlers::list_endpoints_handler),
        )
        .route(
            "/v1/model-endpoints/{endpoint_id}",
            get(handlers::get_endpoint_handler)
                .put(handlers::update_endpoint_handler)
                .delete(handlers::delete_endpoint_handler),
        )
        .route(
            "/v1/batch-completions",
            post(handlers::create_batch_job_handler).get(handlers::list_batch_jobs_handler),
        )
        .route(
            "/v1/batch-completions/{job_id}",
            get(handlers::get_batch_job_handler),
        )
        .route(
            "/v1/batch-completions/{job_id}/cancel",
            post(handlers::cancel_batch_job_handler),
        )
        .route(
            "/v1/batch-completions/{job_id}/priority",
            put(handlers::update_batch_job_priority_handler),
        )
        .with_state(shared_state)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}
