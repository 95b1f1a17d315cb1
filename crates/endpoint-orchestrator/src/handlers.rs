//! API request handlers for the endpoint orchestrator

use axum::{
    extract::{FromRequestParts, Path, Query, State},
    http::{header, request::Parts, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use std::sync::Arc;
use tracing::{error, info};

use crate::batch_jobs::BatchJobUseCases;
use crate::error::UseCaseError;
use crate::models::{
    BatchJobResponse, CreateBatchJobRequest, CreateBatchJobResponse, CreateEndpointRequest,
    CreateEndpointResponse, DeleteEndpointResponse, GetEndpointResponse, ListBatchJobsResponse,
    ListEndpointsQuery, ListEndpointsResponse, UpdateBatchJobPriorityRequest,
    UpdateEndpointRequest, UpdateEndpointResponse,
};
use crate::use_cases::EndpointUseCases;

/// Header carrying the authenticated caller's identity
pub const OWNER_HEADER: &str = "x-owner-id";

/// Seconds clients should wait before retrying a conflicting mutation
const CONFLICT_RETRY_AFTER_SECS: u64 = 5;

/// Shared application state
pub struct AppState {
    pub endpoints: EndpointUseCases,
    pub batch_jobs: BatchJobUseCases,
}

/// API Error type
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub retry_after: Option<u64>,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": self.message,
            "code": self.code,
        });

        let mut response = (self.status, Json(body)).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<UseCaseError> for ApiError {
    fn from(err: UseCaseError) -> Self {
        let (status, retry_after) = match &err {
            UseCaseError::InvalidRequest(_) => (StatusCode::BAD_REQUEST, None),
            UseCaseError::NotFound(_) => (StatusCode::NOT_FOUND, None),
            UseCaseError::AlreadyExists(_) => (StatusCode::CONFLICT, None),
            UseCaseError::OperationInProgress(_) => {
                (StatusCode::CONFLICT, Some(CONFLICT_RETRY_AFTER_SECS))
            }
            UseCaseError::InfraStateNotFound(_) => {
                (StatusCode::SERVICE_UNAVAILABLE, Some(CONFLICT_RETRY_AFTER_SECS))
            }
            UseCaseError::DeleteFailed(_) | UseCaseError::Internal(_) => {
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        if status.is_server_error() {
            error!("Request failed: {:#}", err);
        }

        ApiError {
            status,
            code: err.code(),
            message: err.to_string(),
            retry_after,
        }
    }
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        UseCaseError::Internal(err).into()
    }
}

/// Caller identity taken from the owner header
#[derive(Debug, Clone)]
pub struct Owner(pub String);

impl<S> FromRequestParts<S> for Owner
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .headers
            .get(OWNER_HEADER)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .map(|v| Owner(v.to_string()))
            .ok_or(ApiError {
                status: StatusCode::UNAUTHORIZED,
                code: "unauthenticated",
                message: format!("Missing {} header", OWNER_HEADER),
                retry_after: None,
            })
    }
}

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "healthy",
        "service": "endpoint-orchestrator"
    }))
}

/// Create a model endpoint
pub async fn create_endpoint_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Json(payload): Json<CreateEndpointRequest>,
) -> Result<(StatusCode, Json<CreateEndpointResponse>), ApiError> {
    info!("Creating endpoint {} for {}", payload.name, owner);

    let response = state.endpoints.create(&owner, payload).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// List model endpoints
pub async fn list_endpoints_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Query(query): Query<ListEndpointsQuery>,
) -> Result<Json<ListEndpointsResponse>, ApiError> {
    let endpoints = state
        .endpoints
        .list(
            &owner,
            query.name.as_deref(),
            query.order_by.unwrap_or_default(),
        )
        .await?;

    Ok(Json(ListEndpointsResponse {
        model_endpoints: endpoints.into_iter().map(Into::into).collect(),
    }))
}

/// Get one model endpoint
pub async fn get_endpoint_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(endpoint_id): Path<String>,
) -> Result<Json<GetEndpointResponse>, ApiError> {
    let endpoint = state.endpoints.get(&owner, &endpoint_id).await?;
    Ok(Json(endpoint.into()))
}

/// Update a model endpoint
pub async fn update_endpoint_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(endpoint_id): Path<String>,
    Json(payload): Json<UpdateEndpointRequest>,
) -> Result<Json<UpdateEndpointResponse>, ApiError> {
    info!("Updating endpoint {} for {}", endpoint_id, owner);

    let response = state
        .endpoints
        .update(&owner, &endpoint_id, payload)
        .await?;
    Ok(Json(response))
}

/// Delete a model endpoint
pub async fn delete_endpoint_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(endpoint_id): Path<String>,
) -> Result<Json<DeleteEndpointResponse>, ApiError> {
    info!("Deleting endpoint {} for {}", endpoint_id, owner);

    let response = state.endpoints.delete(&owner, &endpoint_id).await?;
    Ok(Json(response))
}

/// Create a batch completions job
pub async fn create_batch_job_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Json(payload): Json<CreateBatchJobRequest>,
) -> Result<(StatusCode, Json<CreateBatchJobResponse>), ApiError> {
    let job_id = state.batch_jobs.create(&owner, payload).await?;
    Ok((StatusCode::CREATED, Json(CreateBatchJobResponse { job_id })))
}

/// List batch completions jobs
pub async fn list_batch_jobs_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
) -> Result<Json<ListBatchJobsResponse>, ApiError> {
    let jobs = state.batch_jobs.list(&owner).await?;
    let total = jobs.len();

    Ok(Json(ListBatchJobsResponse { jobs, total }))
}

/// Get a batch completions job
pub async fn get_batch_job_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> Result<Json<BatchJobResponse>, ApiError> {
    let job = state.batch_jobs.get(&owner, &job_id).await?;
    Ok(Json(BatchJobResponse { job }))
}

/// Cancel a batch completions job
pub async fn cancel_batch_job_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
) -> Result<Json<BatchJobResponse>, ApiError> {
    let job = state.batch_jobs.cancel(&owner, &job_id).await?;
    Ok(Json(BatchJobResponse { job }))
}

/// Change a batch job's priority
pub async fn update_batch_job_priority_handler(
    State(state): State<Arc<AppState>>,
    Owner(owner): Owner,
    Path(job_id): Path<String>,
    Json(payload): Json<UpdateBatchJobPriorityRequest>,
) -> Result<Json<BatchJobResponse>, ApiError> {
    let job = state
        .batch_jobs
        .update_priority(&owner, &job_id, payload.priority)
        .await?;
    Ok(Json(BatchJobResponse { job }))
}
