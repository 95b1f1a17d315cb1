//! Data-plane request handlers

use axum::{
    body::{Body, Bytes},
    extract::{MatchedPath, State},
    http::{header, HeaderValue, StatusCode},
    response::{
        sse::{Event, KeepAlive, Sse},
        IntoResponse, Response,
    },
    Json,
};
use futures::stream::{self, Stream, StreamExt};
use serde_json::json;
use std::convert::Infallible;
use std::sync::Arc;
use tracing::{debug, error, warn};

use crate::error::ForwardError;
use crate::forwarder::{ChunkStream, PredictRequest, StreamingForwarder, SyncForwarder};
use crate::hooks::{HookGuard, HookOutcome, PostInferenceHooks};
use crate::limiter::{AdmissionLimiter, LimiterError, Permit};
use crate::router::{Dispatch, RouteTable};

/// Seconds a saturated caller should wait before retrying
pub const SATURATION_RETRY_AFTER_SECS: u64 = 1;

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub routes: RouteTable,
    pub limiter: AdmissionLimiter,
    pub hooks: PostInferenceHooks,
}

/// API error type
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    retry_after: Option<u64>,
}

impl ApiError {
    fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            retry_after: None,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "code": self.code,
        }));

        let mut response = (self.status, body).into_response();
        if let Some(secs) = self.retry_after {
            response
                .headers_mut()
                .insert(header::RETRY_AFTER, HeaderValue::from(secs));
        }
        response
    }
}

impl From<ForwardError> for ApiError {
    fn from(err: ForwardError) -> Self {
        let message = err.to_string();
        match err {
            ForwardError::Decode(_) | ForwardError::MissingArgs => {
                ApiError::new(StatusCode::BAD_REQUEST, "invalid_request", message)
            }
            ForwardError::NoForwarder { .. } => {
                ApiError::new(StatusCode::BAD_REQUEST, "no_forwarder", message)
            }
            ForwardError::Admission(LimiterError::Saturated(_)) => ApiError {
                retry_after: Some(SATURATION_RETRY_AFTER_SECS),
                ..ApiError::new(StatusCode::TOO_MANY_REQUESTS, "saturated", message)
            },
            ForwardError::Admission(_) => {
                error!("Admission limiter failure: {}", message);
                ApiError::new(StatusCode::SERVICE_UNAVAILABLE, "limiter_unavailable", message)
            }
            ForwardError::Transport(_)
            | ForwardError::Backend { .. }
            | ForwardError::BadResponse(_) => {
                ApiError::new(StatusCode::BAD_GATEWAY, "backend_error", message)
            }
        }
    }
}

impl From<LimiterError> for ApiError {
    fn from(err: LimiterError) -> Self {
        ForwardError::from(err).into()
    }
}

/// Liveness and readiness check
pub async fn health_handler() -> Json<&'static str> {
    Json("OK")
}

/// `POST /predict`
pub async fn predict_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let permit = state.limiter.acquire().await?;
    let request = decode_payload(&body)?;

    let response = forward_sync(&state, &state.routes.predict(), &request).await;
    drop(permit);
    response
}

/// `POST /stream`
pub async fn stream_handler(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<Response, ApiError> {
    let permit = state.limiter.acquire().await?;
    let request = decode_payload(&body)?;
    debug!("Received streaming request: {:?}", request);

    forward_stream(&state, &state.routes.stream(), &request, permit).await
}

/// Extra configured routes: sync or streaming per `args.stream`
pub async fn extra_route_handler(
    State(state): State<Arc<AppState>>,
    path: MatchedPath,
    body: Bytes,
) -> Result<Response, ApiError> {
    let permit = state.limiter.acquire().await?;
    let request = decode_payload(&body)?;

    if !request.has_args() {
        return Err(ForwardError::MissingArgs.into());
    }

    match state.routes.resolve(path.as_str(), request.stream_requested())? {
        Dispatch::Stream(forwarder) => forward_stream(&state, &forwarder, &request, permit).await,
        Dispatch::Sync(forwarder) => {
            let response = forward_sync(&state, &forwarder, &request).await;
            drop(permit);
            response
        }
    }
}

fn decode_payload(body: &[u8]) -> Result<PredictRequest, ForwardError> {
    PredictRequest::from_slice(body).inspect_err(|e| {
        error!(
            "Failed to decode payload from: {} ({})",
            String::from_utf8_lossy(body),
            e
        )
    })
}

async fn forward_sync(
    state: &AppState,
    forwarder: &SyncForwarder,
    request: &PredictRequest,
) -> Result<Response, ApiError> {
    let guard = state.hooks.guard(request);

    match forwarder.forward(request).await {
        Ok(response) => {
            let outcome = if response.is_success() {
                HookOutcome::Success(response.body.clone())
            } else {
                HookOutcome::Failure(format!("Backend returned {}", response.status))
            };
            let body = match serde_json::to_vec(&response.body) {
                Ok(body) => Bytes::from(body),
                Err(e) => {
                    let e = ForwardError::BadResponse(e.to_string());
                    guard.complete(HookOutcome::Failure(e.to_string()));
                    return Err(e.into());
                }
            };
            let body = Body::from_stream(deliver_then_complete(body, guard, outcome));
            Ok((
                response.status,
                [(header::CONTENT_TYPE, HeaderValue::from_static("application/json"))],
                body,
            )
                .into_response())
        }
        Err(e) => {
            error!("Sync forward to {} failed: {}", forwarder.url(), e);
            guard.complete(HookOutcome::Failure(e.to_string()));
            Err(e.into())
        }
    }
}

enum Delivery {
    Pending(Bytes, HookGuard, HookOutcome),
    Sent(HookGuard, HookOutcome),
}

/// A single-chunk body that hands `outcome` to the hooks only once the
/// chunk has been taken by the server. Dropping it early reports the
/// request as abandoned.
fn deliver_then_complete(
    body: Bytes,
    guard: HookGuard,
    outcome: HookOutcome,
) -> impl Stream<Item = Result<Bytes, Infallible>> {
    stream::unfold(
        Some(Delivery::Pending(body, guard, outcome)),
        |delivery| async move {
            match delivery? {
                Delivery::Pending(body, guard, outcome) => {
                    Some((Ok(body), Some(Delivery::Sent(guard, outcome))))
                }
                Delivery::Sent(guard, outcome) => {
                    guard.complete(outcome);
                    None
                }
            }
        },
    )
}

async fn forward_stream(
    state: &AppState,
    forwarder: &StreamingForwarder,
    request: &PredictRequest,
    permit: Permit,
) -> Result<Response, ApiError> {
    let guard = state.hooks.guard(request);

    let chunks = match forwarder.forward(request).await {
        Ok(chunks) => chunks,
        Err(e) => {
            error!("Streaming forward to {} failed: {}", forwarder.url(), e);
            guard.complete(HookOutcome::Failure(e.to_string()));
            return Err(e.into());
        }
    };

    let events = sse_events(chunks, permit, guard, forwarder.url().to_string());
    Ok(Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response())
}

/// Everything a relayed stream holds until it ends or the client leaves
struct Relay {
    chunks: ChunkStream,
    _permit: Permit,
    guard: HookGuard,
    url: String,
    sent: usize,
}

/// One event per backend chunk, then an `error` event if the backend fails.
///
/// Dropping the stream drops the backend connection, the admission permit,
/// and reports the request as abandoned to the hooks.
fn sse_events(
    chunks: ChunkStream,
    permit: Permit,
    guard: HookGuard,
    url: String,
) -> impl Stream<Item = Result<Event, Infallible>> {
    let relay = Relay {
        chunks,
        _permit: permit,
        guard,
        url,
        sent: 0,
    };

    stream::unfold(Some(relay), |relay| async move {
        let mut relay = relay?;

        match relay.chunks.next().await {
            Some(Ok(chunk)) => {
                relay.sent += 1;
                let event = Event::default().data(chunk.to_string());
                Some((Ok(event), Some(relay)))
            }
            Some(Err(e)) => {
                error!(
                    "Stream from {} failed after {} chunk(s): {}",
                    relay.url, relay.sent, e
                );
                let event = Event::default()
                    .event("error")
                    .data(json!({ "error": e.to_string() }).to_string());
                relay.guard.complete(HookOutcome::Failure(e.to_string()));
                Some((Ok(event), None))
            }
            None => {
                if relay.sent == 0 {
                    warn!("Stream from {} ended without any chunks", relay.url);
                }
                relay
                    .guard
                    .complete(HookOutcome::Success(json!({ "chunks": relay.sent })));
                None
            }
        }
    })
}
