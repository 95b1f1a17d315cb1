use axum::http::StatusCode;
use thiserror::Error;

use crate::limiter::LimiterError;

#[derive(Debug, Error)]
pub enum ForwardError {
    #[error("Failed to decode payload: {0}")]
    Decode(String),

    #[error("Request has no args")]
    MissingArgs,

    #[error("No forwarder configured for {route} with stream={stream}")]
    NoForwarder { route: String, stream: bool },

    #[error(transparent)]
    Admission(#[from] LimiterError),

    #[error("Backend request failed: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("Backend returned {status}: {body}")]
    Backend { status: StatusCode, body: String },

    #[error("Malformed backend response: {0}")]
    BadResponse(String),
}

pub type Result<T> = std::result::Result<T, ForwardError>;
