use thiserror::Error;

use crate::endpoint::EndpointStatus;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition {
        from: EndpointStatus,
        to: EndpointStatus,
    },

    #[error("Invalid batch job transition: {0}")]
    InvalidJobTransition(String),

    #[error("Invalid resource quantity: {0}")]
    InvalidQuantity(String),

    #[error("Invalid endpoint config encoding: {0}")]
    ConfigEncoding(#[from] base64::DecodeError),

    #[error("JSON serialization error: {0}")]
    JsonSerialization(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
