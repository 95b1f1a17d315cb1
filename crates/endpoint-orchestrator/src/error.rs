//! Error taxonomy surfaced by the endpoint use cases

use thiserror::Error;

/// Errors returned across the use-case boundary.
///
/// Storage, gateway and codec failures are folded into these variants so
/// callers never see implementation-specific errors.
#[derive(Error, Debug)]
pub enum UseCaseError {
    /// Malformed or out-of-range request fields, label or hook violations
    #[error("{0}")]
    InvalidRequest(String),

    /// Missing, or owned by someone else (indistinguishable on purpose)
    #[error("{0}")]
    NotFound(String),

    /// Name already taken by the caller on create
    #[error("{0}")]
    AlreadyExists(String),

    /// Another mutation holds the endpoint; retry after backoff
    #[error("Existing operation on endpoint {0} in progress, try again later")]
    OperationInProgress(String),

    /// Infrastructure has not reported state for the endpoint yet
    #[error("Endpoint infra state not found for {0}, try again later")]
    InfraStateNotFound(String),

    /// Teardown did not complete; compute resources may still exist
    #[error("Deletion of endpoint {0} failed, compute resources still exist")]
    DeleteFailed(String),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl UseCaseError {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            UseCaseError::InvalidRequest(_) => "invalid_request",
            UseCaseError::NotFound(_) => "not_found",
            UseCaseError::AlreadyExists(_) => "already_exists",
            UseCaseError::OperationInProgress(_) => "operation_in_progress",
            UseCaseError::InfraStateNotFound(_) => "infra_state_not_found",
            UseCaseError::DeleteFailed(_) => "delete_failed",
            UseCaseError::Internal(_) => "internal",
        }
    }
}

impl From<endpoint_common::Error> for UseCaseError {
    fn from(err: endpoint_common::Error) -> Self {
        match err {
            endpoint_common::Error::InvalidQuantity(_)
            | endpoint_common::Error::InvalidJobTransition(_) => {
                UseCaseError::InvalidRequest(err.to_string())
            }
            other => UseCaseError::Internal(anyhow::Error::new(other)),
        }
    }
}

pub type Result<T> = std::result::Result<T, UseCaseError>;
