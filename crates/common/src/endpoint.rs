//! Endpoint record and lifecycle state machine

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::bundle::ModelBundle;
use crate::error::{Error, Result};
use crate::infra::InfraState;

/// How an endpoint receives inference traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointType {
    /// Requests are queued and results delivered later
    Async,
    /// Request/response over HTTP
    Sync,
    /// Server-push stream of chunks
    Streaming,
}

impl fmt::Display for EndpointType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointType::Async => "async",
            EndpointType::Sync => "sync",
            EndpointType::Streaming => "streaming",
        };
        f.write_str(s)
    }
}

/// Lifecycle status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EndpointStatus {
    /// Stable and serving
    Ready,
    /// Mutation accepted, not yet applied by infrastructure
    UpdatePending,
    /// Infrastructure is actively changing
    UpdateInProgress,
    /// Last mutation failed; record can still be inspected or retried
    UpdateFailed,
    /// Teardown underway; record is purged once it is confirmed
    DeleteInProgress,
}

impl EndpointStatus {
    /// Whether the state machine has an edge from `self` to `next`.
    ///
    /// `DELETE_IN_PROGRESS` is reachable from every state (including itself,
    /// so a failed teardown can be retried). `READY` is only reachable from
    /// `UPDATE_IN_PROGRESS`.
    pub fn can_transition_to(self, next: EndpointStatus) -> bool {
        use EndpointStatus::*;

        match (self, next) {
            (_, DeleteInProgress) => true,
            (Ready | UpdateFailed, UpdatePending) => true,
            (UpdatePending, UpdateInProgress) => true,
            (UpdateInProgress, Ready | UpdateFailed) => true,
            _ => false,
        }
    }

    /// Whether a new update may be accepted in this state
    pub fn accepts_update(self) -> bool {
        matches!(self, EndpointStatus::Ready | EndpointStatus::UpdateFailed)
    }

    /// Whether infrastructure is still converging toward the last mutation
    pub fn is_converging(self) -> bool {
        matches!(
            self,
            EndpointStatus::UpdatePending | EndpointStatus::UpdateInProgress
        )
    }
}

impl fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EndpointStatus::Ready => "READY",
            EndpointStatus::UpdatePending => "UPDATE_PENDING",
            EndpointStatus::UpdateInProgress => "UPDATE_IN_PROGRESS",
            EndpointStatus::UpdateFailed => "UPDATE_FAILED",
            EndpointStatus::DeleteInProgress => "DELETE_IN_PROGRESS",
        };
        f.write_str(s)
    }
}

/// Identity and ownership of an endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EndpointRecord {
    /// Unique endpoint identifier
    pub id: String,

    /// Name, unique per owner
    pub name: String,

    /// Owning tenant
    pub owner: String,

    /// User that created the endpoint
    pub created_by: String,

    /// When the endpoint was created
    pub created_at: DateTime<Utc>,

    /// When the record was last written
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,

    /// Task id of the most recent create/update handed to the gateway
    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_task_id: Option<String>,

    /// Endpoint type
    pub endpoint_type: EndpointType,

    /// Destination the forwarder routes to
    pub destination: String,

    /// Bundle currently deployed
    pub current_model_bundle: ModelBundle,

    /// Lifecycle status
    pub status: EndpointStatus,

    /// Free-form caller metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    /// Whether unauthenticated inference is allowed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub public_inference: Option<bool>,
}

impl EndpointRecord {
    /// Create a record for a freshly accepted endpoint.
    ///
    /// New endpoints start in `UPDATE_PENDING`; nothing is `READY` before
    /// infrastructure confirms the first creation.
    pub fn new(
        id: String,
        name: String,
        owner: String,
        endpoint_type: EndpointType,
        bundle: ModelBundle,
    ) -> Self {
        let destination = destination_for(&id);
        Self {
            id,
            name,
            created_by: owner.clone(),
            owner,
            created_at: Utc::now(),
            last_updated_at: None,
            creation_task_id: None,
            endpoint_type,
            destination,
            current_model_bundle: bundle,
            status: EndpointStatus::UpdatePending,
            metadata: None,
            public_inference: None,
        }
    }

    /// Move to `next`, rejecting edges the state machine does not define
    pub fn transition_to(&mut self, next: EndpointStatus) -> Result<()> {
        if !self.status.can_transition_to(next) {
            return Err(Error::InvalidTransition {
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    /// Bump the last-updated timestamp
    pub fn touch(&mut self) {
        self.last_updated_at = Some(Utc::now());
    }
}

/// Deployment name / destination derived from an endpoint id
pub fn destination_for(endpoint_id: &str) -> String {
    format!("launch-endpoint-id-{}", endpoint_id.replace('_', "-"))
}

/// An endpoint as seen by callers: the record plus observed infrastructure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Endpoint {
    pub record: EndpointRecord,

    /// `None` until the first successful creation has been observed
    #[serde(skip_serializing_if = "Option::is_none")]
    pub infra_state: Option<InfraState>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record() -> EndpointRecord {
        EndpointRecord::new(
            "end_abc".to_string(),
            "my-endpoint".to_string(),
            "owner-1".to_string(),
            EndpointType::Sync,
            ModelBundle::new("bun_1".to_string(), "bundle".to_string(), "owner-1".to_string()),
        )
    }

    #[test]
    fn test_new_record_starts_pending() {
        let record = record();
        assert_eq!(record.status, EndpointStatus::UpdatePending);
        assert_eq!(record.destination, "launch-endpoint-id-end-abc");
    }

    #[test]
    fn test_ready_requires_in_progress() {
        let mut record = record();

        let err = record.transition_to(EndpointStatus::Ready).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));

        record.transition_to(EndpointStatus::UpdateInProgress).unwrap();
        record.transition_to(EndpointStatus::Ready).unwrap();
        assert_eq!(record.status, EndpointStatus::Ready);
        assert!(record.last_updated_at.is_some());
    }

    #[test]
    fn test_transition_table() {
        use EndpointStatus::*;
        let all = [Ready, UpdatePending, UpdateInProgress, UpdateFailed, DeleteInProgress];

        for from in all {
            // Delete is accepted from anywhere
            assert!(from.can_transition_to(DeleteInProgress));
            // Nothing reaches READY except UPDATE_IN_PROGRESS
            assert_eq!(from.can_transition_to(Ready), from == UpdateInProgress);
        }

        assert!(Ready.can_transition_to(UpdatePending));
        assert!(UpdateFailed.can_transition_to(UpdatePending));
        assert!(!UpdateInProgress.can_transition_to(UpdatePending));
        assert!(!DeleteInProgress.can_transition_to(UpdatePending));
        assert!(UpdateInProgress.can_transition_to(UpdateFailed));
        assert!(!UpdatePending.can_transition_to(UpdateFailed));
    }

    #[test]
    fn test_status_serialization() {
        let json = serde_json::to_string(&EndpointStatus::UpdateInProgress).unwrap();
        assert_eq!(json, "\"UPDATE_IN_PROGRESS\"");

        let ty: EndpointType = serde_json::from_str("\"streaming\"").unwrap();
        assert_eq!(ty, EndpointType::Streaming);
    }
}
