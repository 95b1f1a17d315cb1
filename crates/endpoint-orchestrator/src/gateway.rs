//! Infrastructure gateway: the seam between use cases and the driver that
//! actually creates and destroys backend compute

use anyhow::{Context, Result};
use async_trait::async_trait;
use endpoint_common::{
    DeploymentState, EndpointConfig, EndpointType, InfraState, ModelBundle, ResourceState,
    ENDPOINT_CONFIG_ANNOTATION,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};

/// Everything the infrastructure needs to create or update a deployment
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProvisionRequest {
    pub endpoint_id: String,
    pub deployment_name: String,
    pub endpoint_type: EndpointType,
    pub bundle: ModelBundle,
    pub resource_state: ResourceState,
    pub deployment_state: DeploymentState,
    pub labels: HashMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prewarm: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub high_priority: Option<bool>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_config: Option<serde_json::Value>,

    /// Opaque annotations; the encoded `EndpointConfig` lives under
    /// [`ENDPOINT_CONFIG_ANNOTATION`]
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl ProvisionRequest {
    /// Decode the endpoint config carried in the metadata, if any
    pub fn endpoint_config(&self) -> Result<Option<EndpointConfig>> {
        decode_endpoint_config(&self.metadata)
    }
}

/// Decode the endpoint config annotation from deployment metadata
pub fn decode_endpoint_config(
    metadata: &HashMap<String, String>,
) -> Result<Option<EndpointConfig>> {
    match metadata.get(ENDPOINT_CONFIG_ANNOTATION) {
        Some(blob) => {
            let config = EndpointConfig::from_blob(blob)
                .context("Failed to decode endpoint config annotation")?;
            Ok(Some(config))
        }
        None => Ok(None),
    }
}

/// Where the infrastructure is with respect to the last applied change
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InfraPhase {
    /// Nothing exists for this endpoint
    Absent,
    /// Change accepted but not started
    Pending,
    /// Change is being rolled out
    Applying,
    /// Last change converged
    Ready,
    /// Last change failed
    Failed,
}

/// A point-in-time observation of an endpoint's infrastructure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InfraObservation {
    pub phase: InfraPhase,

    /// Task id of the change this observation refers to
    #[serde(default)]
    pub task_id: Option<String>,

    /// Last known good shape; `None` before the first creation completes
    #[serde(default)]
    pub infra_state: Option<InfraState>,

    #[serde(default)]
    pub message: Option<String>,
}

impl InfraObservation {
    pub fn absent() -> Self {
        Self {
            phase: InfraPhase::Absent,
            task_id: None,
            infra_state: None,
            message: None,
        }
    }
}

/// Driver for backend compute
#[async_trait]
pub trait InfraGateway: Send + Sync {
    /// Begin creating or updating resources; returns a task id
    async fn create_or_update_resources(&self, request: &ProvisionRequest) -> Result<String>;

    /// Observe current infrastructure for an endpoint
    async fn observe(&self, endpoint_id: &str) -> Result<InfraObservation>;

    /// Tear down resources. `Ok(true)` means teardown is confirmed.
    async fn delete_resources(&self, endpoint_id: &str) -> Result<bool>;
}

/// Response to a provisioning call
#[derive(Debug, Deserialize)]
struct ProvisionResponse {
    task_id: String,
}

/// Observation as reported by the driver: infra state plus raw metadata
#[derive(Debug, Deserialize)]
struct ObservationResponse {
    phase: InfraPhase,
    #[serde(default)]
    task_id: Option<String>,
    #[serde(default)]
    infra_state: Option<InfraState>,
    #[serde(default)]
    metadata: HashMap<String, String>,
    #[serde(default)]
    message: Option<String>,
}

/// Teardown response
#[derive(Debug, Deserialize)]
struct DeleteResponse {
    deleted: bool,
}

/// Gateway backed by an HTTP infrastructure driver
pub struct HttpInfraGateway {
    base_url: String,
    client: reqwest::Client,
}

impl HttpInfraGateway {
    /// Create a new gateway client
    pub fn new(base_url: String) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: reqwest::Client::new(),
        }
    }

    fn deployment_url(&self, endpoint_id: &str) -> String {
        format!("{}/v1/deployments/{}", self.base_url, endpoint_id)
    }
}

#[async_trait]
impl InfraGateway for HttpInfraGateway {
    async fn create_or_update_resources(&self, request: &ProvisionRequest) -> Result<String> {
        let url = format!("{}/v1/deployments", self.base_url);

        debug!("Provisioning {} via {}", request.endpoint_id, url);

        let response = self
            .client
            .post(&url)
            .json(request)
            .send()
            .await
            .context("Failed to reach infrastructure gateway")?;

        if !response.status().is_success() {
            anyhow::bail!(
                "Provisioning {} failed: {}",
                request.endpoint_id,
                response.status()
            );
        }

        let body: ProvisionResponse = response
            .json()
            .await
            .context("Failed to parse provisioning response")?;

        Ok(body.task_id)
    }

    async fn observe(&self, endpoint_id: &str) -> Result<InfraObservation> {
        let url = self.deployment_url(endpoint_id);

        debug!("Observing infrastructure: {}", url);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .context("Failed to reach infrastructure gateway")?;

        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(InfraObservation::absent());
        }

        if !response.status().is_success() {
            anyhow::bail!("Failed to observe {}: {}", endpoint_id, response.status());
        }

        let body: ObservationResponse = response
            .json()
            .await
            .context("Failed to parse observation response")?;

        let mut infra_state = body.infra_state;
        if let Some(state) = infra_state.as_mut() {
            match decode_endpoint_config(&body.metadata) {
                Ok(config) => state.user_config_state.endpoint_config = config,
                Err(e) => warn!("Ignoring endpoint config for {}: {:#}", endpoint_id, e),
            }
        }

        Ok(InfraObservation {
            phase: body.phase,
            task_id: body.task_id,
            infra_state,
            message: body.message,
        })
    }

    async fn delete_resources(&self, endpoint_id: &str) -> Result<bool> {
        let url = self.deployment_url(endpoint_id);

        debug!("Tearing down infrastructure: {}", url);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .context("Failed to reach infrastructure gateway")?;

        // Already gone counts as confirmed
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(true);
        }

        if !response.status().is_success() {
            anyhow::bail!("Teardown of {} failed: {}", endpoint_id, response.status());
        }

        let body: DeleteResponse = response
            .json()
            .await
            .context("Failed to parse teardown response")?;

        Ok(body.deleted)
    }
}
