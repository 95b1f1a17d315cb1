//! Desired endpoint configuration
//!
//! Create builds it straight from the request. Update rebuilds it from the
//! stored record plus observed infra state and then overlays the fields the
//! caller set, so unset fields keep their previous values.

use endpoint_common::{
    CallbackAuth, DeploymentState, EndpointConfig, EndpointRecord, EndpointType, InfraState,
    ModelBundle, ResourceState, ENDPOINT_CONFIG_ANNOTATION,
};
use std::collections::HashMap;

use crate::error::Result;
use crate::gateway::ProvisionRequest;
use crate::models::{CreateEndpointRequest, UpdateEndpointRequest};
use crate::validation::RESERVED_LABEL_KEYS;

/// Full desired configuration of one endpoint
#[derive(Debug, Clone, PartialEq)]
pub struct DesiredEndpoint {
    pub name: String,
    pub endpoint_type: EndpointType,
    pub bundle: ModelBundle,
    pub metadata: Option<serde_json::Value>,
    pub post_inference_hooks: Option<Vec<String>>,
    pub resources: ResourceState,
    pub deployment: DeploymentState,
    pub labels: HashMap<String, String>,
    pub prewarm: Option<bool>,
    pub high_priority: Option<bool>,
    pub billing_tags: Option<serde_json::Value>,
    pub default_callback_url: Option<String>,
    pub default_callback_auth: Option<CallbackAuth>,
    pub public_inference: Option<bool>,
    pub app_config: Option<serde_json::Value>,
}

impl DesiredEndpoint {
    pub fn from_create(request: &CreateEndpointRequest, bundle: ModelBundle) -> Self {
        Self {
            name: request.name.clone(),
            endpoint_type: request.endpoint_type,
            bundle,
            metadata: request.metadata.clone(),
            post_inference_hooks: request.post_inference_hooks.clone(),
            resources: request.resource_state(),
            deployment: request.deployment_state(),
            labels: request.labels.clone(),
            prewarm: request.prewarm,
            high_priority: request.high_priority,
            billing_tags: request.billing_tags.clone(),
            default_callback_url: request.default_callback_url.clone(),
            default_callback_auth: request.default_callback_auth.clone(),
            public_inference: request.public_inference,
            app_config: request.app_config.clone(),
        }
    }

    /// Reconstruct the configuration currently in effect
    pub fn from_current(record: &EndpointRecord, infra: &InfraState) -> Self {
        let config = infra.user_config_state.endpoint_config.clone().unwrap_or_default();

        let mut labels = infra.labels.clone();
        labels.retain(|k, _| !RESERVED_LABEL_KEYS.contains(&k.as_str()));

        let mut deployment = infra.deployment_state.clone();
        deployment.available_workers = None;
        deployment.unavailable_workers = None;

        Self {
            name: record.name.clone(),
            endpoint_type: record.endpoint_type,
            bundle: record.current_model_bundle.clone(),
            metadata: record.metadata.clone(),
            post_inference_hooks: config.post_inference_hooks,
            resources: infra.resource_state.clone(),
            deployment,
            labels,
            prewarm: infra.prewarm,
            high_priority: infra.high_priority,
            billing_tags: config.billing_tags,
            default_callback_url: config.default_callback_url,
            default_callback_auth: config.default_callback_auth,
            public_inference: record.public_inference,
            app_config: infra.user_config_state.app_config.clone(),
        }
    }

    /// Overlay the fields present in `request`. Applying the same request
    /// twice gives the same result as applying it once.
    pub fn merge(&self, request: &UpdateEndpointRequest, bundle: Option<ModelBundle>) -> Self {
        let mut next = self.clone();

        if let Some(bundle) = bundle {
            next.bundle = bundle;
        }
        if let Some(metadata) = &request.metadata {
            next.metadata = Some(metadata.clone());
        }
        if let Some(hooks) = &request.post_inference_hooks {
            next.post_inference_hooks = Some(hooks.clone());
        }
        if let Some(cpus) = &request.cpus {
            next.resources.cpus = cpus.clone();
        }
        if let Some(gpus) = request.gpus {
            next.resources.gpus = gpus;
        }
        if let Some(memory) = &request.memory {
            next.resources.memory = memory.clone();
        }
        if let Some(gpu_type) = request.gpu_type {
            next.resources.gpu_type = Some(gpu_type);
        }
        if let Some(storage) = &request.storage {
            next.resources.storage = Some(storage.clone());
        }
        if let Some(nodes) = request.nodes_per_worker {
            next.resources.nodes_per_worker = nodes;
        }
        if let Some(optimize) = request.optimize_costs {
            next.resources.optimize_costs = Some(optimize);
        }
        if let Some(min) = request.min_workers {
            next.deployment.min_workers = min;
        }
        if let Some(max) = request.max_workers {
            next.deployment.max_workers = max;
        }
        if let Some(per_worker) = request.per_worker {
            next.deployment.per_worker = per_worker;
        }
        if let Some(labels) = &request.labels {
            next.labels = labels.clone();
        }
        if let Some(prewarm) = request.prewarm {
            next.prewarm = Some(prewarm);
        }
        if let Some(high_priority) = request.high_priority {
            next.high_priority = Some(high_priority);
        }
        if let Some(tags) = &request.billing_tags {
            next.billing_tags = Some(tags.clone());
        }
        if let Some(url) = &request.default_callback_url {
            next.default_callback_url = Some(url.clone());
        }
        if let Some(auth) = &request.default_callback_auth {
            next.default_callback_auth = Some(auth.clone());
        }
        if let Some(public) = request.public_inference {
            next.public_inference = Some(public);
        }
        if let Some(app_config) = &request.app_config {
            next.app_config = Some(app_config.clone());
        }

        next
    }

    /// Copy the record-level fields onto `record`
    pub fn apply_to_record(&self, record: &mut EndpointRecord) {
        record.current_model_bundle = self.bundle.clone();
        record.metadata = self.metadata.clone();
        record.public_inference = self.public_inference;
    }

    /// Durable config persisted alongside the deployment
    pub fn endpoint_config(&self, record: &EndpointRecord) -> EndpointConfig {
        EndpointConfig {
            endpoint_name: self.name.clone(),
            bundle_name: self.bundle.name.clone(),
            post_inference_hooks: self.post_inference_hooks.clone(),
            user_id: Some(record.owner.clone()),
            billing_queue: None,
            billing_tags: self.billing_tags.clone(),
            default_callback_url: self.default_callback_url.clone(),
            default_callback_auth: self.default_callback_auth.clone(),
            endpoint_id: Some(record.id.clone()),
            endpoint_type: Some(self.endpoint_type),
            bundle_id: Some(self.bundle.id.clone()),
            labels: Some(self.labels.clone()),
        }
    }

    /// Build the gateway request for `record`
    pub fn provision_request(&self, record: &EndpointRecord) -> Result<ProvisionRequest> {
        let blob = self.endpoint_config(record).to_blob()?;

        Ok(ProvisionRequest {
            endpoint_id: record.id.clone(),
            deployment_name: record.destination.clone(),
            endpoint_type: self.endpoint_type,
            bundle: self.bundle.clone(),
            resource_state: self.resources.clone(),
            deployment_state: self.deployment.clone(),
            labels: self.labels.clone(),
            prewarm: self.prewarm,
            high_priority: self.high_priority,
            app_config: self.app_config.clone(),
            metadata: HashMap::from([(ENDPOINT_CONFIG_ANNOTATION.to_string(), blob)]),
        })
    }
}
