//! Request and response models for the control-plane API

use chrono::{DateTime, Utc};
use endpoint_common::{
    BatchCompletionsJob, BatchModelConfig, CallbackAuth, DeploymentState, Endpoint,
    EndpointRecord, EndpointStatus, EndpointType, GpuType, Quantity, ResourceState,
};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Request to create a model endpoint
#[derive(Debug, Clone, Deserialize)]
pub struct CreateEndpointRequest {
    pub name: String,
    pub model_bundle_id: String,

    #[serde(default = "default_endpoint_type")]
    pub endpoint_type: EndpointType,

    #[serde(default)]
    pub metadata: Option<serde_json::Value>,

    #[serde(default)]
    pub post_inference_hooks: Option<Vec<String>>,

    pub cpus: Quantity,

    #[serde(default)]
    pub gpus: u32,

    pub memory: Quantity,

    #[serde(default)]
    pub gpu_type: Option<GpuType>,

    #[serde(default)]
    pub storage: Option<Quantity>,

    #[serde(default = "default_nodes_per_worker")]
    pub nodes_per_worker: u32,

    #[serde(default)]
    pub optimize_costs: Option<bool>,

    pub min_workers: u32,
    pub max_workers: u32,
    pub per_worker: u32,

    pub labels: HashMap<String, String>,

    #[serde(default)]
    pub prewarm: Option<bool>,

    #[serde(default)]
    pub high_priority: Option<bool>,

    #[serde(default)]
    pub billing_tags: Option<serde_json::Value>,

    #[serde(default)]
    pub default_callback_url: Option<String>,

    #[serde(default)]
    pub default_callback_auth: Option<CallbackAuth>,

    #[serde(default)]
    pub public_inference: Option<bool>,

    /// Opaque configuration handed to the serving container
    #[serde(default)]
    pub app_config: Option<serde_json::Value>,
}

fn default_endpoint_type() -> EndpointType {
    EndpointType::Sync
}

fn default_nodes_per_worker() -> u32 {
    1
}

impl CreateEndpointRequest {
    pub fn resource_state(&self) -> ResourceState {
        ResourceState {
            cpus: self.cpus.clone(),
            gpus: self.gpus,
            memory: self.memory.clone(),
            gpu_type: self.gpu_type,
            storage: self.storage.clone(),
            nodes_per_worker: self.nodes_per_worker,
            optimize_costs: self.optimize_costs,
        }
    }

    pub fn deployment_state(&self) -> DeploymentState {
        DeploymentState {
            min_workers: self.min_workers,
            max_workers: self.max_workers,
            per_worker: self.per_worker,
            available_workers: None,
            unavailable_workers: None,
        }
    }
}

/// Partial update: absent fields keep their current value
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateEndpointRequest {
    #[serde(default)]
    pub model_bundle_id: Option<String>,
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub post_inference_hooks: Option<Vec<String>>,
    #[serde(default)]
    pub cpus: Option<Quantity>,
    #[serde(default)]
    pub gpus: Option<u32>,
    #[serde(default)]
    pub memory: Option<Quantity>,
    #[serde(default)]
    pub gpu_type: Option<GpuType>,
    #[serde(default)]
    pub storage: Option<Quantity>,
    #[serde(default)]
    pub nodes_per_worker: Option<u32>,
    #[serde(default)]
    pub optimize_costs: Option<bool>,
    #[serde(default)]
    pub min_workers: Option<u32>,
    #[serde(default)]
    pub max_workers: Option<u32>,
    #[serde(default)]
    pub per_worker: Option<u32>,
    #[serde(default)]
    pub labels: Option<HashMap<String, String>>,
    #[serde(default)]
    pub prewarm: Option<bool>,
    #[serde(default)]
    pub high_priority: Option<bool>,
    #[serde(default)]
    pub billing_tags: Option<serde_json::Value>,
    #[serde(default)]
    pub default_callback_url: Option<String>,
    #[serde(default)]
    pub default_callback_auth: Option<CallbackAuth>,
    #[serde(default)]
    pub public_inference: Option<bool>,
    #[serde(default)]
    pub app_config: Option<serde_json::Value>,
}

/// Response from create
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateEndpointResponse {
    pub endpoint_creation_task_id: String,
}

/// Response from update
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpdateEndpointResponse {
    pub endpoint_creation_task_id: String,
}

/// Response from delete
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteEndpointResponse {
    pub deleted: bool,
}

/// Sort key for listing endpoints
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EndpointOrderBy {
    #[default]
    Newest,
    Oldest,
    Alphabetical,
}

/// Query parameters for listing endpoints
#[derive(Debug, Default, Deserialize)]
pub struct ListEndpointsQuery {
    pub name: Option<String>,
    pub order_by: Option<EndpointOrderBy>,
}

/// Sort records in place. Ties are broken by id so the order is stable
/// across calls.
pub fn sort_records(records: &mut [EndpointRecord], order_by: EndpointOrderBy) {
    match order_by {
        EndpointOrderBy::Newest => records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        }),
        EndpointOrderBy::Oldest => records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.id.cmp(&b.id))
        }),
        EndpointOrderBy::Alphabetical => {
            records.sort_by(|a, b| a.name.cmp(&b.name).then_with(|| a.id.cmp(&b.id)))
        }
    }
}

/// Endpoint description returned by get and list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GetEndpointResponse {
    pub id: String,
    pub name: String,
    pub endpoint_type: EndpointType,
    pub destination: String,
    pub bundle_name: String,
    pub status: EndpointStatus,
    pub created_by: String,
    pub created_at: DateTime<Utc>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_updated_at: Option<DateTime<Utc>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub creation_task_id: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Value>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub public_inference: Option<bool>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_name: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub aws_role: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub results_s3_bucket: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub post_inference_hooks: Option<Vec<String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_callback_url: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub labels: Option<HashMap<String, String>>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub deployment_state: Option<DeploymentState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub resource_state: Option<ResourceState>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub num_queued_items: Option<u64>,
}

impl From<Endpoint> for GetEndpointResponse {
    fn from(endpoint: Endpoint) -> Self {
        let Endpoint {
            record,
            infra_state,
        } = endpoint;

        let endpoint_config = infra_state
            .as_ref()
            .and_then(|infra| infra.user_config_state.endpoint_config.clone());

        Self {
            id: record.id,
            name: record.name,
            endpoint_type: record.endpoint_type,
            destination: record.destination,
            bundle_name: record.current_model_bundle.name,
            status: record.status,
            created_by: record.created_by,
            created_at: record.created_at,
            last_updated_at: record.last_updated_at,
            creation_task_id: record.creation_task_id,
            metadata: record.metadata,
            public_inference: record.public_inference,
            deployment_name: infra_state.as_ref().map(|i| i.deployment_name.clone()),
            aws_role: infra_state.as_ref().map(|i| i.aws_role.clone()),
            results_s3_bucket: infra_state.as_ref().map(|i| i.results_s3_bucket.clone()),
            post_inference_hooks: endpoint_config
                .as_ref()
                .and_then(|c| c.post_inference_hooks.clone()),
            default_callback_url: endpoint_config
                .as_ref()
                .and_then(|c| c.default_callback_url.clone()),
            labels: infra_state.as_ref().map(|i| i.labels.clone()),
            deployment_state: infra_state.as_ref().map(|i| i.deployment_state.clone()),
            resource_state: infra_state.as_ref().map(|i| i.resource_state.clone()),
            num_queued_items: infra_state.and_then(|i| i.num_queued_items),
        }
    }
}

/// List of endpoints
#[derive(Debug, Serialize, Deserialize)]
pub struct ListEndpointsResponse {
    pub model_endpoints: Vec<GetEndpointResponse>,
}

/// Request to create a batch completions job
#[derive(Debug, Deserialize)]
pub struct CreateBatchJobRequest {
    #[serde(default)]
    pub input_data_path: Option<String>,

    pub output_data_path: String,

    pub model_config: BatchModelConfig,

    #[serde(default)]
    pub priority: Option<String>,

    /// Upper bound on job runtime, in seconds
    #[serde(default = "default_max_runtime_sec")]
    pub max_runtime_sec: i64,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_max_runtime_sec() -> i64 {
    24 * 3600
}

/// Response from creating a batch job
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateBatchJobResponse {
    pub job_id: String,
}

/// Request to change a batch job's priority
#[derive(Debug, Deserialize)]
pub struct UpdateBatchJobPriorityRequest {
    pub priority: Option<String>,
}

/// Batch job wrapper
#[derive(Debug, Serialize)]
pub struct BatchJobResponse {
    pub job: BatchCompletionsJob,
}

/// List of batch jobs
#[derive(Debug, Serialize)]
pub struct ListBatchJobsResponse {
    pub jobs: Vec<BatchCompletionsJob>,
    pub total: usize,
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use endpoint_common::ModelBundle;

    fn record(id: &str, name: &str, age_secs: i64) -> EndpointRecord {
        let mut record = EndpointRecord::new(
            id.to_string(),
            name.to_string(),
            "owner".to_string(),
            EndpointType::Sync,
            ModelBundle::new("b".to_string(), "b".to_string(), "owner".to_string()),
        );
        record.created_at = Utc::now() - Duration::seconds(age_secs);
        record
    }

    #[test]
    fn test_sort_records() {
        let base = vec![
            record("end_2", "beta", 10),
            record("end_1", "alpha", 30),
            record("end_3", "gamma", 20),
        ];

        let mut newest = base.clone();
        sort_records(&mut newest, EndpointOrderBy::Newest);
        let ids: Vec<_> = newest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["end_2", "end_3", "end_1"]);

        let mut oldest = base.clone();
        sort_records(&mut oldest, EndpointOrderBy::Oldest);
        let ids: Vec<_> = oldest.iter().map(|r| r.id.as_str()).collect();
        assert_eq!(ids, vec!["end_1", "end_3", "end_2"]);

        let mut alpha = base;
        sort_records(&mut alpha, EndpointOrderBy::Alphabetical);
        let names: Vec<_> = alpha.iter().map(|r| r.name.as_str()).collect();
        assert_eq!(names, vec!["alpha", "beta", "gamma"]);
    }

    #[test]
    fn test_sort_ties_broken_by_id() {
        let mut a = record("end_b", "same", 0);
        let mut b = record("end_a", "same", 0);
        let now = Utc::now();
        a.created_at = now;
        b.created_at = now;

        let mut records = vec![a, b];
        sort_records(&mut records, EndpointOrderBy::Newest);
        assert_eq!(records[0].id, "end_a");
    }

    #[test]
    fn test_create_request_defaults() {
        let request: CreateEndpointRequest = serde_json::from_str(
            r#"{
                "name": "demo",
                "model_bundle_id": "bun_1",
                "cpus": 1,
                "memory": "2Gi",
                "min_workers": 1,
                "max_workers": 2,
                "per_worker": 4,
                "labels": {"team": "ml", "product": "chat"}
            }"#,
        )
        .unwrap();

        assert_eq!(request.endpoint_type, EndpointType::Sync);
        assert_eq!(request.nodes_per_worker, 1);
        assert_eq!(request.gpus, 0);
    }

    #[test]
    fn test_order_by_parses() {
        let order: EndpointOrderBy = serde_json::from_str("\"alphabetical\"").unwrap();
        assert_eq!(order, EndpointOrderBy::Alphabetical);
    }
}
