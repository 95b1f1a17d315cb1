//! Simulated infrastructure for development and testing
//!
//! Accepts provisioning requests and reports them as applying until a
//! configurable convergence delay has passed, then as ready (or failed when
//! a failure was injected).

use anyhow::Result;
use async_trait::async_trait;
use endpoint_common::{InfraState, UserConfigState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::gateway::{InfraGateway, InfraObservation, InfraPhase, ProvisionRequest};

const MOCK_AWS_ROLE: &str = "arn:aws:iam::000000000000:role/mock-endpoint";
const MOCK_RESULTS_BUCKET: &str = "mock-inference-results";

/// One simulated deployment
struct SimulatedDeployment {
    request: ProvisionRequest,
    task_id: String,
    applied_at: Instant,
    will_fail: bool,
    /// Shape as of the last change that converged
    last_ready: Option<InfraState>,
}

/// Mock infra gateway
pub struct SimulatedInfraGateway {
    deployments: Mutex<HashMap<String, SimulatedDeployment>>,
    convergence_delay: Duration,
    fail_next_apply: AtomicBool,
    reject_applies: AtomicBool,
    fail_deletes: AtomicBool,
}

impl SimulatedInfraGateway {
    /// Create a new simulated gateway
    pub fn new(convergence_delay: Duration) -> Self {
        Self {
            deployments: Mutex::new(HashMap::new()),
            convergence_delay,
            fail_next_apply: AtomicBool::new(false),
            reject_applies: AtomicBool::new(false),
            fail_deletes: AtomicBool::new(false),
        }
    }

    /// The next accepted change converges to failed
    pub fn fail_next_apply(&self) {
        self.fail_next_apply.store(true, Ordering::SeqCst);
    }

    /// Reject provisioning calls outright
    pub fn set_reject_applies(&self, reject: bool) {
        self.reject_applies.store(reject, Ordering::SeqCst);
    }

    /// Make teardown report that resources could not be removed
    pub fn set_fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Whether resources exist for an endpoint
    pub async fn has_deployment(&self, endpoint_id: &str) -> bool {
        self.deployments.lock().await.contains_key(endpoint_id)
    }

    /// Last request applied for an endpoint
    pub async fn last_request(&self, endpoint_id: &str) -> Option<ProvisionRequest> {
        self.deployments
            .lock()
            .await
            .get(endpoint_id)
            .map(|d| d.request.clone())
    }

    fn infra_state_for(request: &ProvisionRequest) -> InfraState {
        let endpoint_config = match request.endpoint_config() {
            Ok(config) => config,
            Err(e) => {
                warn!("Mock infra: unreadable endpoint config: {:#}", e);
                None
            }
        };

        // Real infrastructure stamps platform labels on every deployment
        let mut labels = request.labels.clone();
        if let Some(config) = &endpoint_config {
            labels.insert("endpoint_name".to_string(), config.endpoint_name.clone());
            if let Some(user_id) = &config.user_id {
                labels.insert("user_id".to_string(), user_id.clone());
            }
        }

        let mut deployment_state = request.deployment_state.clone();
        deployment_state.available_workers = Some(deployment_state.min_workers);
        deployment_state.unavailable_workers = Some(0);

        InfraState {
            deployment_name: request.deployment_name.clone(),
            aws_role: MOCK_AWS_ROLE.to_string(),
            results_s3_bucket: MOCK_RESULTS_BUCKET.to_string(),
            labels,
            deployment_state,
            resource_state: request.resource_state.clone(),
            user_config_state: UserConfigState {
                app_config: request.app_config.clone(),
                endpoint_config,
            },
            prewarm: request.prewarm,
            high_priority: request.high_priority,
            num_queued_items: Some(0),
            image: format!("mock-registry/{}:{}", request.bundle.name, request.bundle.id),
        }
    }
}

impl Default for SimulatedInfraGateway {
    fn default() -> Self {
        Self::new(Duration::ZERO)
    }
}

#[async_trait]
impl InfraGateway for SimulatedInfraGateway {
    async fn create_or_update_resources(&self, request: &ProvisionRequest) -> Result<String> {
        if self.reject_applies.load(Ordering::SeqCst) {
            anyhow::bail!("Mock infra rejected provisioning for {}", request.endpoint_id);
        }

        let task_id = format!("task_{}", uuid::Uuid::new_v4().simple());
        let will_fail = self.fail_next_apply.swap(false, Ordering::SeqCst);

        let mut deployments = self.deployments.lock().await;
        let last_ready = deployments
            .get(&request.endpoint_id)
            .and_then(|d| d.last_ready.clone());

        deployments.insert(
            request.endpoint_id.clone(),
            SimulatedDeployment {
                request: request.clone(),
                task_id: task_id.clone(),
                applied_at: Instant::now(),
                will_fail,
                last_ready,
            },
        );

        debug!(
            "Mock infra: accepted {} for {}",
            task_id, request.endpoint_id
        );
        Ok(task_id)
    }

    async fn observe(&self, endpoint_id: &str) -> Result<InfraObservation> {
        let mut deployments = self.deployments.lock().await;
        let Some(deployment) = deployments.get_mut(endpoint_id) else {
            return Ok(InfraObservation::absent());
        };

        let phase = if deployment.applied_at.elapsed() < self.convergence_delay {
            InfraPhase::Applying
        } else if deployment.will_fail {
            InfraPhase::Failed
        } else {
            deployment.last_ready = Some(Self::infra_state_for(&deployment.request));
            InfraPhase::Ready
        };

        Ok(InfraObservation {
            phase,
            task_id: Some(deployment.task_id.clone()),
            infra_state: deployment.last_ready.clone(),
            message: (phase == InfraPhase::Failed)
                .then(|| "Simulated rollout failure".to_string()),
        })
    }

    async fn delete_resources(&self, endpoint_id: &str) -> Result<bool> {
        if self.fail_deletes.load(Ordering::SeqCst) {
            debug!("Mock infra: refusing teardown of {}", endpoint_id);
            return Ok(false);
        }

        self.deployments.lock().await.remove(endpoint_id);
        debug!("Mock infra: tore down {}", endpoint_id);
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_common::{DeploymentState, EndpointType, ModelBundle, Quantity, ResourceState};

    fn request(endpoint_id: &str) -> ProvisionRequest {
        ProvisionRequest {
            endpoint_id: endpoint_id.to_string(),
            deployment_name: format!("launch-endpoint-id-{}", endpoint_id),
            endpoint_type: EndpointType::Sync,
            bundle: ModelBundle::new("bun_1".to_string(), "bundle".to_string(), "o".to_string()),
            resource_state: ResourceState {
                cpus: Quantity::Number(1.0),
                gpus: 0,
                memory: Quantity::from("1Gi"),
                gpu_type: None,
                storage: None,
                nodes_per_worker: 1,
                optimize_costs: None,
            },
            deployment_state: DeploymentState {
                min_workers: 1,
                max_workers: 1,
                per_worker: 1,
                available_workers: None,
                unavailable_workers: None,
            },
            labels: HashMap::new(),
            prewarm: None,
            high_priority: None,
            app_config: None,
            metadata: HashMap::new(),
        }
    }

    #[tokio::test]
    async fn test_converges_after_delay() {
        let gateway = SimulatedInfraGateway::new(Duration::from_millis(30));
        let task_id = gateway
            .create_or_update_resources(&request("end_1"))
            .await
            .unwrap();

        let observation = gateway.observe("end_1").await.unwrap();
        assert_eq!(observation.phase, InfraPhase::Applying);
        assert!(observation.infra_state.is_none());

        tokio::time::sleep(Duration::from_millis(40)).await;

        let observation = gateway.observe("end_1").await.unwrap();
        assert_eq!(observation.phase, InfraPhase::Ready);
        assert_eq!(observation.task_id, Some(task_id));
        assert!(observation.infra_state.is_some());
    }

    #[tokio::test]
    async fn test_failed_update_keeps_last_ready_state() {
        let gateway = SimulatedInfraGateway::default();
        gateway
            .create_or_update_resources(&request("end_1"))
            .await
            .unwrap();
        let ready = gateway.observe("end_1").await.unwrap();

        gateway.fail_next_apply();
        gateway
            .create_or_update_resources(&request("end_1"))
            .await
            .unwrap();

        let failed = gateway.observe("end_1").await.unwrap();
        assert_eq!(failed.phase, InfraPhase::Failed);
        assert_eq!(failed.infra_state, ready.infra_state);
    }

    #[tokio::test]
    async fn test_unknown_endpoint_is_absent() {
        let gateway = SimulatedInfraGateway::default();
        let observation = gateway.observe("end_missing").await.unwrap();
        assert_eq!(observation.phase, InfraPhase::Absent);
    }

    #[tokio::test]
    async fn test_failing_deletes_keep_resources() {
        let gateway = SimulatedInfraGateway::default();
        gateway
            .create_or_update_resources(&request("end_1"))
            .await
            .unwrap();

        gateway.set_fail_deletes(true);
        assert!(!gateway.delete_resources("end_1").await.unwrap());
        assert!(gateway.has_deployment("end_1").await);

        gateway.set_fail_deletes(false);
        assert!(gateway.delete_resources("end_1").await.unwrap());
        assert!(!gateway.has_deployment("end_1").await);
    }
}
