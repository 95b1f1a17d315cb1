//! Lifecycle tests for the endpoint use cases against in-memory components

use async_trait::async_trait;
use endpoint_common::{EndpointStatus, EndpointType, ModelBundle, Quantity};
use endpoint_orchestrator::gateway::ProvisionRequest;
use endpoint_orchestrator::models::{CreateEndpointRequest, EndpointOrderBy, UpdateEndpointRequest};
use endpoint_orchestrator::{
    Components, ConflictGuard, EndpointRepository, EndpointUseCases, InMemoryBatchJobRepository,
    InMemoryBundleRepository, InMemoryConflictGuard, InMemoryEndpointRepository, InfraGateway,
    InfraObservation, Reconciler, SimulatedInfraGateway, UseCaseError,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

struct Harness {
    use_cases: EndpointUseCases,
    reconciler: Reconciler,
    repository: Arc<InMemoryEndpointRepository>,
    gateway: Arc<SimulatedInfraGateway>,
    guard: Arc<InMemoryConflictGuard>,
}

fn harness() -> Harness {
    harness_with_delay(Duration::ZERO)
}

fn harness_with_delay(convergence_delay: Duration) -> Harness {
    let repository = Arc::new(InMemoryEndpointRepository::new());
    let gateway = Arc::new(SimulatedInfraGateway::new(convergence_delay));
    let guard = Arc::new(InMemoryConflictGuard::default());
    let bundles = InMemoryBundleRepository::with_bundles([
        ModelBundle::new("bun_alice".to_string(), "llama".to_string(), "alice".to_string()),
        ModelBundle::new("bun_alice_2".to_string(), "llama-v2".to_string(), "alice".to_string()),
        ModelBundle::new("bun_bob".to_string(), "mistral".to_string(), "bob".to_string()),
    ]);

    let components = Components {
        endpoints: repository.clone(),
        bundles: Arc::new(bundles),
        batch_jobs: Arc::new(InMemoryBatchJobRepository::new()),
        gateway: gateway.clone(),
        guard: guard.clone(),
    };

    Harness {
        use_cases: components.app_state().endpoints,
        reconciler: components.reconciler(Duration::from_secs(1)),
        repository,
        gateway,
        guard,
    }
}

/// Reports infra state whose endpoint config annotation could not be read
struct ConfiglessGateway(Arc<SimulatedInfraGateway>);

#[async_trait]
impl InfraGateway for ConfiglessGateway {
    async fn create_or_update_resources(
        &self,
        request: &ProvisionRequest,
    ) -> anyhow::Result<String> {
        self.0.create_or_update_resources(request).await
    }

    async fn observe(&self, endpoint_id: &str) -> anyhow::Result<InfraObservation> {
        let mut observation = self.0.observe(endpoint_id).await?;
        if let Some(state) = observation.infra_state.as_mut() {
            state.user_config_state.endpoint_config = None;
        }
        Ok(observation)
    }

    async fn delete_resources(&self, endpoint_id: &str) -> anyhow::Result<bool> {
        self.0.delete_resources(endpoint_id).await
    }
}

fn create_request(name: &str, bundle_id: &str) -> CreateEndpointRequest {
    CreateEndpointRequest {
        name: name.to_string(),
        model_bundle_id: bundle_id.to_string(),
        endpoint_type: EndpointType::Sync,
        metadata: None,
        post_inference_hooks: None,
        cpus: Quantity::Number(2.0),
        gpus: 0,
        memory: Quantity::from("8Gi"),
        gpu_type: None,
        storage: None,
        nodes_per_worker: 1,
        optimize_costs: None,
        min_workers: 1,
        max_workers: 2,
        per_worker: 4,
        labels: HashMap::from([
            ("team".to_string(), "ml".to_string()),
            ("product".to_string(), "chat".to_string()),
        ]),
        prewarm: None,
        high_priority: None,
        billing_tags: None,
        default_callback_url: None,
        default_callback_auth: None,
        public_inference: None,
        app_config: None,
    }
}

/// Create an endpoint and drive it to READY
async fn ready_endpoint(h: &Harness, owner: &str, name: &str, bundle_id: &str) -> String {
    h.use_cases
        .create(owner, create_request(name, bundle_id))
        .await
        .unwrap();
    let id = h
        .repository
        .get_record_by_name(owner, name)
        .await
        .unwrap()
        .unwrap()
        .id;

    h.reconciler.reconcile_all().await.unwrap();
    assert_eq!(status(h, &id).await, EndpointStatus::Ready);
    id
}

async fn status(h: &Harness, id: &str) -> EndpointStatus {
    h.repository.get_record(id).await.unwrap().unwrap().status
}

#[tokio::test]
async fn test_create_starts_pending_and_returns_task() {
    let h = harness();

    let response = h
        .use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await
        .unwrap();
    assert!(response.endpoint_creation_task_id.starts_with("task_"));

    let endpoints = h
        .use_cases
        .list("alice", None, EndpointOrderBy::Newest)
        .await
        .unwrap();
    assert_eq!(endpoints.len(), 1);

    let record = &endpoints[0].record;
    assert_eq!(record.status, EndpointStatus::UpdatePending);
    assert_eq!(
        record.creation_task_id.as_deref(),
        Some(response.endpoint_creation_task_id.as_str())
    );
}

#[tokio::test]
async fn test_create_rejects_duplicates_and_foreign_bundles() {
    let h = harness();
    h.use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await
        .unwrap();

    let duplicate = h
        .use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await;
    assert!(matches!(duplicate, Err(UseCaseError::AlreadyExists(_))));

    let foreign = h
        .use_cases
        .create("alice", create_request("other", "bun_bob"))
        .await;
    assert!(matches!(foreign, Err(UseCaseError::NotFound(_))));

    // A malformed request is rejected before the bundle is looked up
    let mut bad_labels = create_request("other", "bun_bob");
    bad_labels.labels.remove("team");
    assert!(matches!(
        h.use_cases.create("alice", bad_labels).await,
        Err(UseCaseError::InvalidRequest(_))
    ));

    let mut bad_resources = create_request("other", "bun_missing");
    bad_resources.cpus = Quantity::Number(0.0);
    assert!(matches!(
        h.use_cases.create("alice", bad_resources).await,
        Err(UseCaseError::InvalidRequest(_))
    ));

    let missing = h
        .use_cases
        .create("alice", create_request("other", "bun_missing"))
        .await;
    assert!(matches!(missing, Err(UseCaseError::NotFound(_))));

    // Same name is fine for a different owner
    h.use_cases
        .create("bob", create_request("demo", "bun_bob"))
        .await
        .unwrap();
}

#[tokio::test]
async fn test_create_validation_errors_are_client_errors() {
    let h = harness();

    let mut request = create_request("demo", "bun_alice");
    request.labels.remove("team");
    assert!(matches!(
        h.use_cases.create("alice", request).await,
        Err(UseCaseError::InvalidRequest(_))
    ));

    let mut request = create_request("demo", "bun_alice");
    request.post_inference_hooks = Some(vec!["callback".to_string()]);
    assert!(matches!(
        h.use_cases.create("alice", request).await,
        Err(UseCaseError::InvalidRequest(_))
    ));

    let mut request = create_request("demo", "bun_alice");
    request.min_workers = 5;
    assert!(matches!(
        h.use_cases.create("alice", request).await,
        Err(UseCaseError::InvalidRequest(_))
    ));

    assert!(h
        .use_cases
        .list("alice", None, EndpointOrderBy::Newest)
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_get_hides_other_owners() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    let endpoint = h.use_cases.get("alice", &id).await.unwrap();
    assert!(endpoint.infra_state.is_some());

    assert!(matches!(
        h.use_cases.get("bob", &id).await,
        Err(UseCaseError::NotFound(_))
    ));
    assert!(matches!(
        h.use_cases.get("alice", "end_missing").await,
        Err(UseCaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_list_filters_by_exact_name_and_owner() {
    let h = harness();
    h.use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await
        .unwrap();
    h.use_cases
        .create("alice", create_request("demo-2", "bun_alice"))
        .await
        .unwrap();
    h.use_cases
        .create("bob", create_request("demo", "bun_bob"))
        .await
        .unwrap();

    let named = h
        .use_cases
        .list("alice", Some("demo"), EndpointOrderBy::Newest)
        .await
        .unwrap();
    assert_eq!(named.len(), 1);
    assert_eq!(named[0].record.name, "demo");
    assert_eq!(named[0].record.owner, "alice");

    let alphabetical = h
        .use_cases
        .list("alice", None, EndpointOrderBy::Alphabetical)
        .await
        .unwrap();
    let names: Vec<_> = alphabetical.iter().map(|e| e.record.name.as_str()).collect();
    assert_eq!(names, vec!["demo", "demo-2"]);

    let bob = h
        .use_cases
        .list("bob", None, EndpointOrderBy::Newest)
        .await
        .unwrap();
    assert_eq!(bob.len(), 1);
    assert_eq!(bob[0].record.owner, "bob");
}

#[tokio::test]
async fn test_update_before_infra_exists_is_transient() {
    let h = harness_with_delay(Duration::from_secs(60));
    h.use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await
        .unwrap();
    let id = h
        .repository
        .get_record_by_name("alice", "demo")
        .await
        .unwrap()
        .unwrap()
        .id;

    // Nothing has converged yet, so no infra state is known
    let result = h
        .use_cases
        .update("alice", &id, UpdateEndpointRequest::default())
        .await;
    assert!(matches!(result, Err(UseCaseError::InfraStateNotFound(_))));
}

#[tokio::test]
async fn test_update_without_readable_config_is_refused() {
    let h = harness();
    let mut request = create_request("demo", "bun_alice");
    request.post_inference_hooks = Some(vec!["callback".to_string()]);
    request.default_callback_url = Some("http://callback.internal/done".to_string());
    h.use_cases.create("alice", request).await.unwrap();
    let id = h
        .repository
        .get_record_by_name("alice", "demo")
        .await
        .unwrap()
        .unwrap()
        .id;
    h.reconciler.reconcile_all().await.unwrap();
    assert_eq!(status(&h, &id).await, EndpointStatus::Ready);

    let use_cases = EndpointUseCases::new(
        h.repository.clone(),
        Arc::new(InMemoryBundleRepository::new()),
        Arc::new(ConfiglessGateway(h.gateway.clone())),
        h.guard.clone(),
    );
    let update = UpdateEndpointRequest {
        max_workers: Some(3),
        ..Default::default()
    };
    assert!(matches!(
        use_cases.update("alice", &id, update).await,
        Err(UseCaseError::InfraStateNotFound(_))
    ));

    // Nothing was written, so the hooks survive
    assert_eq!(status(&h, &id).await, EndpointStatus::Ready);
    let last = h.gateway.last_request(&id).await.unwrap();
    let config = last.endpoint_config().unwrap().unwrap();
    assert_eq!(config.post_inference_hooks, Some(vec!["callback".to_string()]));
}

#[tokio::test]
async fn test_partial_update_keeps_unset_fields() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    let request = UpdateEndpointRequest {
        max_workers: Some(5),
        ..Default::default()
    };
    h.use_cases.update("alice", &id, request.clone()).await.unwrap();
    assert_eq!(status(&h, &id).await, EndpointStatus::UpdatePending);

    h.reconciler.reconcile_all().await.unwrap();
    let first = h.gateway.last_request(&id).await.unwrap();
    assert_eq!(first.deployment_state.max_workers, 5);
    assert_eq!(first.deployment_state.min_workers, 1);
    assert_eq!(first.deployment_state.per_worker, 4);
    assert_eq!(first.resource_state.memory, Quantity::from("8Gi"));
    assert_eq!(first.labels.get("team").map(String::as_str), Some("ml"));

    // Applying the same partial update again changes nothing
    h.use_cases.update("alice", &id, request).await.unwrap();
    h.reconciler.reconcile_all().await.unwrap();
    let second = h.gateway.last_request(&id).await.unwrap();
    assert_eq!(first.resource_state, second.resource_state);
    assert_eq!(first.deployment_state, second.deployment_state);
    assert_eq!(first.labels, second.labels);
    assert_eq!(first.endpoint_config().unwrap(), second.endpoint_config().unwrap());
}

#[tokio::test]
async fn test_update_can_swap_bundle() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    let request = UpdateEndpointRequest {
        model_bundle_id: Some("bun_alice_2".to_string()),
        ..Default::default()
    };
    h.use_cases.update("alice", &id, request).await.unwrap();

    let record = h.repository.get_record(&id).await.unwrap().unwrap();
    assert_eq!(record.current_model_bundle.id, "bun_alice_2");

    h.reconciler.reconcile_all().await.unwrap();
    let foreign = UpdateEndpointRequest {
        model_bundle_id: Some("bun_bob".to_string()),
        ..Default::default()
    };
    assert!(matches!(
        h.use_cases.update("alice", &id, foreign).await,
        Err(UseCaseError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_update_rejects_invalid_merge() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    let request = UpdateEndpointRequest {
        min_workers: Some(10),
        ..Default::default()
    };
    assert!(matches!(
        h.use_cases.update("alice", &id, request).await,
        Err(UseCaseError::InvalidRequest(_))
    ));
    assert_eq!(status(&h, &id).await, EndpointStatus::Ready);
}

#[tokio::test]
async fn test_concurrent_mutation_is_rejected() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    // Another instance holds the claim
    let claim = h.guard.try_claim(&id).await.unwrap().unwrap();

    assert!(matches!(
        h.use_cases
            .update("alice", &id, UpdateEndpointRequest::default())
            .await,
        Err(UseCaseError::OperationInProgress(_))
    ));
    assert!(matches!(
        h.use_cases.delete("alice", &id).await,
        Err(UseCaseError::OperationInProgress(_))
    ));
    assert_eq!(status(&h, &id).await, EndpointStatus::Ready);

    h.guard.release(&claim).await.unwrap();
    h.use_cases
        .update("alice", &id, UpdateEndpointRequest::default())
        .await
        .unwrap();
}

#[tokio::test]
async fn test_delete_during_update_is_rejected() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    let request = UpdateEndpointRequest {
        max_workers: Some(3),
        ..Default::default()
    };
    h.use_cases.update("alice", &id, request).await.unwrap();

    assert!(matches!(
        h.use_cases.delete("alice", &id).await,
        Err(UseCaseError::OperationInProgress(_))
    ));
    // Nor can a second update start while the first converges
    assert!(matches!(
        h.use_cases
            .update("alice", &id, UpdateEndpointRequest::default())
            .await,
        Err(UseCaseError::OperationInProgress(_))
    ));

    h.reconciler.reconcile_all().await.unwrap();
    let response = h.use_cases.delete("alice", &id).await.unwrap();
    assert!(response.deleted);
}

#[tokio::test]
async fn test_failed_rollout_ends_in_update_failed() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    h.gateway.fail_next_apply();
    let request = UpdateEndpointRequest {
        max_workers: Some(4),
        ..Default::default()
    };
    h.use_cases.update("alice", &id, request).await.unwrap();
    h.reconciler.reconcile_all().await.unwrap();
    assert_eq!(status(&h, &id).await, EndpointStatus::UpdateFailed);

    // A failed endpoint accepts a retry
    h.use_cases
        .update("alice", &id, UpdateEndpointRequest::default())
        .await
        .unwrap();
    h.reconciler.reconcile_all().await.unwrap();
    assert_eq!(status(&h, &id).await, EndpointStatus::Ready);
}

#[tokio::test]
async fn test_rejected_provisioning_marks_update_failed() {
    let h = harness();
    h.gateway.set_reject_applies(true);

    let result = h
        .use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await;
    assert!(matches!(result, Err(UseCaseError::Internal(_))));

    let record = h
        .repository
        .get_record_by_name("alice", "demo")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(record.status, EndpointStatus::UpdateFailed);
}

#[tokio::test]
async fn test_failed_teardown_keeps_record() {
    let h = harness();
    let id = ready_endpoint(&h, "alice", "demo", "bun_alice").await;

    h.gateway.set_fail_deletes(true);
    assert!(matches!(
        h.use_cases.delete("alice", &id).await,
        Err(UseCaseError::DeleteFailed(_))
    ));
    assert_eq!(status(&h, &id).await, EndpointStatus::DeleteInProgress);
    assert!(h.gateway.has_deployment(&id).await);

    // Retrying the delete is the recovery path
    h.gateway.set_fail_deletes(false);
    assert!(h.use_cases.delete("alice", &id).await.unwrap().deleted);
    assert!(h.repository.get_record(&id).await.unwrap().is_none());
    assert!(!h.gateway.has_deployment(&id).await);
}

#[tokio::test]
async fn test_reconciler_skips_claimed_endpoints() {
    let h = harness();
    h.use_cases
        .create("alice", create_request("demo", "bun_alice"))
        .await
        .unwrap();
    let id = h
        .repository
        .get_record_by_name("alice", "demo")
        .await
        .unwrap()
        .unwrap()
        .id;

    let claim = h.guard.try_claim(&id).await.unwrap().unwrap();
    assert_eq!(h.reconciler.reconcile_all().await.unwrap(), 0);
    assert_eq!(status(&h, &id).await, EndpointStatus::UpdatePending);

    h.guard.release(&claim).await.unwrap();
    assert_eq!(h.reconciler.reconcile_all().await.unwrap(), 1);
    assert_eq!(status(&h, &id).await, EndpointStatus::Ready);
}
