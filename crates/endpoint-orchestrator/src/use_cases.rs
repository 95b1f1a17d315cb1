//! Endpoint use cases: create, get, list, update and delete
//!
//! Every mutation runs under the endpoint's conflict-guard claim and only
//! moves status along the lifecycle edges. Storage and gateway failures are
//! translated into [`UseCaseError`] here and never leak past this boundary.

use anyhow::Context;
use endpoint_common::{Endpoint, EndpointRecord, EndpointStatus, InfraState, ModelBundle};
use futures::future::join_all;
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::conflict_guard::{run_exclusive, ConflictGuard};
use crate::desired::DesiredEndpoint;
use crate::error::{Result, UseCaseError};
use crate::gateway::InfraGateway;
use crate::models::{
    sort_records, CreateEndpointRequest, CreateEndpointResponse, DeleteEndpointResponse,
    EndpointOrderBy, UpdateEndpointRequest, UpdateEndpointResponse,
};
use crate::repository::{BundleRepository, EndpointRepository};
use crate::validation::{validate_create_request, validate_desired};

/// Endpoint lifecycle operations
#[derive(Clone)]
pub struct EndpointUseCases {
    repository: Arc<dyn EndpointRepository>,
    bundles: Arc<dyn BundleRepository>,
    gateway: Arc<dyn InfraGateway>,
    guard: Arc<dyn ConflictGuard>,
}

impl EndpointUseCases {
    pub fn new(
        repository: Arc<dyn EndpointRepository>,
        bundles: Arc<dyn BundleRepository>,
        gateway: Arc<dyn InfraGateway>,
        guard: Arc<dyn ConflictGuard>,
    ) -> Self {
        Self {
            repository,
            bundles,
            gateway,
            guard,
        }
    }

    /// Accept a new endpoint and start provisioning it.
    ///
    /// Returns as soon as the gateway has accepted the work; callers poll
    /// [`EndpointUseCases::get`] for status.
    pub async fn create(
        &self,
        owner: &str,
        request: CreateEndpointRequest,
    ) -> Result<CreateEndpointResponse> {
        validate_create_request(&request)?;
        let bundle = self.owned_bundle(owner, &request.model_bundle_id).await?;
        let desired = DesiredEndpoint::from_create(&request, bundle.clone());

        if self
            .repository
            .get_record_by_name(owner, &request.name)
            .await?
            .is_some()
        {
            return Err(already_exists(&request.name));
        }

        let endpoint_id = format!("end_{}", uuid::Uuid::new_v4().simple());
        let mut record = EndpointRecord::new(
            endpoint_id.clone(),
            request.name.clone(),
            owner.to_string(),
            request.endpoint_type,
            bundle,
        );
        desired.apply_to_record(&mut record);

        let task_id = run_exclusive(self.guard.as_ref(), &endpoint_id, async {
            if !self.repository.create_record(&record).await? {
                return Err(already_exists(&record.name));
            }
            self.provision(&mut record, &desired).await
        })
        .await?;

        info!(
            "Creating endpoint {} ({}) for {}: task {}",
            endpoint_id, request.name, owner, task_id
        );

        Ok(CreateEndpointResponse {
            endpoint_creation_task_id: task_id,
        })
    }

    /// Fetch one endpoint with its observed infra state
    pub async fn get(&self, owner: &str, endpoint_id: &str) -> Result<Endpoint> {
        let record = self.owned_record(owner, endpoint_id).await?;
        let infra_state = self.observe_infra_state(&record).await;

        Ok(Endpoint {
            record,
            infra_state,
        })
    }

    /// Endpoints owned by `owner`, optionally with an exact name, in a
    /// deterministic order
    pub async fn list(
        &self,
        owner: &str,
        name: Option<&str>,
        order_by: EndpointOrderBy,
    ) -> Result<Vec<Endpoint>> {
        let mut records = self.repository.list_records(owner, name).await?;
        records.retain(|r| r.owner == owner && name.map_or(true, |n| r.name == n));
        sort_records(&mut records, order_by);

        let infra_states = join_all(records.iter().map(|r| self.observe_infra_state(r))).await;

        Ok(records
            .into_iter()
            .zip(infra_states)
            .map(|(record, infra_state)| Endpoint {
                record,
                infra_state,
            })
            .collect())
    }

    /// Apply a partial update. Fields absent from `request` keep their
    /// current values.
    pub async fn update(
        &self,
        owner: &str,
        endpoint_id: &str,
        request: UpdateEndpointRequest,
    ) -> Result<UpdateEndpointResponse> {
        let record = self.owned_record(owner, endpoint_id).await?;

        let observation = self
            .gateway
            .observe(endpoint_id)
            .await
            .context("Failed to observe endpoint infrastructure")?;
        let infra_state: InfraState = observation
            .infra_state
            .ok_or_else(|| UseCaseError::InfraStateNotFound(endpoint_id.to_string()))?;
        // Without the stored config a partial update would wipe hooks and callbacks
        if infra_state.user_config_state.endpoint_config.is_none() {
            error!("Endpoint {} has no readable endpoint config", endpoint_id);
            return Err(UseCaseError::InfraStateNotFound(endpoint_id.to_string()));
        }

        let bundle = match &request.model_bundle_id {
            Some(bundle_id) => Some(self.owned_bundle(owner, bundle_id).await?),
            None => None,
        };

        let desired = DesiredEndpoint::from_current(&record, &infra_state).merge(&request, bundle);
        validate_desired(&desired)?;

        let task_id = run_exclusive(self.guard.as_ref(), endpoint_id, async {
            // Re-read under the claim
            let mut record = self.owned_record(owner, endpoint_id).await?;
            if !record.status.accepts_update() {
                return Err(UseCaseError::OperationInProgress(endpoint_id.to_string()));
            }

            record.transition_to(EndpointStatus::UpdatePending)?;
            desired.apply_to_record(&mut record);
            if !self.repository.update_record(&record).await? {
                return Err(not_found(endpoint_id));
            }

            self.provision(&mut record, &desired).await
        })
        .await?;

        info!("Updating endpoint {}: task {}", endpoint_id, task_id);

        Ok(UpdateEndpointResponse {
            endpoint_creation_task_id: task_id,
        })
    }

    /// Tear down an endpoint. The record is purged only after teardown is
    /// confirmed; otherwise it stays in DELETE_IN_PROGRESS and the call fails
    /// with [`UseCaseError::DeleteFailed`].
    pub async fn delete(&self, owner: &str, endpoint_id: &str) -> Result<DeleteEndpointResponse> {
        self.owned_record(owner, endpoint_id).await?;

        run_exclusive(self.guard.as_ref(), endpoint_id, async {
            let mut record = self.owned_record(owner, endpoint_id).await?;
            if record.status.is_converging() {
                return Err(UseCaseError::OperationInProgress(endpoint_id.to_string()));
            }

            record.transition_to(EndpointStatus::DeleteInProgress)?;
            self.repository.update_record(&record).await?;

            match self.gateway.delete_resources(endpoint_id).await {
                Ok(true) => {
                    self.repository.delete_record(endpoint_id).await?;
                    info!("Deleted endpoint {} ({})", endpoint_id, record.name);
                    Ok(DeleteEndpointResponse { deleted: true })
                }
                Ok(false) => {
                    error!(
                        "Teardown of {} not confirmed; compute resources may still exist",
                        endpoint_id
                    );
                    Err(UseCaseError::DeleteFailed(endpoint_id.to_string()))
                }
                Err(e) => {
                    error!(
                        "Teardown of {} failed; compute resources may still exist: {:#}",
                        endpoint_id, e
                    );
                    Err(UseCaseError::DeleteFailed(endpoint_id.to_string()))
                }
            }
        })
        .await
    }

    /// Hand the desired state to the gateway and record the task id.
    ///
    /// A rejected hand-off marks the mutation failed so the endpoint does not
    /// stay converging on work that never started.
    async fn provision(
        &self,
        record: &mut EndpointRecord,
        desired: &DesiredEndpoint,
    ) -> Result<String> {
        let request = desired.provision_request(record)?;

        match self.gateway.create_or_update_resources(&request).await {
            Ok(task_id) => {
                record.creation_task_id = Some(task_id.clone());
                record.touch();
                self.repository.update_record(record).await?;
                Ok(task_id)
            }
            Err(e) => {
                error!("Infrastructure rejected changes for {}: {:#}", record.id, e);

                record.transition_to(EndpointStatus::UpdateInProgress)?;
                record.transition_to(EndpointStatus::UpdateFailed)?;
                self.repository.update_record(record).await?;

                Err(UseCaseError::Internal(
                    e.context("Failed to provision endpoint resources"),
                ))
            }
        }
    }

    async fn owned_record(&self, owner: &str, endpoint_id: &str) -> Result<EndpointRecord> {
        match self.repository.get_record(endpoint_id).await? {
            Some(record) if record.owner == owner => Ok(record),
            _ => Err(not_found(endpoint_id)),
        }
    }

    async fn owned_bundle(&self, owner: &str, bundle_id: &str) -> Result<ModelBundle> {
        match self.bundles.get_bundle(bundle_id).await? {
            Some(bundle) if bundle.owner == owner => Ok(bundle),
            _ => Err(UseCaseError::NotFound(format!(
                "Model bundle {} not found",
                bundle_id
            ))),
        }
    }

    async fn observe_infra_state(&self, record: &EndpointRecord) -> Option<InfraState> {
        match self.gateway.observe(&record.id).await {
            Ok(observation) => observation.infra_state,
            Err(e) => {
                warn!("Could not observe infrastructure for {}: {:#}", record.id, e);
                None
            }
        }
    }
}

fn not_found(endpoint_id: &str) -> UseCaseError {
    UseCaseError::NotFound(format!("Model endpoint {} not found", endpoint_id))
}

fn already_exists(name: &str) -> UseCaseError {
    UseCaseError::AlreadyExists(format!("Model endpoint {} already exists", name))
}
