//! Status reconciler
//!
//! Walks endpoints whose status is still converging, observes their
//! infrastructure and advances status along the lifecycle edges. A record is
//! only advanced by an observation of the task it is waiting on.

use anyhow::Result;
use endpoint_common::{EndpointRecord, EndpointStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::conflict_guard::{run_exclusive, ConflictGuard};
use crate::error::UseCaseError;
use crate::gateway::{InfraGateway, InfraObservation, InfraPhase};
use crate::repository::EndpointRepository;

/// Status changes implied by an observation, in the order they must be
/// applied. Empty when the observation does not concern the record's
/// current task or nothing has changed.
pub fn plan_transitions(
    record: &EndpointRecord,
    observation: &InfraObservation,
) -> Vec<EndpointStatus> {
    use EndpointStatus::*;

    // Work that was accepted and then vanished will never converge
    if observation.phase == InfraPhase::Absent {
        return match record.status {
            UpdatePending => vec![UpdateInProgress, UpdateFailed],
            UpdateInProgress => vec![UpdateFailed],
            _ => Vec::new(),
        };
    }

    if record.creation_task_id.is_none() || observation.task_id != record.creation_task_id {
        return Vec::new();
    }

    match (record.status, observation.phase) {
        (UpdatePending, InfraPhase::Applying) => vec![UpdateInProgress],
        (UpdatePending, InfraPhase::Ready) => vec![UpdateInProgress, Ready],
        (UpdatePending, InfraPhase::Failed) => vec![UpdateInProgress, UpdateFailed],
        (UpdateInProgress, InfraPhase::Ready) => vec![Ready],
        (UpdateInProgress, InfraPhase::Failed) => vec![UpdateFailed],
        _ => Vec::new(),
    }
}

/// Background status reconciler
pub struct Reconciler {
    repository: Arc<dyn EndpointRepository>,
    gateway: Arc<dyn InfraGateway>,
    guard: Arc<dyn ConflictGuard>,
    interval: Duration,
}

impl Reconciler {
    pub fn new(
        repository: Arc<dyn EndpointRepository>,
        gateway: Arc<dyn InfraGateway>,
        guard: Arc<dyn ConflictGuard>,
        interval: Duration,
    ) -> Self {
        Self {
            repository,
            gateway,
            guard,
            interval,
        }
    }

    /// Run until `shutdown` is cancelled
    pub async fn run(self, shutdown: CancellationToken) {
        info!("Reconciler started (interval {:?})", self.interval);

        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Reconciler stopping");
                    break;
                }
                _ = ticker.tick() => {
                    if let Err(e) = self.reconcile_all().await {
                        error!("Reconcile pass failed: {:#}", e);
                    }
                }
            }
        }
    }

    /// One pass over every converging endpoint. Returns how many changed.
    pub async fn reconcile_all(&self) -> Result<usize> {
        let ids = self.repository.list_converging().await?;
        let mut changed = 0;

        for id in ids {
            match self.reconcile_endpoint(&id).await {
                Ok(true) => changed += 1,
                Ok(false) => {}
                Err(e) => warn!("Failed to reconcile {}: {:#}", id, e),
            }
        }

        if changed > 0 {
            debug!("Reconciled {} endpoint(s)", changed);
        }
        Ok(changed)
    }

    /// Reconcile one endpoint. Skipped (returns `Ok(false)`) when another
    /// mutation holds it.
    pub async fn reconcile_endpoint(&self, endpoint_id: &str) -> Result<bool> {
        let outcome = run_exclusive(self.guard.as_ref(), endpoint_id, async {
            let Some(mut record) = self.repository.get_record(endpoint_id).await? else {
                return Ok(false);
            };
            // Observed under the claim so a create cannot slip in between
            let observation = self.gateway.observe(endpoint_id).await?;

            let transitions = plan_transitions(&record, &observation);
            if transitions.is_empty() {
                return Ok(false);
            }

            for next in transitions {
                record.transition_to(next)?;
            }
            self.repository.update_record(&record).await?;

            info!("Endpoint {} is now {}", endpoint_id, record.status);
            if let (EndpointStatus::UpdateFailed, Some(message)) =
                (record.status, observation.message.as_deref())
            {
                warn!("Endpoint {} update failed: {}", endpoint_id, message);
            }
            Ok::<_, UseCaseError>(true)
        })
        .await;

        match outcome {
            Ok(changed) => Ok(changed),
            Err(UseCaseError::OperationInProgress(_)) => {
                debug!("Skipping {}: mutation in progress", endpoint_id);
                Ok(false)
            }
            Err(e) => Err(anyhow::anyhow!(e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_common::{EndpointType, ModelBundle};

    fn record(status: EndpointStatus, task_id: Option<&str>) -> EndpointRecord {
        let mut record = EndpointRecord::new(
            "end_1".to_string(),
            "demo".to_string(),
            "owner".to_string(),
            EndpointType::Sync,
            ModelBundle::new("b".to_string(), "b".to_string(), "owner".to_string()),
        );
        record.status = status;
        record.creation_task_id = task_id.map(str::to_string);
        record
    }

    fn observation(phase: InfraPhase, task_id: Option<&str>) -> InfraObservation {
        InfraObservation {
            phase,
            task_id: task_id.map(str::to_string),
            infra_state: None,
            message: None,
        }
    }

    #[test]
    fn test_ready_always_goes_through_in_progress() {
        use EndpointStatus::*;

        let plan = plan_transitions(
            &record(UpdatePending, Some("t1")),
            &observation(InfraPhase::Ready, Some("t1")),
        );
        assert_eq!(plan, vec![UpdateInProgress, Ready]);

        let plan = plan_transitions(
            &record(UpdateInProgress, Some("t1")),
            &observation(InfraPhase::Ready, Some("t1")),
        );
        assert_eq!(plan, vec![Ready]);
    }

    #[test]
    fn test_stale_task_is_ignored() {
        let plan = plan_transitions(
            &record(EndpointStatus::UpdatePending, Some("t2")),
            &observation(InfraPhase::Ready, Some("t1")),
        );
        assert!(plan.is_empty());

        let plan = plan_transitions(
            &record(EndpointStatus::UpdatePending, None),
            &observation(InfraPhase::Ready, None),
        );
        assert!(plan.is_empty());
    }

    #[test]
    fn test_settled_records_are_left_alone() {
        for status in [
            EndpointStatus::Ready,
            EndpointStatus::UpdateFailed,
            EndpointStatus::DeleteInProgress,
        ] {
            let plan = plan_transitions(
                &record(status, Some("t1")),
                &observation(InfraPhase::Failed, Some("t1")),
            );
            assert!(plan.is_empty());
        }
    }

    #[test]
    fn test_vanished_work_fails() {
        let plan = plan_transitions(
            &record(EndpointStatus::UpdatePending, Some("t1")),
            &observation(InfraPhase::Absent, None),
        );
        assert_eq!(
            plan,
            vec![EndpointStatus::UpdateInProgress, EndpointStatus::UpdateFailed]
        );
    }

    #[test]
    fn test_every_plan_follows_lifecycle_edges() {
        use EndpointStatus::*;
        let statuses = [Ready, UpdatePending, UpdateInProgress, UpdateFailed, DeleteInProgress];
        let phases = [
            InfraPhase::Absent,
            InfraPhase::Pending,
            InfraPhase::Applying,
            InfraPhase::Ready,
            InfraPhase::Failed,
        ];

        for status in statuses {
            for phase in phases {
                let mut rec = record(status, Some("t1"));
                for next in plan_transitions(&rec, &observation(phase, Some("t1"))) {
                    rec.transition_to(next).unwrap();
                }
            }
        }
    }
}
