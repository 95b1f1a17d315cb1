//! Batch completion job bookkeeping

use chrono::Duration;
use endpoint_common::BatchCompletionsJob;
use std::sync::Arc;
use tracing::info;

use crate::error::{Result, UseCaseError};
use crate::models::CreateBatchJobRequest;
use crate::repository::BatchJobRepository;

/// Longest runtime a job may request, in seconds
pub const MAX_BATCH_RUNTIME_SECS: i64 = 2 * 24 * 3600;

/// CRUD over batch completion jobs
#[derive(Clone)]
pub struct BatchJobUseCases {
    repository: Arc<dyn BatchJobRepository>,
}

impl BatchJobUseCases {
    pub fn new(repository: Arc<dyn BatchJobRepository>) -> Self {
        Self { repository }
    }

    pub async fn create(&self, owner: &str, request: CreateBatchJobRequest) -> Result<String> {
        if !(1..=MAX_BATCH_RUNTIME_SECS).contains(&request.max_runtime_sec) {
            return Err(UseCaseError::InvalidRequest(format!(
                "max_runtime_sec must be between 1 and {}",
                MAX_BATCH_RUNTIME_SECS
            )));
        }
        if request.model_config.num_shards == 0 {
            return Err(UseCaseError::InvalidRequest(
                "num_shards must be at least 1".to_string(),
            ));
        }
        if request.output_data_path.trim().is_empty() {
            return Err(UseCaseError::InvalidRequest(
                "output_data_path is required".to_string(),
            ));
        }

        let job_id = format!("batch_{}", uuid::Uuid::new_v4().simple());
        let mut job = BatchCompletionsJob::new(
            job_id.clone(),
            owner.to_string(),
            request.output_data_path,
            request.model_config,
            Duration::seconds(request.max_runtime_sec),
        );
        job.input_data_path = request.input_data_path;
        job.set_priority(request.priority)?;
        job.metadata = request.labels;

        self.repository.create_job(&job).await?;

        info!("Created batch job {} for {}", job_id, owner);
        Ok(job_id)
    }

    pub async fn get(&self, owner: &str, job_id: &str) -> Result<BatchCompletionsJob> {
        match self.repository.get_job(job_id).await? {
            Some(job) if job.owner == owner => Ok(job),
            _ => Err(UseCaseError::NotFound(format!(
                "Batch job {} not found",
                job_id
            ))),
        }
    }

    pub async fn list(&self, owner: &str) -> Result<Vec<BatchCompletionsJob>> {
        Ok(self.repository.list_jobs(owner).await?)
    }

    pub async fn update_priority(
        &self,
        owner: &str,
        job_id: &str,
        priority: Option<String>,
    ) -> Result<BatchCompletionsJob> {
        let mut job = self.get(owner, job_id).await?;
        job.set_priority(priority)?;
        self.repository.update_job(&job).await?;
        Ok(job)
    }

    /// Cancel a job. Cancelling an already-cancelled job is a no-op.
    pub async fn cancel(&self, owner: &str, job_id: &str) -> Result<BatchCompletionsJob> {
        let mut job = self.get(owner, job_id).await?;
        job.cancel()?;
        self.repository.update_job(&job).await?;

        info!("Cancelled batch job {}", job_id);
        Ok(job)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryBatchJobRepository;
    use endpoint_common::{BatchJobStatus, BatchModelConfig};
    use std::collections::HashMap;

    fn request(max_runtime_sec: i64) -> CreateBatchJobRequest {
        CreateBatchJobRequest {
            input_data_path: Some("s3://in/data.jsonl".to_string()),
            output_data_path: "s3://out/".to_string(),
            model_config: BatchModelConfig {
                model: "llama-2-7b".to_string(),
                checkpoint_path: None,
                num_shards: 1,
                max_context_length: None,
                seed: None,
                labels: HashMap::new(),
            },
            priority: None,
            max_runtime_sec,
            labels: HashMap::new(),
        }
    }

    fn use_cases() -> BatchJobUseCases {
        BatchJobUseCases::new(Arc::new(InMemoryBatchJobRepository::new()))
    }

    #[tokio::test]
    async fn test_create_and_cancel() {
        let jobs = use_cases();
        let job_id = jobs.create("alice", request(3600)).await.unwrap();

        let job = jobs.get("alice", &job_id).await.unwrap();
        assert_eq!(job.status, BatchJobStatus::Queued);

        let job = jobs.cancel("alice", &job_id).await.unwrap();
        assert_eq!(job.status, BatchJobStatus::Cancelled);
        assert!(job.completed_at.is_some());

        let err = jobs
            .update_priority("alice", &job_id, Some("high".to_string()))
            .await
            .unwrap_err();
        assert!(matches!(err, UseCaseError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn test_jobs_are_owner_scoped() {
        let jobs = use_cases();
        let job_id = jobs.create("alice", request(60)).await.unwrap();

        assert!(matches!(
            jobs.get("bob", &job_id).await,
            Err(UseCaseError::NotFound(_))
        ));
        assert!(jobs.list("bob").await.unwrap().is_empty());
        assert_eq!(jobs.list("alice").await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_runtime_bounds() {
        let jobs = use_cases();
        assert!(jobs.create("alice", request(0)).await.is_err());
        assert!(jobs
            .create("alice", request(MAX_BATCH_RUNTIME_SECS + 1))
            .await
            .is_err());
    }
}
