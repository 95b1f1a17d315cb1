//! Persistence seams for endpoint records, model bundles and batch jobs

use anyhow::Result;
use async_trait::async_trait;
use endpoint_common::{BatchCompletionsJob, EndpointRecord, ModelBundle};

/// Durable store of endpoint records
#[async_trait]
pub trait EndpointRepository: Send + Sync {
    /// Insert a new record. Returns `Ok(false)` if the owner already has an
    /// endpoint with the same name.
    async fn create_record(&self, record: &EndpointRecord) -> Result<bool>;

    async fn get_record(&self, endpoint_id: &str) -> Result<Option<EndpointRecord>>;

    async fn get_record_by_name(&self, owner: &str, name: &str) -> Result<Option<EndpointRecord>>;

    /// Records owned by `owner`, optionally restricted to an exact name
    async fn list_records(&self, owner: &str, name: Option<&str>) -> Result<Vec<EndpointRecord>>;

    /// Ids of records whose status is still converging
    async fn list_converging(&self) -> Result<Vec<String>>;

    /// Overwrite an existing record. Returns `Ok(false)` if it is gone.
    async fn update_record(&self, record: &EndpointRecord) -> Result<bool>;

    async fn delete_record(&self, endpoint_id: &str) -> Result<bool>;
}

/// Read access to model bundles
#[async_trait]
pub trait BundleRepository: Send + Sync {
    async fn get_bundle(&self, bundle_id: &str) -> Result<Option<ModelBundle>>;
}

/// Store of batch completion jobs
#[async_trait]
pub trait BatchJobRepository: Send + Sync {
    async fn create_job(&self, job: &BatchCompletionsJob) -> Result<()>;

    async fn get_job(&self, job_id: &str) -> Result<Option<BatchCompletionsJob>>;

    async fn update_job(&self, job: &BatchCompletionsJob) -> Result<bool>;

    async fn list_jobs(&self, owner: &str) -> Result<Vec<BatchCompletionsJob>>;
}
