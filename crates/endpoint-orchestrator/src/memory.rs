//! In-memory repositories for mock mode and tests

use anyhow::Result;
use async_trait::async_trait;
use endpoint_common::{BatchCompletionsJob, EndpointRecord, ModelBundle};
use std::collections::HashMap;
use std::sync::Mutex;

use crate::repository::{BatchJobRepository, BundleRepository, EndpointRepository};

/// In-memory endpoint records
#[derive(Default)]
pub struct InMemoryEndpointRepository {
    records: Mutex<HashMap<String, EndpointRecord>>,
}

impl InMemoryEndpointRepository {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, EndpointRecord>> {
        // A poisoned map still holds consistent records
        self.records.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl EndpointRepository for InMemoryEndpointRepository {
    async fn create_record(&self, record: &EndpointRecord) -> Result<bool> {
        let mut records = self.lock();
        let taken = records
            .values()
            .any(|r| r.owner == record.owner && r.name == record.name);
        if taken || records.contains_key(&record.id) {
            return Ok(false);
        }
        records.insert(record.id.clone(), record.clone());
        Ok(true)
    }

    async fn get_record(&self, endpoint_id: &str) -> Result<Option<EndpointRecord>> {
        Ok(self.lock().get(endpoint_id).cloned())
    }

    async fn get_record_by_name(&self, owner: &str, name: &str) -> Result<Option<EndpointRecord>> {
        Ok(self
            .lock()
            .values()
            .find(|r| r.owner == owner && r.name == name)
            .cloned())
    }

    async fn list_records(&self, owner: &str, name: Option<&str>) -> Result<Vec<EndpointRecord>> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.owner == owner && name.map_or(true, |n| r.name == n))
            .cloned()
            .collect())
    }

    async fn list_converging(&self) -> Result<Vec<String>> {
        Ok(self
            .lock()
            .values()
            .filter(|r| r.status.is_converging())
            .map(|r| r.id.clone())
            .collect())
    }

    async fn update_record(&self, record: &EndpointRecord) -> Result<bool> {
        let mut records = self.lock();
        match records.get_mut(&record.id) {
            Some(existing) => {
                *existing = record.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn delete_record(&self, endpoint_id: &str) -> Result<bool> {
        Ok(self.lock().remove(endpoint_id).is_some())
    }
}

/// In-memory model bundles
#[derive(Default)]
pub struct InMemoryBundleRepository {
    bundles: Mutex<HashMap<String, ModelBundle>>,
}

impl InMemoryBundleRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bundles(bundles: impl IntoIterator<Item = ModelBundle>) -> Self {
        let repo = Self::new();
        for bundle in bundles {
            repo.put_bundle(bundle);
        }
        repo
    }

    pub fn put_bundle(&self, bundle: ModelBundle) {
        self.bundles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(bundle.id.clone(), bundle);
    }
}

#[async_trait]
impl BundleRepository for InMemoryBundleRepository {
    async fn get_bundle(&self, bundle_id: &str) -> Result<Option<ModelBundle>> {
        Ok(self
            .bundles
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(bundle_id)
            .cloned())
    }
}

/// In-memory batch jobs
#[derive(Default)]
pub struct InMemoryBatchJobRepository {
    jobs: Mutex<HashMap<String, BatchCompletionsJob>>,
}

impl InMemoryBatchJobRepository {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl BatchJobRepository for InMemoryBatchJobRepository {
    async fn create_job(&self, job: &BatchCompletionsJob) -> Result<()> {
        self.jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(job.job_id.clone(), job.clone());
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BatchCompletionsJob>> {
        Ok(self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(job_id)
            .cloned())
    }

    async fn update_job(&self, job: &BatchCompletionsJob) -> Result<bool> {
        let mut jobs = self.jobs.lock().unwrap_or_else(|e| e.into_inner());
        match jobs.get_mut(&job.job_id) {
            Some(existing) => {
                *existing = job.clone();
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn list_jobs(&self, owner: &str) -> Result<Vec<BatchCompletionsJob>> {
        let mut jobs: Vec<_> = self
            .jobs
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .values()
            .filter(|j| j.owner == owner)
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}
