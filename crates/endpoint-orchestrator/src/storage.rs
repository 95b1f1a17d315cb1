//! Redis storage for endpoint records, model bundles and batch jobs
//!
//! Key scheme:
//! - `endpoint:{id}` -> JSON `EndpointRecord`
//! - `endpoint_name:{owner}:{name}` -> endpoint id (claimed with SETNX)
//! - `endpoints:owner:{owner}` -> set of endpoint ids
//! - `endpoints:all` -> set of every endpoint id
//! - `endpoints:converging` -> ids in UPDATE_PENDING / UPDATE_IN_PROGRESS
//! - `model_bundle:{id}` -> JSON `ModelBundle`
//! - `batch_job:{id}` -> JSON `BatchCompletionsJob`
//! - `batch_jobs:owner:{owner}` -> set of job ids

use anyhow::{Context, Result};
use async_trait::async_trait;
use endpoint_common::{BatchCompletionsJob, EndpointRecord, ModelBundle};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::repository::{BatchJobRepository, BundleRepository, EndpointRepository};

const ALL_ENDPOINTS_KEY: &str = "endpoints:all";
const CONVERGING_KEY: &str = "endpoints:converging";

/// Claims the owner's name and writes the record and its indexes.
///
/// KEYS = name, endpoint, owner set, all set, converging set;
/// ARGV = id, record JSON, converging flag
const CREATE_SCRIPT: &str = r#"
if redis.call('SET', KEYS[1], ARGV[1], 'NX') == false then
    return 0
end
redis.call('SET', KEYS[2], ARGV[2])
redis.call('SADD', KEYS[3], ARGV[1])
redis.call('SADD', KEYS[4], ARGV[1])
if ARGV[3] == '1' then
    redis.call('SADD', KEYS[5], ARGV[1])
end
return 1
"#;

fn endpoint_key(id: &str) -> String {
    format!("endpoint:{}", id)
}

fn name_key(owner: &str, name: &str) -> String {
    format!("endpoint_name:{}:{}", owner, name)
}

fn owner_key(owner: &str) -> String {
    format!("endpoints:owner:{}", owner)
}

fn bundle_key(id: &str) -> String {
    format!("model_bundle:{}", id)
}

fn job_key(id: &str) -> String {
    format!("batch_job:{}", id)
}

fn job_owner_key(owner: &str) -> String {
    format!("batch_jobs:owner:{}", owner)
}

/// Redis-backed storage
#[derive(Clone)]
pub struct RedisStorage {
    conn: ConnectionManager,
}

impl RedisStorage {
    /// Create a new storage instance
    pub async fn new(redis_url: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url).context("Failed to create Redis client")?;

        let conn = ConnectionManager::new(client)
            .await
            .context("Failed to connect to Redis")?;

        info!("Connected to Redis at {}", redis_url);

        Ok(Self { conn })
    }

    /// Connection handle for sharing with other Redis-backed components
    pub fn connection(&self) -> ConnectionManager {
        self.conn.clone()
    }

    /// Store a model bundle
    pub async fn put_bundle(&self, bundle: &ModelBundle) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(bundle).context("Failed to serialize bundle")?;
        let _: () = conn.set(bundle_key(&bundle.id), json).await?;

        debug!("Stored model bundle: {}", bundle.id);
        Ok(())
    }

    async fn get_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        let mut conn = self.conn.clone();
        let json: Option<String> = conn.get(key).await?;

        match json {
            Some(data) => {
                let value = serde_json::from_str(&data)
                    .with_context(|| format!("Failed to deserialize {}", key))?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }
}

#[async_trait]
impl EndpointRepository for RedisStorage {
    async fn create_record(&self, record: &EndpointRecord) -> Result<bool> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(record).context("Failed to serialize endpoint")?;

        // Name claim and record writes land together or not at all
        let created: i64 = redis::Script::new(CREATE_SCRIPT)
            .key(name_key(&record.owner, &record.name))
            .key(endpoint_key(&record.id))
            .key(owner_key(&record.owner))
            .key(ALL_ENDPOINTS_KEY)
            .key(CONVERGING_KEY)
            .arg(&record.id)
            .arg(json)
            .arg(if record.status.is_converging() { 1 } else { 0 })
            .invoke_async(&mut conn)
            .await
            .context("Failed to store endpoint")?;

        if created == 0 {
            debug!(
                "Endpoint name already taken for owner {}: {}",
                record.owner, record.name
            );
            return Ok(false);
        }

        info!("Stored endpoint {} ({})", record.id, record.name);
        Ok(true)
    }

    async fn get_record(&self, endpoint_id: &str) -> Result<Option<EndpointRecord>> {
        self.get_json(&endpoint_key(endpoint_id)).await
    }

    async fn get_record_by_name(&self, owner: &str, name: &str) -> Result<Option<EndpointRecord>> {
        let mut conn = self.conn.clone();
        let id: Option<String> = conn.get(name_key(owner, name)).await?;

        match id {
            Some(id) => self.get_record(&id).await,
            None => Ok(None),
        }
    }

    async fn list_records(&self, owner: &str, name: Option<&str>) -> Result<Vec<EndpointRecord>> {
        if let Some(name) = name {
            return Ok(self
                .get_record_by_name(owner, name)
                .await?
                .into_iter()
                .collect());
        }

        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(owner_key(owner)).await?;

        let mut records = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(record) = self.get_record(&id).await? {
                records.push(record);
            }
        }
        Ok(records)
    }

    async fn list_converging(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(CONVERGING_KEY).await?;
        Ok(ids)
    }

    async fn update_record(&self, record: &EndpointRecord) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = endpoint_key(&record.id);

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            debug!("Endpoint not found for update: {}", record.id);
            return Ok(false);
        }

        let json = serde_json::to_string(record).context("Failed to serialize endpoint")?;

        let mut pipe = redis::pipe();
        pipe.atomic().set(&key, json);
        if record.status.is_converging() {
            pipe.sadd(CONVERGING_KEY, &record.id);
        } else {
            pipe.srem(CONVERGING_KEY, &record.id);
        }
        let _: () = pipe.query_async(&mut conn).await?;

        debug!("Updated endpoint {} -> {}", record.id, record.status);
        Ok(true)
    }

    async fn delete_record(&self, endpoint_id: &str) -> Result<bool> {
        let Some(record) = self.get_record(endpoint_id).await? else {
            return Ok(false);
        };

        let mut conn = self.conn.clone();
        let _: () = redis::pipe()
            .atomic()
            .del(endpoint_key(endpoint_id))
            .del(name_key(&record.owner, &record.name))
            .srem(owner_key(&record.owner), endpoint_id)
            .srem(ALL_ENDPOINTS_KEY, endpoint_id)
            .srem(CONVERGING_KEY, endpoint_id)
            .query_async(&mut conn)
            .await?;

        info!("Deleted endpoint record: {}", endpoint_id);
        Ok(true)
    }
}

#[async_trait]
impl BundleRepository for RedisStorage {
    async fn get_bundle(&self, bundle_id: &str) -> Result<Option<ModelBundle>> {
        self.get_json(&bundle_key(bundle_id)).await
    }
}

#[async_trait]
impl BatchJobRepository for RedisStorage {
    async fn create_job(&self, job: &BatchCompletionsJob) -> Result<()> {
        let mut conn = self.conn.clone();
        let json = serde_json::to_string(job).context("Failed to serialize batch job")?;

        let _: () = redis::pipe()
            .atomic()
            .set(job_key(&job.job_id), json)
            .sadd(job_owner_key(&job.owner), &job.job_id)
            .query_async(&mut conn)
            .await?;

        info!("Stored batch job {} for {}", job.job_id, job.owner);
        Ok(())
    }

    async fn get_job(&self, job_id: &str) -> Result<Option<BatchCompletionsJob>> {
        self.get_json(&job_key(job_id)).await
    }

    async fn update_job(&self, job: &BatchCompletionsJob) -> Result<bool> {
        let mut conn = self.conn.clone();
        let key = job_key(&job.job_id);

        let exists: bool = conn.exists(&key).await?;
        if !exists {
            return Ok(false);
        }

        let json = serde_json::to_string(job).context("Failed to serialize batch job")?;
        let _: () = conn.set(&key, json).await?;

        debug!("Updated batch job {} -> {:?}", job.job_id, job.status);
        Ok(true)
    }

    async fn list_jobs(&self, owner: &str) -> Result<Vec<BatchCompletionsJob>> {
        let mut conn = self.conn.clone();
        let ids: Vec<String> = conn.smembers(job_owner_key(owner)).await?;

        let mut jobs = Vec::with_capacity(ids.len());
        for id in ids {
            if let Some(job) = self.get_job(&id).await? {
                jobs.push(job);
            }
        }
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(jobs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use endpoint_common::{EndpointStatus, EndpointType};

    fn record(owner: &str, name: &str) -> EndpointRecord {
        EndpointRecord::new(
            format!("end_{}", uuid::Uuid::new_v4().simple()),
            name.to_string(),
            owner.to_string(),
            EndpointType::Sync,
            ModelBundle::new("bun_1".to_string(), "bundle".to_string(), owner.to_string()),
        )
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_record_lifecycle() {
        let storage = RedisStorage::new("redis://127.0.0.1:6379").await.unwrap();
        let owner = format!("owner-{}", uuid::Uuid::new_v4());
        let mut rec = record(&owner, "demo");

        assert!(storage.create_record(&rec).await.unwrap());
        assert!(!storage.create_record(&record(&owner, "demo")).await.unwrap());
        assert!(storage.list_converging().await.unwrap().contains(&rec.id));

        rec.transition_to(EndpointStatus::UpdateInProgress).unwrap();
        rec.transition_to(EndpointStatus::Ready).unwrap();
        assert!(storage.update_record(&rec).await.unwrap());
        assert!(!storage.list_converging().await.unwrap().contains(&rec.id));

        let by_name = storage.get_record_by_name(&owner, "demo").await.unwrap();
        assert_eq!(by_name.map(|r| r.id), Some(rec.id.clone()));

        assert!(storage.delete_record(&rec.id).await.unwrap());
        assert!(storage.get_record(&rec.id).await.unwrap().is_none());
        assert!(storage.list_records(&owner, None).await.unwrap().is_empty());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_losing_create_writes_nothing() {
        let storage = RedisStorage::new("redis://127.0.0.1:6379").await.unwrap();
        let owner = format!("owner-{}", uuid::Uuid::new_v4());
        let winner = record(&owner, "shared-name");
        let loser = record(&owner, "shared-name");

        assert!(storage.create_record(&winner).await.unwrap());
        assert!(!storage.create_record(&loser).await.unwrap());

        assert!(storage.get_record(&loser.id).await.unwrap().is_none());
        assert!(!storage.list_converging().await.unwrap().contains(&loser.id));
        let ids: Vec<String> = storage
            .list_records(&owner, None)
            .await
            .unwrap()
            .into_iter()
            .map(|r| r.id)
            .collect();
        assert_eq!(ids, vec![winner.id.clone()]);

        // Name is free again once the holder is gone
        assert!(storage.delete_record(&winner.id).await.unwrap());
        assert!(storage.create_record(&loser).await.unwrap());
        let by_name = storage.get_record_by_name(&owner, "shared-name").await.unwrap();
        assert_eq!(by_name.map(|r| r.id), Some(loser.id.clone()));
        assert!(storage.delete_record(&loser.id).await.unwrap());
    }

    #[tokio::test]
    #[ignore] // Requires Redis
    async fn test_bundle_round_trip() {
        let storage = RedisStorage::new("redis://127.0.0.1:6379").await.unwrap();
        let bundle = ModelBundle::new(
            format!("bun_{}", uuid::Uuid::new_v4().simple()),
            "bundle".to_string(),
            "owner".to_string(),
        );

        storage.put_bundle(&bundle).await.unwrap();
        let fetched = storage.get_bundle(&bundle.id).await.unwrap().unwrap();
        assert_eq!(fetched.name, "bundle");
    }
}
