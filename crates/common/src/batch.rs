//! Batch completion job entity

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::error::{Error, Result};

/// Batch job status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchJobStatus {
    /// Waiting to be scheduled
    Queued,
    /// Running on the inference backend
    Running,
    /// Finished successfully
    Completed,
    /// Finished with an error
    Failed,
    /// Cancelled by the owner
    Cancelled,
    /// Status could not be determined
    Unknown,
}

impl BatchJobStatus {
    /// Terminal statuses never change again
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            BatchJobStatus::Completed | BatchJobStatus::Failed | BatchJobStatus::Cancelled
        )
    }
}

/// Model settings a batch job runs with
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchModelConfig {
    /// Model to run
    pub model: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checkpoint_path: Option<String>,

    #[serde(default = "default_num_shards")]
    pub num_shards: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_context_length: Option<u32>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub seed: Option<i64>,

    #[serde(default)]
    pub labels: HashMap<String, String>,
}

fn default_num_shards() -> u32 {
    1
}

/// A batch completions job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchCompletionsJob {
    /// Unique job identifier
    pub job_id: String,

    /// Owning tenant
    pub owner: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input_data_path: Option<String>,

    pub output_data_path: String,

    pub model_config: BatchModelConfig,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<String>,

    pub status: BatchJobStatus,

    pub created_at: DateTime<Utc>,

    /// When the job stops being eligible to run
    pub expires_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl BatchCompletionsJob {
    /// Create a queued job that expires after `max_runtime`
    pub fn new(
        job_id: String,
        owner: String,
        output_data_path: String,
        model_config: BatchModelConfig,
        max_runtime: Duration,
    ) -> Self {
        let created_at = Utc::now();
        Self {
            job_id,
            owner,
            input_data_path: None,
            output_data_path,
            model_config,
            priority: None,
            status: BatchJobStatus::Queued,
            created_at,
            expires_at: created_at + max_runtime,
            completed_at: None,
            metadata: HashMap::new(),
        }
    }

    /// Move to a new status. Terminal jobs are frozen.
    pub fn set_status(&mut self, status: BatchJobStatus) -> Result<()> {
        if self.status.is_terminal() && status != self.status {
            return Err(Error::InvalidJobTransition(format!(
                "job {} is already {:?}",
                self.job_id, self.status
            )));
        }

        self.status = status;
        if status.is_terminal() && self.completed_at.is_none() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    /// Cancel the job
    pub fn cancel(&mut self) -> Result<()> {
        self.set_status(BatchJobStatus::Cancelled)
    }

    /// Change scheduling priority of a job that has not finished
    pub fn set_priority(&mut self, priority: Option<String>) -> Result<()> {
        if self.status.is_terminal() {
            return Err(Error::InvalidJobTransition(format!(
                "cannot change priority of {:?} job {}",
                self.status, self.job_id
            )));
        }
        self.priority = priority;
        Ok(())
    }
}
