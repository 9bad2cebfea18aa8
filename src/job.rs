use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{fmt, sync::Arc};

use crate::retry::Attempts;
use crate::storage::{Storage, StorageError};

/// Unique identifier for a job
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct JobId(pub String);

impl JobId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl AsRef<str> for JobId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Current status of a job
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Dequeued,
    Complete,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Queued => "queued",
            JobStatus::Dequeued => "dequeued",
            JobStatus::Complete => "complete",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_db(status: &str) -> Self {
        match status {
            "queued" => JobStatus::Queued,
            "dequeued" => JobStatus::Dequeued,
            "complete" => JobStatus::Complete,
            "failed" => JobStatus::Failed,
            "cancelled" => JobStatus::Cancelled,
            _ => JobStatus::Queued,
        }
    }
}

/// Error from a job mutation operation
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error("only queued jobs may be cancelled (status: {0})")]
    NotCancellable(&'static str),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// The persisted state of a job
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobData {
    /// Assigned on first save if absent
    pub id: Option<JobId>,
    pub queue: String,
    /// Job-type name, used to look up the registered handler
    pub name: String,
    pub params: Value,
    pub status: JobStatus,
    /// Higher priority jobs are claimed first
    pub priority: i64,
    /// Not eligible for claiming before this instant
    pub delay: Option<DateTime<Utc>>,
    /// Handler deadline in milliseconds
    pub timeout: Option<u64>,
    pub attempts: Option<Attempts>,
    pub enqueued: Option<DateTime<Utc>>,
    pub dequeued: Option<DateTime<Utc>>,
    pub ended: Option<DateTime<Utc>>,
    pub result: Option<Value>,
    pub error: Option<String>,
    pub stack: Option<String>,
}

/// A job bound to its backing storage
///
/// All mutations go through `complete`/`fail`/`cancel`/`delay`/`enqueue`,
/// each of which performs a single upsert.
pub struct Job {
    pub data: JobData,
    storage: Arc<dyn Storage>,
}

impl Job {
    pub(crate) fn new(data: JobData, storage: Arc<dyn Storage>) -> Self {
        Self { data, storage }
    }

    pub fn id(&self) -> Option<&JobId> {
        self.data.id.as_ref()
    }

    /// Upsert by identity, assigning an id on first save
    pub async fn save(&mut self) -> Result<(), JobError> {
        if self.data.id.is_none() {
            self.data.id = Some(JobId::new());
        }

        self.storage.upsert(&self.data).await?;
        Ok(())
    }

    /// Mark the job queued and persist it
    ///
    /// Used both for first submission and for re-queuing after a
    /// retryable failure.
    pub async fn enqueue(&mut self) -> Result<(), JobError> {
        if self.data.delay.is_none() {
            self.data.delay = Some(Utc::now());
        }

        self.data.status = JobStatus::Queued;

        if self.data.enqueued.is_none() {
            self.data.enqueued = Some(Utc::now());
        }

        self.save().await
    }

    /// Re-queue with a backoff of `delay` milliseconds from now
    pub async fn delay(&mut self, delay: u64) -> Result<(), JobError> {
        self.data.delay = Some(Utc::now() + chrono::Duration::milliseconds(delay as i64));

        self.enqueue().await
    }

    pub async fn complete(&mut self, result: Option<Value>) -> Result<(), JobError> {
        self.data.status = JobStatus::Complete;
        self.data.ended = Some(Utc::now());
        self.data.result = result;

        self.save().await
    }

    pub async fn fail<E>(&mut self, err: &E) -> Result<(), JobError>
    where
        E: fmt::Display + fmt::Debug,
    {
        self.data.status = JobStatus::Failed;
        self.data.ended = Some(Utc::now());
        self.data.error = Some(err.to_string());
        self.data.stack = Some(format!("{err:?}"));

        self.save().await
    }

    /// Cancel a job that has not been claimed yet
    pub async fn cancel(&mut self) -> Result<(), JobError> {
        if self.data.status != JobStatus::Queued {
            return Err(JobError::NotCancellable(self.data.status.as_str()));
        }

        self.data.status = JobStatus::Cancelled;
        self.data.ended = Some(Utc::now());

        self.save().await
    }
}

impl fmt::Display for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.data.id {
            Some(id) => write!(f, "{}", id),
            None => write!(f, "(unsaved)"),
        }
    }
}
