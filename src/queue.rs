use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value;

use crate::job::{Job, JobData, JobError, JobId, JobStatus};
use crate::retry::Attempts;
use crate::storage::{Storage, StorageError};

/// Options accepted by [`Queue::enqueue`]
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Absolute not-eligible-before instant; defaults to now
    pub delay: Option<DateTime<Utc>>,
    /// Higher priority claims first; defaults to 0
    pub priority: Option<i64>,
    pub attempts: Option<Attempts>,
    /// Handler deadline in milliseconds
    pub timeout: Option<u64>,
}

/// Filters applied by [`Queue::dequeue`]
#[derive(Debug, Clone, Default)]
pub struct DequeueOptions {
    /// Only claim jobs at or above this priority
    pub min_priority: Option<i64>,
    /// Only claim jobs whose type name is in this set; an empty set
    /// matches nothing
    pub names: Option<Vec<String>>,
}

/// A named logical partition over the shared jobs collection
///
/// Stateless beyond its name and the storage handle; any number of
/// queues and workers may point at the same storage.
#[derive(Clone)]
pub struct Queue {
    name: String,
    storage: Arc<dyn Storage>,
}

impl Queue {
    pub fn new<S: Into<String>>(name: S, storage: Arc<dyn Storage>) -> Self {
        Self {
            name: name.into(),
            storage,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Wrap raw job data in a [`Job`] bound to this queue's storage
    pub fn job(&self, data: JobData) -> Job {
        Job::new(data, Arc::clone(&self.storage))
    }

    /// Build and persist a queued job, returning it
    pub async fn enqueue(
        &self,
        name: &str,
        params: Value,
        options: EnqueueOptions,
    ) -> Result<Job, JobError> {
        let data = JobData {
            id: None,
            queue: self.name.clone(),
            name: name.to_string(),
            params,
            status: JobStatus::Queued,
            priority: options.priority.unwrap_or(0),
            delay: options.delay,
            timeout: options.timeout,
            attempts: options.attempts,
            enqueued: None,
            dequeued: None,
            ended: None,
            result: None,
            error: None,
            stack: None,
        };

        let mut job = self.job(data);
        job.enqueue().await?;
        Ok(job)
    }

    /// Atomically claim the best eligible job, if any
    ///
    /// Eligible means status queued, queue name equal to this queue's
    /// name, delay elapsed, and matching the option filters. Selection
    /// is priority descending, then creation order ascending.
    pub async fn dequeue(&self, options: &DequeueOptions) -> Result<Option<Job>, StorageError> {
        let claimed = self.storage.claim(&self.name, options).await?;
        Ok(claimed.map(|data| self.job(data)))
    }

    /// Fetch a job by id, scoped to this queue
    pub async fn get(&self, id: &JobId) -> Result<Option<Job>, StorageError> {
        let found = self.storage.get(&self.name, id).await?;
        Ok(found.map(|data| self.job(data)))
    }
}
