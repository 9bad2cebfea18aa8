pub mod sqlite;

use async_trait::async_trait;

use crate::job::{JobData, JobId};
use crate::queue::DequeueOptions;

pub use sqlite::SqliteStorage;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("database error: {0}")]
    Database(sqlx::Error),

    /// Transient condition; the poll loop retries on the next tick
    #[error("storage unavailable: {0}")]
    Unavailable(String),

    #[error("corrupt job record: {0}")]
    Corrupt(#[from] serde_json::Error),

    #[error("job has no identity")]
    MissingId,
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        if let sqlx::Error::Database(db) = &err {
            let message = db.message();
            if message.contains("database is locked")
                || message.contains("database table is locked")
            {
                return StorageError::Unavailable(message.to_string());
            }
        }

        StorageError::Database(err)
    }
}

impl StorageError {
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Unavailable(_))
    }
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Persistence operations the queue relies on
///
/// `claim` must be atomic against concurrent callers; it is the sole
/// mechanism preventing two workers from claiming the same job.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Replace-by-identity upsert
    async fn upsert(&self, job: &JobData) -> Result<()>;

    /// Atomically mark the best eligible job dequeued and return it
    async fn claim(&self, queue: &str, options: &DequeueOptions) -> Result<Option<JobData>>;

    async fn get(&self, queue: &str, id: &JobId) -> Result<Option<JobData>>;

    /// Bulk delete, for tests and external cleanup
    async fn clear(&self) -> Result<u64>;
}
