use std::sync::Arc;

use crate::queue::Queue;
use crate::storage::{SqliteStorage, Storage, StorageError};
use crate::worker::{Worker, WorkerOptions};

/// Shared storage handle and factory for queues and workers
///
/// Every queue and worker derived from one connection shares the same
/// pool; connect failures surface here rather than on first use.
pub struct Connection {
    storage: Arc<SqliteStorage>,
}

impl Connection {
    pub async fn open(database_url: &str) -> Result<Self, StorageError> {
        let storage = SqliteStorage::connect(database_url).await?;

        Ok(Self {
            storage: Arc::new(storage),
        })
    }

    pub fn queue(&self, name: &str) -> Queue {
        Queue::new(name, Arc::clone(&self.storage) as Arc<dyn Storage>)
    }

    /// Build a worker polling the named queues in order
    pub fn worker(&self, queues: &[&str], options: WorkerOptions) -> Worker {
        let queues = queues.iter().map(|name| self.queue(name)).collect();
        Worker::new(queues, options)
    }

    pub async fn close(&self) {
        self.storage.close().await;
    }
}
