mod connection;
mod job;
mod profiler;
mod queue;
mod registry;
mod retry;
mod storage;
mod worker;

pub use connection::Connection;
pub use job::{Job, JobData, JobError, JobId, JobStatus};
pub use profiler::{Profiler, StageStats};
pub use queue::{DequeueOptions, EnqueueOptions, Queue};
pub use registry::{HandlerRegistry, WorkError};
pub use retry::{Attempts, Strategy};
pub use storage::{SqliteStorage, Storage, StorageError};
pub use worker::{Worker, WorkerEvent, WorkerOptions};
