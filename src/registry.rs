use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::task::JoinError;

use crate::job::JobData;

/// Error from dispatching a job to its handler
#[derive(Debug, thiserror::Error)]
pub enum WorkError {
    #[error("no handler registered for job: {0}")]
    HandlerNotFound(String),

    // The exact text `timeout` is recorded on the job
    #[error("timeout")]
    Timeout,

    #[error("invalid job params: {0}")]
    Params(#[from] serde_json::Error),

    #[error("{0}")]
    Execution(String),
}

type HandlerResult = Result<Value, WorkError>;
type BoxedHandler =
    Arc<dyn Fn(Value) -> Pin<Box<dyn Future<Output = HandlerResult> + Send>> + Send + Sync>;

/// Dynamic name-to-handler dispatch table owned by the worker
pub struct HandlerRegistry {
    handlers: RwLock<HashMap<String, BoxedHandler>>,
}

impl Default for HandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(HashMap::new()),
        }
    }

    /// Register a handler for a job-type name
    ///
    /// Params are deserialized into `T` before the handler runs; use
    /// `serde_json::Value` for the raw document. The last registration
    /// for a name wins.
    pub fn register<T, F, Fut>(&self, name: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        let handler = Arc::new(handler);

        let boxed: BoxedHandler = Arc::new(move |params: Value| {
            let handler = Arc::clone(&handler);
            Box::pin(async move {
                let args: T = serde_json::from_value(params)?;
                handler(args).await.map_err(WorkError::Execution)
            })
        });

        let mut handlers = self.handlers.write().unwrap_or_else(|e| e.into_inner());
        handlers.insert(name.to_string(), boxed);
    }

    /// Names with a registered handler, used to scope the claim query
    pub fn names(&self) -> Vec<String> {
        let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
        handlers.keys().cloned().collect()
    }

    /// Run the job's handler, racing it against the job's timeout
    ///
    /// The handler runs on its own task; when the timeout fires first
    /// the task is aborted, so a late completion cannot surface after
    /// the job has been failed.
    pub async fn execute(&self, job: &JobData) -> Result<Value, WorkError> {
        let handler = {
            let handlers = self.handlers.read().unwrap_or_else(|e| e.into_inner());
            handlers
                .get(&job.name)
                .cloned()
                .ok_or_else(|| WorkError::HandlerNotFound(job.name.clone()))?
        };

        let future = handler(job.params.clone());
        let mut handle = tokio::spawn(future);

        let join_to_error = |e: JoinError| {
            if e.is_panic() {
                WorkError::Execution("handler panicked".to_string())
            } else {
                WorkError::Execution("handler cancelled".to_string())
            }
        };

        match job.timeout {
            Some(ms) => {
                tokio::select! {
                    res = &mut handle => res.map_err(join_to_error)?,
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {
                        handle.abort();
                        Err(WorkError::Timeout)
                    }
                }
            }
            None => handle.await.map_err(join_to_error)?,
        }
    }
}
