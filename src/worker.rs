use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::broadcast;
use tokio::task::{JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::job::{Job, JobData};
use crate::queue::{DequeueOptions, Queue};
use crate::registry::HandlerRegistry;
use crate::retry::{Attempts, Disposition, StrategySet};

const EVENT_CAPACITY: usize = 256;

/// Lifecycle signals published by a running worker
///
/// `Complete`/`Failed` always precede the matching `Done`; `Done`
/// precedes the next poll cycle. Every failed attempt emits `Failed`,
/// not only the terminal one.
#[derive(Debug, Clone)]
pub enum WorkerEvent {
    Dequeued(JobData),
    Complete(JobData),
    Failed(JobData),
    Done(JobData),
    Empty,
    Error(String),
}

#[derive(Debug, Clone)]
pub struct WorkerOptions {
    /// Sleep between polls when every queue came up empty
    pub interval: Duration,
    /// Only claim jobs at or above this priority
    pub min_priority: Option<i64>,
    /// Claim the next job without waiting for the previous one to
    /// finalize
    pub parallel: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            min_priority: None,
            parallel: false,
        }
    }
}

enum PollOutcome {
    Claimed,
    Empty,
}

/// Polls queues, claims jobs, and drives them through their handlers
///
/// Multiple workers may run against the same storage; the atomic claim
/// in [`Queue::dequeue`] is the only coordination between them.
pub struct Worker {
    inner: Arc<Inner>,
    shutdown: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

struct Inner {
    queues: Vec<Queue>,
    registry: HandlerRegistry,
    strategies: StrategySet,
    options: WorkerOptions,
    events: broadcast::Sender<WorkerEvent>,
}

impl Worker {
    pub fn new(queues: Vec<Queue>, options: WorkerOptions) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);

        Self {
            inner: Arc::new(Inner {
                queues,
                registry: HandlerRegistry::new(),
                strategies: StrategySet::new(),
                options,
                events,
            }),
            shutdown: CancellationToken::new(),
            handle: None,
        }
    }

    /// Register a handler for a job-type name; the last registration
    /// for a name wins. Only registered names are claimed.
    pub fn register<T, F, Fut>(&self, name: &str, handler: F)
    where
        T: DeserializeOwned + Send + 'static,
        F: Fn(T) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, String>> + Send + 'static,
    {
        self.inner.registry.register(name, handler);
    }

    /// Register a named retry strategy
    pub fn register_strategy<S, F>(&self, name: S, strategy: F)
    where
        S: Into<String>,
        F: Fn(&Attempts, &str, &JobData) -> Option<u64> + Send + Sync + 'static,
    {
        self.inner.strategies.register(name, strategy);
    }

    /// Subscribe to lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<WorkerEvent> {
        self.inner.events.subscribe()
    }

    /// Begin the poll loop; idempotent, and valid again after `stop`
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }

        if self.shutdown.is_cancelled() {
            self.shutdown = CancellationToken::new();
        }

        let inner = Arc::clone(&self.inner);
        let shutdown = self.shutdown.clone();

        self.handle = Some(tokio::spawn(async move {
            inner.run(shutdown).await;
        }));
    }

    /// Request shutdown and wait for in-flight work to finalize
    ///
    /// Idempotent; no claim attempt occurs after this returns. An
    /// already-dispatched handler runs to completion or to its own
    /// timeout.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();

        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task failed during shutdown");
            }
        }
    }
}

impl Inner {
    async fn run(self: Arc<Self>, shutdown: CancellationToken) {
        let queues: Vec<&str> = self.queues.iter().map(|q| q.name()).collect();
        info!(?queues, parallel = self.options.parallel, "worker started");

        let mut cursor = 0usize;
        let mut in_flight = JoinSet::new();

        while !shutdown.is_cancelled() {
            // Reap tasks that finished since the last pass; the set
            // only ever holds genuinely in-flight work
            while in_flight.try_join_next().is_some() {}

            match Arc::clone(&self).poll(&mut cursor, &mut in_flight).await {
                PollOutcome::Claimed => {}
                PollOutcome::Empty => {
                    self.emit(WorkerEvent::Empty);

                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(self.options.interval) => {}
                    }
                }
            }
        }

        // Parallel mode: already-claimed jobs finish before the worker
        // reports stopped
        while in_flight.join_next().await.is_some() {}

        info!("worker stopped");
    }

    /// Try each queue once, round-robin, resuming just after the queue
    /// that last yielded a job
    async fn poll(self: Arc<Self>, cursor: &mut usize, in_flight: &mut JoinSet<()>) -> PollOutcome {
        if self.queues.is_empty() {
            return PollOutcome::Empty;
        }

        let options = DequeueOptions {
            min_priority: self.options.min_priority,
            names: Some(self.registry.names()),
        };

        for step in 0..self.queues.len() {
            let index = (*cursor + step) % self.queues.len();
            let queue = &self.queues[index];

            match queue.dequeue(&options).await {
                Ok(Some(job)) => {
                    *cursor = (index + 1) % self.queues.len();
                    debug!(queue = queue.name(), job = %job, name = %job.data.name, "job claimed");
                    self.emit(WorkerEvent::Dequeued(job.data.clone()));

                    if self.options.parallel {
                        let worker = Arc::clone(&self);
                        in_flight.spawn(async move {
                            worker.work(job).await;
                        });
                    } else {
                        self.work(job).await;
                    }

                    return PollOutcome::Claimed;
                }
                Ok(None) => {}
                Err(err) if err.is_transient() => {
                    debug!(queue = queue.name(), error = %err, "transient storage error, will retry");
                }
                Err(err) => {
                    error!(queue = queue.name(), error = %err, "dequeue failed");
                    self.emit(WorkerEvent::Error(err.to_string()));
                }
            }
        }

        PollOutcome::Empty
    }

    /// Dispatch a claimed job to its handler and finalize the outcome
    async fn work(&self, mut job: Job) {
        match self.registry.execute(&job.data).await {
            Ok(result) => {
                if let Err(e) = job.complete(Some(result)).await {
                    error!(job = %job, error = %e, "failed to record job completion");
                    self.emit(WorkerEvent::Error(e.to_string()));
                    return;
                }

                debug!(job = %job, name = %job.data.name, "job complete");
                self.emit(WorkerEvent::Complete(job.data.clone()));
                self.emit(WorkerEvent::Done(job.data.clone()));
            }
            Err(err) => {
                let message = err.to_string();

                let finalized = match self.strategies.decide(&mut job.data, &message) {
                    Disposition::Retry { backoff } => {
                        debug!(job = %job, error = %message, backoff, "job failed, re-queuing");
                        job.delay(backoff).await
                    }
                    Disposition::Fail => {
                        debug!(job = %job, error = %message, "job failed terminally");
                        job.fail(&err).await
                    }
                };

                if let Err(e) = finalized {
                    error!(job = %job, error = %e, "failed to record job failure");
                    self.emit(WorkerEvent::Error(e.to_string()));
                    return;
                }

                self.emit(WorkerEvent::Failed(job.data.clone()));
                self.emit(WorkerEvent::Done(job.data.clone()));
            }
        }
    }

    fn emit(&self, event: WorkerEvent) {
        // A send error only means nobody is subscribed
        let _ = self.events.send(event);
    }
}
