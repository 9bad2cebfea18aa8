mod common;

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use jobq::{
    DequeueOptions, EnqueueOptions, JobData, JobId, JobStatus, Queue, Storage, StorageError,
    Worker, WorkerEvent, WorkerOptions,
};
use serde_json::{json, Value};

fn fast() -> WorkerOptions {
    WorkerOptions {
        interval: Duration::from_millis(10),
        ..Default::default()
    }
}

#[test]
fn default_poll_interval_is_five_seconds() {
    assert_eq!(WorkerOptions::default().interval, Duration::from_secs(5));
}

#[tokio::test]
async fn completes_a_job_and_emits_events_in_order() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    queue
        .enqueue("example", json!({ "foo": "bar" }), EnqueueOptions::default())
        .await
        .expect("enqueue");

    let mut worker = conn.worker(&["default"], fast());
    worker.register("example", |params: Value| async move { Ok(params) });

    let events = common::run_until_empty(&mut worker).await;
    let names: Vec<&str> = events.iter().map(common::event_name).collect();
    assert_eq!(names, ["dequeued", "complete", "done"]);

    let id = match &events[0] {
        WorkerEvent::Dequeued(data) => data.id.clone().expect("claimed job has id"),
        other => panic!("expected dequeued event, got {other:?}"),
    };

    let job = queue.get(&id).await.expect("get").expect("job found");
    assert_eq!(job.data.status, JobStatus::Complete);
    assert_eq!(job.data.result, Some(json!({ "foo": "bar" })));
    assert!(job.data.ended.is_some());
    assert!(job.data.dequeued.is_some());
}

#[tokio::test]
async fn cycles_queues_round_robin() {
    let (conn, _dir) = common::connect().await;
    let foo = conn.queue("foo");
    let bar = conn.queue("bar");

    for (queue, label) in [(&foo, "f1"), (&foo, "f2"), (&bar, "b1")] {
        queue
            .enqueue("label", json!({ "label": label }), EnqueueOptions::default())
            .await
            .expect("enqueue");
    }

    let order = Arc::new(Mutex::new(Vec::new()));
    let mut worker = conn.worker(&["foo", "bar", "baz"], fast());
    {
        let order = Arc::clone(&order);
        worker.register("label", move |params: Value| {
            let order = Arc::clone(&order);
            async move {
                let label = params["label"].as_str().unwrap_or_default().to_string();
                order.lock().unwrap().push(label);
                Ok(Value::Null)
            }
        });
    }

    common::run_until_empty(&mut worker).await;

    // After foo yields, the next poll resumes at bar before returning
    // to foo for its second job
    assert_eq!(*order.lock().unwrap(), ["f1", "b1", "f2"]);
}

#[tokio::test]
async fn leaves_jobs_without_a_registered_handler_unclaimed() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    let job = queue
        .enqueue("unhandled", json!({}), EnqueueOptions::default())
        .await
        .expect("enqueue");
    let id = job.id().cloned().expect("id assigned");

    let mut worker = conn.worker(&["default"], fast());
    worker.register("something-else", |_: Value| async move { Ok(Value::Null) });

    common::run_until_empty(&mut worker).await;

    let found = queue.get(&id).await.expect("get").expect("job found");
    assert_eq!(found.data.status, JobStatus::Queued);
}

#[tokio::test]
async fn cancels_a_queued_job() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    let mut job = queue
        .enqueue("example", json!({}), EnqueueOptions::default())
        .await
        .expect("enqueue");

    job.cancel().await.expect("cancel");
    assert_eq!(job.data.status, JobStatus::Cancelled);
    assert!(job.data.ended.is_some());

    let id = job.id().cloned().expect("id assigned");
    let stored = queue.get(&id).await.expect("get").expect("job found");
    assert_eq!(stored.data.status, JobStatus::Cancelled);
}

#[tokio::test]
async fn refuses_to_cancel_a_finished_job() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    let job = queue
        .enqueue("example", json!({}), EnqueueOptions::default())
        .await
        .expect("enqueue");
    let id = job.id().cloned().expect("id assigned");

    let mut worker = conn.worker(&["default"], fast());
    worker.register("example", |_: Value| async move { Ok(Value::Null) });
    common::run_until_empty(&mut worker).await;

    let mut finished = queue.get(&id).await.expect("get").expect("job found");
    assert_eq!(finished.data.status, JobStatus::Complete);

    let err = finished.cancel().await.expect_err("cancel must fail");
    assert!(err.to_string().contains("only queued jobs"));

    // no mutation happened
    let stored = queue.get(&id).await.expect("get").expect("job found");
    assert_eq!(stored.data.status, JobStatus::Complete);
}

#[tokio::test]
async fn stop_waits_for_the_in_flight_job_and_is_idempotent() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    let first = queue
        .enqueue("slow", json!({}), EnqueueOptions::default())
        .await
        .expect("enqueue");
    let second = queue
        .enqueue("slow", json!({}), EnqueueOptions::default())
        .await
        .expect("enqueue");
    let first_id = first.id().cloned().expect("id assigned");
    let second_id = second.id().cloned().expect("id assigned");

    let mut worker = conn.worker(&["default"], fast());
    worker.register("slow", |_: Value| async move {
        tokio::time::sleep(Duration::from_millis(100)).await;
        Ok(Value::Null)
    });

    let mut events = worker.subscribe();
    worker.start();

    loop {
        match events.recv().await.expect("event") {
            WorkerEvent::Dequeued(_) => break,
            _ => {}
        }
    }

    worker.stop().await;
    worker.stop().await; // second stop is a no-op

    let first = queue.get(&first_id).await.expect("get").expect("found");
    assert_eq!(first.data.status, JobStatus::Complete);

    // no claim happened after stop settled
    let second = queue.get(&second_id).await.expect("get").expect("found");
    assert_eq!(second.data.status, JobStatus::Queued);
}

#[tokio::test]
async fn parallel_mode_dispatches_in_claim_order() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    for (label, sleep_ms) in [("a", 200u64), ("b", 10u64)] {
        queue
            .enqueue(
                "timed",
                json!({ "label": label, "sleep_ms": sleep_ms }),
                EnqueueOptions::default(),
            )
            .await
            .expect("enqueue");
    }

    let dispatch = Arc::new(Mutex::new(Vec::new()));
    let options = WorkerOptions {
        interval: Duration::from_millis(10),
        parallel: true,
        ..Default::default()
    };
    let mut worker = conn.worker(&["default"], options);
    {
        let dispatch = Arc::clone(&dispatch);
        worker.register("timed", move |params: Value| {
            let dispatch = Arc::clone(&dispatch);
            async move {
                let label = params["label"].as_str().unwrap_or_default().to_string();
                dispatch.lock().unwrap().push(label.clone());
                let ms = params["sleep_ms"].as_u64().unwrap_or_default();
                tokio::time::sleep(Duration::from_millis(ms)).await;
                Ok(json!(label))
            }
        });
    }

    let mut events = worker.subscribe();
    worker.start();

    let mut completed = Vec::new();
    while completed.len() < 2 {
        if let WorkerEvent::Complete(data) = events.recv().await.expect("event") {
            completed.push(data.params["label"].as_str().unwrap_or_default().to_string());
        }
    }
    worker.stop().await;

    // handlers start in claim order even though the short job
    // finalizes first
    assert_eq!(*dispatch.lock().unwrap(), ["a", "b"]);
    assert_eq!(completed, ["b", "a"]);
}

#[tokio::test]
async fn parallel_mode_sustains_a_long_run_of_jobs() {
    let (conn, _dir) = common::connect().await;
    let queue = conn.queue("default");

    let total = 20u32;
    for _ in 0..total {
        queue
            .enqueue("quick", json!({}), EnqueueOptions::default())
            .await
            .expect("enqueue");
    }

    let done = Arc::new(AtomicU32::new(0));
    let options = WorkerOptions {
        interval: Duration::from_millis(10),
        parallel: true,
        ..Default::default()
    };
    let mut worker = conn.worker(&["default"], options);
    {
        let done = Arc::clone(&done);
        worker.register("quick", move |_: Value| {
            let done = Arc::clone(&done);
            async move {
                tokio::time::sleep(Duration::from_millis(1)).await;
                done.fetch_add(1, Ordering::SeqCst);
                Ok(Value::Null)
            }
        });
    }

    let mut events = worker.subscribe();
    worker.start();

    let mut completed = 0;
    while completed < total {
        if let WorkerEvent::Complete(_) = events.recv().await.expect("event") {
            completed += 1;
        }
    }

    // finished tasks were reaped along the way, so nothing is left to
    // join and shutdown settles immediately
    tokio::time::timeout(Duration::from_secs(1), worker.stop())
        .await
        .expect("stop must not block on already-finished jobs");

    assert_eq!(done.load(Ordering::SeqCst), total);
}

struct FlakyStorage {
    claims: AtomicU32,
}

#[async_trait]
impl Storage for FlakyStorage {
    async fn upsert(&self, _job: &JobData) -> Result<(), StorageError> {
        Ok(())
    }

    async fn claim(
        &self,
        _queue: &str,
        _options: &DequeueOptions,
    ) -> Result<Option<JobData>, StorageError> {
        match self.claims.fetch_add(1, Ordering::SeqCst) {
            0 => Err(StorageError::Unavailable("database is locked".to_string())),
            1 => Err(serde_json::from_str::<Value>("{").unwrap_err().into()),
            _ => Ok(None),
        }
    }

    async fn get(&self, _queue: &str, _id: &JobId) -> Result<Option<JobData>, StorageError> {
        Ok(None)
    }

    async fn clear(&self) -> Result<u64, StorageError> {
        Ok(0)
    }
}

#[tokio::test]
async fn transient_dequeue_errors_are_swallowed_and_polling_continues() {
    let storage = Arc::new(FlakyStorage {
        claims: AtomicU32::new(0),
    });
    let queue = Queue::new("default", Arc::clone(&storage) as Arc<dyn Storage>);

    let mut worker = Worker::new(vec![queue], fast());
    worker.register("noop", |_: Value| async move { Ok(Value::Null) });

    let mut events = worker.subscribe();
    worker.start();

    // first tick hits the transient error: no Error event, just Empty
    let mut saw_error = false;
    let mut empties_before_error = 0;
    while !saw_error {
        match events.recv().await.expect("event") {
            WorkerEvent::Error(message) => {
                assert!(message.contains("corrupt"));
                saw_error = true;
            }
            WorkerEvent::Empty => empties_before_error += 1,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert_eq!(empties_before_error, 1);

    // the loop keeps polling after the surfaced error
    loop {
        if let WorkerEvent::Empty = events.recv().await.expect("event") {
            if storage.claims.load(Ordering::SeqCst) >= 3 {
                break;
            }
        }
    }

    worker.stop().await;
}

#[tokio::test]
async fn get_is_scoped_to_the_queue_name() {
    let (conn, _dir) = common::connect().await;
    let foo = conn.queue("foo");
    let bar = conn.queue("bar");

    let job = foo
        .enqueue("example", json!({}), EnqueueOptions::default())
        .await
        .expect("enqueue");
    let id = job.id().cloned().expect("id assigned");

    assert!(foo.get(&id).await.expect("get").is_some());
    assert!(bar.get(&id).await.expect("get").is_none());
}
