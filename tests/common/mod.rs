#![allow(dead_code)]

use jobq::{Connection, Worker, WorkerEvent};
use tempfile::TempDir;

/// Open a connection against a fresh database file
///
/// The TempDir must stay alive for as long as the connection is used.
pub async fn connect() -> (Connection, TempDir) {
    let dir = tempfile::tempdir().expect("create temp dir");
    let url = format!("sqlite://{}/jobs.db?mode=rwc", dir.path().display());
    let conn = Connection::open(&url).await.expect("open connection");
    (conn, dir)
}

/// Run the worker until every queue comes up empty, then stop it
///
/// Returns the events emitted before the first `Empty`.
pub async fn run_until_empty(worker: &mut Worker) -> Vec<WorkerEvent> {
    let mut events = worker.subscribe();
    worker.start();

    let mut seen = Vec::new();
    loop {
        match events.recv().await {
            Ok(WorkerEvent::Empty) => break,
            Ok(event) => seen.push(event),
            Err(e) => panic!("event stream ended unexpectedly: {e}"),
        }
    }

    worker.stop().await;
    seen
}

pub fn event_name(event: &WorkerEvent) -> &'static str {
    match event {
        WorkerEvent::Dequeued(_) => "dequeued",
        WorkerEvent::Complete(_) => "complete",
        WorkerEvent::Failed(_) => "failed",
        WorkerEvent::Done(_) => "done",
        WorkerEvent::Empty => "empty",
        WorkerEvent::Error(_) => "error",
    }
}
