use std::collections::HashMap;

use chrono::Utc;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
struct Stage {
    started_at: i64,
    ended_at: Option<i64>,
}

/// Timing for one completed stage, epoch milliseconds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageStats {
    pub started_at: i64,
    pub ended_at: i64,
    pub ms: i64,
}

/// Wall-clock instrumentation for the stages of a job
#[derive(Debug, Default)]
pub struct Profiler {
    log: HashMap<String, Stage>,
    pending: Vec<String>,
}

impl Profiler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn start(&mut self, name: &str) {
        if self.log.contains_key(name) {
            warn!(stage = name, "stage name is already in use");
        }

        self.log.insert(
            name.to_string(),
            Stage {
                started_at: Utc::now().timestamp_millis(),
                ended_at: None,
            },
        );
        self.pending.push(name.to_string());
    }

    pub fn end(&mut self, name: &str) {
        let Some(stage) = self.log.get_mut(name) else {
            warn!(stage = name, "stage has not started yet");
            return;
        };

        stage.ended_at = Some(Utc::now().timestamp_millis());
        self.pending.retain(|pending| pending != name);
    }

    pub fn end_all(&mut self) {
        let pending = std::mem::take(&mut self.pending);
        for name in pending {
            self.end(&name);
        }
    }

    /// Stats for every completed stage; unfinished stages are omitted
    pub fn stats(&self) -> HashMap<String, StageStats> {
        self.log
            .iter()
            .filter_map(|(name, stage)| {
                let ended_at = stage.ended_at?;
                Some((
                    name.clone(),
                    StageStats {
                        started_at: stage.started_at,
                        ended_at,
                        ms: ended_at - stage.started_at,
                    },
                ))
            })
            .collect()
    }
}
