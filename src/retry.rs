use std::collections::HashMap;
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::job::JobData;

const DEFAULT_STRATEGY: &str = "linear";

/// Retry bookkeeping persisted with the job
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Attempts {
    /// Total attempts allowed
    pub count: u32,
    /// Attempts left, decremented on each failure
    pub remaining: u32,
    /// Backoff delay in milliseconds fed to the strategy
    pub delay: Option<u64>,
    /// Named strategy deciding retry-with-delay vs terminal failure
    pub strategy: Option<String>,
}

impl Attempts {
    pub fn new(count: u32) -> Self {
        Self {
            count,
            remaining: count,
            delay: None,
            strategy: None,
        }
    }

    pub fn with_delay(mut self, delay: u64) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_strategy<S: Into<String>>(mut self, strategy: S) -> Self {
        self.strategy = Some(strategy.into());
        self
    }
}

/// Decision function: (attempts after decrement, error text, job data)
/// to next backoff in milliseconds, or `None` for a terminal failure.
pub type Strategy = Arc<dyn Fn(&Attempts, &str, &JobData) -> Option<u64> + Send + Sync>;

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Disposition {
    Retry { backoff: u64 },
    Fail,
}

/// Named retry strategies consulted by the worker
///
/// `linear` (the default) returns the configured fixed delay;
/// `exponential` scales it by the number of attempts made so far.
pub(crate) struct StrategySet {
    strategies: RwLock<HashMap<String, Strategy>>,
}

impl StrategySet {
    pub fn new() -> Self {
        let mut strategies: HashMap<String, Strategy> = HashMap::new();

        strategies.insert(
            "linear".to_string(),
            Arc::new(|attempts: &Attempts, _: &str, _: &JobData| {
                Some(attempts.delay.unwrap_or(0))
            }),
        );
        strategies.insert(
            "exponential".to_string(),
            Arc::new(|attempts: &Attempts, _: &str, _: &JobData| {
                let made = (attempts.count - attempts.remaining) as u64;
                Some(attempts.delay.unwrap_or(0).saturating_mul(made))
            }),
        );

        Self {
            strategies: RwLock::new(strategies),
        }
    }

    pub fn register<S, F>(&self, name: S, strategy: F)
    where
        S: Into<String>,
        F: Fn(&Attempts, &str, &JobData) -> Option<u64> + Send + Sync + 'static,
    {
        let mut strategies = self.strategies.write().unwrap_or_else(|e| e.into_inner());
        strategies.insert(name.into(), Arc::new(strategy));
    }

    /// Decide the fate of a failed attempt, decrementing `remaining`
    ///
    /// Jobs without an attempts config fail terminally on the first
    /// error. The strategy is only consulted while attempts remain; a
    /// strategy returning `None` fails the job with `remaining` left at
    /// its decremented value.
    pub fn decide(&self, data: &mut JobData, error: &str) -> Disposition {
        let Some(attempts) = data.attempts.as_mut() else {
            return Disposition::Fail;
        };

        attempts.remaining = attempts.remaining.saturating_sub(1);
        if attempts.remaining == 0 {
            return Disposition::Fail;
        }

        let snapshot = attempts.clone();
        let strategy = self.resolve(snapshot.strategy.as_deref());

        match strategy(&snapshot, error, data) {
            Some(backoff) => Disposition::Retry { backoff },
            None => Disposition::Fail,
        }
    }

    fn resolve(&self, name: Option<&str>) -> Strategy {
        let strategies = self.strategies.read().unwrap_or_else(|e| e.into_inner());
        let name = name.unwrap_or(DEFAULT_STRATEGY);

        if let Some(strategy) = strategies.get(name) {
            return strategy.clone();
        }

        warn!(strategy = name, "unknown retry strategy, using linear");
        strategies
            .get(DEFAULT_STRATEGY)
            .cloned()
            .unwrap_or_else(|| {
                Arc::new(|attempts: &Attempts, _: &str, _: &JobData| {
                    Some(attempts.delay.unwrap_or(0))
                })
            })
    }
}
