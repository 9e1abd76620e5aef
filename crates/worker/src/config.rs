//! Worker pool configuration.

use std::time::Duration;

use tracing::warn;

/// Knobs for the worker pool and its deadlines.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Number of concurrent executors.
    pub concurrency: usize,
    /// Past this, the attempt logs a slow-analysis warning but keeps waiting.
    pub soft_deadline: Duration,
    /// Past this, the attempt is abandoned and the job fails with a
    /// timeout-specific message. Must stay below the queue lease.
    pub hard_deadline: Duration,
    /// How long one dequeue call blocks before the executor re-checks for
    /// shutdown.
    pub dequeue_wait: Duration,
    /// Cadence of the reconciliation sweep.
    pub reconcile_interval: Duration,
    /// How long a `processing` job must be untouched before the sweep
    /// considers it stale.
    pub reconcile_after: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: std::thread::available_parallelism()
                .map(|n| n.get())
                .unwrap_or(4),
            soft_deadline: Duration::from_secs(540),
            hard_deadline: Duration::from_secs(600),
            dequeue_wait: Duration::from_secs(1),
            reconcile_interval: Duration::from_secs(60),
            reconcile_after: Duration::from_secs(660),
        }
    }
}

impl WorkerConfig {
    /// Read overrides from the environment, falling back to defaults with a
    /// warning on unparseable values.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        let concurrency = env_parse("WORKER_CONCURRENCY", defaults.concurrency);
        let soft_deadline =
            Duration::from_secs(env_parse("SOFT_TIMEOUT_SECS", defaults.soft_deadline.as_secs()));
        let hard_deadline =
            Duration::from_secs(env_parse("HARD_TIMEOUT_SECS", defaults.hard_deadline.as_secs()));

        Self {
            concurrency: concurrency.max(1),
            soft_deadline,
            hard_deadline,
            reconcile_after: hard_deadline + Duration::from_secs(60),
            ..defaults
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(name: &str, default: T) -> T {
    match std::env::var(name) {
        Ok(raw) => raw.parse().unwrap_or_else(|_| {
            warn!(var = name, value = %raw, "unparseable value; using default");
            default
        }),
        Err(_) => default,
    }
}
