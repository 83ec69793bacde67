//! Pool configuration.

use std::time::Duration;

use crate::error::{Result, RotaError};

/// Default graceful-kill deadline (30 seconds).
pub const DEFAULT_KILL_DEADLINE: Duration = Duration::from_secs(30);

/// Default number of attempts for a single worker spawn.
pub const DEFAULT_SPAWN_ATTEMPTS: u32 = 3;

/// Default delay between spawn attempts.
pub const DEFAULT_SPAWN_RETRY_BACKOFF: Duration = Duration::from_millis(250);

/// Configuration for the worker pool.
///
/// Read-only once the supervisor has started.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolConfig {
    /// Number of worker processes kept serving.
    pub worker_count: usize,
    /// How long a retired worker may take to drain before it is killed.
    pub kill_deadline: Duration,
    /// Spawn attempts before a failure becomes fatal to the pool.
    pub spawn_attempts: u32,
    /// Delay between spawn attempts.
    pub spawn_retry_backoff: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            worker_count: default_worker_count(),
            kill_deadline: DEFAULT_KILL_DEADLINE,
            spawn_attempts: DEFAULT_SPAWN_ATTEMPTS,
            spawn_retry_backoff: DEFAULT_SPAWN_RETRY_BACKOFF,
        }
    }
}

/// One worker per available processing unit.
fn default_worker_count() -> usize {
    std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1)
}

impl PoolConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_kill_deadline(mut self, deadline: Duration) -> Self {
        self.kill_deadline = deadline;
        self
    }

    pub fn with_spawn_attempts(mut self, attempts: u32) -> Self {
        self.spawn_attempts = attempts;
        self
    }

    pub fn with_spawn_retry_backoff(mut self, backoff: Duration) -> Self {
        self.spawn_retry_backoff = backoff;
        self
    }

    /// Apply environment variable overrides.
    ///
    /// Reads `ROTA_WORKERS`, `ROTA_KILL_DEADLINE_MS` and `ROTA_SPAWN_ATTEMPTS`.
    /// Unparseable values are ignored with a warning.
    pub fn with_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(n) = parse_var::<usize>(&lookup, "ROTA_WORKERS") {
            self.worker_count = n;
        }
        if let Some(ms) = parse_var::<u64>(&lookup, "ROTA_KILL_DEADLINE_MS") {
            self.kill_deadline = Duration::from_millis(ms);
        }
        if let Some(n) = parse_var::<u32>(&lookup, "ROTA_SPAWN_ATTEMPTS") {
            self.spawn_attempts = n;
        }
        self
    }

    /// Reject configurations the supervisor cannot honour.
    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(RotaError::Config(
                "worker count must be greater than zero".into(),
            ));
        }
        if self.kill_deadline.is_zero() {
            return Err(RotaError::Config(
                "graceful kill deadline must be greater than zero".into(),
            ));
        }
        if self.spawn_attempts == 0 {
            return Err(RotaError::Config(
                "spawn attempts must be greater than zero".into(),
            ));
        }
        Ok(())
    }
}

fn parse_var<T: std::str::FromStr>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
) -> Option<T> {
    let raw = lookup(key)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            tracing::warn!(key, value = %raw, "Ignoring unparseable environment override");
            None
        }
    }
}
