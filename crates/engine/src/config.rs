use std::time::Duration;

use cadence_core::schedule::{
    RetryPolicy, DEFAULT_MAX_ATTEMPTS, DEFAULT_RETRY_BASE_SECS, DEFAULT_RETRY_MAX_SECS,
};

use crate::error::{EngineError, EngineResult};

const DEFAULT_POLL_INTERVAL_SECS: u64 = 60;
const DEFAULT_BATCH_SIZE: usize = 100;
const DEFAULT_WORKER_CONCURRENCY: usize = 8;
const DEFAULT_LEASE_SECS: i64 = 300;
const DEFAULT_DISPATCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECURRING_INTERVAL_SECS: u64 = 86_400;

/// Upper bound for the lease and retry delays, ten years.
const MAX_DELAY_SECS: i64 = 10 * 365 * 86_400;

/// Scheduler, dispatch and trigger settings, loaded from environment
/// variables.
///
/// All fields have defaults suitable for local development.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How often the scheduler sweeps for due enrollments.
    pub poll_interval: Duration,
    /// Maximum enrollments picked up per sweep.
    pub batch_size: usize,
    /// Enrollments processed concurrently within a sweep.
    pub worker_concurrency: usize,
    /// How long a worker owns an enrollment it leased.
    pub lease_duration: chrono::Duration,
    /// Upper bound on a single channel call.
    pub dispatch_timeout: Duration,
    /// Transient failure handling.
    pub retry: RetryPolicy,
    /// How often recurring triggers are re-evaluated.
    pub recurring_interval: Duration,
    /// Lease owner name of this process.
    pub worker_id: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            batch_size: DEFAULT_BATCH_SIZE,
            worker_concurrency: DEFAULT_WORKER_CONCURRENCY,
            lease_duration: chrono::Duration::seconds(DEFAULT_LEASE_SECS),
            dispatch_timeout: Duration::from_secs(DEFAULT_DISPATCH_TIMEOUT_SECS),
            retry: RetryPolicy::default(),
            recurring_interval: Duration::from_secs(DEFAULT_RECURRING_INTERVAL_SECS),
            worker_id: default_worker_id(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                         | Default              |
    /// |---------------------------------|----------------------|
    /// | `SCHEDULER_POLL_INTERVAL_SECS`  | `60`                 |
    /// | `SCHEDULER_BATCH_SIZE`          | `100`                |
    /// | `SCHEDULER_WORKER_CONCURRENCY`  | `8`                  |
    /// | `ENROLLMENT_LEASE_SECS`         | `300`                |
    /// | `DISPATCH_TIMEOUT_SECS`         | `30`                 |
    /// | `DISPATCH_MAX_ATTEMPTS`         | `5`                  |
    /// | `RETRY_BASE_DELAY_SECS`         | `60`                 |
    /// | `RETRY_MAX_DELAY_SECS`          | `3600`               |
    /// | `RECURRING_SWEEP_INTERVAL_SECS` | `86400`              |
    /// | `WORKER_ID`                     | `worker-<uuid v4>`   |
    pub fn from_env() -> EngineResult<Self> {
        let config = Self {
            poll_interval: Duration::from_secs(env_or(
                "SCHEDULER_POLL_INTERVAL_SECS",
                DEFAULT_POLL_INTERVAL_SECS,
            )?),
            batch_size: env_or("SCHEDULER_BATCH_SIZE", DEFAULT_BATCH_SIZE)?,
            worker_concurrency: env_or(
                "SCHEDULER_WORKER_CONCURRENCY",
                DEFAULT_WORKER_CONCURRENCY,
            )?,
            lease_duration: env_secs("ENROLLMENT_LEASE_SECS", DEFAULT_LEASE_SECS)?,
            dispatch_timeout: Duration::from_secs(env_or(
                "DISPATCH_TIMEOUT_SECS",
                DEFAULT_DISPATCH_TIMEOUT_SECS,
            )?),
            retry: RetryPolicy {
                max_attempts: env_or("DISPATCH_MAX_ATTEMPTS", DEFAULT_MAX_ATTEMPTS)?,
                base_delay: env_secs("RETRY_BASE_DELAY_SECS", DEFAULT_RETRY_BASE_SECS)?,
                max_delay: env_secs("RETRY_MAX_DELAY_SECS", DEFAULT_RETRY_MAX_SECS)?,
            },
            recurring_interval: Duration::from_secs(env_or(
                "RECURRING_SWEEP_INTERVAL_SECS",
                DEFAULT_RECURRING_INTERVAL_SECS,
            )?),
            worker_id: std::env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id()),
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject settings the scheduler cannot run with.
    pub fn validate(&self) -> EngineResult<()> {
        if self.poll_interval.is_zero() {
            return Err(EngineError::Config("SCHEDULER_POLL_INTERVAL_SECS must be > 0".into()));
        }
        if self.batch_size == 0 || self.worker_concurrency == 0 {
            return Err(EngineError::Config(
                "SCHEDULER_BATCH_SIZE and SCHEDULER_WORKER_CONCURRENCY must be > 0".into(),
            ));
        }
        if self.lease_duration <= chrono::Duration::zero() {
            return Err(EngineError::Config("ENROLLMENT_LEASE_SECS must be > 0".into()));
        }
        // A lease shorter than a dispatch would let a second worker take
        // over an enrollment that is still being delivered.
        if self.lease_duration.to_std().unwrap_or_default() <= self.dispatch_timeout {
            return Err(EngineError::Config(
                "ENROLLMENT_LEASE_SECS must exceed DISPATCH_TIMEOUT_SECS".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(EngineError::Config("DISPATCH_MAX_ATTEMPTS must be > 0".into()));
        }
        if self.recurring_interval.is_zero() {
            return Err(EngineError::Config("RECURRING_SWEEP_INTERVAL_SECS must be > 0".into()));
        }
        Ok(())
    }
}

fn default_worker_id() -> String {
    format!("worker-{}", uuid::Uuid::new_v4())
}

fn env_or<T: std::str::FromStr>(name: &str, default: T) -> EngineResult<T> {
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| {
                EngineError::Config(format!("{name} must be a valid number, got '{raw}'"))
            }),
        Err(_) => Ok(default),
    }
}

/// A delay in whole seconds, bounded so that adding it to a timestamp
/// cannot overflow.
fn env_secs(name: &str, default: i64) -> EngineResult<chrono::Duration> {
    let secs: i64 = env_or(name, default)?;
    if secs.abs() > MAX_DELAY_SECS {
        return Err(EngineError::Config(format!(
            "{name} must be at most {MAX_DELAY_SECS} seconds, got {secs}"
        )));
    }
    chrono::Duration::try_seconds(secs)
        .ok_or_else(|| EngineError::Config(format!("{name} is out of range, got {secs}")))
}
