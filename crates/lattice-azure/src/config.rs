//! Operator configuration
//!
//! Values are read from `LATTICE_AZURE_*` environment variables through the
//! [`EnvSource`] trait so tests can inject values without touching global
//! process state. Every value has a default; malformed values are rejected
//! at load time with a validation error.

use std::time::Duration;

use lattice_common::retry::RetryConfig;
use lattice_common::Error;

use crate::subnet::{SubnetConfig, DEFAULT_MASTER_PREFIX, DEFAULT_WORKER_PREFIX};

/// Env var: prefix length of the master subnet
pub const ENV_MASTER_SUBNET_PREFIX: &str = "LATTICE_AZURE_MASTER_SUBNET_PREFIX";
/// Env var: prefix length of the worker and VPN subnets
pub const ENV_WORKER_SUBNET_PREFIX: &str = "LATTICE_AZURE_WORKER_SUBNET_PREFIX";
/// Env var: number of watchdog workers
pub const ENV_WATCHDOG_WORKERS: &str = "LATTICE_AZURE_WATCHDOG_WORKERS";
/// Env var: first delay before re-polling an unfinished guard job (ms)
pub const ENV_WATCHDOG_REQUEUE_MS: &str = "LATTICE_AZURE_WATCHDOG_REQUEUE_MS";
/// Env var: maximum delay between guard job polls (ms)
pub const ENV_WATCHDOG_REQUEUE_MAX_MS: &str = "LATTICE_AZURE_WATCHDOG_REQUEUE_MAX_MS";
/// Env var: requeue interval after a canceled (not-ready) pass (s)
pub const ENV_NOT_READY_REQUEUE_SECS: &str = "LATTICE_AZURE_NOT_READY_REQUEUE_SECS";
/// Env var: requeue interval after a completed pass (s)
pub const ENV_READY_REQUEUE_SECS: &str = "LATTICE_AZURE_READY_REQUEUE_SECS";
/// Env var: attempts for optimistic-concurrency status writes
pub const ENV_STATUS_CONFLICT_RETRIES: &str = "LATTICE_AZURE_STATUS_CONFLICT_RETRIES";
/// Env var: blob container holding rendered node artifacts
pub const ENV_STORAGE_CONTAINER: &str = "LATTICE_AZURE_STORAGE_CONTAINER";

/// Default blob container for rendered node artifacts
pub const DEFAULT_STORAGE_CONTAINER: &str = "ignition";

/// Source of raw configuration values
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Look up a variable, returning None when unset
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads configuration from the process environment
#[derive(Clone, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

/// Configuration shared by all Azure resources and the watchdog
#[derive(Clone, Debug, PartialEq)]
pub struct OperatorConfig {
    /// Subnet sizes carved out of each cluster network
    pub subnets: SubnetConfig,
    /// Number of long-lived watchdog workers
    pub watchdog_workers: usize,
    /// Delay before the first re-poll of an unfinished guard job
    pub watchdog_requeue_initial: Duration,
    /// Cap on the delay between guard job polls
    pub watchdog_requeue_max: Duration,
    /// Requeue interval after a pass was canceled because something was not ready
    pub not_ready_requeue: Duration,
    /// Requeue interval after a pass completed
    pub ready_requeue: Duration,
    /// Requeue interval after a pass failed
    pub error_requeue: Duration,
    /// Attempts for read-modify-write status updates
    pub status_conflict_retries: u32,
    /// Blob container holding rendered node artifacts
    pub storage_container: String,
}

impl Default for OperatorConfig {
    fn default() -> Self {
        Self {
            subnets: SubnetConfig::default(),
            watchdog_workers: 4,
            watchdog_requeue_initial: Duration::from_secs(5),
            watchdog_requeue_max: Duration::from_secs(60),
            not_ready_requeue: Duration::from_secs(30),
            ready_requeue: Duration::from_secs(300),
            error_requeue: Duration::from_secs(60),
            status_conflict_retries: 5,
            storage_container: DEFAULT_STORAGE_CONTAINER.to_string(),
        }
    }
}

impl OperatorConfig {
    /// Load configuration from the process environment
    pub fn from_env() -> Result<Self, Error> {
        Self::from_source(&OsEnv)
    }

    /// Load configuration from an arbitrary source
    pub fn from_source(source: &dyn EnvSource) -> Result<Self, Error> {
        let defaults = Self::default();

        let config = Self {
            subnets: SubnetConfig {
                master_prefix: parse_or(
                    source,
                    ENV_MASTER_SUBNET_PREFIX,
                    DEFAULT_MASTER_PREFIX,
                )?,
                worker_prefix: parse_or(
                    source,
                    ENV_WORKER_SUBNET_PREFIX,
                    DEFAULT_WORKER_PREFIX,
                )?,
            },
            watchdog_workers: parse_or(source, ENV_WATCHDOG_WORKERS, defaults.watchdog_workers)?,
            watchdog_requeue_initial: Duration::from_millis(parse_or(
                source,
                ENV_WATCHDOG_REQUEUE_MS,
                defaults.watchdog_requeue_initial.as_millis() as u64,
            )?),
            watchdog_requeue_max: Duration::from_millis(parse_or(
                source,
                ENV_WATCHDOG_REQUEUE_MAX_MS,
                defaults.watchdog_requeue_max.as_millis() as u64,
            )?),
            not_ready_requeue: Duration::from_secs(parse_or(
                source,
                ENV_NOT_READY_REQUEUE_SECS,
                defaults.not_ready_requeue.as_secs(),
            )?),
            ready_requeue: Duration::from_secs(parse_or(
                source,
                ENV_READY_REQUEUE_SECS,
                defaults.ready_requeue.as_secs(),
            )?),
            error_requeue: defaults.error_requeue,
            status_conflict_retries: parse_or(
                source,
                ENV_STATUS_CONFLICT_RETRIES,
                defaults.status_conflict_retries,
            )?,
            storage_container: source
                .var(ENV_STORAGE_CONTAINER)
                .unwrap_or(defaults.storage_container),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject values that would make the operator misbehave at runtime
    pub fn validate(&self) -> Result<(), Error> {
        self.subnets.validate()?;
        if self.watchdog_workers == 0 {
            return Err(Error::validation(format!(
                "{} must be at least 1",
                ENV_WATCHDOG_WORKERS
            )));
        }
        if self.watchdog_requeue_max < self.watchdog_requeue_initial {
            return Err(Error::validation(format!(
                "{} must not be smaller than {}",
                ENV_WATCHDOG_REQUEUE_MAX_MS, ENV_WATCHDOG_REQUEUE_MS
            )));
        }
        if self.status_conflict_retries == 0 {
            return Err(Error::validation(format!(
                "{} must be at least 1",
                ENV_STATUS_CONFLICT_RETRIES
            )));
        }
        if self.storage_container.is_empty() {
            return Err(Error::validation(format!(
                "{} must not be empty",
                ENV_STORAGE_CONTAINER
            )));
        }
        Ok(())
    }

    /// Backoff used between polls of an unfinished guard job
    pub fn watchdog_backoff(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: 0,
            initial_delay: self.watchdog_requeue_initial,
            max_delay: self.watchdog_requeue_max,
            backoff_multiplier: 2.0,
        }
    }

    /// Bounded retry used for optimistic-concurrency status writes
    pub fn status_retry(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: self.status_conflict_retries,
            initial_delay: Duration::from_millis(50),
            max_delay: Duration::from_secs(2),
            backoff_multiplier: 2.0,
        }
    }
}

fn parse_or<T>(source: &dyn EnvSource, key: &str, default: T) -> Result<T, Error>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match source.var(key) {
        None => Ok(default),
        Some(raw) => raw
            .trim()
            .parse()
            .map_err(|e| Error::validation(format!("invalid value {:?} for {}: {}", raw, key, e))),
    }
}
