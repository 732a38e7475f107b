//! Environment-driven service configuration.
//!
//! Every knob reads from an environment variable with a default; the
//! service binary layers clap overrides on top. Invalid values are fatal
//! configuration errors: the process refuses to start rather than run
//! with a half-understood setup.

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    Missing(&'static str),
    #[error("invalid value `{value}` for {name}: {reason}")]
    Invalid {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Debug, Clone)]
pub struct BraidConfig {
    pub database_url: String,
    /// Number of worker tasks. Defaults to available CPUs.
    pub workers: usize,
    /// How long a pulled message stays leased before the broker may
    /// redeliver it.
    pub queue_lease: Duration,
    /// Idle sleep between pulls when the queue is empty.
    pub poll_interval: Duration,
    /// Bound on every store round trip.
    pub store_timeout: Duration,
    /// Compare-and-retry rounds per attach before falling back to
    /// redelivery.
    pub attach_retries: u32,
    /// In-process retries for a transiently failing dedup claim.
    pub claim_retries: u32,
    /// Delivery attempts before a transiently failing message is
    /// dead-lettered instead of redelivered (poison-message guard).
    pub max_deliveries: i32,
    /// Exponential backoff base and cap for release delays.
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl BraidConfig {
    /// Load configuration from the environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Self {
            database_url: std::env::var("DATABASE_URL")
                .map_err(|_| ConfigError::Missing("DATABASE_URL"))?,
            workers: parse_env("BRAID_WORKERS", num_cpus::get())?,
            queue_lease: Duration::from_secs(parse_env("BRAID_QUEUE_LEASE_SECS", 60u64)?),
            poll_interval: Duration::from_millis(parse_env("BRAID_POLL_INTERVAL_MS", 500u64)?),
            store_timeout: Duration::from_millis(parse_env("BRAID_STORE_TIMEOUT_MS", 5_000u64)?),
            attach_retries: parse_env("BRAID_ATTACH_RETRIES", 8u32)?,
            claim_retries: parse_env("BRAID_CLAIM_RETRIES", 3u32)?,
            max_deliveries: parse_env("BRAID_MAX_DELIVERIES", 5i32)?,
            backoff_base: Duration::from_millis(parse_env("BRAID_BACKOFF_BASE_MS", 200u64)?),
            backoff_cap: Duration::from_millis(parse_env("BRAID_BACKOFF_CAP_MS", 30_000u64)?),
        })
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid {
                name: "BRAID_WORKERS",
                value: "0".to_string(),
                reason: "at least one worker is required".to_string(),
            });
        }
        if self.max_deliveries < 1 {
            return Err(ConfigError::Invalid {
                name: "BRAID_MAX_DELIVERIES",
                value: self.max_deliveries.to_string(),
                reason: "at least one delivery attempt is required".to_string(),
            });
        }
        Ok(())
    }
}

fn parse_env<T>(name: &'static str, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(value) => value.parse().map_err(|err: T::Err| ConfigError::Invalid {
            name,
            value,
            reason: err.to_string(),
        }),
        Err(_) => Ok(default),
    }
}
