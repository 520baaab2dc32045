//! Background subsystem configuration.
//!
//! Settings come from three layers, later ones winning:
//!
//! 1. Built-in defaults ([`BackgroundConfig::default`]).
//! 2. An optional JSON document ([`BackgroundConfig::from_json`]).
//! 3. `PRESSROOM_*` environment variables ([`BackgroundConfig::apply_env`]).
//!
//! Durations are expressed in milliseconds in both JSON and the environment.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Shortest timer period the background loops will run with.
pub const MIN_INTERVAL: Duration = Duration::from_millis(1);

/// Errors produced while loading or validating configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid JSON configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("environment variable {key} has invalid value {value:?}")]
    InvalidEnv { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// Settings for the view queue and its consumer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ViewQueueConfig {
    /// Maximum number of buffered view events; overflow is dropped.
    pub capacity: usize,
    /// Accumulated event count that triggers a flush.
    pub batch_size: usize,
    /// Flush at least this often while events are pending.
    #[serde(with = "duration_millis")]
    pub flush_interval: Duration,
    /// Upper bound on a polite stop before the drain is abandoned.
    #[serde(with = "duration_millis")]
    pub drain_timeout: Duration,
}

impl ViewQueueConfig {
    /// `flush_interval`, raised to [`MIN_INTERVAL`] if it was left at zero.
    pub fn effective_flush_interval(&self) -> Duration {
        self.flush_interval.max(MIN_INTERVAL)
    }
}

impl Default for ViewQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            batch_size: 100,
            flush_interval: Duration::from_secs(5),
            drain_timeout: Duration::from_secs(30),
        }
    }
}

/// Retry limits for scheduler items whose transition keeps failing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Failures after which an item is dead-lettered.
    pub max_attempts: u32,
    /// Backoff after the first failure; doubles with each further failure.
    #[serde(with = "duration_millis")]
    pub base_backoff: Duration,
    #[serde(with = "duration_millis")]
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            base_backoff: Duration::from_secs(60),
            max_backoff: Duration::from_secs(60 * 60),
        }
    }
}

impl RetryPolicy {
    /// Backoff to wait after the `failures`-th consecutive failure.
    pub fn backoff_after(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(31);
        self.base_backoff
            .checked_mul(1u32 << exponent)
            .unwrap_or(self.max_backoff)
            .min(self.max_backoff)
    }
}

/// Settings for the publish/expire scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    #[serde(with = "duration_millis")]
    pub tick_interval: Duration,
    /// How long a stop may wait for the transition in flight.
    #[serde(with = "duration_millis")]
    pub stop_timeout: Duration,
    pub retry: RetryPolicy,
}

impl SchedulerConfig {
    /// `tick_interval`, raised to [`MIN_INTERVAL`] if it was left at zero.
    pub fn effective_tick_interval(&self) -> Duration {
        self.tick_interval.max(MIN_INTERVAL)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(60),
            stop_timeout: Duration::from_secs(30),
            retry: RetryPolicy::default(),
        }
    }
}

/// Top-level configuration for both background tasks.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackgroundConfig {
    pub views: ViewQueueConfig,
    pub scheduler: SchedulerConfig,
}

impl BackgroundConfig {
    /// Parses a JSON document; missing fields take their defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Json`] for malformed input and
    /// [`ConfigError::Invalid`] if the result fails [`validate`](Self::validate).
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::InvalidEnv`] if a variable does not parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Applies `PRESSROOM_*` overrides read through `lookup`.
    ///
    /// Taking a lookup function instead of reading `std::env` directly keeps
    /// this testable without mutating process state.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let views = &mut self.views;
        override_with(&lookup, "PRESSROOM_VIEW_QUEUE_CAPACITY", &mut views.capacity)?;
        override_with(&lookup, "PRESSROOM_VIEW_BATCH_SIZE", &mut views.batch_size)?;
        override_millis(&lookup, "PRESSROOM_VIEW_FLUSH_INTERVAL_MS", &mut views.flush_interval)?;
        override_millis(&lookup, "PRESSROOM_VIEW_DRAIN_TIMEOUT_MS", &mut views.drain_timeout)?;

        let scheduler = &mut self.scheduler;
        override_millis(&lookup, "PRESSROOM_SCHEDULER_TICK_MS", &mut scheduler.tick_interval)?;
        override_millis(
            &lookup,
            "PRESSROOM_SCHEDULER_STOP_TIMEOUT_MS",
            &mut scheduler.stop_timeout,
        )?;
        override_with(
            &lookup,
            "PRESSROOM_SCHEDULER_MAX_ATTEMPTS",
            &mut scheduler.retry.max_attempts,
        )?;
        override_millis(
            &lookup,
            "PRESSROOM_SCHEDULER_BASE_BACKOFF_MS",
            &mut scheduler.retry.base_backoff,
        )?;
        override_millis(
            &lookup,
            "PRESSROOM_SCHEDULER_MAX_BACKOFF_MS",
            &mut scheduler.retry.max_backoff,
        )?;
        Ok(())
    }

    /// Rejects settings the background tasks cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let views = &self.views;
        if views.capacity == 0 {
            return Err(ConfigError::Invalid("views.capacity must be positive".into()));
        }
        if views.batch_size == 0 {
            return Err(ConfigError::Invalid("views.batch_size must be positive".into()));
        }
        if views.batch_size > views.capacity {
            return Err(ConfigError::Invalid(format!(
                "views.batch_size ({}) exceeds views.capacity ({})",
                views.batch_size, views.capacity
            )));
        }
        if views.flush_interval.is_zero() {
            return Err(ConfigError::Invalid("views.flush_interval must be non-zero".into()));
        }

        let scheduler = &self.scheduler;
        if scheduler.tick_interval.is_zero() {
            return Err(ConfigError::Invalid("scheduler.tick_interval must be non-zero".into()));
        }
        if scheduler.retry.max_attempts == 0 {
            return Err(ConfigError::Invalid(
                "scheduler.retry.max_attempts must be positive".into(),
            ));
        }
        if scheduler.retry.max_backoff < scheduler.retry.base_backoff {
            return Err(ConfigError::Invalid(
                "scheduler.retry.max_backoff is shorter than base_backoff".into(),
            ));
        }
        Ok(())
    }
}

fn override_with<F, T>(lookup: &F, key: &str, slot: &mut T) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: std::str::FromStr,
{
    if let Some(raw) = lookup(key) {
        *slot = raw.trim().parse().map_err(|_| ConfigError::InvalidEnv {
            key: key.to_owned(),
            value: raw.clone(),
        })?;
    }
    Ok(())
}

fn override_millis<F>(lookup: &F, key: &str, slot: &mut Duration) -> Result<(), ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    let mut millis = slot.as_millis() as u64;
    override_with(lookup, key, &mut millis)?;
    *slot = Duration::from_millis(millis);
    Ok(())
}

/// Serde helper for Duration as milliseconds
mod duration_millis {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        (duration.as_millis() as u64).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}
