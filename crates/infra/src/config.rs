//! Configuration loading and representation.
//!
//! Every setting comes from a `SEGQ_*` environment variable and falls back to
//! a default. Loading goes through a lookup function so tests can supply
//! their own values.

use std::collections::HashMap;
use std::time::Duration;

use crate::autoscale::{PolicyError, ScalingPolicy};
use crate::queue::{MAX_RECEIVE_WAIT, QueueConfig};
use crate::workers::PoolBounds;

#[derive(Debug, Clone, thiserror::Error, PartialEq)]
pub enum ConfigError {
    #[error("{key}: cannot parse '{value}'")]
    Parse { key: &'static str, value: String },

    #[error("{key}: {reason}")]
    Invalid { key: &'static str, reason: String },

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

/// Process configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub grabcut_queue: String,
    pub sam_queue: String,
    pub queue: QueueConfig,
    pub receive_wait: Duration,
    /// Visibility extension cadence while executing; `None` disables.
    pub heartbeat: Option<Duration>,
    pub scaling: ScalingPolicy,
    pub sample_interval: Duration,
    pub pool: PoolBounds,
    pub initial_workers: usize,
    /// Dead-letter report cadence; `None` disables.
    pub dead_letter_report_interval: Option<Duration>,
    /// Synthetic jobs submitted at node start.
    pub load_test_jobs: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            grabcut_queue: "segq-grabcut".to_string(),
            sam_queue: "segq-sam".to_string(),
            queue: QueueConfig::default(),
            receive_wait: MAX_RECEIVE_WAIT,
            heartbeat: None,
            scaling: ScalingPolicy::default(),
            sample_interval: Duration::from_secs(60),
            pool: PoolBounds::default(),
            initial_workers: 1,
            dead_letter_report_interval: None,
            load_test_jobs: 0,
        }
    }
}

impl Config {
    /// Load from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an explicit map (tests, embedding).
    pub fn from_map(vars: &HashMap<String, String>) -> Result<Self, ConfigError> {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let vars = Vars(&lookup);
        let defaults = Config::default();

        let queue = QueueConfig {
            visibility_timeout: vars.secs("SEGQ_VISIBILITY_TIMEOUT_SECS", defaults.queue.visibility_timeout)?,
            max_receive_count: vars.parse("SEGQ_MAX_RECEIVE_COUNT", defaults.queue.max_receive_count)?,
            retention: vars.secs("SEGQ_RETENTION_SECS", defaults.queue.retention)?,
        };
        if queue.visibility_timeout.is_zero() {
            return Err(invalid("SEGQ_VISIBILITY_TIMEOUT_SECS", "must be positive"));
        }
        if queue.max_receive_count == 0 {
            return Err(invalid("SEGQ_MAX_RECEIVE_COUNT", "must be at least 1"));
        }
        if queue.retention < queue.visibility_timeout {
            return Err(invalid("SEGQ_RETENTION_SECS", "must not be shorter than the visibility timeout"));
        }

        let receive_wait = vars.secs("SEGQ_RECEIVE_WAIT_SECS", defaults.receive_wait)?;
        if receive_wait.is_zero() {
            return Err(invalid("SEGQ_RECEIVE_WAIT_SECS", "must be at least 1"));
        }

        let heartbeat = vars.optional_secs("SEGQ_HEARTBEAT_SECS")?;
        if heartbeat.is_some_and(|h| h >= queue.visibility_timeout) {
            return Err(invalid("SEGQ_HEARTBEAT_SECS", "must be shorter than the visibility timeout"));
        }

        let scaling = ScalingPolicy::new(
            vars.parse("SEGQ_SCALE_OUT_ABOVE", defaults.scaling.scale_out_above())?,
            vars.parse("SEGQ_SCALE_IN_BELOW", defaults.scaling.scale_in_below())?,
            vars.parse("SEGQ_HYSTERESIS_WINDOW", defaults.scaling.window())?,
        )?;

        let sample_interval = vars.secs("SEGQ_SAMPLE_INTERVAL_SECS", defaults.sample_interval)?;
        if sample_interval.is_zero() {
            return Err(invalid("SEGQ_SAMPLE_INTERVAL_SECS", "must be positive"));
        }

        let pool = PoolBounds {
            min: vars.parse("SEGQ_POOL_MIN", defaults.pool.min)?,
            max: vars.parse("SEGQ_POOL_MAX", defaults.pool.max)?,
        };
        if pool.min > pool.max {
            return Err(invalid("SEGQ_POOL_MIN", "must not exceed SEGQ_POOL_MAX"));
        }
        let initial_workers = vars.parse("SEGQ_POOL_INITIAL", defaults.initial_workers)?;

        Ok(Self {
            grabcut_queue: vars.string("SEGQ_QUEUE_GRABCUT", defaults.grabcut_queue)?,
            sam_queue: vars.string("SEGQ_QUEUE_SAM", defaults.sam_queue)?,
            queue,
            receive_wait: receive_wait.min(MAX_RECEIVE_WAIT),
            heartbeat,
            scaling,
            sample_interval,
            pool,
            initial_workers: pool.clamp(initial_workers),
            dead_letter_report_interval: vars.optional_secs("SEGQ_DLQ_REPORT_INTERVAL_SECS")?,
            load_test_jobs: vars.parse("SEGQ_LOAD_TEST_JOBS", defaults.load_test_jobs)?,
        })
    }
}

/// Name of the dead-letter queue paired with `queue`.
pub fn dead_letter_name(queue: &str) -> String {
    format!("{queue}-dlq")
}

fn invalid(key: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        key,
        reason: reason.to_string(),
    }
}

struct Vars<'a, F>(&'a F);

impl<F> Vars<'_, F>
where
    F: Fn(&str) -> Option<String>,
{
    fn raw(&self, key: &str) -> Option<String> {
        (self.0)(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
    }

    fn parse<T: std::str::FromStr>(&self, key: &'static str, default: T) -> Result<T, ConfigError> {
        match self.raw(key) {
            Some(value) => value.parse().map_err(|_| ConfigError::Parse { key, value }),
            None => Ok(default),
        }
    }

    fn secs(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        self.parse(key, default.as_secs()).map(Duration::from_secs)
    }

    /// Zero or unset disables.
    fn optional_secs(&self, key: &'static str) -> Result<Option<Duration>, ConfigError> {
        let secs: u64 = self.parse(key, 0)?;
        Ok((secs > 0).then(|| Duration::from_secs(secs)))
    }

    fn string(&self, key: &'static str, default: String) -> Result<String, ConfigError> {
        let value = self.raw(key).unwrap_or(default);
        if value.chars().any(char::is_whitespace) {
            return Err(invalid(key, "queue names cannot contain whitespace"));
        }
        Ok(value)
    }
}
