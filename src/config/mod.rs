//! Typed configuration from environment variables and an optional TOML file.
//!
//! Loads once at startup and fails fast on malformed values. File values are
//! applied first, environment variables override them.

use std::collections::BTreeSet;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::{Error, Result};
use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::telemetry::TelemetryConfig;
use crate::worker::WorkerConfig;

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Worker sleep when the queue has nothing eligible.
    pub poll_interval: Duration,
    /// How often the scheduler checks for due jobs.
    pub scheduler_tick: Duration,
    /// Retry budget for tasks the agent creates itself.
    pub max_retries: u32,
    /// Failure kinds those tasks retry on.
    pub retry_on: BTreeSet<String>,
    pub retry_backoff: Duration,
    pub otel_endpoint: Option<String>,
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(200),
            scheduler_tick: Duration::from_secs(1),
            max_retries: 0,
            retry_on: BTreeSet::new(),
            retry_backoff: Duration::from_secs(1),
            otel_endpoint: None,
            log_level: "info".to_string(),
        }
    }
}

/// On-disk layout. Every section and field is optional.
#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct FileConfig {
    worker: WorkerSection,
    scheduler: SchedulerSection,
    retry: RetrySection,
    telemetry: TelemetrySection,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct WorkerSection {
    poll_interval_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct SchedulerSection {
    tick_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RetrySection {
    max_retries: Option<u32>,
    retry_on: Option<Vec<String>>,
    backoff_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct TelemetrySection {
    otel_endpoint: Option<String>,
    log_level: Option<String>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// In local dev, call `dotenvy::dotenv().ok()` before this.
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        config.apply_env()?;
        Ok(config)
    }

    /// Parse a TOML document on top of the defaults.
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let file: FileConfig =
            toml::from_str(content).map_err(|e| Error::Config(format!("bad config file: {e}")))?;
        let mut config = Self::default();
        config.apply_file(file);
        Ok(config)
    }

    /// File (if given) first, then environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => {
                let content = std::fs::read_to_string(path).map_err(|e| {
                    Error::Config(format!("cannot read config {}: {e}", path.display()))
                })?;
                Self::from_toml_str(&content)?
            }
            None => Self::default(),
        };
        config.apply_env()?;
        Ok(config)
    }

    fn apply_file(&mut self, file: FileConfig) {
        if let Some(ms) = file.worker.poll_interval_ms {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = file.scheduler.tick_ms {
            self.scheduler_tick = Duration::from_millis(ms);
        }
        if let Some(n) = file.retry.max_retries {
            self.max_retries = n;
        }
        if let Some(kinds) = file.retry.retry_on {
            self.retry_on = kinds.into_iter().collect();
        }
        if let Some(ms) = file.retry.backoff_ms {
            self.retry_backoff = Duration::from_millis(ms);
        }
        if file.telemetry.otel_endpoint.is_some() {
            self.otel_endpoint = file.telemetry.otel_endpoint;
        }
        if let Some(level) = file.telemetry.log_level {
            self.log_level = level;
        }
    }

    fn apply_env(&mut self) -> Result<()> {
        if let Some(ms) = parsed_var::<u64>("HOMEGUARD_POLL_INTERVAL_MS")? {
            self.poll_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = parsed_var::<u64>("HOMEGUARD_SCHEDULER_TICK_MS")? {
            self.scheduler_tick = Duration::from_millis(ms);
        }
        if let Some(n) = parsed_var::<u32>("HOMEGUARD_MAX_RETRIES")? {
            self.max_retries = n;
        }
        if let Ok(kinds) = std::env::var("HOMEGUARD_RETRY_ON") {
            self.retry_on = kinds
                .split(',')
                .map(str::trim)
                .filter(|k| !k.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(ms) = parsed_var::<u64>("HOMEGUARD_RETRY_BACKOFF_MS")? {
            self.retry_backoff = Duration::from_millis(ms);
        }
        if let Ok(endpoint) = std::env::var("OTEL_ENDPOINT") {
            self.otel_endpoint = Some(endpoint);
        }
        if let Ok(level) = std::env::var("LOG_LEVEL") {
            self.log_level = level;
        }
        Ok(())
    }

    pub fn worker(&self) -> WorkerConfig {
        WorkerConfig {
            poll_interval: self.poll_interval,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries,
            retry_on: self.retry_on.clone(),
            backoff: BackoffPolicy::constant(self.retry_backoff),
        }
    }

    pub fn telemetry(&self, service_name: &str) -> TelemetryConfig {
        TelemetryConfig {
            endpoint: self.otel_endpoint.clone(),
            service_name: service_name.to_string(),
            log_level: self.log_level.clone(),
        }
    }
}

fn parsed_var<T>(name: &str) -> Result<Option<T>>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e| Error::Config(format!("invalid {name}={raw}: {e}"))),
        Err(_) => Ok(None),
    }
}
