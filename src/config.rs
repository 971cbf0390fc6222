//! Configuration types.
//!
//! Built once at startup and shared by reference; nothing here is mutated
//! after construction.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::error::ConfigError;

/// Per-stage deadlines for the execution pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StageDeadlines {
    pub route: Duration,
    pub process: Duration,
    pub validate: Duration,
    pub finalize: Duration,
}

impl Default for StageDeadlines {
    fn default() -> Self {
        Self {
            route: Duration::from_millis(500),
            process: Duration::from_secs(30),
            validate: Duration::from_millis(500),
            finalize: Duration::from_millis(500),
        }
    }
}

/// Retry policy for execution recorder writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RecorderConfig {
    /// Retries after the first failed attempt (0 = single attempt).
    pub max_retries: u32,
    /// First backoff interval.
    pub initial_backoff: Duration,
    /// Cap on a single backoff interval.
    pub max_backoff: Duration,
    /// Bound on the whole `record` call, retries included.
    pub write_timeout: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_backoff: Duration::from_millis(50),
            max_backoff: Duration::from_secs(1),
            write_timeout: Duration::from_secs(5),
        }
    }
}

/// Dispatch engine configuration.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Agent used when no routing rule matches.
    pub default_agent: String,
    /// Stage deadlines.
    pub deadlines: StageDeadlines,
    /// Recorder retry policy.
    pub recorder: RecorderConfig,
    /// Maximum in-flight executions for batch submission.
    pub max_concurrent: usize,
    /// Database file location.
    pub db_path: PathBuf,
    /// Optional JSON routing table. Built-in rules are used when unset.
    pub rules_path: Option<PathBuf>,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            default_agent: "default_agent".to_string(),
            deadlines: StageDeadlines::default(),
            recorder: RecorderConfig::default(),
            max_concurrent: 10,
            db_path: PathBuf::from("./data/agent-dispatch.db"),
            rules_path: None,
        }
    }
}

impl DispatchConfig {
    /// Build configuration from `DISPATCH_*` environment variables,
    /// falling back to defaults for anything unset.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();

        let default_agent = lookup("DISPATCH_DEFAULT_AGENT")
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .unwrap_or(defaults.default_agent);

        let deadlines = StageDeadlines {
            route: parse_var(&lookup, "DISPATCH_ROUTE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.deadlines.route),
            process: parse_var(&lookup, "DISPATCH_PROCESS_TIMEOUT_SECS")?
                .map(Duration::from_secs)
                .unwrap_or(defaults.deadlines.process),
            validate: parse_var(&lookup, "DISPATCH_VALIDATE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.deadlines.validate),
            finalize: parse_var(&lookup, "DISPATCH_FINALIZE_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.deadlines.finalize),
        };

        let recorder = RecorderConfig {
            max_retries: parse_var(&lookup, "DISPATCH_RECORD_MAX_RETRIES")?
                .unwrap_or(defaults.recorder.max_retries),
            initial_backoff: parse_var(&lookup, "DISPATCH_RECORD_BACKOFF_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.recorder.initial_backoff),
            max_backoff: defaults.recorder.max_backoff,
            write_timeout: parse_var(&lookup, "DISPATCH_RECORD_TIMEOUT_MS")?
                .map(Duration::from_millis)
                .unwrap_or(defaults.recorder.write_timeout),
        };

        let max_concurrent: usize =
            parse_var(&lookup, "DISPATCH_MAX_CONCURRENT")?.unwrap_or(defaults.max_concurrent);
        if max_concurrent == 0 {
            return Err(ConfigError::InvalidValue {
                key: "DISPATCH_MAX_CONCURRENT".into(),
                message: "must be at least 1".into(),
            });
        }

        let db_path = lookup("DISPATCH_DB_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);
        let rules_path = lookup("DISPATCH_ROUTING_RULES")
            .filter(|s| !s.trim().is_empty())
            .map(PathBuf::from);

        Ok(Self {
            default_agent,
            deadlines,
            recorder,
            max_concurrent,
            db_path,
            rules_path,
        })
    }
}

fn parse_var<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|e: T::Err| ConfigError::InvalidValue {
                key: key.to_string(),
                message: e.to_string(),
            }),
    }
}
