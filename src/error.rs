//! Error types for agent dispatch.

use std::time::Duration;

use crate::pipeline::state::Stage;

/// Top-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Routing error: {0}")]
    Routing(#[from] RoutingError),
}

/// Configuration-related errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Database-related errors.
///
/// Every variant is reported to observability as a `PersistenceError`.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Migration failed: {0}")]
    Migration(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl DatabaseError {
    pub fn error_type(&self) -> &'static str {
        "PersistenceError"
    }

    /// Whether a retry could succeed. Serialization failures are permanent.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Self::Serialization(_))
    }
}

/// Agent registry errors. Raised at startup or on lookup of an unknown name.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("Agent {name} not found")]
    NotFound { name: String },

    #[error("Default agent {name} is not registered")]
    MissingDefault { name: String },

    #[error("Agent {name} registered twice")]
    Duplicate { name: String },

    #[error("Configured default agent {configured} differs from registry default {registry}")]
    DefaultMismatch { configured: String, registry: String },
}

/// Routing table errors, raised while compiling rules.
#[derive(Debug, thiserror::Error)]
pub enum RoutingError {
    #[error("Rule {rule} has an invalid pattern: {source}")]
    InvalidPattern {
        rule: String,
        #[source]
        source: regex::Error,
    },

    #[error("Rule {rule} has no keywords")]
    EmptyRule { rule: String },

    #[error("Rule {rule} routes to unregistered agent {agent}")]
    UnknownAgent { rule: String, agent: String },

    #[error("Failed to parse routing table: {0}")]
    Parse(#[from] serde_json::Error),
}

/// Errors returned by agent handlers from `process`.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Processing failed: {0}")]
    Processing(String),
}

/// Failures captured inside the pipeline. These never escape `submit`;
/// they become the `Failed` terminal state.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ExecutionError {
    #[error("Requested agent {requested} could not be resolved")]
    Routing { requested: String },

    #[error("Agent {agent} failed: {reason}")]
    AgentExecution { agent: String, reason: String },

    #[error("Output of agent {agent} is invalid: {reason}")]
    Validation { agent: String, reason: String },

    #[error("Stage {stage} exceeded its deadline of {deadline:?}")]
    Timeout { stage: Stage, deadline: Duration },
}

impl ExecutionError {
    /// Stable type tag written to error logs.
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Routing { .. } => "RoutingError",
            Self::AgentExecution { .. } => "AgentExecutionError",
            Self::Validation { .. } => "ValidationError",
            Self::Timeout { .. } => "TimeoutError",
        }
    }
}

/// Result type alias.
pub type Result<T> = std::result::Result<T, Error>;
