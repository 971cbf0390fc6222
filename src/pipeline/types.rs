//! Shared types for the execution pipeline.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::pipeline::state::ExecutionState;

// ── Trigger source ──────────────────────────────────────────────────

/// Where a unit of work came from.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum TriggerSource {
    Email,
    Webhook,
    Api,
    Cli,
    Other(String),
}

impl TriggerSource {
    pub fn as_str(&self) -> &str {
        match self {
            Self::Email => "email",
            Self::Webhook => "webhook",
            Self::Api => "api",
            Self::Cli => "cli",
            Self::Other(s) => s,
        }
    }
}

impl From<String> for TriggerSource {
    fn from(s: String) -> Self {
        match s.to_lowercase().as_str() {
            "email" => Self::Email,
            "webhook" => Self::Webhook,
            "api" => Self::Api,
            "cli" => Self::Cli,
            _ => Self::Other(s),
        }
    }
}

impl From<&str> for TriggerSource {
    fn from(s: &str) -> Self {
        Self::from(s.to_string())
    }
}

impl From<TriggerSource> for String {
    fn from(source: TriggerSource) -> Self {
        source.as_str().to_string()
    }
}

impl fmt::Display for TriggerSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Envelope ────────────────────────────────────────────────────────

/// Normalized unit of inbound work.
///
/// Transport layers (HTTP, email polling, CLI) translate their native
/// input into this shape before calling `Dispatcher::submit`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin tag.
    pub source: TriggerSource,
    /// Opaque key-value payload handed to the agent.
    pub data: Map<String, Value>,
    /// Transport metadata (headers, ids). Not used for routing.
    #[serde(default)]
    pub metadata: Map<String, Value>,
    /// Explicit agent override requested by the caller.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub agent: Option<String>,
    /// When the caller received the work.
    #[serde(default = "Utc::now")]
    pub received_at: DateTime<Utc>,
}

impl Envelope {
    /// Create an envelope. A non-object `data` value is stored under `"value"`.
    pub fn new(source: impl Into<TriggerSource>, data: Value) -> Self {
        let data = match data {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                let mut map = Map::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        Self {
            source: source.into(),
            data,
            metadata: Map::new(),
            agent: None,
            received_at: Utc::now(),
        }
    }

    /// Request a specific agent instead of rule-based routing.
    pub fn with_agent(mut self, agent: impl Into<String>) -> Self {
        self.agent = Some(agent.into());
        self
    }

    /// Look up a value in `data` by dot-separated path (`email.subject`).
    pub fn field(&self, path: &str) -> Option<&Value> {
        let mut parts = path.split('.');
        let first = parts.next()?;
        let mut current = self.data.get(first)?;
        for part in parts {
            current = current.as_object()?.get(part)?;
        }
        Some(current)
    }

    /// All string leaves of `data`, newline-joined in key order.
    pub fn text_content(&self) -> String {
        let mut out = Vec::new();
        for value in self.data.values() {
            collect_strings(value, &mut out);
        }
        out.join("\n")
    }
}

/// Collect string leaves from a JSON value, depth-first.
pub(crate) fn collect_strings<'a>(value: &'a Value, out: &mut Vec<&'a str>) {
    match value {
        Value::String(s) => out.push(s),
        Value::Array(items) => items.iter().for_each(|v| collect_strings(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_strings(v, out)),
        _ => {}
    }
}

// ── Outcome ─────────────────────────────────────────────────────────

/// Structured failure returned to callers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutcomeError {
    pub error_type: String,
    pub message: String,
}

/// Public result of one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionOutcome {
    pub correlation_id: Uuid,
    /// Agent that processed (or attempted) the work.
    pub agent_name: Option<String>,
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<OutcomeError>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub notes: Vec<String>,
    #[serde(default)]
    pub requires_human_review: bool,
    /// Terminal state reached.
    pub state: ExecutionState,
    pub execution_time_ms: u64,
}
