//! Persisted record shapes: executions, metric samples, error logs.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::pipeline::state::{ExecutionContext, ExecutionState};
use crate::pipeline::types::TriggerSource;

/// Component name used for everything the dispatcher writes.
pub const COMPONENT: &str = "pipeline";

/// Fixed-width RFC 3339 UTC timestamp so text comparison orders correctly.
pub fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

// ── Execution record ────────────────────────────────────────────────

/// One row per submitted unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub correlation_id: Uuid,
    /// `None` only when the execution failed before routing.
    pub agent_name: Option<String>,
    pub trigger_source: TriggerSource,
    pub input_data: Value,
    pub output_data: Option<Value>,
    pub execution_time_ms: u64,
    pub success: bool,
    /// Always set when `success` is false.
    pub error_message: Option<String>,
    pub state: ExecutionState,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ExecutionRecord {
    /// Build the record for a context in a terminal state.
    pub fn from_context(ctx: &ExecutionContext) -> Self {
        let success = ctx.is_success();
        let error_message = if success {
            None
        } else {
            Some(
                ctx.failure()
                    .map(|f| f.message.clone())
                    .unwrap_or_else(|| format!("execution ended in state {}", ctx.state)),
            )
        };
        let now = Utc::now();
        Self {
            correlation_id: ctx.correlation_id,
            agent_name: ctx.agent_name().map(str::to_string),
            trigger_source: ctx.envelope.source.clone(),
            input_data: Value::Object(ctx.envelope.data.clone()),
            output_data: ctx
                .output()
                .cloned()
                .or_else(|| ctx.agent_result().map(|r| r.output.clone())),
            execution_time_ms: ctx.elapsed().as_millis() as u64,
            success,
            error_message,
            state: ctx.state,
            created_at: ctx.created_at,
            updated_at: now,
        }
    }
}

// ── Metrics ─────────────────────────────────────────────────────────

/// Kind of metric sample.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    Counter,
    Gauge,
    Timer,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Counter => "counter",
            Self::Gauge => "gauge",
            Self::Timer => "timer",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "counter" => Ok(Self::Counter),
            "gauge" => Ok(Self::Gauge),
            "timer" => Ok(Self::Timer),
            other => Err(format!("unknown metric type: {other}")),
        }
    }
}

/// Append-only measurement.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricSample {
    pub component: String,
    pub operation: String,
    pub metric_type: MetricType,
    pub value: f64,
    pub labels: BTreeMap<String, String>,
    pub timestamp: DateTime<Utc>,
}

impl MetricSample {
    fn new(operation: &str, metric_type: MetricType, value: f64) -> Self {
        Self {
            component: COMPONENT.to_string(),
            operation: operation.to_string(),
            metric_type,
            value,
            labels: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    pub fn counter(operation: &str, value: f64) -> Self {
        Self::new(operation, MetricType::Counter, value)
    }

    /// Timer sample in milliseconds.
    pub fn timer(operation: &str, elapsed: Duration) -> Self {
        Self::new(operation, MetricType::Timer, elapsed.as_secs_f64() * 1000.0)
    }

    pub fn with_label(mut self, key: &str, value: impl Into<String>) -> Self {
        self.labels.insert(key.to_string(), value.into());
        self
    }
}

// ── Error log ───────────────────────────────────────────────────────

/// Written once per failed execution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorLogEntry {
    pub id: Uuid,
    pub correlation_id: Option<Uuid>,
    pub component: String,
    pub operation: String,
    pub error_type: String,
    pub error_message: String,
    pub stack_trace: Option<String>,
    pub metadata: Value,
    pub created_at: DateTime<Utc>,
}

impl ErrorLogEntry {
    /// Entry for a failed context. `None` if the context did not fail.
    pub fn from_context(ctx: &ExecutionContext) -> Option<Self> {
        let failure = ctx.failure()?;
        Some(Self {
            id: Uuid::new_v4(),
            correlation_id: Some(ctx.correlation_id),
            component: COMPONENT.to_string(),
            operation: failure.stage.as_str().to_string(),
            error_type: failure.error_type.clone(),
            error_message: failure.message.clone(),
            stack_trace: failure.stack_trace.clone(),
            metadata: failure.metadata.clone(),
            created_at: Utc::now(),
        })
    }
}

/// Per-agent execution totals.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AgentStats {
    /// `None` groups executions that never got routed.
    pub agent_name: Option<String>,
    pub total: u64,
    pub successes: u64,
    pub failures: u64,
    pub avg_execution_ms: f64,
}

impl AgentStats {
    pub fn success_rate(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.successes as f64 / self.total as f64
        }
    }
}
