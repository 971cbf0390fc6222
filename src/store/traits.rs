//! `ExecutionStore` trait: single async interface for all persistence.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::store::model::{AgentStats, ErrorLogEntry, ExecutionRecord, MetricSample};

/// Backend-agnostic store for execution records, metrics, and error logs.
#[async_trait]
pub trait ExecutionStore: Send + Sync {
    // ── Execution records ───────────────────────────────────────────

    /// Insert or replace the record for `record.correlation_id`.
    ///
    /// A rewrite keeps the original `created_at` and advances `updated_at`.
    async fn upsert_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError>;

    async fn get_execution(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, DatabaseError>;

    /// Most recent first.
    async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>, DatabaseError>;

    // ── Metrics ─────────────────────────────────────────────────────

    async fn insert_metric(&self, sample: &MetricSample) -> Result<(), DatabaseError>;

    /// Samples for `(component, operation)` with `from <= timestamp < to`,
    /// oldest first.
    async fn query_metrics(
        &self,
        component: &str,
        operation: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, DatabaseError>;

    // ── Error logs ──────────────────────────────────────────────────

    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), DatabaseError>;

    async fn error_logs_for(&self, correlation_id: Uuid)
    -> Result<Vec<ErrorLogEntry>, DatabaseError>;

    // ── Monitoring ──────────────────────────────────────────────────

    /// Per-agent totals for executions created at or after `since`.
    async fn execution_stats(&self, since: DateTime<Utc>) -> Result<Vec<AgentStats>, DatabaseError>;
}
