//! libSQL backend: async `ExecutionStore` implementation.
//!
//! Supports local file and in-memory databases.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use serde_json::Value;
use tracing::{debug, info};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::pipeline::state::ExecutionState;
use crate::pipeline::types::TriggerSource;
use crate::store::migrations;
use crate::store::model::{
    AgentStats, ErrorLogEntry, ExecutionRecord, MetricSample, MetricType, format_timestamp,
};
use crate::store::traits::ExecutionStore;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let backend = Self::from_database(db).await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests and dry runs).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;
        Self::from_database(db).await
    }

    async fn from_database(db: LibSqlDatabase) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
        };
        migrations::run_migrations(backend.conn()).await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Parse a stored RFC 3339 string into DateTime<Utc>.
fn parse_datetime(s: &str) -> DateTime<Utc> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return dt.with_timezone(&Utc);
    }
    // SQLite datetime() output, used by column defaults
    if let Ok(ndt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S") {
        return ndt.and_utc();
    }
    tracing::warn!(value = s, "Unparseable timestamp, using minimum");
    DateTime::<Utc>::MIN_UTC
}

/// Convert `Option<String>` to libsql Value.
fn opt_text(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn to_json(value: &impl serde::Serialize, what: &str) -> Result<String, DatabaseError> {
    serde_json::to_string(value)
        .map_err(|e| DatabaseError::Serialization(format!("{what}: {e}")))
}

fn parse_json(s: &str) -> Value {
    serde_json::from_str(s).unwrap_or(Value::Null)
}

fn state_from_str(s: &str) -> ExecutionState {
    serde_json::from_value(Value::String(s.to_string())).unwrap_or(ExecutionState::Failed)
}

/// Column order matches EXECUTION_COLUMNS.
fn row_to_execution(row: &libsql::Row) -> Result<ExecutionRecord, libsql::Error> {
    let id_str: String = row.get(0)?;
    let source: String = row.get(2)?;
    let input: String = row.get(3)?;
    let output: Option<String> = row.get::<String>(4).ok();
    let elapsed: i64 = row.get(5)?;
    let success: i64 = row.get(6)?;
    let state: String = row.get(8)?;
    let created_str: String = row.get(9)?;
    let updated_str: String = row.get(10)?;

    Ok(ExecutionRecord {
        correlation_id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        agent_name: row.get::<String>(1).ok(),
        trigger_source: TriggerSource::from(source),
        input_data: parse_json(&input),
        output_data: output.as_deref().map(parse_json),
        execution_time_ms: elapsed.max(0) as u64,
        success: success != 0,
        error_message: row.get::<String>(7).ok(),
        state: state_from_str(&state),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

/// Column order matches METRIC_COLUMNS.
fn row_to_metric(row: &libsql::Row) -> Result<MetricSample, libsql::Error> {
    let metric_type: String = row.get(2)?;
    let labels: String = row.get(4)?;
    let ts: String = row.get(5)?;

    Ok(MetricSample {
        component: row.get(0)?,
        operation: row.get(1)?,
        metric_type: metric_type.parse().unwrap_or(MetricType::Gauge),
        value: row.get(3)?,
        labels: serde_json::from_str::<BTreeMap<String, String>>(&labels).unwrap_or_default(),
        timestamp: parse_datetime(&ts),
    })
}

/// Column order matches ERROR_LOG_COLUMNS.
fn row_to_error_log(row: &libsql::Row) -> Result<ErrorLogEntry, libsql::Error> {
    let id_str: String = row.get(0)?;
    let correlation: Option<String> = row.get::<String>(1).ok();
    let metadata: String = row.get(7)?;
    let created_str: String = row.get(8)?;

    Ok(ErrorLogEntry {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        correlation_id: correlation.and_then(|s| Uuid::parse_str(&s).ok()),
        component: row.get(2)?,
        operation: row.get(3)?,
        error_type: row.get(4)?,
        error_message: row.get(5)?,
        stack_trace: row.get::<String>(6).ok(),
        metadata: parse_json(&metadata),
        created_at: parse_datetime(&created_str),
    })
}

// ── Trait implementation ────────────────────────────────────────────

const EXECUTION_COLUMNS: &str = "correlation_id, agent_name, trigger_source, input_data, output_data, execution_time_ms, success, error_message, state, created_at, updated_at";

const METRIC_COLUMNS: &str = "component, operation, metric_type, value, labels, timestamp";

const ERROR_LOG_COLUMNS: &str = "id, correlation_id, component, operation, error_type, error_message, stack_trace, metadata, created_at";

#[async_trait]
impl ExecutionStore for LibSqlBackend {
    // ── Execution records ───────────────────────────────────────────

    async fn upsert_execution(&self, record: &ExecutionRecord) -> Result<(), DatabaseError> {
        let conn = self.conn();
        let input = to_json(&record.input_data, "upsert_execution input_data")?;
        let output = record
            .output_data
            .as_ref()
            .map(|v| to_json(v, "upsert_execution output_data"))
            .transpose()?;
        let now = format_timestamp(&Utc::now());

        // A fresh row starts with updated_at = created_at; only a rewrite
        // of the same id advances it.
        conn.execute(
            "INSERT INTO execution_records (correlation_id, agent_name, trigger_source, input_data, output_data, execution_time_ms, success, error_message, state, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?10)
             ON CONFLICT(correlation_id) DO UPDATE SET
                agent_name = excluded.agent_name,
                trigger_source = excluded.trigger_source,
                input_data = excluded.input_data,
                output_data = excluded.output_data,
                execution_time_ms = excluded.execution_time_ms,
                success = excluded.success,
                error_message = excluded.error_message,
                state = excluded.state,
                updated_at = ?11",
            params![
                record.correlation_id.to_string(),
                opt_text(record.agent_name.clone()),
                record.trigger_source.as_str(),
                input,
                opt_text(output),
                record.execution_time_ms as i64,
                record.success as i64,
                opt_text(record.error_message.clone()),
                record.state.to_string(),
                format_timestamp(&record.created_at),
                now,
            ],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("upsert_execution: {e}")))?;

        debug!(correlation_id = %record.correlation_id, success = record.success, "Execution record upserted");
        Ok(())
    }

    async fn get_execution(
        &self,
        correlation_id: Uuid,
    ) -> Result<Option<ExecutionRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!("SELECT {EXECUTION_COLUMNS} FROM execution_records WHERE correlation_id = ?1"),
                params![correlation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_execution: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let record = row_to_execution(&row)
                    .map_err(|e| DatabaseError::Query(format!("get_execution row parse: {e}")))?;
                Ok(Some(record))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_execution: {e}"))),
        }
    }

    async fn list_executions(&self, limit: usize) -> Result<Vec<ExecutionRecord>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {EXECUTION_COLUMNS} FROM execution_records ORDER BY created_at DESC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions: {e}")))?;

        let mut records = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("list_executions: {e}")))?
        {
            match row_to_execution(&row) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!("Skipping execution row: {e}"),
            }
        }
        Ok(records)
    }

    // ── Metrics ─────────────────────────────────────────────────────

    async fn insert_metric(&self, sample: &MetricSample) -> Result<(), DatabaseError> {
        let labels = to_json(&sample.labels, "insert_metric labels")?;
        self.conn()
            .execute(
                "INSERT INTO metric_samples (component, operation, metric_type, value, labels, timestamp) VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    sample.component.as_str(),
                    sample.operation.as_str(),
                    sample.metric_type.as_str(),
                    sample.value,
                    labels,
                    format_timestamp(&sample.timestamp),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_metric: {e}")))?;
        Ok(())
    }

    async fn query_metrics(
        &self,
        component: &str,
        operation: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<Vec<MetricSample>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {METRIC_COLUMNS} FROM metric_samples
                     WHERE component = ?1 AND operation = ?2 AND timestamp >= ?3 AND timestamp < ?4
                     ORDER BY timestamp ASC, id ASC"
                ),
                params![component, operation, format_timestamp(&from), format_timestamp(&to)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("query_metrics: {e}")))?;

        let mut samples = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("query_metrics: {e}")))?
        {
            match row_to_metric(&row) {
                Ok(sample) => samples.push(sample),
                Err(e) => tracing::warn!("Skipping metric row: {e}"),
            }
        }
        Ok(samples)
    }

    // ── Error logs ──────────────────────────────────────────────────

    async fn insert_error_log(&self, entry: &ErrorLogEntry) -> Result<(), DatabaseError> {
        let metadata = to_json(&entry.metadata, "insert_error_log metadata")?;
        self.conn()
            .execute(
                "INSERT INTO error_logs (id, correlation_id, component, operation, error_type, error_message, stack_trace, metadata, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    entry.id.to_string(),
                    opt_text(entry.correlation_id.map(|id| id.to_string())),
                    entry.component.as_str(),
                    entry.operation.as_str(),
                    entry.error_type.as_str(),
                    entry.error_message.as_str(),
                    opt_text(entry.stack_trace.clone()),
                    metadata,
                    format_timestamp(&entry.created_at),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("insert_error_log: {e}")))?;

        debug!(
            correlation_id = ?entry.correlation_id,
            error_type = %entry.error_type,
            "Error log inserted"
        );
        Ok(())
    }

    async fn error_logs_for(
        &self,
        correlation_id: Uuid,
    ) -> Result<Vec<ErrorLogEntry>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {ERROR_LOG_COLUMNS} FROM error_logs WHERE correlation_id = ?1 ORDER BY created_at ASC"
                ),
                params![correlation_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("error_logs_for: {e}")))?;

        let mut entries = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("error_logs_for: {e}")))?
        {
            match row_to_error_log(&row) {
                Ok(entry) => entries.push(entry),
                Err(e) => tracing::warn!("Skipping error log row: {e}"),
            }
        }
        Ok(entries)
    }

    // ── Monitoring ──────────────────────────────────────────────────

    async fn execution_stats(&self, since: DateTime<Utc>) -> Result<Vec<AgentStats>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT agent_name, COUNT(*), TOTAL(success), TOTAL(execution_time_ms)
                 FROM execution_records
                 WHERE created_at >= ?1
                 GROUP BY agent_name
                 ORDER BY agent_name",
                params![format_timestamp(&since)],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("execution_stats: {e}")))?;

        let mut stats = Vec::new();
        while let Some(row) = rows
            .next()
            .await
            .map_err(|e| DatabaseError::Query(format!("execution_stats: {e}")))?
        {
            let total: i64 = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("execution_stats row parse: {e}")))?;
            let successes: f64 = row.get(2).unwrap_or(0.0);
            let total_ms: f64 = row.get(3).unwrap_or(0.0);
            let total = total.max(0) as u64;
            let successes = successes as u64;
            stats.push(AgentStats {
                agent_name: row.get::<String>(0).ok(),
                total,
                successes,
                failures: total.saturating_sub(successes),
                avg_execution_ms: if total == 0 { 0.0 } else { total_ms / total as f64 },
            });
        }
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use chrono::SubsecRound;
    use serde_json::json;

    use super::*;

    async fn test_db() -> LibSqlBackend {
        LibSqlBackend::new_memory().await.unwrap()
    }

    fn make_record(agent: &str, success: bool) -> ExecutionRecord {
        let now = Utc::now();
        ExecutionRecord {
            correlation_id: Uuid::new_v4(),
            agent_name: Some(agent.to_string()),
            trigger_source: TriggerSource::Email,
            input_data: json!({"text": "pricing please"}),
            output_data: success.then(|| json!({"intent": "pricing_inquiry"})),
            execution_time_ms: 12,
            success,
            error_message: (!success).then(|| "boom".to_string()),
            state: if success {
                ExecutionState::Finalized
            } else {
                ExecutionState::Failed
            },
            created_at: now,
            updated_at: now,
        }
    }

    // ── Execution records ───────────────────────────────────────────

    #[tokio::test]
    async fn upsert_and_get() {
        let db = test_db().await;
        let record = make_record("sales_agent", true);
        db.upsert_execution(&record).await.unwrap();

        let fetched = db.get_execution(record.correlation_id).await.unwrap().unwrap();
        assert_eq!(fetched.correlation_id, record.correlation_id);
        assert_eq!(fetched.agent_name.as_deref(), Some("sales_agent"));
        assert_eq!(fetched.trigger_source, TriggerSource::Email);
        assert_eq!(fetched.input_data, record.input_data);
        assert_eq!(fetched.output_data, record.output_data);
        assert_eq!(fetched.state, ExecutionState::Finalized);
        assert!(fetched.success);
    }

    #[tokio::test]
    async fn get_missing_is_none() {
        let db = test_db().await;
        assert!(db.get_execution(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn upsert_is_idempotent_and_advances_updated_at() {
        let db = test_db().await;
        let mut record = make_record("sales_agent", true);
        db.upsert_execution(&record).await.unwrap();
        let first = db.get_execution(record.correlation_id).await.unwrap().unwrap();

        assert_eq!(first.updated_at, first.created_at);

        tokio::time::sleep(Duration::from_millis(5)).await;
        record.execution_time_ms = 99;
        db.upsert_execution(&record).await.unwrap();
        let second = db.get_execution(record.correlation_id).await.unwrap().unwrap();

        assert_eq!(db.list_executions(10).await.unwrap().len(), 1);
        assert_eq!(second.created_at, first.created_at);
        assert!(second.updated_at > first.updated_at);
        assert_eq!(second.execution_time_ms, 99);
    }

    #[tokio::test]
    async fn unrouted_failure_has_null_agent() {
        let db = test_db().await;
        let mut record = make_record("x", false);
        record.agent_name = None;
        db.upsert_execution(&record).await.unwrap();
        let fetched = db.get_execution(record.correlation_id).await.unwrap().unwrap();
        assert!(fetched.agent_name.is_none());
        assert!(fetched.output_data.is_none());
        assert_eq!(fetched.error_message.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn list_executions_respects_limit() {
        let db = test_db().await;
        for _ in 0..5 {
            db.upsert_execution(&make_record("default_agent", true)).await.unwrap();
        }
        assert_eq!(db.list_executions(3).await.unwrap().len(), 3);
    }

    // ── Metrics ─────────────────────────────────────────────────────

    #[tokio::test]
    async fn metrics_query_by_component_operation_and_range() {
        let db = test_db().await;
        let start = Utc::now() - chrono::Duration::seconds(1);

        let timer = MetricSample::timer("execute", Duration::from_millis(40))
            .with_label("agent_name", "sales_agent");
        db.insert_metric(&timer).await.unwrap();
        db.insert_metric(&MetricSample::counter("executions_total", 1.0))
            .await
            .unwrap();

        let mut old = MetricSample::timer("execute", Duration::from_millis(1));
        old.timestamp = start - chrono::Duration::hours(1);
        db.insert_metric(&old).await.unwrap();

        let end = Utc::now() + chrono::Duration::seconds(1);
        let found = db.query_metrics("pipeline", "execute", start, end).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].metric_type, MetricType::Timer);
        assert_eq!(found[0].labels["agent_name"], "sales_agent");
        assert!((found[0].value - 40.0).abs() < 1e-9);
    }

    // ── Error logs ──────────────────────────────────────────────────

    #[tokio::test]
    async fn error_logs_round_trip() {
        let db = test_db().await;
        let correlation_id = Uuid::new_v4();
        let entry = ErrorLogEntry {
            id: Uuid::new_v4(),
            correlation_id: Some(correlation_id),
            component: "pipeline".into(),
            operation: "process".into(),
            error_type: "AgentExecutionError".into(),
            error_message: "Agent x failed: boom".into(),
            stack_trace: Some("boom\ncaused by: io".into()),
            metadata: json!({"agent_name": "x"}),
            created_at: Utc::now(),
        };
        db.insert_error_log(&entry).await.unwrap();

        let logs = db.error_logs_for(correlation_id).await.unwrap();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].error_type, "AgentExecutionError");
        assert_eq!(logs[0].metadata, json!({"agent_name": "x"}));
        assert_eq!(logs[0].stack_trace, entry.stack_trace);
        assert!(db.error_logs_for(Uuid::new_v4()).await.unwrap().is_empty());
    }

    // ── Monitoring ──────────────────────────────────────────────────

    #[tokio::test]
    async fn stats_group_by_agent() {
        let db = test_db().await;
        let since = Utc::now() - chrono::Duration::minutes(1);
        db.upsert_execution(&make_record("sales_agent", true)).await.unwrap();
        db.upsert_execution(&make_record("sales_agent", false)).await.unwrap();
        db.upsert_execution(&make_record("default_agent", true)).await.unwrap();

        let stats = db.execution_stats(since).await.unwrap();
        assert_eq!(stats.len(), 2);
        let sales = stats
            .iter()
            .find(|s| s.agent_name.as_deref() == Some("sales_agent"))
            .unwrap();
        assert_eq!(sales.total, 2);
        assert_eq!(sales.successes, 1);
        assert_eq!(sales.failures, 1);
        assert!((sales.avg_execution_ms - 12.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn row_read_errors_are_reported_not_truncated() {
        let db = test_db().await;
        db.conn()
            .execute_batch(
                "DROP TABLE execution_records;
                 CREATE VIEW execution_records AS
                 SELECT 'id' AS correlation_id, 'a' AS agent_name, 'api' AS trigger_source,
                        '{}' AS input_data, NULL AS output_data,
                        abs(-9223372036854775807 - 1) AS execution_time_ms,
                        1 AS success, NULL AS error_message, 'finalized' AS state,
                        '2024-01-01T00:00:00.000000Z' AS created_at,
                        '2024-01-01T00:00:00.000000Z' AS updated_at;",
            )
            .await
            .unwrap();

        let err = db.list_executions(10).await.unwrap_err();
        assert!(matches!(err, DatabaseError::Query(ref msg) if msg.starts_with("list_executions")));
    }

    #[test]
    fn malformed_timestamps_fall_back_to_minimum() {
        let ts = Utc::now();
        assert_eq!(parse_datetime(&format_timestamp(&ts)), ts.trunc_subsecs(6));
        assert_eq!(parse_datetime("2024-03-01 10:00:00").to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert_eq!(parse_datetime("yesterday"), DateTime::<Utc>::MIN_UTC);
    }

    #[tokio::test]
    async fn local_file_database_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("dispatch.db");
        let record = make_record("sales_agent", true);
        {
            let db = LibSqlBackend::new_local(&path).await.unwrap();
            db.upsert_execution(&record).await.unwrap();
        }
        let db = LibSqlBackend::new_local(&path).await.unwrap();
        assert!(db.get_execution(record.correlation_id).await.unwrap().is_some());
    }
}
