//! Execution recorder: persists the record, metrics, and error log for
//! one finished execution.
//!
//! Writes are retried with exponential backoff and the whole call is
//! bounded by `RecorderConfig::write_timeout`. Persistence failures are
//! logged and reported, never propagated to the caller.

use std::future::Future;
use std::sync::Arc;

use backoff::ExponentialBackoff;
use backoff::backoff::Backoff;
use serde::Serialize;
use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::config::RecorderConfig;
use crate::error::DatabaseError;
use crate::pipeline::state::ExecutionContext;
use crate::store::model::{ErrorLogEntry, ExecutionRecord, MetricSample};
use crate::store::traits::ExecutionStore;

/// Label used when an execution failed before an agent was chosen.
const UNROUTED: &str = "unrouted";

/// What `record` managed to persist.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct RecordReport {
    /// Writes that succeeded (possibly after retries).
    pub written: usize,
    /// Writes that failed after exhausting retries.
    pub failed: usize,
    /// Retries performed across all writes.
    pub retries: usize,
    /// The write deadline expired before all writes finished.
    pub timed_out: bool,
}

impl RecordReport {
    pub fn is_complete(&self) -> bool {
        self.failed == 0 && !self.timed_out
    }
}

/// Writes observability rows for finished executions.
pub struct ExecutionRecorder {
    store: Arc<dyn ExecutionStore>,
    config: RecorderConfig,
}

impl ExecutionRecorder {
    pub fn new(store: Arc<dyn ExecutionStore>, config: RecorderConfig) -> Self {
        Self { store, config }
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        &self.store
    }

    /// Persist everything for a terminal context.
    pub async fn record(&self, ctx: &ExecutionContext) -> RecordReport {
        let mut report = RecordReport::default();
        let deadline = self.config.write_timeout;
        let finished = tokio::time::timeout(deadline, self.write_all(ctx, &mut report))
            .await
            .is_ok();

        if !finished {
            report.timed_out = true;
            error!(
                correlation_id = %ctx.correlation_id,
                deadline_ms = deadline.as_millis() as u64,
                written = report.written,
                "Recording timed out, observability rows may be missing"
            );
        } else if report.failed > 0 {
            error!(
                correlation_id = %ctx.correlation_id,
                written = report.written,
                failed = report.failed,
                "Recording incomplete"
            );
        } else {
            debug!(
                correlation_id = %ctx.correlation_id,
                written = report.written,
                retries = report.retries,
                "Execution recorded"
            );
        }
        report
    }

    async fn write_all(&self, ctx: &ExecutionContext, report: &mut RecordReport) {
        let id = ctx.correlation_id;
        let record = ExecutionRecord::from_context(ctx);
        let record = &record;
        let store = &self.store;

        let result = self
            .write_with_retry("upsert_execution", id, report, move || store.upsert_execution(record))
            .await;
        tally(report, result);

        for sample in metric_samples(ctx) {
            let sample = &sample;
            let result = self
                .write_with_retry("insert_metric", id, report, move || store.insert_metric(sample))
                .await;
            tally(report, result);
        }

        if let Some(entry) = ErrorLogEntry::from_context(ctx) {
            let entry = &entry;
            let result = self
                .write_with_retry("insert_error_log", id, report, move || {
                    store.insert_error_log(entry)
                })
                .await;
            tally(report, result);
        }
    }

    /// Run one write, retrying retryable errors with exponential backoff.
    async fn write_with_retry<F, Fut>(
        &self,
        operation: &'static str,
        correlation_id: Uuid,
        report: &mut RecordReport,
        write: F,
    ) -> Result<(), DatabaseError>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<(), DatabaseError>>,
    {
        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.initial_backoff,
            max_interval: self.config.max_backoff,
            max_elapsed_time: None,
            ..ExponentialBackoff::default()
        };
        let mut attempts = 0u32;

        loop {
            match write().await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_retryable() && attempts < self.config.max_retries => {
                    let wait = backoff.next_backoff().unwrap_or(self.config.max_backoff);
                    attempts += 1;
                    report.retries += 1;
                    warn!(
                        correlation_id = %correlation_id,
                        operation,
                        attempt = attempts,
                        max_retries = self.config.max_retries,
                        retry_in_ms = wait.as_millis() as u64,
                        error = %err,
                        "Persistence write failed, retrying"
                    );
                    tokio::time::sleep(wait).await;
                }
                Err(err) => {
                    error!(
                        correlation_id = %correlation_id,
                        operation,
                        attempts = attempts + 1,
                        error_type = err.error_type(),
                        error = %err,
                        "Persistence write gave up"
                    );
                    return Err(err);
                }
            }
        }
    }
}

fn tally(report: &mut RecordReport, result: Result<(), DatabaseError>) {
    match result {
        Ok(()) => report.written += 1,
        Err(_) => report.failed += 1,
    }
}

/// Metric samples for a finished execution.
fn metric_samples(ctx: &ExecutionContext) -> Vec<MetricSample> {
    let agent = ctx.agent_name().unwrap_or(UNROUTED);
    let status = if ctx.is_success() { "success" } else { "failure" };

    let mut samples = vec![
        MetricSample::timer("execute", ctx.elapsed())
            .with_label("agent_name", agent)
            .with_label("status", status)
            .with_label("source", ctx.envelope.source.as_str()),
        MetricSample::counter("executions_total", 1.0)
            .with_label("agent_name", agent)
            .with_label("status", status),
    ];
    for (stage, elapsed) in &ctx.stage_timings {
        samples.push(
            MetricSample::timer("stage", *elapsed)
                .with_label("stage", stage.as_str())
                .with_label("agent_name", agent),
        );
    }
    let fallbacks = ctx.routing_fallbacks().count();
    if fallbacks > 0 {
        samples.push(
            MetricSample::counter("routing_fallbacks", fallbacks as f64)
                .with_label("agent_name", agent),
        );
    }
    samples
}
