//! Submission entry point.
//!
//! `Dispatcher::submit` is the one operation transport layers call. It
//! assigns the correlation id, drives the pipeline, records the result,
//! and hands back an `ExecutionOutcome`. It never returns an error.

use std::sync::Arc;

use futures::stream::{self, StreamExt};
use tracing::{info, warn};
use uuid::Uuid;

use crate::agents::AgentRegistry;
use crate::config::DispatchConfig;
use crate::error::{RegistryError, Result};
use crate::pipeline::{Envelope, ExecutionOutcome, Pipeline, Router, RoutingTable};
use crate::recorder::ExecutionRecorder;
use crate::store::ExecutionStore;

/// Dispatch engine: pipeline plus recorder, shared across callers.
pub struct Dispatcher {
    config: Arc<DispatchConfig>,
    pipeline: Pipeline,
    recorder: ExecutionRecorder,
}

impl Dispatcher {
    /// Wire up the engine.
    ///
    /// Fails if the routing table does not compile, or if the configured
    /// default agent is not registered or is not the registry's default.
    /// Rules that name unregistered agents are logged and fall back at
    /// run time.
    pub fn new(
        config: Arc<DispatchConfig>,
        table: RoutingTable,
        registry: AgentRegistry,
        store: Arc<dyn ExecutionStore>,
    ) -> Result<Self> {
        if !registry.contains(&config.default_agent) {
            return Err(RegistryError::MissingDefault {
                name: config.default_agent.clone(),
            }
            .into());
        }
        // Unmatched envelopes and failed lookups must land on the same agent.
        if registry.default_agent_name() != config.default_agent {
            return Err(RegistryError::DefaultMismatch {
                configured: config.default_agent.clone(),
                registry: registry.default_agent_name().to_string(),
            }
            .into());
        }

        let router = Router::new(table, config.default_agent.clone())?;
        for problem in router.check_agents(&registry) {
            warn!(error = %problem, "Routing rule will fall back to default agent");
        }

        info!(
            agents = ?registry.names(),
            rules = router.rules().len(),
            default_agent = %config.default_agent,
            max_concurrent = config.max_concurrent,
            "Dispatcher ready"
        );

        let pipeline = Pipeline::new(Arc::new(router), Arc::new(registry), config.deadlines);
        let recorder = ExecutionRecorder::new(store, config.recorder);
        Ok(Self {
            config,
            pipeline,
            recorder,
        })
    }

    pub fn config(&self) -> &DispatchConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<dyn ExecutionStore> {
        self.recorder.store()
    }

    /// Run one envelope to a terminal state and return its outcome.
    pub async fn submit(&self, envelope: Envelope) -> ExecutionOutcome {
        let correlation_id = Uuid::new_v4();
        let ctx = self.pipeline.execute(correlation_id, envelope).await;

        let report = self.recorder.record(&ctx).await;
        if !report.is_complete() {
            warn!(
                correlation_id = %correlation_id,
                failed = report.failed,
                timed_out = report.timed_out,
                "Outcome delivered without complete observability records"
            );
        }
        ctx.outcome()
    }

    /// Submit many envelopes, at most `max_concurrent` in flight.
    ///
    /// Outcomes are returned in input order.
    pub async fn submit_batch(&self, envelopes: Vec<Envelope>) -> Vec<ExecutionOutcome> {
        let count = envelopes.len();
        let limit = self.config.max_concurrent.max(1);
        info!(count, limit, "Submitting envelope batch");

        let outcomes: Vec<ExecutionOutcome> = stream::iter(envelopes)
            .map(|envelope| self.submit(envelope))
            .buffered(limit)
            .collect()
            .await;

        let succeeded = outcomes.iter().filter(|o| o.success).count();
        info!(succeeded, total = count, "Batch complete");
        outcomes
    }
}
