//! Staged executor: route → process → validate → finalize.
//!
//! Every stage runs under its own deadline. Failures of any kind, agent
//! panics included, end in the `Failed` state of the returned context
//! and never escape `execute`.

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::agents::{Agent, AgentRegistry, AgentResult};
use crate::config::StageDeadlines;
use crate::error::ExecutionError;
use crate::pipeline::router::{RouteDecision, Router};
use crate::pipeline::state::{ExecutionContext, ExecutionFailure, ExecutionState, Stage};
use crate::pipeline::types::Envelope;

/// Outcome of the route stage before it is applied to the context.
struct Routing {
    decision: RouteDecision,
    agent: Arc<dyn Agent>,
    override_requested: Option<String>,
    fallback: Option<ExecutionError>,
}

/// Runs one envelope through the stages.
pub struct Pipeline {
    router: Arc<Router>,
    registry: Arc<AgentRegistry>,
    deadlines: StageDeadlines,
}

impl Pipeline {
    pub fn new(router: Arc<Router>, registry: Arc<AgentRegistry>, deadlines: StageDeadlines) -> Self {
        Self {
            router,
            registry,
            deadlines,
        }
    }

    pub fn registry(&self) -> &AgentRegistry {
        &self.registry
    }

    pub fn deadlines(&self) -> StageDeadlines {
        self.deadlines
    }

    /// Execute one envelope. Always returns a context in a terminal state.
    pub async fn execute(&self, correlation_id: Uuid, envelope: Envelope) -> ExecutionContext {
        let mut ctx = ExecutionContext::new(correlation_id, envelope);
        info!(
            correlation_id = %correlation_id,
            source = %ctx.envelope.source,
            "Execution started"
        );

        let Some(agent) = self.route_stage(&mut ctx).await else {
            return ctx;
        };
        let Some(result) = self.process_stage(&mut ctx, &agent).await else {
            return ctx;
        };
        if !self.validate_stage(&mut ctx, agent.as_ref(), &result).await {
            return ctx;
        }
        self.finalize_stage(&mut ctx, result).await;

        info!(
            correlation_id = %correlation_id,
            agent = ctx.agent_name().unwrap_or("-"),
            state = %ctx.state,
            elapsed_ms = ctx.elapsed().as_millis() as u64,
            "Execution finished"
        );
        ctx
    }

    // ── Route ───────────────────────────────────────────────────────

    fn route(&self, envelope: &Envelope) -> Routing {
        if let Some(requested) = &envelope.agent {
            return match self.registry.resolve(requested) {
                Ok(agent) => Routing {
                    decision: RouteDecision {
                        agent_name: requested.clone(),
                        rule: None,
                    },
                    agent,
                    override_requested: Some(requested.clone()),
                    fallback: None,
                },
                Err(_) => self.fallback(ExecutionError::Routing {
                    requested: requested.clone(),
                }),
            };
        }

        let decision = self.router.select(envelope);
        match self.registry.resolve(&decision.agent_name) {
            Ok(agent) => Routing {
                decision,
                agent,
                override_requested: None,
                fallback: None,
            },
            Err(_) => self.fallback(ExecutionError::Routing {
                requested: decision.agent_name,
            }),
        }
    }

    fn fallback(&self, error: ExecutionError) -> Routing {
        Routing {
            decision: RouteDecision {
                agent_name: self.registry.default_agent_name().to_string(),
                rule: None,
            },
            agent: self.registry.default_agent(),
            override_requested: None,
            fallback: Some(error),
        }
    }

    async fn route_stage(&self, ctx: &mut ExecutionContext) -> Option<Arc<dyn Agent>> {
        let started = Instant::now();
        let deadline = self.deadlines.route;
        let routing = self.route(&ctx.envelope);
        ctx.record_timing(Stage::Route, started.elapsed());

        if overran(started, deadline) {
            fail(ctx, Stage::Route, ExecutionError::Timeout { stage: Stage::Route, deadline }, None);
            return None;
        }

        if let Some(requested) = routing.override_requested {
            ctx.note(Stage::Route, "override", Value::String(requested));
        }
        if let Some(err) = routing.fallback {
            warn!(
                correlation_id = %ctx.correlation_id,
                error = %err,
                fallback = %routing.decision.agent_name,
                "Routing fell back to default agent"
            );
            ctx.note(
                Stage::Route,
                "routing_error",
                json!({"error_type": err.error_type(), "message": err.to_string()}),
            );
        }

        debug!(
            correlation_id = %ctx.correlation_id,
            agent = %routing.decision.agent_name,
            rule = routing.decision.rule.as_deref().unwrap_or("-"),
            "Routed"
        );
        ctx.attach_route(routing.decision);
        transition(ctx, ExecutionState::Routed, None);
        Some(routing.agent)
    }

    // ── Process ─────────────────────────────────────────────────────

    async fn process_stage(
        &self,
        ctx: &mut ExecutionContext,
        agent: &Arc<dyn Agent>,
    ) -> Option<AgentResult> {
        let agent_name = agent.name().to_string();
        let task_agent = Arc::clone(agent);
        transition(ctx, ExecutionState::Processing, Some(format!("agent {agent_name}")));

        let input = ctx.agent_input();
        let deadline = self.deadlines.process;
        let started = Instant::now();
        let mut handle = tokio::spawn(async move { task_agent.process(&input).await });
        let joined = timeout(deadline, &mut handle).await;
        let elapsed = started.elapsed();
        ctx.record_timing(Stage::Process, elapsed);

        match joined {
            Err(_) => {
                handle.abort();
                fail(
                    ctx,
                    Stage::Process,
                    ExecutionError::Timeout {
                        stage: Stage::Process,
                        deadline,
                    },
                    None,
                );
                None
            }
            Ok(Err(join_err)) => {
                let trace = if join_err.is_panic() {
                    Some(panic_message(join_err.into_panic()))
                } else {
                    None
                };
                let reason = match &trace {
                    Some(msg) => format!("agent panicked: {msg}"),
                    None => "agent task was cancelled".to_string(),
                };
                fail(
                    ctx,
                    Stage::Process,
                    ExecutionError::AgentExecution {
                        agent: agent_name,
                        reason,
                    },
                    trace,
                );
                None
            }
            Ok(Ok(Err(agent_err))) => {
                let trace = error_chain(&agent_err);
                fail(
                    ctx,
                    Stage::Process,
                    ExecutionError::AgentExecution {
                        agent: agent_name,
                        reason: agent_err.to_string(),
                    },
                    Some(trace),
                );
                None
            }
            Ok(Ok(Ok(result))) => {
                debug!(
                    correlation_id = %ctx.correlation_id,
                    agent = %agent_name,
                    success = result.success,
                    elapsed_ms = elapsed.as_millis() as u64,
                    "Agent returned"
                );
                let reported = (!result.success).then(|| {
                    result
                        .error
                        .clone()
                        .unwrap_or_else(|| "agent reported failure".to_string())
                });
                ctx.attach_agent_result(result.clone());
                if let Some(reason) = reported {
                    fail(
                        ctx,
                        Stage::Process,
                        ExecutionError::AgentExecution {
                            agent: agent_name,
                            reason,
                        },
                        None,
                    );
                    return None;
                }
                Some(result)
            }
        }
    }

    // ── Validate ────────────────────────────────────────────────────

    async fn validate_stage(
        &self,
        ctx: &mut ExecutionContext,
        agent: &dyn Agent,
        result: &AgentResult,
    ) -> bool {
        let started = Instant::now();
        let deadline = self.deadlines.validate;
        let checked = validate_output(agent, &result.output);
        ctx.record_timing(Stage::Validate, started.elapsed());

        if overran(started, deadline) {
            fail(
                ctx,
                Stage::Validate,
                ExecutionError::Timeout {
                    stage: Stage::Validate,
                    deadline,
                },
                None,
            );
            return false;
        }

        match checked {
            Err(reason) => {
                fail(
                    ctx,
                    Stage::Validate,
                    ExecutionError::Validation {
                        agent: agent.name().to_string(),
                        reason,
                    },
                    None,
                );
                false
            }
            Ok(()) => {
                transition(ctx, ExecutionState::Validated, None);
                true
            }
        }
    }

    // ── Finalize ────────────────────────────────────────────────────

    async fn finalize_stage(&self, ctx: &mut ExecutionContext, result: AgentResult) {
        let started = Instant::now();
        let deadline = self.deadlines.finalize;
        let output = result.output;
        ctx.record_timing(Stage::Finalize, started.elapsed());

        if overran(started, deadline) {
            fail(
                ctx,
                Stage::Finalize,
                ExecutionError::Timeout {
                    stage: Stage::Finalize,
                    deadline,
                },
                None,
            );
            return;
        }
        ctx.attach_output(output);
        transition(ctx, ExecutionState::Finalized, None);
    }
}

/// Route, validate and finalize run synchronously and cannot be
/// preempted, so their budget is checked once the work returns.
/// A zero deadline is always overrun.
fn overran(started: Instant, deadline: Duration) -> bool {
    started.elapsed() >= deadline
}

/// Output must be a non-empty object carrying the agent's required keys.
fn validate_output(agent: &dyn Agent, output: &Value) -> Result<(), String> {
    let Some(map) = output.as_object() else {
        return Err(format!("output must be an object, got {}", json_kind(output)));
    };
    if map.is_empty() {
        return Err("output is empty".to_string());
    }
    let missing: Vec<&str> = agent
        .required_output_keys()
        .iter()
        .copied()
        .filter(|k| !map.contains_key(*k))
        .collect();
    if !missing.is_empty() {
        return Err(format!("missing required keys: {}", missing.join(", ")));
    }
    Ok(())
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

fn transition(ctx: &mut ExecutionContext, to: ExecutionState, reason: Option<String>) {
    if let Err(e) = ctx.transition_to(to, reason) {
        error!(correlation_id = %ctx.correlation_id, error = %e, "Invalid state transition");
    }
}

fn fail(ctx: &mut ExecutionContext, stage: Stage, err: ExecutionError, trace: Option<String>) {
    warn!(
        correlation_id = %ctx.correlation_id,
        stage = %stage,
        error_type = err.error_type(),
        error = %err,
        "Execution failed"
    );
    let mut failure = ExecutionFailure::new(stage, &err).with_stack_trace(trace);
    if let Some(agent) = ctx.agent_name() {
        failure = failure.with_metadata("agent_name", Value::String(agent.to_string()));
    }
    ctx.fail(failure);
}

/// Text of a panic payload.
fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Error plus its `source()` chain, one cause per line.
fn error_chain(err: &dyn std::error::Error) -> String {
    let mut out = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        out.push_str("\ncaused by: ");
        out.push_str(&cause.to_string());
        source = cause.source();
    }
    out
}
