//! Execution state machine and per-execution context.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::time::Instant;
use tracing::warn;
use uuid::Uuid;

use crate::agents::{AgentInput, AgentResult};
use crate::error::ExecutionError;
use crate::pipeline::router::RouteDecision;
use crate::pipeline::types::{Envelope, ExecutionOutcome, OutcomeError};

/// Named pipeline step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Route,
    Process,
    Validate,
    Finalize,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Route => "route",
            Self::Process => "process",
            Self::Validate => "validate",
            Self::Finalize => "finalize",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of an execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionState {
    /// Submitted, not yet routed.
    Pending,
    /// An agent has been selected.
    Routed,
    /// The agent is running.
    Processing,
    /// Agent output passed validation.
    Validated,
    /// Outcome assembled. Terminal.
    Finalized,
    /// Execution failed. Terminal.
    Failed,
}

impl ExecutionState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: ExecutionState) -> bool {
        use ExecutionState::*;

        if target == Failed {
            return !self.is_terminal();
        }
        matches!(
            (self, target),
            (Pending, Routed) | (Routed, Processing) | (Processing, Validated) | (Validated, Finalized)
        )
    }

    /// Check if this is a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Finalized | Self::Failed)
    }
}

impl fmt::Display for ExecutionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Routed => "routed",
            Self::Processing => "processing",
            Self::Validated => "validated",
            Self::Finalized => "finalized",
            Self::Failed => "failed",
        };
        write!(f, "{s}")
    }
}

/// A state transition event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateTransition {
    pub from: ExecutionState,
    pub to: ExecutionState,
    pub timestamp: DateTime<Utc>,
    pub reason: Option<String>,
}

/// A value that can be set exactly once.
#[derive(Debug, Clone)]
pub struct WriteOnce<T>(Option<T>);

impl<T> WriteOnce<T> {
    pub fn new() -> Self {
        Self(None)
    }

    /// Store a value. If one is already present it is kept and `value`
    /// is handed back.
    pub fn set(&mut self, value: T) -> Result<(), T> {
        if self.0.is_some() {
            return Err(value);
        }
        self.0 = Some(value);
        Ok(())
    }

    pub fn get(&self) -> Option<&T> {
        self.0.as_ref()
    }
}

impl<T> Default for WriteOnce<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// One entry of the per-execution audit trail.
#[derive(Debug, Clone, Serialize)]
pub struct AuditEntry {
    pub stage: Stage,
    pub key: String,
    pub value: Value,
    pub at: DateTime<Utc>,
}

/// Captured failure of an execution.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionFailure {
    pub error_type: String,
    pub message: String,
    pub stage: Stage,
    pub stack_trace: Option<String>,
    pub metadata: Value,
}

impl ExecutionFailure {
    pub fn new(stage: Stage, error: &ExecutionError) -> Self {
        Self {
            error_type: error.error_type().to_string(),
            message: error.to_string(),
            stage,
            stack_trace: None,
            metadata: Value::Object(Default::default()),
        }
    }

    pub fn with_stack_trace(mut self, trace: Option<String>) -> Self {
        self.stack_trace = trace;
        self
    }

    pub fn with_metadata(mut self, key: &str, value: Value) -> Self {
        if let Value::Object(map) = &mut self.metadata {
            map.insert(key.to_string(), value);
        }
        self
    }
}

/// State of one execution as it moves through the pipeline.
///
/// Stage outputs are write-once: a later stage cannot replace what an
/// earlier one recorded. Every write also lands in `audit`.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub correlation_id: Uuid,
    pub envelope: Envelope,
    pub state: ExecutionState,
    pub transitions: Vec<StateTransition>,
    pub audit: Vec<AuditEntry>,
    pub stage_timings: Vec<(Stage, Duration)>,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    route: WriteOnce<RouteDecision>,
    agent_result: WriteOnce<AgentResult>,
    output: WriteOnce<Value>,
    failure: WriteOnce<ExecutionFailure>,
    elapsed: WriteOnce<Duration>,
    started: Instant,
}

impl ExecutionContext {
    pub fn new(correlation_id: Uuid, envelope: Envelope) -> Self {
        Self {
            correlation_id,
            envelope,
            state: ExecutionState::Pending,
            transitions: Vec::new(),
            audit: Vec::new(),
            stage_timings: Vec::new(),
            created_at: Utc::now(),
            completed_at: None,
            route: WriteOnce::new(),
            agent_result: WriteOnce::new(),
            output: WriteOnce::new(),
            failure: WriteOnce::new(),
            elapsed: WriteOnce::new(),
            started: Instant::now(),
        }
    }

    /// Transition to a new state.
    pub fn transition_to(
        &mut self,
        new_state: ExecutionState,
        reason: Option<String>,
    ) -> Result<(), String> {
        if !self.state.can_transition_to(new_state) {
            return Err(format!(
                "Cannot transition from {} to {}",
                self.state, new_state
            ));
        }

        self.transitions.push(StateTransition {
            from: self.state,
            to: new_state,
            timestamp: Utc::now(),
            reason,
        });

        self.state = new_state;

        if new_state.is_terminal() {
            self.completed_at = Some(Utc::now());
            let _ = self.elapsed.set(self.started.elapsed());
        }
        Ok(())
    }

    /// Record an audit entry without touching typed stage fields.
    pub fn note(&mut self, stage: Stage, key: impl Into<String>, value: Value) {
        self.audit.push(AuditEntry {
            stage,
            key: key.into(),
            value,
            at: Utc::now(),
        });
    }

    pub fn record_timing(&mut self, stage: Stage, elapsed: Duration) {
        self.stage_timings.push((stage, elapsed));
    }

    pub fn attach_route(&mut self, decision: RouteDecision) {
        let value = serde_json::json!({
            "agent_name": decision.agent_name,
            "rule": decision.rule,
        });
        if self.route.set(decision).is_err() {
            warn!(correlation_id = %self.correlation_id, "Route already attached, keeping first");
            return;
        }
        self.note(Stage::Route, "route", value);
    }

    pub fn attach_agent_result(&mut self, result: AgentResult) {
        let value = serde_json::json!({
            "success": result.success,
            "agent_name": result.agent_name,
            "error": result.error,
        });
        if self.agent_result.set(result).is_err() {
            warn!(correlation_id = %self.correlation_id, "Agent result already attached, keeping first");
            return;
        }
        self.note(Stage::Process, "agent_result", value);
    }

    pub fn attach_output(&mut self, output: Value) {
        if self.output.set(output).is_err() {
            warn!(correlation_id = %self.correlation_id, "Output already attached, keeping first");
            return;
        }
        self.note(Stage::Finalize, "output", Value::Bool(true));
    }

    /// Move to `Failed`, capturing the failure. No-op once terminal.
    pub fn fail(&mut self, failure: ExecutionFailure) {
        if self.state.is_terminal() {
            warn!(
                correlation_id = %self.correlation_id,
                state = %self.state,
                "Ignoring failure on terminal execution"
            );
            return;
        }
        let reason = format!("{}: {}", failure.error_type, failure.message);
        self.note(
            failure.stage,
            "failure",
            serde_json::json!({"error_type": failure.error_type, "message": failure.message}),
        );
        let _ = self.failure.set(failure);
        let _ = self.transition_to(ExecutionState::Failed, Some(reason));
    }

    pub fn route(&self) -> Option<&RouteDecision> {
        self.route.get()
    }

    pub fn agent_name(&self) -> Option<&str> {
        self.route.get().map(|r| r.agent_name.as_str())
    }

    pub fn agent_result(&self) -> Option<&AgentResult> {
        self.agent_result.get()
    }

    pub fn output(&self) -> Option<&Value> {
        self.output.get()
    }

    pub fn failure(&self) -> Option<&ExecutionFailure> {
        self.failure.get()
    }

    pub fn is_success(&self) -> bool {
        self.state == ExecutionState::Finalized
    }

    /// Wall time of the whole run, frozen at the terminal transition.
    pub fn elapsed(&self) -> Duration {
        self.elapsed
            .get()
            .copied()
            .unwrap_or_else(|| self.started.elapsed())
    }

    /// Audit entries flagged as routing fallbacks.
    pub fn routing_fallbacks(&self) -> impl Iterator<Item = &AuditEntry> {
        self.audit
            .iter()
            .filter(|e| e.stage == Stage::Route && e.key == "routing_error")
    }

    /// Build the input handed to the agent.
    pub fn agent_input(&self) -> AgentInput {
        AgentInput {
            correlation_id: self.correlation_id,
            source: self.envelope.source.clone(),
            data: self.envelope.data.clone(),
            metadata: self.envelope.metadata.clone(),
        }
    }

    /// Public outcome for the caller.
    pub fn outcome(&self) -> ExecutionOutcome {
        let result = self.agent_result();
        let error = if self.is_success() {
            None
        } else {
            Some(match self.failure() {
                Some(f) => OutcomeError {
                    error_type: f.error_type.clone(),
                    message: f.message.clone(),
                },
                None => OutcomeError {
                    error_type: "IncompleteExecution".to_string(),
                    message: format!("execution ended in state {}", self.state),
                },
            })
        };
        ExecutionOutcome {
            correlation_id: self.correlation_id,
            agent_name: self.agent_name().map(str::to_string),
            success: self.is_success(),
            output: if self.is_success() {
                self.output().cloned()
            } else {
                None
            },
            error,
            notes: result.map(|r| r.notes.clone()).unwrap_or_default(),
            requires_human_review: result.is_some_and(|r| r.requires_human_review),
            state: self.state,
            execution_time_ms: self.elapsed().as_millis() as u64,
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn ctx() -> ExecutionContext {
        ExecutionContext::new(Uuid::new_v4(), Envelope::new("api", json!({"text": "hi"})))
    }

    #[test]
    fn state_transitions_valid() {
        use ExecutionState::*;
        assert!(Pending.can_transition_to(Routed));
        assert!(Routed.can_transition_to(Processing));
        assert!(Processing.can_transition_to(Validated));
        assert!(Validated.can_transition_to(Finalized));
        for state in [Pending, Routed, Processing, Validated] {
            assert!(state.can_transition_to(Failed), "{state} -> failed");
        }
    }

    #[test]
    fn state_transitions_invalid() {
        use ExecutionState::*;
        assert!(!Pending.can_transition_to(Processing));
        assert!(!Routed.can_transition_to(Finalized));
        assert!(!Finalized.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Finalized));
        assert!(!Failed.can_transition_to(Failed));
    }

    #[test]
    fn terminal_states() {
        assert!(ExecutionState::Finalized.is_terminal());
        assert!(ExecutionState::Failed.is_terminal());
        assert!(!ExecutionState::Processing.is_terminal());
    }

    #[test]
    fn write_once_keeps_first_value() {
        let mut slot = WriteOnce::new();
        assert!(slot.set(1).is_ok());
        assert_eq!(slot.set(2), Err(2));
        assert_eq!(slot.get(), Some(&1));
    }

    #[test]
    fn route_cannot_be_overwritten() {
        let mut ctx = ctx();
        ctx.attach_route(RouteDecision {
            agent_name: "sales_agent".into(),
            rule: Some("sales".into()),
        });
        ctx.attach_route(RouteDecision {
            agent_name: "default_agent".into(),
            rule: None,
        });
        assert_eq!(ctx.agent_name(), Some("sales_agent"));
        assert_eq!(ctx.audit.iter().filter(|e| e.key == "route").count(), 1);
    }

    #[test]
    fn full_happy_path_reaches_finalized() {
        let mut ctx = ctx();
        for state in [
            ExecutionState::Routed,
            ExecutionState::Processing,
            ExecutionState::Validated,
            ExecutionState::Finalized,
        ] {
            ctx.transition_to(state, None).unwrap();
        }
        assert!(ctx.is_success());
        assert!(ctx.completed_at.is_some());
        assert_eq!(ctx.transitions.len(), 4);
    }

    #[test]
    fn fail_is_terminal_and_sticky() {
        let mut ctx = ctx();
        ctx.transition_to(ExecutionState::Routed, None).unwrap();
        let err = ExecutionError::AgentExecution {
            agent: "a".into(),
            reason: "boom".into(),
        };
        ctx.fail(ExecutionFailure::new(Stage::Process, &err));
        assert_eq!(ctx.state, ExecutionState::Failed);

        let second = ExecutionError::Validation {
            agent: "a".into(),
            reason: "late".into(),
        };
        ctx.fail(ExecutionFailure::new(Stage::Validate, &second));
        assert_eq!(ctx.failure().unwrap().error_type, "AgentExecutionError");
        assert!(ctx.transition_to(ExecutionState::Finalized, None).is_err());
    }

    #[test]
    fn failed_outcome_carries_error() {
        let mut ctx = ctx();
        let err = ExecutionError::Timeout {
            stage: Stage::Process,
            deadline: Duration::from_secs(1),
        };
        ctx.fail(ExecutionFailure::new(Stage::Process, &err));
        let outcome = ctx.outcome();
        assert!(!outcome.success);
        assert!(outcome.output.is_none());
        assert_eq!(outcome.error.unwrap().error_type, "TimeoutError");
        assert_eq!(outcome.state, ExecutionState::Failed);
    }

    #[test]
    fn execution_state_serde() {
        let json = serde_json::to_string(&ExecutionState::Finalized).unwrap();
        assert_eq!(json, "\"finalized\"");
        assert_eq!(Stage::Validate.to_string(), "validate");
    }
}
