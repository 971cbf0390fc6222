//! Execution pipeline.
//!
//! Every envelope flows through:
//! 1. `Router::select()`: rule-based agent selection (data, not code)
//! 2. `Agent::process()`: runs in its own task under the process deadline
//! 3. Output validation against the agent's required keys
//! 4. Finalization into an `ExecutionOutcome`
//!
//! Each stage advances `ExecutionContext` through `ExecutionState`.
//! A failure at any stage moves it to `Failed`; nothing is thrown to
//! the caller.

pub mod executor;
pub mod router;
pub mod state;
pub mod types;

pub use executor::Pipeline;
pub use router::{RouteDecision, Router, RoutingTable};
pub use state::{ExecutionContext, ExecutionState, Stage};
pub use types::{Envelope, ExecutionOutcome, OutcomeError, TriggerSource};
