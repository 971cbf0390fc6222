//! Agent dispatch: routes inbound work to agents, runs it through a
//! staged pipeline, and records the outcome.

pub mod agents;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod pipeline;
pub mod recorder;
pub mod store;

pub use dispatcher::Dispatcher;
