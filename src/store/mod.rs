//! Persistence layer: libSQL-backed storage for execution records,
//! metric samples, and error logs.

pub mod libsql_backend;
pub mod migrations;
pub mod model;
pub mod traits;

pub use libsql_backend::LibSqlBackend;
pub use model::{AgentStats, ErrorLogEntry, ExecutionRecord, MetricSample, MetricType};
pub use traits::ExecutionStore;
