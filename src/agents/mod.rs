//! Agents: pluggable handlers selected by the router.
//!
//! Every agent implements [`Agent`]: a name, the output keys it promises,
//! and an async `process` that turns an [`AgentInput`] into an
//! [`AgentResult`]. Agents are registered by name in an
//! [`AgentRegistry`] built once at startup.

pub mod default;
pub mod registry;
pub mod sales;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::AgentError;
use crate::pipeline::types::{TriggerSource, collect_strings};

pub use default::DefaultAgent;
pub use registry::{AgentRegistry, AgentRegistryBuilder};
pub use sales::SalesAgent;

/// Input handed to an agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInput {
    pub correlation_id: Uuid,
    pub source: TriggerSource,
    pub data: Map<String, Value>,
    #[serde(default)]
    pub metadata: Map<String, Value>,
}

impl AgentInput {
    /// First string found at any of `keys` (top level of `data`).
    pub fn first_text(&self, keys: &[&str]) -> Option<&str> {
        keys.iter()
            .find_map(|k| self.data.get(*k).and_then(Value::as_str))
    }

    /// All string leaves of `data`, newline-joined in key order.
    ///
    /// Same text the router's whole-payload rules match against.
    pub fn text_content(&self) -> String {
        let mut out = Vec::new();
        for value in self.data.values() {
            collect_strings(value, &mut out);
        }
        out.join("\n")
    }
}

/// Result of an agent run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentResult {
    pub success: bool,
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub agent_name: String,
    #[serde(default)]
    pub notes: Vec<String>,
    #[serde(default)]
    pub requires_human_review: bool,
}

impl AgentResult {
    pub fn success(agent_name: impl Into<String>, output: Value) -> Self {
        Self {
            success: true,
            output,
            error: None,
            agent_name: agent_name.into(),
            notes: Vec::new(),
            requires_human_review: false,
        }
    }

    pub fn failure(agent_name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: Value::Object(Map::new()),
            error: Some(error.into()),
            agent_name: agent_name.into(),
            notes: Vec::new(),
            requires_human_review: false,
        }
    }

    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.notes.push(note.into());
        self
    }

    pub fn with_human_review(mut self) -> Self {
        self.requires_human_review = true;
        self
    }
}

/// A pluggable handler.
#[async_trait]
pub trait Agent: Send + Sync {
    /// Registry name (e.g. "sales_agent").
    fn name(&self) -> &str;

    /// Keys that a successful output object must contain.
    fn required_output_keys(&self) -> &[&str] {
        &[]
    }

    /// Process one unit of work.
    async fn process(&self, input: &AgentInput) -> Result<AgentResult, AgentError>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn first_text_prefers_earlier_keys() {
        let input = AgentInput {
            correlation_id: Uuid::new_v4(),
            source: TriggerSource::Api,
            data: json!({"message": "second", "text": "first", "n": 1})
                .as_object()
                .cloned()
                .unwrap(),
            metadata: Map::new(),
        };
        assert_eq!(input.first_text(&["text", "message"]), Some("first"));
        assert_eq!(input.first_text(&["n", "message"]), Some("second"));
        assert_eq!(input.first_text(&["missing"]), None);
    }

    #[test]
    fn result_builders() {
        let ok = AgentResult::success("a", json!({"k": 1}))
            .with_note("done")
            .with_human_review();
        assert!(ok.success);
        assert_eq!(ok.notes, vec!["done"]);
        assert!(ok.requires_human_review);

        let err = AgentResult::failure("a", "bad input");
        assert!(!err.success);
        assert_eq!(err.error.as_deref(), Some("bad input"));
        assert_eq!(err.output, json!({}));
    }
}
