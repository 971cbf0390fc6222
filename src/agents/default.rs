//! Fallback agent for work no routing rule claimed.

use async_trait::async_trait;
use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};

use crate::agents::{Agent, AgentInput, AgentResult};
use crate::error::AgentError;

const NAME: &str = "default_agent";

const DEFAULT_TEMPLATE: &str =
    "Thank you for your message. We have received your request and will respond appropriately.";

/// Acknowledges the request and flags it for a human.
#[derive(Debug, Clone)]
pub struct DefaultAgent {
    response_template: String,
    log_unmatched: bool,
}

impl DefaultAgent {
    pub fn new() -> Self {
        Self {
            response_template: DEFAULT_TEMPLATE.to_string(),
            log_unmatched: true,
        }
    }

    /// Replace the acknowledgement text.
    pub fn with_template(mut self, template: impl Into<String>) -> Self {
        self.response_template = template.into();
        self
    }

    pub fn with_unmatched_logging(mut self, enabled: bool) -> Self {
        self.log_unmatched = enabled;
        self
    }
}

impl Default for DefaultAgent {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Agent for DefaultAgent {
    fn name(&self) -> &str {
        NAME
    }

    fn required_output_keys(&self) -> &[&str] {
        &[
            "agent_type",
            "response_type",
            "message",
            "source",
            "processed_at",
            "requires_human_review",
        ]
    }

    async fn process(&self, input: &AgentInput) -> Result<AgentResult, AgentError> {
        if input.data.is_empty() {
            return Ok(AgentResult::failure(
                NAME,
                "Invalid input data for default agent",
            )
            .with_note("Default agent processing failed"));
        }

        if self.log_unmatched {
            let keys: Vec<&str> = input.data.keys().map(String::as_str).collect();
            info!(
                correlation_id = %input.correlation_id,
                source = %input.source,
                data_keys = ?keys,
                "Default agent handling unmatched request"
            );
            warn!(source = %input.source, "Unmatched request routed to default agent");
        }

        let output = json!({
            "agent_type": "default",
            "response_type": "fallback",
            "message": self.response_template,
            "source": input.source.as_str(),
            "processed_at": Utc::now().to_rfc3339(),
            "requires_human_review": true,
        });

        Ok(AgentResult::success(NAME, output)
            .with_note("Processed by default fallback agent")
            .with_note(format!("Request source: {}", input.source))
            .with_human_review())
    }
}
