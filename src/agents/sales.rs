//! Sales agent: intent and urgency analysis for sales enquiries.

use std::borrow::Cow;

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use crate::agents::{Agent, AgentInput, AgentResult};
use crate::error::AgentError;

const NAME: &str = "sales_agent";

/// Free-text keys read when there is no `email` object.
const TEXT_KEYS: &[&str] = &["text", "message", "body", "subject"];

/// Detected enquiry intent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intent {
    PricingInquiry,
    EnterprisePlan,
    PlanDetails,
    GeneralInquiry,
}

impl Intent {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PricingInquiry => "pricing_inquiry",
            Self::EnterprisePlan => "enterprise_plan",
            Self::PlanDetails => "plan_details",
            Self::GeneralInquiry => "general_inquiry",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Urgency {
    Low,
    Medium,
    High,
}

impl Urgency {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Medium => "medium",
            Self::High => "high",
        }
    }
}

/// Sales message extracted from the input.
#[derive(Debug, Default)]
struct SalesMessage<'a> {
    subject: &'a str,
    body: Cow<'a, str>,
    sender: &'a str,
}

impl<'a> SalesMessage<'a> {
    /// Reads `email.{subject,body,sender}` or the top-level text keys.
    /// When neither yields text, the body is every string in the payload,
    /// so anything the router matched on is still analyzed.
    fn from_input(input: &'a AgentInput) -> Self {
        let mut message = match input.data.get("email").and_then(Value::as_object) {
            Some(email) => {
                let get = |k: &str| email.get(k).and_then(Value::as_str);
                Self {
                    subject: get("subject").unwrap_or(""),
                    body: Cow::Borrowed(get("body").unwrap_or("")),
                    sender: get("sender").or_else(|| get("from")).unwrap_or(""),
                }
            }
            None => Self {
                body: Cow::Borrowed(input.first_text(TEXT_KEYS).unwrap_or("")),
                sender: input.first_text(&["sender", "from"]).unwrap_or(""),
                ..Default::default()
            },
        };
        if message.is_empty() {
            message.body = Cow::Owned(input.text_content());
        }
        message
    }

    fn is_empty(&self) -> bool {
        self.subject.trim().is_empty() && self.body.trim().is_empty()
    }
}

/// Classify intent. Checks are ordered; the first hit wins.
pub fn analyze_intent(subject: &str, body: &str) -> (Intent, Urgency) {
    let subject = subject.to_lowercase();
    let body = body.to_lowercase();
    let mentions = |word: &str| subject.contains(word) || body.contains(word);

    if mentions("pricing") {
        (Intent::PricingInquiry, Urgency::High)
    } else if mentions("enterprise") {
        (Intent::EnterprisePlan, Urgency::Medium)
    } else if mentions("plan") {
        (Intent::PlanDetails, Urgency::Low)
    } else {
        (Intent::GeneralInquiry, Urgency::Low)
    }
}

/// Company guessed from the sender's domain: `jo@acme.io` -> `Acme`.
pub fn company_from_sender(sender: &str) -> String {
    let label = sender
        .rsplit('@')
        .next()
        .and_then(|domain| domain.split('.').next())
        .unwrap_or("")
        .trim();
    if label.is_empty() || !sender.contains('@') {
        return "Unknown".to_string();
    }
    let mut chars = label.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars.flat_map(char::to_lowercase)).collect(),
        None => "Unknown".to_string(),
    }
}

/// Routes sales enquiries into structured notes.
#[derive(Debug, Default)]
pub struct SalesAgent;

impl SalesAgent {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Agent for SalesAgent {
    fn name(&self) -> &str {
        NAME
    }

    fn required_output_keys(&self) -> &[&str] {
        &["intent", "urgency", "customer_details"]
    }

    async fn process(&self, input: &AgentInput) -> Result<AgentResult, AgentError> {
        let message = SalesMessage::from_input(input);
        if message.is_empty() {
            return Ok(AgentResult::failure(
                NAME,
                "Invalid input data for sales agent",
            ));
        }

        let (intent, urgency) = analyze_intent(message.subject, &message.body);
        let company = company_from_sender(message.sender);

        let (intent, urgency) = (intent.as_str(), urgency.as_str());
        info!(
            correlation_id = %input.correlation_id,
            intent,
            urgency,
            company = %company,
            "Sales enquiry analyzed"
        );

        let output = json!({
            "intent": intent,
            "urgency": urgency,
            "customer_details": {
                "email": message.sender,
                "company": company,
            },
        });

        let sender = if message.sender.is_empty() {
            "unknown sender"
        } else {
            message.sender
        };
        Ok(AgentResult::success(NAME, output)
            .with_note(format!("Processed message from {sender}"))
            .with_note(format!("Identified intent: {intent}"))
            .with_note(format!("Urgency level: {urgency}")))
    }
}

#[cfg(test)]
mod tests {
    use serde_json::Map;
    use uuid::Uuid;

    use super::*;
    use crate::pipeline::types::TriggerSource;

    fn input(data: Value) -> AgentInput {
        AgentInput {
            correlation_id: Uuid::new_v4(),
            source: TriggerSource::Email,
            data: data.as_object().cloned().unwrap_or_default(),
            metadata: Map::new(),
        }
    }

    #[test]
    fn intent_priority_order() {
        assert_eq!(
            analyze_intent("Enterprise plan pricing", ""),
            (Intent::PricingInquiry, Urgency::High)
        );
        assert_eq!(
            analyze_intent("", "our enterprise needs a plan"),
            (Intent::EnterprisePlan, Urgency::Medium)
        );
        assert_eq!(
            analyze_intent("Which PLAN?", ""),
            (Intent::PlanDetails, Urgency::Low)
        );
        assert_eq!(
            analyze_intent("hello", "just saying hi"),
            (Intent::GeneralInquiry, Urgency::Low)
        );
    }

    #[test]
    fn company_extraction() {
        assert_eq!(company_from_sender("jo@acme.io"), "Acme");
        assert_eq!(company_from_sender("ops@BIG-corp.co.uk"), "Big-corp");
        assert_eq!(company_from_sender(""), "Unknown");
        assert_eq!(company_from_sender("no-at-sign"), "Unknown");
    }

    #[tokio::test]
    async fn email_payload_produces_notes() {
        let result = SalesAgent::new()
            .process(&input(json!({"email": {
                "subject": "Pricing question",
                "body": "What does the team tier cost?",
                "sender": "ana@globex.com"
            }})))
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.agent_name, "sales_agent");
        assert_eq!(result.output["intent"], "pricing_inquiry");
        assert_eq!(result.output["urgency"], "high");
        assert_eq!(result.output["customer_details"]["company"], "Globex");
        assert_eq!(result.output["customer_details"]["email"], "ana@globex.com");
        assert_eq!(result.notes.len(), 3);
    }

    #[tokio::test]
    async fn free_text_payload_is_accepted() {
        let result = SalesAgent::new()
            .process(&input(json!({"text": "Interested in pricing for enterprise plan"})))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["intent"], "pricing_inquiry");
        assert_eq!(result.output["customer_details"]["company"], "Unknown");
    }

    #[tokio::test]
    async fn unrecognized_fields_fall_back_to_full_text() {
        let agent = SalesAgent::new();

        let loose = agent
            .process(&input(json!({"content": "I want to buy 40 seats, pricing?"})))
            .await
            .unwrap();
        assert!(loose.success);
        assert_eq!(loose.output["intent"], "pricing_inquiry");

        let sender_only = agent
            .process(&input(json!({"email": {"sender": "sales@acme.com", "text": "hi"}})))
            .await
            .unwrap();
        assert!(sender_only.success);
        assert_eq!(sender_only.output["customer_details"]["company"], "Acme");

        let from_and_content = agent
            .process(&input(json!({"email": {"from": "x", "content": "need a quote"}})))
            .await
            .unwrap();
        assert!(from_and_content.success);
        assert_eq!(from_and_content.output["customer_details"]["email"], "x");
    }

    #[tokio::test]
    async fn empty_payload_is_rejected() {
        let result = SalesAgent::new().process(&input(json!({}))).await.unwrap();
        assert!(!result.success);
        assert!(result.error.is_some());

        let blank = SalesAgent::new()
            .process(&input(json!({"email": {"subject": " ", "body": ""}})))
            .await
            .unwrap();
        assert!(!blank.success);
    }
}
