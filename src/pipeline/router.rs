//! Rule-based router: maps an envelope to an agent name.
//!
//! Rules are data. They are deserialized from a JSON routing table,
//! compiled once, and evaluated in order; the first match wins. When
//! nothing matches, the configured default agent is returned. Selection
//! never fails.

use std::path::Path;

use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::agents::AgentRegistry;
use crate::error::{ConfigError, Error, RoutingError};
use crate::pipeline::types::{Envelope, TriggerSource, collect_strings};

/// Keywords evidenced for sales routing.
const SALES_KEYWORDS: &[&str] = &[
    "buy", "purchase", "price", "quote", "sales", "demo", "pricing", "want",
];

// ── Routing table (configuration) ───────────────────────────────────

/// How a rule matches text.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "match", rename_all = "snake_case")]
pub enum MatcherSpec {
    /// Any keyword occurs as a substring.
    Keywords {
        keywords: Vec<String>,
        #[serde(default)]
        case_sensitive: bool,
    },
    /// Regular expression.
    Regex { pattern: String },
}

/// One routing rule as written in configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    pub agent: String,
    /// Restrict to these sources. Empty means any source.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sources: Vec<TriggerSource>,
    /// Dot path into `data`. Absent means all text content.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    #[serde(flatten)]
    pub matcher: MatcherSpec,
}

/// Ordered rule list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RoutingTable {
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl RoutingTable {
    /// Built-in table: sales keywords route to `sales_agent`.
    pub fn builtin() -> Self {
        Self {
            rules: vec![RuleSpec {
                name: "sales_keywords".into(),
                agent: "sales_agent".into(),
                sources: Vec::new(),
                field: None,
                matcher: MatcherSpec::Keywords {
                    keywords: SALES_KEYWORDS.iter().map(|k| k.to_string()).collect(),
                    case_sensitive: false,
                },
            }],
        }
    }

    pub fn from_json(json: &str) -> Result<Self, RoutingError> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn from_file(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path).map_err(ConfigError::Io)?;
        Ok(Self::from_json(&raw)?)
    }
}

// ── Compiled rules ──────────────────────────────────────────────────

/// A compiled routing rule.
#[derive(Debug, Clone)]
pub struct RoutingRule {
    pub name: String,
    pub agent: String,
    sources: Vec<TriggerSource>,
    field: Option<String>,
    regex: Regex,
}

impl RoutingRule {
    fn compile(spec: RuleSpec) -> Result<Self, RoutingError> {
        let (pattern, case_insensitive) = match &spec.matcher {
            MatcherSpec::Keywords {
                keywords,
                case_sensitive,
            } => {
                let alternatives: Vec<String> = keywords
                    .iter()
                    .map(|k| k.trim())
                    .filter(|k| !k.is_empty())
                    .map(regex::escape)
                    .collect();
                if alternatives.is_empty() {
                    return Err(RoutingError::EmptyRule { rule: spec.name });
                }
                (format!("(?:{})", alternatives.join("|")), !case_sensitive)
            }
            MatcherSpec::Regex { pattern } => (pattern.clone(), false),
        };

        let regex = RegexBuilder::new(&pattern)
            .case_insensitive(case_insensitive)
            .build()
            .map_err(|source| RoutingError::InvalidPattern {
                rule: spec.name.clone(),
                source,
            })?;

        Ok(Self {
            name: spec.name,
            agent: spec.agent,
            sources: spec.sources,
            field: spec.field,
            regex,
        })
    }

    fn matches(&self, envelope: &Envelope) -> bool {
        if !self.sources.is_empty() && !self.sources.contains(&envelope.source) {
            return false;
        }
        match &self.field {
            Some(path) => match envelope.field(path) {
                Some(value) => {
                    let mut parts = Vec::new();
                    collect_strings(value, &mut parts);
                    parts.iter().any(|s| self.regex.is_match(s))
                }
                None => false,
            },
            None => self.regex.is_match(&envelope.text_content()),
        }
    }
}

/// Result of routing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteDecision {
    pub agent_name: String,
    /// Rule that matched. `None` for default routing.
    pub rule: Option<String>,
}

/// Ordered, first-match-wins router. Read-only after construction.
#[derive(Debug, Clone)]
pub struct Router {
    rules: Vec<RoutingRule>,
    default_agent: String,
}

impl Router {
    /// Compile a routing table.
    pub fn new(table: RoutingTable, default_agent: impl Into<String>) -> Result<Self, RoutingError> {
        let rules = table
            .rules
            .into_iter()
            .map(RoutingRule::compile)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            rules,
            default_agent: default_agent.into(),
        })
    }

    pub fn default_agent(&self) -> &str {
        &self.default_agent
    }

    pub fn rules(&self) -> &[RoutingRule] {
        &self.rules
    }

    /// Select an agent for the envelope.
    pub fn select(&self, envelope: &Envelope) -> RouteDecision {
        for rule in &self.rules {
            if rule.matches(envelope) {
                debug!(
                    rule = %rule.name,
                    agent = %rule.agent,
                    source = %envelope.source,
                    "Envelope matched routing rule"
                );
                return RouteDecision {
                    agent_name: rule.agent.clone(),
                    rule: Some(rule.name.clone()),
                };
            }
        }

        debug!(source = %envelope.source, "No routing rule matched, using default agent");
        RouteDecision {
            agent_name: self.default_agent.clone(),
            rule: None,
        }
    }

    /// Rules that name agents missing from the registry.
    ///
    /// Not fatal: such envelopes fall back to the default agent at run time.
    pub fn check_agents(&self, registry: &AgentRegistry) -> Vec<RoutingError> {
        self.rules
            .iter()
            .filter(|r| !registry.contains(&r.agent))
            .map(|r| RoutingError::UnknownAgent {
                rule: r.name.clone(),
                agent: r.agent.clone(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn builtin_router() -> Router {
        Router::new(RoutingTable::builtin(), "default_agent").unwrap()
    }

    #[test]
    fn routes_pricing_email_to_sales() {
        let router = builtin_router();
        let env = Envelope::new(
            "email",
            json!({"text": "Interested in pricing for enterprise plan"}),
        );
        let decision = router.select(&env);
        assert_eq!(decision.agent_name, "sales_agent");
        assert_eq!(decision.rule.as_deref(), Some("sales_keywords"));
    }

    #[test]
    fn unmatched_envelope_uses_default() {
        let router = builtin_router();
        let env = Envelope::new("webhook", json!({"message": "How to reset my password"}));
        let decision = router.select(&env);
        assert_eq!(decision.agent_name, "default_agent");
        assert!(decision.rule.is_none());
    }

    #[test]
    fn keyword_match_is_case_insensitive_by_default() {
        let router = builtin_router();
        let env = Envelope::new("api", json!({"email": {"subject": "Request a DEMO"}}));
        assert_eq!(router.select(&env).agent_name, "sales_agent");
    }

    #[test]
    fn selection_is_deterministic() {
        let router = builtin_router();
        let env = Envelope::new("email", json!({"a": "nothing", "b": {"c": "quote please"}}));
        let first = router.select(&env);
        for _ in 0..50 {
            assert_eq!(router.select(&env), first);
        }
    }

    #[test]
    fn first_matching_rule_wins() {
        let table = RoutingTable::from_json(
            r#"{"rules": [
                {"name": "billing", "agent": "billing_agent", "match": "keywords", "keywords": ["invoice"]},
                {"name": "sales", "agent": "sales_agent", "match": "keywords", "keywords": ["invoice", "price"]}
            ]}"#,
        )
        .unwrap();
        let router = Router::new(table, "default_agent").unwrap();
        let env = Envelope::new("email", json!({"text": "invoice and price question"}));
        assert_eq!(router.select(&env).agent_name, "billing_agent");
    }

    #[test]
    fn source_filter_restricts_rule() {
        let table = RoutingTable::from_json(
            r#"{"rules": [
                {"name": "hooks", "agent": "hook_agent", "sources": ["webhook"], "match": "regex", "pattern": "^deploy"}
            ]}"#,
        )
        .unwrap();
        let router = Router::new(table, "default_agent").unwrap();
        let hook = Envelope::new("webhook", json!({"event": "deploy finished"}));
        let mail = Envelope::new("email", json!({"event": "deploy finished"}));
        assert_eq!(router.select(&hook).agent_name, "hook_agent");
        assert_eq!(router.select(&mail).agent_name, "default_agent");
    }

    #[test]
    fn field_rule_only_inspects_that_field() {
        let table = RoutingTable::from_json(
            r#"{"rules": [
                {"name": "subject", "agent": "sales_agent", "field": "email.subject", "match": "keywords", "keywords": ["pricing"]}
            ]}"#,
        )
        .unwrap();
        let router = Router::new(table, "default_agent").unwrap();
        let in_body = Envelope::new(
            "email",
            json!({"email": {"subject": "hello", "body": "pricing?"}}),
        );
        let in_subject = Envelope::new("email", json!({"email": {"subject": "Pricing?"}}));
        assert_eq!(router.select(&in_body).agent_name, "default_agent");
        assert_eq!(router.select(&in_subject).agent_name, "sales_agent");
    }

    #[test]
    fn case_sensitive_keywords() {
        let table = RoutingTable::from_json(
            r#"{"rules": [
                {"name": "acme", "agent": "acme_agent", "match": "keywords", "keywords": ["ACME"], "case_sensitive": true}
            ]}"#,
        )
        .unwrap();
        let router = Router::new(table, "default_agent").unwrap();
        assert_eq!(
            router.select(&Envelope::new("api", json!({"t": "acme"}))).agent_name,
            "default_agent"
        );
        assert_eq!(
            router.select(&Envelope::new("api", json!({"t": "ACME"}))).agent_name,
            "acme_agent"
        );
    }

    #[test]
    fn keywords_are_escaped() {
        let table = RoutingTable::from_json(
            r#"{"rules": [{"name": "plus", "agent": "x", "match": "keywords", "keywords": ["c++"]}]}"#,
        )
        .unwrap();
        let router = Router::new(table, "default_agent").unwrap();
        assert_eq!(
            router.select(&Envelope::new("api", json!({"t": "I write c++"}))).agent_name,
            "x"
        );
        assert_eq!(
            router.select(&Envelope::new("api", json!({"t": "I write c"}))).agent_name,
            "default_agent"
        );
    }

    #[test]
    fn invalid_regex_is_rejected() {
        let table = RoutingTable::from_json(
            r#"{"rules": [{"name": "broken", "agent": "x", "match": "regex", "pattern": "(unclosed"}]}"#,
        )
        .unwrap();
        let err = Router::new(table, "default_agent").unwrap_err();
        assert!(matches!(err, RoutingError::InvalidPattern { ref rule, .. } if rule == "broken"));
    }

    #[test]
    fn empty_keyword_rule_is_rejected() {
        let table = RoutingTable::from_json(
            r#"{"rules": [{"name": "blank", "agent": "x", "match": "keywords", "keywords": [" "]}]}"#,
        )
        .unwrap();
        assert!(matches!(
            Router::new(table, "default_agent"),
            Err(RoutingError::EmptyRule { .. })
        ));
    }

    #[test]
    fn empty_table_routes_everything_to_default() {
        let router = Router::new(RoutingTable::default(), "fallback").unwrap();
        let env = Envelope::new("email", json!({"text": "buy now"}));
        assert_eq!(router.select(&env).agent_name, "fallback");
    }

    #[test]
    fn check_agents_reports_unregistered_targets() {
        use std::sync::Arc;

        use crate::agents::{DefaultAgent, SalesAgent};

        let table = RoutingTable::from_json(
            r#"{"rules": [
                {"name": "sales", "agent": "sales_agent", "match": "keywords", "keywords": ["price"]},
                {"name": "billing", "agent": "billing_agent", "match": "keywords", "keywords": ["invoice"]}
            ]}"#,
        )
        .unwrap();
        let router = Router::new(table, "default_agent").unwrap();
        let registry = AgentRegistry::builder()
            .register(Arc::new(DefaultAgent::new()))
            .register(Arc::new(SalesAgent::new()))
            .build()
            .unwrap();

        let problems = router.check_agents(&registry);
        assert_eq!(problems.len(), 1);
        assert!(matches!(
            &problems[0],
            RoutingError::UnknownAgent { rule, agent } if rule == "billing" && agent == "billing_agent"
        ));
    }

    #[test]
    fn routing_table_loads_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("rules.json");
        std::fs::write(&path, serde_json::to_string(&RoutingTable::builtin()).unwrap()).unwrap();
        let table = RoutingTable::from_file(&path).unwrap();
        assert_eq!(table, RoutingTable::builtin());
    }
}
