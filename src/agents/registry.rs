//! Agent registry: name to handler map, frozen after startup.

use std::collections::HashMap;
use std::sync::Arc;

use crate::agents::Agent;
use crate::error::RegistryError;

/// Registry of available agents plus the default fallback.
///
/// Immutable once built, so it can be shared behind an `Arc` and read
/// concurrently without locking.
pub struct AgentRegistry {
    agents: HashMap<String, Arc<dyn Agent>>,
    default_agent: String,
}

impl AgentRegistry {
    pub fn builder() -> AgentRegistryBuilder {
        AgentRegistryBuilder::default()
    }

    /// Get an agent by name.
    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Agent>, RegistryError> {
        self.agents
            .get(name)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound {
                name: name.to_string(),
            })
    }

    /// The fallback agent. Always present.
    pub fn default_agent(&self) -> Arc<dyn Agent> {
        Arc::clone(&self.agents[&self.default_agent])
    }

    pub fn default_agent_name(&self) -> &str {
        &self.default_agent
    }

    /// Check if an agent exists.
    pub fn contains(&self, name: &str) -> bool {
        self.agents.contains_key(name)
    }

    /// All agent names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.agents.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.names())
            .field("default_agent", &self.default_agent)
            .finish()
    }
}

/// Collects agents before the registry is frozen.
#[derive(Default)]
pub struct AgentRegistryBuilder {
    agents: Vec<Arc<dyn Agent>>,
    default_agent: Option<String>,
}

impl AgentRegistryBuilder {
    /// Add an agent under its own name.
    pub fn register(mut self, agent: Arc<dyn Agent>) -> Self {
        self.agents.push(agent);
        self
    }

    /// Name of the fallback agent. Defaults to `default_agent`.
    pub fn default_agent(mut self, name: impl Into<String>) -> Self {
        self.default_agent = Some(name.into());
        self
    }

    /// Freeze the registry. Fails on duplicate names or a missing default.
    pub fn build(self) -> Result<AgentRegistry, RegistryError> {
        let mut agents: HashMap<String, Arc<dyn Agent>> = HashMap::with_capacity(self.agents.len());
        for agent in self.agents {
            let name = agent.name().to_string();
            if agents.contains_key(&name) {
                return Err(RegistryError::Duplicate { name });
            }
            tracing::debug!(agent = %name, "Registered agent");
            agents.insert(name, agent);
        }

        let default_agent = self
            .default_agent
            .unwrap_or_else(|| "default_agent".to_string());
        if !agents.contains_key(&default_agent) {
            return Err(RegistryError::MissingDefault {
                name: default_agent,
            });
        }

        Ok(AgentRegistry {
            agents,
            default_agent,
        })
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use serde_json::json;

    use super::*;
    use crate::agents::{AgentInput, AgentResult};
    use crate::error::AgentError;

    struct Named(&'static str);

    #[async_trait]
    impl Agent for Named {
        fn name(&self) -> &str {
            self.0
        }

        async fn process(&self, _input: &AgentInput) -> Result<AgentResult, AgentError> {
            Ok(AgentResult::success(self.0, json!({"ok": true})))
        }
    }

    fn registry() -> AgentRegistry {
        AgentRegistry::builder()
            .register(Arc::new(Named("default_agent")))
            .register(Arc::new(Named("sales_agent")))
            .build()
            .unwrap()
    }

    #[test]
    fn resolves_registered_agents() {
        let reg = registry();
        assert_eq!(reg.resolve("sales_agent").unwrap().name(), "sales_agent");
        assert_eq!(reg.default_agent().name(), "default_agent");
        assert_eq!(reg.names(), vec!["default_agent", "sales_agent"]);
        assert_eq!(reg.len(), 2);
    }

    #[test]
    fn unknown_name_is_not_found() {
        let reg = registry();
        assert!(matches!(
            reg.resolve("hr_agent"),
            Err(RegistryError::NotFound { ref name }) if name == "hr_agent"
        ));
        assert!(!reg.contains("hr_agent"));
    }

    #[test]
    fn missing_default_is_rejected() {
        let err = AgentRegistry::builder()
            .register(Arc::new(Named("sales_agent")))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::MissingDefault { .. }));
    }

    #[test]
    fn custom_default_name() {
        let reg = AgentRegistry::builder()
            .register(Arc::new(Named("fallback")))
            .default_agent("fallback")
            .build()
            .unwrap();
        assert_eq!(reg.default_agent_name(), "fallback");
    }

    #[test]
    fn duplicate_names_are_rejected() {
        let err = AgentRegistry::builder()
            .register(Arc::new(Named("default_agent")))
            .register(Arc::new(Named("default_agent")))
            .build()
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate { .. }));
    }

    #[tokio::test]
    async fn concurrent_reads_share_registry() {
        let reg = Arc::new(registry());
        let mut handles = Vec::new();
        for _ in 0..16 {
            let reg = Arc::clone(&reg);
            handles.push(tokio::spawn(async move {
                reg.resolve("sales_agent").map(|a| a.name().to_string())
            }));
        }
        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), "sales_agent");
        }
    }
}
