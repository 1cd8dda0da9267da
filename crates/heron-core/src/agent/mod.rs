//! Agent registry -- the named personas subtasks are assigned to.
//!
//! The registry is an explicit value handed to the dispatcher, not a
//! process-wide singleton.

use serde::{Deserialize, Serialize};
use tracing::warn;

/// A named agent persona.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentProfile {
    pub key: String,
    /// System prompt sent with every call made on behalf of this agent.
    pub system_prompt: String,
    #[serde(default)]
    pub description: String,
}

impl AgentProfile {
    pub fn new(key: impl Into<String>, system_prompt: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            system_prompt: system_prompt.into(),
            description: String::new(),
        }
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    pub fn summary(&self) -> AgentSummary {
        AgentSummary {
            key: self.key.clone(),
            description: self.description.clone(),
        }
    }
}

/// What the planner is told about an agent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentSummary {
    pub key: String,
    pub description: String,
}

/// Ordered collection of [`AgentProfile`]s, keyed by `key`.
#[derive(Default, Clone)]
pub struct AgentRegistry {
    agents: Vec<AgentProfile>,
}

impl AgentRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an agent, replacing (in place) any agent with the same key.
    pub fn register(&mut self, profile: AgentProfile) -> Option<AgentProfile> {
        match self.agents.iter_mut().find(|a| a.key == profile.key) {
            Some(existing) => Some(std::mem::replace(existing, profile)),
            None => {
                self.agents.push(profile);
                None
            }
        }
    }

    pub fn get(&self, key: &str) -> Option<&AgentProfile> {
        self.agents.iter().find(|a| a.key == key)
    }

    /// Agents in registration order.
    pub fn list(&self) -> &[AgentProfile] {
        &self.agents
    }

    pub fn keys(&self) -> Vec<&str> {
        self.agents.iter().map(|a| a.key.as_str()).collect()
    }

    pub fn summaries(&self) -> Vec<AgentSummary> {
        self.agents.iter().map(AgentProfile::summary).collect()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }

    /// Pick the agent for a subtask: `requested`, else `default`, else the
    /// first registered agent. Any fallback is logged.
    pub fn resolve(&self, requested: &str, default: Option<&str>) -> Option<&AgentProfile> {
        if let Some(agent) = self.get(requested) {
            return Some(agent);
        }

        if let Some(agent) = default.and_then(|key| self.get(key)) {
            warn!(
                requested,
                using = %agent.key,
                "agent not registered, falling back to default agent"
            );
            return Some(agent);
        }

        let first = self.agents.first()?;
        warn!(
            requested,
            using = %first.key,
            "agent not registered and no usable default, falling back to first agent"
        );
        Some(first)
    }
}

impl std::fmt::Debug for AgentRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentRegistry")
            .field("agents", &self.keys())
            .finish()
    }
}
