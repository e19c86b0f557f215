//! Static agent catalog, loaded from a TOML file and consumed by ID. The
//! agent roster itself is out of scope (spec §1); this is the thinnest
//! concrete `AgentRoster` that lets `devorch serve` actually run.

use async_trait::async_trait;
use devorch_core::ports::{AgentDescriptor, AgentRoster};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;

#[derive(Debug, Deserialize)]
struct RosterFile {
    #[serde(default)]
    agent: Vec<AgentDescriptor>,
}

pub struct StaticAgentRoster {
    agents: HashMap<String, AgentDescriptor>,
}

impl StaticAgentRoster {
    pub fn empty() -> Self {
        Self { agents: HashMap::new() }
    }

    pub fn load(path: &Path) -> anyhow::Result<Self> {
        if !path.exists() {
            return Ok(Self::empty());
        }
        let raw = std::fs::read_to_string(path)?;
        let parsed: RosterFile = toml::from_str(&raw)?;
        Ok(Self { agents: parsed.agent.into_iter().map(|a| (a.id.clone(), a)).collect() })
    }
}

#[async_trait]
impl AgentRoster for StaticAgentRoster {
    async fn resolve(&self, agent_id: &str) -> anyhow::Result<Option<AgentDescriptor>> {
        Ok(self.agents.get(agent_id).cloned())
    }
}
