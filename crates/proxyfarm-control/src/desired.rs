//! Desired state consumed by the controller
//!
//! Which agents exist, which of their uplinks should be running, and which
//! public entry ports relay to them. The controller never writes desired
//! state; it only reads it through [`DesiredStateSource`].

use async_trait::async_trait;
use proxyfarm_proto::RelayBinding;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::RwLock;
use thiserror::Error;

#[derive(Error, Debug, Clone)]
pub enum DesiredStateError {
    #[error("Desired state backend error: {0}")]
    Backend(String),
}

/// Agent the controller should keep a session with
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownAgent {
    pub agent_id: String,
    pub host: String,
    pub port: u16,
    pub shared_key: String,
}

impl KnownAgent {
    pub fn addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }
}

/// Uplink that should be started on its agent
#[derive(Debug, Clone, PartialEq)]
pub struct UplinkAssignment {
    pub uplink_id: String,
    pub parameters: Option<Value>,
}

#[async_trait]
pub trait DesiredStateSource: Send + Sync {
    /// Entry port bindings the relay should serve
    async fn list_active_bindings(&self) -> Result<Vec<RelayBinding>, DesiredStateError>;

    /// Agents the controller should dial
    async fn list_known_agents(&self) -> Result<Vec<KnownAgent>, DesiredStateError>;

    /// Uplinks to START on `agent_id` each time its session becomes active
    async fn list_active_uplinks(
        &self,
        agent_id: &str,
    ) -> Result<Vec<UplinkAssignment>, DesiredStateError>;
}

/// Uplink entry in a static agent definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UplinkSpec {
    pub id: String,
    /// Public port on the relay host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entry_port: Option<u16>,
    /// Defaults to the agent host
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_host: Option<String>,
    /// Proxy port on the agent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_port: Option<u16>,
    #[serde(default = "default_active")]
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
}

fn default_active() -> bool {
    true
}

/// Agent plus its uplinks, as written in the controller config
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSpec {
    #[serde(flatten)]
    pub agent: KnownAgent,
    #[serde(default)]
    pub uplinks: Vec<UplinkSpec>,
}

impl AgentSpec {
    fn bindings(&self) -> impl Iterator<Item = RelayBinding> + '_ {
        self.uplinks
            .iter()
            .filter(|u| u.active)
            .filter_map(move |u| match (u.entry_port, u.target_port) {
                (Some(entry_port), Some(target_port)) => Some(RelayBinding::new(
                    entry_port,
                    u.target_host
                        .clone()
                        .unwrap_or_else(|| self.agent.host.clone()),
                    target_port,
                )),
                _ => None,
            })
    }
}

/// In-memory desired state, typically loaded from the controller config
pub struct StaticDesiredState {
    agents: RwLock<Vec<AgentSpec>>,
}

impl StaticDesiredState {
    pub fn new(agents: Vec<AgentSpec>) -> Self {
        Self {
            agents: RwLock::new(agents),
        }
    }

    /// Swap in a new definition (config reload)
    pub fn replace(&self, agents: Vec<AgentSpec>) {
        if let Ok(mut guard) = self.agents.write() {
            *guard = agents;
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Vec<AgentSpec>>, DesiredStateError> {
        self.agents
            .read()
            .map_err(|_| DesiredStateError::Backend("desired state lock poisoned".to_string()))
    }
}

#[async_trait]
impl DesiredStateSource for StaticDesiredState {
    async fn list_active_bindings(&self) -> Result<Vec<RelayBinding>, DesiredStateError> {
        Ok(self.read()?.iter().flat_map(|a| a.bindings()).collect())
    }

    async fn list_known_agents(&self) -> Result<Vec<KnownAgent>, DesiredStateError> {
        Ok(self.read()?.iter().map(|a| a.agent.clone()).collect())
    }

    async fn list_active_uplinks(
        &self,
        agent_id: &str,
    ) -> Result<Vec<UplinkAssignment>, DesiredStateError> {
        Ok(self
            .read()?
            .iter()
            .filter(|a| a.agent.agent_id == agent_id)
            .flat_map(|a| a.uplinks.iter())
            .filter(|u| u.active)
            .map(|u| UplinkAssignment {
                uplink_id: u.id.clone(),
                parameters: u.parameters.clone(),
            })
            .collect())
    }
}
