//! In-process events emitted by the registry and the dispatcher.

use crate::agent::{Agent, AgentStatus};
use crate::ids::{AgentId, HostId, JobId};
use crate::selector::Selector;
use serde::{Deserialize, Serialize};

/// Changes to the agent set. Every variant carries what persistence needs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AgentEvent {
    Created(Agent),
    Updated(Agent),
    Deleted(Agent),
    StatusChanged {
        agent: Agent,
        from: AgentStatus,
    },
    ReclaimRequested {
        agent_id: AgentId,
        host_id: HostId,
        action: ReclaimAction,
    },
}

impl AgentEvent {
    /// Snapshot to persist, if the event changes stored state.
    pub fn snapshot(&self) -> Option<&Agent> {
        match self {
            AgentEvent::Created(agent)
            | AgentEvent::Updated(agent)
            | AgentEvent::StatusChanged { agent, .. } => Some(agent),
            AgentEvent::Deleted(_) | AgentEvent::ReclaimRequested { .. } => None,
        }
    }

    pub fn agent_id(&self) -> AgentId {
        match self {
            AgentEvent::Created(agent)
            | AgentEvent::Updated(agent)
            | AgentEvent::Deleted(agent)
            | AgentEvent::StatusChanged { agent, .. } => agent.id,
            AgentEvent::ReclaimRequested { agent_id, .. } => *agent_id,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReclaimAction {
    /// Idle past the host's limit: stop the container, keep the agent.
    Stop,
    /// Offline past the host's limit: remove the container and the agent.
    Remove,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DispatchEvent {
    NoIdleAgent { job_id: JobId, selector: Selector },
}
