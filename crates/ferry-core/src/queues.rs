//! Queue naming and declaration parameters.

use crate::ids::{AgentId, FlowId};
use std::time::Duration;

/// Queue the agent receives [`crate::cmd::CmdIn`] on.
pub fn agent_queue(agent_id: AgentId) -> String {
    format!("queue.agent.{}", agent_id)
}

/// Queue holding job ids waiting to run for a flow.
pub fn flow_job_queue(flow_id: FlowId) -> String {
    format!("flow.q.{}.job", flow_id)
}

/// Where expired or rejected messages are rerouted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeadLetter {
    pub exchange: String,
    pub routing_key: String,
}

impl DeadLetter {
    pub fn new(exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
        }
    }

    /// Queue name dead-lettered messages land on.
    pub fn address(&self) -> String {
        format!("{}.{}", self.exchange, self.routing_key)
    }
}

/// Declaration of a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub max_priority: Option<u8>,
    pub dead_letter: Option<DeadLetter>,
}

impl QueueSpec {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            max_priority: None,
            dead_letter: None,
        }
    }

    pub fn transient(mut self) -> Self {
        self.durable = false;
        self
    }

    pub fn with_max_priority(mut self, max: u8) -> Self {
        self.max_priority = Some(max);
        self
    }

    pub fn with_dead_letter(mut self, dead_letter: DeadLetter) -> Self {
        self.dead_letter = Some(dead_letter);
        self
    }
}

/// Per-message publish options.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOptions {
    pub priority: Option<u8>,
    pub ttl: Option<Duration>,
}

impl PublishOptions {
    pub fn priority(priority: u8) -> Self {
        Self {
            priority: Some(priority),
            ttl: None,
        }
    }

    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }
}
