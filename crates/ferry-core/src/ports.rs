//! Port traits (hexagonal architecture).
//!
//! These traits define the interfaces between the scheduling core and the
//! message broker, the coordination service, storage and agent hosts.

use crate::agent::{Agent, AgentHost};
use crate::ids::{AgentId, FlowId, JobId};
use crate::queues::{PublishOptions, QueueSpec};
use crate::Result;
use async_trait::async_trait;
use std::sync::Arc;

/// A message handed to a [`MessageHandler`].
#[derive(Debug, Clone)]
pub struct Delivery {
    pub queue: String,
    pub body: Vec<u8>,
    pub priority: Option<u8>,
    /// Whether the broker delivered this message before.
    pub redelivered: bool,
}

/// Consumer callback. The return value decides acknowledgment: `true` acks,
/// `false` leaves the message for redelivery.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, delivery: Delivery) -> bool;
}

/// Identifies a registered consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConsumerHandle {
    pub queue: String,
    pub tag: String,
}

/// Queue operations over a broker connection.
///
/// Publishing and maintenance calls report failure as `false` so that callers
/// run their own rollback; only declaration and consumer registration error.
#[async_trait]
pub trait MessageBroker: Send + Sync {
    /// Declare a queue. Declaring an existing queue is a no-op.
    async fn declare(&self, spec: &QueueSpec) -> Result<()>;

    async fn publish(&self, queue: &str, body: &[u8], options: PublishOptions) -> bool;

    /// Register a handler run on a worker pool bounded by the prefetch count.
    async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle>;

    /// Stop new deliveries and wait for in-flight handlers.
    async fn cancel(&self, handle: &ConsumerHandle) -> bool;

    async fn delete(&self, queue: &str) -> bool;

    async fn purge(&self, queue: &str) -> bool;

    /// Cancel every consumer, then close the connection.
    async fn close(&self);
}

/// Session-scoped coordination service.
///
/// Nodes created through [`Coordinator::create_ephemeral`] live only as long
/// as the session that created them.
#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Atomically create an ephemeral node. `Ok(false)` when it already exists.
    async fn create_ephemeral(&self, path: &str) -> Result<bool>;

    /// Delete a node owned by this session. `Ok(false)` when absent or foreign.
    async fn delete_owned(&self, path: &str) -> Result<bool>;

    async fn exists(&self, path: &str) -> Result<bool>;

    /// Names of the direct children under `root`.
    async fn children(&self, root: &str) -> Result<Vec<String>>;

    fn session_id(&self) -> String;

    /// End the session, releasing every node it owns.
    async fn close(&self);
}

/// Persistence of agent records.
#[async_trait]
pub trait AgentStore: Send + Sync {
    async fn save(&self, agent: &Agent) -> Result<()>;

    async fn delete(&self, id: AgentId) -> Result<()>;

    async fn load_all(&self) -> Result<Vec<Agent>>;
}

/// Backend that runs agent containers on a host.
#[async_trait]
pub trait HostProvisioner: Send + Sync {
    /// Start or resume the agent's container.
    async fn start(&self, host: &AgentHost, agent: &Agent) -> Result<()>;

    async fn stop(&self, host: &AgentHost, agent: &Agent) -> Result<()>;

    async fn remove(&self, host: &AgentHost, agent: &Agent) -> Result<()>;
}

/// Receives jobs taken off a flow's job queue.
#[async_trait]
pub trait JobLauncher: Send + Sync {
    async fn on_job(&self, flow_id: FlowId, job_id: JobId) -> Result<()>;

    /// The job expired or was rejected before it could start.
    async fn on_expired(&self, flow_id: FlowId, job_id: JobId) -> Result<()>;
}
