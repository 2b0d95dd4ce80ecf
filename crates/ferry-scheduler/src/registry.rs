//! Process-local agent registry.
//!
//! The registry is the only place agent records change. Every change is
//! published as an [`AgentEvent`] for persistence, the dispatcher and the
//! host manager. It is never authoritative for cross-process ownership:
//! that is what [`DistributedLock`] is for.

use chrono::{DateTime, Utc};
use ferry_core::agent::{Agent, AgentHost, AgentInit, AgentStatus};
use ferry_core::events::{AgentEvent, ReclaimAction};
use ferry_core::ids::{AgentId, HostId, JobId};
use ferry_core::ports::{AgentStore, MessageBroker};
use ferry_core::queues::QueueSpec;
use ferry_core::selector::Selector;
use ferry_core::settings::Settings;
use ferry_core::{Error, Result};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{RwLock, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::lock::DistributedLock;

const EVENT_CAPACITY: usize = 1024;

/// Outcome of one [`AgentRegistry::reclaim_stale`] pass.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReclaimReport {
    /// STARTING agents past the grace window, now OFFLINE.
    pub reset: Vec<AgentId>,
    /// Idle too long; hosts were asked to stop them.
    pub stop: Vec<AgentId>,
    /// Offline too long; hosts were asked to remove them.
    pub remove: Vec<AgentId>,
}

impl ReclaimReport {
    pub fn is_empty(&self) -> bool {
        self.reset.is_empty() && self.stop.is_empty() && self.remove.is_empty()
    }
}

pub struct AgentRegistry {
    agents: RwLock<HashMap<AgentId, Agent>>,
    hosts: RwLock<HashMap<HostId, AgentHost>>,
    events: broadcast::Sender<AgentEvent>,
    broker: Arc<dyn MessageBroker>,
    settings: Settings,
    starting_grace_secs: u64,
}

impl AgentRegistry {
    /// `settings` is the template handed to connecting agents; its token is
    /// replaced by the agent's own.
    pub fn new(broker: Arc<dyn MessageBroker>, settings: Settings) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            agents: RwLock::new(HashMap::new()),
            hosts: RwLock::new(HashMap::new()),
            events,
            broker,
            settings,
            starting_grace_secs: 60,
        }
    }

    pub fn with_starting_grace(mut self, seconds: u64) -> Self {
        self.starting_grace_secs = seconds;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<AgentEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: AgentEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    pub async fn create(
        &self,
        name: impl Into<String>,
        tags: BTreeSet<String>,
        host_id: Option<HostId>,
    ) -> Result<Agent> {
        let name = name.into();
        let mut agent = Agent::new(name.clone(), Uuid::new_v4().simple().to_string(), tags);
        agent.host_id = host_id;

        {
            let hosts = self.hosts.read().await;
            let mut agents = self.agents.write().await;

            if agents.values().any(|a| a.name == name) {
                return Err(Error::Duplicate(format!("agent name {}", name)));
            }

            if let Some(host_id) = host_id {
                let host = hosts
                    .get(&host_id)
                    .ok_or_else(|| Error::HostNotFound(host_id.to_string()))?;
                let size = agents
                    .values()
                    .filter(|a| a.host_id == Some(host_id))
                    .count();
                if size >= host.max_size as usize {
                    return Err(Error::HostFull {
                        host: host.name.clone(),
                        max_size: host.max_size,
                    });
                }
            }

            agents.insert(agent.id, agent.clone());
        }

        let queue = QueueSpec::new(agent.queue_name());
        if let Err(e) = self.broker.declare(&queue).await {
            self.agents.write().await.remove(&agent.id);
            return Err(e);
        }

        info!(agent_id = %agent.id, name = %agent.name, "Agent created");
        self.emit(AgentEvent::Created(agent.clone()));
        Ok(agent)
    }

    pub async fn delete(&self, id: AgentId) -> Result<Agent> {
        let agent = self
            .agents
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;

        if !self.broker.delete(&agent.queue_name()).await {
            warn!(agent_id = %id, "Failed to delete agent queue");
        }

        info!(agent_id = %id, name = %agent.name, "Agent deleted");
        self.emit(AgentEvent::Deleted(agent.clone()));
        Ok(agent)
    }

    pub async fn set_tags(&self, id: AgentId, tags: BTreeSet<String>) -> Result<Agent> {
        let agent = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;
            agent.tags = tags;
            agent.clone()
        };

        self.emit(AgentEvent::Updated(agent.clone()));
        Ok(agent)
    }

    pub async fn get(&self, id: AgentId) -> Result<Agent> {
        self.agents
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(id.to_string()))
    }

    pub async fn get_by_token(&self, token: &str) -> Result<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.token == token)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(format!("token {}", token)))
    }

    pub async fn get_by_name(&self, name: &str) -> Result<Agent> {
        self.agents
            .read()
            .await
            .values()
            .find(|a| a.name == name)
            .cloned()
            .ok_or_else(|| Error::AgentNotFound(name.to_string()))
    }

    /// All agents by name.
    pub async fn list(&self) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Agents matching `selector` in `status`, longest in that status first.
    pub async fn find(&self, selector: &Selector, status: AgentStatus) -> Vec<Agent> {
        let mut found: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.status == status && a.matches(selector))
            .cloned()
            .collect();
        found.sort_by(|a, b| {
            a.status_updated_at
                .cmp(&b.status_updated_at)
                .then_with(|| a.name.cmp(&b.name))
        });
        found
    }

    /// Move an agent to `to`. `job_id` is recorded on the way into BUSY and
    /// cleared on the way out.
    pub async fn set_status(
        &self,
        id: AgentId,
        to: AgentStatus,
        job_id: Option<JobId>,
    ) -> Result<Agent> {
        let (agent, from) = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .get_mut(&id)
                .ok_or_else(|| Error::AgentNotFound(id.to_string()))?;

            let from = agent.status;
            if !from.can_transition_to(to) {
                error!(agent_id = %id, from = from.as_str(), to = to.as_str(), "Invalid agent status transition");
                return Err(Error::InvalidTransition { from, to });
            }

            if to == AgentStatus::Busy {
                let Some(job_id) = job_id else {
                    error!(agent_id = %id, "BUSY requires a job");
                    return Err(Error::InvalidTransition { from, to });
                };
                agent.job_id = Some(job_id);
            } else {
                agent.job_id = None;
            }

            agent.status = to;
            agent.status_updated_at = Utc::now();
            (agent.clone(), from)
        };

        debug!(agent_id = %id, from = from.as_str(), to = to.as_str(), "Agent status changed");
        self.emit(AgentEvent::StatusChanged {
            agent: agent.clone(),
            from,
        });
        Ok(agent)
    }

    /// Record what a connecting agent reports and bring it to IDLE.
    pub async fn connect(&self, token: &str, init: AgentInit) -> Result<Settings> {
        let agent = {
            let mut agents = self.agents.write().await;
            let agent = agents
                .values_mut()
                .find(|a| a.token == token)
                .ok_or_else(|| Error::AgentNotFound(format!("token {}", token)))?;
            agent.url = init.url;
            agent.os = init.os;
            agent.resource = init.resource;
            agent.k8s_cluster = init.k8s_cluster;
            agent.clone()
        };
        self.emit(AgentEvent::Updated(agent.clone()));

        if agent.status == AgentStatus::Offline {
            self.set_status(agent.id, AgentStatus::Starting, None).await?;
        }
        if agent.status != AgentStatus::Idle && agent.status != AgentStatus::Busy {
            self.set_status(agent.id, AgentStatus::Idle, None).await?;
        }

        let mut settings = self.settings.clone();
        settings.token = agent.token.clone();
        settings.validate()?;

        info!(agent_id = %agent.id, name = %agent.name, "Agent connected");
        Ok(settings)
    }

    pub async fn disconnect(&self, token: &str) -> Result<Agent> {
        let agent = self.get_by_token(token).await?;
        let agent = self.set_status(agent.id, AgentStatus::Offline, None).await?;
        info!(agent_id = %agent.id, name = %agent.name, "Agent disconnected");
        Ok(agent)
    }

    pub async fn add_host(&self, host: AgentHost) -> Result<AgentHost> {
        let mut hosts = self.hosts.write().await;
        if hosts.values().any(|h| h.name == host.name) {
            return Err(Error::Duplicate(format!("host name {}", host.name)));
        }
        hosts.insert(host.id, host.clone());
        info!(host_id = %host.id, name = %host.name, "Agent host added");
        Ok(host)
    }

    pub async fn remove_host(&self, id: HostId) -> Result<AgentHost> {
        let host = self
            .hosts
            .write()
            .await
            .remove(&id)
            .ok_or_else(|| Error::HostNotFound(id.to_string()))?;
        info!(host_id = %id, name = %host.name, "Agent host removed");
        Ok(host)
    }

    pub async fn host(&self, id: HostId) -> Result<AgentHost> {
        self.hosts
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::HostNotFound(id.to_string()))
    }

    pub async fn hosts(&self) -> Vec<AgentHost> {
        let mut hosts: Vec<AgentHost> = self.hosts.read().await.values().cloned().collect();
        hosts.sort_by(|a, b| a.name.cmp(&b.name));
        hosts
    }

    pub async fn host_agents(&self, host_id: HostId) -> Vec<Agent> {
        let mut agents: Vec<Agent> = self
            .agents
            .read()
            .await
            .values()
            .filter(|a| a.host_id == Some(host_id))
            .cloned()
            .collect();
        agents.sort_by(|a, b| a.name.cmp(&b.name));
        agents
    }

    /// Reset agents stuck in STARTING and ask hosts to reclaim agents idle
    /// or offline past their limits.
    pub async fn reclaim_stale(&self, now: DateTime<Utc>) -> ReclaimReport {
        let hosts = self.hosts.read().await.clone();
        let agents: Vec<Agent> = self.agents.read().await.values().cloned().collect();
        let mut report = ReclaimReport::default();

        for agent in agents {
            if agent.is_starting_over(self.starting_grace_secs, now) {
                match self.set_status(agent.id, AgentStatus::Offline, None).await {
                    Ok(_) => {
                        warn!(agent_id = %agent.id, "Agent did not connect in time");
                        report.reset.push(agent.id);
                    }
                    Err(e) => debug!(agent_id = %agent.id, "Skipping reset: {}", e),
                }
                continue;
            }

            let Some(host) = agent.host_id.and_then(|id| hosts.get(&id)) else {
                continue;
            };

            let action = match agent.status {
                AgentStatus::Idle if host.is_over_max_idle_seconds(agent.status_updated_at, now) => {
                    report.stop.push(agent.id);
                    ReclaimAction::Stop
                }
                AgentStatus::Offline
                    if host.is_over_max_offline_seconds(agent.status_updated_at, now) =>
                {
                    report.remove.push(agent.id);
                    ReclaimAction::Remove
                }
                _ => continue,
            };

            debug!(agent_id = %agent.id, host_id = %host.id, ?action, "Reclaim requested");
            self.emit(AgentEvent::ReclaimRequested {
                agent_id: agent.id,
                host_id: host.id,
                action,
            });
        }

        report
    }

    /// Load stored agents. BUSY agents whose lock no longer exists lost their
    /// job with the previous process and come back OFFLINE.
    pub async fn load(&self, store: &dyn AgentStore, lock: &DistributedLock) -> Result<usize> {
        let stored = store.load_all().await?;
        let count = stored.len();
        let mut reset = Vec::new();

        for mut agent in stored {
            if agent.status == AgentStatus::Busy && lock.is_locked(agent.id).await != Some(true) {
                warn!(agent_id = %agent.id, "Busy agent has no lock, resetting to offline");
                agent.status = AgentStatus::Offline;
                agent.status_updated_at = Utc::now();
                agent.job_id = None;
                reset.push(agent.clone());
            }
            self.agents.write().await.insert(agent.id, agent);
        }

        for agent in reset {
            self.emit(AgentEvent::Updated(agent));
        }

        info!(count, "Agents loaded");
        Ok(count)
    }
}

/// Write every registry change through to `store` until `shutdown` flips.
pub fn spawn_persistence(
    registry: Arc<AgentRegistry>,
    store: Arc<dyn AgentStore>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let mut events = registry.subscribe();
    tokio::spawn(async move {
        loop {
            let event = tokio::select! {
                event = events.recv() => event,
                _ = shutdown.changed() => break,
            };

            match event {
                Ok(AgentEvent::Deleted(agent)) => {
                    if let Err(e) = store.delete(agent.id).await {
                        warn!(agent_id = %agent.id, "Failed to delete stored agent: {}", e);
                    }
                }
                Ok(event) => {
                    if let Some(agent) = event.snapshot() {
                        if let Err(e) = store.save(agent).await {
                            warn!(agent_id = %agent.id, "Failed to persist agent: {}", e);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Persistence lagged, saving all agents");
                    for agent in registry.list().await {
                        if let Err(e) = store.save(&agent).await {
                            warn!(agent_id = %agent.id, "Failed to persist agent: {}", e);
                        }
                    }
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
        debug!("Agent persistence stopped");
    })
}

/// Run [`AgentRegistry::reclaim_stale`] every `interval`.
pub fn spawn_reclaimer(
    registry: Arc<AgentRegistry>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let report = registry.reclaim_stale(Utc::now()).await;
            if !report.is_empty() {
                info!(
                    reset = report.reset.len(),
                    stop = report.stop.len(),
                    remove = report.remove.len(),
                    "Stale agents reclaimed"
                );
            }
        }
        debug!("Agent reclaimer stopped");
    })
}
