//! Agent hosts: scaling up on demand and reclaiming idle or dead agents.

use ferry_core::agent::{Agent, AgentHost, AgentStatus};
use ferry_core::events::{AgentEvent, DispatchEvent, ReclaimAction};
use ferry_core::ids::{AgentId, HostId};
use ferry_core::ports::HostProvisioner;
use ferry_core::selector::Selector;
use ferry_core::{Error, Result};
use std::sync::Arc;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::registry::AgentRegistry;

pub struct HostManager {
    registry: Arc<AgentRegistry>,
    provisioner: Arc<dyn HostProvisioner>,
}

impl HostManager {
    pub fn new(registry: Arc<AgentRegistry>, provisioner: Arc<dyn HostProvisioner>) -> Self {
        Self {
            registry,
            provisioner,
        }
    }

    /// Start an agent for `selector` on the first matching host with room.
    /// Stopped agents are resumed before new ones are created.
    pub async fn on_no_idle_agent(&self, selector: &Selector) -> Result<Option<Agent>> {
        for host in self.registry.hosts().await {
            if !host.matches(selector) {
                continue;
            }

            let agents = self.registry.host_agents(host.id).await;
            if let Some(stopped) = agents.iter().find(|a| a.is_offline()) {
                return self.start(&host, stopped.clone()).await.map(Some);
            }

            if agents.len() >= host.max_size as usize {
                debug!(host_id = %host.id, "Host full");
                continue;
            }

            let name = format!("{}-{}", host.name, &Uuid::new_v4().simple().to_string()[..8]);
            match self
                .registry
                .create(name, host.tags.clone(), Some(host.id))
                .await
            {
                Ok(agent) => return self.start(&host, agent).await.map(Some),
                Err(Error::HostFull { .. }) => continue,
                Err(e) => return Err(e),
            }
        }

        debug!(selector = %selector, "No host can start an agent");
        Ok(None)
    }

    async fn start(&self, host: &AgentHost, agent: Agent) -> Result<Agent> {
        self.provisioner.start(host, &agent).await?;
        let agent = self
            .registry
            .set_status(agent.id, AgentStatus::Starting, None)
            .await?;
        info!(agent_id = %agent.id, host_id = %host.id, "Agent starting on host");
        Ok(agent)
    }

    pub async fn on_reclaim(
        &self,
        agent_id: AgentId,
        host_id: HostId,
        action: ReclaimAction,
    ) -> Result<()> {
        let host = self.registry.host(host_id).await?;
        let agent = self.registry.get(agent_id).await?;

        match action {
            ReclaimAction::Stop => {
                if !agent.is_idle() {
                    debug!(agent_id = %agent_id, "Agent no longer idle, not stopping");
                    return Ok(());
                }
                self.provisioner.stop(&host, &agent).await?;
                self.registry
                    .set_status(agent_id, AgentStatus::Offline, None)
                    .await?;
                info!(agent_id = %agent_id, host_id = %host_id, "Idle agent stopped");
            }
            ReclaimAction::Remove => {
                if !agent.is_offline() {
                    debug!(agent_id = %agent_id, "Agent came back, not removing");
                    return Ok(());
                }
                self.provisioner.remove(&host, &agent).await?;
                self.registry.delete(agent_id).await?;
                info!(agent_id = %agent_id, host_id = %host_id, "Offline agent removed");
            }
        }
        Ok(())
    }

    /// React to dispatch and registry events until `shutdown` flips.
    pub fn spawn(
        self: Arc<Self>,
        mut dispatch_events: broadcast::Receiver<DispatchEvent>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let mut agent_events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    event = dispatch_events.recv() => match event {
                        Ok(DispatchEvent::NoIdleAgent { job_id, selector }) => {
                            if let Err(e) = self.on_no_idle_agent(&selector).await {
                                warn!(job_id = %job_id, "Failed to start agent: {}", e);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Host manager lagged behind dispatch events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    event = agent_events.recv() => match event {
                        Ok(AgentEvent::ReclaimRequested { agent_id, host_id, action }) => {
                            if let Err(e) = self.on_reclaim(agent_id, host_id, action).await {
                                warn!(agent_id = %agent_id, "Failed to reclaim agent: {}", e);
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(missed)) => {
                            warn!(missed, "Host manager lagged behind agent events");
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.changed() => break,
                }
            }
            debug!("Host manager stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBroker;
    use crate::testing::settings_template;
    use async_trait::async_trait;
    use chrono::{Duration, Utc};
    use ferry_core::agent::HostKind;
    use std::collections::BTreeSet;
    use tokio::sync::Mutex;

    #[derive(Default)]
    struct RecordingProvisioner {
        calls: Mutex<Vec<(&'static str, AgentId)>>,
    }

    #[async_trait]
    impl HostProvisioner for RecordingProvisioner {
        async fn start(&self, _host: &AgentHost, agent: &Agent) -> Result<()> {
            self.calls.lock().await.push(("start", agent.id));
            Ok(())
        }

        async fn stop(&self, _host: &AgentHost, agent: &Agent) -> Result<()> {
            self.calls.lock().await.push(("stop", agent.id));
            Ok(())
        }

        async fn remove(&self, _host: &AgentHost, agent: &Agent) -> Result<()> {
            self.calls.lock().await.push(("remove", agent.id));
            Ok(())
        }
    }

    async fn setup(max_size: u32) -> (Arc<AgentRegistry>, Arc<RecordingProvisioner>, HostManager, AgentHost) {
        let registry = Arc::new(AgentRegistry::new(
            Arc::new(MemoryBroker::default()),
            settings_template(),
        ));
        let provisioner = Arc::new(RecordingProvisioner::default());
        let manager = HostManager::new(registry.clone(), provisioner.clone());

        let mut host = AgentHost::new(
            "builder",
            HostKind::Ssh {
                ip: "10.0.0.5".to_string(),
                port: 22,
                user: "ci".to_string(),
            },
        );
        host.tags = ["linux".to_string()].into_iter().collect();
        host.max_size = max_size;
        host.max_idle_seconds = 60;
        let host = registry.add_host(host).await.unwrap();

        (registry, provisioner, manager, host)
    }

    #[tokio::test]
    async fn test_scale_up_until_full() {
        let (registry, provisioner, manager, host) = setup(1).await;
        let selector = Selector::new(["linux"]);

        let agent = manager.on_no_idle_agent(&selector).await.unwrap().unwrap();
        assert_eq!(agent.status, AgentStatus::Starting);
        assert_eq!(agent.host_id, Some(host.id));
        assert!(agent.name.starts_with("builder-"));

        // Host is full and its only agent is starting.
        assert!(manager.on_no_idle_agent(&selector).await.unwrap().is_none());
        assert!(
            manager
                .on_no_idle_agent(&Selector::new(["windows"]))
                .await
                .unwrap()
                .is_none()
        );

        assert_eq!(*provisioner.calls.lock().await, vec![("start", agent.id)]);
        assert_eq!(registry.host_agents(host.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_resume_offline_before_create() {
        let (registry, provisioner, manager, host) = setup(5).await;
        let stopped = registry
            .create("builder-old", BTreeSet::new(), Some(host.id))
            .await
            .unwrap();

        let started = manager
            .on_no_idle_agent(&Selector::default())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(started.id, stopped.id);
        assert_eq!(*provisioner.calls.lock().await, vec![("start", stopped.id)]);
        assert_eq!(registry.host_agents(host.id).await.len(), 1);
    }

    #[tokio::test]
    async fn test_reclaim_idle_then_offline() {
        let (registry, provisioner, manager, host) = setup(5).await;
        let agent = registry
            .create("builder-1", BTreeSet::new(), Some(host.id))
            .await
            .unwrap();
        registry.set_status(agent.id, AgentStatus::Starting, None).await.unwrap();
        registry.set_status(agent.id, AgentStatus::Idle, None).await.unwrap();

        let later = Utc::now() + Duration::seconds(61);
        assert_eq!(registry.reclaim_stale(later).await.stop, vec![agent.id]);
        manager
            .on_reclaim(agent.id, host.id, ReclaimAction::Stop)
            .await
            .unwrap();
        assert_eq!(
            registry.get(agent.id).await.unwrap().status,
            AgentStatus::Offline
        );

        manager
            .on_reclaim(agent.id, host.id, ReclaimAction::Remove)
            .await
            .unwrap();
        assert!(registry.get(agent.id).await.is_err());
        assert_eq!(
            *provisioner.calls.lock().await,
            vec![("stop", agent.id), ("remove", agent.id)]
        );
    }

    #[tokio::test]
    async fn test_busy_agent_not_stopped() {
        let (registry, provisioner, manager, host) = setup(5).await;
        let agent = registry
            .create("builder-1", BTreeSet::new(), Some(host.id))
            .await
            .unwrap();
        registry.set_status(agent.id, AgentStatus::Starting, None).await.unwrap();
        registry.set_status(agent.id, AgentStatus::Idle, None).await.unwrap();
        registry
            .set_status(agent.id, AgentStatus::Busy, Some(ferry_core::ids::JobId::new()))
            .await
            .unwrap();

        manager
            .on_reclaim(agent.id, host.id, ReclaimAction::Stop)
            .await
            .unwrap();
        assert!(provisioner.calls.lock().await.is_empty());
        assert_eq!(registry.get(agent.id).await.unwrap().status, AgentStatus::Busy);
    }
}
