//! Cross-process agent locks on top of ephemeral coordination nodes.
//!
//! Owning the node `{root}/{agentId}-lock` means owning the agent. The node
//! disappears with the session that created it, so a crashed server never
//! leaves an agent locked for good.

use ferry_core::ids::AgentId;
use ferry_core::ports::Coordinator;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

const LOCK_SUFFIX: &str = "-lock";
const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct DistributedLock {
    coordinator: Arc<dyn Coordinator>,
    root: String,
    op_timeout: Duration,
}

impl DistributedLock {
    pub fn new(coordinator: Arc<dyn Coordinator>, root: impl Into<String>) -> Self {
        Self {
            coordinator,
            root: root.into().trim_matches('/').to_string(),
            op_timeout: DEFAULT_OP_TIMEOUT,
        }
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn lock_path(&self, agent_id: AgentId) -> String {
        format!("{}/{}{}", self.root, agent_id, LOCK_SUFFIX)
    }

    /// Recover the agent id from a lock node name or path.
    pub fn agent_id_from_path(path: &str) -> Option<AgentId> {
        let name = path.rsplit('/').next()?;
        name.strip_suffix(LOCK_SUFFIX)?.parse().ok()
    }

    /// Take the agent's lock without waiting. `false` when someone holds it
    /// or the coordination service could not be reached in time.
    pub async fn try_lock(&self, agent_id: AgentId) -> bool {
        let path = self.lock_path(agent_id);
        match tokio::time::timeout(self.op_timeout, self.coordinator.create_ephemeral(&path)).await
        {
            Ok(Ok(true)) => {
                debug!(agent_id = %agent_id, "Agent locked");
                true
            }
            Ok(Ok(false)) => false,
            Ok(Err(e)) => {
                warn!(agent_id = %agent_id, "Failed to lock agent: {}", e);
                false
            }
            Err(_) => {
                warn!(agent_id = %agent_id, "Timed out locking agent");
                false
            }
        }
    }

    /// Drop the lock if this session holds it. Releasing twice is a no-op.
    pub async fn release(&self, agent_id: AgentId) {
        let path = self.lock_path(agent_id);
        match tokio::time::timeout(self.op_timeout, self.coordinator.delete_owned(&path)).await {
            Ok(Ok(true)) => debug!(agent_id = %agent_id, "Agent released"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(agent_id = %agent_id, "Failed to release agent lock: {}", e),
            Err(_) => warn!(agent_id = %agent_id, "Timed out releasing agent lock"),
        }
    }

    /// Whether any session holds the agent's lock. `None` when unknown.
    pub async fn is_locked(&self, agent_id: AgentId) -> Option<bool> {
        let path = self.lock_path(agent_id);
        match tokio::time::timeout(self.op_timeout, self.coordinator.exists(&path)).await {
            Ok(Ok(exists)) => Some(exists),
            Ok(Err(e)) => {
                warn!(agent_id = %agent_id, "Failed to read agent lock: {}", e);
                None
            }
            Err(_) => None,
        }
    }

    /// Agents currently locked by any session.
    pub async fn locked_agents(&self) -> Vec<AgentId> {
        match tokio::time::timeout(self.op_timeout, self.coordinator.children(&self.root)).await {
            Ok(Ok(children)) => children
                .iter()
                .filter_map(|name| Self::agent_id_from_path(name))
                .collect(),
            Ok(Err(e)) => {
                warn!(root = %self.root, "Failed to list agent locks: {}", e);
                Vec::new()
            }
            Err(_) => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryCoordinationService;
    use futures::future::join_all;

    #[test]
    fn test_path_round_trip() {
        let service = MemoryCoordinationService::new();
        let lock = DistributedLock::new(service.session(), "/ferry-agents/");
        let agent = AgentId::new();

        let path = lock.lock_path(agent);
        assert_eq!(path, format!("ferry-agents/{}-lock", agent));
        assert_eq!(DistributedLock::agent_id_from_path(&path), Some(agent));
        assert_eq!(DistributedLock::agent_id_from_path("ferry-agents/other"), None);
    }

    #[tokio::test]
    async fn test_exactly_one_concurrent_lock_wins() {
        let service = MemoryCoordinationService::new();
        let agent = AgentId::new();
        let locks: Vec<DistributedLock> = (0..5)
            .map(|_| DistributedLock::new(service.session(), "ferry-agents"))
            .collect();

        let results = join_all(locks.iter().map(|lock| lock.try_lock(agent))).await;
        assert_eq!(results.iter().filter(|won| **won).count(), 1);

        let winner = results.iter().position(|won| *won).unwrap();
        let other = (winner + 1) % locks.len();

        // A foreign release leaves the lock in place.
        locks[other].release(agent).await;
        assert_eq!(locks[other].is_locked(agent).await, Some(true));

        locks[winner].release(agent).await;
        locks[winner].release(agent).await;
        assert!(locks[other].try_lock(agent).await);
    }

    #[tokio::test]
    async fn test_session_death_frees_lock() {
        let service = MemoryCoordinationService::new();
        let crashed = service.session();
        let survivor = DistributedLock::new(service.session(), "ferry-agents");
        let agent = AgentId::new();

        assert!(DistributedLock::new(crashed.clone(), "ferry-agents").try_lock(agent).await);
        assert!(!survivor.try_lock(agent).await);

        crashed.expire().await;
        assert!(survivor.try_lock(agent).await);
    }

    #[tokio::test]
    async fn test_locked_agents() {
        let service = MemoryCoordinationService::new();
        let lock = DistributedLock::new(service.session(), "ferry-agents");
        let a = AgentId::new();
        let b = AgentId::new();

        assert!(lock.try_lock(a).await);
        assert!(lock.try_lock(b).await);

        let mut locked = lock.locked_agents().await;
        locked.sort();
        let mut expected = vec![a, b];
        expected.sort();
        assert_eq!(locked, expected);
    }
}
