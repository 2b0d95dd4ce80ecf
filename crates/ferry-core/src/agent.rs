//! Agent and agent host types.

use crate::ids::{AgentId, HostId, JobId};
use crate::queues;
use crate::selector::Selector;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: AgentId,
    pub name: String,
    pub token: String,
    pub url: Option<String>,
    pub host_id: Option<HostId>,
    pub k8s_cluster: bool,
    pub os: Os,
    pub tags: BTreeSet<String>,
    pub status: AgentStatus,
    pub status_updated_at: DateTime<Utc>,
    pub job_id: Option<JobId>,
    pub container_id: Option<String>,
    pub resource: Option<AgentResource>,
    pub created_at: DateTime<Utc>,
}

impl Agent {
    pub fn new(name: impl Into<String>, token: impl Into<String>, tags: BTreeSet<String>) -> Self {
        let now = Utc::now();
        Self {
            id: AgentId::new(),
            name: name.into(),
            token: token.into(),
            url: None,
            host_id: None,
            k8s_cluster: false,
            os: Os::Unknown,
            tags,
            status: AgentStatus::Offline,
            status_updated_at: now,
            job_id: None,
            container_id: None,
            resource: None,
            created_at: now,
        }
    }

    /// Name of the queue the agent receives commands on.
    pub fn queue_name(&self) -> String {
        queues::agent_queue(self.id)
    }

    /// Whether the agent has been STARTING for longer than `seconds`.
    pub fn is_starting_over(&self, seconds: u64, now: DateTime<Utc>) -> bool {
        self.status == AgentStatus::Starting
            && now > self.status_updated_at + Duration::seconds(seconds as i64)
    }

    pub fn has_job(&self) -> bool {
        self.job_id.is_some()
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    pub fn is_busy(&self) -> bool {
        self.status == AgentStatus::Busy
    }

    pub fn is_offline(&self) -> bool {
        self.status == AgentStatus::Offline
    }

    /// Empty selector matches every agent, otherwise at least one label must be a tag.
    pub fn matches(&self, selector: &Selector) -> bool {
        selector.is_empty() || selector.labels().iter().any(|l| self.tags.contains(l))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgentStatus {
    Offline,
    Starting,
    Idle,
    Busy,
}

impl AgentStatus {
    /// Allowed moves: OFFLINE→STARTING→IDLE⇄BUSY, STARTING→OFFLINE, and anything→OFFLINE.
    pub fn can_transition_to(self, to: AgentStatus) -> bool {
        use AgentStatus::*;
        matches!(
            (self, to),
            (Offline, Starting) | (Starting, Idle) | (Idle, Busy) | (Busy, Idle) | (_, Offline)
        )
    }

    pub fn is_available(&self) -> bool {
        matches!(self, AgentStatus::Idle)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Offline => "OFFLINE",
            AgentStatus::Starting => "STARTING",
            AgentStatus::Idle => "IDLE",
            AgentStatus::Busy => "BUSY",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Os {
    Linux,
    Mac,
    Windows,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResource {
    pub cpu: u32,
    pub total_memory_mb: u64,
    pub free_memory_mb: u64,
    pub total_disk_mb: u64,
    pub free_disk_mb: u64,
}

/// Payload an agent sends when it connects.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentInit {
    pub url: Option<String>,
    #[serde(default)]
    pub os: Os,
    pub resource: Option<AgentResource>,
    #[serde(default)]
    pub k8s_cluster: bool,
}

/// Sentinel for host thresholds that never expire.
pub const NO_LIMIT: i64 = -1;

/// A provisioning backend that creates and destroys agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHost {
    pub id: HostId,
    pub name: String,
    pub kind: HostKind,
    pub tags: BTreeSet<String>,
    pub max_size: u32,
    pub max_idle_seconds: i64,
    pub max_offline_seconds: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HostKind {
    Ssh { ip: String, port: u16, user: String },
    LocalSocket { socket: String },
    K8s { namespace: String, url: String },
}

impl AgentHost {
    pub fn new(name: impl Into<String>, kind: HostKind) -> Self {
        Self {
            id: HostId::new(),
            name: name.into(),
            kind,
            tags: BTreeSet::new(),
            max_size: 10,
            max_idle_seconds: 3600,
            max_offline_seconds: 600,
            created_at: Utc::now(),
        }
    }

    /// True strictly after `last_active + max_idle_seconds`; never with [`NO_LIMIT`].
    pub fn is_over_max_idle_seconds(&self, last_active: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        is_over(self.max_idle_seconds, last_active, now)
    }

    pub fn is_over_max_offline_seconds(
        &self,
        last_active: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> bool {
        is_over(self.max_offline_seconds, last_active, now)
    }

    pub fn matches(&self, selector: &Selector) -> bool {
        selector.is_empty() || selector.labels().iter().any(|l| self.tags.contains(l))
    }
}

fn is_over(limit: i64, last_active: DateTime<Utc>, now: DateTime<Utc>) -> bool {
    if limit < 0 {
        return false;
    }
    now > last_active + Duration::seconds(limit)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(values: &[&str]) -> BTreeSet<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_transition_table() {
        use AgentStatus::*;
        let all = [Offline, Starting, Idle, Busy];
        let allowed = [
            (Offline, Starting),
            (Starting, Idle),
            (Starting, Offline),
            (Idle, Busy),
            (Busy, Idle),
        ];

        for from in all {
            for to in all {
                let expected = to == Offline || allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{:?} -> {:?}",
                    from,
                    to
                );
            }
        }
    }

    #[test]
    fn test_selector_matching() {
        let agent = Agent::new("ios-1", "token", tags(&["ios", "test"]));

        assert!(agent.matches(&Selector::new(["ios"])));
        assert!(agent.matches(&Selector::default()));
        assert!(!agent.matches(&Selector::new(["android"])));
    }

    #[test]
    fn test_starting_over() {
        let mut agent = Agent::new("a", "t", BTreeSet::new());
        agent.status = AgentStatus::Starting;
        let now = agent.status_updated_at;

        assert!(!agent.is_starting_over(30, now + Duration::seconds(30)));
        assert!(agent.is_starting_over(30, now + Duration::seconds(31)));

        agent.status = AgentStatus::Idle;
        assert!(!agent.is_starting_over(30, now + Duration::seconds(31)));
    }

    #[test]
    fn test_idle_boundary() {
        let mut host = AgentHost::new(
            "local",
            HostKind::LocalSocket {
                socket: "/var/run/docker.sock".to_string(),
            },
        );
        host.max_idle_seconds = 1800;
        let last = Utc::now();

        assert!(!host.is_over_max_idle_seconds(last, last + Duration::seconds(1800)));
        assert!(host.is_over_max_idle_seconds(last, last + Duration::seconds(1801)));

        host.max_idle_seconds = NO_LIMIT;
        assert!(!host.is_over_max_idle_seconds(last, last + Duration::days(365)));
    }

    #[test]
    fn test_offline_boundary() {
        let mut host = AgentHost::new(
            "local",
            HostKind::LocalSocket {
                socket: "/var/run/docker.sock".to_string(),
            },
        );
        host.max_offline_seconds = 600;
        let last = Utc::now();

        assert!(host.is_over_max_offline_seconds(last, last + Duration::hours(2)));
        assert!(!host.is_over_max_offline_seconds(last, last + Duration::minutes(5)));

        host.max_offline_seconds = NO_LIMIT;
        assert!(!host.is_over_max_offline_seconds(last, last + Duration::hours(2)));
    }
}
