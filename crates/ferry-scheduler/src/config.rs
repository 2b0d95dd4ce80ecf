//! Scheduler configuration.
//!
//! Layered with the `config` crate: built-in defaults, then an optional
//! file, then `FERRY_*` environment variables (`__` separates sections,
//! e.g. `FERRY_DISPATCH__QUEUE_TIMEOUT_SECS=60`).

use ferry_core::queues::DeadLetter;
use ferry_core::settings::{CoordinationSettings, QueueSettings, Settings};
use ferry_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::dispatcher::DispatchConfig;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// URL agents reach the server on.
    pub server_url: String,
    pub nats: NatsSection,
    pub coordination: CoordinationSection,
    pub queues: QueuesSection,
    pub dispatch: DispatchSection,
    pub agents: AgentsSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NatsSection {
    pub urls: Vec<String>,
    pub stream_prefix: String,
    pub max_deliver: i64,
    pub priority_bands: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinationSection {
    pub agent_root: String,
    pub bucket: String,
    pub lease_secs: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueuesSection {
    pub callback: String,
    pub shell_log: String,
    pub tty_log: String,
    pub job_dl_exchange: String,
    pub job_dl_routing_key: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatchSection {
    pub queue_timeout_secs: u64,
    pub retry_interval_secs: u64,
    pub default_cmd_timeout_secs: u64,
    pub consumer_concurrency: usize,
    pub max_job_priority: u8,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentsSection {
    pub starting_grace_secs: u64,
    pub reclaim_interval_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            server_url: "http://localhost:8080".to_string(),
            nats: NatsSection::default(),
            coordination: CoordinationSection::default(),
            queues: QueuesSection::default(),
            dispatch: DispatchSection::default(),
            agents: AgentsSection::default(),
        }
    }
}

impl Default for NatsSection {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            stream_prefix: "FERRY".to_string(),
            max_deliver: 3,
            priority_bands: 4,
        }
    }
}

impl Default for CoordinationSection {
    fn default() -> Self {
        Self {
            agent_root: "ferry-agents".to_string(),
            bucket: "FERRY_LOCKS".to_string(),
            lease_secs: 15,
        }
    }
}

impl Default for QueuesSection {
    fn default() -> Self {
        Self {
            callback: "queue.callback".to_string(),
            shell_log: "queue.logs.shell".to_string(),
            tty_log: "queue.logs.tty".to_string(),
            job_dl_exchange: "ferry.dlx".to_string(),
            job_dl_routing_key: "job.expired".to_string(),
        }
    }
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            queue_timeout_secs: 300,
            retry_interval_secs: 5,
            default_cmd_timeout_secs: 1800,
            consumer_concurrency: 4,
            max_job_priority: 255,
        }
    }
}

impl Default for AgentsSection {
    fn default() -> Self {
        Self {
            starting_grace_secs: 60,
            reclaim_interval_secs: 60,
        }
    }
}

fn config_error(err: config::ConfigError) -> Error {
    Error::Config(err.to_string())
}

impl SchedulerConfig {
    /// Defaults, then `path` if given, then the environment.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let defaults = config::Config::try_from(&Self::default()).map_err(config_error)?;
        let mut builder = config::Config::builder().add_source(defaults);

        if let Some(path) = path {
            builder = builder.add_source(config::File::from(path).required(true));
        }

        let config: Self = builder
            .add_source(
                config::Environment::with_prefix("FERRY")
                    .prefix_separator("_")
                    .separator("__")
                    .list_separator(",")
                    .with_list_parse_key("nats.urls")
                    .try_parsing(true),
            )
            .build()
            .map_err(config_error)?
            .try_deserialize()
            .map_err(config_error)?;

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nats.urls.is_empty() {
            return Err(Error::Config("nats.urls must not be empty".to_string()));
        }
        if self.dispatch.retry_interval_secs == 0 {
            return Err(Error::Config(
                "dispatch.retry_interval_secs must be positive".to_string(),
            ));
        }
        if self.coordination.lease_secs == 0 {
            return Err(Error::Config(
                "coordination.lease_secs must be positive".to_string(),
            ));
        }
        if self.agents.reclaim_interval_secs == 0 {
            return Err(Error::Config(
                "agents.reclaim_interval_secs must be positive".to_string(),
            ));
        }
        self.agent_settings().validate()
    }

    pub fn dispatch_config(&self) -> DispatchConfig {
        DispatchConfig {
            queue_timeout: Duration::from_secs(self.dispatch.queue_timeout_secs),
            retry_interval: Duration::from_secs(self.dispatch.retry_interval_secs),
            default_cmd_timeout: self.dispatch.default_cmd_timeout_secs,
        }
    }

    pub fn job_dead_letter(&self) -> DeadLetter {
        DeadLetter::new(
            self.queues.job_dl_exchange.clone(),
            self.queues.job_dl_routing_key.clone(),
        )
    }

    pub fn queue_settings(&self) -> QueueSettings {
        QueueSettings {
            callback: self.queues.callback.clone(),
            shell_log: self.queues.shell_log.clone(),
            tty_log: self.queues.tty_log.clone(),
        }
    }

    /// Settings handed to agents, pointing at the same endpoints the server
    /// uses. The token is filled in per agent.
    pub fn agent_settings(&self) -> Settings {
        let broker_uri = self.nats.urls.join(",");
        Settings {
            server_url: self.server_url.clone(),
            token: "pending".to_string(),
            broker_uri: broker_uri.clone(),
            coordination: CoordinationSettings {
                host: broker_uri,
                root: self.coordination.agent_root.clone(),
            },
            queues: self.queue_settings(),
        }
    }

    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.agents.reclaim_interval_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = SchedulerConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.job_dead_letter().address(), "ferry.dlx.job.expired");
        assert_eq!(config.agent_settings().coordination.root, "ferry-agents");
    }

    #[test]
    fn test_load_file_over_defaults() {
        let dir = std::env::temp_dir().join(format!("ferry-config-{}", uuid::Uuid::new_v4()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ferry.toml");
        let mut file = std::fs::File::create(&path).unwrap();
        writeln!(
            file,
            "server_url = \"http://ci.internal:8080\"\n\n[dispatch]\nqueue_timeout_secs = 30"
        )
        .unwrap();

        let config = SchedulerConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server_url, "http://ci.internal:8080");
        assert_eq!(config.dispatch.queue_timeout_secs, 30);
        assert_eq!(config.dispatch.retry_interval_secs, 5);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_shared_queues_rejected() {
        let mut config = SchedulerConfig::default();
        config.queues.tty_log = config.queues.callback.clone();
        assert!(matches!(config.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_lease_rejected() {
        let mut config = SchedulerConfig::default();
        config.coordination.lease_secs = 0;
        assert!(matches!(config.validate(), Err(Error::Config(_))));

        config.coordination.lease_secs = 1;
        assert!(config.validate().is_ok());
    }
}
