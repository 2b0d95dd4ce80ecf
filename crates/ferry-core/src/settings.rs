//! Settings pushed to an agent when it connects.

use crate::{Error, Result};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Settings {
    pub server_url: String,
    pub token: String,
    pub broker_uri: String,
    pub coordination: CoordinationSettings,
    pub queues: QueueSettings,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct CoordinationSettings {
    pub host: String,
    pub root: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct QueueSettings {
    pub callback: String,
    pub shell_log: String,
    pub tty_log: String,
}

impl Settings {
    /// All values must be present and the three queues distinct.
    pub fn validate(&self) -> Result<()> {
        let required = [
            ("server_url", &self.server_url),
            ("token", &self.token),
            ("broker_uri", &self.broker_uri),
            ("coordination.host", &self.coordination.host),
            ("coordination.root", &self.coordination.root),
            ("queues.callback", &self.queues.callback),
            ("queues.shell_log", &self.queues.shell_log),
            ("queues.tty_log", &self.queues.tty_log),
        ];

        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(Error::Config(format!("agent setting {} is empty", name)));
            }
        }

        let q = &self.queues;
        if q.callback == q.shell_log || q.callback == q.tty_log || q.shell_log == q.tty_log {
            return Err(Error::Config(
                "callback, shell log and tty log queues must differ".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> Settings {
        Settings {
            server_url: "http://ferry:8080".to_string(),
            token: "secret".to_string(),
            broker_uri: "nats://nats:4222".to_string(),
            coordination: CoordinationSettings {
                host: "nats://nats:4222".to_string(),
                root: "ferry-agents".to_string(),
            },
            queues: QueueSettings {
                callback: "queue.callback".to_string(),
                shell_log: "queue.logs.shell".to_string(),
                tty_log: "queue.logs.tty".to_string(),
            },
        }
    }

    #[test]
    fn test_valid_settings() {
        assert!(settings().validate().is_ok());
    }

    #[test]
    fn test_missing_token_rejected() {
        let mut s = settings();
        s.token = String::new();
        assert!(matches!(s.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_shared_queue_rejected() {
        let mut s = settings();
        s.queues.tty_log = s.queues.shell_log.clone();
        assert!(s.validate().is_err());
    }
}
