//! Error types for Ferry CI.

use crate::agent::AgentStatus;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Scheduling errors
    #[error("No available agent for selector {selector}")]
    NotAvailable { selector: String },

    #[error("Agent not found: {0}")]
    AgentNotFound(String),

    #[error("Agent host not found: {0}")]
    HostNotFound(String),

    #[error("Invalid agent status transition {from:?} -> {to:?}")]
    InvalidTransition { from: AgentStatus, to: AgentStatus },

    #[error("Duplicate: {0}")]
    Duplicate(String),

    #[error("Agent host {host} is full ({max_size} agents)")]
    HostFull { host: String, max_size: u32 },

    // Execution errors
    #[error("Command {cmd_id} timed out after {seconds} seconds")]
    Timeout { cmd_id: String, seconds: u64 },

    #[error("Agent lost while running command {cmd_id}")]
    AgentLost { cmd_id: String },

    #[error("Dispatch cancelled for job {0}")]
    Cancelled(String),

    // Infrastructure errors
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Coordination service error: {0}")]
    Coordination(String),

    #[error("Invalid message: {0}")]
    InvalidMessage(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Configuration error: {0}")]
    Config(String),

    // Generic
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Whether the caller may retry the operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NotAvailable { .. } | Error::Transport(_) | Error::Coordination(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
