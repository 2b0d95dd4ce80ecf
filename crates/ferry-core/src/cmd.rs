//! Commands exchanged between the server and agents.
//!
//! Everything in this module is part of the agent wire contract: the server
//! publishes [`CmdIn`] as JSON onto an agent's queue, and agents report back
//! with [`CmdOut`] frames on the callback queue and [`LogLine`]s on the
//! shell-log queue.

use crate::ids::{CmdId, FlowId, JobId, SessionId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::str::FromStr;

/// Command sent to an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum CmdIn {
    Shell(ShellIn),
    Kill,
    Close,
    Tty(TtyIn),
}

impl CmdIn {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShellIn {
    pub id: CmdId,
    pub flow_id: FlowId,
    pub job_id: JobId,
    #[serde(default)]
    pub allow_failure: bool,
    pub plugin: Option<String>,
    pub condition: Option<String>,
    #[serde(default)]
    pub bash: Vec<String>,
    #[serde(default)]
    pub pwsh: Vec<String>,
    #[serde(default)]
    pub dockers: Vec<DockerOption>,
    /// Execution budget in seconds.
    pub timeout: u64,
    #[serde(default)]
    pub retry: u32,
    #[serde(default)]
    pub inputs: BTreeMap<String, String>,
    /// Variable name prefixes exported back through [`ShellOut::output`].
    #[serde(default)]
    pub env_filters: BTreeSet<String>,
}

impl ShellIn {
    pub fn new(flow_id: FlowId, job_id: JobId, timeout: u64) -> Self {
        Self {
            id: CmdId::new(),
            flow_id,
            job_id,
            allow_failure: false,
            plugin: None,
            condition: None,
            bash: Vec::new(),
            pwsh: Vec::new(),
            dockers: Vec::new(),
            timeout,
            retry: 0,
            inputs: BTreeMap::new(),
            env_filters: BTreeSet::new(),
        }
    }

    pub fn with_bash(mut self, line: impl Into<String>) -> Self {
        self.bash.push(line.into());
        self
    }

    pub fn with_pwsh(mut self, line: impl Into<String>) -> Self {
        self.pwsh.push(line.into());
        self
    }

    pub fn with_input(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.inputs.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct DockerOption {
    pub image: String,
    pub name: Option<String>,
    #[serde(default)]
    pub entrypoint: Vec<String>,
    #[serde(default)]
    pub command: Vec<String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default)]
    pub ports: Vec<String>,
    pub network: Option<String>,
    pub user: Option<String>,
    /// The container the step script runs in, as opposed to a service container.
    #[serde(default)]
    pub runtime: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecStatus {
    Pending,
    Running,
    Success,
    Skipped,
    Exception,
    Killed,
    Timeout,
}

impl ExecStatus {
    /// Severity used when escalating the status of a group of commands.
    pub fn level(&self) -> i32 {
        match self {
            ExecStatus::Pending => -1,
            ExecStatus::Running => 1,
            ExecStatus::Success | ExecStatus::Skipped => 2,
            ExecStatus::Exception | ExecStatus::Killed => 3,
            ExecStatus::Timeout => 4,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.level() >= 2
    }

    pub fn is_success(&self) -> bool {
        matches!(self, ExecStatus::Success | ExecStatus::Skipped)
    }

    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            ExecStatus::Exception | ExecStatus::Killed | ExecStatus::Timeout
        )
    }

    /// The more severe of two statuses.
    pub fn escalate(self, other: ExecStatus) -> ExecStatus {
        if other.level() > self.level() { other } else { self }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct ShellOut {
    pub id: CmdId,
    pub process_id: Option<u32>,
    pub container_id: Option<String>,
    pub status: ExecStatus,
    pub code: Option<i32>,
    #[serde(default)]
    pub output: BTreeMap<String, String>,
    pub start_at: Option<DateTime<Utc>>,
    pub finish_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
    /// Number of log bytes written, -1 when unknown.
    #[serde(default = "unknown_log_size")]
    pub log_size: i64,
}

fn unknown_log_size() -> i64 {
    -1
}

impl ShellOut {
    pub fn new(id: CmdId, status: ExecStatus) -> Self {
        Self {
            id,
            process_id: None,
            container_id: None,
            status,
            code: None,
            output: BTreeMap::new(),
            start_at: None,
            finish_at: None,
            error: None,
            log_size: unknown_log_size(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TtyAction {
    Open,
    Close,
    Shell,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TtyIn {
    pub id: SessionId,
    pub action: TtyAction,
    pub input: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TtyOut {
    pub id: SessionId,
    pub action: TtyAction,
    pub success: bool,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct TtyLog {
    pub id: SessionId,
    pub log: String,
}

/// Frame indicator for [`ShellOut`] payloads on the callback queue.
pub const SHELL_OUT_IND: u8 = 1;
/// Frame indicator for [`TtyOut`] payloads on the callback queue.
pub const TTY_OUT_IND: u8 = 2;

/// Result reported by an agent on the callback queue.
#[derive(Debug, Clone, PartialEq)]
pub enum CmdOut {
    Shell(ShellOut),
    Tty(TtyOut),
}

impl CmdOut {
    /// One indicator byte followed by the JSON body.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let (ind, body) = match self {
            CmdOut::Shell(out) => (SHELL_OUT_IND, serde_json::to_vec(out)?),
            CmdOut::Tty(out) => (TTY_OUT_IND, serde_json::to_vec(out)?),
        };

        let mut frame = Vec::with_capacity(body.len() + 1);
        frame.push(ind);
        frame.extend_from_slice(&body);
        Ok(frame)
    }

    /// Decode a framed payload. A bare JSON object is read as a [`ShellOut`].
    pub fn decode(raw: &[u8]) -> Result<Self> {
        let Some((&ind, body)) = raw.split_first() else {
            return Err(Error::InvalidMessage("empty callback payload".to_string()));
        };

        match ind {
            SHELL_OUT_IND => Ok(CmdOut::Shell(serde_json::from_slice(body)?)),
            TTY_OUT_IND => Ok(CmdOut::Tty(serde_json::from_slice(body)?)),
            b'{' => Ok(CmdOut::Shell(serde_json::from_slice(raw)?)),
            other => Err(Error::InvalidMessage(format!(
                "unknown callback indicator {}",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum LogStream {
    Stdout,
    Stderr,
}

impl LogStream {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogStream::Stdout => "STDOUT",
            LogStream::Stderr => "STDERR",
        }
    }
}

/// One line of shell output: `cmdId#type#sequenceNumber#content`.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub cmd_id: CmdId,
    pub stream: LogStream,
    pub number: u64,
    pub content: String,
}

impl FromStr for LogLine {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let mut parts = s.splitn(4, '#');
        let (Some(id), Some(stream), Some(number), Some(content)) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(Error::InvalidMessage(format!("malformed log line: {}", s)));
        };

        let cmd_id = id
            .parse()
            .map_err(|e| Error::InvalidMessage(format!("invalid cmd id {}: {}", id, e)))?;
        let stream = match stream {
            "STDOUT" => LogStream::Stdout,
            "STDERR" => LogStream::Stderr,
            other => {
                return Err(Error::InvalidMessage(format!(
                    "invalid log stream: {}",
                    other
                )));
            }
        };
        let number = number
            .parse()
            .map_err(|e| Error::InvalidMessage(format!("invalid log number {}: {}", number, e)))?;

        Ok(Self {
            cmd_id,
            stream,
            number,
            content: content.to_string(),
        })
    }
}

impl fmt::Display for LogLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}#{}#{}#{}",
            self.cmd_id,
            self.stream.as_str(),
            self.number,
            self.content
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_levels() {
        assert!(!ExecStatus::Pending.is_terminal());
        assert!(!ExecStatus::Running.is_terminal());
        assert!(ExecStatus::Skipped.is_terminal());
        assert_eq!(
            ExecStatus::Success.escalate(ExecStatus::Killed),
            ExecStatus::Killed
        );
        assert_eq!(
            ExecStatus::Timeout.escalate(ExecStatus::Exception),
            ExecStatus::Timeout
        );
    }

    #[test]
    fn test_log_line_keeps_hashes_in_content() {
        let id = CmdId::new();
        let raw = format!("{}#STDERR#12#echo '#not a field#'", id);
        let line: LogLine = raw.parse().unwrap();

        assert_eq!(line.cmd_id, id);
        assert_eq!(line.stream, LogStream::Stderr);
        assert_eq!(line.number, 12);
        assert_eq!(line.content, "echo '#not a field#'");
        assert_eq!(line.to_string(), raw);
    }

    #[test]
    fn test_log_line_rejects_missing_fields() {
        assert!("abc#STDOUT#1".parse::<LogLine>().is_err());
        let id = CmdId::new();
        assert!(format!("{}#STDIN#1#x", id).parse::<LogLine>().is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_indicator() {
        assert!(CmdOut::decode(&[9, b'{', b'}']).is_err());
        assert!(CmdOut::decode(&[]).is_err());
    }
}
