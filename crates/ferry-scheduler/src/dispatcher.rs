//! Command dispatch.
//!
//! One dispatch attempt moves through
//! `PENDING → SELECTING → LOCKED → SENT → {COMPLETED | FAILED | TIMED_OUT}`:
//!
//! 1. The build is registered with the admission queue and waits until it is
//!    the oldest pending build of its flow under its selector.
//! 2. Idle agents matching the selector are tried in registry order; the
//!    first whose lock is taken is marked BUSY. The build stays in the
//!    admission queue until its command ends, so later builds of the flow
//!    keep waiting.
//! 3. The [`ShellIn`] is published to the agent's queue. A failed publish
//!    rolls back the status and the lock together.
//! 4. Terminal [`ShellOut`]s, the per-command watchdog, cancellation and the
//!    agent going away all end in the same release sequence.

use ferry_core::agent::{Agent, AgentStatus};
use ferry_core::cmd::{CmdIn, ExecStatus, ShellIn, ShellOut};
use ferry_core::events::{AgentEvent, DispatchEvent};
use ferry_core::ids::{AgentId, CmdId, FlowId, JobId, SelectorId};
use ferry_core::ports::MessageBroker;
use ferry_core::queues::PublishOptions;
use ferry_core::selector::Selector;
use ferry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, broadcast, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::lock::DistributedLock;
use crate::priority::PriorityAdmissionQueue;
use crate::registry::AgentRegistry;

const EVENT_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// How long a request may wait for an agent before failing with
    /// [`Error::NotAvailable`].
    pub queue_timeout: Duration,
    /// Upper bound between acquisition attempts while waiting.
    pub retry_interval: Duration,
    /// Execution budget for commands that carry none.
    pub default_cmd_timeout: u64,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            queue_timeout: Duration::from_secs(300),
            retry_interval: Duration::from_secs(5),
            default_cmd_timeout: 1800,
        }
    }
}

#[derive(Debug, Clone)]
pub struct DispatchRequest {
    /// Build number of the flow run, oldest wins.
    pub build_number: u64,
    pub selector: Selector,
    pub cmd: ShellIn,
}

impl DispatchRequest {
    pub fn new(build_number: u64, selector: Selector, cmd: ShellIn) -> Self {
        Self {
            build_number,
            selector,
            cmd,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DispatchState {
    Pending,
    Selecting,
    Locked,
    Sent,
    Completed,
    Failed(FailureReason),
    TimedOut,
}

impl DispatchState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            DispatchState::Completed | DispatchState::Failed(_) | DispatchState::TimedOut
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureReason {
    AgentReported {
        status: ExecStatus,
        error: Option<String>,
    },
    AgentLost,
    Cancelled,
}

#[derive(Debug, Clone)]
pub struct DispatchOutcome {
    pub cmd_id: CmdId,
    pub job_id: JobId,
    pub agent_id: AgentId,
    pub state: DispatchState,
    /// Last report from the agent, if any.
    pub result: Option<ShellOut>,
    pub timeout: u64,
}

impl DispatchOutcome {
    /// Failures the agent did not report itself.
    pub fn error(&self) -> Option<Error> {
        match &self.state {
            DispatchState::TimedOut => Some(Error::Timeout {
                cmd_id: self.cmd_id.to_string(),
                seconds: self.timeout,
            }),
            DispatchState::Failed(FailureReason::AgentLost) => Some(Error::AgentLost {
                cmd_id: self.cmd_id.to_string(),
            }),
            DispatchState::Failed(FailureReason::Cancelled) => {
                Some(Error::Cancelled(self.job_id.to_string()))
            }
            _ => None,
        }
    }
}

/// A command on its way to or running on an agent.
#[derive(Debug)]
pub struct Dispatch {
    pub cmd_id: CmdId,
    pub agent_id: AgentId,
    outcome: oneshot::Receiver<DispatchOutcome>,
}

impl Dispatch {
    pub async fn wait(self) -> Result<DispatchOutcome> {
        self.outcome
            .await
            .map_err(|_| Error::Internal(format!("dispatch {} dropped", self.cmd_id)))
    }
}

struct Waiting {
    cancel: watch::Sender<bool>,
    state: DispatchState,
}

struct InFlight {
    agent_id: AgentId,
    job_id: JobId,
    flow_id: FlowId,
    build_number: u64,
    selector: SelectorId,
    timeout: u64,
    state: DispatchState,
    cancel_requested: bool,
    last: Option<ShellOut>,
    outcome: Option<oneshot::Sender<DispatchOutcome>>,
}

pub struct CmdDispatcher {
    registry: Arc<AgentRegistry>,
    lock: DistributedLock,
    admission: Arc<PriorityAdmissionQueue>,
    broker: Arc<dyn MessageBroker>,
    config: DispatchConfig,
    waiting: Mutex<HashMap<JobId, Waiting>>,
    inflight: Mutex<HashMap<CmdId, InFlight>>,
    changed: Notify,
    events: broadcast::Sender<DispatchEvent>,
}

impl CmdDispatcher {
    pub fn new(
        registry: Arc<AgentRegistry>,
        lock: DistributedLock,
        admission: Arc<PriorityAdmissionQueue>,
        broker: Arc<dyn MessageBroker>,
        config: DispatchConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            registry,
            lock,
            admission,
            broker,
            config,
            waiting: Mutex::new(HashMap::new()),
            inflight: Mutex::new(HashMap::new()),
            changed: Notify::new(),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DispatchEvent> {
        self.events.subscribe()
    }

    pub fn admission(&self) -> &Arc<PriorityAdmissionQueue> {
        &self.admission
    }

    /// Wake requests waiting for an agent.
    pub fn wake(&self) {
        self.changed.notify_waiters();
    }

    /// Current state of a job's dispatch, if one is active.
    pub async fn job_state(&self, job_id: JobId) -> Option<DispatchState> {
        if let Some(waiting) = self.waiting.lock().await.get(&job_id) {
            return Some(waiting.state.clone());
        }
        self.inflight
            .lock()
            .await
            .values()
            .find(|entry| entry.job_id == job_id)
            .map(|entry| entry.state.clone())
    }

    pub async fn inflight_count(&self) -> usize {
        self.inflight.lock().await.len()
    }

    /// Acquire an agent for `request` and send it the command.
    ///
    /// Waits up to the queue timeout for an agent. The returned [`Dispatch`]
    /// resolves once the command reaches a terminal state.
    pub async fn dispatch(self: &Arc<Self>, request: DispatchRequest) -> Result<Dispatch> {
        let DispatchRequest {
            build_number,
            selector,
            mut cmd,
        } = request;
        let job_id = cmd.job_id;
        let flow_id = cmd.flow_id;
        let selector_id = selector.id();
        if cmd.timeout == 0 {
            cmd.timeout = self.config.default_cmd_timeout;
        }

        let mut cancelled = self.register_waiting(job_id).await?;
        self.admission
            .add_job(&selector_id, flow_id, build_number)
            .await;
        debug!(job_id = %job_id, flow_id = %flow_id, build_number, selector = %selector, "Dispatch pending");

        let selected = self
            .select_agent(job_id, flow_id, build_number, &selector, &selector_id, &mut cancelled)
            .await;

        let agent = match selected {
            Ok(agent) => agent,
            Err(e) => {
                self.waiting.lock().await.remove(&job_id);
                self.admission
                    .remove_job(&selector_id, flow_id, build_number)
                    .await;
                self.changed.notify_waiters();
                return Err(e);
            }
        };

        let cmd_id = cmd.id;
        let (tx, rx) = oneshot::channel();
        self.inflight.lock().await.insert(
            cmd_id,
            InFlight {
                agent_id: agent.id,
                job_id,
                flow_id,
                build_number,
                selector: selector_id.clone(),
                timeout: cmd.timeout,
                state: DispatchState::Locked,
                cancel_requested: false,
                last: None,
                outcome: Some(tx),
            },
        );
        self.waiting.lock().await.remove(&job_id);

        let timeout = cmd.timeout;
        if !self.send(&agent, CmdIn::Shell(cmd)).await {
            // Nothing to roll back if the agent was lost meanwhile.
            if self.inflight.lock().await.remove(&cmd_id).is_some() {
                self.rollback(agent.id).await;
            }
            self.admission
                .remove_job(&selector_id, flow_id, build_number)
                .await;
            self.changed.notify_waiters();
            return Err(Error::Transport(format!(
                "failed to send command {} to agent {}",
                cmd_id, agent.id
            )));
        }

        let cancel_requested = {
            let mut inflight = self.inflight.lock().await;
            match inflight.get_mut(&cmd_id) {
                Some(entry) => {
                    entry.state = DispatchState::Sent;
                    Some(entry.cancel_requested)
                }
                None => None,
            }
        };

        let Some(cancel_requested) = cancel_requested else {
            debug!(cmd_id = %cmd_id, agent_id = %agent.id, "Command finished before it was sent");
            return Ok(Dispatch {
                cmd_id,
                agent_id: agent.id,
                outcome: rx,
            });
        };

        info!(cmd_id = %cmd_id, job_id = %job_id, agent_id = %agent.id, "Command sent");

        if cancel_requested {
            self.kill(cmd_id, agent.id, FailureReason::Cancelled).await;
        } else {
            self.spawn_watchdog(cmd_id, timeout);
        }

        Ok(Dispatch {
            cmd_id,
            agent_id: agent.id,
            outcome: rx,
        })
    }

    async fn register_waiting(&self, job_id: JobId) -> Result<watch::Receiver<bool>> {
        // Both maps are held so a racing duplicate cannot slip between them.
        let inflight = self.inflight.lock().await;
        let mut waiting = self.waiting.lock().await;
        let active = inflight.values().any(|entry| entry.job_id == job_id);
        if active || waiting.contains_key(&job_id) {
            return Err(Error::Duplicate(format!("dispatch for job {}", job_id)));
        }

        let (cancel, rx) = watch::channel(false);
        waiting.insert(
            job_id,
            Waiting {
                cancel,
                state: DispatchState::Pending,
            },
        );
        Ok(rx)
    }

    async fn set_waiting_state(&self, job_id: JobId, state: DispatchState) {
        if let Some(waiting) = self.waiting.lock().await.get_mut(&job_id) {
            waiting.state = state;
        }
    }

    async fn select_agent(
        &self,
        job_id: JobId,
        flow_id: FlowId,
        build_number: u64,
        selector: &Selector,
        selector_id: &SelectorId,
        cancelled: &mut watch::Receiver<bool>,
    ) -> Result<Agent> {
        let deadline = Instant::now() + self.config.queue_timeout;
        let mut announced = false;

        loop {
            let changed = self.changed.notified();
            tokio::pin!(changed);
            changed.as_mut().enable();

            if *cancelled.borrow() {
                info!(job_id = %job_id, "Dispatch cancelled while waiting for agent");
                return Err(Error::Cancelled(job_id.to_string()));
            }

            if self.admission.is_next(selector_id, flow_id, build_number).await {
                self.set_waiting_state(job_id, DispatchState::Selecting).await;

                if let Some(agent) = self.acquire(selector, job_id).await {
                    self.set_waiting_state(job_id, DispatchState::Locked).await;
                    return Ok(agent);
                }

                if !announced {
                    announced = true;
                    debug!(job_id = %job_id, selector = %selector, "No idle agent");
                    let _ = self.events.send(DispatchEvent::NoIdleAgent {
                        job_id,
                        selector: selector.clone(),
                    });
                }
            }

            let now = Instant::now();
            if now >= deadline {
                warn!(job_id = %job_id, selector = %selector, "No agent available in time");
                return Err(Error::NotAvailable {
                    selector: selector.to_string(),
                });
            }

            let wait = self.config.retry_interval.min(deadline - now);
            tokio::select! {
                _ = &mut changed => {}
                _ = tokio::time::sleep(wait) => {}
                _ = cancelled.changed() => {}
            }
        }
    }

    /// Lock the first idle candidate and mark it BUSY.
    async fn acquire(&self, selector: &Selector, job_id: JobId) -> Option<Agent> {
        for candidate in self.registry.find(selector, AgentStatus::Idle).await {
            if !self.lock.try_lock(candidate.id).await {
                continue;
            }

            match self
                .registry
                .set_status(candidate.id, AgentStatus::Busy, Some(job_id))
                .await
            {
                Ok(agent) => {
                    debug!(agent_id = %agent.id, job_id = %job_id, "Agent acquired");
                    return Some(agent);
                }
                Err(e) => {
                    debug!(agent_id = %candidate.id, "Candidate changed under lock: {}", e);
                    self.lock.release(candidate.id).await;
                }
            }
        }
        None
    }

    async fn send(&self, agent: &Agent, cmd: CmdIn) -> bool {
        match cmd.to_bytes() {
            Ok(body) => {
                self.broker
                    .publish(&agent.queue_name(), &body, PublishOptions::default())
                    .await
            }
            Err(e) => {
                warn!(agent_id = %agent.id, "Failed to encode command: {}", e);
                false
            }
        }
    }

    async fn rollback(&self, agent_id: AgentId) {
        if let Err(e) = self
            .registry
            .set_status(agent_id, AgentStatus::Idle, None)
            .await
        {
            warn!(agent_id = %agent_id, "Failed to revert agent to idle: {}", e);
        }
        self.lock.release(agent_id).await;
        self.changed.notify_waiters();
    }

    fn spawn_watchdog(self: &Arc<Self>, cmd_id: CmdId, seconds: u64) {
        let dispatcher = Arc::downgrade(self);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(seconds)).await;
            if let Some(dispatcher) = dispatcher.upgrade() {
                dispatcher.on_timeout(cmd_id).await;
            }
        });
    }

    async fn on_timeout(&self, cmd_id: CmdId) {
        let agent_id = match self.inflight.lock().await.get(&cmd_id) {
            Some(entry) if entry.state == DispatchState::Sent => entry.agent_id,
            _ => return,
        };

        warn!(cmd_id = %cmd_id, agent_id = %agent_id, "Command timed out");
        self.send_kill(agent_id).await;
        self.finish(cmd_id, DispatchState::TimedOut, None).await;
    }

    async fn send_kill(&self, agent_id: AgentId) {
        match self.registry.get(agent_id).await {
            Ok(agent) => {
                if !self.send(&agent, CmdIn::Kill).await {
                    warn!(agent_id = %agent_id, "Failed to send kill");
                }
            }
            Err(e) => debug!(agent_id = %agent_id, "Not sending kill: {}", e),
        }
    }

    async fn kill(&self, cmd_id: CmdId, agent_id: AgentId, reason: FailureReason) {
        self.send_kill(agent_id).await;
        self.finish(cmd_id, DispatchState::Failed(reason), None).await;
    }

    /// Handle a report from an agent. `false` when the command is unknown here.
    pub async fn on_shell_out(&self, out: ShellOut) -> bool {
        {
            let mut inflight = self.inflight.lock().await;
            let Some(entry) = inflight.get_mut(&out.id) else {
                return false;
            };
            if !out.is_terminal() {
                debug!(cmd_id = %out.id, status = ?out.status, "Command progress");
                entry.last = Some(out);
                return true;
            }
        }

        let state = match out.status {
            ExecStatus::Success | ExecStatus::Skipped => DispatchState::Completed,
            ExecStatus::Timeout => DispatchState::TimedOut,
            status => DispatchState::Failed(FailureReason::AgentReported {
                status,
                error: out.error.clone(),
            }),
        };
        self.finish(out.id, state, Some(out)).await;
        true
    }

    /// Cancel a job's dispatch wherever it is. `false` when nothing is active.
    pub async fn cancel(&self, job_id: JobId) -> bool {
        let sent = {
            let mut inflight = self.inflight.lock().await;
            match inflight
                .iter_mut()
                .find(|(_, entry)| entry.job_id == job_id)
            {
                Some((cmd_id, entry)) if entry.state == DispatchState::Sent => {
                    Some((*cmd_id, entry.agent_id))
                }
                Some((_, entry)) => {
                    // Still publishing; the dispatch picks this up once sent.
                    entry.cancel_requested = true;
                    return true;
                }
                None => None,
            }
        };

        if let Some((cmd_id, agent_id)) = sent {
            info!(cmd_id = %cmd_id, job_id = %job_id, "Cancelling running command");
            self.kill(cmd_id, agent_id, FailureReason::Cancelled).await;
            return true;
        }

        match self.waiting.lock().await.get(&job_id) {
            Some(waiting) => {
                let _ = waiting.cancel.send(true);
                true
            }
            None => false,
        }
    }

    /// Fail whatever the agent was running or about to run.
    pub async fn on_agent_lost(&self, agent_id: AgentId) {
        let lost: Vec<CmdId> = self
            .inflight
            .lock()
            .await
            .iter()
            .filter(|(_, entry)| {
                entry.agent_id == agent_id
                    && matches!(entry.state, DispatchState::Locked | DispatchState::Sent)
            })
            .map(|(cmd_id, _)| *cmd_id)
            .collect();

        for cmd_id in lost {
            warn!(cmd_id = %cmd_id, agent_id = %agent_id, "Agent lost during command");
            self.finish(cmd_id, DispatchState::Failed(FailureReason::AgentLost), None)
                .await;
        }
    }

    /// Release everything a command held and resolve its outcome.
    async fn finish(&self, cmd_id: CmdId, state: DispatchState, result: Option<ShellOut>) -> bool {
        let Some(mut entry) = self.inflight.lock().await.remove(&cmd_id) else {
            return false;
        };

        // A lost agent is already OFFLINE.
        if state != DispatchState::Failed(FailureReason::AgentLost) {
            if let Err(e) = self
                .registry
                .set_status(entry.agent_id, AgentStatus::Idle, None)
                .await
            {
                warn!(agent_id = %entry.agent_id, "Failed to return agent to idle: {}", e);
            }
        }
        self.lock.release(entry.agent_id).await;
        self.admission
            .remove_job(&entry.selector, entry.flow_id, entry.build_number)
            .await;
        self.changed.notify_waiters();

        match &state {
            DispatchState::Completed => {
                info!(cmd_id = %cmd_id, agent_id = %entry.agent_id, "Command completed")
            }
            other => {
                warn!(cmd_id = %cmd_id, agent_id = %entry.agent_id, state = ?other, "Command failed")
            }
        }

        if let Some(outcome) = entry.outcome.take() {
            let _ = outcome.send(DispatchOutcome {
                cmd_id,
                job_id: entry.job_id,
                agent_id: entry.agent_id,
                state,
                result: result.or(entry.last),
                timeout: entry.timeout,
            });
        }
        true
    }

    /// Follow registry events: agents going away fail their commands, agents
    /// becoming available wake waiting requests.
    pub fn spawn_agent_watch(
        self: &Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        let dispatcher = self.clone();
        let mut events = self.registry.subscribe();
        tokio::spawn(async move {
            loop {
                let event = tokio::select! {
                    event = events.recv() => event,
                    _ = shutdown.changed() => break,
                };

                match event {
                    Ok(AgentEvent::StatusChanged { agent, .. }) => match agent.status {
                        AgentStatus::Offline => dispatcher.on_agent_lost(agent.id).await,
                        AgentStatus::Idle => dispatcher.wake(),
                        _ => {}
                    },
                    Ok(AgentEvent::Deleted(agent)) => dispatcher.on_agent_lost(agent.id).await,
                    Ok(AgentEvent::Updated(_)) => dispatcher.wake(),
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(missed)) => {
                        warn!(missed, "Dispatcher lagged behind agent events");
                        dispatcher.wake();
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            debug!("Agent watch stopped");
        })
    }
}
