//! End-to-end scheduling scenarios over the in-process adapters.

use async_trait::async_trait;
use ferry_core::agent::{Agent, AgentHost, AgentInit, AgentStatus, HostKind, Os};
use ferry_core::cmd::{CmdIn, CmdOut, ExecStatus, LogLine, LogStream, ShellIn, ShellOut};
use ferry_core::events::DispatchEvent;
use ferry_core::ids::{FlowId, JobId};
use ferry_core::ports::{ConsumerHandle, HostProvisioner, MessageBroker, MessageHandler};
use ferry_core::queues::{PublishOptions, QueueSpec};
use ferry_core::selector::Selector;
use ferry_core::{Error, Result};
use ferry_scheduler::{
    AgentRegistry, CallbackRouter, CmdDispatcher, DispatchConfig, DispatchRequest,
    DispatchState, DistributedLock, FailureReason, HostManager, MemoryAgentStore, MemoryBroker,
    MemoryCoordinationService, PriorityAdmissionQueue, SchedulerConfig, spawn_persistence,
};
use ferry_scheduler::testing::{eventually, init_test_logging};
use futures::future::join_all;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Semaphore, watch};

const ROOT: &str = "ferry-agents";

fn fast() -> DispatchConfig {
    DispatchConfig {
        queue_timeout: Duration::from_secs(5),
        retry_interval: Duration::from_millis(50),
        default_cmd_timeout: 60,
    }
}

struct Harness {
    broker: Arc<MemoryBroker>,
    service: MemoryCoordinationService,
    registry: Arc<AgentRegistry>,
    dispatcher: Arc<CmdDispatcher>,
    shutdown: watch::Sender<bool>,
}

impl Harness {
    fn new(config: DispatchConfig) -> Self {
        init_test_logging();
        let broker = Arc::new(MemoryBroker::default());
        let service = MemoryCoordinationService::new();
        let registry = Arc::new(AgentRegistry::new(
            broker.clone(),
            SchedulerConfig::default().agent_settings(),
        ));
        let dispatcher = Arc::new(CmdDispatcher::new(
            registry.clone(),
            DistributedLock::new(service.session(), ROOT),
            Arc::new(PriorityAdmissionQueue::new()),
            broker.clone(),
            config,
        ));

        let (shutdown, shutdown_rx) = watch::channel(false);
        dispatcher.spawn_agent_watch(shutdown_rx);

        Self {
            broker,
            service,
            registry,
            dispatcher,
            shutdown,
        }
    }

    /// Lock view from another server process.
    fn observer(&self) -> DistributedLock {
        DistributedLock::new(self.service.session(), ROOT)
    }

    async fn idle_agent(&self, name: &str, tags: &[&str]) -> Agent {
        let tags: BTreeSet<String> = tags.iter().map(|t| t.to_string()).collect();
        let agent = self.registry.create(name, tags, None).await.unwrap();
        self.registry.connect(&agent.token, init()).await.unwrap();
        self.registry.get(agent.id).await.unwrap()
    }

    async fn sent(&self, agent: &Agent) -> Vec<CmdIn> {
        self.broker
            .published(&agent.queue_name())
            .await
            .iter()
            .map(|body| serde_json::from_slice(body).unwrap())
            .collect()
    }
}

impl Drop for Harness {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}

fn init() -> AgentInit {
    AgentInit {
        url: None,
        os: Os::Linux,
        resource: None,
        k8s_cluster: false,
    }
}

fn request(build_number: u64, selector: Selector, timeout: u64) -> (DispatchRequest, ShellIn) {
    let cmd = ShellIn::new(FlowId::new(), JobId::new(), timeout).with_bash("make test");
    (DispatchRequest::new(build_number, selector, cmd.clone()), cmd)
}

#[tokio::test]
async fn test_concurrent_locks_single_winner() {
    let harness = Harness::new(fast());
    let store = Arc::new(MemoryAgentStore::new());
    let (_stop, stop_rx) = watch::channel(false);
    spawn_persistence(harness.registry.clone(), store.clone(), stop_rx);

    let agent = harness.idle_agent("a1", &[]).await;
    let locks: Vec<DistributedLock> = (0..5).map(|_| harness.observer()).collect();

    let results = join_all(locks.iter().map(|lock| lock.try_lock(agent.id))).await;
    assert_eq!(results.iter().filter(|won| **won).count(), 1);
    assert_eq!(results.iter().filter(|won| !**won).count(), 4);

    let winner = &locks[results.iter().position(|won| *won).unwrap()];
    let job = JobId::new();
    let busy = harness
        .registry
        .set_status(agent.id, AgentStatus::Busy, Some(job))
        .await
        .unwrap();
    assert_eq!(busy.status, AgentStatus::Busy);

    harness
        .registry
        .set_status(agent.id, AgentStatus::Idle, None)
        .await
        .unwrap();
    winner.release(agent.id).await;

    let other = harness.observer();
    assert!(other.try_lock(agent.id).await);

    let persisted = eventually(|| {
        let store = store.clone();
        async move {
            store
                .get(agent.id)
                .await
                .is_some_and(|a| a.status == AgentStatus::Idle && a.job_id.is_none())
        }
    })
    .await;
    assert!(persisted);
}

#[tokio::test]
async fn test_dispatch_round_trip() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("ios-1", &["ios", "test"]).await;
    let selector = Selector::new(["ios"]);
    let (request, cmd) = request(1, selector.clone(), 60);

    let dispatch = harness.dispatcher.dispatch(request).await.unwrap();
    let cmd_id = dispatch.cmd_id;
    assert_eq!(dispatch.agent_id, agent.id);

    let busy = harness.registry.get(agent.id).await.unwrap();
    assert_eq!(busy.status, AgentStatus::Busy);
    assert_eq!(busy.job_id, Some(cmd.job_id));
    assert_eq!(harness.sent(&agent).await, vec![CmdIn::Shell(cmd.clone())]);
    assert_eq!(
        harness.dispatcher.job_state(cmd.job_id).await,
        Some(DispatchState::Sent)
    );
    assert_eq!(harness.observer().is_locked(agent.id).await, Some(true));
    // The build stays admitted until its command ends.
    assert_eq!(
        harness
            .dispatcher
            .admission()
            .min_pending_build_number(&selector.id(), cmd.flow_id)
            .await,
        Some(1)
    );

    assert!(
        harness
            .dispatcher
            .on_shell_out(ShellOut::new(cmd_id, ExecStatus::Running))
            .await
    );
    let mut done = ShellOut::new(cmd_id, ExecStatus::Success);
    done.code = Some(0);
    assert!(harness.dispatcher.on_shell_out(done).await);

    let outcome = dispatch.wait().await.unwrap();
    assert_eq!(outcome.state, DispatchState::Completed);
    assert_eq!(outcome.result.as_ref().and_then(|out| out.code), Some(0));
    assert!(outcome.error().is_none());

    let idle = harness.registry.get(agent.id).await.unwrap();
    assert_eq!(idle.status, AgentStatus::Idle);
    assert_eq!(idle.job_id, None);
    assert_eq!(harness.observer().is_locked(agent.id).await, Some(false));
    assert_eq!(
        harness
            .dispatcher
            .admission()
            .min_pending_build_number(&selector.id(), cmd.flow_id)
            .await,
        None
    );

    // Late duplicates are unknown.
    assert!(
        !harness
            .dispatcher
            .on_shell_out(ShellOut::new(cmd_id, ExecStatus::Success))
            .await
    );
    assert_eq!(harness.sent(&agent).await.len(), 1);
}

#[tokio::test]
async fn test_agent_reported_failure() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("a1", &[]).await;
    let (request, _) = request(1, Selector::default(), 60);

    let dispatch = harness.dispatcher.dispatch(request).await.unwrap();
    let mut failed = ShellOut::new(dispatch.cmd_id, ExecStatus::Exception);
    failed.error = Some("exit 2".to_string());
    harness.dispatcher.on_shell_out(failed).await;

    let outcome = dispatch.wait().await.unwrap();
    assert_eq!(
        outcome.state,
        DispatchState::Failed(FailureReason::AgentReported {
            status: ExecStatus::Exception,
            error: Some("exit 2".to_string()),
        })
    );
    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().status,
        AgentStatus::Idle
    );
}

#[tokio::test]
async fn test_timeout_cleans_up_without_agent() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("a1", &[]).await;
    let (request, cmd) = request(1, Selector::default(), 1);

    let dispatch = harness.dispatcher.dispatch(request).await.unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(5), dispatch.wait())
        .await
        .unwrap()
        .unwrap();

    assert_eq!(outcome.state, DispatchState::TimedOut);
    assert!(matches!(outcome.error(), Some(Error::Timeout { seconds: 1, .. })));
    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().status,
        AgentStatus::Idle
    );
    assert_eq!(harness.observer().is_locked(agent.id).await, Some(false));
    assert_eq!(
        harness.sent(&agent).await,
        vec![CmdIn::Shell(cmd), CmdIn::Kill]
    );
    assert_eq!(harness.dispatcher.inflight_count().await, 0);
}

#[tokio::test]
async fn test_publish_failure_rolls_back() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("a1", &[]).await;
    let selector = Selector::default();
    let (request, cmd) = request(1, selector.clone(), 60);

    harness.broker.fail_publishes(true);
    let err = harness.dispatcher.dispatch(request).await.unwrap_err();
    assert!(matches!(err, Error::Transport(_)));
    assert!(err.is_retryable());

    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().status,
        AgentStatus::Idle
    );
    assert_eq!(harness.observer().is_locked(agent.id).await, Some(false));
    assert_eq!(harness.dispatcher.inflight_count().await, 0);
    assert_eq!(harness.dispatcher.job_state(cmd.job_id).await, None);
    assert!(
        harness
            .dispatcher
            .admission()
            .min_pending_build_number(&selector.id(), cmd.flow_id)
            .await
            .is_none()
    );
}

#[tokio::test]
async fn test_not_available_after_queue_timeout() {
    let harness = Harness::new(DispatchConfig {
        queue_timeout: Duration::from_millis(200),
        ..fast()
    });
    harness.idle_agent("android-1", &["android"]).await;
    let mut events = harness.dispatcher.subscribe();
    let (request, cmd) = request(1, Selector::new(["ios"]), 60);

    let err = harness.dispatcher.dispatch(request).await.unwrap_err();
    assert!(matches!(err, Error::NotAvailable { .. }));

    let DispatchEvent::NoIdleAgent { job_id, selector } = events.try_recv().unwrap();
    assert_eq!(job_id, cmd.job_id);
    assert_eq!(selector, Selector::new(["ios"]));
    // Announced once per attempt.
    assert!(events.try_recv().is_err());
}

#[tokio::test]
async fn test_cancel_while_waiting() {
    let harness = Harness::new(fast());
    let selector = Selector::new(["gpu"]);
    let (request, cmd) = request(1, selector.clone(), 60);

    let dispatcher = harness.dispatcher.clone();
    let task = tokio::spawn(async move { dispatcher.dispatch(request).await });

    let dispatcher = harness.dispatcher.clone();
    let job_id = cmd.job_id;
    assert!(
        eventually(|| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.job_state(job_id).await == Some(DispatchState::Selecting) }
        })
        .await
    );

    assert!(harness.dispatcher.cancel(cmd.job_id).await);
    let result = task.await.unwrap();
    assert!(matches!(result, Err(Error::Cancelled(_))));
    assert!(harness.dispatcher.admission().is_empty().await);
    assert!(!harness.dispatcher.cancel(cmd.job_id).await);
}

#[tokio::test]
async fn test_cancel_running_command() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("a1", &[]).await;
    let (request, cmd) = request(1, Selector::default(), 60);

    let dispatch = harness.dispatcher.dispatch(request).await.unwrap();
    assert!(harness.dispatcher.cancel(cmd.job_id).await);

    let outcome = dispatch.wait().await.unwrap();
    assert_eq!(outcome.state, DispatchState::Failed(FailureReason::Cancelled));
    assert!(matches!(outcome.error(), Some(Error::Cancelled(_))));
    assert_eq!(harness.sent(&agent).await.last(), Some(&CmdIn::Kill));
    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().status,
        AgentStatus::Idle
    );
    assert_eq!(harness.observer().is_locked(agent.id).await, Some(false));
}

#[tokio::test]
async fn test_agent_lost_mid_command() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("a1", &[]).await;
    let (request, _) = request(1, Selector::default(), 60);

    let dispatch = harness.dispatcher.dispatch(request).await.unwrap();
    harness.registry.disconnect(&agent.token).await.unwrap();

    let outcome = tokio::time::timeout(Duration::from_secs(5), dispatch.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, DispatchState::Failed(FailureReason::AgentLost));
    assert!(matches!(outcome.error(), Some(Error::AgentLost { .. })));

    let lost = harness.registry.get(agent.id).await.unwrap();
    assert_eq!(lost.status, AgentStatus::Offline);
    assert_eq!(lost.job_id, None);
    assert_eq!(harness.observer().is_locked(agent.id).await, Some(false));
}

#[tokio::test]
async fn test_older_build_of_flow_served_first() {
    let harness = Harness::new(fast());
    let selector = Selector::new(["linux"]);
    let flow = FlowId::new();
    let first = ShellIn::new(flow, JobId::new(), 60);
    let second = ShellIn::new(flow, JobId::new(), 60);

    let dispatcher = harness.dispatcher.clone();
    let req = DispatchRequest::new(2, selector.clone(), second.clone());
    let second_task = tokio::spawn(async move { dispatcher.dispatch(req).await });
    let dispatcher = harness.dispatcher.clone();
    let req = DispatchRequest::new(1, selector.clone(), first.clone());
    let first_task = tokio::spawn(async move { dispatcher.dispatch(req).await });

    let dispatcher = harness.dispatcher.clone();
    let selector_id = selector.id();
    let (a, b) = (first.job_id, second.job_id);
    assert!(
        eventually(|| {
            let dispatcher = dispatcher.clone();
            let selector_id = selector_id.clone();
            async move {
                dispatcher.job_state(a).await.is_some()
                    && dispatcher.job_state(b).await.is_some()
                    && dispatcher
                        .admission()
                        .min_pending_build_number(&selector_id, flow)
                        .await
                        == Some(1)
            }
        })
        .await
    );

    let agent = harness.idle_agent("linux-1", &["linux"]).await;
    let dispatch = first_task.await.unwrap().unwrap();
    assert_eq!(dispatch.agent_id, agent.id);
    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().job_id,
        Some(first.job_id)
    );
    assert!(!second_task.is_finished());

    harness
        .dispatcher
        .on_shell_out(ShellOut::new(dispatch.cmd_id, ExecStatus::Success))
        .await;
    let next = second_task.await.unwrap().unwrap();
    assert_eq!(next.agent_id, agent.id);
    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().job_id,
        Some(second.job_id)
    );
}

#[tokio::test]
async fn test_next_build_waits_for_running_build() {
    let harness = Harness::new(fast());
    let selector = Selector::default();
    let flow = FlowId::new();
    harness.idle_agent("a1", &[]).await;
    harness.idle_agent("a2", &[]).await;

    let first = ShellIn::new(flow, JobId::new(), 60);
    let second = ShellIn::new(flow, JobId::new(), 60);
    let dispatch = harness
        .dispatcher
        .dispatch(DispatchRequest::new(1, selector.clone(), first))
        .await
        .unwrap();

    let dispatcher = harness.dispatcher.clone();
    let req = DispatchRequest::new(2, selector.clone(), second.clone());
    let second_task = tokio::spawn(async move { dispatcher.dispatch(req).await });

    // An idle agent is free, but build 1 is still running.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(!second_task.is_finished());
    assert_eq!(
        harness.dispatcher.job_state(second.job_id).await,
        Some(DispatchState::Pending)
    );

    harness
        .dispatcher
        .on_shell_out(ShellOut::new(dispatch.cmd_id, ExecStatus::Success))
        .await;
    let next = second_task.await.unwrap().unwrap();
    assert_eq!(
        harness.dispatcher.job_state(second.job_id).await,
        Some(DispatchState::Sent)
    );
    assert_ne!(next.cmd_id, dispatch.cmd_id);
}

#[tokio::test]
async fn test_duplicate_dispatch_rejected() {
    let harness = Harness::new(fast());
    harness.idle_agent("a1", &[]).await;
    let cmd = ShellIn::new(FlowId::new(), JobId::new(), 60);

    let requests = (0..4).map(|_| {
        let dispatcher = harness.dispatcher.clone();
        let req = DispatchRequest::new(1, Selector::default(), cmd.clone());
        async move { dispatcher.dispatch(req).await }
    });
    let results = join_all(requests).await;

    assert_eq!(results.iter().filter(|r| r.is_ok()).count(), 1);
    assert!(
        results
            .iter()
            .filter_map(|r| r.as_ref().err())
            .all(|e| matches!(e, Error::Duplicate(_)))
    );
}

/// Broker whose publishes wait for a permit, holding dispatches in LOCKED.
struct GatedBroker {
    inner: MemoryBroker,
    gate: Semaphore,
}

#[async_trait]
impl MessageBroker for GatedBroker {
    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        self.inner.declare(spec).await
    }

    async fn publish(&self, queue: &str, body: &[u8], options: PublishOptions) -> bool {
        let Ok(permit) = self.gate.acquire().await else {
            return false;
        };
        permit.forget();
        self.inner.publish(queue, body, options).await
    }

    async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle> {
        self.inner.consume(queue, auto_ack, handler).await
    }

    async fn cancel(&self, handle: &ConsumerHandle) -> bool {
        self.inner.cancel(handle).await
    }

    async fn delete(&self, queue: &str) -> bool {
        self.inner.delete(queue).await
    }

    async fn purge(&self, queue: &str) -> bool {
        self.inner.purge(queue).await
    }

    async fn close(&self) {
        self.inner.close().await
    }
}

#[tokio::test]
async fn test_agent_lost_before_command_sent() {
    init_test_logging();
    let broker = Arc::new(GatedBroker {
        inner: MemoryBroker::default(),
        gate: Semaphore::new(0),
    });
    let service = MemoryCoordinationService::new();
    let registry = Arc::new(AgentRegistry::new(
        broker.clone(),
        SchedulerConfig::default().agent_settings(),
    ));
    let dispatcher = Arc::new(CmdDispatcher::new(
        registry.clone(),
        DistributedLock::new(service.session(), ROOT),
        Arc::new(PriorityAdmissionQueue::new()),
        broker.clone(),
        fast(),
    ));
    let (_stop, stop_rx) = watch::channel(false);
    dispatcher.spawn_agent_watch(stop_rx);

    let agent = registry.create("a1", BTreeSet::new(), None).await.unwrap();
    registry.connect(&agent.token, init()).await.unwrap();

    let (request, cmd) = request(1, Selector::default(), 60);
    let task = {
        let dispatcher = dispatcher.clone();
        tokio::spawn(async move { dispatcher.dispatch(request).await })
    };

    let job_id = cmd.job_id;
    assert!(
        eventually(|| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.job_state(job_id).await == Some(DispatchState::Locked) }
        })
        .await
    );

    registry.disconnect(&agent.token).await.unwrap();
    assert!(
        eventually(|| {
            let dispatcher = dispatcher.clone();
            async move { dispatcher.inflight_count().await == 0 }
        })
        .await
    );

    broker.gate.add_permits(1);
    let dispatch = task.await.unwrap().unwrap();
    let outcome = tokio::time::timeout(Duration::from_secs(1), dispatch.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, DispatchState::Failed(FailureReason::AgentLost));

    assert_eq!(
        registry.get(agent.id).await.unwrap().status,
        AgentStatus::Offline
    );
    assert_eq!(
        DistributedLock::new(service.session(), ROOT)
            .is_locked(agent.id)
            .await,
        Some(false)
    );
    assert!(dispatcher.admission().is_empty().await);
}

#[tokio::test]
async fn test_callback_queue_drives_completion() {
    let harness = Harness::new(fast());
    let agent = harness.idle_agent("a1", &[]).await;
    let queues = SchedulerConfig::default().queue_settings();

    let router = Arc::new(CallbackRouter::new(harness.dispatcher.clone()));
    let mut logs = router.subscribe_shell_logs();
    router.start(harness.broker.as_ref(), &queues).await.unwrap();

    let (request, _) = request(1, Selector::default(), 60);
    let dispatch = harness.dispatcher.dispatch(request).await.unwrap();
    let cmd_id = dispatch.cmd_id;

    let line = LogLine {
        cmd_id,
        stream: LogStream::Stdout,
        number: 1,
        content: "ok # done".to_string(),
    };
    assert!(
        harness
            .broker
            .publish(&queues.shell_log, line.to_string().as_bytes(), PublishOptions::default())
            .await
    );
    let frame = CmdOut::Shell(ShellOut::new(cmd_id, ExecStatus::Success))
        .encode()
        .unwrap();
    assert!(
        harness
            .broker
            .publish(&queues.callback, &frame, PublishOptions::default())
            .await
    );

    let outcome = tokio::time::timeout(Duration::from_secs(5), dispatch.wait())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(outcome.state, DispatchState::Completed);
    assert_eq!(
        harness.registry.get(agent.id).await.unwrap().status,
        AgentStatus::Idle
    );

    let received = tokio::time::timeout(Duration::from_secs(5), logs.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(received, line);
}

struct NoopProvisioner;

#[async_trait]
impl HostProvisioner for NoopProvisioner {
    async fn start(&self, _host: &AgentHost, _agent: &Agent) -> Result<()> {
        Ok(())
    }

    async fn stop(&self, _host: &AgentHost, _agent: &Agent) -> Result<()> {
        Ok(())
    }

    async fn remove(&self, _host: &AgentHost, _agent: &Agent) -> Result<()> {
        Ok(())
    }
}

#[tokio::test]
async fn test_host_scales_up_for_waiting_job() {
    let harness = Harness::new(fast());
    let mut host = AgentHost::new(
        "k8s",
        HostKind::K8s {
            namespace: "ci".to_string(),
            url: "https://k8s.internal".to_string(),
        },
    );
    host.tags = ["linux".to_string()].into_iter().collect();
    let host = harness.registry.add_host(host).await.unwrap();

    let manager = Arc::new(HostManager::new(
        harness.registry.clone(),
        Arc::new(NoopProvisioner),
    ));
    let (_stop, stop_rx) = watch::channel(false);
    manager.spawn(harness.dispatcher.subscribe(), stop_rx);

    let (request, _) = request(1, Selector::new(["linux"]), 60);
    let dispatcher = harness.dispatcher.clone();
    let task = tokio::spawn(async move { dispatcher.dispatch(request).await });

    let registry = harness.registry.clone();
    assert!(
        eventually(|| {
            let registry = registry.clone();
            async move {
                registry
                    .host_agents(host.id)
                    .await
                    .iter()
                    .any(|a| a.status == AgentStatus::Starting)
            }
        })
        .await
    );

    let started = harness.registry.host_agents(host.id).await.remove(0);
    harness.registry.connect(&started.token, init()).await.unwrap();

    let dispatch = task.await.unwrap().unwrap();
    assert_eq!(dispatch.agent_id, started.id);
}
