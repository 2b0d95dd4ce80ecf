//! In-process adapters for the broker, coordination and storage ports.
//!
//! Used by single-node deployments and throughout the tests.

use async_trait::async_trait;
use ferry_core::agent::Agent;
use ferry_core::ids::AgentId;
use ferry_core::ports::{
    AgentStore, ConsumerHandle, Coordinator, Delivery, MessageBroker, MessageHandler,
};
use ferry_core::queues::{PublishOptions, QueueSpec};
use ferry_core::{Error, Result};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};
use uuid::Uuid;

const IDLE_POLL: Duration = Duration::from_millis(10);

#[derive(Debug, Clone)]
struct Message {
    seq: u64,
    body: Vec<u8>,
    priority: Option<u8>,
    expires_at: Option<Instant>,
    deliveries: u32,
}

#[derive(Debug)]
struct Queue {
    spec: QueueSpec,
    messages: Vec<Message>,
}

impl Queue {
    /// Highest priority first, then oldest.
    fn pop(&mut self) -> Option<Message> {
        let index = self
            .messages
            .iter()
            .enumerate()
            .max_by(|(_, a), (_, b)| {
                let pa = self.effective_priority(a);
                let pb = self.effective_priority(b);
                pa.cmp(&pb).then(b.seq.cmp(&a.seq))
            })
            .map(|(index, _)| index)?;
        Some(self.messages.remove(index))
    }

    fn effective_priority(&self, message: &Message) -> u8 {
        match self.spec.max_priority {
            Some(max) => message.priority.unwrap_or(0).min(max),
            None => 0,
        }
    }
}

#[derive(Default)]
struct BrokerState {
    queues: HashMap<String, Queue>,
    /// Every body published per queue, for assertions in tests.
    #[cfg(any(test, feature = "testing"))]
    history: Vec<(String, Vec<u8>)>,
}

impl BrokerState {
    #[cfg(any(test, feature = "testing"))]
    fn forget(&mut self, queue: &str) {
        self.history.retain(|(name, _)| name != queue);
    }

    #[cfg(not(any(test, feature = "testing")))]
    fn forget(&mut self, _queue: &str) {}
}

struct Shared {
    state: Mutex<BrokerState>,
    seq: AtomicU64,
    notify: Notify,
    max_deliver: u32,
}

impl Shared {
    async fn push(&self, queue: &str, body: Vec<u8>, priority: Option<u8>, ttl: Option<Duration>) -> bool {
        let mut state = self.state.lock().await;
        let Some(target) = state.queues.get_mut(queue) else {
            return false;
        };

        #[cfg(any(test, feature = "testing"))]
        let recorded = body.clone();

        target.messages.push(Message {
            seq: self.seq.fetch_add(1, Ordering::Relaxed),
            body,
            priority,
            expires_at: ttl.map(|ttl| Instant::now() + ttl),
            deliveries: 0,
        });
        #[cfg(any(test, feature = "testing"))]
        state.history.push((queue.to_string(), recorded));
        drop(state);

        self.notify.notify_waiters();
        true
    }

    /// Next live message, moving expired ones to the dead-letter queue.
    async fn next(&self, queue: &str) -> Option<Message> {
        let mut state = self.state.lock().await;
        loop {
            let target = state.queues.get_mut(queue)?;
            let mut message = target.pop()?;

            if message.expires_at.is_some_and(|at| Instant::now() > at) {
                let dead_letter = target.spec.dead_letter.as_ref().map(|dl| dl.address());
                if let Some(dl) = dead_letter.and_then(|dl| state.queues.get_mut(&dl)) {
                    message.expires_at = None;
                    message.deliveries = 0;
                    dl.messages.push(message);
                }
                continue;
            }

            message.deliveries += 1;
            return Some(message);
        }
    }

    async fn settle(&self, queue: &str, message: Message, handled: bool) {
        if handled {
            return;
        }

        let mut state = self.state.lock().await;
        let Some(target) = state.queues.get_mut(queue) else {
            return;
        };

        if message.deliveries >= self.max_deliver {
            let dead_letter = target.spec.dead_letter.as_ref().map(|dl| dl.address());
            if let Some(dl) = dead_letter.and_then(|dl| state.queues.get_mut(&dl)) {
                dl.messages.push(Message {
                    deliveries: 0,
                    ..message
                });
            } else {
                debug!(queue, "Dropping rejected message");
            }
        } else {
            target.messages.push(message);
        }
        drop(state);

        self.notify.notify_waiters();
    }
}

struct ConsumerTask {
    queue: String,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
    permits: Arc<Semaphore>,
}

/// Broker keeping queues in memory, with priority ordering, TTL,
/// dead-lettering and bounded consumers.
pub struct MemoryBroker {
    shared: Arc<Shared>,
    consumers: Mutex<HashMap<String, ConsumerTask>>,
    prefetch: usize,
    fail_publish: AtomicBool,
    closed: AtomicBool,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(4, 3)
    }
}

impl MemoryBroker {
    pub fn new(prefetch: usize, max_deliver: u32) -> Self {
        Self {
            shared: Arc::new(Shared {
                state: Mutex::new(BrokerState::default()),
                seq: AtomicU64::new(0),
                notify: Notify::new(),
                max_deliver: max_deliver.max(1),
            }),
            consumers: Mutex::new(HashMap::new()),
            prefetch: prefetch.max(1),
            fail_publish: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// Make every following publish fail, as a broken connection would.
    pub fn fail_publishes(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    /// Bodies published to `queue` since it was last purged, oldest first.
    #[cfg(any(test, feature = "testing"))]
    pub async fn published(&self, queue: &str) -> Vec<Vec<u8>> {
        self.shared
            .state
            .lock()
            .await
            .history
            .iter()
            .filter(|(name, _)| name == queue)
            .map(|(_, body)| body.clone())
            .collect()
    }

    /// Messages waiting in `queue`.
    pub async fn depth(&self, queue: &str) -> usize {
        self.shared
            .state
            .lock()
            .await
            .queues
            .get(queue)
            .map(|q| q.messages.len())
            .unwrap_or(0)
    }

    pub async fn is_declared(&self, queue: &str) -> bool {
        self.shared.state.lock().await.queues.contains_key(queue)
    }

    async fn stop_consumer(task: ConsumerTask, prefetch: usize) {
        let _ = task.stop.send(true);
        let _ = task.join.await;
        let _ = task.permits.acquire_many(prefetch as u32).await;
        debug!(queue = %task.queue, "Consumer cancelled");
    }
}

async fn consume_loop(
    shared: Arc<Shared>,
    queue: String,
    auto_ack: bool,
    handler: Arc<dyn MessageHandler>,
    permits: Arc<Semaphore>,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        if *stop.borrow() {
            break;
        }

        let permit = tokio::select! {
            permit = permits.clone().acquire_owned() => match permit {
                Ok(permit) => permit,
                Err(_) => break,
            },
            _ = stop.changed() => continue,
        };

        let Some(message) = shared.next(&queue).await else {
            drop(permit);
            tokio::select! {
                _ = shared.notify.notified() => {}
                _ = tokio::time::sleep(IDLE_POLL) => {}
                _ = stop.changed() => {}
            }
            continue;
        };

        let shared = shared.clone();
        let handler = handler.clone();
        let queue = queue.clone();
        tokio::spawn(async move {
            let delivery = Delivery {
                queue: queue.clone(),
                body: message.body.clone(),
                priority: message.priority,
                redelivered: message.deliveries > 1,
            };
            let handled = handler.handle(delivery).await;
            shared.settle(&queue, message, auto_ack || handled).await;
            drop(permit);
        });
    }
}

#[async_trait]
impl MessageBroker for MemoryBroker {
    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let mut state = self.shared.state.lock().await;
        state
            .queues
            .entry(spec.name.clone())
            .or_insert_with(|| Queue {
                spec: spec.clone(),
                messages: Vec::new(),
            });
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], options: PublishOptions) -> bool {
        if self.closed.load(Ordering::SeqCst) || self.fail_publish.load(Ordering::SeqCst) {
            warn!(queue, "Publish failed");
            return false;
        }
        self.shared
            .push(queue, body.to_vec(), options.priority, options.ttl)
            .await
    }

    async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle> {
        if !self.is_declared(queue).await {
            return Err(Error::Transport(format!("Queue {} is not declared", queue)));
        }

        let permits = Arc::new(Semaphore::new(self.prefetch));
        let (stop, stop_rx) = watch::channel(false);
        let join = tokio::spawn(consume_loop(
            self.shared.clone(),
            queue.to_string(),
            auto_ack,
            handler,
            permits.clone(),
            stop_rx,
        ));

        let tag = Uuid::new_v4().to_string();
        self.consumers.lock().await.insert(
            tag.clone(),
            ConsumerTask {
                queue: queue.to_string(),
                stop,
                join,
                permits,
            },
        );

        Ok(ConsumerHandle {
            queue: queue.to_string(),
            tag,
        })
    }

    async fn cancel(&self, handle: &ConsumerHandle) -> bool {
        let Some(task) = self.consumers.lock().await.remove(&handle.tag) else {
            return false;
        };
        Self::stop_consumer(task, self.prefetch).await;
        true
    }

    async fn delete(&self, queue: &str) -> bool {
        let tasks: Vec<ConsumerTask> = {
            let mut consumers = self.consumers.lock().await;
            let tags: Vec<String> = consumers
                .iter()
                .filter(|(_, task)| task.queue == queue)
                .map(|(tag, _)| tag.clone())
                .collect();
            tags.iter().filter_map(|tag| consumers.remove(tag)).collect()
        };
        for task in tasks {
            Self::stop_consumer(task, self.prefetch).await;
        }

        let mut state = self.shared.state.lock().await;
        state.forget(queue);
        state.queues.remove(queue).is_some()
    }

    async fn purge(&self, queue: &str) -> bool {
        let mut state = self.shared.state.lock().await;
        let purged = match state.queues.get_mut(queue) {
            Some(target) => {
                target.messages.clear();
                true
            }
            None => false,
        };
        state.forget(queue);
        purged
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let tasks: Vec<ConsumerTask> = self.consumers.lock().await.drain().map(|(_, t)| t).collect();
        for task in tasks {
            Self::stop_consumer(task, self.prefetch).await;
        }
    }
}

/// Node tree shared by every [`MemorySession`] of one service.
#[derive(Default)]
pub struct MemoryCoordinationService {
    nodes: Arc<Mutex<HashMap<String, String>>>,
}

impl MemoryCoordinationService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new session, as a separate server process would.
    pub fn session(&self) -> Arc<MemorySession> {
        Arc::new(MemorySession {
            id: Uuid::new_v4().to_string(),
            nodes: self.nodes.clone(),
            alive: AtomicBool::new(true),
        })
    }
}

pub struct MemorySession {
    id: String,
    nodes: Arc<Mutex<HashMap<String, String>>>,
    alive: AtomicBool,
}

fn normalize(path: &str) -> String {
    path.trim_matches('/').to_string()
}

impl MemorySession {
    /// Simulate the session dying: every node it owns disappears.
    pub async fn expire(&self) {
        self.alive.store(false, Ordering::SeqCst);
        self.nodes.lock().await.retain(|_, owner| owner != &self.id);
    }

    fn check_alive(&self) -> Result<()> {
        if self.alive.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(Error::Coordination(format!("session {} expired", self.id)))
        }
    }
}

#[async_trait]
impl Coordinator for MemorySession {
    async fn create_ephemeral(&self, path: &str) -> Result<bool> {
        self.check_alive()?;
        let mut nodes = self.nodes.lock().await;
        let path = normalize(path);
        if nodes.contains_key(&path) {
            return Ok(false);
        }
        nodes.insert(path, self.id.clone());
        Ok(true)
    }

    async fn delete_owned(&self, path: &str) -> Result<bool> {
        self.check_alive()?;
        let mut nodes = self.nodes.lock().await;
        let path = normalize(path);
        if nodes.get(&path) == Some(&self.id) {
            nodes.remove(&path);
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        self.check_alive()?;
        Ok(self.nodes.lock().await.contains_key(&normalize(path)))
    }

    async fn children(&self, root: &str) -> Result<Vec<String>> {
        self.check_alive()?;
        let prefix = format!("{}/", normalize(root));
        let mut children: Vec<String> = self
            .nodes
            .lock()
            .await
            .keys()
            .filter_map(|key| key.strip_prefix(&prefix))
            .filter(|rest| !rest.contains('/'))
            .map(str::to_string)
            .collect();
        children.sort();
        Ok(children)
    }

    fn session_id(&self) -> String {
        self.id.clone()
    }

    async fn close(&self) {
        self.expire().await;
    }
}

/// Agent store backed by a map.
#[derive(Default)]
pub struct MemoryAgentStore {
    agents: Mutex<HashMap<AgentId, Agent>>,
}

impl MemoryAgentStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn get(&self, id: AgentId) -> Option<Agent> {
        self.agents.lock().await.get(&id).cloned()
    }
}

#[async_trait]
impl AgentStore for MemoryAgentStore {
    async fn save(&self, agent: &Agent) -> Result<()> {
        self.agents.lock().await.insert(agent.id, agent.clone());
        Ok(())
    }

    async fn delete(&self, id: AgentId) -> Result<()> {
        self.agents.lock().await.remove(&id);
        Ok(())
    }

    async fn load_all(&self) -> Result<Vec<Agent>> {
        Ok(self.agents.lock().await.values().cloned().collect())
    }
}
