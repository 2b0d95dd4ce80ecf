//! JetStream-backed message broker.
//!
//! Every queue is a work-queue stream. Priorities are mapped onto a small
//! number of bands, one subject and one durable pull consumer per band, and
//! consumers always drain the highest band first. Message TTL travels in a
//! header and is enforced when the message is pulled: expired messages are
//! moved to the queue's dead-letter address instead of being handled.

use async_nats::HeaderMap;
use async_nats::jetstream::{
    self, AckKind,
    consumer::{AckPolicy, PullConsumer, pull::Config as ConsumerConfig},
    stream::{Config as StreamConfig, RetentionPolicy, StorageType},
};
use async_trait::async_trait;
use bytes::Bytes;
use chrono::Utc;
use ferry_core::ports::{ConsumerHandle, Delivery, MessageBroker, MessageHandler};
use ferry_core::queues::{PublishOptions, QueueSpec};
use ferry_core::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, OwnedSemaphorePermit, RwLock, Semaphore, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::NatsConfig;
use crate::connection;
use crate::health::HealthCheck;
use crate::metrics::{LatencyTimer, NatsMetrics};

pub const PRIORITY_HEADER: &str = "Ferry-Priority";
pub const EXPIRES_AT_HEADER: &str = "Ferry-Expires-At";
pub const DEAD_LETTER_FROM_HEADER: &str = "Ferry-Dead-Letter-From";
pub const DEAD_LETTER_REASON_HEADER: &str = "Ferry-Dead-Letter-Reason";

const META_MAX_PRIORITY: &str = "ferry.max_priority";
const META_DEAD_LETTER: &str = "ferry.dead_letter";

/// How a queue maps onto its stream.
#[derive(Debug, Clone, PartialEq, Eq)]
struct QueueLayout {
    stream: String,
    bands: u8,
    max_priority: Option<u8>,
    dead_letter: Option<String>,
}

impl QueueLayout {
    fn for_spec(spec: &QueueSpec, prefix: &str, max_bands: u8) -> Self {
        let bands = match spec.max_priority {
            Some(max) => (max as u16 + 1).min(max_bands.max(1) as u16) as u8,
            None => 1,
        };

        Self {
            stream: stream_name(prefix, &spec.name),
            bands,
            max_priority: spec.max_priority,
            dead_letter: spec.dead_letter.as_ref().map(|dl| dl.address()),
        }
    }

    fn from_stream(config: &StreamConfig) -> Self {
        Self {
            stream: config.name.clone(),
            bands: config.subjects.len().clamp(1, u8::MAX as usize) as u8,
            max_priority: config
                .metadata
                .get(META_MAX_PRIORITY)
                .and_then(|v| v.parse().ok()),
            dead_letter: config.metadata.get(META_DEAD_LETTER).cloned(),
        }
    }

    fn band_for(&self, priority: Option<u8>) -> u8 {
        let (Some(max), Some(priority)) = (self.max_priority, priority) else {
            return 0;
        };
        let priority = priority.min(max) as u32;
        ((priority * self.bands as u32) / (max as u32 + 1)) as u8
    }

    fn metadata(&self) -> HashMap<String, String> {
        let mut metadata = HashMap::new();
        if let Some(max) = self.max_priority {
            metadata.insert(META_MAX_PRIORITY.to_string(), max.to_string());
        }
        if let Some(dl) = &self.dead_letter {
            metadata.insert(META_DEAD_LETTER.to_string(), dl.clone());
        }
        metadata
    }
}

fn stream_name(prefix: &str, queue: &str) -> String {
    let sanitized: String = queue
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' {
                c
            } else {
                '_'
            }
        })
        .collect();
    format!("{}_{}", prefix, sanitized)
}

fn band_subject(queue: &str, band: u8) -> String {
    format!("{}.p{}", queue, band)
}

fn header<T: std::str::FromStr>(headers: Option<&HeaderMap>, name: &str) -> Option<T> {
    headers?.get(name)?.as_str().parse().ok()
}

/// Publishes raw payloads and keeps the publish counters.
#[derive(Clone)]
struct Publisher {
    jetstream: jetstream::Context,
    metrics: Arc<NatsMetrics>,
}

impl Publisher {
    async fn send(&self, subject: String, headers: HeaderMap, body: Bytes) -> bool {
        let timer = LatencyTimer::start();
        let len = body.len() as u64;

        let ack = match self
            .jetstream
            .publish_with_headers(subject.clone(), headers, body)
            .await
        {
            Ok(ack) => ack,
            Err(e) => {
                self.metrics.record_publish_failure();
                warn!(subject = %subject, "Failed to publish: {}", e);
                return false;
            }
        };

        match ack.await {
            Ok(_) => {
                self.metrics.record_publish(len);
                debug!(subject = %subject, latency_ms = timer.elapsed_ms(), "Published");
                true
            }
            Err(e) => {
                self.metrics.record_publish_failure();
                warn!(subject = %subject, "Failed to confirm publish: {}", e);
                false
            }
        }
    }
}

/// A running consumer.
struct ConsumerTask {
    queue: String,
    stop: watch::Sender<bool>,
    join: JoinHandle<()>,
    permits: Arc<Semaphore>,
}

/// Pull loop of one consumer: polls bands from highest to lowest and hands
/// messages to the handler on a pool of `prefetch` permits.
struct Worker {
    queue: String,
    auto_ack: bool,
    handler: Arc<dyn MessageHandler>,
    bands: Vec<PullConsumer>,
    dead_letter: Option<String>,
    permits: Arc<Semaphore>,
    publisher: Publisher,
    max_deliver: i64,
    idle_poll: Duration,
}

impl Worker {
    async fn run(self: Arc<Self>, mut stop: watch::Receiver<bool>) {
        debug!(queue = %self.queue, "Consumer loop started");

        loop {
            if *stop.borrow() {
                break;
            }

            if self.permits.available_permits() == 0 {
                tokio::select! {
                    permit = self.permits.clone().acquire_owned() => match permit {
                        Ok(permit) => drop(permit),
                        Err(_) => break,
                    },
                    _ = stop.changed() => {}
                }
                continue;
            }

            let mut pulled = 0usize;
            for consumer in self.bands.iter().rev() {
                let free = self.permits.available_permits();
                if free == 0 {
                    break;
                }

                let mut batch = match consumer.fetch().max_messages(free).messages().await {
                    Ok(batch) => batch,
                    Err(e) => {
                        warn!(queue = %self.queue, "Failed to fetch messages: {}", e);
                        continue;
                    }
                };

                while let Some(message) = batch.next().await {
                    let message = match message {
                        Ok(message) => message,
                        Err(e) => {
                            warn!(queue = %self.queue, "Failed to receive message: {}", e);
                            continue;
                        }
                    };

                    let Ok(permit) = self.permits.clone().acquire_owned().await else {
                        return;
                    };
                    pulled += 1;
                    tokio::spawn(self.clone().process(message, permit));
                }

                // Higher bands are re-checked before touching lower ones again.
                if pulled > 0 {
                    break;
                }
            }

            if pulled == 0 {
                tokio::select! {
                    _ = tokio::time::sleep(self.idle_poll) => {}
                    _ = stop.changed() => {}
                }
            }
        }

        debug!(queue = %self.queue, "Consumer loop stopped");
    }

    async fn process(self: Arc<Self>, message: jetstream::Message, _permit: OwnedSemaphorePermit) {
        let delivered = message.info().map(|info| info.delivered).unwrap_or(1);
        let headers = message.headers.as_ref();
        let priority = header::<u8>(headers, PRIORITY_HEADER);
        let expires_at = header::<i64>(headers, EXPIRES_AT_HEADER);
        let body = message.payload.clone();

        self.publisher.metrics.record_receive(body.len() as u64);

        if expires_at.is_some_and(|at| Utc::now().timestamp_millis() > at) {
            self.dead_letter(body, "expired").await;
            ack(&message, AckKind::Ack).await;
            return;
        }

        if self.auto_ack {
            ack(&message, AckKind::Ack).await;
        }

        let handled = self
            .handler
            .handle(Delivery {
                queue: self.queue.clone(),
                body: body.to_vec(),
                priority,
                redelivered: delivered > 1,
            })
            .await;

        if self.auto_ack {
            return;
        }

        if handled {
            ack(&message, AckKind::Ack).await;
        } else if self.max_deliver > 0 && delivered >= self.max_deliver {
            let moved = self.dead_letter(body, "rejected").await;
            ack(&message, if moved { AckKind::Ack } else { AckKind::Term }).await;
        } else {
            self.publisher.metrics.record_requeue();
            ack(&message, AckKind::Nak(None)).await;
        }
    }

    async fn dead_letter(&self, body: Bytes, reason: &str) -> bool {
        let Some(address) = &self.dead_letter else {
            debug!(queue = %self.queue, reason, "Dropping message without dead-letter route");
            return false;
        };

        let mut headers = HeaderMap::new();
        headers.insert(DEAD_LETTER_FROM_HEADER, self.queue.as_str());
        headers.insert(DEAD_LETTER_REASON_HEADER, reason);

        let sent = self
            .publisher
            .send(band_subject(address, 0), headers, body)
            .await;
        if sent {
            self.publisher.metrics.record_dead_letter();
            warn!(queue = %self.queue, dead_letter = %address, reason, "Message dead-lettered");
        }
        sent
    }
}

async fn ack(message: &jetstream::Message, kind: AckKind) {
    if let Err(e) = message.ack_with(kind).await {
        warn!("Failed to acknowledge message: {}", e);
    }
}

/// Message broker over NATS JetStream.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    config: NatsConfig,
    metrics: Arc<NatsMetrics>,
    layouts: RwLock<HashMap<String, QueueLayout>>,
    consumers: Mutex<HashMap<String, ConsumerTask>>,
    shutdown: AtomicBool,
}

impl NatsBroker {
    /// Connect with custom configuration.
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let metrics = NatsMetrics::new();
        let client = connection::connect(&config, &metrics).await?;
        Ok(Self::with_client(client, config, metrics))
    }

    /// Build on an existing connection.
    pub fn with_client(
        client: async_nats::Client,
        config: NatsConfig,
        metrics: Arc<NatsMetrics>,
    ) -> Self {
        let jetstream = jetstream::new(client.clone());
        Self {
            client,
            jetstream,
            config,
            metrics,
            layouts: RwLock::new(HashMap::new()),
            consumers: Mutex::new(HashMap::new()),
            shutdown: AtomicBool::new(false),
        }
    }

    /// Get metrics.
    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    /// Check connection health.
    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(&self.metrics, connection::is_connected(&self.client))
    }

    /// Check if shutdown was requested.
    pub fn is_shutdown(&self) -> bool {
        self.shutdown.load(Ordering::SeqCst)
    }

    fn publisher(&self) -> Publisher {
        Publisher {
            jetstream: self.jetstream.clone(),
            metrics: self.metrics.clone(),
        }
    }

    /// Layout of a queue, read from the stream when another process declared it.
    async fn layout(&self, queue: &str) -> Option<QueueLayout> {
        if let Some(layout) = self.layouts.read().await.get(queue) {
            return Some(layout.clone());
        }

        let stream = self
            .jetstream
            .get_stream(stream_name(&self.config.stream_prefix, queue))
            .await
            .ok()?;
        let layout = QueueLayout::from_stream(&stream.cached_info().config);

        self.layouts
            .write()
            .await
            .insert(queue.to_string(), layout.clone());
        Some(layout)
    }

    async fn band_consumers(&self, queue: &str, layout: &QueueLayout) -> Result<Vec<PullConsumer>> {
        let stream = self
            .jetstream
            .get_stream(&layout.stream)
            .await
            .map_err(|e| Error::Transport(format!("Failed to get stream {}: {}", layout.stream, e)))?;

        let mut consumers = Vec::with_capacity(layout.bands as usize);
        for band in 0..layout.bands {
            let name = format!("{}_P{}", layout.stream, band);
            let consumer = stream
                .get_or_create_consumer(
                    &name,
                    ConsumerConfig {
                        durable_name: Some(name.clone()),
                        filter_subject: band_subject(queue, band),
                        ack_policy: AckPolicy::Explicit,
                        ack_wait: self.config.ack_wait,
                        max_ack_pending: self.config.prefetch as i64,
                        ..Default::default()
                    },
                )
                .await
                .map_err(|e| Error::Transport(format!("Failed to create consumer {}: {}", name, e)))?;
            consumers.push(consumer);
        }

        Ok(consumers)
    }

    async fn stop_consumer(&self, tag: &str, task: ConsumerTask) {
        let _ = task.stop.send(true);
        if let Err(e) = task.join.await {
            error!(queue = %task.queue, "Consumer loop panicked: {}", e);
        }

        // Wait for in-flight handlers by taking every permit back.
        let prefetch = self.config.prefetch as u32;
        match tokio::time::timeout(self.config.drain_timeout, task.permits.acquire_many(prefetch)).await {
            Ok(_) => debug!(queue = %task.queue, consumer = tag, "Consumer drained"),
            Err(_) => warn!(
                queue = %task.queue,
                consumer = tag,
                "Timed out waiting for in-flight handlers"
            ),
        }

        self.metrics.consumer_stopped();
        info!(queue = %task.queue, consumer = tag, "Consumer cancelled");
    }
}

#[async_trait]
impl MessageBroker for NatsBroker {
    async fn declare(&self, spec: &QueueSpec) -> Result<()> {
        let layout = QueueLayout::for_spec(spec, &self.config.stream_prefix, self.config.priority_bands);

        let stream_config = StreamConfig {
            name: layout.stream.clone(),
            subjects: (0..layout.bands).map(|b| band_subject(&spec.name, b)).collect(),
            retention: RetentionPolicy::WorkQueue,
            storage: if spec.durable {
                StorageType::File
            } else {
                StorageType::Memory
            },
            max_age: self.config.max_age,
            metadata: layout.metadata(),
            ..Default::default()
        };

        self.jetstream
            .get_or_create_stream(stream_config)
            .await
            .map_err(|e| Error::Transport(format!("Failed to declare queue {}: {}", spec.name, e)))?;

        info!(
            queue = %spec.name,
            stream = %layout.stream,
            bands = layout.bands,
            "Queue declared"
        );
        self.layouts.write().await.insert(spec.name.clone(), layout);
        Ok(())
    }

    async fn publish(&self, queue: &str, body: &[u8], options: PublishOptions) -> bool {
        if self.is_shutdown() {
            warn!(queue, "Cannot publish: shutdown in progress");
            return false;
        }

        let Some(layout) = self.layout(queue).await else {
            self.metrics.record_publish_failure();
            warn!(queue, "Cannot publish to undeclared queue");
            return false;
        };

        let mut headers = HeaderMap::new();
        if let Some(priority) = options.priority {
            headers.insert(PRIORITY_HEADER, priority.to_string().as_str());
        }
        if let Some(ttl) = options.ttl {
            let expires_at = Utc::now().timestamp_millis() + ttl.as_millis() as i64;
            headers.insert(EXPIRES_AT_HEADER, expires_at.to_string().as_str());
        }

        let subject = band_subject(queue, layout.band_for(options.priority));
        self.publisher()
            .send(subject, headers, Bytes::copy_from_slice(body))
            .await
    }

    async fn consume(
        &self,
        queue: &str,
        auto_ack: bool,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerHandle> {
        if self.is_shutdown() {
            return Err(Error::Transport("Cannot consume: shutdown in progress".to_string()));
        }

        let layout = self
            .layout(queue)
            .await
            .ok_or_else(|| Error::Transport(format!("Queue {} is not declared", queue)))?;
        let bands = self.band_consumers(queue, &layout).await?;

        let permits = Arc::new(Semaphore::new(self.config.prefetch));
        let worker = Arc::new(Worker {
            queue: queue.to_string(),
            auto_ack,
            handler,
            bands,
            dead_letter: layout.dead_letter.clone(),
            permits: permits.clone(),
            publisher: self.publisher(),
            max_deliver: self.config.max_deliver,
            idle_poll: self.config.idle_poll,
        });

        let (stop, stop_rx) = watch::channel(false);
        let join = tokio::spawn(worker.run(stop_rx));

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
        self.metrics.consumer_started();

        info!(queue, consumer = %tag, prefetch = self.config.prefetch, "Consumer started");
        Ok(ConsumerHandle {
            queue: queue.to_string(),
            tag,
        })
    }

    async fn cancel(&self, handle: &ConsumerHandle) -> bool {
        let Some(task) = self.consumers.lock().await.remove(&handle.tag) else {
            return false;
        };
        self.stop_consumer(&handle.tag, task).await;
        true
    }

    async fn delete(&self, queue: &str) -> bool {
        let tags: Vec<String> = self
            .consumers
            .lock()
            .await
            .iter()
            .filter(|(_, task)| task.queue == queue)
            .map(|(tag, _)| tag.clone())
            .collect();
        for tag in tags {
            let handle = ConsumerHandle {
                queue: queue.to_string(),
                tag,
            };
            self.cancel(&handle).await;
        }

        self.layouts.write().await.remove(queue);
        match self
            .jetstream
            .delete_stream(stream_name(&self.config.stream_prefix, queue))
            .await
        {
            Ok(_) => {
                info!(queue, "Queue deleted");
                true
            }
            Err(e) => {
                warn!(queue, "Failed to delete queue: {}", e);
                false
            }
        }
    }

    async fn purge(&self, queue: &str) -> bool {
        let stream = match self
            .jetstream
            .get_stream(stream_name(&self.config.stream_prefix, queue))
            .await
        {
            Ok(stream) => stream,
            Err(e) => {
                warn!(queue, "Failed to purge queue: {}", e);
                return false;
            }
        };

        match stream.purge().await {
            Ok(response) => {
                info!(queue, purged = response.purged, "Queue purged");
                true
            }
            Err(e) => {
                warn!(queue, "Failed to purge queue: {}", e);
                false
            }
        }
    }

    async fn close(&self) {
        info!("Initiating graceful shutdown");
        self.shutdown.store(true, Ordering::SeqCst);

        let tasks: Vec<(String, ConsumerTask)> = self.consumers.lock().await.drain().collect();
        for (tag, task) in tasks {
            self.stop_consumer(&tag, task).await;
        }

        if let Err(e) = self.client.drain().await {
            error!("Error draining NATS connection: {}", e);
        }

        self.metrics.set_connected(false);
        info!("NATS connection drained");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ferry_core::queues::DeadLetter;

    #[test]
    fn test_stream_name_is_sanitized() {
        assert_eq!(
            stream_name("FERRY", "queue.agent.agt_1-2"),
            "FERRY_queue_agent_agt_1-2"
        );
    }

    #[test]
    fn test_plain_queue_has_one_band() {
        let layout = QueueLayout::for_spec(&QueueSpec::new("queue.callback"), "FERRY", 4);
        assert_eq!(layout.bands, 1);
        assert_eq!(layout.band_for(Some(200)), 0);
        assert_eq!(layout.band_for(None), 0);
    }

    #[test]
    fn test_priority_bands() {
        let spec = QueueSpec::new("flow.q.x.job")
            .with_max_priority(255)
            .with_dead_letter(DeadLetter::new("ferry.dlx", "job.timeout"));
        let layout = QueueLayout::for_spec(&spec, "FERRY", 4);

        assert_eq!(layout.bands, 4);
        assert_eq!(layout.band_for(Some(0)), 0);
        assert_eq!(layout.band_for(Some(63)), 0);
        assert_eq!(layout.band_for(Some(64)), 1);
        assert_eq!(layout.band_for(Some(255)), 3);
        assert_eq!(layout.dead_letter.as_deref(), Some("ferry.dlx.job.timeout"));
    }

    #[test]
    fn test_small_priority_range_limits_bands() {
        let spec = QueueSpec::new("q").with_max_priority(1);
        let layout = QueueLayout::for_spec(&spec, "FERRY", 4);

        assert_eq!(layout.bands, 2);
        assert_eq!(layout.band_for(Some(0)), 0);
        assert_eq!(layout.band_for(Some(1)), 1);
        assert_eq!(layout.band_for(Some(9)), 1);
    }

    #[test]
    fn test_layout_survives_stream_metadata() {
        let spec = QueueSpec::new("flow.q.y.job")
            .with_max_priority(255)
            .with_dead_letter(DeadLetter::new("dlx", "expired"));
        let layout = QueueLayout::for_spec(&spec, "FERRY", 4);

        let config = StreamConfig {
            name: layout.stream.clone(),
            subjects: (0..layout.bands).map(|b| band_subject(&spec.name, b)).collect(),
            metadata: layout.metadata(),
            ..Default::default()
        };

        assert_eq!(QueueLayout::from_stream(&config), layout);
    }
}
