//! Per-flow job queues.
//!
//! Each flow gets a durable priority queue `flow.q.{flowId}.job`. Jobs that
//! expire or keep getting rejected land on one shared dead-letter queue and
//! are reported through [`JobLauncher::on_expired`].

use async_trait::async_trait;
use ferry_core::ids::{FlowId, JobId};
use ferry_core::ports::{ConsumerHandle, Delivery, JobLauncher, MessageBroker, MessageHandler};
use ferry_core::queues::{self, DeadLetter, PublishOptions, QueueSpec};
use ferry_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Body of a message on a flow job queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueuedJob {
    pub flow_id: FlowId,
    pub job_id: JobId,
}

pub struct FlowQueues {
    broker: Arc<dyn MessageBroker>,
    launcher: Arc<dyn JobLauncher>,
    dead_letter: DeadLetter,
    max_priority: u8,
    consumers: Mutex<HashMap<FlowId, ConsumerHandle>>,
    dead_letter_consumer: Mutex<Option<ConsumerHandle>>,
}

impl FlowQueues {
    pub fn new(
        broker: Arc<dyn MessageBroker>,
        launcher: Arc<dyn JobLauncher>,
        dead_letter: DeadLetter,
        max_priority: u8,
    ) -> Self {
        Self {
            broker,
            launcher,
            dead_letter,
            max_priority,
            consumers: Mutex::new(HashMap::new()),
            dead_letter_consumer: Mutex::new(None),
        }
    }

    /// Declare the dead-letter queue and start reporting expired jobs.
    pub async fn start(&self) -> Result<()> {
        let address = self.dead_letter.address();
        self.broker.declare(&QueueSpec::new(address.clone())).await?;

        let handler = Arc::new(ExpiredHandler {
            launcher: self.launcher.clone(),
        });
        let handle = self.broker.consume(&address, false, handler).await?;
        *self.dead_letter_consumer.lock().await = Some(handle);

        info!(queue = %address, "Consuming expired jobs");
        Ok(())
    }

    fn spec(&self, flow_id: FlowId) -> QueueSpec {
        QueueSpec::new(queues::flow_job_queue(flow_id))
            .with_max_priority(self.max_priority)
            .with_dead_letter(self.dead_letter.clone())
    }

    /// Declare the flow's queue and hand its jobs to the launcher.
    pub async fn open(&self, flow_id: FlowId) -> Result<()> {
        if self.consumers.lock().await.contains_key(&flow_id) {
            return Ok(());
        }

        let spec = self.spec(flow_id);
        self.broker.declare(&spec).await?;

        let handler = Arc::new(JobHandler {
            launcher: self.launcher.clone(),
        });
        let handle = self.broker.consume(&spec.name, false, handler).await?;

        let duplicate = {
            let mut consumers = self.consumers.lock().await;
            if consumers.contains_key(&flow_id) {
                Some(handle)
            } else {
                consumers.insert(flow_id, handle);
                None
            }
        };

        // Lost a race with a concurrent open of the same flow.
        if let Some(handle) = duplicate {
            self.broker.cancel(&handle).await;
            return Ok(());
        }

        info!(flow_id = %flow_id, queue = %spec.name, "Flow queue opened");
        Ok(())
    }

    /// Queue a job. `ttl` bounds how long it may wait before dead-lettering.
    pub async fn enqueue(
        &self,
        flow_id: FlowId,
        job_id: JobId,
        priority: u8,
        ttl: Option<Duration>,
    ) -> bool {
        let body = match serde_json::to_vec(&QueuedJob { flow_id, job_id }) {
            Ok(body) => body,
            Err(e) => {
                warn!(job_id = %job_id, "Failed to encode job: {}", e);
                return false;
            }
        };

        let mut options = PublishOptions::priority(priority.min(self.max_priority));
        if let Some(ttl) = ttl {
            options = options.with_ttl(ttl);
        }

        let sent = self
            .broker
            .publish(&queues::flow_job_queue(flow_id), &body, options)
            .await;
        if sent {
            debug!(flow_id = %flow_id, job_id = %job_id, priority, "Job queued");
        }
        sent
    }

    /// Stop consuming the flow's queue. Queued jobs stay.
    pub async fn close(&self, flow_id: FlowId) -> bool {
        let Some(handle) = self.consumers.lock().await.remove(&flow_id) else {
            return false;
        };
        let cancelled = self.broker.cancel(&handle).await;
        info!(flow_id = %flow_id, "Flow queue closed");
        cancelled
    }

    /// Close the flow's queue and drop it with everything still queued.
    pub async fn remove(&self, flow_id: FlowId) -> bool {
        self.close(flow_id).await;
        self.broker.delete(&queues::flow_job_queue(flow_id)).await
    }

    pub async fn shutdown(&self) {
        let handles: Vec<ConsumerHandle> = self
            .consumers
            .lock()
            .await
            .drain()
            .map(|(_, handle)| handle)
            .chain(self.dead_letter_consumer.lock().await.take())
            .collect();

        for handle in handles {
            self.broker.cancel(&handle).await;
        }
    }
}

fn decode(delivery: &Delivery) -> Option<QueuedJob> {
    match serde_json::from_slice(&delivery.body) {
        Ok(job) => Some(job),
        Err(e) => {
            warn!(queue = %delivery.queue, "Dropping malformed job: {}", e);
            None
        }
    }
}

struct JobHandler {
    launcher: Arc<dyn JobLauncher>,
}

#[async_trait]
impl MessageHandler for JobHandler {
    async fn handle(&self, delivery: Delivery) -> bool {
        let Some(job) = decode(&delivery) else {
            return true;
        };

        match self.launcher.on_job(job.flow_id, job.job_id).await {
            Ok(()) => true,
            Err(e) => {
                warn!(job_id = %job.job_id, "Job rejected: {}", e);
                // Redelivered until max deliveries, then dead-lettered.
                false
            }
        }
    }
}

struct ExpiredHandler {
    launcher: Arc<dyn JobLauncher>,
}

#[async_trait]
impl MessageHandler for ExpiredHandler {
    async fn handle(&self, delivery: Delivery) -> bool {
        let Some(job) = decode(&delivery) else {
            return true;
        };

        info!(flow_id = %job.flow_id, job_id = %job.job_id, "Job expired in queue");
        if let Err(e) = self.launcher.on_expired(job.flow_id, job.job_id).await {
            warn!(job_id = %job.job_id, "Failed to report expired job: {}", e);
            return false;
        }
        true
    }
}
