//! Wiring of the scheduling services and their shutdown.

use anyhow::Context;
use ferry_core::ports::{AgentStore, ConsumerHandle, Coordinator, MessageBroker};
use ferry_nats::{HealthCheck, NatsBroker, NatsConfig, NatsCoordinator, NatsMetrics, connection};
use ferry_scheduler::{
    AgentRegistry, CallbackRouter, CmdDispatcher, DistributedLock, MemoryAgentStore,
    MemoryBroker, MemoryCoordinationService, PriorityAdmissionQueue, SchedulerConfig,
    spawn_persistence, spawn_reclaimer,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

const HEALTH_INTERVAL: Duration = Duration::from_secs(30);

struct Transport {
    broker: Arc<dyn MessageBroker>,
    coordinator: Arc<dyn Coordinator>,
    health: Option<Arc<NatsBroker>>,
}

fn nats_config(config: &SchedulerConfig) -> NatsConfig {
    NatsConfig::default()
        .with_urls(config.nats.urls.clone())
        .with_stream_prefix(config.nats.stream_prefix.clone())
        .with_max_deliver(config.nats.max_deliver)
        .with_prefetch(config.dispatch.consumer_concurrency.max(1))
        .with_priority_bands(config.nats.priority_bands)
        .with_kv_bucket(config.coordination.bucket.clone())
        .with_lease(Duration::from_secs(config.coordination.lease_secs))
}

async fn connect(config: &SchedulerConfig, in_memory: bool) -> anyhow::Result<Transport> {
    if in_memory {
        info!("Using in-process broker and coordination");
        let service = MemoryCoordinationService::new();
        return Ok(Transport {
            broker: Arc::new(MemoryBroker::new(
                config.dispatch.consumer_concurrency,
                config.nats.max_deliver.max(1) as u32,
            )),
            coordinator: service.session(),
            health: None,
        });
    }

    let nats = nats_config(config);
    let metrics = NatsMetrics::new();
    let client = connection::connect(&nats, &metrics)
        .await
        .context("failed to connect to NATS")?;

    let broker = Arc::new(NatsBroker::with_client(
        client.clone(),
        nats.clone(),
        metrics.clone(),
    ));
    let coordinator = NatsCoordinator::with_client(client, &nats, metrics)
        .await
        .context("failed to open coordination bucket")?;

    Ok(Transport {
        broker: broker.clone(),
        coordinator: Arc::new(coordinator),
        health: Some(broker),
    })
}

fn spawn_health_reporter(
    broker: Arc<NatsBroker>,
    mut shutdown: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(HEALTH_INTERVAL);
        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown.changed() => break,
            }

            let health: HealthCheck = broker.health_check();
            if health.status.is_healthy() {
                info!(
                    published = health.messages_published,
                    received = health.messages_received,
                    consumers = health.active_consumers,
                    "NATS healthy"
                );
            } else {
                warn!(
                    status = ?health.status,
                    reconnects = health.reconnect_attempts,
                    locks_lost = health.locks_lost,
                    "NATS not healthy"
                );
            }
        }
    })
}

/// Run until ctrl-c, then stop consumers, background tasks and connections
/// in that order.
pub async fn run(config: SchedulerConfig, in_memory: bool) -> anyhow::Result<()> {
    let transport = connect(&config, in_memory).await?;
    let broker = transport.broker.clone();
    let coordinator = transport.coordinator.clone();

    let registry = Arc::new(
        AgentRegistry::new(broker.clone(), config.agent_settings())
            .with_starting_grace(config.agents.starting_grace_secs),
    );
    let lock = DistributedLock::new(coordinator.clone(), config.coordination.agent_root.clone());
    let store: Arc<dyn AgentStore> = Arc::new(MemoryAgentStore::new());
    registry
        .load(store.as_ref(), &lock)
        .await
        .context("failed to load agents")?;

    let (shutdown, shutdown_rx) = watch::channel(false);
    let mut tasks = vec![
        spawn_persistence(registry.clone(), store, shutdown_rx.clone()),
        spawn_reclaimer(registry.clone(), config.reclaim_interval(), shutdown_rx.clone()),
    ];

    let dispatcher = Arc::new(CmdDispatcher::new(
        registry.clone(),
        lock,
        Arc::new(PriorityAdmissionQueue::new()),
        broker.clone(),
        config.dispatch_config(),
    ));
    tasks.push(dispatcher.spawn_agent_watch(shutdown_rx.clone()));

    if let Some(nats) = transport.health {
        tasks.push(spawn_health_reporter(nats, shutdown_rx.clone()));
    }

    let router = Arc::new(CallbackRouter::new(dispatcher.clone()));
    let consumers: Vec<ConsumerHandle> = router
        .start(broker.as_ref(), &config.queue_settings())
        .await
        .context("failed to consume agent queues")?;

    info!(
        session = %coordinator.session_id(),
        agent_root = %config.coordination.agent_root,
        "Ferry scheduler running"
    );

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    info!("Shutting down");

    for handle in &consumers {
        broker.cancel(handle).await;
    }

    let _ = shutdown.send(true);
    for task in tasks {
        if let Err(e) = task.await {
            warn!("Background task failed: {}", e);
        }
    }

    broker.close().await;
    coordinator.close().await;
    info!("Ferry scheduler stopped");
    Ok(())
}
