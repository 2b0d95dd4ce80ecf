//! Coordination service over a JetStream key-value bucket.
//!
//! A node is a key whose value is the creating session's id. The bucket's
//! `max_age` is the lease: a session renews its keys every third of the
//! lease, so keys of a dead session expire on their own.

use async_nats::jetstream::{
    self,
    kv::{self, CreateErrorKind, Operation},
    stream::StorageType,
};
use async_trait::async_trait;
use bytes::Bytes;
use ferry_core::ports::Coordinator;
use ferry_core::{Error, Result};
use futures::StreamExt;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::NatsConfig;
use crate::connection;
use crate::health::HealthCheck;
use crate::metrics::NatsMetrics;

const DELETE_ATTEMPTS: usize = 3;

fn key_for(path: &str) -> String {
    path.trim_matches('/').to_string()
}

/// Names directly under `root` among `keys`.
fn direct_children<I: IntoIterator<Item = String>>(root: &str, keys: I) -> Vec<String> {
    let prefix = format!("{}/", root.trim_matches('/'));
    let mut children: Vec<String> = keys
        .into_iter()
        .filter_map(|key| {
            let rest = key.strip_prefix(&prefix)?;
            (!rest.is_empty() && !rest.contains('/')).then(|| rest.to_string())
        })
        .collect();
    children.sort();
    children
}

/// Revisions of the keys this session created, by key.
type Owned = Arc<Mutex<HashMap<String, u64>>>;

pub struct NatsCoordinator {
    client: async_nats::Client,
    store: kv::Store,
    session: String,
    owned: Owned,
    metrics: Arc<NatsMetrics>,
    stop: watch::Sender<bool>,
    keeper: Mutex<Option<JoinHandle<()>>>,
}

impl NatsCoordinator {
    pub async fn connect(config: NatsConfig) -> Result<Self> {
        let metrics = NatsMetrics::new();
        let client = connection::connect(&config, &metrics).await?;
        Self::with_client(client, &config, metrics).await
    }

    /// Open the lock bucket on an existing connection and start renewing.
    pub async fn with_client(
        client: async_nats::Client,
        config: &NatsConfig,
        metrics: Arc<NatsMetrics>,
    ) -> Result<Self> {
        config.check_lease()?;
        let jetstream = jetstream::new(client.clone());
        let store = open_bucket(&jetstream, config).await?;

        let session = Uuid::new_v4().to_string();
        let owned: Owned = Arc::new(Mutex::new(HashMap::new()));
        let (stop, stop_rx) = watch::channel(false);

        let keeper = tokio::spawn(keep_alive(
            store.clone(),
            owned.clone(),
            session.clone(),
            metrics.clone(),
            config.renew_interval(),
            stop_rx,
        ));

        info!(session = %session, bucket = %config.kv_bucket, "Coordination session opened");

        Ok(Self {
            client,
            store,
            session,
            owned,
            metrics,
            stop,
            keeper: Mutex::new(Some(keeper)),
        })
    }

    pub fn metrics(&self) -> &Arc<NatsMetrics> {
        &self.metrics
    }

    pub fn health_check(&self) -> HealthCheck {
        HealthCheck::from_metrics(&self.metrics, connection::is_connected(&self.client))
    }

    /// Delete `key` if its latest value is this session's.
    async fn delete_if_ours(&self, key: &str) -> Result<bool> {
        for _ in 0..DELETE_ATTEMPTS {
            let entry = self
                .store
                .entry(key)
                .await
                .map_err(|e| Error::Coordination(format!("Failed to read {}: {}", key, e)))?;

            let Some(entry) = entry else {
                return Ok(false);
            };
            if !matches!(entry.operation, Operation::Put)
                || entry.value.as_ref() != self.session.as_bytes()
            {
                return Ok(false);
            }

            match self
                .store
                .delete_expect_revision(key, Some(entry.revision))
                .await
            {
                Ok(()) => return Ok(true),
                // A renewal moved the revision; read again.
                Err(e) => debug!(key, "Delete raced with renewal: {}", e),
            }
        }

        Err(Error::Coordination(format!("Failed to delete {}", key)))
    }
}

async fn open_bucket(jetstream: &jetstream::Context, config: &NatsConfig) -> Result<kv::Store> {
    if let Ok(store) = jetstream.get_key_value(&config.kv_bucket).await {
        return Ok(store);
    }

    let created = jetstream
        .create_key_value(kv::Config {
            bucket: config.kv_bucket.clone(),
            history: 1,
            max_age: config.lease,
            storage: StorageType::Memory,
            ..Default::default()
        })
        .await;

    match created {
        Ok(store) => Ok(store),
        // Another process created it first.
        Err(create_err) => jetstream.get_key_value(&config.kv_bucket).await.map_err(|e| {
            Error::Coordination(format!(
                "Failed to open bucket {}: {} ({})",
                config.kv_bucket, create_err, e
            ))
        }),
    }
}

async fn keep_alive(
    store: kv::Store,
    owned: Owned,
    session: String,
    metrics: Arc<NatsMetrics>,
    interval: std::time::Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = stop.changed() => break,
        }

        let snapshot: Vec<(String, u64)> = owned
            .lock()
            .await
            .iter()
            .map(|(key, revision)| (key.clone(), *revision))
            .collect();

        for (key, revision) in snapshot {
            match store
                .update(&key, Bytes::from(session.clone()), revision)
                .await
            {
                Ok(next) => {
                    if let Some(current) = owned.lock().await.get_mut(&key) {
                        if *current == revision {
                            *current = next;
                        }
                    }
                }
                Err(e) => {
                    let mut owned = owned.lock().await;
                    if owned.get(&key) == Some(&revision) {
                        owned.remove(&key);
                        metrics.record_lock_lost();
                        warn!(key = %key, session = %session, "Lock lost, renewal failed: {}", e);
                    }
                }
            }
        }
    }

    debug!(session = %session, "Lease keeper stopped");
}

#[async_trait]
impl Coordinator for NatsCoordinator {
    async fn create_ephemeral(&self, path: &str) -> Result<bool> {
        let key = key_for(path);
        match self
            .store
            .create(&key, Bytes::from(self.session.clone()))
            .await
        {
            Ok(revision) => {
                self.owned.lock().await.insert(key, revision);
                Ok(true)
            }
            Err(e) if matches!(e.kind(), CreateErrorKind::AlreadyExists) => Ok(false),
            Err(e) => Err(Error::Coordination(format!("Failed to create {}: {}", key, e))),
        }
    }

    async fn delete_owned(&self, path: &str) -> Result<bool> {
        let key = key_for(path);
        if self.owned.lock().await.remove(&key).is_none() {
            return Ok(false);
        }
        self.delete_if_ours(&key).await
    }

    async fn exists(&self, path: &str) -> Result<bool> {
        let key = key_for(path);
        self.store
            .get(&key)
            .await
            .map(|value| value.is_some())
            .map_err(|e| Error::Coordination(format!("Failed to read {}: {}", key, e)))
    }

    async fn children(&self, root: &str) -> Result<Vec<String>> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| Error::Coordination(format!("Failed to list keys: {}", e)))?;

        let mut all = Vec::new();
        while let Some(key) = keys.next().await {
            all.push(key.map_err(|e| Error::Coordination(format!("Failed to list keys: {}", e)))?);
        }

        Ok(direct_children(root, all))
    }

    fn session_id(&self) -> String {
        self.session.clone()
    }

    async fn close(&self) {
        let _ = self.stop.send(true);
        if let Some(keeper) = self.keeper.lock().await.take() {
            let _ = keeper.await;
        }

        let keys: Vec<String> = self.owned.lock().await.drain().map(|(key, _)| key).collect();
        for key in keys {
            if let Err(e) = self.delete_if_ours(&key).await {
                warn!(key = %key, "Failed to release node on close: {}", e);
            }
        }

        info!(session = %self.session, "Coordination session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_strips_slashes() {
        assert_eq!(key_for("/ferry-agents/agt_1-lock"), "ferry-agents/agt_1-lock");
    }

    #[test]
    fn test_direct_children() {
        let keys = vec![
            "ferry-agents/agt_b-lock".to_string(),
            "ferry-agents/agt_a-lock".to_string(),
            "ferry-agents/nested/x".to_string(),
            "other/agt_c-lock".to_string(),
            "ferry-agents".to_string(),
        ];

        assert_eq!(
            direct_children("/ferry-agents", keys),
            vec!["agt_a-lock".to_string(), "agt_b-lock".to_string()]
        );
    }
}
