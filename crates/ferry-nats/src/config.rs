//! Configuration for the NATS broker and coordinator.

use ferry_core::{Error, Result};
use std::time::Duration;

/// Configuration for the NATS adapters.
#[derive(Debug, Clone)]
pub struct NatsConfig {
    /// NATS server URLs (comma-separated for cluster).
    pub urls: Vec<String>,
    /// Prefix of every JetStream stream backing a queue.
    pub stream_prefix: String,
    /// Maximum reconnection attempts.
    pub max_reconnect_attempts: Option<usize>,
    /// Reconnection wait time.
    pub reconnect_wait: Duration,
    /// Connection timeout.
    pub connection_timeout: Duration,
    /// Request timeout for JetStream operations.
    pub request_timeout: Duration,
    /// Delivery attempts before a rejected message is dead-lettered.
    pub max_deliver: i64,
    /// Message retention period.
    pub max_age: Duration,
    /// Upper bound on priority bands per queue.
    pub priority_bands: u8,
    /// Unacknowledged messages per consumer, also the worker pool size.
    pub prefetch: usize,
    /// How long an acked-nothing consumer sleeps before polling again.
    pub idle_poll: Duration,
    /// Time the server waits for an ack before redelivering.
    pub ack_wait: Duration,
    /// How long cancel waits for in-flight handlers.
    pub drain_timeout: Duration,
    /// Key-value bucket holding lock nodes.
    pub kv_bucket: String,
    /// Lifetime of a lock node that is no longer renewed.
    pub lease: Duration,
}

impl Default for NatsConfig {
    fn default() -> Self {
        Self {
            urls: vec!["nats://localhost:4222".to_string()],
            stream_prefix: "FERRY".to_string(),
            max_reconnect_attempts: None, // Unlimited
            reconnect_wait: Duration::from_secs(2),
            connection_timeout: Duration::from_secs(10),
            request_timeout: Duration::from_secs(5),
            max_deliver: 3,
            max_age: Duration::from_secs(86400 * 7), // 7 days
            priority_bands: 4,
            prefetch: 4,
            idle_poll: Duration::from_millis(200),
            ack_wait: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(30),
            kv_bucket: "FERRY_LOCKS".to_string(),
            lease: Duration::from_secs(15),
        }
    }
}

impl NatsConfig {
    /// Create a new config with a single URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            urls: vec![url.into()],
            ..Default::default()
        }
    }

    /// Set multiple server URLs for cluster support.
    pub fn with_urls(mut self, urls: Vec<String>) -> Self {
        self.urls = urls;
        self
    }

    pub fn with_stream_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.stream_prefix = prefix.into();
        self
    }

    /// Set max reconnection attempts.
    pub fn with_max_reconnects(mut self, max: usize) -> Self {
        self.max_reconnect_attempts = Some(max);
        self
    }

    /// Set delivery attempts before dead-lettering.
    pub fn with_max_deliver(mut self, max: i64) -> Self {
        self.max_deliver = max;
        self
    }

    pub fn with_priority_bands(mut self, bands: u8) -> Self {
        self.priority_bands = bands.max(1);
        self
    }

    pub fn with_prefetch(mut self, prefetch: usize) -> Self {
        self.prefetch = prefetch.max(1);
        self
    }

    pub fn with_idle_poll(mut self, idle_poll: Duration) -> Self {
        self.idle_poll = idle_poll;
        self
    }

    pub fn with_kv_bucket(mut self, bucket: impl Into<String>) -> Self {
        self.kv_bucket = bucket.into();
        self
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    /// Comma-joined server list accepted by `connect`.
    pub fn server_list(&self) -> String {
        self.urls.join(",")
    }

    /// Interval at which owned lock nodes are renewed.
    pub fn renew_interval(&self) -> Duration {
        (self.lease / 3).max(Duration::from_millis(100))
    }

    /// Fails when nodes would expire before their first renewal.
    pub fn check_lease(&self) -> Result<()> {
        if self.lease <= self.renew_interval() {
            return Err(Error::Config(format!(
                "lease {:?} must be longer than the renew interval {:?}",
                self.lease,
                self.renew_interval()
            )));
        }
        Ok(())
    }
}
