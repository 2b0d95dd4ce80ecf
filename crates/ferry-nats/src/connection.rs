//! Connection setup shared by the broker and the coordinator.

use crate::config::NatsConfig;
use crate::metrics::NatsMetrics;
use ferry_core::{Error, Result};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Connect to the configured servers, keeping `metrics` in step with the
/// connection state.
pub async fn connect(config: &NatsConfig, metrics: &Arc<NatsMetrics>) -> Result<async_nats::Client> {
    let urls = config.server_list();
    info!("Connecting to NATS at {}", urls);

    let wait = config.reconnect_wait;
    let events = metrics.clone();

    let mut options = async_nats::ConnectOptions::new()
        .connection_timeout(config.connection_timeout)
        .request_timeout(Some(config.request_timeout))
        .retry_on_initial_connect()
        .reconnect_delay_callback(move |_| wait)
        .event_callback(move |event| {
            let metrics = events.clone();
            async move {
                match event {
                    async_nats::Event::Connected => {
                        info!("NATS connection established");
                        metrics.set_connected(true);
                    }
                    async_nats::Event::Disconnected => {
                        warn!("NATS connection lost, reconnecting");
                        metrics.set_connected(false);
                        metrics.record_reconnect();
                    }
                    other => debug!(event = ?other, "NATS client event"),
                }
            }
        });

    if let Some(max) = config.max_reconnect_attempts {
        options = options.max_reconnects(max);
    }

    let client = options
        .connect(&urls)
        .await
        .map_err(|e| Error::Transport(format!("Failed to connect to NATS: {}", e)))?;

    metrics.set_connected(true);
    Ok(client)
}

pub(crate) fn is_connected(client: &async_nats::Client) -> bool {
    client.connection_state() == async_nats::connection::State::Connected
}
