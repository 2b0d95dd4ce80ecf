//! NATS adapters for Ferry CI: a JetStream message broker and a key-value
//! coordination service.

mod broker;
pub mod config;
pub mod connection;
mod coordinator;
pub mod health;
pub mod metrics;

pub use broker::{
    DEAD_LETTER_FROM_HEADER, DEAD_LETTER_REASON_HEADER, EXPIRES_AT_HEADER, NatsBroker,
    PRIORITY_HEADER,
};
pub use config::NatsConfig;
pub use coordinator::NatsCoordinator;
pub use health::{HealthCheck, HealthStatus};
pub use metrics::{MetricsSnapshot, NatsMetrics};
