//! Helpers shared by the unit and integration tests.

use ferry_core::settings::Settings;
use std::future::Future;
use std::time::Duration;
use tracing_subscriber::EnvFilter;

use crate::config::SchedulerConfig;

pub fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("ferry_scheduler=debug")),
        )
        .with_test_writer()
        .try_init();
}

pub fn settings_template() -> Settings {
    SchedulerConfig::default().agent_settings()
}

/// Poll `check` until it holds or three seconds pass.
pub async fn eventually<F, Fut>(mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if check().await {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check().await
}
