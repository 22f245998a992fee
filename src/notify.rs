//! Notification interface for supportflow
//! Fire-and-forget from the core's perspective: delivery failures are
//! logged, never retried here. Delivery guarantees belong to the
//! notification subsystem behind this trait.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, channel: &str, message: &str) -> Result<(), NotifyError>;
}

/// Send without surfacing failure to the caller
pub async fn send_best_effort(notifier: &dyn Notifier, channel: &str, message: &str) {
    if let Err(e) = notifier.send(channel, message).await {
        tracing::warn!("notification to '{}' failed: {}", channel, e);
    }
}

/// Notifier that only logs; the default when no delivery backend is wired
#[derive(Default)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn send(&self, channel: &str, message: &str) -> Result<(), NotifyError> {
        tracing::info!("notify[{}]: {}", channel, message);
        Ok(())
    }
}
