//! Channel Client boundary.

use std::time::Duration;

use async_trait::async_trait;

/// What the transport reported for one send.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryResult {
    Success,
    /// Worth retrying: 5xx, timeouts, connection failures.
    TransientError(String),
    /// Retrying cannot help: bad destination, rejected credentials.
    PermanentError(String),
    /// The channel asked us to slow down.
    RateLimited { retry_after: Option<Duration> },
}

/// Sends a rendered payload to an external destination.
///
/// Implementations report failures as `DeliveryResult` values; they never
/// panic or retry on their own.
#[async_trait]
pub trait ChannelClient: Send + Sync {
    async fn send(&self, channel_target: &str, payload: &serde_json::Value) -> DeliveryResult;
}
