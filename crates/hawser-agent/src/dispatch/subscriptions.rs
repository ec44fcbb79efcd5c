//! Subscription tracking
//!
//! At most one streaming task runs per channel. Subscribing again to a
//! channel replaces the existing task; every task is cancelled when the
//! connection drops, and the control plane re-subscribes after it
//! reconnects.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use hawser_core::error::ConnectionError;
use hawser_core::traits::MetricsSampler;
use hawser_protocol::Message;

use crate::transport::OutboundSender;

/// Active streaming channels and their cancellation tokens
pub struct SubscriptionTable {
    channels: Mutex<HashMap<String, CancellationToken>>,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
        }
    }

    /// Register a channel, returning the token for its streaming task.
    ///
    /// Any prior task on the same channel is cancelled first.
    pub async fn subscribe(&self, channel: &str, parent: &CancellationToken) -> CancellationToken {
        let token = parent.child_token();
        let prior = self
            .channels
            .lock()
            .await
            .insert(channel.to_string(), token.clone());
        if let Some(prior) = prior {
            prior.cancel();
            tracing::debug!(channel, "Replaced existing subscription");
        }
        token
    }

    /// Cancel and remove a channel. Returns false if it was not active.
    pub async fn unsubscribe(&self, channel: &str) -> bool {
        match self.channels.lock().await.remove(channel) {
            Some(token) => {
                token.cancel();
                tracing::debug!(channel, "Unsubscribed");
                true
            }
            None => {
                tracing::debug!(channel, "Unsubscribe for inactive channel");
                false
            }
        }
    }

    /// Cancel every streaming task. Used on disconnect and shutdown.
    pub async fn cancel_all(&self) {
        let drained: Vec<(String, CancellationToken)> = {
            let mut channels = self.channels.lock().await;
            channels.drain().collect()
        };
        for (channel, token) in drained {
            token.cancel();
            tracing::debug!(channel, "Cancelled subscription");
        }
    }

    pub async fn active_count(&self) -> usize {
        self.channels.lock().await.len()
    }

    pub async fn channel_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.channels.lock().await.keys().cloned().collect();
        names.sort();
        names
    }
}

impl Default for SubscriptionTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Periodically sample host metrics onto the `metrics` channel.
///
/// A failed sample skips the tick; a full outbound queue drops the
/// sample. Either way the loop keeps going until the token fires.
pub async fn stream_metrics(
    channel: String,
    sampler: Arc<dyn MetricsSampler>,
    outbound: OutboundSender,
    period: Duration,
    cancel: CancellationToken,
) {
    let mut interval = tokio::time::interval(period);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let metrics = match sampler.sample().await {
                    Ok(metrics) => metrics,
                    Err(e) => {
                        tracing::warn!(error = %e, "Metrics sample failed");
                        continue;
                    }
                };
                let data = match serde_json::to_value(&metrics) {
                    Ok(data) => data,
                    Err(e) => {
                        tracing::warn!(error = %e, "Failed to serialize metrics sample");
                        continue;
                    }
                };
                match outbound.send(Message::Stream { channel: channel.clone(), data }) {
                    Ok(()) => {}
                    Err(ConnectionError::Closed) => break,
                    Err(e) => tracing::debug!(error = %e, "Dropping metrics sample"),
                }
            }
        }
    }

    tracing::debug!(channel, "Metrics stream stopped");
}
