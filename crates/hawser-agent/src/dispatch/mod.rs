//! Inbound message dispatch
//!
//! Routes decoded control-plane frames to their handlers: commands to
//! the registry (one task per command, so a slow handler never stalls
//! the read loop), subscriptions to streaming tasks, and credential
//! rotations to the store.

mod registry;
mod subscriptions;

pub use registry::{
    CommandError, CommandHandler, CommandRegistry, CommandRegistryBuilder, ContainerHandler,
    ContainerOp, MetricsHandler,
};
pub use subscriptions::{stream_metrics, SubscriptionTable};

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio_util::sync::CancellationToken;

use hawser_core::auth::CredentialStore;
use hawser_core::time::{current_time_millis, elapsed_millis};
use hawser_core::traits::MetricsSampler;
use hawser_protocol::Message;

use crate::transport::OutboundSender;

/// Routes inbound messages to command and subscription handling.
pub struct Dispatcher {
    registry: Arc<CommandRegistry>,
    subscriptions: Arc<SubscriptionTable>,
    outbound: OutboundSender,
    credentials: Arc<CredentialStore>,
    sampler: Option<Arc<dyn MetricsSampler>>,
    stream_interval: Duration,
    root: CancellationToken,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<CommandRegistry>,
        subscriptions: Arc<SubscriptionTable>,
        outbound: OutboundSender,
        credentials: Arc<CredentialStore>,
        sampler: Option<Arc<dyn MetricsSampler>>,
        stream_interval: Duration,
        root: CancellationToken,
    ) -> Self {
        Self {
            registry,
            subscriptions,
            outbound,
            credentials,
            sampler,
            stream_interval,
            root,
        }
    }

    /// Handle one decoded frame from the control plane.
    pub async fn dispatch(&self, message: Message) {
        match message {
            Message::Command {
                id,
                action,
                params,
                timeout_ms,
            } => self.handle_command(id, action, params, timeout_ms),
            Message::Subscribe { channel } => self.handle_subscribe(channel).await,
            Message::Unsubscribe { channel } => {
                self.subscriptions.unsubscribe(&channel).await;
            }
            Message::CredentialUpdate {
                rotation_id,
                api_key,
                api_secret,
            } => self.handle_rotation(rotation_id, api_key, api_secret).await,
            Message::Error { code, details } => {
                tracing::warn!(code = ?code, details = %details, "Control plane reported an error");
            }
            other => {
                tracing::warn!(kind = other.kind(), "Ignoring unexpected message");
            }
        }
    }

    /// Run a command in its own task and queue the result.
    fn handle_command(&self, id: String, action: String, params: Value, timeout_ms: Option<u64>) {
        tracing::debug!(command_id = %id, action = %action, "Command received");

        let registry = Arc::clone(&self.registry);
        let outbound = self.outbound.clone();
        let cancel = self.root.child_token();
        let timeout = timeout_ms.map(Duration::from_millis);

        tokio::spawn(async move {
            let started = current_time_millis();
            let outcome = registry.execute(&action, params, timeout, cancel).await;
            let duration_ms = elapsed_millis(started);

            let result = match outcome {
                Ok(data) => {
                    tracing::debug!(command_id = %id, action = %action, duration_ms, "Command succeeded");
                    Message::CommandResult {
                        command_id: id.clone(),
                        success: true,
                        data,
                        error: None,
                        duration_ms,
                    }
                }
                Err(e) => {
                    tracing::warn!(command_id = %id, action = %action, error = %e, "Command failed");
                    Message::CommandResult {
                        command_id: id.clone(),
                        success: false,
                        data: Value::Null,
                        error: Some(e.to_string()),
                        duration_ms,
                    }
                }
            };

            if let Err(e) = outbound.send(result) {
                tracing::warn!(command_id = %id, error = %e, "Failed to queue command result");
            }
        });
    }

    /// Start a streaming task for a known channel.
    async fn handle_subscribe(&self, channel: String) {
        match channel.as_str() {
            "metrics" => {
                let Some(sampler) = self.sampler.clone() else {
                    tracing::warn!("Metrics subscription requested but no sampler is configured");
                    return;
                };
                let token = self.subscriptions.subscribe(&channel, &self.root).await;
                tracing::info!(channel = %channel, "Subscription started");
                tokio::spawn(stream_metrics(
                    channel,
                    sampler,
                    self.outbound.clone(),
                    self.stream_interval,
                    token,
                ));
            }
            other => {
                tracing::warn!(channel = other, "Ignoring subscription to unknown channel");
            }
        }
    }

    /// Swap credentials and acknowledge the rotation.
    ///
    /// A failed persist still leaves the new pair active in memory, so
    /// the current connection's successor can authenticate; the nack
    /// tells the control plane the write needs attention.
    async fn handle_rotation(&self, rotation_id: String, api_key: String, api_secret: String) {
        tracing::info!(rotation_id = %rotation_id, "Applying credential rotation");

        let (success, error) = match self.credentials.rotate(api_key, api_secret).await {
            Ok(()) => (true, None),
            Err(e) => {
                tracing::error!(
                    rotation_id = %rotation_id,
                    error = %e,
                    "Rotation persisted in memory only"
                );
                (false, Some(e.to_string()))
            }
        };

        let ack = Message::CredentialUpdateAck {
            rotation_id,
            success,
            error,
        };
        if let Err(e) = self.outbound.send(ack) {
            tracing::warn!(error = %e, "Failed to queue rotation ack");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hawser_core::auth::{persist_credentials, Credentials};
    use serde_json::json;

    use crate::transport::outbound_queue;

    struct EchoHandler;

    #[async_trait]
    impl CommandHandler for EchoHandler {
        async fn execute(&self, params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
            Ok(params)
        }
    }

    fn test_store(dir: &tempfile::TempDir) -> Arc<CredentialStore> {
        let path = dir.path().join("credentials.json");
        let credentials = Credentials {
            agent_id: "agent-dispatch".to_string(),
            api_key: "hk_live_dispatch0001".to_string(),
            api_secret: "dispatch-secret".to_string(),
        };
        persist_credentials(&path, &credentials).unwrap();
        Arc::new(CredentialStore::load(&path).unwrap())
    }

    fn dispatcher(
        store: Arc<CredentialStore>,
    ) -> (Dispatcher, tokio::sync::mpsc::Receiver<Message>) {
        let (outbound, rx) = outbound_queue(16);
        let registry = Arc::new(
            CommandRegistry::builder()
                .register("echo", Arc::new(EchoHandler))
                .build(),
        );
        let dispatcher = Dispatcher::new(
            registry,
            Arc::new(SubscriptionTable::new()),
            outbound,
            store,
            None,
            Duration::from_secs(2),
            CancellationToken::new(),
        );
        (dispatcher, rx)
    }

    #[tokio::test]
    async fn test_command_produces_result() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = dispatcher(test_store(&dir));

        dispatcher
            .dispatch(Message::Command {
                id: "cmd-1".to_string(),
                action: "echo".to_string(),
                params: json!({"k": "v"}),
                timeout_ms: None,
            })
            .await;

        match rx.recv().await {
            Some(Message::CommandResult {
                command_id,
                success,
                data,
                ..
            }) => {
                assert_eq!(command_id, "cmd-1");
                assert!(success);
                assert_eq!(data, json!({"k": "v"}));
            }
            other => panic!("expected command result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_unknown_action_reports_failure() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, mut rx) = dispatcher(test_store(&dir));

        dispatcher
            .dispatch(Message::Command {
                id: "cmd-2".to_string(),
                action: "missing.action".to_string(),
                params: Value::Null,
                timeout_ms: None,
            })
            .await;

        match rx.recv().await {
            Some(Message::CommandResult { success, error, .. }) => {
                assert!(!success);
                assert!(error.unwrap().contains("Unknown action"));
            }
            other => panic!("expected command result, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_rotation_acked_and_applied() {
        let dir = tempfile::tempdir().unwrap();
        let store = test_store(&dir);
        let (dispatcher, mut rx) = dispatcher(Arc::clone(&store));

        dispatcher
            .dispatch(Message::CredentialUpdate {
                rotation_id: "rot-9".to_string(),
                api_key: "hk_live_rotated00001".to_string(),
                api_secret: "rotated-secret".to_string(),
            })
            .await;

        match rx.recv().await {
            Some(Message::CredentialUpdateAck {
                rotation_id,
                success,
                error,
            }) => {
                assert_eq!(rotation_id, "rot-9");
                assert!(success);
                assert!(error.is_none());
            }
            other => panic!("expected rotation ack, got {other:?}"),
        }

        let current = store.current().await;
        assert_eq!(current.api_key, "hk_live_rotated00001");
        assert_eq!(current.api_secret, "rotated-secret");
    }

    #[tokio::test]
    async fn test_unknown_subscribe_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let (dispatcher, _rx) = dispatcher(test_store(&dir));

        dispatcher
            .dispatch(Message::Subscribe {
                channel: "no-such-channel".to_string(),
            })
            .await;

        assert_eq!(dispatcher.subscriptions.active_count().await, 0);
    }
}
