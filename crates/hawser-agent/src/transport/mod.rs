//! Control-plane transport
//!
//! Owns the persistent connection to the control plane: a reconnect loop
//! with exponential backoff, a single writer task that drains the shared
//! outbound queue, a reader task that feeds inbound frames to the
//! dispatcher, and a heartbeat task that reports host telemetry.
//!
//! The outbound queue outlives individual connections. Frames queued
//! while the link is down are delivered after the next successful
//! handshake, each stamped with a fresh nonce and timestamp at write
//! time rather than at enqueue time.

mod backoff;
mod connection;

pub use backoff::ExponentialBackoff;
pub use connection::{Connection, SessionGrant};

use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tokio_util::sync::CancellationToken;

use hawser_core::auth::{generate_nonce, CredentialStore};
use hawser_core::config::AgentConfig;
use hawser_core::error::ConnectionError;
use hawser_core::time::current_time_secs;
use hawser_core::traits::{ContainerDriver, MetricsSampler};
use hawser_protocol::{Envelope, FrameCodec, Message, ProtocolError};

use crate::dispatch::{Dispatcher, SubscriptionTable};
use crate::telemetry::heartbeat_snapshot;

/// Handle for queueing outbound frames.
///
/// Cloned freely across command handlers, streaming tasks, and session
/// callbacks. `send` never blocks: when the queue is full the frame is
/// rejected immediately and the caller decides whether to drop or log.
#[derive(Clone)]
pub struct OutboundSender {
    tx: mpsc::Sender<Message>,
}

impl OutboundSender {
    /// Queue a message for the writer task.
    pub fn send(&self, message: Message) -> Result<(), ConnectionError> {
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => ConnectionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => ConnectionError::Closed,
        })
    }
}

/// Create the outbound queue shared by all frame producers.
pub fn outbound_queue(capacity: usize) -> (OutboundSender, mpsc::Receiver<Message>) {
    let (tx, rx) = mpsc::channel(capacity);
    (OutboundSender { tx }, rx)
}

/// Snapshot of the control-plane link, published for the admin surface
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    pub server_address: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub connected_since: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_expires: Option<u64>,
    pub reconnect_attempts: u32,
}

impl ConnectionStatus {
    fn disconnected(server_address: String) -> Self {
        Self {
            connected: false,
            server_address,
            connected_since: None,
            session_expires: None,
            reconnect_attempts: 0,
        }
    }
}

/// The agent half of the control-plane link.
pub struct Transport {
    config: Arc<AgentConfig>,
    credentials: Arc<CredentialStore>,
    dispatcher: Arc<Dispatcher>,
    subscriptions: Arc<SubscriptionTable>,
    sampler: Option<Arc<dyn MetricsSampler>>,
    containers: Option<Arc<dyn ContainerDriver>>,
    outbound: OutboundSender,
    outbound_rx: mpsc::Receiver<Message>,
    status_tx: watch::Sender<ConnectionStatus>,
}

impl Transport {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: Arc<AgentConfig>,
        credentials: Arc<CredentialStore>,
        dispatcher: Arc<Dispatcher>,
        subscriptions: Arc<SubscriptionTable>,
        sampler: Option<Arc<dyn MetricsSampler>>,
        containers: Option<Arc<dyn ContainerDriver>>,
        outbound: OutboundSender,
        outbound_rx: mpsc::Receiver<Message>,
    ) -> (Self, watch::Receiver<ConnectionStatus>) {
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::disconnected(
            config.server_address.clone(),
        ));
        let transport = Self {
            config,
            credentials,
            dispatcher,
            subscriptions,
            sampler,
            containers,
            outbound,
            outbound_rx,
            status_tx,
        };
        (transport, status_rx)
    }

    /// Run the connection loop until `shutdown` fires.
    ///
    /// Terminal sessions are left running across reconnects; their
    /// output resumes flowing once the link is back. Subscriptions are
    /// torn down on every disconnect and must be re-established by the
    /// control plane.
    pub async fn run(self, shutdown: CancellationToken) {
        let Transport {
            config,
            credentials,
            dispatcher,
            subscriptions,
            sampler,
            containers,
            outbound,
            mut outbound_rx,
            status_tx,
        } = self;

        let mut backoff = ExponentialBackoff::from_config(&config.backoff);

        loop {
            let attempt = tokio::select! {
                _ = shutdown.cancelled() => break,
                result = Connection::establish(&config, &credentials) => result,
            };

            let connection = match attempt {
                Ok(connection) => connection,
                Err(error) => {
                    let delay = backoff.next_delay();
                    match &error {
                        ConnectionError::HandshakeRejected(reason) => {
                            tracing::error!(
                                reason = %reason,
                                attempt = backoff.attempts(),
                                delay_secs = delay.as_secs(),
                                "Control plane rejected handshake; retrying"
                            );
                        }
                        other => {
                            tracing::warn!(
                                error = %other,
                                attempt = backoff.attempts(),
                                delay_secs = delay.as_secs(),
                                "Connection attempt failed"
                            );
                        }
                    }
                    let attempts = backoff.attempts();
                    status_tx.send_modify(|status| {
                        status.connected = false;
                        status.reconnect_attempts = attempts;
                    });
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(delay) => continue,
                    }
                }
            };

            backoff.reset();
            tracing::info!(
                server = %config.server_address,
                token_expires = connection.grant.expires,
                "Connected to control plane"
            );
            let expires = connection.grant.expires;
            status_tx.send_modify(|status| {
                status.connected = true;
                status.connected_since = Some(current_time_secs());
                status.session_expires = Some(expires);
                status.reconnect_attempts = 0;
            });

            let cancel = shutdown.child_token();
            let Connection { stream, sink, .. } = connection;

            let reader = spawn_reader(stream, Arc::clone(&dispatcher), cancel.clone());
            let writer = spawn_writer(sink, outbound_rx, cancel.clone());
            let heartbeat = spawn_heartbeat(
                outbound.clone(),
                sampler.clone(),
                containers.clone(),
                config.heartbeat_interval,
                cancel.clone(),
            );

            // Any task error cancels the token; so does shutdown.
            cancel.cancelled().await;

            outbound_rx = match writer.await {
                Ok(rx) => rx,
                Err(e) => {
                    tracing::error!(error = %e, "Writer task failed; transport cannot continue");
                    return;
                }
            };
            let _ = reader.await;
            let _ = heartbeat.await;

            subscriptions.cancel_all().await;
            status_tx.send_modify(|status| {
                status.connected = false;
                status.connected_since = None;
                status.session_expires = None;
            });

            if shutdown.is_cancelled() {
                break;
            }
            tracing::info!("Connection closed; reconnecting");
        }

        tracing::debug!("Transport loop stopped");
    }
}

/// Drain inbound frames into the dispatcher.
///
/// Heartbeat acknowledgements stop here. A malformed frame is dropped
/// without killing the connection, since the length prefix already
/// advanced the buffer past it; framing or I/O errors tear the
/// connection down.
fn spawn_reader(
    mut stream: FramedRead<OwnedReadHalf, FrameCodec>,
    dispatcher: Arc<Dispatcher>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            let frame = tokio::select! {
                _ = cancel.cancelled() => break,
                frame = stream.next() => frame,
            };

            match frame {
                Some(Ok(envelope)) => match envelope.message {
                    Message::HeartbeatAck => {
                        tracing::trace!("Heartbeat acknowledged");
                    }
                    message => dispatcher.dispatch(message).await,
                },
                Some(Err(ProtocolError::Malformed(e))) => {
                    tracing::warn!(error = %e, "Dropping malformed frame");
                }
                Some(Err(e)) => {
                    tracing::warn!(error = %e, "Protocol error; dropping connection");
                    cancel.cancel();
                    break;
                }
                None => {
                    tracing::info!("Control plane closed the connection");
                    cancel.cancel();
                    break;
                }
            }
        }
    })
}

/// Drain the outbound queue onto the socket.
///
/// Returns the queue receiver so the next connection picks up where
/// this one left off.
fn spawn_writer(
    mut sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    mut outbound_rx: mpsc::Receiver<Message>,
    cancel: CancellationToken,
) -> JoinHandle<mpsc::Receiver<Message>> {
    tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                _ = cancel.cancelled() => break,
                maybe = outbound_rx.recv() => match maybe {
                    Some(message) => message,
                    None => break,
                },
            };

            let envelope = Envelope::new(generate_nonce(), current_time_secs(), message);
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = sink.send(envelope) => {
                    if let Err(e) = result {
                        tracing::warn!(error = %e, "Write failed; dropping connection");
                        cancel.cancel();
                        break;
                    }
                }
            }
        }
        outbound_rx
    })
}

/// Send a heartbeat with current telemetry on every tick.
fn spawn_heartbeat(
    outbound: OutboundSender,
    sampler: Option<Arc<dyn MetricsSampler>>,
    containers: Option<Arc<dyn ContainerDriver>>,
    period: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    let metrics =
                        heartbeat_snapshot(sampler.as_deref(), containers.as_deref()).await;
                    if let Err(e) = outbound.send(Message::Heartbeat { metrics }) {
                        tracing::warn!(error = %e, "Failed to queue heartbeat");
                    }
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_outbound_queue_rejects_when_full() {
        let (sender, _rx) = outbound_queue(2);

        assert!(sender.send(Message::HeartbeatAck).is_ok());
        assert!(sender.send(Message::HeartbeatAck).is_ok());

        let err = sender.send(Message::HeartbeatAck);
        assert!(matches!(err, Err(ConnectionError::QueueFull)));
    }

    #[test]
    fn test_outbound_queue_reports_closed() {
        let (sender, rx) = outbound_queue(2);
        drop(rx);

        let err = sender.send(Message::HeartbeatAck);
        assert!(matches!(err, Err(ConnectionError::Closed)));
    }

    #[tokio::test]
    async fn test_outbound_queue_preserves_order() {
        let (sender, mut rx) = outbound_queue(8);

        sender
            .send(Message::Subscribe {
                channel: "metrics".to_string(),
            })
            .unwrap();
        sender
            .send(Message::Unsubscribe {
                channel: "metrics".to_string(),
            })
            .unwrap();

        assert!(matches!(rx.recv().await, Some(Message::Subscribe { .. })));
        assert!(matches!(rx.recv().await, Some(Message::Unsubscribe { .. })));
    }
}
