//! Control-plane connection establishment
//!
//! Dials the control plane over TCP and completes the signed handshake
//! before any other traffic flows. The first frame on a fresh socket is
//! always `auth`; the reply is exactly one `auth_ok` or `auth_fail`.

use futures::{SinkExt, StreamExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio_util::codec::{FramedRead, FramedWrite};

use hawser_core::auth::{self, CredentialStore};
use hawser_core::config::AgentConfig;
use hawser_core::error::ConnectionError;
use hawser_core::time::current_time_secs;
use hawser_protocol::{Envelope, FrameCodec, Message};

/// Session token granted by a successful handshake
#[derive(Debug, Clone)]
pub struct SessionGrant {
    pub token: String,
    /// Unix timestamp after which the token is no longer valid
    pub expires: u64,
}

/// An authenticated control-plane connection, split into framed halves
pub struct Connection {
    pub stream: FramedRead<OwnedReadHalf, FrameCodec>,
    pub sink: FramedWrite<OwnedWriteHalf, FrameCodec>,
    pub grant: SessionGrant,
}

impl Connection {
    /// Dial the control plane and authenticate.
    ///
    /// The handshake envelope is signed over `agent_id:timestamp:nonce`
    /// with the current API secret, so a rotation that lands between
    /// attempts is picked up automatically on the next dial.
    pub async fn establish(
        config: &AgentConfig,
        store: &CredentialStore,
    ) -> Result<Self, ConnectionError> {
        let credentials = store.current().await;

        let tcp = tokio::time::timeout(
            config.connect_timeout,
            TcpStream::connect(&config.server_address),
        )
        .await
        .map_err(|_| {
            ConnectionError::Refused(format!(
                "connect to {} timed out after {:?}",
                config.server_address, config.connect_timeout
            ))
        })?
        .map_err(|e| ConnectionError::Refused(e.to_string()))?;

        // Terminal traffic is latency-sensitive
        let _ = tcp.set_nodelay(true);

        let (read_half, write_half) = tcp.into_split();
        let mut stream = FramedRead::new(read_half, FrameCodec::new());
        let mut sink = FramedWrite::new(write_half, FrameCodec::new());

        let nonce = auth::generate_nonce();
        let timestamp = current_time_secs();
        let signature =
            auth::sign_handshake(&credentials.api_secret, &credentials.agent_id, timestamp, &nonce);

        let hello = Envelope::new(
            nonce,
            timestamp,
            Message::Auth {
                agent_id: credentials.agent_id.clone(),
                api_key_prefix: credentials.api_key_prefix(),
                signature,
            },
        );
        sink.send(hello)
            .await
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;

        let reply = tokio::time::timeout(config.handshake_timeout, stream.next())
            .await
            .map_err(|_| ConnectionError::HandshakeTimeout)?
            .ok_or_else(|| ConnectionError::Lost("connection closed during handshake".to_string()))?
            .map_err(|e| ConnectionError::Lost(e.to_string()))?;

        let grant = match reply.message {
            Message::AuthOk {
                session_token,
                expires,
            } => SessionGrant {
                token: session_token,
                expires,
            },
            Message::AuthFail { error } => {
                return Err(ConnectionError::HandshakeRejected(error));
            }
            other => {
                return Err(ConnectionError::UnexpectedReply(other.kind().to_string()));
            }
        };

        tracing::debug!(
            agent_id = %credentials.agent_id,
            expires = grant.expires,
            "Handshake complete"
        );

        Ok(Self {
            stream,
            sink,
            grant,
        })
    }
}
