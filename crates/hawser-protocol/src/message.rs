//! Message types for the Hawser agent protocol
//!
//! This module defines the JSON messages exchanged between an agent and
//! the control plane. Messages travel inside an [`Envelope`] carrying a
//! per-frame nonce and timestamp, and are framed on the wire by the codec
//! defined in `codec.rs`.
//!
//! # Message Flow
//!
//! Typical sequence over the lifetime of a connection:
//!
//! 1. Agent connects and sends `auth` (HMAC signature over
//!    `agent_id:timestamp:nonce`)
//! 2. Control plane responds with `auth_ok` (session token) or `auth_fail`
//! 3. Agent sends `heartbeat` with telemetry on an interval; the control
//!    plane answers each with `heartbeat_ack`
//! 4. Control plane sends `command`; the agent answers with
//!    `command_result` carrying the same id
//! 5. Control plane manages streaming with `subscribe`/`unsubscribe`; the
//!    agent emits `stream` frames on subscribed channels
//! 6. Control plane rotates credentials with `credential_update`; the
//!    agent answers with `credential_update_ack`
//!
//! Either side may send `error` for conditions that are not tied to a
//! specific command.

use serde::{Deserialize, Serialize};

/// Per-frame wrapper carrying replay-protection fields.
///
/// Every frame on the wire is a single JSON object: the envelope fields
/// plus the message fields, with the message variant selected by the
/// `type` key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Random hex nonce, unique per frame
    pub nonce: String,
    /// Sender's clock at frame construction (unix seconds)
    pub timestamp: u64,
    /// The message payload
    #[serde(flatten)]
    pub message: Message,
}

impl Envelope {
    /// Create a new envelope
    pub fn new(nonce: String, timestamp: u64, message: Message) -> Self {
        Self {
            nonce,
            timestamp,
            message,
        }
    }
}

/// Telemetry snapshot attached to every heartbeat
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct HeartbeatMetrics {
    /// CPU utilization across all cores, 0.0-100.0
    pub cpu_percent: f32,
    /// Used physical memory as a fraction of total, 0.0-100.0
    pub memory_percent: f32,
    /// Used disk space as a fraction of total, 0.0-100.0
    pub disk_percent: f32,
    /// Total containers known to the local engine
    pub container_count: u32,
    /// Containers currently running
    pub container_running: u32,
}

/// Error codes for `error` messages
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// Authentication failed
    AuthFailed,
    /// Frame was parseable but not valid in the current state
    InvalidMessage,
    /// Referenced session does not exist
    SessionNotFound,
    /// Session limit exceeded
    SessionLimit,
    /// Unclassified internal error
    Internal,
}

/// Protocol messages
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Message {
    /// Handshake request, first frame sent by the agent.
    ///
    /// The signature is `hex(HMAC-SHA256(api_secret,
    /// "{agent_id}:{timestamp}:{nonce}"))` where timestamp and nonce are
    /// the envelope fields of this frame. Only the key prefix travels on
    /// the wire; the full key and the secret never do.
    Auth {
        /// Stable agent identifier
        agent_id: String,
        /// First characters of the API key, for operator-facing logs
        api_key_prefix: String,
        /// Hex HMAC-SHA256 over `agent_id:timestamp:nonce`
        signature: String,
    },

    /// Handshake accepted
    AuthOk {
        /// Opaque token identifying this session to the control plane
        session_token: String,
        /// Token expiry (unix seconds)
        expires: u64,
    },

    /// Handshake rejected
    AuthFail {
        /// Reason for rejection
        error: String,
    },

    /// Periodic liveness report with telemetry
    Heartbeat {
        /// Snapshot taken just before sending
        metrics: HeartbeatMetrics,
    },

    /// Acknowledgment of a heartbeat
    HeartbeatAck,

    /// Remote command request
    Command {
        /// Correlation id, echoed in the result
        id: String,
        /// Namespaced action, e.g. `terminal.create` or `system.metrics`
        action: String,
        /// Action-specific arguments
        params: serde_json::Value,
        /// Execution deadline in milliseconds; absent means no deadline
        #[serde(default, skip_serializing_if = "Option::is_none")]
        timeout_ms: Option<u64>,
    },

    /// Outcome of a command
    CommandResult {
        /// Id of the command this answers
        command_id: String,
        /// Whether the handler completed without error
        success: bool,
        /// Handler output (null on failure)
        data: serde_json::Value,
        /// Error description when `success` is false
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
        /// Wall-clock handler duration in milliseconds
        duration_ms: u64,
    },

    /// Start streaming on a channel
    Subscribe {
        /// Channel name, e.g. `metrics` or `terminal:<session-id>`
        channel: String,
    },

    /// Stop streaming on a channel
    Unsubscribe {
        /// Channel name
        channel: String,
    },

    /// One streamed datum on a subscribed channel
    Stream {
        /// Channel this datum belongs to
        channel: String,
        /// Channel-specific payload
        data: serde_json::Value,
    },

    /// Credential rotation request.
    ///
    /// Key and secret always rotate together; the agent must never end up
    /// with a new key and an old secret.
    CredentialUpdate {
        /// Correlation id, echoed in the ack
        rotation_id: String,
        /// Replacement API key
        api_key: String,
        /// Replacement API secret
        api_secret: String,
    },

    /// Outcome of a credential rotation
    CredentialUpdateAck {
        /// Id of the rotation this answers
        rotation_id: String,
        /// Whether the new credentials were persisted
        success: bool,
        /// Failure description when `success` is false
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<String>,
    },

    /// Error not tied to a specific command
    Error {
        /// Machine-readable code
        code: ErrorCode,
        /// Human-readable details
        details: String,
    },
}

impl Message {
    /// Get the wire tag for this message, for logging
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Auth { .. } => "auth",
            Message::AuthOk { .. } => "auth_ok",
            Message::AuthFail { .. } => "auth_fail",
            Message::Heartbeat { .. } => "heartbeat",
            Message::HeartbeatAck => "heartbeat_ack",
            Message::Command { .. } => "command",
            Message::CommandResult { .. } => "command_result",
            Message::Subscribe { .. } => "subscribe",
            Message::Unsubscribe { .. } => "unsubscribe",
            Message::Stream { .. } => "stream",
            Message::CredentialUpdate { .. } => "credential_update",
            Message::CredentialUpdateAck { .. } => "credential_update_ack",
            Message::Error { .. } => "error",
        }
    }
}

/// Name of the stream channel carrying a terminal session's events.
///
/// Output and close notifications for session `s` ride `stream` frames on
/// channel `terminal:s` with payloads `{event: "output", data: <base64>}`
/// and `{event: "closed", reason}`.
pub fn terminal_channel(session_id: &str) -> String {
    format!("terminal:{session_id}")
}

/// Serde helper for binary fields carried as base64 strings.
///
/// JSON cannot hold raw bytes; terminal input and output use this module
/// via `#[serde(with = "base64_bytes")]`.
pub mod base64_bytes {
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(bytes: &[u8], serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(bytes).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        STANDARD.decode(encoded.as_bytes()).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_metrics() -> HeartbeatMetrics {
        HeartbeatMetrics {
            cpu_percent: 12.5,
            memory_percent: 40.0,
            disk_percent: 71.3,
            container_count: 4,
            container_running: 2,
        }
    }

    #[test]
    fn test_envelope_flattens_message_fields() {
        let envelope = Envelope::new(
            "a1b2c3".to_string(),
            1_700_000_000,
            Message::Auth {
                agent_id: "agent-7".to_string(),
                api_key_prefix: "hk_12345".to_string(),
                signature: "deadbeef".to_string(),
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(value["type"], "auth");
        assert_eq!(value["nonce"], "a1b2c3");
        assert_eq!(value["timestamp"], 1_700_000_000u64);
        assert_eq!(value["agent_id"], "agent-7");
        assert_eq!(value["api_key_prefix"], "hk_12345");
        assert_eq!(value["signature"], "deadbeef");
        // Envelope and message fields share one flat object
        assert!(value.get("message").is_none());
    }

    #[test]
    fn test_wire_tags_match_kind() {
        let messages = [
            Message::HeartbeatAck,
            Message::Heartbeat {
                metrics: sample_metrics(),
            },
            Message::Subscribe {
                channel: "metrics".to_string(),
            },
            Message::CommandResult {
                command_id: "c1".to_string(),
                success: true,
                data: serde_json::json!({"ok": true}),
                error: None,
                duration_ms: 12,
            },
        ];

        for message in messages {
            let expected = message.kind();
            let envelope = Envelope::new("n".to_string(), 0, message);
            let value = serde_json::to_value(&envelope).unwrap();
            assert_eq!(value["type"], expected);
        }
    }

    #[test]
    fn test_optional_fields_omitted() {
        let envelope = Envelope::new(
            "n".to_string(),
            0,
            Message::Command {
                id: "c1".to_string(),
                action: "system.metrics".to_string(),
                params: serde_json::json!({}),
                timeout_ms: None,
            },
        );

        let value = serde_json::to_value(&envelope).unwrap();
        assert!(value.get("timeout_ms").is_none());
    }

    #[test]
    fn test_command_deserializes_without_timeout() {
        let raw = r#"{
            "nonce": "abc",
            "timestamp": 1700000000,
            "type": "command",
            "id": "c9",
            "action": "terminal.close",
            "params": {"session_id": "s1"}
        }"#;

        let envelope: Envelope = serde_json::from_str(raw).unwrap();
        match envelope.message {
            Message::Command {
                id,
                action,
                timeout_ms,
                ..
            } => {
                assert_eq!(id, "c9");
                assert_eq!(action, "terminal.close");
                assert_eq!(timeout_ms, None);
            }
            other => panic!("Expected Command, got {}", other.kind()),
        }
    }

    #[test]
    fn test_terminal_channel_name() {
        assert_eq!(terminal_channel("s-42"), "terminal:s-42");
    }

    #[test]
    fn test_base64_bytes_roundtrip() {
        #[derive(Serialize, Deserialize)]
        struct Wrapper {
            #[serde(with = "base64_bytes")]
            data: Vec<u8>,
        }

        let wrapper = Wrapper {
            data: vec![0x00, 0xFF, 0x10, 0x7F],
        };
        let json = serde_json::to_string(&wrapper).unwrap();
        assert!(json.contains("AP8Qfw=="));

        let back: Wrapper = serde_json::from_str(&json).unwrap();
        assert_eq!(back.data, vec![0x00, 0xFF, 0x10, 0x7F]);
    }
}
