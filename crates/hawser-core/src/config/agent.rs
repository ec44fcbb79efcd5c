//! Agent configuration

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use super::serde_utils::duration_secs;

/// Configuration for the host agent daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Control plane address to connect to (host:port)
    pub server_address: String,

    /// Path to the credentials file (agent id, API key, API secret)
    pub credentials_path: PathBuf,

    /// Heartbeat interval
    #[serde(with = "duration_secs")]
    pub heartbeat_interval: Duration,

    /// TCP connect timeout
    #[serde(with = "duration_secs")]
    pub connect_timeout: Duration,

    /// Deadline for the auth verdict after the connection opens
    #[serde(with = "duration_secs")]
    pub handshake_timeout: Duration,

    /// Maximum accepted clock skew for signed timestamps, either direction
    #[serde(with = "duration_secs")]
    pub allowed_clock_skew: Duration,

    /// Outbound send queue capacity in frames
    pub send_queue_capacity: usize,

    /// Emission interval for subscription streams
    #[serde(with = "duration_secs")]
    pub stream_interval: Duration,

    /// Default shell for terminal sessions (None = $SHELL, then platform default)
    pub default_shell: Option<String>,

    /// Default environment variables for terminal sessions
    pub default_env: Vec<(String, String)>,

    /// Maximum concurrent terminal sessions
    pub max_sessions: Option<u32>,

    /// Reconnect backoff
    pub backoff: BackoffConfig,

    /// Self-update behavior
    pub update: UpdateConfig,

    /// Loopback admin endpoint
    pub admin: AdminConfig,

    /// Log file path (logs go to stderr only when unset)
    pub log_file: Option<PathBuf>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            server_address: "localhost:7500".to_string(),
            credentials_path: super::default_config_dir().join("credentials.json"),
            heartbeat_interval: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(10),
            allowed_clock_skew: Duration::from_secs(300),
            send_queue_capacity: 100,
            stream_interval: Duration::from_secs(2),
            default_shell: None,
            default_env: vec![("TERM".to_string(), "xterm-256color".to_string())],
            max_sessions: None,
            backoff: BackoffConfig::default(),
            update: UpdateConfig::default(),
            admin: AdminConfig::default(),
            log_file: None,
        }
    }
}

/// Exponential backoff configuration for reconnects.
///
/// There is deliberately no jitter knob: a single agent reconnecting to
/// its own control plane gains nothing from desynchronization, and
/// monotonically growing delays are easier to reason about in logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    /// Initial delay
    #[serde(with = "duration_secs")]
    pub initial: Duration,

    /// Maximum delay
    #[serde(with = "duration_secs")]
    pub max: Duration,

    /// Multiplier applied after each failed attempt
    pub multiplier: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            multiplier: 2.0,
        }
    }
}

/// Self-update configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Whether scheduled checks and update commands are available
    pub enabled: bool,

    /// Update service base URL; updates are disabled when unset
    pub endpoint: Option<String>,

    /// Interval between scheduled version checks
    #[serde(with = "duration_secs")]
    pub check_interval: Duration,

    /// Delay before the first scheduled check after startup
    #[serde(with = "duration_secs")]
    pub initial_delay: Duration,

    /// Install updates found by scheduled checks without operator action
    pub auto_install: bool,

    /// Service unit to restart after an install (POSIX); when unset the
    /// agent re-executes itself
    pub service_name: Option<String>,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            endpoint: None,
            check_interval: Duration::from_secs(6 * 60 * 60),
            initial_delay: Duration::from_secs(30),
            auto_install: false,
            service_name: None,
        }
    }
}

impl UpdateConfig {
    /// Whether the updater can actually run
    pub fn is_active(&self) -> bool {
        self.enabled && self.endpoint.is_some()
    }
}

/// Loopback admin endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdminConfig {
    /// Whether the admin endpoint is served at all
    pub enabled: bool,

    /// Port to bind on 127.0.0.1
    pub port: u16,
}

impl Default for AdminConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: 7433,
        }
    }
}

impl AdminConfig {
    /// Get the bind address (always loopback)
    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }
}
