//! Core error types for Hawser

use hawser_protocol::ProtocolError;
use std::path::PathBuf;
use thiserror::Error;

/// Top-level error type for the Hawser ecosystem
#[derive(Error, Debug)]
pub enum HawserError {
    /// Protocol error
    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// Connection error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Session error
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Authentication error
    #[error("Authentication error: {0}")]
    Auth(#[from] AuthError),

    /// Update error
    #[error("Update error: {0}")]
    Update(#[from] UpdateError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Connection-related errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// Connection refused by the control plane
    #[error("Connection refused: {0}")]
    Refused(String),

    /// Established connection dropped
    #[error("Connection lost: {0}")]
    Lost(String),

    /// No handshake reply within the deadline
    #[error("Handshake timed out")]
    HandshakeTimeout,

    /// Control plane rejected the handshake
    #[error("Handshake rejected: {0}")]
    HandshakeRejected(String),

    /// First reply was not an auth verdict
    #[error("Unexpected handshake reply: {0}")]
    UnexpectedReply(String),

    /// Outbound queue is at capacity
    #[error("Send queue full")]
    QueueFull,

    /// Transport has shut down and will not reconnect
    #[error("Transport is shut down")]
    Closed,
}

/// Terminal session errors
#[derive(Error, Debug)]
pub enum SessionError {
    /// Session not found
    #[error("Session not found: {0}")]
    NotFound(String),

    /// Session already exists
    #[error("Session already exists: {0}")]
    AlreadyExists(String),

    /// PTY allocation failed
    #[error("PTY allocation failed: {0}")]
    PtyAllocation(String),

    /// Requested shell is not on the allowlist or not installed
    #[error("Shell '{0}' is not permitted on this host")]
    ShellNotAllowed(String),

    /// Session is closed
    #[error("Session is closed: {0}")]
    Closed(String),

    /// Session limit exceeded
    #[error("Session limit exceeded")]
    LimitExceeded,

    /// I/O against the session failed
    #[error("Session I/O error: {0}")]
    Io(String),
}

/// Credential and handshake errors
#[derive(Error, Debug)]
pub enum AuthError {
    /// Credentials file not found
    #[error("Credentials file not found: {0}")]
    CredentialsNotFound(PathBuf),

    /// Credentials file unreadable or malformed
    #[error("Invalid credentials file: {0}")]
    CredentialsInvalid(String),

    /// Rotated credentials could not be written to disk
    #[error("Failed to persist credentials: {0}")]
    Persist(String),

    /// Signature does not match the signed fields
    #[error("Signature mismatch")]
    SignatureMismatch,

    /// Timestamp outside the accepted window
    #[error("Timestamp skew of {skew_secs}s exceeds allowed {allowed_secs}s")]
    ClockSkew { skew_secs: u64, allowed_secs: u64 },
}

/// Self-update errors
#[derive(Error, Debug)]
pub enum UpdateError {
    /// Version check request failed
    #[error("Version check failed: {0}")]
    CheckFailed(String),

    /// Artifact download failed
    #[error("Download failed: {0}")]
    DownloadFailed(String),

    /// Downloaded artifact does not match the manifest
    #[error("Checksum mismatch: expected {expected}, got {actual}")]
    ChecksumMismatch { expected: String, actual: String },

    /// Archive could not be unpacked
    #[error("Extraction failed: {0}")]
    ExtractionFailed(String),

    /// Binary swap failed (backup restored)
    #[error("Install failed: {0}")]
    InstallFailed(String),

    /// Agent restart after install failed
    #[error("Restart failed: {0}")]
    RestartFailed(String),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("TOML serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),

    /// Missing required field
    #[error("Missing required field: {0}")]
    MissingField(String),
}
