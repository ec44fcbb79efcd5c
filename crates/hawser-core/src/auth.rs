//! Agent credential management and handshake signing
//!
//! Every agent holds an identity triple (agent id, API key, API secret)
//! provisioned out of band. The secret never travels on the wire: the
//! handshake proves possession by signing the envelope fields with
//! HMAC-SHA256, and the control plane verifies against its own copy.
//!
//! # Security Model
//!
//! - Signature: `hex(HMAC-SHA256(api_secret, "{agent_id}:{timestamp}:{nonce}"))`
//! - Timestamps outside the configured skew window are rejected, bounding
//!   the replay window to `2 * allowed_clock_skew`
//! - The credentials file has mode 0600 (owner read/write only) on Unix
//! - Only the key prefix appears in logs and on the wire; the full key
//!   and the secret are never logged
//!
//! Rotation swaps key and secret together under one lock so the agent can
//! never hold a new key alongside an old secret.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::RwLock;

use crate::error::AuthError;

type HmacSha256 = Hmac<Sha256>;

/// Length of a frame nonce in bytes (before hex encoding)
const NONCE_BYTES: usize = 16;

/// Characters of the API key that may appear on the wire and in logs
const KEY_PREFIX_LEN: usize = 8;

/// Agent identity triple
#[derive(Clone, Serialize, Deserialize)]
pub struct Credentials {
    /// Stable agent identifier
    pub agent_id: String,
    /// API key
    pub api_key: String,
    /// API secret (HMAC key, never transmitted)
    pub api_secret: String,
}

impl Credentials {
    /// First characters of the API key, safe for logs and the wire
    pub fn api_key_prefix(&self) -> String {
        self.api_key.chars().take(KEY_PREFIX_LEN).collect()
    }
}

// Manual Debug so an accidental `{:?}` cannot leak the secret
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("agent_id", &self.agent_id)
            .field("api_key", &format!("{}...", self.api_key_prefix()))
            .field("api_secret", &"[redacted]")
            .finish()
    }
}

/// Generate a new random frame nonce
///
/// Returns a 32-character hex string (16 random bytes)
pub fn generate_nonce() -> String {
    use rand::Rng;
    let mut bytes = [0u8; NONCE_BYTES];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Compute the handshake signature over `agent_id:timestamp:nonce`
pub fn sign_handshake(api_secret: &str, agent_id: &str, timestamp: u64, nonce: &str) -> String {
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(format!("{agent_id}:{timestamp}:{nonce}").as_bytes());
    hex::encode(mac.finalize().into_bytes())
}

/// Verify a handshake signature and its timestamp.
///
/// The signature check is constant-time. The timestamp must be within
/// `allowed_skew` of `now` in either direction; outside that window the
/// frame is rejected before any MAC computation.
pub fn verify_handshake(
    api_secret: &str,
    agent_id: &str,
    timestamp: u64,
    nonce: &str,
    signature: &str,
    allowed_skew: Duration,
    now: u64,
) -> Result<(), AuthError> {
    let skew_secs = now.abs_diff(timestamp);
    if skew_secs > allowed_skew.as_secs() {
        return Err(AuthError::ClockSkew {
            skew_secs,
            allowed_secs: allowed_skew.as_secs(),
        });
    }

    let provided = hex::decode(signature).map_err(|_| AuthError::SignatureMismatch)?;
    let mut mac = HmacSha256::new_from_slice(api_secret.as_bytes())
        .expect("HMAC can take key of any size");
    mac.update(format!("{agent_id}:{timestamp}:{nonce}").as_bytes());
    mac.verify_slice(&provided)
        .map_err(|_| AuthError::SignatureMismatch)
}

/// Write credentials to disk with restrictive permissions.
///
/// Creates the parent directory if it doesn't exist. Sets file mode 0600
/// (owner read/write only) on Unix.
pub fn persist_credentials(path: &Path, credentials: &Credentials) -> Result<(), AuthError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(|e| AuthError::Persist(e.to_string()))?;
    }

    let json = serde_json::to_string_pretty(credentials)
        .map_err(|e| AuthError::Persist(e.to_string()))?;
    fs::write(path, json).map_err(|e| AuthError::Persist(e.to_string()))?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let permissions = fs::Permissions::from_mode(0o600);
        fs::set_permissions(path, permissions).map_err(|e| AuthError::Persist(e.to_string()))?;
    }

    Ok(())
}

/// In-memory credentials with a persistent backing file.
///
/// All connection attempts read the current snapshot through
/// [`CredentialStore::current`], so a rotation applies to the next
/// handshake without restarting the transport.
pub struct CredentialStore {
    path: PathBuf,
    current: RwLock<Credentials>,
}

impl CredentialStore {
    /// Load credentials from disk.
    ///
    /// The agent cannot run without an identity, so a missing or
    /// malformed file is an error rather than a default.
    pub fn load(path: &Path) -> Result<Self, AuthError> {
        let contents = fs::read_to_string(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => AuthError::CredentialsNotFound(path.to_path_buf()),
            _ => AuthError::CredentialsInvalid(e.to_string()),
        })?;

        let credentials: Credentials = serde_json::from_str(&contents)
            .map_err(|e| AuthError::CredentialsInvalid(e.to_string()))?;

        tracing::debug!(agent_id = %credentials.agent_id, "Loaded agent credentials");

        Ok(Self {
            path: path.to_path_buf(),
            current: RwLock::new(credentials),
        })
    }

    /// Snapshot of the current credentials
    pub async fn current(&self) -> Credentials {
        self.current.read().await.clone()
    }

    /// Swap in rotated credentials and persist them.
    ///
    /// Key and secret rotate together under the write lock. The in-memory
    /// swap stands even when persistence fails: the control plane may
    /// already have invalidated the old secret, and the caller reports
    /// the persistence failure in the rotation ack instead of reverting.
    pub async fn rotate(&self, api_key: String, api_secret: String) -> Result<(), AuthError> {
        let updated = {
            let mut current = self.current.write().await;
            current.api_key = api_key;
            current.api_secret = api_secret;
            current.clone()
        };

        persist_credentials(&self.path, &updated)
    }

    /// Path of the backing file
    pub fn path(&self) -> &Path {
        &self.path
    }
}
