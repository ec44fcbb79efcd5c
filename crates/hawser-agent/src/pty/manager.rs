//! Terminal session management
//!
//! Each session is a shell running on a pseudo-terminal, identified by
//! the control plane's session id. A blocking reader thread pumps PTY
//! output into the session's output callback; the registry lock guards
//! only the session map, never the I/O itself, so a stuck shell cannot
//! stall unrelated sessions.
//!
//! Sessions deliberately outlive the control-plane connection. Output
//! produced while the link is down is dropped once the outbound queue
//! fills, but the shell itself keeps running until an explicit close or
//! its own exit.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use portable_pty::{native_pty_system, Child, CommandBuilder, MasterPty, PtySize};
use serde::Serialize;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use hawser_core::error::SessionError;

/// Receives every chunk the shell writes. The buffer is owned by the
/// callback; the reader never reuses it.
pub type OutputCallback = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Fires once when a session ends on its own. Suppressed for explicit
/// closes, where the command reply already carries the outcome.
pub type CloseCallback = Arc<dyn Fn(String) + Send + Sync>;

/// Read size for the PTY output pump
const OUTPUT_BUF_SIZE: usize = 4096;

/// How long `close` waits for the reader thread to wind down
const READER_JOIN_TIMEOUT: Duration = Duration::from_millis(500);

/// Snapshot of a live session
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: String,
    pub shell: String,
    pub cols: u16,
    pub rows: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
}

struct TerminalSession {
    master: Box<dyn MasterPty + Send>,
    child: Box<dyn Child + Send + Sync>,
    writer: Arc<Mutex<Box<dyn Write + Send>>>,
    /// Set by `close` before the child is killed, so the reader knows
    /// not to report the resulting EOF as a spontaneous exit
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    reader_handle: JoinHandle<()>,
    pid: Option<u32>,
    shell: String,
    cols: u16,
    rows: u16,
}

/// Registry of terminal sessions keyed by control-plane session id
pub struct TerminalManager {
    sessions: Mutex<HashMap<String, TerminalSession>>,
    default_shell: Option<String>,
    default_env: Vec<(String, String)>,
    max_sessions: Option<u32>,
}

impl TerminalManager {
    pub fn new(
        default_shell: Option<String>,
        default_env: Vec<(String, String)>,
        max_sessions: Option<u32>,
    ) -> Self {
        let mut env = vec![("TERM".to_string(), "xterm-256color".to_string())];
        env.extend(default_env);

        Self {
            sessions: Mutex::new(HashMap::new()),
            default_shell,
            default_env: env,
            max_sessions,
        }
    }

    /// Create a session and start pumping its output.
    ///
    /// The registry lock is held for the whole sequence so a duplicate
    /// id can never slip in between the check and the insert.
    pub async fn create(
        self: &Arc<Self>,
        session_id: &str,
        cols: u16,
        rows: u16,
        shell: Option<String>,
        on_output: OutputCallback,
        on_close: CloseCallback,
    ) -> Result<SessionInfo, SessionError> {
        let mut sessions = self.sessions.lock().await;

        if sessions.contains_key(session_id) {
            return Err(SessionError::AlreadyExists(session_id.to_string()));
        }
        if let Some(max) = self.max_sessions {
            if sessions.len() as u32 >= max {
                return Err(SessionError::LimitExceeded);
            }
        }

        let shell_path = resolve_shell(shell.as_deref(), self.default_shell.as_deref())?;

        let pair = native_pty_system()
            .openpty(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

        let mut cmd = CommandBuilder::new(&shell_path);
        for (key, value) in &self.default_env {
            cmd.env(key, value);
        }

        let child = pair
            .slave
            .spawn_command(cmd)
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;
        // Drop our copy of the slave so the master reader sees EOF when
        // the child exits
        drop(pair.slave);

        let pid = child.process_id();
        let reader = pair
            .master
            .try_clone_reader()
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;
        let writer = pair
            .master
            .take_writer()
            .map_err(|e| SessionError::PtyAllocation(e.to_string()))?;

        let closed = Arc::new(AtomicBool::new(false));
        let cancel = CancellationToken::new();
        let reader_handle = spawn_output_reader(
            reader,
            ReaderShared {
                session_id: session_id.to_string(),
                closed: Arc::clone(&closed),
                cancel: cancel.clone(),
                on_output,
                on_close,
                manager: Arc::downgrade(self),
            },
        );

        sessions.insert(
            session_id.to_string(),
            TerminalSession {
                master: pair.master,
                child,
                writer: Arc::new(Mutex::new(writer)),
                closed,
                cancel,
                reader_handle,
                pid,
                shell: shell_path.clone(),
                cols,
                rows,
            },
        );

        tracing::info!(
            session_id,
            shell = %shell_path,
            pid = ?pid,
            cols,
            rows,
            "Terminal session created"
        );

        Ok(SessionInfo {
            session_id: session_id.to_string(),
            shell: shell_path,
            cols,
            rows,
            pid,
        })
    }

    /// Write input to a session's shell.
    ///
    /// Only the writer handle is copied out under the registry lock;
    /// the write itself holds just that session's writer lock.
    pub async fn write(&self, session_id: &str, data: &[u8]) -> Result<(), SessionError> {
        let writer = {
            let sessions = self.sessions.lock().await;
            let session = sessions
                .get(session_id)
                .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;
            if session.closed.load(Ordering::SeqCst) {
                return Err(SessionError::Closed(session_id.to_string()));
            }
            Arc::clone(&session.writer)
        };

        let mut writer = writer.lock().await;
        writer
            .write_all(data)
            .map_err(|e| SessionError::Io(e.to_string()))?;
        writer.flush().map_err(|e| SessionError::Io(e.to_string()))?;
        Ok(())
    }

    /// Resize a session's terminal.
    pub async fn resize(&self, session_id: &str, cols: u16, rows: u16) -> Result<(), SessionError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound(session_id.to_string()))?;

        session
            .master
            .resize(PtySize {
                rows,
                cols,
                pixel_width: 0,
                pixel_height: 0,
            })
            .map_err(|e| SessionError::Io(e.to_string()))?;

        session.cols = cols;
        session.rows = rows;
        tracing::debug!(session_id, cols, rows, "Terminal session resized");
        Ok(())
    }

    /// Close a session, killing its shell.
    ///
    /// Closing an unknown or already-closed session succeeds with no
    /// exit code, so the control plane can retry safely.
    pub async fn close(&self, session_id: &str) -> Result<Option<i32>, SessionError> {
        let session = { self.sessions.lock().await.remove(session_id) };
        let Some(mut session) = session else {
            tracing::debug!(session_id, "Close for unknown or already-ended session");
            return Ok(None);
        };

        session.closed.store(true, Ordering::SeqCst);
        session.cancel.cancel();

        let _ = session.child.kill();
        let exit = session
            .child
            .wait()
            .ok()
            .map(|status| status.exit_code() as i32);

        // The reader unblocks once the child is gone; don't wait forever
        let _ = tokio::time::timeout(READER_JOIN_TIMEOUT, session.reader_handle).await;

        tracing::info!(session_id, exit_code = ?exit, "Terminal session closed");
        Ok(exit)
    }

    /// Close every session. Used at shutdown.
    pub async fn close_all(&self) {
        let ids: Vec<String> = { self.sessions.lock().await.keys().cloned().collect() };
        for id in ids {
            if let Err(e) = self.close(&id).await {
                tracing::warn!(session_id = %id, error = %e, "Failed to close session");
            }
        }
    }

    pub async fn count(&self) -> usize {
        self.sessions.lock().await.len()
    }

    /// Snapshots of all live sessions, sorted by id
    pub async fn sessions(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.lock().await;
        let mut infos: Vec<SessionInfo> = sessions
            .iter()
            .map(|(id, session)| SessionInfo {
                session_id: id.clone(),
                shell: session.shell.clone(),
                cols: session.cols,
                rows: session.rows,
                pid: session.pid,
            })
            .collect();
        infos.sort_by(|a, b| a.session_id.cmp(&b.session_id));
        infos
    }

    /// Drop a session whose shell ended on its own. Called from the
    /// reader thread, hence the blocking lock.
    fn reap(&self, session_id: &str) {
        let entry = self.sessions.blocking_lock().remove(session_id);
        if let Some(mut session) = entry {
            session.cancel.cancel();
            let _ = session.child.kill();
            let _ = session.child.wait();
            tracing::debug!(session_id, "Session reaped after exit");
        }
    }
}

struct ReaderShared {
    session_id: String,
    closed: Arc<AtomicBool>,
    cancel: CancellationToken,
    on_output: OutputCallback,
    on_close: CloseCallback,
    manager: Weak<TerminalManager>,
}

/// Pump PTY output into the session callback on a blocking thread.
///
/// The reader ends on EOF, on a read error, or when the session's
/// cancellation token fires. A spontaneous end fires `on_close` exactly
/// once and removes the session from the registry.
fn spawn_output_reader(mut reader: Box<dyn Read + Send>, shared: ReaderShared) -> JoinHandle<()> {
    tokio::task::spawn_blocking(move || {
        let mut buf = [0u8; OUTPUT_BUF_SIZE];
        let ended = loop {
            if shared.cancel.is_cancelled() {
                break false;
            }
            match reader.read(&mut buf) {
                Ok(0) => break true,
                Ok(n) => {
                    if shared.cancel.is_cancelled() {
                        break false;
                    }
                    (shared.on_output)(buf[..n].to_vec());
                }
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(e) => {
                    // Linux reports EIO on the master once the child is gone
                    tracing::debug!(session_id = %shared.session_id, error = %e, "PTY read ended");
                    break true;
                }
            }
        };

        if ended && !shared.closed.load(Ordering::SeqCst) {
            tracing::info!(session_id = %shared.session_id, "Terminal session exited");
            (shared.on_close)("exited".to_string());
            if let Some(manager) = shared.manager.upgrade() {
                manager.reap(&shared.session_id);
            }
        }
    })
}

/// Pick and validate the shell for a new session.
///
/// Resolution order: explicit request, configured default, `$SHELL`,
/// platform fallback. The result must be a known shell; session ids and
/// sizes come from the control plane, but we refuse to exec arbitrary
/// paths it names.
fn resolve_shell(
    requested: Option<&str>,
    default_shell: Option<&str>,
) -> Result<String, SessionError> {
    let shell = requested
        .map(str::to_string)
        .or_else(|| default_shell.map(str::to_string))
        .or_else(|| std::env::var("SHELL").ok())
        .unwrap_or_else(|| {
            if cfg!(windows) {
                "cmd.exe".to_string()
            } else {
                "/bin/sh".to_string()
            }
        });

    if !shell_is_allowed(&shell) {
        return Err(SessionError::ShellNotAllowed(shell));
    }

    #[cfg(unix)]
    if !Path::new(&shell).exists() {
        return Err(SessionError::ShellNotAllowed(shell));
    }

    Ok(shell)
}

#[cfg(unix)]
fn shell_is_allowed(shell: &str) -> bool {
    const NAMES: &[&str] = &["sh", "bash", "zsh", "fish", "dash", "ksh"];
    const DIRS: &[&str] = &["/bin", "/usr/bin", "/usr/local/bin", "/opt/homebrew/bin"];

    let path = Path::new(shell);
    let known_name = path
        .file_name()
        .and_then(|n| n.to_str())
        .is_some_and(|n| NAMES.contains(&n));
    let known_dir = path
        .parent()
        .and_then(|p| p.to_str())
        .is_some_and(|p| DIRS.contains(&p));
    if known_name && known_dir {
        return true;
    }

    // Anything the administrator lists in /etc/shells is also fine
    if let Ok(shells) = std::fs::read_to_string("/etc/shells") {
        if shells
            .lines()
            .map(str::trim)
            .any(|line| !line.starts_with('#') && line == shell)
        {
            return true;
        }
    }

    false
}

#[cfg(windows)]
fn shell_is_allowed(shell: &str) -> bool {
    const NAMES: &[&str] = &["cmd.exe", "powershell.exe", "pwsh.exe"];
    let name = Path::new(shell)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(shell);
    NAMES.iter().any(|a| a.eq_ignore_ascii_case(name))
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex as StdMutex;

    struct Captured {
        output: Arc<StdMutex<Vec<u8>>>,
        closes: Arc<AtomicUsize>,
    }

    fn callbacks() -> (Captured, OutputCallback, CloseCallback) {
        let output = Arc::new(StdMutex::new(Vec::new()));
        let closes = Arc::new(AtomicUsize::new(0));

        let on_output: OutputCallback = {
            let output = Arc::clone(&output);
            Arc::new(move |chunk: Vec<u8>| {
                output.lock().unwrap().extend_from_slice(&chunk);
            })
        };
        let on_close: CloseCallback = {
            let closes = Arc::clone(&closes);
            Arc::new(move |_reason: String| {
                closes.fetch_add(1, Ordering::SeqCst);
            })
        };

        (Captured { output, closes }, on_output, on_close)
    }

    fn manager() -> Arc<TerminalManager> {
        Arc::new(TerminalManager::new(
            Some("/bin/sh".to_string()),
            Vec::new(),
            Some(4),
        ))
    }

    async fn wait_for_output(captured: &Captured, needle: &[u8]) -> bool {
        for _ in 0..100 {
            {
                let output = captured.output.lock().unwrap();
                if output
                    .windows(needle.len())
                    .any(|window| window == needle)
                {
                    return true;
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        false
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_echoes_output() {
        let manager = manager();
        let (captured, on_output, on_close) = callbacks();

        manager
            .create("term-1", 80, 24, None, on_output, on_close)
            .await
            .unwrap();
        manager
            .write("term-1", b"echo terminal_ready_marker\n")
            .await
            .unwrap();

        assert!(wait_for_output(&captured, b"terminal_ready_marker").await);

        let exit = manager.close("term-1").await.unwrap();
        assert!(exit.is_some());
        // Explicit close must not fire the close callback
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(captured.closes.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_duplicate_id_rejected() {
        let manager = manager();
        let (_captured, on_output, on_close) = callbacks();

        manager
            .create("term-dup", 80, 24, None, on_output.clone(), on_close.clone())
            .await
            .unwrap();
        let err = manager
            .create("term-dup", 80, 24, None, on_output, on_close)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::AlreadyExists(_)));
        manager.close_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_session_limit() {
        let manager = Arc::new(TerminalManager::new(
            Some("/bin/sh".to_string()),
            Vec::new(),
            Some(1),
        ));
        let (_captured, on_output, on_close) = callbacks();

        manager
            .create("term-a", 80, 24, None, on_output.clone(), on_close.clone())
            .await
            .unwrap();
        let err = manager
            .create("term-b", 80, 24, None, on_output, on_close)
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::LimitExceeded));
        manager.close_all().await;
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_spontaneous_exit_fires_close_once() {
        let manager = manager();
        let (captured, on_output, on_close) = callbacks();

        manager
            .create("term-exit", 80, 24, None, on_output, on_close)
            .await
            .unwrap();
        manager.write("term-exit", b"exit\n").await.unwrap();

        // The reader notices EOF, fires on_close, and reaps the session
        for _ in 0..100 {
            if captured.closes.load(Ordering::SeqCst) == 1 && manager.count().await == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        assert_eq!(captured.closes.load(Ordering::SeqCst), 1);
        assert_eq!(manager.count().await, 0);

        // A late explicit close is a quiet no-op
        assert!(manager.close("term-exit").await.unwrap().is_none());
        assert_eq!(captured.closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_write_to_unknown_session() {
        let manager = manager();
        let err = manager.write("nope", b"x").await.unwrap_err();
        assert!(matches!(err, SessionError::NotFound(_)));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_resize_and_info() {
        let manager = manager();
        let (_captured, on_output, on_close) = callbacks();

        let info = manager
            .create("term-size", 80, 24, None, on_output, on_close)
            .await
            .unwrap();
        assert_eq!((info.cols, info.rows), (80, 24));

        manager.resize("term-size", 120, 40).await.unwrap();
        let sessions = manager.sessions().await;
        assert_eq!(sessions.len(), 1);
        assert_eq!((sessions[0].cols, sessions[0].rows), (120, 40));

        manager.close_all().await;
        assert_eq!(manager.count().await, 0);
    }

    #[test]
    fn test_shell_resolution_rejects_unknown() {
        let err = resolve_shell(Some("/tmp/evil"), None).unwrap_err();
        assert!(matches!(err, SessionError::ShellNotAllowed(_)));

        let ok = resolve_shell(Some("/bin/sh"), None).unwrap();
        assert_eq!(ok, "/bin/sh");
    }
}
