//! Binary installation and process restart
//!
//! POSIX hosts can overwrite a running executable, so the swap is a
//! rename-aside plus copy with rollback. Windows cannot, so the new
//! binary is staged next to the old one and a deferred script performs
//! the swap after this process exits.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use hawser_core::error::UpdateError;

/// Replaces the agent binary and restarts the process
pub trait PlatformInstaller: Send + Sync {
    /// Put the new binary in place, keeping the old one for rollback.
    fn install(&self, new_binary: &Path) -> Result<(), UpdateError>;

    /// Restart the agent so the installed binary takes over. On
    /// success this call usually does not return.
    fn restart(&self) -> Result<(), UpdateError>;
}

/// Build the installer for the current platform and executable.
pub fn platform_installer(
    service_name: Option<String>,
) -> Result<Arc<dyn PlatformInstaller>, UpdateError> {
    #[cfg(unix)]
    {
        Ok(Arc::new(PosixInstaller::for_current_exe(service_name)?))
    }
    #[cfg(windows)]
    {
        Ok(Arc::new(WindowsInstaller::for_current_exe(service_name)?))
    }
    #[cfg(not(any(unix, windows)))]
    {
        let _ = service_name;
        Err(UpdateError::InstallFailed("unsupported platform".into()))
    }
}

#[cfg(unix)]
pub struct PosixInstaller {
    target: PathBuf,
    service_name: Option<String>,
}

#[cfg(unix)]
impl PosixInstaller {
    pub fn for_current_exe(service_name: Option<String>) -> Result<Self, UpdateError> {
        let target =
            std::env::current_exe().map_err(|e| UpdateError::InstallFailed(e.to_string()))?;
        Ok(Self::with_target(target, service_name))
    }

    pub fn with_target(target: PathBuf, service_name: Option<String>) -> Self {
        Self {
            target,
            service_name,
        }
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self
            .target
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(".bak");
        self.target.with_file_name(name)
    }

    fn place_new(&self, new_binary: &Path) -> Result<(), UpdateError> {
        // Copy rather than rename: the scratch dir is often on a
        // different filesystem
        std::fs::copy(new_binary, &self.target)
            .map_err(|e| UpdateError::InstallFailed(e.to_string()))?;
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&self.target, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| UpdateError::InstallFailed(e.to_string()))?;
        Ok(())
    }
}

#[cfg(unix)]
impl PlatformInstaller for PosixInstaller {
    fn install(&self, new_binary: &Path) -> Result<(), UpdateError> {
        let backup = self.backup_path();
        if backup.exists() {
            let _ = std::fs::remove_file(&backup);
        }

        std::fs::rename(&self.target, &backup).map_err(|e| {
            UpdateError::InstallFailed(format!("failed to move current binary aside: {e}"))
        })?;

        // From here on, any failure must put the old binary back
        if let Err(e) = self.place_new(new_binary) {
            match std::fs::rename(&backup, &self.target) {
                Ok(()) => tracing::warn!("Install failed; previous binary restored"),
                Err(restore_err) => tracing::error!(
                    error = %restore_err,
                    target = %self.target.display(),
                    "Rollback failed; agent binary is missing"
                ),
            }
            return Err(e);
        }

        tracing::info!(target = %self.target.display(), "New binary installed");
        Ok(())
    }

    fn restart(&self) -> Result<(), UpdateError> {
        if let Some(service) = &self.service_name {
            tracing::info!(service = %service, "Restarting via service manager");
            let status = std::process::Command::new("systemctl")
                .args(["restart", service])
                .status()
                .map_err(|e| UpdateError::RestartFailed(e.to_string()))?;
            if !status.success() {
                return Err(UpdateError::RestartFailed(format!(
                    "systemctl restart {service} exited with {status}"
                )));
            }
            // The service manager terminates this process shortly
            Ok(())
        } else {
            tracing::info!("Handing over to a fresh process");
            std::process::Command::new(&self.target)
                .args(std::env::args().skip(1))
                .spawn()
                .map_err(|e| UpdateError::RestartFailed(e.to_string()))?;
            std::process::exit(0);
        }
    }
}

#[cfg(windows)]
pub struct WindowsInstaller {
    target: PathBuf,
    service_name: Option<String>,
}

#[cfg(windows)]
impl WindowsInstaller {
    pub fn for_current_exe(service_name: Option<String>) -> Result<Self, UpdateError> {
        let target =
            std::env::current_exe().map_err(|e| UpdateError::InstallFailed(e.to_string()))?;
        Ok(Self {
            target,
            service_name,
        })
    }

    fn staged_path(&self) -> PathBuf {
        self.target.with_extension("new")
    }
}

#[cfg(windows)]
impl PlatformInstaller for WindowsInstaller {
    fn install(&self, new_binary: &Path) -> Result<(), UpdateError> {
        // A running executable cannot be replaced in place on Windows;
        // stage it and let the restart script do the swap.
        let staged = self.staged_path();
        std::fs::copy(new_binary, &staged)
            .map_err(|e| UpdateError::InstallFailed(e.to_string()))?;
        tracing::info!(staged = %staged.display(), "New binary staged for swap on restart");
        Ok(())
    }

    fn restart(&self) -> Result<(), UpdateError> {
        let staged = self.staged_path();
        let pid = std::process::id();
        let restart_cmd = match &self.service_name {
            Some(service) => format!("sc start \"{service}\""),
            None => format!("start \"\" \"{}\"", self.target.display()),
        };
        let script = format!(
            "@echo off\r\n\
             :wait\r\n\
             tasklist /FI \"PID eq {pid}\" | find \"{pid}\" >nul\r\n\
             if not errorlevel 1 (\r\n\
               timeout /T 1 /NOBREAK >nul\r\n\
               goto wait\r\n\
             )\r\n\
             move /Y \"{staged}\" \"{target}\"\r\n\
             {restart_cmd}\r\n\
             del \"%~f0\"\r\n",
            staged = staged.display(),
            target = self.target.display(),
        );

        let script_path = std::env::temp_dir().join("hawser-agent-update.bat");
        std::fs::write(&script_path, script)
            .map_err(|e| UpdateError::RestartFailed(e.to_string()))?;

        std::process::Command::new("cmd")
            .args(["/C", &script_path.to_string_lossy()])
            .spawn()
            .map_err(|e| UpdateError::RestartFailed(e.to_string()))?;
        tracing::info!("Swap script launched; exiting for the new binary");
        std::process::exit(0);
    }
}
