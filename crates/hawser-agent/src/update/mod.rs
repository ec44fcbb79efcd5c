//! Self-update
//!
//! Check, download, verify, install, restart. Scheduled checks run in
//! the background when an endpoint is configured; `update.check` and
//! `update.apply` drive the same machinery on demand.

mod checker;
mod download;
mod installer;

pub use checker::{check_for_update, VersionCheckRequest, VersionInfo};
pub use download::{
    download_and_verify, expected_checksum, parse_manifest, DownloadedUpdate, Verification,
};
pub use installer::{platform_installer, PlatformInstaller};

#[cfg(unix)]
pub use installer::PosixInstaller;
#[cfg(windows)]
pub use installer::WindowsInstaller;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use hawser_core::config::UpdateConfig;
use hawser_core::error::UpdateError;

use crate::dispatch::CommandHandler;

/// Delay between install and restart, long enough for the command
/// result to flush to the control plane
const RESTART_GRACE: Duration = Duration::from_secs(1);

/// Outcome of an apply attempt
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum UpdateOutcome {
    UpToDate {
        current_version: String,
    },
    Installed {
        version: String,
        verification: Verification,
        sha256: String,
    },
}

/// Drives the whole update pipeline.
pub struct Updater {
    config: UpdateConfig,
    client: reqwest::Client,
    installer: Arc<dyn PlatformInstaller>,
    current_version: String,
    /// Serializes concurrent applies (scheduled check vs. manual
    /// command); the second caller waits and then re-downloads, which
    /// is wasteful but harmless
    install_lock: Mutex<()>,
}

impl Updater {
    pub fn new(
        config: UpdateConfig,
        current_version: String,
        installer: Arc<dyn PlatformInstaller>,
    ) -> Result<Self, UpdateError> {
        let client = reqwest::Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| UpdateError::CheckFailed(e.to_string()))?;

        Ok(Self {
            config,
            client,
            installer,
            current_version,
            install_lock: Mutex::new(()),
        })
    }

    pub fn current_version(&self) -> &str {
        &self.current_version
    }

    /// Ask the endpoint whether a newer build exists.
    pub async fn check(&self) -> Result<VersionInfo, UpdateError> {
        let endpoint = self
            .config
            .endpoint
            .as_deref()
            .ok_or_else(|| UpdateError::CheckFailed("no update endpoint configured".into()))?;
        check_for_update(&self.client, endpoint, &self.current_version).await
    }

    /// Download, verify, and install `info`, then schedule the restart.
    pub async fn apply(&self, info: &VersionInfo) -> Result<UpdateOutcome, UpdateError> {
        let _guard = self.install_lock.lock().await;

        let downloaded = download_and_verify(&self.client, info).await?;
        tracing::info!(
            version = %downloaded.version,
            verification = ?downloaded.verification,
            sha256 = %downloaded.sha256,
            "Update downloaded"
        );

        self.installer.install(&downloaded.binary_path)?;

        let installer = Arc::clone(&self.installer);
        tokio::spawn(async move {
            tokio::time::sleep(RESTART_GRACE).await;
            if let Err(e) = installer.restart() {
                tracing::error!(
                    error = %e,
                    "Restart failed; new binary takes effect on next start"
                );
            }
        });

        Ok(UpdateOutcome::Installed {
            version: downloaded.version,
            verification: downloaded.verification,
            sha256: downloaded.sha256,
        })
    }

    /// Check and, if a new build exists, apply it.
    pub async fn check_and_apply(&self) -> Result<UpdateOutcome, UpdateError> {
        let info = self.check().await?;
        if !info.update_available {
            return Ok(UpdateOutcome::UpToDate {
                current_version: self.current_version.clone(),
            });
        }
        tracing::info!(latest = %info.latest_version, "Update available");
        self.apply(&info).await
    }

    /// Background check loop. Waits out the initial delay so a crash
    /// looping on a bad update cannot hammer the endpoint, then checks
    /// on the configured interval.
    pub async fn run_scheduled(self: Arc<Self>, shutdown: CancellationToken) {
        if !self.config.is_active() {
            return;
        }

        tokio::select! {
            _ = shutdown.cancelled() => return,
            _ = tokio::time::sleep(self.config.initial_delay) => {}
        }

        let mut interval = tokio::time::interval(self.config.check_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    match self.check().await {
                        Ok(info) if info.update_available => {
                            if self.config.auto_install {
                                if let Err(e) = self.apply(&info).await {
                                    tracing::error!(error = %e, "Scheduled update failed");
                                }
                            } else {
                                tracing::info!(
                                    latest = %info.latest_version,
                                    "Update available; auto-install disabled"
                                );
                            }
                        }
                        Ok(_) => tracing::debug!("Agent is up to date"),
                        Err(e) => tracing::warn!(error = %e, "Scheduled version check failed"),
                    }
                }
            }
        }
    }
}

/// `update.check`
pub struct UpdateCheckHandler {
    pub updater: Arc<Updater>,
}

#[async_trait]
impl CommandHandler for UpdateCheckHandler {
    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let info = self.updater.check().await?;
        Ok(serde_json::to_value(info)?)
    }
}

/// `update.apply`
pub struct UpdateApplyHandler {
    pub updater: Arc<Updater>,
}

#[async_trait]
impl CommandHandler for UpdateApplyHandler {
    async fn execute(&self, _params: Value, _cancel: CancellationToken) -> anyhow::Result<Value> {
        let outcome = self.updater.check_and_apply().await?;
        Ok(serde_json::to_value(outcome)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct NoopInstaller;

    impl PlatformInstaller for NoopInstaller {
        fn install(&self, _new_binary: &Path) -> Result<(), UpdateError> {
            Ok(())
        }
        fn restart(&self) -> Result<(), UpdateError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_check_without_endpoint_fails() {
        let updater = Updater::new(
            UpdateConfig::default(),
            "0.4.2".to_string(),
            Arc::new(NoopInstaller),
        )
        .unwrap();

        let err = updater.check().await.unwrap_err();
        assert!(matches!(err, UpdateError::CheckFailed(_)));
        assert!(err.to_string().contains("no update endpoint"));
    }

    #[test]
    fn test_outcome_serialization() {
        let outcome = UpdateOutcome::Installed {
            version: "0.5.0".to_string(),
            verification: Verification::Verified,
            sha256: "abc".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "installed");
        assert_eq!(value["verification"], "verified");

        let outcome = UpdateOutcome::UpToDate {
            current_version: "0.4.2".to_string(),
        };
        let value = serde_json::to_value(&outcome).unwrap();
        assert_eq!(value["status"], "up_to_date");
        assert_eq!(value["current_version"], "0.4.2");
    }
}
