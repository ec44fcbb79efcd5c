//! Version check against the update endpoint

use std::time::Duration;

use serde::{Deserialize, Serialize};

use hawser_core::error::UpdateError;

/// Deadline for the whole check request; downloads manage their own
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);

/// Request body for `POST {endpoint}/version/check`
#[derive(Debug, Clone, Serialize)]
pub struct VersionCheckRequest {
    pub current_version: String,
    pub os: String,
    pub arch: String,
}

/// Update endpoint's verdict
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionInfo {
    pub update_available: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_version: Option<String>,
    pub latest_version: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub download_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksums_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub published_at: Option<String>,
}

/// Ask the update endpoint whether a newer build exists for this
/// platform.
pub async fn check_for_update(
    client: &reqwest::Client,
    endpoint: &str,
    current_version: &str,
) -> Result<VersionInfo, UpdateError> {
    let url = format!("{}/version/check", endpoint.trim_end_matches('/'));
    let request = VersionCheckRequest {
        current_version: current_version.to_string(),
        os: std::env::consts::OS.to_string(),
        arch: std::env::consts::ARCH.to_string(),
    };

    tracing::debug!(url = %url, current_version, "Checking for updates");

    let response = client
        .post(&url)
        .timeout(CHECK_TIMEOUT)
        .json(&request)
        .send()
        .await
        .map_err(|e| UpdateError::CheckFailed(e.to_string()))?;

    if !response.status().is_success() {
        return Err(UpdateError::CheckFailed(format!(
            "{} returned {}",
            url,
            response.status()
        )));
    }

    response
        .json::<VersionInfo>()
        .await
        .map_err(|e| UpdateError::CheckFailed(format!("invalid version response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_version_info_with_urls() {
        let info: VersionInfo = serde_json::from_value(json!({
            "update_available": true,
            "current_version": "0.4.2",
            "latest_version": "0.5.0",
            "download_url": "https://updates.example.com/hawser-agent-0.5.0-linux-x86_64.gz",
            "checksums_url": "https://updates.example.com/hawser-agent-0.5.0.sha256",
            "release_notes_url": "https://updates.example.com/notes/0.5.0",
            "published_at": "2026-08-20T12:00:00Z"
        }))
        .unwrap();

        assert!(info.update_available);
        assert_eq!(info.latest_version, "0.5.0");
        assert!(info.download_url.is_some());
        assert!(info.checksums_url.is_some());
    }

    #[test]
    fn test_version_info_up_to_date_omits_urls() {
        let info: VersionInfo = serde_json::from_value(json!({
            "update_available": false,
            "latest_version": "0.4.2"
        }))
        .unwrap();

        assert!(!info.update_available);
        assert!(info.download_url.is_none());
        assert!(info.checksums_url.is_none());
    }

    #[test]
    fn test_check_request_names_platform() {
        let request = VersionCheckRequest {
            current_version: "0.4.2".to_string(),
            os: std::env::consts::OS.to_string(),
            arch: std::env::consts::ARCH.to_string(),
        };
        let value = serde_json::to_value(&request).unwrap();

        assert_eq!(value["current_version"], "0.4.2");
        assert!(value["os"].is_string());
        assert!(value["arch"].is_string());
    }
}
