//! Artifact download, checksum verification, and extraction
//!
//! The artifact is streamed to a scratch directory while a SHA-256
//! digest accumulates, so nothing is buffered in memory and the
//! checksum covers exactly the bytes that landed on disk. The scratch
//! directory lives as long as the returned handle and cleans itself up.

use std::io::Read;
use std::path::{Path, PathBuf};

use flate2::read::GzDecoder;
use sha2::{Digest, Sha256};
use tempfile::TempDir;
use tokio::io::AsyncWriteExt;

use hawser_core::error::UpdateError;

use super::checker::VersionInfo;

/// Whether the artifact digest was checked against a manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Verification {
    Verified,
    /// No manifest was published for this artifact; the digest was
    /// recorded but not compared
    Unverified,
}

/// A downloaded, verified, extracted binary ready to install
#[derive(Debug)]
pub struct DownloadedUpdate {
    pub binary_path: PathBuf,
    pub version: String,
    pub verification: Verification,
    pub sha256: String,
    /// Keeps the scratch directory alive until the install completes
    _workdir: TempDir,
}

/// Download the artifact named by `info`, verify it against the
/// checksum manifest when one is published, and unpack the binary.
pub async fn download_and_verify(
    client: &reqwest::Client,
    info: &VersionInfo,
) -> Result<DownloadedUpdate, UpdateError> {
    let download_url = info
        .download_url
        .as_deref()
        .ok_or_else(|| UpdateError::DownloadFailed("version info has no download_url".into()))?;

    let workdir =
        tempfile::tempdir().map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
    let artifact_name = artifact_name_from_url(download_url);
    let archive_path = workdir.path().join(&artifact_name);

    tracing::info!(url = %download_url, version = %info.latest_version, "Downloading update");

    let mut response = client
        .get(download_url)
        .send()
        .await
        .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
    if !response.status().is_success() {
        return Err(UpdateError::DownloadFailed(format!(
            "{} returned {}",
            download_url,
            response.status()
        )));
    }

    let mut hasher = Sha256::new();
    let mut file = tokio::fs::File::create(&archive_path)
        .await
        .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
    while let Some(chunk) = response
        .chunk()
        .await
        .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?
    {
        hasher.update(&chunk);
        file.write_all(&chunk)
            .await
            .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
    }
    file.flush()
        .await
        .map_err(|e| UpdateError::DownloadFailed(e.to_string()))?;
    drop(file);

    let digest = hex::encode(hasher.finalize());

    let verification = match info.checksums_url.as_deref() {
        Some(checksums_url) => {
            let manifest = fetch_manifest(client, checksums_url).await?;
            let entries = parse_manifest(&manifest);
            let platform = format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH);
            match expected_checksum(&entries, &artifact_name, &platform) {
                Some(expected) => {
                    if !expected.eq_ignore_ascii_case(&digest) {
                        return Err(UpdateError::ChecksumMismatch {
                            expected,
                            actual: digest,
                        });
                    }
                    tracing::debug!(sha256 = %digest, "Checksum verified");
                    Verification::Verified
                }
                None => {
                    tracing::warn!(
                        artifact = %artifact_name,
                        "Manifest has no entry for this artifact; continuing unverified"
                    );
                    Verification::Unverified
                }
            }
        }
        None => {
            tracing::warn!("No checksum manifest published; continuing unverified");
            Verification::Unverified
        }
    };

    let binary_path = {
        let archive = archive_path.clone();
        let out_dir = workdir.path().to_path_buf();
        let name = artifact_name.clone();
        let version = info.latest_version.clone();
        tokio::task::spawn_blocking(move || extract_binary(&archive, &out_dir, &name, &version))
            .await
            .map_err(|e| UpdateError::ExtractionFailed(e.to_string()))??
    };

    Ok(DownloadedUpdate {
        binary_path,
        version: info.latest_version.clone(),
        verification,
        sha256: digest,
        _workdir: workdir,
    })
}

async fn fetch_manifest(
    client: &reqwest::Client,
    checksums_url: &str,
) -> Result<String, UpdateError> {
    let response = client
        .get(checksums_url)
        .send()
        .await
        .map_err(|e| UpdateError::DownloadFailed(format!("manifest fetch failed: {e}")))?;
    if !response.status().is_success() {
        return Err(UpdateError::DownloadFailed(format!(
            "{} returned {}",
            checksums_url,
            response.status()
        )));
    }
    response
        .text()
        .await
        .map_err(|e| UpdateError::DownloadFailed(format!("manifest fetch failed: {e}")))
}

/// Parse `<hex> <filename>` manifest lines. Tolerates sha256sum's
/// binary-mode `*` prefix and comment lines.
pub fn parse_manifest(text: &str) -> Vec<(String, String)> {
    text.lines()
        .filter_map(|line| {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                return None;
            }
            let mut parts = line.split_whitespace();
            let checksum = parts.next()?;
            let filename = parts.next()?;
            Some((
                checksum.to_ascii_lowercase(),
                filename.trim_start_matches('*').to_string(),
            ))
        })
        .collect()
}

/// Select the manifest entry for this platform.
///
/// An entry whose filename contains the `{os}-{arch}` tag wins;
/// otherwise an exact filename match is accepted.
pub fn expected_checksum(
    entries: &[(String, String)],
    artifact_name: &str,
    platform: &str,
) -> Option<String> {
    entries
        .iter()
        .find(|(_, name)| name.contains(platform))
        .or_else(|| entries.iter().find(|(_, name)| name == artifact_name))
        .map(|(checksum, _)| checksum.clone())
}

fn artifact_name_from_url(url: &str) -> String {
    url.rsplit('/')
        .next()
        .filter(|name| !name.is_empty())
        .unwrap_or("update-artifact")
        .to_string()
}

/// Unpack the binary from the downloaded artifact.
///
/// Gzip archives are decompressed; anything else is taken to be the
/// raw binary. Either way the result gets the executable bit.
fn extract_binary(
    archive_path: &Path,
    out_dir: &Path,
    artifact_name: &str,
    version: &str,
) -> Result<PathBuf, UpdateError> {
    let out_path = out_dir.join(format!("hawser-agent-{version}"));

    if artifact_name.ends_with(".gz") {
        let archive = std::fs::File::open(archive_path)
            .map_err(|e| UpdateError::ExtractionFailed(e.to_string()))?;
        let mut decoder = GzDecoder::new(std::io::BufReader::new(archive));
        let mut contents = Vec::new();
        decoder
            .read_to_end(&mut contents)
            .map_err(|e| UpdateError::ExtractionFailed(format!("gzip decode failed: {e}")))?;
        std::fs::write(&out_path, contents)
            .map_err(|e| UpdateError::ExtractionFailed(e.to_string()))?;
    } else {
        std::fs::copy(archive_path, &out_path)
            .map_err(|e| UpdateError::ExtractionFailed(e.to_string()))?;
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(&out_path, std::fs::Permissions::from_mode(0o755))
            .map_err(|e| UpdateError::ExtractionFailed(e.to_string()))?;
    }

    Ok(out_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_parse_manifest_skips_noise() {
        let entries = parse_manifest(
            "# release 0.5.0\n\
             abc123 hawser-agent-0.5.0-linux-x86_64.gz\n\
             \n\
             DEF456 *hawser-agent-0.5.0-darwin-aarch64.gz\n",
        );

        assert_eq!(entries.len(), 2);
        assert_eq!(
            entries[0],
            (
                "abc123".to_string(),
                "hawser-agent-0.5.0-linux-x86_64.gz".to_string()
            )
        );
        // Lowercased digest, star prefix stripped
        assert_eq!(entries[1].0, "def456");
        assert_eq!(entries[1].1, "hawser-agent-0.5.0-darwin-aarch64.gz");
    }

    #[test]
    fn test_expected_checksum_prefers_platform_tag() {
        let entries = vec![
            ("aaa".to_string(), "hawser-agent-0.5.0.gz".to_string()),
            (
                "bbb".to_string(),
                "hawser-agent-0.5.0-linux-x86_64.gz".to_string(),
            ),
        ];

        let found = expected_checksum(&entries, "hawser-agent-0.5.0.gz", "linux-x86_64");
        assert_eq!(found, Some("bbb".to_string()));
    }

    #[test]
    fn test_expected_checksum_falls_back_to_exact_name() {
        let entries = vec![("ccc".to_string(), "agent.gz".to_string())];

        assert_eq!(
            expected_checksum(&entries, "agent.gz", "linux-x86_64"),
            Some("ccc".to_string())
        );
        assert_eq!(expected_checksum(&entries, "other.gz", "linux-x86_64"), None);
    }

    #[test]
    fn test_artifact_name_from_url() {
        assert_eq!(
            artifact_name_from_url("https://u.example.com/a/b/agent-1.2.3.gz"),
            "agent-1.2.3.gz"
        );
        assert_eq!(artifact_name_from_url("https://u.example.com/"), "update-artifact");
    }

    #[test]
    fn test_extract_gzip_archive() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("agent.gz");

        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(b"#!/bin/sh\necho updated\n").unwrap();
        std::fs::write(&archive, encoder.finish().unwrap()).unwrap();

        let out = extract_binary(&archive, dir.path(), "agent.gz", "9.9.9").unwrap();
        let contents = std::fs::read(&out).unwrap();

        assert_eq!(contents, b"#!/bin/sh\necho updated\n");
        assert!(out.ends_with("hawser-agent-9.9.9"));
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            let mode = std::fs::metadata(&out).unwrap().permissions().mode();
            assert_eq!(mode & 0o111, 0o111);
        }
    }

    #[test]
    fn test_extract_raw_binary() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("agent-bin");
        std::fs::write(&raw, b"raw-binary-bytes").unwrap();

        let out = extract_binary(&raw, dir.path(), "agent-bin", "1.0.0").unwrap();
        assert_eq!(std::fs::read(&out).unwrap(), b"raw-binary-bytes");
    }

    #[test]
    fn test_extract_rejects_corrupt_gzip() {
        let dir = tempfile::tempdir().unwrap();
        let archive = dir.path().join("bad.gz");
        std::fs::write(&archive, b"this is not gzip").unwrap();

        let err = extract_binary(&archive, dir.path(), "bad.gz", "1.0.0").unwrap_err();
        assert!(matches!(err, UpdateError::ExtractionFailed(_)));
    }

    async fn serve(router: axum::Router) -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });
        format!("http://{addr}")
    }

    fn gzip(bytes: &[u8]) -> Vec<u8> {
        let mut encoder =
            flate2::write::GzEncoder::new(Vec::new(), flate2::Compression::default());
        encoder.write_all(bytes).unwrap();
        encoder.finish().unwrap()
    }

    fn version_info(base: &str, with_manifest: bool) -> VersionInfo {
        VersionInfo {
            update_available: true,
            current_version: None,
            latest_version: "0.5.0".to_string(),
            download_url: Some(format!("{base}/hawser-agent-0.5.0-test.gz")),
            checksums_url: with_manifest.then(|| format!("{base}/checksums.txt")),
            release_notes_url: None,
            published_at: None,
        }
    }

    #[tokio::test]
    async fn test_download_rejects_checksum_mismatch() {
        use axum::routing::get;

        let artifact = gzip(b"payload v2");
        let manifest = format!("{} hawser-agent-0.5.0-test.gz\n", "a".repeat(64));
        let real_digest = hex::encode(Sha256::digest(&artifact));

        let router = axum::Router::new()
            .route(
                "/hawser-agent-0.5.0-test.gz",
                get(move || async move { artifact }),
            )
            .route("/checksums.txt", get(move || async move { manifest }));
        let base = serve(router).await;

        let err = download_and_verify(&reqwest::Client::new(), &version_info(&base, true))
            .await
            .unwrap_err();
        match err {
            UpdateError::ChecksumMismatch { expected, actual } => {
                assert_eq!(expected, "a".repeat(64));
                assert_eq!(actual, real_digest);
            }
            other => panic!("expected checksum mismatch, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_download_verifies_gzip_artifact() {
        use axum::routing::get;

        let artifact = gzip(b"#!/bin/sh\necho v2\n");
        let manifest = format!(
            "{} hawser-agent-0.5.0-test.gz\n",
            hex::encode(Sha256::digest(&artifact))
        );

        let router = axum::Router::new()
            .route(
                "/hawser-agent-0.5.0-test.gz",
                get(move || async move { artifact }),
            )
            .route("/checksums.txt", get(move || async move { manifest }));
        let base = serve(router).await;

        let update = download_and_verify(&reqwest::Client::new(), &version_info(&base, true))
            .await
            .unwrap();
        assert_eq!(update.verification, Verification::Verified);
        assert_eq!(update.version, "0.5.0");
        assert_eq!(
            std::fs::read(&update.binary_path).unwrap(),
            b"#!/bin/sh\necho v2\n"
        );
    }

    #[tokio::test]
    async fn test_download_without_manifest_is_unverified() {
        use axum::routing::get;

        let artifact = gzip(b"unverified build");
        let router = axum::Router::new().route(
            "/hawser-agent-0.5.0-test.gz",
            get(move || async move { artifact }),
        );
        let base = serve(router).await;

        let update = download_and_verify(&reqwest::Client::new(), &version_info(&base, false))
            .await
            .unwrap();
        assert_eq!(update.verification, Verification::Unverified);
    }

    #[tokio::test]
    async fn test_download_with_unlisted_artifact_is_unverified() {
        use axum::routing::get;

        let artifact = gzip(b"unlisted build");
        // Manifest exists but names neither this platform nor this file
        let manifest = format!("{} some-other-tool.gz\n", "b".repeat(64));

        let router = axum::Router::new()
            .route(
                "/hawser-agent-0.5.0-test.gz",
                get(move || async move { artifact }),
            )
            .route("/checksums.txt", get(move || async move { manifest }));
        let base = serve(router).await;

        let update = download_and_verify(&reqwest::Client::new(), &version_info(&base, true))
            .await
            .unwrap();
        assert_eq!(update.verification, Verification::Unverified);
    }
}
