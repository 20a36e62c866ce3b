//! Manifest-verified binary downloads.

use super::{ensure_version_id, DistributionClient, Manifest, PlatformEntry};
use crate::state::{VersionRecord, VersionStore};
use crate::{Result, WardenError};
use chrono::Utc;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio_util::sync::CancellationToken;

/// Progress of one download; ends with `Complete` or `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadProgress {
    Progress {
        percent: u8,
        bytes_downloaded: u64,
        total_bytes: u64,
    },
    Verifying { message: String },
    Complete { message: String },
    Error { message: String },
}

impl DownloadProgress {
    pub fn is_terminal(&self) -> bool {
        matches!(self, DownloadProgress::Complete { .. } | DownloadProgress::Error { .. })
    }
}

/// Fetches runtime binaries into `<versions_dir>/<version>/`.
pub struct VersionDownloader {
    client: Arc<dyn DistributionClient>,
    store: Arc<VersionStore>,
    versions_dir: PathBuf,
}

impl VersionDownloader {
    pub fn new(
        client: Arc<dyn DistributionClient>,
        store: Arc<VersionStore>,
        versions_dir: PathBuf,
    ) -> Self {
        Self {
            client,
            store,
            versions_dir,
        }
    }

    pub async fn get_version_manifest(&self, version: &str) -> Result<Manifest> {
        self.client.fetch_manifest(version).await
    }

    /// Canonical on-disk location of a version's binary.
    pub fn binary_path(&self, version: &str) -> Result<PathBuf> {
        ensure_version_id(version)?;
        self.platform_key()?;
        Ok(self
            .versions_dir
            .join(version)
            .join(crate::platform::binary_name()))
    }

    fn platform_key(&self) -> Result<&str> {
        let key = self.store.platform();
        if crate::platform::is_supported_key(key) {
            Ok(key)
        } else {
            Err(WardenError::UnsupportedPlatform(key.to_string()))
        }
    }

    /// Download, verify and register `version`, reporting through `on_progress`.
    ///
    /// An already-present binary with the manifest checksum is registered
    /// without refetching. On failure nothing is left at the canonical path.
    pub async fn download_version<F>(
        &self,
        version: &str,
        mut on_progress: F,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        match self.download_inner(version, &mut on_progress, cancel).await {
            Ok(path) => Ok(path),
            Err(e) => {
                tracing::warn!("Download of {} failed: {}", version, e);
                on_progress(DownloadProgress::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }

    async fn download_inner<F>(
        &self,
        version: &str,
        on_progress: &mut F,
        cancel: &CancellationToken,
    ) -> Result<PathBuf>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        ensure_version_id(version)?;
        let key = self.platform_key()?.to_string();
        let dest = self.binary_path(version)?;

        let manifest = self.get_version_manifest(version).await?;
        let entry = manifest.platforms.get(&key).cloned().ok_or_else(|| {
            WardenError::NotFound(format!("no manifest entry for platform {}", key))
        })?;

        if dest.is_file() {
            let existing = sha256_file(&dest).await?;
            if existing.eq_ignore_ascii_case(&entry.checksum) {
                tracing::info!("Version {} already downloaded at {:?}", version, dest);
                self.record(version, &dest, &entry)?;
                on_progress(DownloadProgress::Complete {
                    message: format!("Version {} already downloaded", version),
                });
                return Ok(dest);
            }
            tracing::warn!("Stale binary for {} fails checksum, replacing", version);
            tokio::fs::remove_file(&dest).await?;
        }

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let partial = dest.with_extension("download");

        tracing::info!("Downloading {} for {} ({} bytes)", version, key, entry.size);
        let written = self
            .stream_to_file(version, &key, &partial, entry.size, on_progress, cancel)
            .await;
        if let Err(e) = written {
            let _ = tokio::fs::remove_file(&partial).await;
            return Err(e);
        }

        on_progress(DownloadProgress::Verifying {
            message: format!("Verifying checksum for {}", version),
        });
        let actual = match sha256_file(&partial).await {
            Ok(actual) => actual,
            Err(e) => {
                let _ = tokio::fs::remove_file(&partial).await;
                return Err(e);
            }
        };
        if !actual.eq_ignore_ascii_case(&entry.checksum) {
            tokio::fs::remove_file(&partial).await?;
            return Err(WardenError::ChecksumMismatch {
                expected: entry.checksum,
                actual,
            });
        }

        set_executable(&partial).await?;
        tokio::fs::rename(&partial, &dest).await?;
        self.record(version, &dest, &entry)?;

        on_progress(DownloadProgress::Complete {
            message: format!("Downloaded version {}", version),
        });
        Ok(dest)
    }

    async fn stream_to_file<F>(
        &self,
        version: &str,
        key: &str,
        path: &Path,
        total_bytes: u64,
        on_progress: &mut F,
        cancel: &CancellationToken,
    ) -> Result<u64>
    where
        F: FnMut(DownloadProgress) + Send,
    {
        let mut stream = self.client.fetch_binary(version, key).await?;
        let mut file = tokio::fs::File::create(path).await?;
        let mut downloaded = 0u64;
        let mut last_percent = None;

        loop {
            let chunk = tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(WardenError::Cancelled),
                chunk = stream.next() => chunk,
            };
            let Some(chunk) = chunk else { break };
            let chunk = chunk?;

            file.write_all(&chunk).await?;
            downloaded += chunk.len() as u64;

            let percent = percent_of(downloaded, total_bytes);
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                on_progress(DownloadProgress::Progress {
                    percent,
                    bytes_downloaded: downloaded,
                    total_bytes,
                });
            }
        }

        file.flush().await?;
        file.sync_all().await?;
        Ok(downloaded)
    }

    fn record(&self, version: &str, path: &Path, entry: &PlatformEntry) -> Result<()> {
        self.store.upsert_version(&VersionRecord {
            path: Some(path.to_path_buf()),
            checksum: Some(entry.checksum.clone()),
            size: Some(entry.size),
            downloaded_at: Some(Utc::now()),
            ..VersionRecord::available(version, self.store.platform())
        })
    }
}

fn percent_of(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 0;
    }
    (done.saturating_mul(100) / total).min(100) as u8
}

/// Hex SHA-256 of a whole file.
pub async fn sha256_file(path: &Path) -> Result<String> {
    let path = path.to_path_buf();
    tokio::task::spawn_blocking(move || -> Result<String> {
        let mut file = std::fs::File::open(&path)?;
        let mut hasher = Sha256::new();
        std::io::copy(&mut file, &mut hasher)?;
        Ok(hex::encode(hasher.finalize()))
    })
    .await
    .map_err(|e| WardenError::Runtime(format!("hash task failed: {}", e)))?
}

#[cfg(unix)]
async fn set_executable(path: &Path) -> Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755)).await?;
    Ok(())
}

#[cfg(not(unix))]
async fn set_executable(_path: &Path) -> Result<()> {
    Ok(())
}
