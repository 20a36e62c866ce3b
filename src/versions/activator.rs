//! Version activation and binary path resolution.

use super::{ensure_version_id, sha256_file, SemVer};
use crate::session::SessionManager;
use crate::state::{VersionRecord, VersionStore};
use crate::{Result, WardenError};
use regex::Regex;
use std::path::{Component, Path, PathBuf};
use std::sync::{Arc, LazyLock};

/// Marker file shipped next to the bundled binary
const BUNDLED_VERSION_MARKER: &str = "VERSION";

static VERSION_TOKEN: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\d+\.\d+\.\d+").expect("static version pattern"));

/// Resolves which runtime binary to launch.
pub struct BinaryLocator {
    store: Arc<VersionStore>,
    bundled_path: PathBuf,
}

impl BinaryLocator {
    pub fn new(store: Arc<VersionStore>, bundled_path: PathBuf) -> Self {
        Self {
            store,
            bundled_path,
        }
    }

    pub fn bundled_path(&self) -> &Path {
        &self.bundled_path
    }

    /// The active version's binary if it is still on disk, otherwise the
    /// bundled binary.
    pub fn active_binary_path(&self) -> PathBuf {
        match self.store.get_active_version() {
            Ok(Some(record)) if record.binary_exists() => {
                if let Some(path) = record.path {
                    return path;
                }
            }
            Ok(Some(record)) => {
                tracing::warn!(
                    "Active version {} has no binary on disk, using bundled",
                    record.id
                );
            }
            Ok(None) => {}
            Err(e) => tracing::warn!("Could not read active version: {}", e),
        }
        self.bundled_path.clone()
    }
}

/// Switches the active runtime version and restarts the background session.
pub struct VersionActivator {
    store: Arc<VersionStore>,
    locator: Arc<BinaryLocator>,
    session: Arc<SessionManager>,
    versions_dir: PathBuf,
}

impl VersionActivator {
    pub fn new(
        store: Arc<VersionStore>,
        locator: Arc<BinaryLocator>,
        session: Arc<SessionManager>,
        versions_dir: PathBuf,
    ) -> Self {
        Self {
            store,
            locator,
            session,
            versions_dir,
        }
    }

    /// Make `version` the only active row, then restart the session on it.
    pub async fn activate_version(&self, version: &str) -> Result<()> {
        ensure_version_id(version)?;
        let record = self
            .store
            .get_version(version)?
            .ok_or_else(|| WardenError::NotFound(format!("version {} is not installed", version)))?;

        if !record.binary_exists() {
            let path = record
                .path
                .map(|p| p.display().to_string())
                .unwrap_or_else(|| "no path recorded".to_string());
            return Err(WardenError::MissingBinary(format!("{} ({})", version, path)));
        }

        self.store.set_active_exclusive(version)?;
        tracing::info!("Activated runtime version {}", version);

        // a binary switch always restarts the session
        self.session.reset().await;
        Ok(())
    }

    /// Version string of the bundled binary.
    pub async fn bundled_version(&self) -> Result<String> {
        let bundled = self.locator.bundled_path();
        if !bundled.is_file() {
            return Err(WardenError::MissingBinary(bundled.display().to_string()));
        }

        if let Some(marker) = bundled.parent().map(|dir| dir.join(BUNDLED_VERSION_MARKER)) {
            if let Ok(contents) = tokio::fs::read_to_string(&marker).await {
                if let Some(version) = SemVer::parse(&contents) {
                    return Ok(version.to_string());
                }
                tracing::warn!("Ignoring malformed version marker {:?}", marker);
            }
        }

        let output = tokio::process::Command::new(bundled)
            .arg("--version")
            .output()
            .await
            .map_err(|e| WardenError::Runtime(format!("failed to run bundled binary: {}", e)))?;
        let stdout = String::from_utf8_lossy(&output.stdout);

        VERSION_TOKEN
            .find(&stdout)
            .map(|m| m.as_str().to_string())
            .ok_or_else(|| WardenError::NotFound("bundled runtime version".to_string()))
    }

    /// Ensure the bundled binary has a registry row. Idempotent.
    pub async fn register_bundled(&self) -> Result<VersionRecord> {
        let version = self.bundled_version().await?;

        if let Some(existing) = self.store.get_version(&version)? {
            if !existing.is_bundled && existing.binary_exists() && self.is_managed(&existing) {
                tracing::warn!(
                    "Bundled runtime {} is also downloaded at {:?}, keeping the downloaded row",
                    version,
                    existing.path
                );
                return Ok(existing);
            }
        }

        let bundled = self.locator.bundled_path().to_path_buf();
        let size = tokio::fs::metadata(&bundled).await?.len();
        let checksum = sha256_file(&bundled).await?;

        let record = VersionRecord {
            path: Some(bundled),
            checksum: Some(checksum),
            size: Some(size),
            is_bundled: true,
            ..VersionRecord::available(&version, self.store.platform())
        };
        self.store.upsert_version(&record)?;
        tracing::debug!("Registered bundled runtime {}", version);

        Ok(record)
    }

    /// Switch back to the binary shipped with the application.
    pub async fn reset_to_bundled(&self) -> Result<String> {
        let record = self.register_bundled().await?;
        self.activate_version(&record.id).await?;
        Ok(record.id)
    }

    /// Remove a downloaded version's row and its files.
    ///
    /// Active and bundled versions are refused before anything is touched.
    pub async fn delete_version(&self, version: &str) -> Result<()> {
        ensure_version_id(version)?;
        let record = self.store.delete_version(version)?;

        if let Some(path) = record.path.clone().filter(|_| self.is_managed(&record)) {
            if let Err(e) = tokio::fs::remove_file(&path).await {
                if e.kind() != std::io::ErrorKind::NotFound {
                    tracing::warn!("Failed to remove {:?}: {}", path, e);
                }
            }
            if let Some(dir) = path.parent() {
                // only succeeds once the version dir is empty
                let _ = tokio::fs::remove_dir(dir).await;
            }
        }

        tracing::info!("Deleted runtime version {}", version);
        Ok(())
    }

    /// Whether the row's binary lives under the versions dir.
    fn is_managed(&self, record: &VersionRecord) -> bool {
        record.path.as_ref().is_some_and(|p| {
            p.starts_with(&self.versions_dir)
                && !p.components().any(|c| c == Component::ParentDir)
        })
    }
}
