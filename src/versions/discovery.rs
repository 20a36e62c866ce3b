//! Version discovery against the distribution server.

use super::{DistributionClient, SemVer};
use crate::config::AppConfig;
use crate::state::{VersionRecord, VersionStore};
use crate::{Result, WardenError};
use futures::future::join_all;
use regex::Regex;
use std::collections::BTreeSet;
use std::sync::{Arc, LazyLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

static SCRIPT_VERSION: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"["'](\d+\.\d+\.\d+)["']"#).expect("static version pattern")
});

/// Cached result of the last discovery run.
#[derive(Debug, Clone)]
pub struct DiscoveryCache {
    pub versions: Vec<String>,
    pub fetched_at: Instant,
}

impl DiscoveryCache {
    fn is_fresh(&self, ttl: Duration) -> bool {
        self.fetched_at.elapsed() < ttl
    }
}

/// A discovered version joined with its registry row, if installed.
#[derive(Debug, Clone)]
pub struct AvailableVersion {
    pub id: String,
    pub installed: Option<VersionRecord>,
}

impl AvailableVersion {
    pub fn is_installed(&self) -> bool {
        self.installed.as_ref().is_some_and(|r| r.binary_exists())
    }

    pub fn is_active(&self) -> bool {
        self.installed.as_ref().is_some_and(|r| r.is_active)
    }
}

/// Learns which runtime versions exist by probing manifest URLs.
pub struct VersionDiscovery {
    client: Arc<dyn DistributionClient>,
    cache: Mutex<Option<DiscoveryCache>>,
    ttl: Duration,
    /// Upper bound on each script fetch and manifest probe
    probe_timeout: Duration,
    latest_minor_window: u32,
    previous_minor_window: u32,
    baseline: String,
}

impl VersionDiscovery {
    pub fn new(client: Arc<dyn DistributionClient>, config: &AppConfig) -> Self {
        Self {
            client,
            cache: Mutex::new(None),
            ttl: config.discovery_ttl,
            probe_timeout: config.http_timeout,
            latest_minor_window: config.latest_minor_window,
            previous_minor_window: config.previous_minor_window,
            baseline: config.baseline_version.clone(),
        }
    }

    /// Known versions, newest first, served from cache within the TTL.
    pub async fn discover_available_versions(&self) -> Vec<String> {
        let mut cache = self.cache.lock().await;
        if let Some(cached) = cache.as_ref().filter(|c| c.is_fresh(self.ttl)) {
            return cached.versions.clone();
        }

        let versions = self.probe().await;
        *cache = Some(DiscoveryCache {
            versions: versions.clone(),
            fetched_at: Instant::now(),
        });
        versions
    }

    /// Drop the cached list so the next call probes again.
    pub async fn clear_version_cache(&self) {
        *self.cache.lock().await = None;
    }

    /// Discovered versions merged with what the registry already holds.
    pub async fn list_versions(&self, store: &VersionStore) -> Result<Vec<AvailableVersion>> {
        let discovered = self.discover_available_versions().await;
        let mut installed = store.list_versions()?;

        let mut out: Vec<AvailableVersion> = discovered
            .into_iter()
            .map(|id| {
                let row = installed
                    .iter()
                    .position(|r| r.id == id)
                    .map(|i| installed.swap_remove(i));
                AvailableVersion { id, installed: row }
            })
            .collect();

        // Bundled or older downloads outside the probe window
        out.extend(installed.into_iter().map(|r| AvailableVersion {
            id: r.id.clone(),
            installed: Some(r),
        }));
        out.sort_by(|a, b| super::compare_versions(&b.id, &a.id));
        Ok(out)
    }

    async fn probe(&self) -> Vec<String> {
        let (latest, from_script) = match self.latest_from_script().await {
            Some(v) => (v, true),
            None => match SemVer::parse(&self.baseline) {
                Some(v) => (v, false),
                None => {
                    tracing::warn!("Baseline version '{}' is not semver", self.baseline);
                    return Vec::new();
                }
            },
        };

        let candidates = probe_candidates(
            latest,
            self.latest_minor_window,
            self.previous_minor_window,
        );
        tracing::debug!("Probing {} candidate versions around {}", candidates.len(), latest);

        let checks = candidates.iter().map(|v| {
            let client = Arc::clone(&self.client);
            let version = v.to_string();
            let limit = self.probe_timeout;
            async move {
                match tokio::time::timeout(limit, client.manifest_exists(&version)).await {
                    Ok(Ok(found)) => found,
                    Ok(Err(e)) => {
                        tracing::debug!("Probe for {} failed: {}", version, e);
                        false
                    }
                    Err(_) => {
                        tracing::debug!("Probe for {} timed out", version);
                        false
                    }
                }
            }
        });
        let results = join_all(checks).await;

        let mut found: BTreeSet<SemVer> = candidates
            .into_iter()
            .zip(results)
            .filter_map(|(v, exists)| exists.then_some(v))
            .collect();
        if from_script {
            found.insert(latest);
        }

        found.into_iter().rev().map(|v| v.to_string()).collect()
    }

    async fn latest_from_script(&self) -> Option<SemVer> {
        let fetched = tokio::time::timeout(self.probe_timeout, self.client.fetch_install_script())
            .await
            .unwrap_or_else(|_| {
                Err(WardenError::Network("install script request timed out".to_string()))
            });
        match fetched {
            Ok(body) => {
                let latest = parse_script_version(&body);
                if latest.is_none() {
                    tracing::warn!("Install script did not name a version");
                }
                latest
            }
            Err(e) => {
                tracing::warn!("Failed to fetch install script: {}", e);
                None
            }
        }
    }
}

/// First quoted `x.y.z` token in an install script body.
pub fn parse_script_version(body: &str) -> Option<SemVer> {
    SCRIPT_VERSION
        .captures(body)
        .and_then(|c| c.get(1))
        .and_then(|m| SemVer::parse(m.as_str()))
}

/// Versions worth probing: trailing patches of the latest minor, then the top
/// of the previous minor line.
fn probe_candidates(latest: SemVer, latest_window: u32, previous_window: u32) -> Vec<SemVer> {
    let mut out = Vec::new();

    let lowest = latest.patch.saturating_sub(latest_window.saturating_sub(1));
    for patch in (lowest..=latest.patch).rev() {
        out.push(SemVer::new(latest.major, latest.minor, patch));
    }

    if latest.minor > 0 && previous_window > 0 {
        for patch in (0..previous_window).rev() {
            out.push(SemVer::new(latest.major, latest.minor - 1, patch));
        }
    }

    out
}
