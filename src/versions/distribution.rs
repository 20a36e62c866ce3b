//! HTTP boundary to the runtime distribution server.

use crate::config::AppConfig;
use crate::{Result, WardenError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::pin::Pin;
use std::time::Duration;

/// Checksum and size of one platform's binary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlatformEntry {
    pub checksum: String,
    pub size: u64,
}

/// Per-version manifest published next to the binaries.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: String,
    #[serde(default)]
    pub platforms: BTreeMap<String, PlatformEntry>,
}

/// Binary content as it arrives from the server.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes>> + Send>>;

#[async_trait]
pub trait DistributionClient: Send + Sync {
    /// Body of the install script that names the latest release.
    async fn fetch_install_script(&self) -> Result<String>;

    /// Existence probe for a version's manifest.
    async fn manifest_exists(&self, version: &str) -> Result<bool>;

    async fn fetch_manifest(&self, version: &str) -> Result<Manifest>;

    async fn fetch_binary(&self, version: &str, platform_key: &str) -> Result<ByteStream>;
}

/// `reqwest`-backed client for the public distribution bucket.
pub struct HttpDistribution {
    client: reqwest::Client,
    /// Whole-request limit for the script and manifest requests
    request_timeout: Duration,
    base_url: String,
    install_script_url: String,
}

impl HttpDistribution {
    pub fn new(config: &AppConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("warden/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(config.http_timeout)
            .build()?;

        Ok(Self {
            client,
            request_timeout: config.http_timeout,
            base_url: config.distribution_base_url.trim_end_matches('/').to_string(),
            install_script_url: config.install_script_url.clone(),
        })
    }

    pub fn manifest_url(&self, version: &str) -> String {
        format!("{}/{}/manifest.json", self.base_url, version)
    }

    pub fn binary_url(&self, version: &str, platform_key: &str) -> String {
        format!(
            "{}/{}/{}/{}",
            self.base_url,
            version,
            platform_key,
            crate::platform::binary_name()
        )
    }
}

#[async_trait]
impl DistributionClient for HttpDistribution {
    async fn fetch_install_script(&self) -> Result<String> {
        let resp = self
            .client
            .get(&self.install_script_url)
            .timeout(self.request_timeout)
            .send()
            .await?
            .error_for_status()?;
        Ok(resp.text().await?)
    }

    async fn manifest_exists(&self, version: &str) -> Result<bool> {
        let resp = self
            .client
            .head(self.manifest_url(version))
            .timeout(self.request_timeout)
            .send()
            .await?;
        Ok(resp.status().is_success())
    }

    async fn fetch_manifest(&self, version: &str) -> Result<Manifest> {
        let resp = self
            .client
            .get(self.manifest_url(version))
            .timeout(self.request_timeout)
            .send()
            .await?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(WardenError::NotFound(format!("manifest for version {}", version)));
        }
        let resp = resp.error_for_status()?;
        Ok(resp.json::<Manifest>().await?)
    }

    async fn fetch_binary(&self, version: &str, platform_key: &str) -> Result<ByteStream> {
        let url = self.binary_url(version, platform_key);
        tracing::debug!("Fetching binary from {}", url);

        let resp = self.client.get(&url).send().await?.error_for_status()?;
        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(WardenError::from));
        Ok(Box::pin(stream))
    }
}
