//! In-crate fakes for the distribution server, runtime and credentials.

use crate::config::AppConfig;
use crate::credentials::{CredentialProvider, NoCredentials};
use crate::runtime::{AgentRuntime, Invocation, MessageStream, RuntimeMessage};
use crate::session::SessionManager;
use crate::state::VersionStore;
use crate::versions::{
    BinaryLocator, ByteStream, DistributionClient, Manifest, PlatformEntry, VersionActivator,
};
use crate::{Result, WardenError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use sha2::{Digest, Sha256};
use std::collections::{HashMap, HashSet, VecDeque};
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

/// Scripted distribution server.
pub struct FakeDistribution {
    script: Option<String>,
    published: HashSet<String>,
    failing_probes: HashSet<String>,
    hanging_probes: HashSet<String>,
    manifests: HashMap<String, Manifest>,
    binaries: HashMap<(String, String), Vec<u8>>,
    chunk_size: usize,
    probes: AtomicUsize,
    manifest_fetches: AtomicUsize,
    binary_fetches: AtomicUsize,
}

impl FakeDistribution {
    pub fn new() -> Self {
        Self {
            script: None,
            published: HashSet::new(),
            failing_probes: HashSet::new(),
            hanging_probes: HashSet::new(),
            manifests: HashMap::new(),
            binaries: HashMap::new(),
            chunk_size: 1024,
            probes: AtomicUsize::new(0),
            manifest_fetches: AtomicUsize::new(0),
            binary_fetches: AtomicUsize::new(0),
        }
    }

    pub fn with_script(mut self, body: &str) -> Self {
        self.script = Some(body.to_string());
        self
    }

    pub fn with_manifests(mut self, versions: &[&str]) -> Self {
        self.published.extend(versions.iter().map(|v| v.to_string()));
        self
    }

    pub fn with_failing_probes(mut self, versions: &[&str]) -> Self {
        self.failing_probes.extend(versions.iter().map(|v| v.to_string()));
        self
    }

    /// Probes for these versions never answer.
    pub fn with_hanging_probes(mut self, versions: &[&str]) -> Self {
        self.hanging_probes.extend(versions.iter().map(|v| v.to_string()));
        self
    }

    /// Publish one platform build with an explicit manifest checksum.
    pub fn with_release(
        mut self,
        version: &str,
        platform: &str,
        binary: &[u8],
        checksum: &str,
    ) -> Self {
        self.published.insert(version.to_string());
        self.manifests
            .entry(version.to_string())
            .or_insert_with(|| Manifest {
                version: version.to_string(),
                platforms: Default::default(),
            })
            .platforms
            .insert(
                platform.to_string(),
                PlatformEntry {
                    checksum: checksum.to_string(),
                    size: binary.len() as u64,
                },
            );
        self.binaries
            .insert((version.to_string(), platform.to_string()), binary.to_vec());
        self
    }

    pub fn with_chunk_size(mut self, size: usize) -> Self {
        self.chunk_size = size.max(1);
        self
    }

    pub fn probe_count(&self) -> usize {
        self.probes.load(Ordering::SeqCst)
    }

    pub fn manifest_fetch_count(&self) -> usize {
        self.manifest_fetches.load(Ordering::SeqCst)
    }

    pub fn binary_fetch_count(&self) -> usize {
        self.binary_fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DistributionClient for FakeDistribution {
    async fn fetch_install_script(&self) -> Result<String> {
        self.script
            .clone()
            .ok_or_else(|| WardenError::Network("install script unreachable".to_string()))
    }

    async fn manifest_exists(&self, version: &str) -> Result<bool> {
        self.probes.fetch_add(1, Ordering::SeqCst);
        if self.hanging_probes.contains(version) {
            std::future::pending::<()>().await;
        }
        if self.failing_probes.contains(version) {
            return Err(WardenError::Network(format!("probe for {} timed out", version)));
        }
        Ok(self.published.contains(version))
    }

    async fn fetch_manifest(&self, version: &str) -> Result<Manifest> {
        self.manifest_fetches.fetch_add(1, Ordering::SeqCst);
        self.manifests
            .get(version)
            .cloned()
            .ok_or_else(|| WardenError::NotFound(format!("manifest for version {}", version)))
    }

    async fn fetch_binary(&self, version: &str, platform_key: &str) -> Result<ByteStream> {
        self.binary_fetches.fetch_add(1, Ordering::SeqCst);
        let data = self
            .binaries
            .get(&(version.to_string(), platform_key.to_string()))
            .cloned()
            .ok_or_else(|| WardenError::Network("404 Not Found".to_string()))?;
        let chunks: Vec<Result<Bytes>> = data
            .chunks(self.chunk_size)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(Box::pin(futures::stream::iter(chunks)))
    }
}

enum Script {
    Messages(Vec<Result<RuntimeMessage>>),
    /// Yields the messages, then waits for the invocation to be cancelled
    Hanging(Vec<Result<RuntimeMessage>>),
    /// Holds the messages back until the gate is notified
    Gated(Vec<Result<RuntimeMessage>>, Arc<Notify>),
    SpawnError(String),
}

/// Runtime that replays queued scripts, one per invocation.
///
/// With nothing queued it answers with an init and a result.
pub struct FakeRuntime {
    scripts: Mutex<VecDeque<Script>>,
    invocations: Mutex<Vec<Invocation>>,
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            scripts: Mutex::new(VecDeque::new()),
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn push_script(&self, messages: Vec<Result<RuntimeMessage>>) {
        self.scripts.lock().unwrap().push_back(Script::Messages(messages));
    }

    pub fn push_hanging(&self, messages: Vec<Result<RuntimeMessage>>) {
        self.scripts.lock().unwrap().push_back(Script::Hanging(messages));
    }

    pub fn push_gated(&self, messages: Vec<Result<RuntimeMessage>>, gate: Arc<Notify>) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::Gated(messages, gate));
    }

    pub fn push_spawn_error(&self, message: &str) {
        self.scripts
            .lock()
            .unwrap()
            .push_back(Script::SpawnError(message.to_string()));
    }

    pub fn invocations(&self) -> Vec<Invocation> {
        self.invocations.lock().unwrap().clone()
    }

    pub fn invocation_count(&self) -> usize {
        self.invocations.lock().unwrap().len()
    }
}

#[async_trait]
impl AgentRuntime for FakeRuntime {
    fn name(&self) -> &'static str {
        "fake"
    }

    async fn invoke(&self, invocation: Invocation) -> Result<MessageStream> {
        let cancel = invocation.cancel.clone();
        self.invocations.lock().unwrap().push(invocation);
        let script = self.scripts.lock().unwrap().pop_front();
        let script = script.unwrap_or_else(|| {
            Script::Messages(vec![init_msg("fake-session"), result_msg(Some("ok"), None)])
        });

        match script {
            Script::Messages(messages) => Ok(Box::pin(futures::stream::iter(messages))),
            Script::Hanging(messages) => {
                let tail = futures::stream::once(async move {
                    cancel.cancelled().await;
                    Err(WardenError::Cancelled)
                });
                Ok(Box::pin(futures::stream::iter(messages).chain(tail)))
            }
            Script::Gated(messages, gate) => {
                let opened = futures::stream::once(async move { gate.notified().await })
                    .filter_map(|_| async { None::<Result<RuntimeMessage>> });
                Ok(Box::pin(opened.chain(futures::stream::iter(messages))))
            }
            Script::SpawnError(message) => Err(WardenError::Runtime(message)),
        }
    }
}

pub fn init_msg(session_id: &str) -> Result<RuntimeMessage> {
    Ok(RuntimeMessage::SystemInit {
        session_id: Some(session_id.to_string()),
        model: None,
    })
}

pub fn assistant(text: &str) -> Result<RuntimeMessage> {
    Ok(RuntimeMessage::AssistantContent {
        fragments: vec![text.to_string()],
        session_id: None,
    })
}

pub fn result_msg(text: Option<&str>, session_id: Option<&str>) -> Result<RuntimeMessage> {
    Ok(RuntimeMessage::Result {
        text: text.map(str::to_string),
        session_id: session_id.map(str::to_string),
        is_error: false,
    })
}

pub fn error_result_msg(text: &str) -> Result<RuntimeMessage> {
    Ok(RuntimeMessage::Result {
        text: Some(text.to_string()),
        session_id: None,
        is_error: true,
    })
}

pub struct StaticCredentials(pub String);

impl CredentialProvider for StaticCredentials {
    fn token(&self) -> Option<String> {
        Some(self.0.clone())
    }
}

/// Wired-up registry, locator, session and activator over a temp dir.
pub struct Fixture {
    _dir: tempfile::TempDir,
    pub config: AppConfig,
    pub store: Arc<VersionStore>,
    pub locator: Arc<BinaryLocator>,
    pub runtime: Arc<FakeRuntime>,
    pub session: Arc<SessionManager>,
    pub activator: VersionActivator,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_credentials(Arc::new(StaticCredentials("secret-token".to_string())))
    }

    pub fn without_credentials() -> Self {
        Self::with_credentials(Arc::new(NoCredentials))
    }

    fn with_credentials(credentials: Arc<dyn CredentialProvider>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = AppConfig::default().with_data_dir(dir.path().to_path_buf());
        std::fs::create_dir_all(config.bundled_binary_path.parent().unwrap()).unwrap();
        std::fs::write(&config.bundled_binary_path, b"bundled").unwrap();

        let store = Arc::new(VersionStore::open(config.registry_path(), "linux-x64").unwrap());
        let locator = Arc::new(BinaryLocator::new(
            Arc::clone(&store),
            config.bundled_binary_path.clone(),
        ));
        let runtime = Arc::new(FakeRuntime::new());
        let session = Arc::new(SessionManager::new(
            Arc::clone(&runtime) as Arc<dyn AgentRuntime>,
            credentials,
            Arc::clone(&locator),
            &config,
        ));
        let activator = VersionActivator::new(
            Arc::clone(&store),
            Arc::clone(&locator),
            Arc::clone(&session),
            config.versions_dir(),
        );

        Self {
            _dir: dir,
            config,
            store,
            locator,
            runtime,
            session,
            activator,
        }
    }

    pub fn versions_dir(&self) -> PathBuf {
        self.config.versions_dir()
    }
}
