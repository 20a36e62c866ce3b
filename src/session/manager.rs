//! Session Manager
//!
//! Owns the background session state and is its only writer. The state lock
//! is never held across a runtime stream, so concurrent queries run side by
//! side and the runtime's resume mechanism orders them.

use super::{QueryOptions, QueryOutcome, SessionConfig, SessionState, SessionStatus};
use crate::config::AppConfig;
use crate::credentials::{CredentialProvider, CONFIG_DIR_ENV_VAR, TOKEN_ENV_VAR};
use crate::runtime::{
    AgentRuntime, Invocation, PermissionMode, RuntimeMessage, RuntimeSessionId, SystemPrompt,
};
use crate::versions::BinaryLocator;
use crate::{Result, WardenError};
use chrono::Utc;
use futures::StreamExt;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

const STREAM_ENDED_EARLY: &str = "runtime stream ended before initialization completed";

/// Spawn settings captured at init and reused by every query.
#[derive(Debug, Clone)]
struct ActiveSession {
    config_dir: PathBuf,
    env: HashMap<String, String>,
    permission_mode: PermissionMode,
    system_prompt: SystemPrompt,
}

struct Inner {
    state: SessionState,
    active: Option<ActiveSession>,
    /// Parent of every in-flight invocation's token
    cancel: CancellationToken,
    /// Bumped on every close; results from an older epoch are discarded
    epoch: u64,
}

/// Manages the single background runtime session
pub struct SessionManager {
    runtime: Arc<dyn AgentRuntime>,
    credentials: Arc<dyn CredentialProvider>,
    binaries: Arc<BinaryLocator>,
    sessions_root: PathBuf,
    default_model: String,
    inner: Mutex<Inner>,
}

impl SessionManager {
    pub fn new(
        runtime: Arc<dyn AgentRuntime>,
        credentials: Arc<dyn CredentialProvider>,
        binaries: Arc<BinaryLocator>,
        config: &AppConfig,
    ) -> Self {
        Self {
            runtime,
            credentials,
            binaries,
            sessions_root: config.data_dir.join("sessions"),
            default_model: config.default_model.clone(),
            inner: Mutex::new(Inner {
                state: SessionState::idle(config.default_model.clone()),
                active: None,
                cancel: CancellationToken::new(),
                epoch: 0,
            }),
        }
    }

    /// Current state snapshot.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state.clone()
    }

    pub async fn is_ready(&self) -> bool {
        self.inner.lock().await.state.status == SessionStatus::Ready
    }

    /// Start the session with a probe prompt.
    ///
    /// A no-op returning the current state while initializing or ready.
    /// Failures are recorded in the returned state, not raised.
    pub async fn init(&self, config: Option<SessionConfig>) -> SessionState {
        let config = config.unwrap_or_default();

        let (model, cancel, epoch) = {
            let mut inner = self.inner.lock().await;
            if matches!(
                inner.state.status,
                SessionStatus::Initializing | SessionStatus::Ready
            ) {
                return inner.state.clone();
            }

            let model = config
                .model
                .clone()
                .unwrap_or_else(|| self.default_model.clone());
            inner.state.status = SessionStatus::Initializing;
            inner.state.error_message = None;
            inner.state.model = model.clone();
            (model, inner.cancel.child_token(), inner.epoch)
        };

        tracing::info!("Initializing background session ({}, model {})", config.purpose, model);
        let started = self.start(&config, &model, cancel).await;

        let mut inner = self.inner.lock().await;
        if inner.epoch != epoch || inner.state.status != SessionStatus::Initializing {
            // closed or reset while starting up
            return inner.state.clone();
        }

        match started {
            Ok((session_id, active)) => {
                let now = Utc::now();
                inner.state.status = SessionStatus::Ready;
                inner.state.session_id = session_id;
                inner.state.request_count = 1;
                inner.state.last_used = Some(now);
                inner.state.init_time = Some(now);
                inner.active = Some(active);
                tracing::info!(
                    "Background session ready ({})",
                    inner.state.session_id.as_deref().unwrap_or("no handle")
                );
            }
            Err(e) => {
                let message = match e {
                    WardenError::InitFailed(message) => message,
                    other => other.to_string(),
                };
                tracing::warn!("Background session failed to start: {}", message);
                inner.state.status = SessionStatus::Error;
                inner.state.error_message = Some(message);
            }
        }
        inner.state.clone()
    }

    async fn start(
        &self,
        config: &SessionConfig,
        model: &str,
        cancel: CancellationToken,
    ) -> Result<(Option<String>, ActiveSession)> {
        let config_dir = self.sessions_root.join(&config.purpose);
        tokio::fs::create_dir_all(&config_dir).await?;

        let active = ActiveSession {
            env: self.build_env(&config_dir, &config.extra_env),
            config_dir,
            permission_mode: config.permission_mode,
            system_prompt: config.system_prompt.clone(),
        };

        // the startup process is not needed past its first signal
        let _done = cancel.clone().drop_guard();
        let invocation = self.invocation(
            &active,
            config.probe_prompt.clone(),
            cancel,
            None,
            model.to_string(),
        );
        let mut stream = self.runtime.invoke(invocation).await?;

        let mut session_id = None;
        while let Some(message) = stream.next().await {
            let message = message?;
            if let Some(id) = message.session_id() {
                session_id = Some(id.to_string());
            }
            match message {
                RuntimeMessage::SystemInit { .. } | RuntimeMessage::Result { .. } => {
                    return Ok((session_id, active));
                }
                RuntimeMessage::AssistantContent { .. } => {}
                RuntimeMessage::Unknown { kind } => {
                    tracing::trace!("Ignoring runtime message '{}' during init", kind);
                }
            }
        }

        Err(WardenError::InitFailed(STREAM_ENDED_EARLY.to_string()))
    }

    /// Process environment plus credential and config-dir overrides.
    fn build_env(
        &self,
        config_dir: &std::path::Path,
        extra: &HashMap<String, String>,
    ) -> HashMap<String, String> {
        let mut env: HashMap<String, String> = std::env::vars_os()
            .filter_map(|(k, v)| Some((k.into_string().ok()?, v.into_string().ok()?)))
            .collect();
        env.extend(extra.iter().map(|(k, v)| (k.clone(), v.clone())));
        if let Some(token) = self.credentials.token() {
            env.insert(TOKEN_ENV_VAR.to_string(), token);
        }
        env.insert(
            CONFIG_DIR_ENV_VAR.to_string(),
            config_dir.to_string_lossy().to_string(),
        );
        env
    }

    fn invocation(
        &self,
        active: &ActiveSession,
        prompt: String,
        cancel: CancellationToken,
        resume: Option<String>,
        model: String,
    ) -> Invocation {
        Invocation {
            prompt,
            cancel,
            working_dir: active.config_dir.clone(),
            system_prompt: active.system_prompt.clone(),
            env: active.env.clone(),
            permission_mode: active.permission_mode,
            binary_path: self.binaries.active_binary_path(),
            resume: resume.map(RuntimeSessionId),
            continue_session: false,
            model: Some(model),
        }
    }

    /// Run one prompt against the ready session.
    pub async fn query(&self, prompt: &str, options: QueryOptions) -> QueryOutcome {
        let (invocation, epoch) = {
            let inner = self.inner.lock().await;
            let (SessionStatus::Ready, Some(active)) = (inner.state.status, inner.active.as_ref())
            else {
                return QueryOutcome::failure(
                    WardenError::NotReady(inner.state.status.to_string()).to_string(),
                );
            };

            let model = options
                .model
                .clone()
                .unwrap_or_else(|| inner.state.model.clone());
            let invocation = self.invocation(
                active,
                prompt.to_string(),
                inner.cancel.child_token(),
                inner.state.session_id.clone(),
                model,
            );
            (invocation, inner.epoch)
        };

        // stops the caller-token watcher once the query is over
        let _done = invocation.cancel.clone().drop_guard();
        if let Some(caller) = options.cancel {
            let token = invocation.cancel.clone();
            tokio::spawn(async move {
                tokio::select! {
                    _ = caller.cancelled() => token.cancel(),
                    _ = token.cancelled() => {}
                }
            });
        }

        match self.run_query(invocation, epoch).await {
            Ok(text) => {
                let mut inner = self.inner.lock().await;
                if inner.epoch == epoch && inner.state.status == SessionStatus::Ready {
                    inner.state.request_count += 1;
                    inner.state.last_used = Some(Utc::now());
                }
                QueryOutcome::success(text)
            }
            Err(e) => {
                tracing::warn!("Background query failed: {}", e);
                QueryOutcome::failure(e.to_string())
            }
        }
    }

    async fn run_query(&self, invocation: Invocation, epoch: u64) -> Result<String> {
        let mut stream = self.runtime.invoke(invocation).await?;
        let mut fragments = String::new();

        while let Some(message) = stream.next().await {
            let message = message?;
            if let Some(id) = message.session_id() {
                self.observe_session_id(id, epoch).await;
            }
            match message {
                RuntimeMessage::AssistantContent { fragments: parts, .. } => {
                    for part in parts {
                        fragments.push_str(&part);
                    }
                }
                RuntimeMessage::Result { text, is_error, .. } => {
                    if is_error {
                        return Err(WardenError::QueryFailed(
                            text.unwrap_or_else(|| "runtime reported an error".to_string()),
                        ));
                    }
                    // the runtime's final text wins over streamed deltas
                    return Ok(text.unwrap_or(fragments));
                }
                RuntimeMessage::SystemInit { .. } => {}
                RuntimeMessage::Unknown { kind } => {
                    tracing::trace!("Ignoring runtime message '{}'", kind);
                }
            }
        }

        Ok(fragments)
    }

    async fn observe_session_id(&self, id: &str, epoch: u64) {
        let mut inner = self.inner.lock().await;
        if inner.epoch == epoch
            && inner.state.status == SessionStatus::Ready
            && inner.state.session_id.as_deref() != Some(id)
        {
            tracing::debug!("Background session handle moved to {}", id);
            inner.state.session_id = Some(id.to_string());
        }
    }

    /// Cancel in-flight work and mark the session closed. Idempotent.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if inner.state.status == SessionStatus::Closed {
            return;
        }
        inner.cancel.cancel();
        inner.cancel = CancellationToken::new();
        inner.epoch += 1;
        inner.state.session_id = None;
        inner.state.status = SessionStatus::Closed;
        tracing::info!("Background session closed");
    }

    /// Close, then return to idle defaults so the next init starts fresh.
    pub async fn reset(&self) {
        self.close().await;
        let mut inner = self.inner.lock().await;
        inner.state = SessionState::idle(self.default_model.clone());
        inner.active = None;
        tracing::debug!("Background session reset");
    }

    /// Process-exit teardown.
    pub async fn shutdown(&self) {
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{assistant, error_result_msg, init_msg, result_msg, Fixture};
    use std::time::Duration;

    #[tokio::test]
    async fn init_reaches_ready() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);

        let state = fx.session.init(None).await;

        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.session_id.as_deref(), Some("s-1"));
        assert_eq!(state.request_count, 1);
        assert!(state.last_used.is_some());
        assert!(state.init_time.is_some());
        assert_eq!(state.model, "sonnet");
    }

    #[tokio::test]
    async fn init_passes_environment_and_binary() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);

        fx.session.init(None).await;

        let inv = &fx.runtime.invocations()[0];
        assert_eq!(inv.prompt, "ping");
        assert_eq!(inv.env.get(TOKEN_ENV_VAR).map(String::as_str), Some("secret-token"));
        let config_dir = inv.env.get(CONFIG_DIR_ENV_VAR).unwrap();
        assert!(config_dir.ends_with("utility"));
        assert_eq!(inv.working_dir, PathBuf::from(config_dir));
        assert!(inv.working_dir.is_dir());
        assert_eq!(inv.binary_path, fx.locator.bundled_path());
        assert!(inv.resume.is_none());
    }

    #[tokio::test]
    async fn init_without_credentials_omits_token() {
        let fx = Fixture::without_credentials();
        fx.runtime.push_script(vec![init_msg("s-1")]);

        fx.session.init(None).await;

        assert!(!fx.runtime.invocations()[0].env.contains_key(TOKEN_ENV_VAR));
    }

    #[tokio::test]
    async fn result_also_completes_init() {
        let fx = Fixture::new();
        fx.runtime
            .push_script(vec![assistant("pong"), result_msg(Some("pong"), Some("s-7"))]);

        let state = fx.session.init(None).await;
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.session_id.as_deref(), Some("s-7"));
    }

    #[tokio::test]
    async fn init_is_idempotent_when_ready() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);

        let first = fx.session.init(None).await;
        let second = fx.session.init(None).await;

        assert_eq!(first, second);
        assert_eq!(fx.runtime.invocation_count(), 1);
    }

    #[tokio::test]
    async fn init_is_idempotent_while_initializing() {
        let fx = Fixture::new();
        fx.runtime.push_hanging(vec![]);

        let session = Arc::clone(&fx.session);
        let pending = tokio::spawn(async move { session.init(None).await });
        while fx.runtime.invocation_count() < 1 {
            tokio::task::yield_now().await;
        }

        let state = fx.session.init(None).await;
        assert_eq!(state.status, SessionStatus::Initializing);
        assert_eq!(fx.runtime.invocation_count(), 1);

        fx.session.close().await;
        let final_state = pending.await.unwrap();
        assert_eq!(final_state.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn stale_init_does_not_clobber_a_newer_one() {
        let fx = Fixture::new();
        fx.runtime.push_hanging(vec![]);
        let session = Arc::clone(&fx.session);
        let first = tokio::spawn(async move { session.init(None).await });
        while fx.runtime.invocation_count() < 1 {
            tokio::task::yield_now().await;
        }

        fx.session.reset().await;

        let gate = Arc::new(tokio::sync::Notify::new());
        fx.runtime
            .push_gated(vec![init_msg("s-new")], Arc::clone(&gate));
        let session = Arc::clone(&fx.session);
        let second = tokio::spawn(async move { session.init(None).await });
        while fx.runtime.invocation_count() < 2 {
            tokio::task::yield_now().await;
        }

        // the cancelled first init resolves while the second is in flight
        first.await.unwrap();
        let state = fx.session.state().await;
        assert_eq!(state.status, SessionStatus::Initializing);
        assert!(state.error_message.is_none());

        let state = fx.session.init(None).await;
        assert_eq!(state.status, SessionStatus::Initializing);
        assert_eq!(fx.runtime.invocation_count(), 2);

        gate.notify_one();
        let state = second.await.unwrap();
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.session_id.as_deref(), Some("s-new"));
    }

    #[tokio::test]
    async fn init_stops_its_invocation_once_ready() {
        let fx = Fixture::new();
        fx.runtime.push_hanging(vec![init_msg("s-1")]);

        let state = fx.session.init(None).await;

        assert_eq!(state.status, SessionStatus::Ready);
        assert!(fx.runtime.invocations()[0].cancel.is_cancelled());
    }

    #[tokio::test]
    async fn stale_query_does_not_touch_a_reset_session() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session.init(None).await;

        let gate = Arc::new(tokio::sync::Notify::new());
        fx.runtime
            .push_gated(vec![result_msg(Some("late"), Some("s-old"))], Arc::clone(&gate));
        let session = Arc::clone(&fx.session);
        let pending =
            tokio::spawn(async move { session.query("slow", QueryOptions::default()).await });
        while fx.runtime.invocation_count() < 2 {
            tokio::task::yield_now().await;
        }

        fx.session.reset().await;
        fx.runtime.push_script(vec![init_msg("s-2")]);
        fx.session.init(None).await;

        gate.notify_one();
        pending.await.unwrap();

        let state = fx.session.state().await;
        assert_eq!(state.session_id.as_deref(), Some("s-2"));
        assert_eq!(state.request_count, 1);
    }

    #[tokio::test]
    async fn stream_ending_early_is_an_error() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![assistant("thinking")]);

        let state = fx.session.init(None).await;

        assert_eq!(state.status, SessionStatus::Error);
        assert_eq!(state.error_message.as_deref(), Some(STREAM_ENDED_EARLY));
        assert_eq!(state.request_count, 0);
    }

    #[tokio::test]
    async fn spawn_failure_is_captured() {
        let fx = Fixture::new();
        fx.runtime.push_spawn_error("no such file");

        let state = fx.session.init(None).await;

        assert_eq!(state.status, SessionStatus::Error);
        assert!(state.error_message.unwrap().contains("no such file"));
    }

    #[tokio::test]
    async fn query_before_ready_fails_softly() {
        let fx = Fixture::new();

        let outcome = fx.session.query("hello", QueryOptions::default()).await;

        assert!(!outcome.success);
        assert_eq!(outcome.error.as_deref(), Some("Session not ready (status: idle)"));
        assert_eq!(fx.runtime.invocation_count(), 0);
    }

    #[tokio::test]
    async fn query_resumes_and_prefers_final_text() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session.init(None).await;

        fx.runtime.push_script(vec![
            assistant("Draft "),
            assistant("answer"),
            result_msg(Some("Final answer"), Some("s-2")),
        ]);
        let outcome = fx.session.query("hello", QueryOptions::default()).await;

        assert_eq!(outcome, QueryOutcome::success("Final answer"));
        let inv = &fx.runtime.invocations()[1];
        assert_eq!(inv.resume, Some(RuntimeSessionId("s-1".to_string())));
        assert_eq!(inv.model.as_deref(), Some("sonnet"));

        let state = fx.session.state().await;
        assert_eq!(state.session_id.as_deref(), Some("s-2"));
        assert_eq!(state.request_count, 2);
    }

    #[tokio::test]
    async fn query_accumulates_fragments_without_final_text() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session.init(None).await;

        fx.runtime.push_script(vec![
            assistant("Hello"),
            assistant(", world"),
            result_msg(None, None),
        ]);
        let outcome = fx
            .session
            .query("hi", QueryOptions::with_model("haiku"))
            .await;

        assert_eq!(outcome.text, "Hello, world");
        assert_eq!(fx.runtime.invocations()[1].model.as_deref(), Some("haiku"));
    }

    #[tokio::test]
    async fn query_errors_become_outcomes() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session.init(None).await;

        fx.runtime.push_script(vec![error_result_msg("rate limited")]);
        let outcome = fx.session.query("hi", QueryOptions::default()).await;
        assert!(!outcome.success);
        assert!(outcome.error.unwrap().contains("rate limited"));

        fx.runtime.push_spawn_error("binary vanished");
        let outcome = fx.session.query("hi", QueryOptions::default()).await;
        assert!(!outcome.success);

        let state = fx.session.state().await;
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.request_count, 1);
    }

    #[tokio::test]
    async fn cancelling_a_query_keeps_the_session() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session.init(None).await;

        fx.runtime.push_hanging(vec![assistant("partial")]);
        let cancel = CancellationToken::new();
        let options = QueryOptions {
            model: None,
            cancel: Some(cancel.clone()),
        };
        let session = Arc::clone(&fx.session);
        let pending = tokio::spawn(async move { session.query("slow", options).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        cancel.cancel();
        let outcome = pending.await.unwrap();
        assert!(!outcome.success);

        let state = fx.session.state().await;
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.session_id.as_deref(), Some("s-1"));

        fx.runtime.push_script(vec![result_msg(Some("ok"), Some("s-1"))]);
        let outcome = fx.session.query("again", QueryOptions::default()).await;
        assert!(outcome.success);
        assert_eq!(
            fx.runtime.invocations()[2].resume,
            Some(RuntimeSessionId("s-1".to_string()))
        );
    }

    #[tokio::test]
    async fn close_cancels_in_flight_queries() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session.init(None).await;

        fx.runtime.push_hanging(vec![]);
        let session = Arc::clone(&fx.session);
        let pending =
            tokio::spawn(async move { session.query("slow", QueryOptions::default()).await });
        while fx.runtime.invocation_count() < 2 {
            tokio::task::yield_now().await;
        }

        fx.session.close().await;
        let outcome = pending.await.unwrap();
        assert!(!outcome.success);

        let state = fx.session.state().await;
        assert_eq!(state.status, SessionStatus::Closed);
        assert!(state.session_id.is_none());

        fx.session.close().await;
        assert_eq!(fx.session.state().await.status, SessionStatus::Closed);
    }

    #[tokio::test]
    async fn reset_returns_to_idle_and_allows_reinit() {
        let fx = Fixture::new();
        fx.runtime.push_script(vec![init_msg("s-1")]);
        fx.session
            .init(Some(SessionConfig {
                model: Some("opus".to_string()),
                ..SessionConfig::default()
            }))
            .await;

        fx.session.reset().await;
        assert_eq!(fx.session.state().await, SessionState::idle("sonnet"));

        fx.runtime.push_script(vec![init_msg("s-2")]);
        let state = fx.session.init(None).await;
        assert_eq!(state.status, SessionStatus::Ready);
        assert_eq!(state.session_id.as_deref(), Some("s-2"));
    }

    #[tokio::test]
    async fn error_state_recovers_through_reset() {
        let fx = Fixture::new();
        fx.runtime.push_spawn_error("boom");
        fx.session.init(None).await;
        assert_eq!(fx.session.state().await.status, SessionStatus::Error);

        fx.session.reset().await;
        let state = fx.session.state().await;
        assert_eq!(state.status, SessionStatus::Idle);
        assert!(state.error_message.is_none());
    }
}
