//! Background session
//!
//! One long-lived, resumable runtime conversation per process, shared by the
//! utility tasks. Startup is paid once in [`SessionManager::init`]; every
//! later [`SessionManager::query`] resumes the same session handle.
//!
//! ```text
//!   idle ──init──► initializing ──ok──► ready ──close──► closed
//!                       │                                  │
//!                       └──fail──► error ──────reset───────┴──► idle
//! ```

mod manager;

pub use manager::SessionManager;

use crate::runtime::{PermissionMode, SystemPrompt};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;

/// Lifecycle status of the background session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Idle,
    Initializing,
    Ready,
    Error,
    Closed,
}

impl SessionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Initializing => "initializing",
            SessionStatus::Ready => "ready",
            SessionStatus::Error => "error",
            SessionStatus::Closed => "closed",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Snapshot of the background session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionState {
    pub status: SessionStatus,
    pub session_id: Option<String>,
    pub model: String,
    /// Includes the startup probe
    pub request_count: u64,
    pub last_used: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub init_time: Option<DateTime<Utc>>,
}

impl SessionState {
    pub fn idle(model: impl Into<String>) -> Self {
        Self {
            status: SessionStatus::Idle,
            session_id: None,
            model: model.into(),
            request_count: 0,
            last_used: None,
            error_message: None,
            init_time: None,
        }
    }
}

/// Startup options for the background session.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Names the isolated config/working directory
    pub purpose: String,
    /// Falls back to the configured default model
    pub model: Option<String>,
    pub probe_prompt: String,
    pub permission_mode: PermissionMode,
    pub system_prompt: SystemPrompt,
    /// Added on top of the process environment
    pub extra_env: HashMap<String, String>,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            purpose: "utility".to_string(),
            model: None,
            probe_prompt: "ping".to_string(),
            permission_mode: PermissionMode::Default,
            system_prompt: SystemPrompt::Preset,
            extra_env: HashMap::new(),
        }
    }
}

/// Per-query overrides.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    pub model: Option<String>,
    /// Cancels only this query; the session stays resumable
    pub cancel: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn with_model(model: impl Into<String>) -> Self {
        Self {
            model: Some(model.into()),
            cancel: None,
        }
    }
}

/// Result of a query. Failures are reported here, never raised.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryOutcome {
    pub text: String,
    pub success: bool,
    pub error: Option<String>,
}

impl QueryOutcome {
    pub fn success(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            success: true,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            text: String::new(),
            success: false,
            error: Some(error.into()),
        }
    }
}
