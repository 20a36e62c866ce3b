//! Agent runtime abstraction.
//!
//! The runtime is an opaque streaming collaborator: warden hands it a prompt
//! plus spawn options and reads back a closed set of message kinds.

mod claude;

pub use claude::ClaudeCliRuntime;

use crate::Result;
use async_trait::async_trait;
use futures::Stream;
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::pin::Pin;
use tokio_util::sync::CancellationToken;

/// Opaque handle used to resume a runtime conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuntimeSessionId(pub String);

impl std::fmt::Display for RuntimeSessionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Tool permission mode passed through to the runtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PermissionMode {
    #[default]
    Default,
    AcceptEdits,
    BypassPermissions,
    Plan,
}

impl PermissionMode {
    pub fn as_str(self) -> &'static str {
        match self {
            PermissionMode::Default => "default",
            PermissionMode::AcceptEdits => "acceptEdits",
            PermissionMode::BypassPermissions => "bypassPermissions",
            PermissionMode::Plan => "plan",
        }
    }
}

/// System prompt selection.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SystemPrompt {
    /// The runtime's built-in coding-agent prompt
    #[default]
    Preset,
    Custom(String),
}

/// Everything needed to open one streaming invocation.
#[derive(Debug, Clone)]
pub struct Invocation {
    pub prompt: String,
    pub cancel: CancellationToken,
    pub working_dir: PathBuf,
    pub system_prompt: SystemPrompt,
    /// Complete environment for the spawned process
    pub env: HashMap<String, String>,
    pub permission_mode: PermissionMode,
    pub binary_path: PathBuf,
    pub resume: Option<RuntimeSessionId>,
    pub continue_session: bool,
    pub model: Option<String>,
}

/// One message from the runtime's output stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuntimeMessage {
    /// The runtime finished starting up
    SystemInit {
        session_id: Option<String>,
        model: Option<String>,
    },
    /// Incremental assistant text, in order
    AssistantContent {
        fragments: Vec<String>,
        session_id: Option<String>,
    },
    /// Terminal message of a turn
    Result {
        text: Option<String>,
        session_id: Option<String>,
        is_error: bool,
    },
    /// A message kind warden does not consume
    Unknown { kind: String },
}

impl RuntimeMessage {
    pub fn session_id(&self) -> Option<&str> {
        match self {
            RuntimeMessage::SystemInit { session_id, .. }
            | RuntimeMessage::AssistantContent { session_id, .. }
            | RuntimeMessage::Result { session_id, .. } => session_id.as_deref(),
            RuntimeMessage::Unknown { .. } => None,
        }
    }

    /// Decode one line of the runtime's `stream-json` output.
    pub fn parse_line(line: &str) -> Result<Self> {
        let value: serde_json::Value = serde_json::from_str(line)?;
        let kind = value
            .get("type")
            .and_then(|t| t.as_str())
            .unwrap_or_default()
            .to_string();

        let message = match kind.as_str() {
            "system" => {
                let wire: WireSystem = serde_json::from_value(value)?;
                match wire.subtype.as_deref() {
                    Some("init") => RuntimeMessage::SystemInit {
                        session_id: wire.session_id,
                        model: wire.model,
                    },
                    other => RuntimeMessage::Unknown {
                        kind: format!("system:{}", other.unwrap_or("none")),
                    },
                }
            }
            "assistant" => {
                let wire: WireAssistant = serde_json::from_value(value)?;
                let fragments = wire
                    .message
                    .content
                    .into_iter()
                    .filter_map(|block| match block {
                        WireContentBlock::Text { text } => Some(text),
                        WireContentBlock::Other => None,
                    })
                    .collect();
                RuntimeMessage::AssistantContent {
                    fragments,
                    session_id: wire.session_id,
                }
            }
            "result" => {
                let wire: WireResult = serde_json::from_value(value)?;
                RuntimeMessage::Result {
                    text: wire.result,
                    session_id: wire.session_id,
                    is_error: wire.is_error,
                }
            }
            _ => RuntimeMessage::Unknown { kind },
        };

        Ok(message)
    }
}

#[derive(Deserialize)]
struct WireSystem {
    subtype: Option<String>,
    session_id: Option<String>,
    model: Option<String>,
}

#[derive(Deserialize)]
struct WireAssistant {
    message: WireAssistantBody,
    session_id: Option<String>,
}

#[derive(Deserialize)]
struct WireAssistantBody {
    #[serde(default)]
    content: Vec<WireContentBlock>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum WireContentBlock {
    Text {
        text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Deserialize)]
struct WireResult {
    result: Option<String>,
    session_id: Option<String>,
    #[serde(default)]
    is_error: bool,
}

/// Ordered runtime output for one invocation.
pub type MessageStream = Pin<Box<dyn Stream<Item = Result<RuntimeMessage>> + Send>>;

#[async_trait]
pub trait AgentRuntime: Send + Sync {
    fn name(&self) -> &'static str;

    /// Open a streaming invocation; the stream ends when the turn does or
    /// when `invocation.cancel` fires.
    async fn invoke(&self, invocation: Invocation) -> Result<MessageStream>;
}
