//! Claude CLI runtime adapter.
//!
//! Spawns the runtime binary in print mode with `stream-json` output and turns
//! each stdout line into a [`RuntimeMessage`].

use super::{AgentRuntime, Invocation, MessageStream, RuntimeMessage, SystemPrompt};
use crate::{Result, WardenError};
use async_trait::async_trait;
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc;

/// Buffered messages between the reader task and the consumer
const CHANNEL_CAPACITY: usize = 64;

pub struct ClaudeCliRuntime;

impl ClaudeCliRuntime {
    pub fn new() -> Self {
        Self
    }

    /// Command line for one invocation, excluding the binary itself.
    pub fn build_args(invocation: &Invocation) -> Vec<String> {
        let mut args = vec![
            "-p".to_string(),
            invocation.prompt.clone(),
            "--output-format".to_string(),
            "stream-json".to_string(),
            "--verbose".to_string(),
            "--permission-mode".to_string(),
            invocation.permission_mode.as_str().to_string(),
        ];

        if let Some(model) = &invocation.model {
            args.push("--model".to_string());
            args.push(model.clone());
        }
        if let Some(resume) = &invocation.resume {
            args.push("--resume".to_string());
            args.push(resume.0.clone());
        }
        if invocation.continue_session {
            args.push("--continue".to_string());
        }
        if let SystemPrompt::Custom(prompt) = &invocation.system_prompt {
            args.push("--system-prompt".to_string());
            args.push(prompt.clone());
        }

        args
    }
}

impl Default for ClaudeCliRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AgentRuntime for ClaudeCliRuntime {
    fn name(&self) -> &'static str {
        "claude"
    }

    async fn invoke(&self, invocation: Invocation) -> Result<MessageStream> {
        let mut child = Command::new(&invocation.binary_path)
            .args(Self::build_args(&invocation))
            .current_dir(&invocation.working_dir)
            .env_clear()
            .envs(&invocation.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                WardenError::Runtime(format!(
                    "failed to spawn {}: {}",
                    invocation.binary_path.display(),
                    e
                ))
            })?;

        tracing::debug!(
            "Spawned runtime {:?} (pid {:?})",
            invocation.binary_path,
            child.id()
        );

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = invocation.cancel.clone();
        tokio::spawn(async move {
            pump_output(&mut child, tx, cancel).await;
        });

        let stream = futures::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        Ok(Box::pin(stream))
    }
}

/// Forward parsed stdout lines until the process exits or is cancelled.
async fn pump_output(
    child: &mut Child,
    tx: mpsc::Sender<Result<RuntimeMessage>>,
    cancel: tokio_util::sync::CancellationToken,
) {
    let Some(stdout) = child.stdout.take() else {
        let _ = tx
            .send(Err(WardenError::Runtime("runtime stdout unavailable".to_string())))
            .await;
        return;
    };
    let stderr = child.stderr.take().map(|mut stderr| {
        tokio::spawn(async move {
            let mut buf = String::new();
            let _ = stderr.read_to_string(&mut buf).await;
            buf
        })
    });

    let mut lines = BufReader::new(stdout).lines();
    loop {
        let line = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                let _ = child.kill().await;
                let _ = tx.send(Err(WardenError::Cancelled)).await;
                return;
            }
            line = lines.next_line() => line,
        };

        match line {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                match RuntimeMessage::parse_line(&line) {
                    Ok(message) => {
                        if tx.send(Ok(message)).await.is_err() {
                            // consumer went away
                            let _ = child.kill().await;
                            return;
                        }
                    }
                    Err(e) => tracing::debug!("Skipping non-JSON runtime line: {}", e),
                }
            }
            Ok(None) => break,
            Err(e) => {
                let _ = tx.send(Err(WardenError::Io(e))).await;
                let _ = child.kill().await;
                return;
            }
        }
    }

    match child.wait().await {
        Ok(status) if status.success() => {}
        Ok(status) => {
            let detail = match stderr {
                Some(handle) => handle.await.unwrap_or_default(),
                None => String::new(),
            };
            let detail = strip_ansi_escapes::strip_str(detail.trim());
            let message = if detail.is_empty() {
                format!("runtime exited with {}", status)
            } else {
                format!("runtime exited with {}: {}", status, detail)
            };
            let _ = tx.send(Err(WardenError::Runtime(message))).await;
        }
        Err(e) => {
            let _ = tx.send(Err(WardenError::Io(e))).await;
        }
    }
}
