//! Conversation titles

use crate::config::AppConfig;
use crate::session::{QueryOptions, SessionManager};
use std::sync::Arc;

/// Longest message excerpt sent to the runtime
const MAX_INPUT_CHARS: usize = 500;
const MAX_TITLE_CHARS: usize = 100;
const FALLBACK_MAX_CHARS: usize = 50;
/// A word break at or before this point gives too short a title
const FALLBACK_MIN_BREAK: usize = 20;

const TITLE_PROMPT: &str = "Generate a concise title (3-7 words) for a conversation that starts \
with the message below. Reply with the title only, no quotes or punctuation at the end.\n\n\
Message:\n";

/// Generates short titles for conversations.
pub struct TitleGenerator {
    session: Arc<SessionManager>,
    model: String,
}

impl TitleGenerator {
    pub fn new(session: Arc<SessionManager>, config: &AppConfig) -> Self {
        Self {
            session,
            model: config.title_model.clone(),
        }
    }

    /// Title for `message`. Never fails; degrades to [`fallback_title`].
    pub async fn generate_title(&self, message: &str) -> String {
        if !self.session.is_ready().await {
            tracing::debug!("Background session not ready, using fallback title");
            return fallback_title(message);
        }

        let excerpt: String = message.chars().take(MAX_INPUT_CHARS).collect();
        let prompt = format!("{}{}", TITLE_PROMPT, excerpt);
        let outcome = self
            .session
            .query(&prompt, QueryOptions::with_model(self.model.clone()))
            .await;

        if !outcome.success {
            tracing::warn!(
                "Title generation failed: {}",
                outcome.error.as_deref().unwrap_or("unknown error")
            );
            return fallback_title(message);
        }

        let title = clean_title(&outcome.text);
        if title.is_empty() {
            return fallback_title(message);
        }
        title
    }
}

fn clean_title(raw: &str) -> String {
    let trimmed = raw
        .trim()
        .trim_matches(|c| matches!(c, '"' | '\'' | '“' | '”' | '‘' | '’'))
        .trim();
    trimmed.chars().take(MAX_TITLE_CHARS).collect()
}

/// Local title: the message itself, cut at a word boundary near 50 chars.
pub fn fallback_title(message: &str) -> String {
    let flat = message.replace(['\r', '\n'], " ");
    let flat = flat.trim();
    let chars: Vec<char> = flat.chars().collect();
    if chars.len() <= FALLBACK_MAX_CHARS {
        return flat.to_string();
    }

    let cut = chars[..=FALLBACK_MAX_CHARS]
        .iter()
        .rposition(|c| *c == ' ')
        .filter(|&i| i > FALLBACK_MIN_BREAK)
        .unwrap_or(FALLBACK_MAX_CHARS);
    let mut title: String = chars[..cut].iter().collect();
    title.push_str("...");
    title
}
