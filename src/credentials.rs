//! Credential lookup for the background runtime.
//!
//! Storage of the token is owned elsewhere; warden only asks for the
//! decrypted value right before spawning.

/// Environment variable the runtime reads its OAuth token from.
pub const TOKEN_ENV_VAR: &str = "CLAUDE_CODE_OAUTH_TOKEN";

/// Environment variable overriding the runtime's config directory.
pub const CONFIG_DIR_ENV_VAR: &str = "CLAUDE_CONFIG_DIR";

pub trait CredentialProvider: Send + Sync {
    /// Decrypted bearer token, or `None` when unset or unavailable.
    fn token(&self) -> Option<String>;
}

/// Reads the token from a variable in warden's own environment.
pub struct EnvCredentials {
    var: String,
}

impl EnvCredentials {
    pub fn new(var: impl Into<String>) -> Self {
        Self { var: var.into() }
    }
}

impl Default for EnvCredentials {
    fn default() -> Self {
        Self::new("WARDEN_OAUTH_TOKEN")
    }
}

impl CredentialProvider for EnvCredentials {
    fn token(&self) -> Option<String> {
        std::env::var(&self.var)
            .ok()
            .map(|t| t.trim().to_string())
            .filter(|t| !t.is_empty())
    }
}

/// No stored credential; the runtime falls back to its own login.
pub struct NoCredentials;

impl CredentialProvider for NoCredentials {
    fn token(&self) -> Option<String> {
        None
    }
}
