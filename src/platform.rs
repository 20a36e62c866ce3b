//! Platform keys used by the distribution server.

use crate::{Result, WardenError};

/// Manifest key for an OS/arch pair, if the distribution ships one.
pub fn platform_key_for(os: &str, arch: &str) -> Option<&'static str> {
    match (os, arch) {
        ("macos", "x86_64") => Some("darwin-x64"),
        ("macos", "aarch64") => Some("darwin-arm64"),
        ("linux", "x86_64") => Some("linux-x64"),
        ("linux", "aarch64") => Some("linux-arm64"),
        ("windows", "x86_64") => Some("win32-x64"),
        _ => None,
    }
}

/// Manifest key for the running platform.
pub fn current_platform_key() -> Result<&'static str> {
    platform_key_for(std::env::consts::OS, std::env::consts::ARCH).ok_or_else(|| {
        WardenError::UnsupportedPlatform(format!(
            "{}-{}",
            std::env::consts::OS,
            std::env::consts::ARCH
        ))
    })
}

/// Key for the running platform, or the raw `os-arch` pair when the
/// distribution has no build for it.
pub fn host_key() -> String {
    current_platform_key()
        .map(str::to_string)
        .unwrap_or_else(|_| format!("{}-{}", std::env::consts::OS, std::env::consts::ARCH))
}

pub fn is_supported_key(key: &str) -> bool {
    matches!(
        key,
        "darwin-x64" | "darwin-arm64" | "linux-x64" | "linux-arm64" | "win32-x64"
    )
}

pub fn binary_name() -> &'static str {
    if cfg!(windows) { "claude.exe" } else { "claude" }
}
