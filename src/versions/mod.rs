//! Runtime version management
//!
//! Discovery and download feed the registry; the activator flips the active
//! row and restarts the background session.

mod activator;
mod discovery;
mod distribution;
mod downloader;

pub use activator::*;
pub use discovery::*;
pub use distribution::*;
pub use downloader::*;

use crate::{Result, WardenError};
use std::cmp::Ordering;

/// A plain `major.minor.patch` version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SemVer {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl SemVer {
    pub fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self { major, minor, patch }
    }

    /// Parse `1.2.3`, tolerating a leading `v` and a pre-release suffix.
    pub fn parse(value: &str) -> Option<Self> {
        let value = value.trim();
        let value = value.strip_prefix('v').unwrap_or(value);
        let value = value.split(['-', '+']).next()?;
        let mut parts = value.splitn(3, '.');
        let major = parts.next()?.parse().ok()?;
        let minor = parts.next()?.parse().ok()?;
        let patch = parts.next()?.parse().ok()?;
        Some(Self { major, minor, patch })
    }
}

impl std::fmt::Display for SemVer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Order version strings numerically; unparseable ones sort lowest, by text.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (SemVer::parse(a), SemVer::parse(b)) {
        (Some(a), Some(b)) => a.cmp(&b),
        (Some(_), None) => Ordering::Greater,
        (None, Some(_)) => Ordering::Less,
        (None, None) => a.cmp(b),
    }
}

/// Reject ids that are not a semver or could escape the versions dir.
pub fn ensure_version_id(version: &str) -> Result<()> {
    let charset_ok = !version.is_empty()
        && version
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | '+'));
    if charset_ok && SemVer::parse(version).is_some() {
        Ok(())
    } else {
        Err(WardenError::NotFound(format!("invalid version id '{}'", version)))
    }
}
