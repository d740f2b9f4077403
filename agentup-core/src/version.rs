//! Agent versions and package locators.

use std::cmp::Ordering;
use std::fmt;

use semver::Version;
use serde::{Deserialize, Serialize};

use crate::error::{Result, UpdateError};

/// Opaque location of a release package (URL or local path).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PackageLocator(String);

impl PackageLocator {
    pub fn new(locator: impl Into<String>) -> Self {
        Self(locator.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether the package must be fetched over HTTP(S).
    pub fn is_remote(&self) -> bool {
        self.0.starts_with("http://") || self.0.starts_with("https://")
    }

    /// Last path segment of the locator, without any query string.
    pub fn file_name(&self) -> Option<&str> {
        let without_query = self.0.split(['?', '#']).next().unwrap_or_default();
        without_query
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
    }
}

impl fmt::Display for PackageLocator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A published agent version: semver identifier plus where to get it.
///
/// Ordering and equality only consider `number`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentVersion {
    pub number: Version,
    pub package: PackageLocator,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub release_notes: Option<String>,
    /// Hex-encoded SHA-256 of the package, when the source publishes one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size_bytes: Option<u64>,
}

impl AgentVersion {
    pub fn new(number: Version, package: PackageLocator) -> Self {
        Self {
            number,
            package,
            release_notes: None,
            sha256: None,
            size_bytes: None,
        }
    }

    pub fn with_sha256(mut self, sha256: impl Into<String>) -> Self {
        self.sha256 = Some(sha256.into());
        self
    }

    pub fn with_size(mut self, size_bytes: u64) -> Self {
        self.size_bytes = Some(size_bytes);
        self
    }

    pub fn with_release_notes(mut self, notes: impl Into<String>) -> Self {
        self.release_notes = Some(notes.into());
        self
    }
}

impl PartialEq for AgentVersion {
    fn eq(&self, other: &Self) -> bool {
        self.number == other.number
    }
}

impl Eq for AgentVersion {}

impl PartialOrd for AgentVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for AgentVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.number.cmp(&other.number)
    }
}

impl fmt::Display for AgentVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.number)
    }
}

/// Parse a version string leniently.
///
/// Accepts a leading `v` and pads missing minor/patch components with zero,
/// so `v1.4` parses as `1.4.0`.
pub fn parse_version(raw: &str) -> Result<Version> {
    let trimmed = raw.trim();
    let trimmed = trimmed
        .strip_prefix('v')
        .or_else(|| trimmed.strip_prefix('V'))
        .unwrap_or(trimmed);

    if trimmed.is_empty() {
        return Err(UpdateError::Resolution("empty version string".to_string()));
    }

    if let Ok(version) = Version::parse(trimmed) {
        return Ok(version);
    }

    // Pad "1" / "1.2" (optionally followed by -pre or +build) to three parts.
    let split_at = trimmed.find(['-', '+']).unwrap_or(trimmed.len());
    let (core, suffix) = trimmed.split_at(split_at);
    let parts = core.split('.').count();
    if parts < 3 {
        let padded = format!("{}{}{}", core, ".0".repeat(3 - parts), suffix);
        if let Ok(version) = Version::parse(&padded) {
            return Ok(version);
        }
    }

    Err(UpdateError::Resolution(format!(
        "malformed version string '{}'",
        raw.trim()
    )))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_comparison() {
        let older = AgentVersion::new(parse_version("1.2.0").unwrap(), PackageLocator::new("a"));
        let newer = AgentVersion::new(parse_version("1.10.0").unwrap(), PackageLocator::new("b"));
        assert!(newer > older);
        assert_eq!(
            older,
            AgentVersion::new(parse_version("v1.2").unwrap(), PackageLocator::new("c"))
        );
    }

    #[test]
    fn test_parse_version_lenient() {
        assert_eq!(parse_version("v2").unwrap(), Version::new(2, 0, 0));
        assert_eq!(parse_version(" 1.3 \n").unwrap(), Version::new(1, 3, 0));
        assert_eq!(
            parse_version("1.3-rc.1").unwrap(),
            Version::parse("1.3.0-rc.1").unwrap()
        );
        assert!(parse_version("").is_err());
        assert!(parse_version("banana").is_err());
    }

    #[test]
    fn test_locator_file_name() {
        let remote = PackageLocator::new("https://updates.example/agent/1.3.0/agent.tar.gz?channel=dev");
        assert!(remote.is_remote());
        assert_eq!(remote.file_name(), Some("agent.tar.gz"));

        let local = PackageLocator::new("/srv/packages/agent-1.3.0.tar.zst");
        assert!(!local.is_remote());
        assert_eq!(local.file_name(), Some("agent-1.3.0.tar.zst"));

        assert_eq!(PackageLocator::new("https://host/dir/").file_name(), None);
    }
}
