//! Release manifest parsing.
//!
//! The release server publishes one JSON manifest per release:
//!
//! ```json
//! {
//!   "version": "1.3.0",
//!   "channel": "stable",
//!   "release_date": "2026-09-30T12:00:00Z",
//!   "artifact": "agent-1.3.0-linux-x64.tar.gz",
//!   "sha256": "9f86d0...",
//!   "size_bytes": 48211532,
//!   "release_notes": "Fixes job cancellation"
//! }
//! ```

use agentup_core::{parse_version, AgentVersion, PackageLocator};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One published agent release.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReleaseManifest {
    /// Version string (semantic versioning, `v` prefix tolerated)
    pub version: String,

    /// Release channel (dev, beta, stable)
    pub channel: String,

    #[serde(default)]
    pub release_date: Option<DateTime<Utc>>,

    /// Package file name, served under the release's directory
    pub artifact: String,

    /// Absolute download URL, when the package lives elsewhere
    #[serde(default)]
    pub url: Option<String>,

    /// Hex-encoded SHA256 of the package
    #[serde(default)]
    pub sha256: Option<String>,

    #[serde(default)]
    pub size_bytes: Option<u64>,

    #[serde(default)]
    pub release_notes: String,
}

impl ReleaseManifest {
    /// Where the package can be downloaded from.
    pub fn package_url(&self, server_url: &str) -> String {
        match &self.url {
            Some(url) => url.clone(),
            None => format!(
                "{}/api/v1/agent/releases/{}/{}?channel={}",
                server_url.trim_end_matches('/'),
                self.version,
                self.artifact,
                self.channel
            ),
        }
    }

    /// Convert to the orchestrator's view of a release.
    pub fn into_agent_version(self, server_url: &str) -> agentup_core::Result<AgentVersion> {
        let number = parse_version(&self.version)?;
        let mut release = AgentVersion::new(number, PackageLocator::new(self.package_url(server_url)));

        if let Some(sha256) = self.sha256.filter(|s| !s.trim().is_empty()) {
            release = release.with_sha256(sha256);
        }
        if let Some(size) = self.size_bytes.filter(|s| *s > 0) {
            release = release.with_size(size);
        }
        if !self.release_notes.is_empty() {
            release = release.with_release_notes(self.release_notes);
        }
        Ok(release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    const MANIFEST: &str = r#"{
        "version": "v1.3",
        "channel": "stable",
        "release_date": "2026-09-30T12:00:00Z",
        "artifact": "agent-1.3.0-linux-x64.tar.gz",
        "sha256": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08",
        "size_bytes": 48211532,
        "release_notes": "Fixes job cancellation"
    }"#;

    #[test]
    fn test_manifest_parsing() {
        let manifest: ReleaseManifest = serde_json::from_str(MANIFEST).unwrap();
        assert_eq!(manifest.channel, "stable");
        assert!(manifest.url.is_none());

        let release = manifest.into_agent_version("http://releases:9000/").unwrap();
        assert_eq!(release.number, Version::new(1, 3, 0));
        assert_eq!(
            release.package.as_str(),
            "http://releases:9000/api/v1/agent/releases/v1.3/agent-1.3.0-linux-x64.tar.gz?channel=stable"
        );
        assert_eq!(release.package.file_name(), Some("agent-1.3.0-linux-x64.tar.gz"));
        assert_eq!(release.size_bytes, Some(48211532));
        assert_eq!(release.release_notes.as_deref(), Some("Fixes job cancellation"));
    }

    #[test]
    fn test_absolute_url_and_missing_metadata() {
        let manifest: ReleaseManifest = serde_json::from_str(
            r#"{"version": "2.0.0", "channel": "dev", "artifact": "agent.tgz",
                "url": "https://cdn.example.internal/agent/2.0.0/agent.tgz", "sha256": ""}"#,
        )
        .unwrap();

        let release = manifest.into_agent_version("http://releases:9000").unwrap();
        assert_eq!(release.package.as_str(), "https://cdn.example.internal/agent/2.0.0/agent.tgz");
        assert!(release.sha256.is_none());
        assert!(release.size_bytes.is_none());
    }

    #[test]
    fn test_bad_version_is_rejected() {
        let manifest: ReleaseManifest =
            serde_json::from_str(r#"{"version": "latest", "channel": "dev", "artifact": "a.tgz"}"#).unwrap();
        assert!(manifest.into_agent_version("http://releases:9000").is_err());
    }
}
