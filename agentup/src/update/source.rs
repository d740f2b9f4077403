//! Version source backed by the release server's manifest API.

use std::time::Duration;

use agentup_core::{AgentVersion, UpdateError, VersionSource};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::StatusCode;
use semver::Version;
use tracing::{info, instrument};

use super::manifest::ReleaseManifest;

/// Reads release manifests from `{server}/api/v1/agent/...`.
pub struct HttpVersionSource {
    server_url: String,
    client: reqwest::Client,
}

impl HttpVersionSource {
    pub fn new(server_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout.min(Duration::from_secs(30)))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            server_url: server_url.into().trim_end_matches('/').to_string(),
            client,
        })
    }

    async fn fetch_manifest(&self, url: &str) -> agentup_core::Result<ReleaseManifest> {
        info!(url = %url, "Fetching release manifest");

        let response = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| UpdateError::Resolution(format!("failed to connect to release server: {}", e)))?;

        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(UpdateError::Resolution(format!("no such release: {}", url)));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(UpdateError::Resolution(format!(
                "release server returned {}: {}",
                status,
                body.trim()
            )));
        }

        response
            .json::<ReleaseManifest>()
            .await
            .map_err(|e| UpdateError::Resolution(format!("malformed release manifest: {}", e)))
    }
}

#[async_trait]
impl VersionSource for HttpVersionSource {
    #[instrument(skip(self))]
    async fn latest(&self, channel: &str) -> agentup_core::Result<AgentVersion> {
        let url = format!("{}/api/v1/agent/manifest?channel={}", self.server_url, channel);
        let release = self.fetch_manifest(&url).await?.into_agent_version(&self.server_url)?;
        info!(version = %release.number, "Latest release");
        Ok(release)
    }

    #[instrument(skip(self))]
    async fn release(&self, channel: &str, version: &Version) -> agentup_core::Result<AgentVersion> {
        let url = format!(
            "{}/api/v1/agent/releases/{}/manifest?channel={}",
            self.server_url, version, channel
        );
        self.fetch_manifest(&url).await?.into_agent_version(&self.server_url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mockito::Matcher;

    const MANIFEST: &str = r#"{"version": "1.3.0", "channel": "stable", "artifact": "agent-1.3.0.tar.gz",
        "sha256": "9f86d081884c7d659a2feaa0c55ad015a3bf4f1b2b0b822cd15d6c15b0f00a08", "size_bytes": 1024}"#;

    #[tokio::test]
    async fn test_latest_release() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/api/v1/agent/manifest")
            .match_query(Matcher::UrlEncoded("channel".into(), "stable".into()))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(MANIFEST)
            .create_async()
            .await;

        let source = HttpVersionSource::new(server.url(), Duration::from_secs(5)).unwrap();
        let release = source.latest("stable").await.unwrap();

        mock.assert_async().await;
        assert_eq!(release.number, Version::new(1, 3, 0));
        assert!(release.package.as_str().starts_with(&server.url()));
        assert_eq!(release.size_bytes, Some(1024));
    }

    #[tokio::test]
    async fn test_specific_release_and_errors() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/api/v1/agent/releases/1.3.0/manifest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body(MANIFEST)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/agent/releases/9.9.9/manifest")
            .match_query(Matcher::Any)
            .with_status(404)
            .create_async()
            .await;
        server
            .mock("GET", "/api/v1/agent/manifest")
            .match_query(Matcher::Any)
            .with_status(200)
            .with_body("{not json")
            .create_async()
            .await;

        let source = HttpVersionSource::new(server.url(), Duration::from_secs(5)).unwrap();
        let release = source.release("stable", &Version::new(1, 3, 0)).await.unwrap();
        assert_eq!(release.number, Version::new(1, 3, 0));

        assert!(matches!(
            source.release("stable", &Version::new(9, 9, 9)).await,
            Err(UpdateError::Resolution(_))
        ));
        assert!(matches!(source.latest("stable").await, Err(UpdateError::Resolution(_))));
    }

    #[tokio::test]
    async fn test_unreachable_server() {
        let source = HttpVersionSource::new("http://127.0.0.1:1", Duration::from_secs(2)).unwrap();
        assert!(matches!(source.latest("stable").await, Err(UpdateError::Resolution(_))));
    }
}
