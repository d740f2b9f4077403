//! Agent health probe over the agent's local HTTP endpoint.

use std::time::Duration;

use agentup_core::{parse_version, AgentHealth, AgentProbe, UpdateError};
use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

/// Body of the agent's health endpoint.
#[derive(Debug, Deserialize)]
struct HealthResponse {
    #[serde(default)]
    healthy: bool,
    #[serde(default)]
    version: Option<String>,
    #[serde(default)]
    busy: bool,
}

/// Queries `GET {health_url}`.
pub struct HttpAgentProbe {
    health_url: String,
    client: reqwest::Client,
}

impl HttpAgentProbe {
    pub fn new(health_url: impl Into<String>) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(5))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            health_url: health_url.into(),
            client,
        })
    }

    async fn query(&self) -> agentup_core::Result<Option<HealthResponse>> {
        let response = match self.client.get(&self.health_url).send().await {
            Ok(response) => response,
            Err(e) if e.is_connect() => {
                debug!(url = %self.health_url, "Agent not listening");
                return Ok(None);
            }
            Err(e) => {
                return Err(UpdateError::ServiceControl(format!("health probe failed: {}", e)));
            }
        };

        let status = response.status();
        let body = response.text().await.map_err(|e| {
            UpdateError::ServiceControl(format!("failed to read health response: {}", e))
        })?;

        match serde_json::from_str::<HealthResponse>(&body) {
            Ok(health) => Ok(Some(health)),
            // An unhealthy agent may answer 503 without a JSON body.
            Err(_) if !status.is_success() => Ok(Some(HealthResponse {
                healthy: false,
                version: None,
                busy: false,
            })),
            Err(e) => Err(UpdateError::ServiceControl(format!(
                "malformed health response: {}",
                e
            ))),
        }
    }
}

#[async_trait]
impl AgentProbe for HttpAgentProbe {
    async fn is_busy(&self) -> agentup_core::Result<bool> {
        Ok(self.query().await?.map(|h| h.busy).unwrap_or(false))
    }

    async fn health(&self) -> agentup_core::Result<AgentHealth> {
        let Some(response) = self.query().await? else {
            return Ok(AgentHealth {
                healthy: false,
                version: None,
            });
        };

        let version = match response.version.as_deref() {
            Some(raw) => match parse_version(raw) {
                Ok(v) => Some(v),
                Err(e) => {
                    debug!(version = %raw, error = %e, "Agent reported an unparseable version");
                    None
                }
            },
            None => None,
        };

        Ok(AgentHealth {
            healthy: response.healthy,
            version,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use semver::Version;

    #[tokio::test]
    async fn test_healthy_agent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"healthy": true, "version": "v1.3", "busy": true}"#)
            .create_async()
            .await;

        let probe = HttpAgentProbe::new(format!("{}/health", server.url())).unwrap();
        let health = probe.health().await.unwrap();
        assert!(health.healthy);
        assert_eq!(health.version, Some(Version::new(1, 3, 0)));
        assert!(probe.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn test_unavailable_agent() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(503)
            .with_body("starting")
            .create_async()
            .await;

        let probe = HttpAgentProbe::new(format!("{}/health", server.url())).unwrap();
        let health = probe.health().await.unwrap();
        assert!(!health.healthy);
        assert!(health.version.is_none());
    }

    #[tokio::test]
    async fn test_stopped_agent() {
        let probe = HttpAgentProbe::new("http://127.0.0.1:1/health").unwrap();
        assert!(!probe.health().await.unwrap().healthy);
        assert!(!probe.is_busy().await.unwrap());
    }

    #[tokio::test]
    async fn test_malformed_response() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/health")
            .with_status(200)
            .with_body("<html>")
            .create_async()
            .await;

        let probe = HttpAgentProbe::new(format!("{}/health", server.url())).unwrap();
        assert!(matches!(probe.is_busy().await, Err(UpdateError::ServiceControl(_))));
    }
}
