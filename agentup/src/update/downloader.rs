//! Package downloader with resume support.
//!
//! Remote packages are streamed to disk. When a transfer breaks off, the
//! next attempt asks for the remaining bytes with an HTTP range request
//! instead of starting over. Local paths (`/srv/...` or `file://...`) are
//! copied.

use std::path::Path;
use std::time::Duration;

use agentup_core::{PackageFetcher, PackageLocator, UpdateError};
use anyhow::Context;
use async_trait::async_trait;
use futures::StreamExt;
use reqwest::StatusCode;
use tokio::fs::{self, File};
use tokio::io::AsyncWriteExt;
use tracing::{info, instrument, warn};

const DEFAULT_ATTEMPTS: u32 = 3;

enum Failure {
    /// The transfer broke off; another attempt can resume it.
    Interrupted(String),
    /// Retrying will not help.
    Fatal(String),
}

/// Fetches packages over HTTP(S) or from the local filesystem.
pub struct HttpPackageFetcher {
    client: reqwest::Client,
    attempts: u32,
    retry_delay: Duration,
}

impl HttpPackageFetcher {
    pub fn new() -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(300)) // 5 minute timeout for large packages
            .connect_timeout(Duration::from_secs(30))
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            attempts: DEFAULT_ATTEMPTS,
            retry_delay: Duration::from_secs(2),
        })
    }

    pub fn with_retries(mut self, attempts: u32, delay: Duration) -> Self {
        self.attempts = attempts.max(1);
        self.retry_delay = delay;
        self
    }

    async fn download(&self, url: &str, dest: &Path) -> Result<(), Failure> {
        let existing = fs::metadata(dest).await.map(|m| m.len()).unwrap_or(0);

        let mut request = self.client.get(url);
        if existing > 0 {
            info!(existing, "Resuming download");
            request = request.header("Range", format!("bytes={}-", existing));
        }

        let response = request
            .send()
            .await
            .map_err(|e| Failure::Interrupted(format!("failed to start download: {}", e)))?;

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE && existing > 0 {
            info!("Package already fully downloaded");
            return Ok(());
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let message = format!("download failed with status {}: {}", status, body.trim());
            return Err(if status.is_server_error() {
                Failure::Interrupted(message)
            } else {
                Failure::Fatal(message)
            });
        }

        // Append only if the server honoured the range request.
        let mut file = if existing > 0 && status == StatusCode::PARTIAL_CONTENT {
            fs::OpenOptions::new().append(true).open(dest).await
        } else {
            File::create(dest).await
        }
        .map_err(|e| Failure::Fatal(format!("failed to open {}: {}", dest.display(), e)))?;

        let mut stream = response.bytes_stream();
        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(|e| Failure::Interrupted(format!("error reading response: {}", e)))?;
            file.write_all(&chunk)
                .await
                .map_err(|e| Failure::Fatal(format!("failed to write {}: {}", dest.display(), e)))?;
        }

        file.flush()
            .await
            .map_err(|e| Failure::Fatal(format!("failed to flush {}: {}", dest.display(), e)))?;
        Ok(())
    }
}

#[async_trait]
impl PackageFetcher for HttpPackageFetcher {
    #[instrument(skip(self, dest), fields(dest = %dest.display()))]
    async fn fetch(&self, package: &PackageLocator, dest: &Path) -> agentup_core::Result<()> {
        if !package.is_remote() {
            let src = package.as_str().trim_start_matches("file://");
            fs::copy(src, dest)
                .await
                .map_err(|e| UpdateError::Download(format!("failed to copy {}: {}", src, e)))?;
            info!(src = %src, "Package copied from local path");
            return Ok(());
        }

        let mut attempt = 1;
        loop {
            match self.download(package.as_str(), dest).await {
                Ok(()) => {
                    info!(attempt, "Package downloaded");
                    return Ok(());
                }
                Err(Failure::Interrupted(reason)) if attempt < self.attempts => {
                    warn!(attempt, reason = %reason, "Download interrupted, retrying");
                    attempt += 1;
                    tokio::time::sleep(self.retry_delay).await;
                }
                Err(Failure::Interrupted(reason)) | Err(Failure::Fatal(reason)) => {
                    return Err(UpdateError::Download(format!("{}: {}", package, reason)));
                }
            }
        }
    }
}
