//! Configuration for the updater.
//!
//! Loaded from `/etc/agentup/agentup.yaml` unless `--config` points
//! elsewhere. Every section is optional and falls back to its defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use agentup_core::{HostLayout, OrchestratorSettings};
use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::cli::Args;

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/agentup/agentup.yaml";

const CHANNELS: [&str; 3] = ["dev", "beta", "stable"];

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// The managed agent installation
    pub agent: AgentConfig,
    /// Release server
    pub source: SourceConfig,
    /// Service manager integration
    pub service: ServiceConfig,
    /// Update timing and scratch space
    pub update: UpdateConfig,
    /// Snapshot retention
    pub backup: BackupConfig,
    /// Session marker handling
    pub session: SessionConfig,
}

impl Config {
    /// Load configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            bail!("Config file not found: {}", path.display());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = serde_yaml::from_str(&content)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Load the file named by `--config`, or the default path if it exists,
    /// then apply CLI overrides and validate.
    pub fn resolve(args: &Args) -> Result<Self> {
        let config = match &args.config {
            Some(path) => {
                let config = Self::load(path)?;
                info!(config_path = %path, "Configuration loaded");
                config
            }
            None if Path::new(DEFAULT_CONFIG_PATH).exists() => {
                let config = Self::load(DEFAULT_CONFIG_PATH)?;
                info!(config_path = %DEFAULT_CONFIG_PATH, "Configuration loaded from default location");
                config
            }
            None => {
                info!("No config file found, using defaults");
                Self::default()
            }
        };

        let config = config.with_cli_overrides(args);
        config.validate()?;
        Ok(config)
    }

    /// Apply CLI argument overrides to the configuration.
    pub fn with_cli_overrides(mut self, args: &Args) -> Self {
        if let Some(channel) = &args.channel {
            self.source.channel = channel.clone();
        }

        if let Some(server) = &args.server {
            self.source.server_url = server.clone();
        }

        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.source.server_url.trim().is_empty() {
            bail!("source.server_url cannot be empty");
        }

        if !CHANNELS.contains(&self.source.channel.as_str()) {
            bail!(
                "Invalid channel '{}'. Must be dev, beta, or stable",
                self.source.channel
            );
        }

        if self.agent.health_url.trim().is_empty() {
            bail!("agent.health_url cannot be empty");
        }

        if self.service.name.trim().is_empty() {
            bail!("service.name cannot be empty");
        }

        for (key, value) in [
            ("source.request_timeout", &self.source.request_timeout),
            ("service.stop_grace", &self.service.stop_grace),
            ("update.drain_interval", &self.update.drain_interval),
            ("update.max_wait", &self.update.max_wait),
            ("update.liveness_timeout", &self.update.liveness_timeout),
            ("update.liveness_interval", &self.update.liveness_interval),
            ("session.stale_after", &self.session.stale_after),
        ] {
            duration_setting(key, value)?;
        }

        // A live session must never look stale while it is still waiting.
        let longest_wait = self.max_wait()? + self.liveness_timeout()?;
        if self.stale_after()? <= longest_wait {
            bail!(
                "session.stale_after ({}) must exceed update.max_wait + update.liveness_timeout",
                self.session.stale_after
            );
        }

        self.layout().validate().context("Invalid agent layout")?;

        Ok(())
    }

    pub fn layout(&self) -> HostLayout {
        HostLayout::new(&self.agent.install_dir, &self.update.data_dir)
            .with_version_file(&self.agent.version_file)
            .with_stateful_files(self.agent.stateful_files.iter())
    }

    pub fn settings(&self) -> Result<OrchestratorSettings> {
        Ok(OrchestratorSettings {
            channel: self.source.channel.clone(),
            drain_interval: duration_setting("update.drain_interval", &self.update.drain_interval)?,
            liveness_timeout: self.liveness_timeout()?,
            liveness_interval: duration_setting("update.liveness_interval", &self.update.liveness_interval)?,
            stop_grace: duration_setting("service.stop_grace", &self.service.stop_grace)?,
            backup_retain: self.backup.retain,
            stale_after: self.stale_after()?,
        })
    }

    pub fn max_wait(&self) -> Result<Duration> {
        duration_setting("update.max_wait", &self.update.max_wait)
    }

    pub fn request_timeout(&self) -> Result<Duration> {
        duration_setting("source.request_timeout", &self.source.request_timeout)
    }

    fn liveness_timeout(&self) -> Result<Duration> {
        duration_setting("update.liveness_timeout", &self.update.liveness_timeout)
    }

    fn stale_after(&self) -> Result<Duration> {
        duration_setting("session.stale_after", &self.session.stale_after)
    }
}

/// The managed agent installation.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Directory the agent is installed in
    pub install_dir: PathBuf,
    /// Version metadata file, relative to `install_dir`
    pub version_file: String,
    /// Entries under `install_dir` that hold identity, credentials, or
    /// work-in-progress and survive every update
    pub stateful_files: Vec<String>,
    /// Agent health endpoint returning `{"healthy", "version", "busy"}`
    pub health_url: String,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            install_dir: PathBuf::from("/opt/agent"),
            version_file: agentup_core::layout::DEFAULT_VERSION_FILE.to_string(),
            stateful_files: vec![
                ".identity".to_string(),
                ".credentials".to_string(),
                "_work".to_string(),
            ],
            health_url: "http://127.0.0.1:8079/health".to_string(),
        }
    }
}

/// Release server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Base URL of the release server
    pub server_url: String,
    /// Release channel (dev, beta, stable)
    pub channel: String,
    /// Timeout for manifest requests (e.g. "30s")
    pub request_timeout: String,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            server_url: "http://127.0.0.1:9000".to_string(),
            channel: "stable".to_string(),
            request_timeout: "30s".to_string(),
        }
    }
}

/// Which service manager runs the agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ServiceManager {
    #[default]
    Openrc,
    Systemd,
}

/// Service manager configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServiceConfig {
    pub manager: ServiceManager,
    /// Service (OpenRC) or unit (systemd) name
    pub name: String,
    /// Time a graceful stop is given before the agent is killed
    pub stop_grace: String,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            manager: ServiceManager::default(),
            name: "agent".to_string(),
            stop_grace: "30s".to_string(),
        }
    }
}

/// Update timing and scratch space.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpdateConfig {
    /// Session marker, snapshots, kept-aside binaries, downloads
    pub data_dir: PathBuf,
    /// Interval between activity polls while draining
    pub drain_interval: String,
    /// Default maximum drain wait (overridden by `update --max-wait`)
    pub max_wait: String,
    /// Time the new version has to report itself healthy
    pub liveness_timeout: String,
    /// Interval between health polls
    pub liveness_interval: String,
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("/var/lib/agentup"),
            drain_interval: "30s".to_string(),
            max_wait: "60m".to_string(),
            liveness_timeout: "2m".to_string(),
            liveness_interval: "2s".to_string(),
        }
    }
}

/// Snapshot retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupConfig {
    /// Snapshots to keep; 0 keeps all
    pub retain: usize,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self { retain: 3 }
    }
}

/// Session marker handling.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Heartbeat age after which a marker is considered abandoned
    pub stale_after: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            stale_after: "6h".to_string(),
        }
    }
}

/// Parse a duration string like "30s", "5m", "1h", "1d".
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }

    let (num, unit) = s.split_at(s.len() - 1);
    let num: u64 = num.parse().ok()?;

    let seconds = match unit {
        "s" => num,
        "m" => num * 60,
        "h" => num * 3600,
        "d" => num * 86400,
        _ => return None,
    };

    Some(Duration::from_secs(seconds))
}

fn duration_setting(key: &str, value: &str) -> Result<Duration> {
    match parse_duration(value) {
        Some(d) if !d.is_zero() => Ok(d),
        Some(_) => bail!("{} must be greater than zero", key),
        None => bail!(
            "Invalid duration '{}' for {}. Use format like '30s', '5m', '1h', '1d'",
            value,
            key
        ),
    }
}
