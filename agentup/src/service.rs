//! Service manager integration for OpenRC and systemd.

use agentup_core::{ServiceController, ServiceState, UpdateError};
use async_trait::async_trait;
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::config::ServiceManager;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Start,
    Stop,
    Kill,
    Status,
}

/// Controls the agent through `rc-service` or `systemctl`.
pub struct CommandServiceController {
    manager: ServiceManager,
    name: String,
}

impl CommandServiceController {
    pub fn new(manager: ServiceManager, name: impl Into<String>) -> Self {
        Self {
            manager,
            name: name.into(),
        }
    }

    /// Commands to run for `action`, in order.
    fn commands(&self, action: Action) -> Vec<Vec<String>> {
        let name = self.name.as_str();
        let argv = |parts: &[&str]| parts.iter().map(|p| p.to_string()).collect::<Vec<_>>();

        match (self.manager, action) {
            (ServiceManager::Openrc, Action::Start) => vec![argv(&["rc-service", name, "start"])],
            (ServiceManager::Openrc, Action::Stop) => vec![argv(&["rc-service", name, "stop"])],
            (ServiceManager::Openrc, Action::Kill) => {
                let pidfile = format!("/run/{}.pid", name);
                vec![
                    argv(&["start-stop-daemon", "--stop", "--signal", "KILL", "--pidfile", &pidfile]),
                    argv(&["rc-service", name, "zap"]),
                ]
            }
            (ServiceManager::Openrc, Action::Status) => vec![argv(&["rc-service", name, "status"])],
            (ServiceManager::Systemd, Action::Start) => vec![argv(&["systemctl", "start", "--no-block", name])],
            (ServiceManager::Systemd, Action::Stop) => vec![argv(&["systemctl", "stop", "--no-block", name])],
            (ServiceManager::Systemd, Action::Kill) => {
                vec![argv(&["systemctl", "kill", "--signal=SIGKILL", name])]
            }
            (ServiceManager::Systemd, Action::Status) => vec![argv(&["systemctl", "is-active", name])],
        }
    }

    async fn run(&self, argv: &[String]) -> agentup_core::Result<std::process::Output> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| UpdateError::ServiceControl("empty command".to_string()))?;

        debug!(command = %argv.join(" "), "Running service command");
        Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|e| UpdateError::ServiceControl(format!("failed to run {}: {}", program, e)))
    }

    async fn execute(&self, action: Action) -> agentup_core::Result<()> {
        for argv in self.commands(action) {
            let output = self.run(&argv).await?;
            if !output.status.success() {
                let stderr = String::from_utf8_lossy(&output.stderr);
                return Err(UpdateError::ServiceControl(format!(
                    "`{}` failed: {}",
                    argv.join(" "),
                    stderr.trim()
                )));
            }
        }
        Ok(())
    }
}

fn parse_openrc_status(code: Option<i32>, stdout: &str) -> ServiceState {
    let stdout = stdout.to_ascii_lowercase();
    if code == Some(0) || stdout.contains("started") {
        ServiceState::Running
    } else if code == Some(3) || stdout.contains("stopped") || stdout.contains("crashed") {
        ServiceState::Stopped
    } else {
        ServiceState::Unknown
    }
}

fn parse_systemd_status(stdout: &str) -> ServiceState {
    match stdout.trim() {
        "active" | "activating" | "deactivating" | "reloading" => ServiceState::Running,
        "inactive" | "failed" => ServiceState::Stopped,
        _ => ServiceState::Unknown,
    }
}

#[async_trait]
impl ServiceController for CommandServiceController {
    fn name(&self) -> &str {
        &self.name
    }

    async fn start(&self) -> agentup_core::Result<()> {
        info!(service = %self.name, manager = ?self.manager, "Starting service");
        self.execute(Action::Start).await
    }

    async fn stop(&self) -> agentup_core::Result<()> {
        info!(service = %self.name, manager = ?self.manager, "Requesting service stop");
        self.execute(Action::Stop).await
    }

    async fn kill(&self) -> agentup_core::Result<()> {
        warn!(service = %self.name, manager = ?self.manager, "Killing service");
        self.execute(Action::Kill).await
    }

    async fn status(&self) -> agentup_core::Result<ServiceState> {
        let mut commands = self.commands(Action::Status);
        let argv = commands
            .pop()
            .ok_or_else(|| UpdateError::ServiceControl("no status command".to_string()))?;

        // Both tools report "not running" through a non-zero exit code.
        let output = self.run(&argv).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let state = match self.manager {
            ServiceManager::Openrc => parse_openrc_status(output.status.code(), &stdout),
            ServiceManager::Systemd => parse_systemd_status(&stdout),
        };
        debug!(service = %self.name, ?state, "Service status");
        Ok(state)
    }
}
