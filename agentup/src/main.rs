//! # agentup
//!
//! Host-side updater for the managed agent. Drains in-flight work, snapshots
//! the agent's stateful files, installs a new release, verifies it comes up,
//! and rolls back automatically if it does not.
//!
//! ## Usage
//! ```bash
//! agentup update                      # newest release on the configured channel
//! agentup update --version 1.4.0 --force
//! agentup check
//! agentup status
//! agentup recover [--acknowledge]
//! ```
//!
//! Exit codes: 0 success, 1 aborted or rolled back, 2 rollback failed.

use std::process::ExitCode;
use std::sync::Arc;

use agentup_common::LogFormat;
use agentup_core::{
    parse_version, Collaborators, ServiceController, UpdateError, UpdateOrchestrator, UpdateReport,
    UpdateRequest,
};
use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

mod cli;
mod config;
mod probe;
mod service;
mod update;

use cli::{Args, Command, UpdateArgs};
use config::{parse_duration, Config, ServiceConfig};
use probe::HttpAgentProbe;
use service::CommandServiceController;
use update::{HttpPackageFetcher, HttpVersionSource, TarExtractor};

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();

    let format = match args.log_format.parse::<LogFormat>() {
        Ok(format) => format,
        Err(e) => {
            eprintln!("{:#}", e);
            return ExitCode::from(1);
        }
    };
    if let Err(e) = agentup_common::init_logging(&args.log_level, format) {
        eprintln!("Failed to initialize logging: {:#}", e);
        return ExitCode::from(1);
    }

    info!(version = env!("CARGO_PKG_VERSION"), "Starting agentup");

    match run(args).await {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            error!(error = %format!("{:#}", e), "agentup failed");
            eprintln!("error: {:#}", e);
            ExitCode::from(exit_code_for(&e))
        }
    }
}

/// A failed rollback found on disk keeps its exit code.
fn exit_code_for(e: &anyhow::Error) -> u8 {
    match e.downcast_ref::<UpdateError>() {
        Some(UpdateError::FatalRollback(_)) => 2,
        _ => 1,
    }
}

async fn run(args: Args) -> Result<u8> {
    let config = Config::resolve(&args)?;
    let orchestrator = build_orchestrator(&config)?;

    match args.command {
        Command::Update(update) => {
            let request = update_request(&config, update)?;
            let report = orchestrator.run(request).await?;
            Ok(print_report(&report))
        }
        Command::Check { target } => {
            let request = UpdateRequest {
                target: target.as_deref().map(parse_version).transpose()?,
                max_wait: config.max_wait()?,
                dry_run: true,
                ..Default::default()
            };
            let report = orchestrator.run(request).await?;
            Ok(print_report(&report))
        }
        Command::Status => {
            match orchestrator.status().await? {
                Some(session) => {
                    let json = serde_json::to_string_pretty(&session).context("Failed to encode session")?;
                    println!("{}", json);
                }
                None => println!("no update session"),
            }
            Ok(0)
        }
        Command::Recover { acknowledge: true } => {
            if orchestrator.acknowledge_fatal().await? {
                println!("failed rollback acknowledged, updates are allowed again");
            } else {
                println!("no failed rollback to acknowledge");
            }
            Ok(0)
        }
        Command::Recover { acknowledge: false } => match orchestrator.recover().await? {
            Some(report) => Ok(print_report(&report)),
            None => {
                println!("nothing to recover");
                Ok(0)
            }
        },
    }
}

fn build_orchestrator(config: &Config) -> Result<UpdateOrchestrator> {
    let collaborators = Collaborators {
        source: Arc::new(HttpVersionSource::new(
            &config.source.server_url,
            config.request_timeout()?,
        )?),
        probe: Arc::new(HttpAgentProbe::new(&config.agent.health_url)?),
        controller: controller_for(&config.service),
        fetcher: Arc::new(HttpPackageFetcher::new()?),
        extractor: Arc::new(TarExtractor),
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupt received, cancelling update at the next safe point");
            on_signal.cancel();
        }
    });

    let orchestrator = UpdateOrchestrator::new(config.layout(), config.settings()?, collaborators, cancel)
        .context("Failed to initialize update orchestrator")?;
    Ok(orchestrator)
}

fn controller_for(service: &ServiceConfig) -> Arc<dyn ServiceController> {
    Arc::new(CommandServiceController::new(service.manager, &service.name))
}

fn update_request(config: &Config, args: UpdateArgs) -> Result<UpdateRequest> {
    let max_wait = match &args.max_wait {
        Some(raw) => parse_duration(raw)
            .filter(|d| !d.is_zero())
            .with_context(|| format!("Invalid --max-wait '{}'. Use format like '30m', '2h'", raw))?,
        None => config.max_wait()?,
    };

    Ok(UpdateRequest {
        target: args.target.as_deref().map(parse_version).transpose()?,
        force: args.force,
        skip_backup: args.skip_backup,
        max_wait,
        dry_run: args.dry_run,
    })
}

fn print_report(report: &UpdateReport) -> u8 {
    print!("{}", report);
    report.exit_code() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_update_request_from_args() {
        let config = Config::default();
        let request = update_request(
            &config,
            UpdateArgs {
                target: Some("v1.4".to_string()),
                force: true,
                max_wait: Some("5m".to_string()),
                ..Default::default()
            },
        )
        .unwrap();
        assert_eq!(request.target, Some(semver::Version::new(1, 4, 0)));
        assert!(request.force);
        assert_eq!(request.max_wait, Duration::from_secs(300));

        let request = update_request(&config, UpdateArgs::default()).unwrap();
        assert_eq!(request.max_wait, Duration::from_secs(3600));
        assert!(request.target.is_none());

        let bad = UpdateArgs {
            max_wait: Some("0s".to_string()),
            ..Default::default()
        };
        assert!(update_request(&config, bad).is_err());
    }

    #[test]
    fn test_exit_codes_for_startup_errors() {
        let fatal = anyhow::Error::new(UpdateError::FatalRollback("marker".to_string()));
        assert_eq!(exit_code_for(&fatal), 2);

        let busy = anyhow::Error::new(UpdateError::Resolution("offline".to_string()));
        assert_eq!(exit_code_for(&busy), 1);
        assert_eq!(exit_code_for(&anyhow::anyhow!("bad config")), 1);
    }
}
