//! Command-line argument parsing.

use clap::{Args as ClapArgs, Parser, Subcommand};

/// agentup - Managed agent updater
#[derive(Parser, Debug)]
#[command(name = "agentup")]
#[command(about = "agentup - Update the managed agent on this host")]
#[command(version)]
pub struct Args {
    /// Path to configuration file (defaults used if the default path is missing)
    #[arg(short, long, global = true, env = "AGENTUP_CONFIG")]
    pub config: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true, default_value = "info")]
    pub log_level: String,

    /// Log output format (pretty, json)
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: String,

    /// Release channel to update from (dev, beta, stable)
    #[arg(long, global = true)]
    pub channel: Option<String>,

    /// Release server base URL
    #[arg(long, global = true)]
    pub server: Option<String>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Update the agent to the newest (or a specific) version
    Update(UpdateArgs),

    /// Report whether an update is available without changing anything
    Check {
        /// Check for a specific version instead of the newest
        #[arg(long = "version", value_name = "VERSION")]
        target: Option<String>,
    },

    /// Show the persisted update session, if any
    Status,

    /// Finish or undo a session left behind by a crashed run
    Recover {
        /// Clear the marker of a failed rollback after manual repair
        #[arg(long)]
        acknowledge: bool,
    },
}

#[derive(ClapArgs, Debug, Default)]
pub struct UpdateArgs {
    /// Version to install instead of the newest on the channel
    #[arg(long = "version", value_name = "VERSION")]
    pub target: Option<String>,

    /// Proceed when work is still running at the drain deadline.
    /// With --version, also allows reinstalling or downgrading.
    #[arg(long)]
    pub force: bool,

    /// Do not snapshot stateful files before installing
    #[arg(long)]
    pub skip_backup: bool,

    /// Maximum time to wait for in-flight work (e.g. "30m", "2h")
    #[arg(long, value_name = "DURATION")]
    pub max_wait: Option<String>,

    /// Resolve the target version and stop
    #[arg(long)]
    pub dry_run: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_update() {
        let args = Args::parse_from([
            "agentup",
            "--log-format",
            "json",
            "update",
            "--version",
            "1.3.0",
            "--force",
            "--max-wait",
            "5m",
        ]);
        assert_eq!(args.log_format, "json");
        match args.command {
            Command::Update(update) => {
                assert_eq!(update.target.as_deref(), Some("1.3.0"));
                assert!(update.force);
                assert!(!update.skip_backup);
                assert_eq!(update.max_wait.as_deref(), Some("5m"));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_global_flags_after_subcommand() {
        let args = Args::parse_from(["agentup", "recover", "--acknowledge", "--channel", "beta"]);
        assert_eq!(args.channel.as_deref(), Some("beta"));
        assert!(matches!(args.command, Command::Recover { acknowledge: true }));
    }
}
