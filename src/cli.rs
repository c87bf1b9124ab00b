//! Command-line interface definitions using clap.

use clap::{Parser, Subcommand, ValueEnum};
use sitepool::logging::LogFormat;
use sitepool::types::ProcessRole;
use std::path::PathBuf;

/// Site-isolating worker process pool.
#[derive(Parser, Debug)]
#[command(name = "sitepool")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// Pool configuration file (JSON). Overrides a script's own configuration.
    #[arg(long, env = "SITEPOOL_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Enable verbose output (-v for info, -vv for debug, -vvv for trace).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    pub verbose: u8,

    /// Suppress all output except errors.
    #[arg(short, long, conflicts_with = "verbose", global = true)]
    pub quiet: bool,

    /// Log output format.
    #[arg(long, value_enum, global = true)]
    pub log_format: Option<LogFormatArg>,

    /// Disable colored output.
    #[arg(long, env = "NO_COLOR", global = true)]
    pub no_color: bool,

    #[command(subcommand)]
    pub command: Commands,
}

/// Available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run a scripted sequence of page operations against a pool.
    Simulate(SimulateArgs),

    /// Serve as a worker process (used internally by the pool).
    #[command(hide = true)]
    Worker(WorkerArgs),
}

/// Arguments for the simulate command.
#[derive(Parser, Debug)]
pub struct SimulateArgs {
    /// Script file (JSON).
    pub script: PathBuf,

    /// Run worker logic inside this process instead of spawning workers.
    #[arg(long)]
    pub in_process: bool,

    /// How long to wait for a worker to answer, in milliseconds.
    #[arg(long, default_value_t = 5000)]
    pub timeout_ms: u64,
}

/// Arguments for worker mode.
#[derive(Parser, Debug)]
pub struct WorkerArgs {
    /// Role this worker plays.
    #[arg(long, value_enum)]
    pub role: RoleArg,
}

/// Worker roles as accepted on the command line.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum RoleArg {
    Content,
    Network,
    Gpu,
    Plugin,
    ServiceWorkerHost,
}

impl From<RoleArg> for ProcessRole {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Content => ProcessRole::Content,
            RoleArg::Network => ProcessRole::Network,
            RoleArg::Gpu => ProcessRole::Gpu,
            RoleArg::Plugin => ProcessRole::Plugin,
            RoleArg::ServiceWorkerHost => ProcessRole::ServiceWorkerHost,
        }
    }
}

#[derive(ValueEnum, Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogFormatArg {
    #[default]
    Pretty,
    Compact,
    Json,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Pretty => LogFormat::Pretty,
            LogFormatArg::Compact => LogFormat::Compact,
            LogFormatArg::Json => LogFormat::Json,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_is_well_formed() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_worker_role() {
        let cli = Cli::parse_from(["sitepool", "worker", "--role", "service-worker-host"]);
        match cli.command {
            Commands::Worker(args) => {
                assert_eq!(ProcessRole::from(args.role), ProcessRole::ServiceWorkerHost)
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_parse_simulate_with_global_flags() {
        let cli = Cli::parse_from([
            "sitepool",
            "simulate",
            "run.json",
            "--in-process",
            "-vv",
            "--log-format",
            "json",
        ]);
        assert_eq!(cli.verbose, 2);
        assert_eq!(cli.log_format, Some(LogFormatArg::Json));
        match cli.command {
            Commands::Simulate(args) => {
                assert!(args.in_process);
                assert_eq!(args.script, PathBuf::from("run.json"));
                assert_eq!(args.timeout_ms, 5000);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_quiet_conflicts_with_verbose() {
        assert!(Cli::try_parse_from(["sitepool", "-q", "-v", "simulate", "x.json"]).is_err());
    }
}
