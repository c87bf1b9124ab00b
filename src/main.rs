//! sitepool - site-isolating worker process pool

mod cli;

use anyhow::{Context, Result};
use clap::Parser;
use owo_colors::{OwoColorize, Stream::Stderr};
use sitepool::clock::SystemClock;
use sitepool::config::PoolConfiguration;
use sitepool::logging::{self, LogConfig};
use sitepool::pool::{PoolContext, ProcessPool};
use sitepool::process::{InProcessLauncher, run_worker_main};
use sitepool::simulate::{Script, Simulation};
use sitepool::types::ProcessRole;
use std::time::Duration;
use tracing::Level;

use cli::{Cli, Commands, SimulateArgs};

/// Parse arguments, dispatch the subcommand and print the error chain on
/// failure.
fn main() {
    let cli = Cli::parse();

    if cli.no_color {
        owo_colors::set_override(false);
    }

    let result = match &cli.command {
        Commands::Worker(args) => {
            let role = ProcessRole::from(args.role);
            logging::init(log_config(&cli, LogConfig::for_worker()));
            run_worker_main(role)
        }
        Commands::Simulate(args) => {
            logging::init(log_config(&cli, LogConfig::for_orchestrator()));
            cmd_simulate(&cli, args)
        }
    };

    if let Err(e) = result {
        eprintln!(
            "{}: {}",
            "error"
                .if_supports_color(Stderr, |text| text.red())
                .if_supports_color(Stderr, |text| text.bold()),
            e
        );
        for cause in e.chain().skip(1) {
            eprintln!(
                "  {}: {}",
                "caused by".if_supports_color(Stderr, |text| text.yellow()),
                cause
            );
        }
        std::process::exit(1);
    }
}

/// Apply verbosity and format flags on top of a preset, then the environment.
fn log_config(cli: &Cli, preset: LogConfig) -> LogConfig {
    let mut config = preset;
    if cli.quiet {
        config = config.with_level(Level::ERROR);
    } else {
        match cli.verbose {
            0 => {}
            1 => config = config.with_level(Level::INFO),
            2 => config = config.with_level(Level::DEBUG),
            _ => config = config.with_level(Level::TRACE),
        }
    }
    if let Some(format) = cli.log_format {
        config = config.with_format(format.into());
    }
    config.with_env_overrides()
}

fn cmd_simulate(cli: &Cli, args: &SimulateArgs) -> Result<()> {
    let script = Script::from_json_file(&args.script)
        .with_context(|| format!("Failed to load script {}", args.script.display()))?;

    let config = match &cli.config {
        Some(path) => PoolConfiguration::from_json_file(path)
            .with_context(|| format!("Failed to load configuration {}", path.display()))?,
        None => script.config.clone().unwrap_or_default(),
    }
    .with_env_overrides();

    let context = if args.in_process {
        PoolContext::new(InProcessLauncher::new(), SystemClock)
    } else {
        PoolContext::system()
    };
    let pool = ProcessPool::create(&context, config).context("Failed to create process pool")?;

    let mut simulation =
        Simulation::new(pool.clone()).with_event_timeout(Duration::from_millis(args.timeout_ms));
    let stdout = std::io::stdout();
    let mut out = stdout.lock();
    let statistics = simulation
        .run(&script.steps, &mut out)
        .context("Simulation failed")?;

    tracing::info!(
        processes_launched = statistics.processes_launched,
        swaps = statistics.process_swaps,
        crashes = statistics.crashes,
        "Simulation finished"
    );
    pool.borrow_mut().shut_down();
    Ok(())
}
