//! Headless MOBA match runner.
//!
//! Runs scripted matches between a server and predicting clients without a
//! renderer or a network. Designed for CI, determinism checks and replay
//! verification.
//!
//! # Usage
//!
//! ```bash
//! # Run the built-in duel and print the report
//! cargo run -p moba_headless -- run
//!
//! # Run a scenario file, recording a replay
//! cargo run -p moba_headless -- run --scenario scenarios/lane_push.ron --record push.replay
//!
//! # Run a scenario several times in parallel and compare
//! cargo run -p moba_headless -- verify --scenario scenarios/duel.ron --runs 8
//!
//! # Play a replay back against its checkpoints
//! cargo run -p moba_headless -- replay push.replay --verify
//! ```
//!
//! Reports go to stdout as JSON, logs to stderr.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use moba_headless::runner::{inspect_replay, run_scenario, save_json, verify_scenario, RunnerError};
use moba_headless::scenario::Scenario;

#[derive(Parser)]
#[command(name = "moba_headless")]
#[command(about = "Headless MOBA match runner for CI and determinism checks")]
#[command(version)]
struct Cli {
    /// Enable verbose logging to stderr
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one scenario and print its report
    Run {
        /// Scenario file (defaults to the built-in duel)
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Override the host steps to run
        #[arg(long)]
        ticks: Option<u32>,

        /// Override the one-way link delay
        #[arg(long)]
        latency: Option<u32>,

        /// Write a replay of the server side to this file
        #[arg(long)]
        record: Option<PathBuf>,

        /// Write the report here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Run a scenario several times in parallel and compare final states
    Verify {
        /// Scenario file (defaults to the built-in duel)
        #[arg(short, long)]
        scenario: Option<PathBuf>,

        /// Number of runs
        #[arg(short, long, default_value = "4")]
        runs: usize,
    },

    /// Inspect a recorded replay
    Replay {
        /// Replay file
        file: PathBuf,

        /// Play it back and check every checkpoint
        #[arg(long)]
        verify: bool,
    },
}

fn main() {
    let cli = Cli::parse();

    // stdout carries the JSON reports
    let default_level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .with(filter)
        .init();

    let result = match cli.command {
        Commands::Run {
            scenario,
            ticks,
            latency,
            record,
            output,
        } => cmd_run(scenario, ticks, latency, record, output),
        Commands::Verify { scenario, runs } => cmd_verify(scenario, runs),
        Commands::Replay { file, verify } => cmd_replay(file, verify),
    };

    match result {
        Ok(true) => {}
        Ok(false) => std::process::exit(1),
        Err(e) => {
            tracing::error!(error = %e, "Command failed");
            eprintln!("FATAL: {e}");
            std::process::exit(2);
        }
    }
}

fn load_scenario(path: Option<PathBuf>) -> Result<Scenario, RunnerError> {
    match path {
        Some(path) => Ok(Scenario::load(path)?),
        None => Ok(Scenario::duel()),
    }
}

fn print_json<T: Serialize>(value: &T) -> Result<(), RunnerError> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn cmd_run(
    scenario: Option<PathBuf>,
    ticks: Option<u32>,
    latency: Option<u32>,
    record: Option<PathBuf>,
    output: Option<PathBuf>,
) -> Result<bool, RunnerError> {
    let mut scenario = load_scenario(scenario)?;
    if let Some(ticks) = ticks {
        scenario.ticks = ticks;
    }
    if let Some(latency) = latency {
        scenario.latency = latency;
    }

    let outcome = run_scenario(&scenario, record.is_some())?;
    if let (Some(path), Some(replay)) = (&record, &outcome.replay) {
        replay.save(path).map_err(RunnerError::Sim)?;
        tracing::info!(path = %path.display(), entries = replay.entries.len(), "Saved replay");
    }

    match output {
        Some(path) => save_json(&outcome.report, path)?,
        None => print_json(&outcome.report)?,
    }
    Ok(true)
}

fn cmd_verify(scenario: Option<PathBuf>, runs: usize) -> Result<bool, RunnerError> {
    let scenario = load_scenario(scenario)?;
    let report = verify_scenario(&scenario, runs)?;
    print_json(&report)?;
    if report.deterministic {
        eprintln!("PASS: {} runs of '{}' agree", report.runs, report.scenario);
    } else {
        eprintln!("FAIL: runs of '{}' diverged", report.scenario);
    }
    Ok(report.deterministic)
}

fn cmd_replay(file: PathBuf, verify: bool) -> Result<bool, RunnerError> {
    let summary = inspect_replay(&file, verify)?;
    print_json(&summary)?;
    match summary.verified {
        Some(true) => eprintln!("PASS: replay matches every checkpoint"),
        Some(false) => eprintln!("FAIL: replay diverged"),
        None => {}
    }
    Ok(summary.verified != Some(false))
}
