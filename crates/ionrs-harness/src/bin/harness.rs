//! CLI entrypoint for the ionrs harness.

use std::path::PathBuf;
use std::process::ExitCode;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use ionrs_harness::render;
use ionrs_harness::scenario::{Scenario, ScenarioRunner};
use ionrs_harness::stress::{self, StressConfig};
use ionrs_harness::structured_log::LogEmitter;

/// Verification tooling for the ionrs allocator.
#[derive(Debug, Parser)]
#[command(name = "ionrs-harness")]
#[command(about = "Scenario runner, stress driver and reports for ionrs")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a JSON scenario and print its report as JSON.
    Run {
        /// Scenario file.
        #[arg(long)]
        scenario: PathBuf,
        /// Structured JSONL log path (discarded if omitted).
        #[arg(long)]
        log: Option<PathBuf>,
    },
    /// Run a scenario and print plain-text heap reports afterwards.
    Report {
        /// Scenario file.
        #[arg(long)]
        scenario: PathBuf,
    },
    /// Run a seeded multi-threaded workload against a simulation heap.
    Stress {
        #[arg(long, default_value_t = 4)]
        threads: usize,
        #[arg(long, default_value_t = 1000)]
        iterations: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0x2545F4914F6CDD1D")]
        seed: String,
        /// Simulation heap capacity in bytes.
        #[arg(long, default_value_t = 16 * 1024 * 1024)]
        capacity: usize,
        /// Destroy buffers inline instead of on a worker thread.
        #[arg(long)]
        sync_free: bool,
    },
}

fn parse_seed(text: &str) -> Result<u64, std::num::ParseIntError> {
    let cleaned = text.replace('_', "");
    match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Command::Run { scenario, log } => {
            let scenario = Scenario::from_file(&scenario)?;
            let mut runner = ScenarioRunner::new(&scenario)?;
            let report = match log {
                Some(path) => {
                    let mut emitter = LogEmitter::to_file(&path, &scenario.name)?;
                    runner.run(&scenario, &mut emitter)?
                }
                None => runner.run(&scenario, &mut LogEmitter::discard(&scenario.name))?,
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            if !report.passed() {
                eprintln!(
                    "scenario {} failed {} step(s)",
                    report.name,
                    report.failures().len()
                );
                return Ok(ExitCode::FAILURE);
            }
        }
        Command::Report { scenario } => {
            let scenario = Scenario::from_file(&scenario)?;
            let mut runner = ScenarioRunner::new(&scenario)?;
            runner.run(&scenario, &mut LogEmitter::discard(&scenario.name))?;
            print!("{}", render::render_device(runner.device()));
        }
        Command::Stress {
            threads,
            iterations,
            seed,
            capacity,
            sync_free,
        } => {
            let config = StressConfig {
                threads,
                iterations,
                seed: parse_seed(&seed)?,
                capacity,
                defer_free: !sync_free,
                ..StressConfig::default()
            };
            let report = stress::run(&config)?;
            println!("{}", serde_json::to_string_pretty(&report)?);
            if report.leaked_bytes != 0 {
                eprintln!("{} bytes still held after teardown", report.leaked_bytes);
                return Ok(ExitCode::FAILURE);
            }
        }
    }

    Ok(ExitCode::SUCCESS)
}
