//! CLI entrypoint for the allocguard harness.

use std::process::ExitCode;
use std::sync::Arc;

use allocguard_harness::{LifecycleConfig, StressConfig, run_lifecycle, run_scenario, run_stress};
use allocguard_tracker::{LogSink, NullSink, StderrSink, TrackerMode, tracker_config};
use clap::{Parser, Subcommand};
use serde::Serialize;

/// Drives allocguard-tracker through scripted and random workloads.
#[derive(Debug, Parser)]
#[command(name = "allocguard-harness")]
#[command(about = "Scenario, stress, and lifecycle driver for allocguard-tracker")]
struct Cli {
    /// Drop tracker log events instead of writing them to stderr.
    #[arg(long, global = true)]
    quiet: bool,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Walk the alloc/free round trip and the double-free and overrun paths.
    Scenario {
        /// Track without guard regions, whatever ALLOCGUARD_MODE asks for.
        #[arg(long)]
        no_canaries: bool,
    },
    /// Concurrent seeded alloc/free through per-thread allocators.
    Stress {
        /// Worker threads, each with its own allocator id.
        #[arg(long, default_value_t = 4)]
        threads: u8,
        /// Operations per worker.
        #[arg(long, default_value_t = 10_000)]
        ops: usize,
        /// Root seed (decimal or 0x...).
        #[arg(long, default_value = "0xDEAD_BEEF")]
        seed: String,
        /// Track without guard regions, whatever ALLOCGUARD_MODE asks for.
        #[arg(long)]
        no_canaries: bool,
    },
    /// Stack start-up/shut-down followed by a leak checkpoint.
    Lifecycle {
        /// Local controllers, each with a transmit and a completion queue.
        #[arg(long, default_value_t = 1)]
        controllers: usize,
        /// Buffers per queue.
        #[arg(long, default_value_t = 8)]
        depth: usize,
        /// Buffers to hold back at shut-down.
        #[arg(long, default_value_t = 0)]
        leak: usize,
        /// Track without guard regions, whatever ALLOCGUARD_MODE asks for.
        #[arg(long)]
        no_canaries: bool,
    },
}

fn print_json(report: &impl Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(report)?);
    Ok(())
}

fn verdict(passed: bool) -> ExitCode {
    if passed {
        ExitCode::SUCCESS
    } else {
        ExitCode::FAILURE
    }
}

/// `ALLOCGUARD_MODE`, with `--no-canaries` dropping the guard regions.
fn tracker_mode(no_canaries: bool) -> TrackerMode {
    let mode = tracker_config().mode;
    if no_canaries {
        mode.without_canaries()
    } else {
        mode
    }
}

fn main() -> Result<ExitCode, Box<dyn std::error::Error>> {
    let cli = Cli::parse();
    let sink: Arc<dyn LogSink> = if cli.quiet {
        Arc::new(NullSink)
    } else {
        Arc::new(StderrSink)
    };

    match cli.command {
        Command::Scenario { no_canaries } => {
            let report = run_scenario(tracker_mode(no_canaries), sink)?;
            print_json(&report)?;
            for failure in report.failures() {
                eprintln!("[{}] FAILED: {}", failure.name, failure.detail);
            }
            Ok(verdict(report.passed))
        }
        Command::Stress {
            threads,
            ops,
            seed,
            no_canaries,
        } => {
            let config = StressConfig {
                threads,
                ops,
                seed: parse_seed(&seed)?,
                mode: tracker_mode(no_canaries),
            };
            eprintln!(
                "Running stress: {threads} threads x {ops} ops, seed {:#x}",
                config.seed
            );
            let report = run_stress(config, sink)?;
            print_json(&report)?;
            Ok(verdict(report.passed))
        }
        Command::Lifecycle {
            controllers,
            depth,
            leak,
            no_canaries,
        } => {
            let report = run_lifecycle(
                LifecycleConfig {
                    controllers,
                    depth,
                    leak,
                    mode: tracker_mode(no_canaries),
                },
                sink,
            )?;
            print_json(&report)?;
            if !report.leaks.is_clean() {
                eprintln!("{}", report.leaks);
            }
            Ok(verdict(report.is_clean()))
        }
    }
}

fn parse_seed(raw: &str) -> Result<u64, Box<dyn std::error::Error>> {
    let cleaned = raw.trim().replace('_', "");
    let seed = match cleaned
        .strip_prefix("0x")
        .or_else(|| cleaned.strip_prefix("0X"))
    {
        Some(hex) => u64::from_str_radix(hex, 16)?,
        None => cleaned.parse::<u64>()?,
    };
    Ok(seed)
}
