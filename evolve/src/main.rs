//! Configuration-evolution harness for the task-solving engine.
//!
//! `run` executes one task under the current configuration and exits 0
//! only on a verified pass; `evolve` runs the slow loop that tunes the
//! engine's parameters from run history; `stats` summarizes recent runs.

mod cli;
mod config;
mod controller;
mod reasoner;
mod report;
mod store;
mod tasks;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "evolve",
    version,
    about = "Verification-gated task solving with configuration evolution"
)]
struct Cli {
    /// Path to the harness configuration file.
    #[arg(long, default_value = "evolve.toml")]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one task under the current configuration; exit 0 on verified pass.
    Run {
        task_id: String,
        /// Use this configuration scope instead of the task's own.
        #[arg(long)]
        scope: Option<String>,
    },
    /// Run the evolution loop for a task.
    Evolve {
        task_id: String,
        #[arg(long, default_value_t = 10)]
        iterations: u32,
        /// Seconds to sleep between iterations.
        #[arg(long, default_value_t = 0)]
        sleep_secs: u64,
    },
    /// Print a read-only summary of recent runs and changes.
    Stats {
        #[arg(long, default_value_t = 20)]
        limit: u32,
    },
    /// List available tasks.
    Tasks,
}

fn main() {
    engine::logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(1);
        }
    }
}

fn run() -> Result<i32> {
    let args = Cli::parse();
    let cfg = cli::load_cli_config(&args.config)?;
    match args.command {
        Command::Run { task_id, scope } => {
            let passed = cli::cmd_run(&cfg, &task_id, scope.as_deref())?;
            Ok(if passed { 0 } else { 1 })
        }
        Command::Evolve {
            task_id,
            iterations,
            sleep_secs,
        } => {
            cli::cmd_evolve(&cfg, &task_id, iterations, sleep_secs)?;
            Ok(0)
        }
        Command::Stats { limit } => {
            cli::cmd_stats(&cfg, limit)?;
            Ok(0)
        }
        Command::Tasks => {
            cli::cmd_tasks(&cfg)?;
            Ok(0)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_scope_override() {
        let cli = Cli::parse_from(["evolve", "run", "date-matcher", "--scope", "global"]);
        match cli.command {
            Command::Run { task_id, scope } => {
                assert_eq!(task_id, "date-matcher");
                assert_eq!(scope.as_deref(), Some("global"));
            }
            _ => panic!("expected run command"),
        }
    }

    #[test]
    fn parse_evolve_defaults() {
        let cli = Cli::parse_from(["evolve", "evolve", "date-matcher"]);
        match cli.command {
            Command::Evolve {
                iterations,
                sleep_secs,
                ..
            } => {
                assert_eq!(iterations, 10);
                assert_eq!(sleep_secs, 0);
            }
            _ => panic!("expected evolve command"),
        }
    }

    #[test]
    fn parse_custom_config_path() {
        let cli = Cli::parse_from(["evolve", "--config", "custom.toml", "stats"]);
        assert_eq!(cli.config, PathBuf::from("custom.toml"));
    }
}
