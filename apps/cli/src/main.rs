//! Stratus CLI - run and inspect workflows from the command line.
//!
//! Provides the `stratus` command. Runs execute in-process against a
//! file-backed checkpoint store, so a run started by one invocation can be
//! inspected or resumed by the next.

mod commands;
mod loopback;
mod output;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use stratus_core::{StratusConfig, init_logging};

/// Stratus - workflow orchestration for multi-agent systems
#[derive(Parser, Debug)]
#[command(name = "stratus", author, version, about = "Stratus - workflow orchestration for multi-agent systems")]
struct Args {
    /// Log level (trace, debug, info, warn, error); overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Configuration file (overrides STRATUS_CONFIG and the default locations)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Directory holding run checkpoints
    #[arg(short, long, global = true, default_value = ".stratus")]
    store: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a workflow definition
    ///
    /// Parses the file (TOML, or YAML for .yaml/.yml) and checks steps,
    /// dependencies, groups, and cycles without running anything.
    Validate {
        /// Definition file
        file: PathBuf,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Run a workflow to completion
    ///
    /// Agents are answered by the loopback invoker, which echoes each payload.
    Run {
        /// Definition file
        file: PathBuf,

        /// Initial run variable as KEY=VALUE (VALUE is parsed as JSON when possible)
        #[arg(long = "var", value_name = "KEY=VALUE")]
        vars: Vec<String>,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Show a run rebuilt from its checkpoints
    Status {
        /// Run ID
        run_id: String,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Resume an interrupted run
    Resume {
        /// Run ID
        run_id: String,

        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// List every run in the store
    Runs {
        /// Output results as JSON
        #[arg(long)]
        json: bool,
    },

    /// Delete a finished run and its checkpoints
    Purge {
        /// Run ID
        run_id: String,
    },
}

fn load_config(args: &Args) -> anyhow::Result<StratusConfig> {
    let mut config = match &args.config {
        Some(path) => StratusConfig::load_from_file(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => StratusConfig::load().context("Failed to load config")?,
    };
    if let Some(level) = &args.log_level {
        config.logging.level.clone_from(level);
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    init_logging(&config.logging);

    match args.command {
        Command::Validate { file, json } => commands::validate::execute(&file, json),
        Command::Run { file, vars, json } => {
            commands::run::execute(&file, &vars, &args.store, config, json).await
        }
        Command::Status { run_id, json } => {
            commands::status::execute(&run_id, &args.store, config, json).await
        }
        Command::Resume { run_id, json } => {
            commands::resume::execute(&run_id, &args.store, config, json).await
        }
        Command::Runs { json } => commands::runs::execute(&args.store, config, json).await,
        Command::Purge { run_id } => commands::purge::execute(&run_id, &args.store, config).await,
    }
}
