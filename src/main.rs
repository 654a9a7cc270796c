//! Binary entry point for lakegraph.
//!
//! This binary provides the CLI over graph loading, embedding, retrieval and
//! inference monitoring.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
// Allow print_stderr in main binary for CLI output
#![allow(clippy::print_stderr)]
#![allow(clippy::print_stdout)]
// Allow needless_pass_by_value for command functions
#![allow(clippy::needless_pass_by_value)]
// Allow multiple crate versions from transitive dependencies
#![allow(clippy::multiple_crate_versions)]

mod commands;

use clap::{Parser, Subcommand};
use commands::{GraphAction, MonitorAction, cmd_graph, cmd_monitor};
use lakegraph::config::LakegraphConfig;
use lakegraph::observability::{self, InitOptions};
use std::path::PathBuf;
use std::process::ExitCode;

/// Lakegraph - property-graph embedding, retrieval and inference monitoring.
#[derive(Parser)]
#[command(name = "lakegraph")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Enable verbose output.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to configuration file.
    #[arg(short, long, global = true, env = "LAKEGRAPH_CONFIG_PATH")]
    config: Option<PathBuf>,

    /// Serve Prometheus metrics while the command runs.
    #[arg(long, global = true)]
    metrics: bool,

    #[command(subcommand)]
    command: Commands,
}

/// Available commands.
#[derive(Subcommand)]
enum Commands {
    /// Graph database operations.
    Graph {
        #[command(subcommand)]
        action: GraphAction,
    },

    /// Inference monitoring.
    Monitor {
        #[command(subcommand)]
        action: MonitorAction,
    },

    /// Show the effective configuration source and paths.
    Config {
        /// Schema whose database path is shown.
        #[arg(short, long, default_value = "music_taste")]
        schema: String,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match LakegraphConfig::load(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Failed to load configuration: {e}");
            return ExitCode::FAILURE;
        },
    };

    let _observability = match observability::init_from_config(
        &config.observability,
        InitOptions {
            verbose: cli.verbose,
            metrics_expose: cli.metrics,
        },
    ) {
        Ok(handle) => handle,
        Err(e) => {
            eprintln!("Failed to initialize observability: {e}");
            return ExitCode::FAILURE;
        },
    };

    match run_command(cli.command, &config) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e}");
            ExitCode::FAILURE
        },
    }
}

/// Runs the selected command.
fn run_command(command: Commands, config: &LakegraphConfig) -> Result<(), Box<dyn std::error::Error>> {
    match command {
        Commands::Graph { action } => cmd_graph(config, action),
        Commands::Monitor { action } => cmd_monitor(config, action),
        Commands::Config { schema } => {
            match &config.source {
                Some(path) => println!("config file:  {}", path.display()),
                None => println!("config file:  (defaults)"),
            }
            println!("data dir:     {}", config.data_dir.display());
            println!("export dir:   {}", config.graph.export_dir.display());
            println!("import:       {}", config.graph.import_policy);
            println!("{schema} db: {}", config.graph_db_path(&schema).display());
            Ok(())
        },
    }
}
