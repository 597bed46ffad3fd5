//! Binary entry point for homegraph.
//!
//! Exit codes: 0 on graceful shutdown, 2 on configuration errors, 3 on an
//! unrecoverable storage failure at startup.

#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![warn(missing_docs)]
#![allow(clippy::print_stderr)]

use clap::{Parser, Subcommand};
use homegraph::cli::{HashPasswordCommand, ServeCommand, StatusCommand};
use homegraph::config::HomeGraphConfig;
use homegraph::{observability, Error};

/// Exit code for configuration errors.
const EXIT_CONFIG: i32 = 2;

/// Exit code for unrecoverable storage failures at startup.
const EXIT_STORAGE: i32 = 3;

/// Local-first smart-home knowledge graph with bidirectional sync.
#[derive(Debug, Parser)]
#[command(name = "homegraph", version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Available subcommands.
#[derive(Debug, Subcommand)]
enum Command {
    /// Run the server core until Ctrl-C.
    Serve,
    /// Print store statistics.
    Status,
    /// Hash an admin password for provisioning.
    HashPassword {
        /// The password to hash (complexity rules apply).
        #[arg(long, env = "HOMEGRAPH_NEW_PASSWORD", hide_env_values = true)]
        password: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let config = match HomeGraphConfig::from_env() {
        Ok(config) => config,
        Err(e) => {
            eprintln!("configuration error: {e}");
            std::process::exit(EXIT_CONFIG);
        },
    };

    observability::init(config.log_format, config.log_filter.as_deref());

    let result = match cli.command {
        Command::Serve => ServeCommand::execute(&config).await,
        Command::Status => StatusCommand::execute(&config),
        Command::HashPassword { password } => HashPasswordCommand { password }.execute(&config),
    };

    if let Err(e) = result {
        eprintln!("error: {e}");
        let code = match e {
            Error::InvalidArgument(_) => EXIT_CONFIG,
            Error::StoreUnavailable { .. } => EXIT_STORAGE,
            _ => 1,
        };
        std::process::exit(code);
    }
}
