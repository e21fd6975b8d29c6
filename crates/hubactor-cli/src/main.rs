//! Command-line interface for hub actors.

mod console;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use hubactor_core::ActorConfig;
use hubactor_core::config::{defaults, env_vars};

/// Hub actor console - drive an actor with in-memory devices.
#[derive(Parser, Debug)]
#[command(name = "hubactor")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Action to perform.
    #[command(subcommand)]
    command: Command,
}

/// Available commands.
#[derive(Subcommand, Debug)]
enum Command {
    /// Validate a configuration file and print its queue policy.
    Check {
        /// Config file (defaults to $HUBACTOR_CONFIG).
        config: Option<PathBuf>,
    },
    /// Run an actor reading commands from stdin.
    Console {
        /// Config file (defaults to $HUBACTOR_CONFIG, then built-in defaults).
        config: Option<PathBuf>,
        /// Write status reports as JSON lines.
        #[arg(long)]
        json: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(defaults::LOG_FILTER));

    // stdout carries status lines, so logs go to stderr
    if env_vars::log_json() {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(env_filter)
            .with_target(true)
            .with_writer(std::io::stderr)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(false)
            .with_thread_ids(false)
            .with_file(false)
            .with_line_number(false)
            .compact()
            .with_writer(std::io::stderr)
            .init();
    }

    match args.command {
        Command::Check { config } => {
            let path = config_path(config).context("no config file given")?;
            let config = load_config(&path)?;
            print!("{}", console::describe_config(&config)?);
            Ok(())
        }
        Command::Console { config, json } => {
            let config = match config_path(config) {
                Some(path) => load_config(&path)?,
                None => ActorConfig::default(),
            };
            console::run(config, json).await
        }
    }
}

/// The path given on the command line, else `$HUBACTOR_CONFIG`.
fn config_path(arg: Option<PathBuf>) -> Option<PathBuf> {
    arg.or_else(|| std::env::var_os(env_vars::CONFIG).map(PathBuf::from))
}

fn load_config(path: &Path) -> Result<ActorConfig> {
    ActorConfig::load(path).with_context(|| format!("invalid config {}", path.display()))
}
