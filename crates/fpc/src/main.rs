//! FPC CLI - full-page cache client.
//!
//! Provides commands for:
//! - `purge`: Purge URLs, a tag or the whole site
//! - `invalidate`: Keep pages as stale fallbacks while the service refreshes them
//! - `backlog`: Replay or inspect deferred remote operations
//! - `health`: Show or probe the service health status
//! - `key`: Show where a request would be cached

mod commands;
mod context;
mod error;
mod output;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use commands::{BacklogCommand, HealthCommand, InvalidateArgs, KeyArgs, PurgeArgs};
use context::GlobalArgs;
use output::Output;

/// FPC - full-page cache client.
#[derive(Parser)]
#[command(name = "fpc", version, about)]
struct Cli {
    #[command(flatten)]
    global: GlobalArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Purge pages locally, at the service and at reverse proxies.
    Purge(PurgeArgs),
    /// Invalidate pages, keeping them as stale fallbacks.
    Invalidate(InvalidateArgs),
    /// Deferred remote operations.
    #[command(subcommand)]
    Backlog(BacklogCommand),
    /// Remote service health.
    #[command(subcommand)]
    Health(HealthCommand),
    /// Show the cache location of a request.
    Key(KeyArgs),
}

fn main() {
    let cli = Cli::parse();
    let output = Output::new();

    // --verbose enables INFO level, otherwise use RUST_LOG or default to WARN
    let filter = if cli.global.verbose {
        EnvFilter::new("info")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"))
    };
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let result = match cli.command {
        Commands::Purge(args) => args.execute(&cli.global),
        Commands::Invalidate(args) => args.execute(&cli.global),
        Commands::Backlog(cmd) => cmd.execute(&cli.global),
        Commands::Health(cmd) => cmd.execute(&cli.global),
        Commands::Key(args) => args.execute(&cli.global),
    };

    if let Err(err) = result {
        output.error(&format!("Error: {err}"));
        std::process::exit(1);
    }
}
