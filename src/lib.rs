//! A small distributed build service.
//!
//! Authenticated consumers submit shell commands, a central coordinator
//! persists them in a queue, workers claim and execute them in a
//! constrained sandbox (native subprocess or container), and ordered logs
//! stream back so clients can watch progress and collect the exit status.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(missing_debug_implementations)]
#![warn(clippy::missing_docs_in_private_items)]
#![warn(rustdoc::broken_intra_doc_links)]

use clap::Parser;
use tracing_subscriber::EnvFilter;

pub mod auth;
pub mod client;
pub mod commands;
pub mod config;
pub mod db;
pub mod executor;
pub mod server;
pub mod worker;

use commands::Cli;
use commands::Commands;
use config::Config;

/// The main entry point shared by the binary.
pub async fn crucible_main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = Config::load(cli.config.as_deref())?;

    match cli.command {
        Commands::Server(args) => commands::server::server(args, config).await,
        Commands::Worker(args) => commands::worker::worker(args, config).await,
        Commands::Admin(args) => commands::admin::admin(args, config).await,
        Commands::Job(args) => commands::job::job(args, config).await,
    }
}
