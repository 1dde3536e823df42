//! Implementation of crucible CLI commands.

use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;

pub mod admin;
pub mod job;
pub mod server;
pub mod worker;

/// The crucible command line interface.
#[derive(Parser, Debug)]
#[command(
    name = "crucible",
    version,
    about = "A small distributed build service"
)]
pub struct Cli {
    /// Configuration file path.
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// The subcommand to run.
    #[command(subcommand)]
    pub command: Commands,
}

/// The available subcommands.
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the coordinator API server.
    Server(server::Args),

    /// Run a worker agent.
    Worker(worker::Args),

    /// Administer consumers and the database.
    Admin(admin::Args),

    /// Submit and inspect jobs as a consumer.
    Job(job::Args),
}
