//! Implementation of the `worker` subcommand.

use anyhow::Result;
use clap::Parser;

use crate::config::Config;
use crate::worker::Worker;

/// Arguments to the `worker` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Coordinator base URL, overriding the configuration.
    #[arg(long)]
    pub server: Option<String>,

    /// Worker shared token, overriding the configuration.
    #[arg(long)]
    pub token: Option<String>,

    /// Worker identifier reported to the coordinator.
    #[arg(long)]
    pub worker_id: Option<String>,

    /// Poll interval between empty claims, in milliseconds.
    #[arg(long)]
    pub poll_interval_ms: Option<u64>,
}

/// The main function for the `worker` subcommand.
pub async fn worker(args: Args, mut config: Config) -> Result<()> {
    if let Some(server) = args.server {
        config.worker.server = server;
    }
    if let Some(token) = args.token {
        config.worker.token = Some(token);
    }
    if let Some(worker_id) = args.worker_id {
        config.worker.worker_id = worker_id;
    }
    if let Some(poll_interval_ms) = args.poll_interval_ms {
        config.worker.poll_interval_ms = poll_interval_ms;
    }

    Worker::new(config.worker, config.container)?.run().await
}
