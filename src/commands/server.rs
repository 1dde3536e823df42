//! Implementation of the `server` subcommand.

use anyhow::Result;
use clap::Parser;

use crate::config::Config;

/// Arguments to the `server` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Host to bind to, overriding the configuration.
    #[arg(long)]
    pub host: Option<String>,

    /// Port to bind to, overriding the configuration.
    #[arg(long)]
    pub port: Option<u16>,
}

/// The main function for the `server` subcommand.
pub async fn server(args: Args, mut config: Config) -> Result<()> {
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(port) = args.port {
        config.server.port = port;
    }

    if config
        .server
        .worker_token
        .as_deref()
        .is_none_or(str::is_empty)
    {
        tracing::warn!(
            "no worker token configured; worker endpoints will answer 503 until \
             `server.worker_token` (or CRUCIBLE_WORKER_TOKEN) is set"
        );
    }

    crate::server::run(config).await
}
