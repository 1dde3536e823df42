//! Implementation of the `job` subcommand: the consumer-facing CLI.

use std::str::FromStr;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use clap::Subcommand;
use uuid::Uuid;

use crate::client::Client;
use crate::config::Config;
use crate::db::Sandbox;
use crate::server::api::v1::models::JobBody;
use crate::server::api::v1::models::SubmitJobRequest;

/// Poll interval while following logs.
const FOLLOW_INTERVAL: Duration = Duration::from_millis(500);

/// Page size used when fetching logs.
const LOGS_PAGE: i64 = 500;

/// Arguments to the `job` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The job action to run.
    #[command(subcommand)]
    pub command: JobCommands,
}

/// Consumer job actions.
#[derive(Subcommand, Debug)]
pub enum JobCommands {
    /// Submit a job.
    Submit {
        /// The shell command to execute.
        #[arg(long)]
        command: String,
        /// The sandbox to run under (`local` or `container`).
        #[arg(long)]
        sandbox: Option<String>,
        /// Wall-clock timeout in seconds.
        #[arg(long)]
        timeout_seconds: Option<i64>,
        /// Container image (container sandbox only).
        #[arg(long)]
        image: Option<String>,
        /// Stream logs until the job finishes.
        #[arg(long)]
        follow: bool,
    },

    /// Show a job's status.
    Status {
        /// The job id.
        id: Uuid,
    },

    /// Fetch a job's logs.
    Logs {
        /// The job id.
        id: Uuid,
        /// Start from this sequence number.
        #[arg(long, default_value_t = 0)]
        offset_seq: i64,
        /// Keep streaming until the job finishes.
        #[arg(long)]
        follow: bool,
    },

    /// List your jobs, newest first.
    List {
        /// Number of jobs to return.
        #[arg(long, default_value_t = 20)]
        limit: i64,
        /// Number of jobs to skip.
        #[arg(long, default_value_t = 0)]
        offset: i64,
    },
}

/// The main function for the `job` subcommand.
pub async fn job(args: Args, config: Config) -> Result<()> {
    let client = client_from(&config)?;

    match args.command {
        JobCommands::Submit {
            command,
            sandbox,
            timeout_seconds,
            image,
            follow,
        } => {
            let sandbox = match sandbox.as_deref() {
                Some(s) => Sandbox::from_str(s).map_err(|e| anyhow::anyhow!(e))?,
                None => Sandbox::from_str(&config.client.default_sandbox)
                    .map_err(|e| anyhow::anyhow!(e))?,
            };

            let image = image.or_else(|| {
                (sandbox == Sandbox::Container)
                    .then(|| config.client.default_image.clone())
                    .flatten()
            });

            let job = client
                .submit_job(&SubmitJobRequest {
                    command,
                    timeout_seconds: timeout_seconds
                        .or(Some(config.client.default_timeout_seconds)),
                    sandbox: Some(sandbox),
                    image,
                })
                .await?;

            println!("job_id: {}", job.id);
            if follow {
                follow_logs(&client, job.id, 0).await?;
            }
        }
        JobCommands::Status { id } => {
            let job = client.get_job(id).await?;
            print_job(&job);
        }
        JobCommands::Logs {
            id,
            offset_seq,
            follow,
        } => {
            if follow {
                follow_logs(&client, id, offset_seq).await?;
            } else {
                let page = client.get_logs(id, offset_seq, LOGS_PAGE).await?;
                for chunk in &page.chunks {
                    print!("[{}] {}", chunk.stream, chunk.text);
                }
            }
        }
        JobCommands::List { limit, offset } => {
            let page = client.list_jobs(limit, offset).await?;
            if page.jobs.is_empty() {
                println!("(no jobs)");
                return Ok(());
            }
            for job in &page.jobs {
                println!(
                    "{id}  {status:<9}  {sandbox:<9}  exit={exit}  {command}",
                    id = job.id,
                    status = job.status.to_string(),
                    sandbox = job.sandbox.to_string(),
                    exit = job
                        .exit_code
                        .map(|c| c.to_string())
                        .unwrap_or_else(|| String::from("-")),
                    command = job.command
                );
            }
        }
    }

    Ok(())
}

/// Build the consumer client from configuration.
fn client_from(config: &Config) -> Result<Client> {
    let key = config
        .client
        .consumer_key
        .as_deref()
        .filter(|key| !key.is_empty())
        .context("missing consumer key (set `client.consumer_key` or CRUCIBLE_CONSUMER_KEY)")?;

    Client::new(&config.client.server, key)
}

/// Stream logs from a cursor until the job is terminal, then drain.
async fn follow_logs(client: &Client, id: Uuid, mut offset: i64) -> Result<()> {
    loop {
        let page = client.get_logs(id, offset, LOGS_PAGE).await?;
        for chunk in &page.chunks {
            print!("[{}] {}", chunk.stream, chunk.text);
        }
        offset = page.next_offset_seq;

        let job = client.get_job(id).await?;
        if job.status.is_terminal() {
            // One more pass for anything that landed during the last poll.
            loop {
                let page = client.get_logs(id, offset, LOGS_PAGE).await?;
                if page.chunks.is_empty() {
                    break;
                }
                for chunk in &page.chunks {
                    print!("[{}] {}", chunk.stream, chunk.text);
                }
                offset = page.next_offset_seq;
            }

            print_job(&job);
            if job.status != crate::db::JobStatus::Succeeded {
                bail!("job did not succeed");
            }
            return Ok(());
        }

        tokio::time::sleep(FOLLOW_INTERVAL).await;
    }
}

/// Print a job summary.
fn print_job(job: &JobBody) {
    println!("id: {}", job.id);
    println!("status: {}", job.status);
    println!("sandbox: {}", job.sandbox);
    if let Some(image) = &job.image {
        println!("image: {image}");
    }
    println!("created_at: {}", job.created_at.to_rfc3339());
    if let Some(started_at) = job.started_at {
        println!("started_at: {}", started_at.to_rfc3339());
    }
    if let Some(finished_at) = job.finished_at {
        println!("finished_at: {}", finished_at.to_rfc3339());
    }
    if let Some(worker_id) = &job.worker_id {
        println!("worker_id: {worker_id}");
    }
    if let Some(exit_code) = job.exit_code {
        println!("exit_code: {exit_code}");
    }
    if let Some(error) = &job.error {
        println!("error: {error}");
    }
}
