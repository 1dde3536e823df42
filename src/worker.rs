//! The worker agent: claims queued jobs, drives the executor, and streams
//! logs back to the coordinator.
//!
//! The agent is stateless across jobs; a restart loses only in-flight
//! buffered logs. Log delivery is at-least-once on flush boundaries.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use chrono::Utc;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::config::ContainerConfig;
use crate::config::WorkerConfig;
use crate::db::JobLogChunk;
use crate::db::JobStatus;
use crate::db::LogStream;
use crate::executor::Execution;
use crate::executor::LogSink;
use crate::executor::SandboxLimits;
use crate::executor::run_sandbox;
use crate::server::api::WORKER_ID_HEADER;
use crate::server::api::WORKER_TOKEN_HEADER;
use crate::server::api::v1::models::AppendLogsRequest;
use crate::server::api::v1::models::ClaimResponse;
use crate::server::api::v1::models::FinishRequest;
use crate::server::api::v1::models::JobBody;

/// Flush the log buffer once it holds this many chunks.
const FLUSH_THRESHOLD: usize = 50;

/// Minimum back-off after a failed claim.
const CLAIM_BACKOFF: Duration = Duration::from_secs(1);

/// Per-request timeout for coordinator calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A long-running worker agent.
pub struct Worker {
    /// HTTP client with worker credentials installed as default headers.
    client: reqwest::Client,
    /// Coordinator base URL without a trailing slash.
    base: String,
    /// Worker settings.
    config: WorkerConfig,
    /// Container sandbox settings passed through to the executor.
    container: ContainerConfig,
}

impl Worker {
    /// Create a new worker agent.
    ///
    /// Fails when no worker token is configured; nothing useful can happen
    /// without one.
    pub fn new(config: WorkerConfig, container: ContainerConfig) -> Result<Self> {
        let token = config
            .token
            .clone()
            .filter(|token| !token.is_empty())
            .context("missing worker token (set `worker.token` or CRUCIBLE_WORKER_TOKEN)")?;

        let mut headers = HeaderMap::new();
        headers.insert(
            WORKER_TOKEN_HEADER,
            HeaderValue::from_str(&token).context("worker token is not a valid header value")?,
        );
        headers.insert(
            WORKER_ID_HEADER,
            HeaderValue::from_str(&config.worker_id)
                .context("worker id is not a valid header value")?,
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            base: config.server.trim_end_matches('/').to_string(),
            client,
            config,
            container,
        })
    }

    /// Run the claim/execute/report loop until the process is stopped.
    pub async fn run(&self) -> Result<()> {
        tracing::info!(
            "starting worker `{id}` against `{server}`",
            id = self.config.worker_id,
            server = self.base
        );

        let poll_interval = Duration::from_millis(self.config.poll_interval_ms);
        loop {
            match self.poll_once().await {
                Ok(true) => {}
                Ok(false) => tokio::time::sleep(poll_interval).await,
                Err(e) => {
                    tracing::warn!("claim cycle failed: {e:#}");
                    tokio::time::sleep(poll_interval.max(CLAIM_BACKOFF)).await;
                }
            }
        }
    }

    /// Claim and process at most one job.
    ///
    /// Returns `true` when a job was processed. Processing failures are
    /// logged and swallowed so they never take the worker down.
    pub async fn poll_once(&self) -> Result<bool> {
        let Some(job) = self.claim().await? else {
            return Ok(false);
        };

        if let Err(e) = self.process(job).await {
            tracing::warn!("job processing aborted: {e:#}");
        }

        Ok(true)
    }

    /// POST a claim request.
    async fn claim(&self) -> Result<Option<JobBody>> {
        let response = self
            .client
            .post(format!("{}/v1/worker/claim", self.base))
            .send()
            .await
            .context("claim request failed")?;

        if response.status().is_server_error() {
            tracing::warn!(
                "server error while claiming (status {}); common cause: coordinator missing its \
                 worker token configuration",
                response.status()
            );
        }

        let response = response.error_for_status().context("claim rejected")?;
        let body: ClaimResponse = response.json().await.context("malformed claim response")?;
        Ok(body.job)
    }

    /// Execute a claimed job and report logs plus the terminal status.
    async fn process(&self, job: JobBody) -> Result<()> {
        // The claim note goes out immediately so watchers see pickup before
        // any command output arrives.
        self.append_logs(
            job.id,
            vec![system_chunk(format!(
                "claimed job {id} at {ts}\n",
                id = job.id,
                ts = Utc::now().to_rfc3339()
            ))],
        )
        .await?;

        // Executor output funnels through a channel into a batching flusher;
        // the sink side is safe to call from both pump tasks.
        let (tx, rx) = mpsc::unbounded_channel::<JobLogChunk>();
        let sink: LogSink = Arc::new(move |stream: LogStream, text: String| {
            tx.send(JobLogChunk {
                seq: 0,
                ts: Utc::now(),
                stream,
                text,
            })
            .ok();
        });
        let flusher = tokio::spawn(flush_loop(
            self.client.clone(),
            format!("{base}/v1/worker/jobs/{id}/logs", base = self.base, id = job.id),
            rx,
        ));

        let execution = Execution {
            sandbox: job.sandbox,
            command: job.command.clone(),
            timeout: Duration::from_secs(job.timeout_seconds.max(1) as u64),
            image: job.image.clone(),
            limits: SandboxLimits::default(),
        };

        let (exit_code, error) = match run_sandbox(&execution, &self.container, &sink).await {
            Ok(code) => (Some(code), None),
            Err(e) => {
                let message = format!("worker exception: {e:#}");
                sink(LogStream::System, format!("{message}\n"));
                (None, Some(message))
            }
        };

        // Dropping our sink clone closes the channel once the executor's
        // pumps are done; the flusher then drains whatever remains.
        drop(sink);
        flusher
            .await
            .context("log flusher panicked")?
            .context("log flush failed")?;

        let status = if error.is_none() && exit_code == Some(0) {
            JobStatus::Succeeded
        } else {
            JobStatus::Failed
        };

        self.finish(job.id, status, exit_code, error).await
    }

    /// POST a batch of log chunks.
    async fn append_logs(&self, job_id: Uuid, chunks: Vec<JobLogChunk>) -> Result<()> {
        self.client
            .post(format!(
                "{base}/v1/worker/jobs/{job_id}/logs",
                base = self.base
            ))
            .json(&AppendLogsRequest { chunks })
            .send()
            .await
            .context("log append request failed")?
            .error_for_status()
            .context("log append rejected")?;
        Ok(())
    }

    /// POST the terminal status.
    async fn finish(
        &self,
        job_id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<String>,
    ) -> Result<()> {
        self.client
            .post(format!(
                "{base}/v1/worker/jobs/{job_id}/finish",
                base = self.base
            ))
            .json(&FinishRequest {
                status,
                exit_code,
                error,
            })
            .send()
            .await
            .context("finish request failed")?
            .error_for_status()
            .context("finish rejected")?;
        Ok(())
    }
}

impl std::fmt::Debug for Worker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Worker")
            .field("worker_id", &self.config.worker_id)
            .field("server", &self.base)
            .finish_non_exhaustive()
    }
}

/// A `system` stream chunk stamped with the current time.
fn system_chunk(text: String) -> JobLogChunk {
    JobLogChunk {
        seq: 0,
        ts: Utc::now(),
        stream: LogStream::System,
        text,
    }
}

/// Receive chunks and flush them in batches.
///
/// Flushes when the buffer reaches [`FLUSH_THRESHOLD`] and once more when
/// the channel closes; a failed flush aborts the loop and surfaces to the
/// job processor.
async fn flush_loop(
    client: reqwest::Client,
    url: String,
    mut rx: mpsc::UnboundedReceiver<JobLogChunk>,
) -> Result<()> {
    let mut buffer: Vec<JobLogChunk> = Vec::new();

    loop {
        match rx.recv().await {
            Some(chunk) => {
                buffer.push(chunk);
                if buffer.len() >= FLUSH_THRESHOLD {
                    flush(&client, &url, &mut buffer).await?;
                }
            }
            None => {
                flush(&client, &url, &mut buffer).await?;
                return Ok(());
            }
        }
    }
}

/// POST the buffered chunks, emptying the buffer on success.
async fn flush(client: &reqwest::Client, url: &str, buffer: &mut Vec<JobLogChunk>) -> Result<()> {
    if buffer.is_empty() {
        return Ok(());
    }

    let chunks = std::mem::take(buffer);
    client
        .post(url)
        .json(&AppendLogsRequest { chunks })
        .send()
        .await
        .context("log flush request failed")?
        .error_for_status()
        .context("log flush rejected")?;

    Ok(())
}
