//! Wire models for the V1 API.

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use uuid::Uuid;

use crate::db::Job;
use crate::db::JobLogChunk;
use crate::db::JobStatus;
use crate::db::Sandbox;

/// Maximum characters accepted for a job command.
pub const MAX_COMMAND_CHARS: usize = 20_000;

/// Maximum characters accepted for an image reference.
pub const MAX_IMAGE_CHARS: usize = 200;

/// Maximum job timeout in seconds.
pub const MAX_TIMEOUT_SECONDS: i64 = 86_400;

/// Marker appended to log chunks truncated at storage time.
pub const TRUNCATION_MARKER: &str = "\n[truncated]\n";

/// Request to submit a new job.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitJobRequest {
    /// The shell command to execute.
    pub command: String,
    /// Wall-clock timeout in seconds; the server default applies when
    /// omitted.
    #[serde(default)]
    pub timeout_seconds: Option<i64>,
    /// The sandbox to run under (default: `local`).
    #[serde(default)]
    pub sandbox: Option<Sandbox>,
    /// Container image, meaningful when the sandbox is `container`.
    #[serde(default)]
    pub image: Option<String>,
}

/// A job as returned by the API.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobBody {
    /// Unique identifier.
    pub id: Uuid,
    /// Owning consumer.
    pub consumer_id: Uuid,
    /// Current status.
    pub status: JobStatus,
    /// Timestamp when the job was submitted.
    pub created_at: DateTime<Utc>,
    /// Timestamp when a worker claimed the job.
    pub started_at: Option<DateTime<Utc>>,
    /// Timestamp when the job reached a terminal status.
    pub finished_at: Option<DateTime<Utc>>,
    /// The sandbox the command runs under.
    pub sandbox: Sandbox,
    /// Container image, when the sandbox is `container`.
    pub image: Option<String>,
    /// The shell command.
    pub command: String,
    /// Wall-clock timeout in seconds.
    pub timeout_seconds: i64,
    /// Identifier of the worker that claimed the job.
    pub worker_id: Option<String>,
    /// Exit code, when the executor produced one.
    pub exit_code: Option<i32>,
    /// Error message, set on internal failure.
    pub error: Option<String>,
}

impl From<Job> for JobBody {
    fn from(job: Job) -> Self {
        Self {
            id: job.id,
            consumer_id: job.consumer_id,
            status: job.status,
            created_at: job.created_at,
            started_at: job.started_at,
            finished_at: job.finished_at,
            sandbox: job.sandbox,
            image: job.image,
            command: job.command,
            timeout_seconds: job.timeout_seconds,
            worker_id: job.worker_id,
            exit_code: job.exit_code,
            error: job.error,
        }
    }
}

/// Query parameters for listing jobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListJobsQuery {
    /// Number of results to return (clamped to `1..=200`, default: `20`).
    #[serde(default)]
    pub limit: Option<i64>,
    /// Number of results to skip (default: `0`).
    #[serde(default)]
    pub offset: Option<i64>,
}

/// The response for a "list jobs" query.
#[derive(Debug, Serialize, Deserialize)]
pub struct ListJobsResponse {
    /// The effective limit after clamping.
    pub limit: i64,
    /// The effective offset after clamping.
    pub offset: i64,
    /// The caller's jobs, newest first.
    pub jobs: Vec<JobBody>,
}

/// Query parameters for fetching job logs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogsQuery {
    /// Return chunks with `seq >= offset_seq` (default: `0`).
    #[serde(default)]
    pub offset_seq: Option<i64>,
    /// Number of chunks to return (clamped to `1..=2000`, default: `500`).
    #[serde(default)]
    pub limit: Option<i64>,
}

/// The response for a "get job logs" query, also used as the WebSocket
/// frame shape.
#[derive(Debug, Serialize, Deserialize)]
pub struct LogsResponse {
    /// The job the chunks belong to.
    pub job_id: Uuid,
    /// The offset to pass to resume after the returned chunks (the input
    /// offset when no chunks were returned).
    pub next_offset_seq: i64,
    /// The chunks, ordered by `seq`.
    pub chunks: Vec<JobLogChunk>,
}

/// The response for a worker "claim" request.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClaimResponse {
    /// The claimed job, or `None` when the queue is empty (or blocked on
    /// quota).
    pub job: Option<JobBody>,
}

/// Request to append a batch of log chunks.
///
/// The `seq` carried by each chunk is advisory only; the server assigns
/// dense sequence numbers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppendLogsRequest {
    /// The chunks to append, in capture order.
    pub chunks: Vec<JobLogChunk>,
}

/// Request to finish a job with a terminal status.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinishRequest {
    /// The terminal status.
    pub status: JobStatus,
    /// Exit code, when the executor produced one.
    #[serde(default)]
    pub exit_code: Option<i32>,
    /// Error message, when the worker hit an internal failure.
    #[serde(default)]
    pub error: Option<String>,
}

/// A bare acknowledgement body.
#[derive(Debug, Serialize, Deserialize)]
pub struct OkResponse {
    /// Always `true`.
    pub ok: bool,
}

/// Truncate chunk text to `max` characters, marking truncation inline.
///
/// Truncation happens on a character boundary; the marker appears exactly
/// once, at the tail.
pub fn truncate_chunk_text(text: String, max: usize) -> String {
    if text.chars().count() <= max {
        return text;
    }

    let mut truncated: String = text.chars().take(max).collect();
    truncated.push_str(TRUNCATION_MARKER);
    truncated
}
