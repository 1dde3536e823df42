//! Models that back database entities.

use std::fmt;
use std::str::FromStr;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sqlx::FromRow;
use sqlx::Type as SqlxType;
use uuid::Uuid;

/// The status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobStatus {
    /// The job is waiting to be claimed by a worker.
    Queued,
    /// The job has been claimed and is executing on a worker.
    Running,
    /// The job finished with exit code zero.
    Succeeded,
    /// The job finished with a non-zero exit code or an internal error.
    Failed,
    /// The job was cancelled before completion.
    Cancelled,
}

impl JobStatus {
    /// Whether this status is terminal.
    ///
    /// Terminal jobs never transition again and accept no further log chunks.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            JobStatus::Queued => write!(f, "queued"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for JobStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(JobStatus::Queued),
            "running" => Ok(JobStatus::Running),
            "succeeded" => Ok(JobStatus::Succeeded),
            "failed" => Ok(JobStatus::Failed),
            "cancelled" => Ok(JobStatus::Cancelled),
            _ => Err(format!("invalid job status: {}", s)),
        }
    }
}

/// The sandbox a job's command runs under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum Sandbox {
    /// A native subprocess with resource limits applied before exec.
    Local,
    /// A container with kernel-level isolation and resource limits.
    Container,
}

impl fmt::Display for Sandbox {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Sandbox::Local => write!(f, "local"),
            Sandbox::Container => write!(f, "container"),
        }
    }
}

impl FromStr for Sandbox {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(Sandbox::Local),
            "container" => Ok(Sandbox::Container),
            _ => Err(format!("invalid sandbox: {}", s)),
        }
    }
}

/// The stream a log chunk was captured from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, SqlxType)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum LogStream {
    /// Standard output of the job command.
    Stdout,
    /// Standard error of the job command.
    Stderr,
    /// Diagnostics emitted by the worker or executor, not the command.
    System,
}

impl fmt::Display for LogStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LogStream::Stdout => write!(f, "stdout"),
            LogStream::Stderr => write!(f, "stderr"),
            LogStream::System => write!(f, "system"),
        }
    }
}

impl FromStr for LogStream {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "stdout" => Ok(LogStream::Stdout),
            "stderr" => Ok(LogStream::Stderr),
            "system" => Ok(LogStream::System),
            _ => Err(format!("invalid log stream: {}", s)),
        }
    }
}

/// An authenticated submitting identity with its own quotas.
#[derive(Debug, Clone, FromRow)]
pub struct Consumer {
    /// Unique identifier.
    #[sqlx(try_from = "String")]
    pub id: Uuid,
    /// Unique human-readable name.
    pub name: String,
    /// Whether the consumer may authenticate and submit.
    pub active: bool,
    /// Public, lookupable portion of the credential.
    pub key_id: String,
    /// Base64url-encoded PBKDF2 salt.
    pub key_salt: String,
    /// Base64url-encoded PBKDF2 digest of the full token.
    pub key_digest: String,
    /// Maximum jobs this consumer may have running at once.
    pub max_concurrent_jobs: i64,
    /// Maximum jobs this consumer may create in a rolling 24 hours.
    pub max_jobs_per_day: i64,
    /// Timestamp when the consumer was provisioned.
    pub created_at: DateTime<Utc>,
}

/// Fields needed to provision a new consumer.
#[derive(Debug, Clone)]
pub struct NewConsumer {
    /// Unique human-readable name.
    pub name: String,
    /// Public key identifier.
    pub key_id: String,
    /// Base64url-encoded PBKDF2 salt.
    pub key_salt: String,
    /// Base64url-encoded PBKDF2 digest.
    pub key_digest: String,
    /// Concurrent job quota.
    pub max_concurrent_jobs: i64,
    /// Daily job quota.
    pub max_jobs_per_day: i64,
}

/// A single submitted unit of work.
#[derive(Debug, Clone, FromRow)]
pub struct Job {
    /// Unique identifier.
    #[sqlx(try_from = "String")]
    pub id: Uuid,
    /// Owning consumer.
    #[sqlx(try_from = "String")]
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
    /// The shell command to execute.
    pub command: String,
    /// Wall-clock timeout in seconds.
    pub timeout_seconds: i64,
    /// Identifier of the worker that claimed the job.
    pub worker_id: Option<String>,
    /// Exit code of the command, when the executor produced one.
    pub exit_code: Option<i32>,
    /// Error message, set on internal failure.
    pub error: Option<String>,
}

/// Fields needed to submit a new job.
#[derive(Debug, Clone)]
pub struct NewJob {
    /// Owning consumer.
    pub consumer_id: Uuid,
    /// The sandbox the command runs under.
    pub sandbox: Sandbox,
    /// Container image, when the sandbox is `container`.
    pub image: Option<String>,
    /// The shell command to execute.
    pub command: String,
    /// Wall-clock timeout in seconds.
    pub timeout_seconds: i64,
}

/// One append-only record of job output on a specific stream.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
pub struct JobLogChunk {
    /// Dense, zero-based sequence number within the job.
    pub seq: i64,
    /// Timestamp assigned by the worker that captured the chunk.
    pub ts: DateTime<Utc>,
    /// The stream the chunk was captured from.
    pub stream: LogStream,
    /// The chunk text, truncated server-side to the configured maximum.
    pub text: String,
}

/// A log chunk pending insertion; `seq` is assigned by the store.
#[derive(Debug, Clone)]
pub struct NewLogChunk {
    /// Timestamp assigned by the worker that captured the chunk.
    pub ts: DateTime<Utc>,
    /// The stream the chunk was captured from.
    pub stream: LogStream,
    /// The chunk text.
    pub text: String,
}
