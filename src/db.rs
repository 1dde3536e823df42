//! Database schema and operations for the job queue.

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use thiserror::Error;
use uuid::Uuid;

pub mod models;
pub mod sqlite;

pub use models::Consumer;
pub use models::Job;
pub use models::JobLogChunk;
pub use models::JobStatus;
pub use models::LogStream;
pub use models::NewConsumer;
pub use models::NewJob;
pub use models::NewLogChunk;
pub use models::Sandbox;
pub use sqlite::SqliteDatabase;
pub use sqlite::database_file;

/// Database errors.
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// A database error.
    #[error(transparent)]
    Sqlx(#[from] sqlx::Error),

    /// A migration error.
    #[error(transparent)]
    Migration(#[from] sqlx::migrate::MigrateError),

    /// An I/O error.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// A unique constraint was violated on insert.
    #[error("{0} already exists")]
    AlreadyExists(String),

    /// Resource not found.
    #[error("not found")]
    NotFound,
}

/// Result type for database operations.
pub type Result<T> = std::result::Result<T, DatabaseError>;

/// A database trait containing the operations the coordinator needs.
///
/// All mutation of shared state goes through this trait; no component holds a
/// record reference beyond a single call.
#[async_trait]
pub trait Database: Send + Sync {
    /// Create a new consumer.
    ///
    /// Fails with [`DatabaseError::AlreadyExists`] when the name or key id
    /// collides with an existing consumer.
    async fn create_consumer(&self, new: NewConsumer) -> Result<Consumer>;

    /// Get a consumer by ID.
    async fn get_consumer(&self, id: Uuid) -> Result<Option<Consumer>>;

    /// Get a consumer by its public key identifier.
    async fn get_consumer_by_key_id(&self, key_id: &str) -> Result<Option<Consumer>>;

    /// Get a consumer by its unique name.
    async fn get_consumer_by_name(&self, name: &str) -> Result<Option<Consumer>>;

    /// List all consumers, oldest first.
    async fn list_consumers(&self) -> Result<Vec<Consumer>>;

    /// Enable or disable a consumer.
    ///
    /// Returns `true` if a consumer was updated, `false` if not found.
    async fn set_consumer_active(&self, id: Uuid, active: bool) -> Result<bool>;

    /// Update a consumer's quotas; `None` leaves the current value in place.
    ///
    /// Returns `true` if a consumer was updated, `false` if not found.
    async fn set_consumer_quotas(
        &self,
        id: Uuid,
        max_concurrent_jobs: Option<i64>,
        max_jobs_per_day: Option<i64>,
    ) -> Result<bool>;

    /// Replace a consumer's credential material (key rotation).
    ///
    /// Returns `true` if a consumer was updated, `false` if not found.
    async fn set_consumer_credentials(
        &self,
        id: Uuid,
        key_id: &str,
        key_salt: &str,
        key_digest: &str,
    ) -> Result<bool>;

    /// Delete a consumer along with its jobs and log chunks in a single
    /// transaction.
    async fn delete_consumer(&self, id: Uuid) -> Result<()>;

    /// Insert a new job with status `queued`.
    async fn create_job(&self, new: NewJob) -> Result<Job>;

    /// Get a job by ID.
    async fn get_job(&self, id: Uuid) -> Result<Option<Job>>;

    /// List a consumer's jobs, newest first.
    async fn list_jobs_by_consumer(
        &self,
        consumer_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>>;

    /// Count a consumer's currently running jobs.
    async fn count_running(&self, consumer_id: Uuid) -> Result<i64>;

    /// Count a consumer's jobs created at or after `since`.
    async fn count_created_since(&self, consumer_id: Uuid, since: DateTime<Utc>) -> Result<i64>;

    /// Get the oldest queued job (FIFO by `created_at`, ties broken by id).
    ///
    /// This is only a candidate: the caller must still win the conditional
    /// update in [`Database::claim_job`] before acting on it.
    async fn next_queued_job(&self) -> Result<Option<Job>>;

    /// Atomically transition a job from `queued` to `running`.
    ///
    /// The transition happens only if the job's status is still `queued` at
    /// update time; under concurrent workers at most one caller observes a
    /// `Some` result for any given job. Returns the updated row on success
    /// and `None` when another worker won the race (or the job is gone).
    async fn claim_job(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>>;

    /// The next log sequence number for a job: `max(seq) + 1`, or 0.
    async fn next_log_seq(&self, job_id: Uuid) -> Result<i64>;

    /// Append log chunks with dense, strictly increasing sequence numbers in
    /// the order supplied, in a single transaction.
    ///
    /// Returns the sequence number following the last inserted chunk.
    async fn append_log_chunks(&self, job_id: Uuid, chunks: &[NewLogChunk]) -> Result<i64>;

    /// List a job's log chunks with `seq >= offset_seq`, ordered by `seq`.
    async fn list_log_chunks(
        &self,
        job_id: Uuid,
        offset_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobLogChunk>>;

    /// Write a job's terminal state.
    ///
    /// Only a non-terminal row is updated, so repeated calls are no-ops and
    /// a terminal status never transitions backward. Returns `true` when
    /// this call performed the transition.
    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool>;
}
