//! SQLite database implementation.

use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::DateTime;
use chrono::Utc;
use sqlx::SqlitePool;
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::sqlite::SqliteJournalMode;
use sqlx::sqlite::SqliteSynchronous;
use uuid::Uuid;

use super::Database;
use super::DatabaseError;
use super::Result;
use super::models::Consumer;
use super::models::Job;
use super::models::JobLogChunk;
use super::models::JobStatus;
use super::models::NewConsumer;
use super::models::NewJob;
use super::models::NewLogChunk;

/// SQLite connection string prefix.
const SQLITE_CONNECTION_PREFIX: &str = "sqlite:";

/// The filesystem path behind a SQLite database URL.
///
/// Returns `None` for the in-memory forms (`sqlite::memory:`, `:memory:`,
/// or an empty path), which have no backing file to manage.
pub fn database_file(url: &str) -> Option<PathBuf> {
    let url = url.trim();
    let path = url
        .strip_prefix("sqlite://")
        .or_else(|| url.strip_prefix(SQLITE_CONNECTION_PREFIX))
        .unwrap_or(url);

    if path.is_empty() || path == ":memory:" {
        return None;
    }

    Some(PathBuf::from(path))
}

/// Enable foreign key constraint enforcement for referential integrity.
const SQLITE_FOREIGN_KEYS: &str = "on";

/// Configure 5-second timeout when the database is locked to prevent
/// spurious failures under concurrent claims.
const SQLITE_BUSY_TIMEOUT: &str = "5000";

/// The column list shared by all job selects.
const JOB_COLUMNS: &str = "id, consumer_id, status, created_at, started_at, finished_at, sandbox, \
                           image, command, timeout_seconds, worker_id, exit_code, error";

/// The column list shared by all consumer selects.
const CONSUMER_COLUMNS: &str = "id, name, active, key_id, key_salt, key_digest, \
                                max_concurrent_jobs, max_jobs_per_day, created_at";

/// SQLite database implementation.
#[derive(Debug, Clone)]
pub struct SqliteDatabase {
    /// The underlying SQLite connection pool.
    pool: SqlitePool,
}

impl SqliteDatabase {
    /// Create a new SQLite database connection from a database URL such as
    /// `sqlite://crucible.db` or `sqlite::memory:`; a bare file path is
    /// accepted too.
    ///
    /// For file-backed databases the parent directory is created.
    /// Migrations are run upon a successful connection pool being
    /// established.
    pub async fn new(database_url: &str) -> Result<Self> {
        if let Some(path) = database_file(database_url)
            && let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let connection_url = if database_url.starts_with(SQLITE_CONNECTION_PREFIX) {
            database_url.to_string()
        } else {
            format!("{SQLITE_CONNECTION_PREFIX}//{database_url}")
        };
        let options = SqliteConnectOptions::from_str(&connection_url)
            .map_err(sqlx::Error::from)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .pragma("foreign_keys", SQLITE_FOREIGN_KEYS)
            .pragma("busy_timeout", SQLITE_BUSY_TIMEOUT);

        let pool = SqlitePool::connect_with(options).await?;
        Self::from_pool(pool).await
    }

    /// Creates a new SQLite connection from an existing pool.
    ///
    /// This method also runs the embedded migrations.
    pub async fn from_pool(pool: SqlitePool) -> Result<Self> {
        sqlx::migrate!("./migrations").run(&pool).await?;
        Ok(Self { pool })
    }

    /// Get the underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Fetch a job by its string id, using the shared column list.
    async fn fetch_job(&self, id: &str) -> Result<Option<Job>> {
        let job: Option<Job> =
            sqlx::query_as(&format!("select {JOB_COLUMNS} from jobs where id = ?"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;

        Ok(job)
    }
}

#[async_trait]
impl Database for SqliteDatabase {
    async fn create_consumer(&self, new: NewConsumer) -> Result<Consumer> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        let result = sqlx::query(
            "insert into consumers (id, name, active, key_id, key_salt, key_digest, \
             max_concurrent_jobs, max_jobs_per_day, created_at) values (?, ?, 1, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&new.name)
        .bind(&new.key_id)
        .bind(&new.key_salt)
        .bind(&new.key_digest)
        .bind(new.max_concurrent_jobs)
        .bind(new.max_jobs_per_day)
        .bind(created_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(_) => {}
            Err(sqlx::Error::Database(e)) if e.is_unique_violation() => {
                return Err(DatabaseError::AlreadyExists(format!(
                    "consumer `{}`",
                    new.name
                )));
            }
            Err(e) => return Err(e.into()),
        }

        self.get_consumer(id).await?.ok_or(DatabaseError::NotFound)
    }

    async fn get_consumer(&self, id: Uuid) -> Result<Option<Consumer>> {
        let consumer: Option<Consumer> = sqlx::query_as(&format!(
            "select {CONSUMER_COLUMNS} from consumers where id = ?"
        ))
        .bind(id.to_string())
        .fetch_optional(&self.pool)
        .await?;

        Ok(consumer)
    }

    async fn get_consumer_by_key_id(&self, key_id: &str) -> Result<Option<Consumer>> {
        let consumer: Option<Consumer> = sqlx::query_as(&format!(
            "select {CONSUMER_COLUMNS} from consumers where key_id = ?"
        ))
        .bind(key_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(consumer)
    }

    async fn get_consumer_by_name(&self, name: &str) -> Result<Option<Consumer>> {
        let consumer: Option<Consumer> = sqlx::query_as(&format!(
            "select {CONSUMER_COLUMNS} from consumers where name = ?"
        ))
        .bind(name)
        .fetch_optional(&self.pool)
        .await?;

        Ok(consumer)
    }

    async fn list_consumers(&self) -> Result<Vec<Consumer>> {
        let consumers: Vec<Consumer> = sqlx::query_as(&format!(
            "select {CONSUMER_COLUMNS} from consumers order by created_at"
        ))
        .fetch_all(&self.pool)
        .await?;

        Ok(consumers)
    }

    async fn set_consumer_active(&self, id: Uuid, active: bool) -> Result<bool> {
        let result = sqlx::query("update consumers set active = ? where id = ?")
            .bind(active)
            .bind(id.to_string())
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_consumer_quotas(
        &self,
        id: Uuid,
        max_concurrent_jobs: Option<i64>,
        max_jobs_per_day: Option<i64>,
    ) -> Result<bool> {
        let result = sqlx::query(
            "update consumers set max_concurrent_jobs = coalesce(?, max_concurrent_jobs), \
             max_jobs_per_day = coalesce(?, max_jobs_per_day) where id = ?",
        )
        .bind(max_concurrent_jobs)
        .bind(max_jobs_per_day)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn set_consumer_credentials(
        &self,
        id: Uuid,
        key_id: &str,
        key_salt: &str,
        key_digest: &str,
    ) -> Result<bool> {
        let result = sqlx::query(
            "update consumers set key_id = ?, key_salt = ?, key_digest = ? where id = ?",
        )
        .bind(key_id)
        .bind(key_salt)
        .bind(key_digest)
        .bind(id.to_string())
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }

    async fn delete_consumer(&self, id: Uuid) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        sqlx::query(
            "delete from job_log_chunks where job_id in (select id from jobs where consumer_id = ?)",
        )
        .bind(id.to_string())
        .execute(&mut *tx)
        .await?;

        sqlx::query("delete from jobs where consumer_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let result = sqlx::query("delete from consumers where id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        if result.rows_affected() == 0 {
            return Err(DatabaseError::NotFound);
        }

        tx.commit().await?;
        Ok(())
    }

    async fn create_job(&self, new: NewJob) -> Result<Job> {
        let id = Uuid::new_v4();
        let created_at = Utc::now();

        sqlx::query(
            "insert into jobs (id, consumer_id, status, created_at, sandbox, image, command, \
             timeout_seconds) values (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(id.to_string())
        .bind(new.consumer_id.to_string())
        .bind(JobStatus::Queued)
        .bind(created_at)
        .bind(new.sandbox)
        .bind(&new.image)
        .bind(&new.command)
        .bind(new.timeout_seconds)
        .execute(&self.pool)
        .await?;

        self.fetch_job(&id.to_string())
            .await?
            .ok_or(DatabaseError::NotFound)
    }

    async fn get_job(&self, id: Uuid) -> Result<Option<Job>> {
        self.fetch_job(&id.to_string()).await
    }

    async fn list_jobs_by_consumer(
        &self,
        consumer_id: Uuid,
        limit: i64,
        offset: i64,
    ) -> Result<Vec<Job>> {
        let jobs: Vec<Job> = sqlx::query_as(&format!(
            "select {JOB_COLUMNS} from jobs where consumer_id = ? order by created_at desc, id \
             desc limit ? offset ?"
        ))
        .bind(consumer_id.to_string())
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        Ok(jobs)
    }

    async fn count_running(&self, consumer_id: Uuid) -> Result<i64> {
        let count: i64 =
            sqlx::query_scalar("select count(*) from jobs where consumer_id = ? and status = ?")
                .bind(consumer_id.to_string())
                .bind(JobStatus::Running)
                .fetch_one(&self.pool)
                .await?;

        Ok(count)
    }

    async fn count_created_since(&self, consumer_id: Uuid, since: DateTime<Utc>) -> Result<i64> {
        let count: i64 = sqlx::query_scalar(
            "select count(*) from jobs where consumer_id = ? and created_at >= ?",
        )
        .bind(consumer_id.to_string())
        .bind(since)
        .fetch_one(&self.pool)
        .await?;

        Ok(count)
    }

    async fn next_queued_job(&self) -> Result<Option<Job>> {
        let job: Option<Job> = sqlx::query_as(&format!(
            "select {JOB_COLUMNS} from jobs where status = ? order by created_at, id limit 1"
        ))
        .bind(JobStatus::Queued)
        .fetch_optional(&self.pool)
        .await?;

        Ok(job)
    }

    async fn claim_job(
        &self,
        id: Uuid,
        worker_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Option<Job>> {
        // A single conditional update; `rows_affected` decides the race.
        let result = sqlx::query(
            "update jobs set status = ?, started_at = ?, worker_id = ? where id = ? and status = ?",
        )
        .bind(JobStatus::Running)
        .bind(now)
        .bind(worker_id)
        .bind(id.to_string())
        .bind(JobStatus::Queued)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() != 1 {
            return Ok(None);
        }

        self.fetch_job(&id.to_string()).await
    }

    async fn next_log_seq(&self, job_id: Uuid) -> Result<i64> {
        let next: i64 = sqlx::query_scalar(
            "select coalesce(max(seq) + 1, 0) from job_log_chunks where job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_one(&self.pool)
        .await?;

        Ok(next)
    }

    async fn append_log_chunks(&self, job_id: Uuid, chunks: &[NewLogChunk]) -> Result<i64> {
        let mut tx = self.pool.begin().await?;

        let mut seq: i64 = sqlx::query_scalar(
            "select coalesce(max(seq) + 1, 0) from job_log_chunks where job_id = ?",
        )
        .bind(job_id.to_string())
        .fetch_one(&mut *tx)
        .await?;

        for chunk in chunks {
            sqlx::query(
                "insert into job_log_chunks (job_id, seq, ts, stream, text) values (?, ?, ?, ?, ?)",
            )
            .bind(job_id.to_string())
            .bind(seq)
            .bind(chunk.ts)
            .bind(chunk.stream)
            .bind(&chunk.text)
            .execute(&mut *tx)
            .await?;

            seq += 1;
        }

        tx.commit().await?;
        Ok(seq)
    }

    async fn list_log_chunks(
        &self,
        job_id: Uuid,
        offset_seq: i64,
        limit: i64,
    ) -> Result<Vec<JobLogChunk>> {
        let chunks: Vec<JobLogChunk> = sqlx::query_as(
            "select seq, ts, stream, text from job_log_chunks where job_id = ? and seq >= ? \
             order by seq limit ?",
        )
        .bind(job_id.to_string())
        .bind(offset_seq)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(chunks)
    }

    async fn finish_job(
        &self,
        id: Uuid,
        status: JobStatus,
        exit_code: Option<i32>,
        error: Option<&str>,
        finished_at: DateTime<Utc>,
    ) -> Result<bool> {
        // Only non-terminal rows transition; repeats are no-ops and a
        // terminal status never moves backward.
        let result = sqlx::query(
            "update jobs set status = ?, exit_code = ?, error = ?, finished_at = ? where id = ? \
             and status in (?, ?)",
        )
        .bind(status)
        .bind(exit_code)
        .bind(error)
        .bind(finished_at)
        .bind(id.to_string())
        .bind(JobStatus::Queued)
        .bind(JobStatus::Running)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() > 0)
    }
}
