//! Consumer-facing job handlers.

use axum::Json;
use axum::extract::Path;
use axum::extract::Query;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::extract::rejection::QueryRejection;
use axum::http::HeaderMap;
use chrono::Utc;
use uuid::Uuid;

use super::super::AppState;
use super::super::authenticate_consumer;
use super::super::error::Error;
use super::models::JobBody;
use super::models::ListJobsQuery;
use super::models::ListJobsResponse;
use super::models::LogsQuery;
use super::models::LogsResponse;
use super::models::MAX_COMMAND_CHARS;
use super::models::MAX_IMAGE_CHARS;
use super::models::MAX_TIMEOUT_SECONDS;
use super::models::SubmitJobRequest;
use crate::db::Consumer;
use crate::db::Job;
use crate::db::NewJob;
use crate::db::Sandbox;

/// Default page size for job listings.
const DEFAULT_LIST_LIMIT: i64 = 20;

/// Maximum page size for job listings.
const MAX_LIST_LIMIT: i64 = 200;

/// Default page size for log fetches.
const DEFAULT_LOGS_LIMIT: i64 = 500;

/// Maximum page size for log fetches.
const MAX_LOGS_LIMIT: i64 = 2000;

/// Reject a submission that would exceed the consumer's quotas.
///
/// The consumer's `active` flag was already checked during authentication;
/// this enforces the concurrency and daily caps.
async fn enforce_submit_quota(state: &AppState, consumer: &Consumer) -> Result<(), Error> {
    let running = state.db().count_running(consumer.id).await?;
    if running >= consumer.max_concurrent_jobs {
        return Err(Error::QuotaExceeded(String::from(
            "concurrent job limit reached",
        )));
    }

    let since = Utc::now() - chrono::Duration::days(1);
    let recent = state.db().count_created_since(consumer.id, since).await?;
    if recent >= consumer.max_jobs_per_day {
        return Err(Error::QuotaExceeded(String::from("daily job limit reached")));
    }

    Ok(())
}

/// Fetch a job scoped to its owner; anything else looks like a missing job.
async fn owned_job(state: &AppState, consumer: &Consumer, id: Uuid) -> Result<Job, Error> {
    match state.db().get_job(id).await? {
        Some(job) if job.consumer_id == consumer.id => Ok(job),
        _ => Err(Error::JobNotFound),
    }
}

/// Submit a new job.
pub async fn submit_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<SubmitJobRequest>, JsonRejection>,
) -> Result<Json<JobBody>, Error> {
    let consumer = authenticate_consumer(&state, &headers).await?;

    let Json(request) =
        payload.map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;

    let command_chars = request.command.chars().count();
    if command_chars == 0 || command_chars > MAX_COMMAND_CHARS {
        return Err(Error::InvalidRequest(format!(
            "`command` must be 1..={MAX_COMMAND_CHARS} characters"
        )));
    }

    let timeout_seconds = request
        .timeout_seconds
        .unwrap_or(state.settings().default_timeout_seconds);
    if !(1..=MAX_TIMEOUT_SECONDS).contains(&timeout_seconds) {
        return Err(Error::InvalidRequest(format!(
            "`timeout_seconds` must be 1..={MAX_TIMEOUT_SECONDS}"
        )));
    }

    let sandbox = request.sandbox.unwrap_or(Sandbox::Local);
    if sandbox == Sandbox::Local && !state.settings().allow_local_sandbox {
        return Err(Error::InvalidRequest(String::from(
            "local sandbox disabled on this server",
        )));
    }

    if let Some(image) = &request.image
        && image.chars().count() > MAX_IMAGE_CHARS
    {
        return Err(Error::InvalidRequest(format!(
            "`image` must be at most {MAX_IMAGE_CHARS} characters"
        )));
    }

    enforce_submit_quota(&state, &consumer).await?;

    let job = state
        .db()
        .create_job(NewJob {
            consumer_id: consumer.id,
            sandbox,
            image: request.image,
            command: request.command,
            timeout_seconds,
        })
        .await?;

    Ok(Json(job.into()))
}

/// List the caller's jobs, newest first.
pub async fn list_jobs(
    State(state): State<AppState>,
    headers: HeaderMap,
    query: Result<Query<ListJobsQuery>, QueryRejection>,
) -> Result<Json<ListJobsResponse>, Error> {
    let consumer = authenticate_consumer(&state, &headers).await?;

    let Query(query) = query.map_err(|rejection| match rejection {
        QueryRejection::FailedToDeserializeQueryString(err) => {
            Error::InvalidRequest(format!("invalid query parameters: {}", err))
        }
        _ => Error::InvalidRequest(String::from("invalid query parameters")),
    })?;

    let limit = query.limit.unwrap_or(DEFAULT_LIST_LIMIT).clamp(1, MAX_LIST_LIMIT);
    let offset = query.offset.unwrap_or(0).max(0);

    let jobs = state
        .db()
        .list_jobs_by_consumer(consumer.id, limit, offset)
        .await?;

    Ok(Json(ListJobsResponse {
        limit,
        offset,
        jobs: jobs.into_iter().map(Into::into).collect(),
    }))
}

/// Get one of the caller's jobs by ID.
pub async fn get_job(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
) -> Result<Json<JobBody>, Error> {
    let consumer = authenticate_consumer(&state, &headers).await?;
    let job = owned_job(&state, &consumer, id).await?;
    Ok(Json(job.into()))
}

/// Get a page of one of the caller's job's logs, ordered by sequence.
pub async fn get_job_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    query: Result<Query<LogsQuery>, QueryRejection>,
) -> Result<Json<LogsResponse>, Error> {
    let consumer = authenticate_consumer(&state, &headers).await?;
    owned_job(&state, &consumer, id).await?;

    let Query(query) = query.map_err(|rejection| match rejection {
        QueryRejection::FailedToDeserializeQueryString(err) => {
            Error::InvalidRequest(format!("invalid query parameters: {}", err))
        }
        _ => Error::InvalidRequest(String::from("invalid query parameters")),
    })?;

    let offset_seq = query.offset_seq.unwrap_or(0).max(0);
    let limit = query
        .limit
        .unwrap_or(DEFAULT_LOGS_LIMIT)
        .clamp(1, MAX_LOGS_LIMIT);

    let chunks = state.db().list_log_chunks(id, offset_seq, limit).await?;
    let next_offset_seq = chunks.last().map(|c| c.seq + 1).unwrap_or(offset_seq);

    Ok(Json(LogsResponse {
        job_id: id,
        next_offset_seq,
        chunks,
    }))
}
