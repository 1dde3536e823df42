//! Worker-facing handlers: the claim/append/finish protocol.

use axum::Json;
use axum::extract::Path;
use axum::extract::State;
use axum::extract::rejection::JsonRejection;
use axum::http::HeaderMap;
use chrono::Utc;
use uuid::Uuid;

use super::super::AppState;
use super::super::require_worker;
use super::super::worker_id;
use super::super::error::Error;
use super::models::AppendLogsRequest;
use super::models::ClaimResponse;
use super::models::FinishRequest;
use super::models::OkResponse;
use super::models::truncate_chunk_text;
use crate::db::NewLogChunk;

/// Bounded retries for the select-then-claim race.
///
/// Losing the conditional update means another worker took the candidate;
/// trying the next candidate a few times keeps the endpoint responsive
/// under contention without spinning.
const CLAIM_ATTEMPTS: usize = 10;

/// Claim the oldest queued job, if any.
pub async fn claim(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ClaimResponse>, Error> {
    require_worker(&state, &headers)?;
    let worker = worker_id(&headers);

    for _ in 0..CLAIM_ATTEMPTS {
        let Some(candidate) = state.db().next_queued_job().await? else {
            return Ok(Json(ClaimResponse { job: None }));
        };

        // Re-check the owner's quota before committing the claim; a blocked
        // owner leaves the job queued rather than claiming it.
        let Some(owner) = state.db().get_consumer(candidate.consumer_id).await? else {
            return Ok(Json(ClaimResponse { job: None }));
        };
        if !owner.active {
            return Ok(Json(ClaimResponse { job: None }));
        }
        if state.db().count_running(owner.id).await? >= owner.max_concurrent_jobs {
            return Ok(Json(ClaimResponse { job: None }));
        }

        if let Some(job) = state
            .db()
            .claim_job(candidate.id, &worker, Utc::now())
            .await?
        {
            tracing::info!("worker `{worker}` claimed job `{id}`", id = job.id);
            return Ok(Json(ClaimResponse {
                job: Some(job.into()),
            }));
        }

        // Lost the race; select again.
    }

    Ok(Json(ClaimResponse { job: None }))
}

/// Append a batch of log chunks to a running job.
///
/// The server assigns dense sequence numbers; client-supplied `seq` values
/// are ignored. Appending to a terminal job is a no-op success so a slow
/// final flush cannot fail a worker.
pub async fn append_logs(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Result<Json<AppendLogsRequest>, JsonRejection>,
) -> Result<Json<OkResponse>, Error> {
    require_worker(&state, &headers)?;

    let Json(request) =
        payload.map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;

    let job = state.db().get_job(id).await?.ok_or(Error::JobNotFound)?;
    if job.status.is_terminal() {
        return Ok(Json(OkResponse { ok: true }));
    }

    let max = state.settings().max_log_chars;
    let chunks: Vec<NewLogChunk> = request
        .chunks
        .into_iter()
        .map(|chunk| NewLogChunk {
            ts: chunk.ts,
            stream: chunk.stream,
            text: truncate_chunk_text(chunk.text, max),
        })
        .collect();

    state.db().append_log_chunks(id, &chunks).await?;

    Ok(Json(OkResponse { ok: true }))
}

/// Record a job's terminal status.
pub async fn finish(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(id): Path<Uuid>,
    payload: Result<Json<FinishRequest>, JsonRejection>,
) -> Result<Json<OkResponse>, Error> {
    require_worker(&state, &headers)?;

    let Json(request) =
        payload.map_err(|rejection| Error::InvalidRequest(rejection.body_text()))?;

    if !request.status.is_terminal() {
        return Err(Error::InvalidRequest(format!(
            "`{}` is not a terminal status",
            request.status
        )));
    }

    state.db().get_job(id).await?.ok_or(Error::JobNotFound)?;

    state
        .db()
        .finish_job(
            id,
            request.status,
            request.exit_code,
            request.error.as_deref(),
            Utc::now(),
        )
        .await?;

    Ok(Json(OkResponse { ok: true }))
}
