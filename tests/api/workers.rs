//! Worker endpoint tests: the claim/append/finish protocol.

use axum::http::StatusCode;
use crucible::db::Database;
use serde_json::json;
use uuid::Uuid;

use super::WORKER_TOKEN;
use super::TestContext;
use super::context;
use super::context_with;
use super::provision;
use super::send;

/// Submit a job through the API, returning its id.
async fn submit(ctx: &TestContext, token: &str, command: &str) -> Uuid {
    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", token)],
        Some(json!({"command": command})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    body["id"].as_str().unwrap().parse().unwrap()
}

#[tokio::test]
async fn worker_endpoints_need_a_configured_token() {
    let ctx = context_with(|settings| settings.worker_token = None).await;

    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/worker/claim",
        &[("X-Worker-Token", "anything")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}

#[tokio::test]
async fn worker_token_mismatch_is_unauthorized() {
    let ctx = context().await;

    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/worker/claim",
        &[("X-Worker-Token", "wrong")],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, _) = send(&ctx.app, "POST", "/v1/worker/claim", &[], None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn claiming_an_empty_queue_returns_no_job() {
    let ctx = context().await;

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/worker/claim",
        &[("X-Worker-Token", WORKER_TOKEN)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn claims_drain_the_queue_in_fifo_order() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 10, 100).await;

    let mut ids = Vec::new();
    for i in 0..3 {
        ids.push(submit(&ctx, &token, &format!("echo {i}")).await);
    }

    for expected in &ids {
        let (status, body) = send(
            &ctx.app,
            "POST",
            "/v1/worker/claim",
            &[("X-Worker-Token", WORKER_TOKEN), ("X-Worker-Id", "builder-7")],
            None,
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let job = &body["job"];
        assert_eq!(job["id"], expected.to_string());
        assert_eq!(job["status"], "running");
        assert_eq!(job["worker_id"], "builder-7");
        assert!(job["started_at"].as_str().unwrap().ends_with('Z'));
    }

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/worker/claim",
        &[("X-Worker-Token", WORKER_TOKEN)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn claims_respect_the_owner_concurrency_quota() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "bob", 1, 10).await;

    submit(&ctx, &token, "sleep 2").await;
    submit(&ctx, &token, "sleep 2").await;

    let worker = [("X-Worker-Token", WORKER_TOKEN)];

    let (status, body) = send(&ctx.app, "POST", "/v1/worker/claim", &worker, None).await;
    assert_eq!(status, StatusCode::OK);
    let first: Uuid = body["job"]["id"].as_str().unwrap().parse().unwrap();

    // The owner is at its cap, so the second job stays queued.
    let (status, body) = send(&ctx.app, "POST", "/v1/worker/claim", &worker, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_null());

    // Finishing the first frees the slot.
    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{first}/finish"),
        &worker,
        Some(json!({"status": "succeeded", "exit_code": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&ctx.app, "POST", "/v1/worker/claim", &worker, None).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_object());
}

#[tokio::test]
async fn claims_skip_disabled_owners() {
    let ctx = context().await;
    let (consumer, token) = provision(ctx.db.as_ref(), "alice", 10, 100).await;
    submit(&ctx, &token, "echo hi").await;

    ctx.db
        .set_consumer_active(consumer.id, false)
        .await
        .expect("failed to disable");

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/worker/claim",
        &[("X-Worker-Token", WORKER_TOKEN)],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["job"].is_null());
}

#[tokio::test]
async fn appended_chunks_get_dense_server_assigned_sequences() {
    let ctx = context_with(|settings| settings.max_log_chars = 10).await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    let id = submit(&ctx, &token, "echo hi").await;

    let worker = [("X-Worker-Token", WORKER_TOKEN)];
    let now = chrono::Utc::now().to_rfc3339();

    // Advisory sequence numbers in the request are ignored.
    let (status, body) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{id}/logs"),
        &worker,
        Some(json!({"chunks": [
            {"seq": 99, "ts": now, "stream": "system", "text": "claimed\n"},
            {"seq": 7, "ts": now, "stream": "stdout", "text": "0123456789ABCDEF"}
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let (status, body) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{id}/logs"),
        &[("X-Consumer-Key", token.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let chunks = body["chunks"].as_array().unwrap();
    assert_eq!(chunks.len(), 2);
    assert_eq!(chunks[0]["seq"], 0);
    assert_eq!(chunks[0]["text"], "claimed\n");
    assert_eq!(chunks[1]["seq"], 1);

    // Over-long text is truncated with exactly one tail marker.
    let text = chunks[1]["text"].as_str().unwrap();
    assert_eq!(text, "0123456789\n[truncated]\n");
    assert_eq!(text.matches("[truncated]").count(), 1);
}

#[tokio::test]
async fn appending_to_a_terminal_job_is_a_noop_success() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    let id = submit(&ctx, &token, "echo hi").await;

    let worker = [("X-Worker-Token", WORKER_TOKEN)];
    let now = chrono::Utc::now().to_rfc3339();

    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{id}/finish"),
        &worker,
        Some(json!({"status": "cancelled"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{id}/logs"),
        &worker,
        Some(json!({"chunks": [
            {"seq": 0, "ts": now, "stream": "stdout", "text": "late\n"}
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);

    let chunks = ctx
        .db
        .list_log_chunks(id, 0, 10)
        .await
        .expect("failed to list chunks");
    assert!(chunks.is_empty(), "no chunk lands after the terminal write");
}

#[tokio::test]
async fn appending_to_an_unknown_job_is_not_found() {
    let ctx = context().await;
    let now = chrono::Utc::now().to_rfc3339();

    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{}/logs", Uuid::new_v4()),
        &[("X-Worker-Token", WORKER_TOKEN)],
        Some(json!({"chunks": [
            {"seq": 0, "ts": now, "stream": "stdout", "text": "hi\n"}
        ]})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn finish_is_idempotent_and_validates_the_status() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    let id = submit(&ctx, &token, "echo hi").await;

    let worker = [("X-Worker-Token", WORKER_TOKEN)];

    // A non-terminal status is rejected.
    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{id}/finish"),
        &worker,
        Some(json!({"status": "running"})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{id}/finish"),
        &worker,
        Some(json!({"status": "succeeded", "exit_code": 0})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Repeats are acknowledged without changing the terminal row.
    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{id}/finish"),
        &worker,
        Some(json!({"status": "failed", "exit_code": 1, "error": "late"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let job = ctx
        .db
        .get_job(id)
        .await
        .expect("failed to get job")
        .expect("job not found");
    assert_eq!(job.status, crucible::db::JobStatus::Succeeded);
    assert_eq!(job.exit_code, Some(0));
    assert!(job.error.is_none());
    assert!(job.finished_at.is_some());

    // Unknown jobs are a 404.
    let (status, _) = send(
        &ctx.app,
        "POST",
        &format!("/v1/worker/jobs/{}/finish", Uuid::new_v4()),
        &worker,
        Some(json!({"status": "failed"})),
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}
