//! Consumer endpoint tests: auth, validation, quotas, listing, and logs.

use axum::http::StatusCode;
use chrono::Utc;
use crucible::db::Database;
use crucible::db::JobStatus;
use crucible::db::LogStream;
use crucible::db::NewLogChunk;
use serde_json::json;

use super::context;
use super::context_with;
use super::provision;
use super::send;

#[tokio::test]
async fn submit_without_key_is_unauthorized() {
    let ctx = context().await;

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[],
        Some(json!({"command": "echo hi"})),
    )
    .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert!(body["error"].as_str().unwrap().contains("X-Consumer-Key"));
}

#[tokio::test]
async fn submit_with_tampered_secret_is_unauthorized() {
    let ctx = context().await;
    let (consumer, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;

    // Same key id, wrong secret.
    let tampered = format!("{}.db_not-the-secret", consumer.key_id);
    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", tampered.as_str())],
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    // Sanity: the untampered token works.
    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", token.as_str())],
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn disabled_consumer_is_forbidden() {
    let ctx = context().await;
    let (consumer, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    ctx.db
        .set_consumer_active(consumer.id, false)
        .await
        .expect("failed to disable");

    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", token.as_str())],
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn submit_creates_a_queued_job() {
    let ctx = context().await;
    let (consumer, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", token.as_str())],
        Some(json!({
            "command": "echo hi",
            "sandbox": "local",
            "timeout_seconds": 5
        })),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "queued");
    assert_eq!(body["sandbox"], "local");
    assert_eq!(body["command"], "echo hi");
    assert_eq!(body["timeout_seconds"], 5);
    assert_eq!(body["consumer_id"], consumer.id.to_string());
    assert!(body["started_at"].is_null());
    assert!(body["exit_code"].is_null());
    // Timestamps are RFC 3339 UTC with a trailing Z.
    assert!(body["created_at"].as_str().unwrap().ends_with('Z'));
}

#[tokio::test]
async fn submit_validation_failures_are_bad_requests() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    let auth = [("X-Consumer-Key", token.as_str())];

    let cases = [
        json!({"command": ""}),
        json!({"command": "echo hi", "timeout_seconds": 0}),
        json!({"command": "echo hi", "timeout_seconds": 86401}),
        json!({"command": "echo hi", "sandbox": "chroot"}),
        json!({"command": "echo hi", "sandbox": "container", "image": "x".repeat(201)}),
    ];

    for case in cases {
        let (status, _) = send(&ctx.app, "POST", "/v1/jobs", &auth, Some(case.clone())).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "case: {case}");
    }
}

#[tokio::test]
async fn local_sandbox_can_be_disabled() {
    let ctx = context_with(|settings| settings.allow_local_sandbox = false).await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", token.as_str())],
        Some(json!({"command": "echo hi", "sandbox": "local"})),
    )
    .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(body["error"].as_str().unwrap().contains("local sandbox"));

    // Container submissions are still accepted.
    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", token.as_str())],
        Some(json!({"command": "echo hi", "sandbox": "container"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn daily_quota_is_enforced() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 10, 1).await;
    let auth = [("X-Consumer-Key", token.as_str())];

    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &auth,
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &auth,
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("daily"));
}

#[tokio::test]
async fn concurrency_quota_gates_submission_until_a_job_finishes() {
    let ctx = context().await;
    let (consumer, token) = provision(ctx.db.as_ref(), "bob", 1, 10).await;
    let auth = [("X-Consumer-Key", token.as_str())];

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &auth,
        Some(json!({"command": "sleep 2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let first: uuid::Uuid = body["id"].as_str().unwrap().parse().unwrap();

    // Move the first job to running; the next submission hits the cap.
    ctx.db
        .claim_job(first, "w1", Utc::now())
        .await
        .expect("failed to claim")
        .expect("claim should succeed");
    assert_eq!(
        ctx.db.count_running(consumer.id).await.expect("count"),
        1
    );

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &auth,
        Some(json!({"command": "sleep 2"})),
    )
    .await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert!(body["error"].as_str().unwrap().contains("concurrent"));

    // After the running job finishes, the next submission succeeds.
    ctx.db
        .finish_job(first, JobStatus::Succeeded, Some(0), None, Utc::now())
        .await
        .expect("failed to finish");

    let (status, _) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &auth,
        Some(json!({"command": "sleep 2"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn list_jobs_is_newest_first_and_clamped() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 10, 100).await;
    let auth = [("X-Consumer-Key", token.as_str())];

    for i in 0..3 {
        let (status, _) = send(
            &ctx.app,
            "POST",
            "/v1/jobs",
            &auth,
            Some(json!({"command": format!("echo {i}")})),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
    }

    let (status, body) = send(&ctx.app, "GET", "/v1/jobs", &auth, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 20);
    assert_eq!(body["offset"], 0);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 3);

    // Out-of-range paging parameters are clamped, not rejected.
    let (status, body) = send(&ctx.app, "GET", "/v1/jobs?limit=1000&offset=0", &auth, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 200);

    let (status, body) = send(&ctx.app, "GET", "/v1/jobs?limit=0", &auth, None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["limit"], 1);
    assert_eq!(body["jobs"].as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn jobs_are_scoped_to_their_owner() {
    let ctx = context().await;
    let (_, alice) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    let (_, mallory) = provision(ctx.db.as_ref(), "mallory", 1, 10).await;

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &[("X-Consumer-Key", alice.as_str())],
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id = body["id"].as_str().unwrap().to_string();

    let (status, _) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{id}"),
        &[("X-Consumer-Key", alice.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);

    // Another consumer sees a 404, as does an unknown id.
    let (status, _) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{id}"),
        &[("X-Consumer-Key", mallory.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{}", uuid::Uuid::new_v4()),
        &[("X-Consumer-Key", alice.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{id}/logs"),
        &[("X-Consumer-Key", mallory.as_str())],
        None,
    )
    .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn logs_page_by_sequence() {
    let ctx = context().await;
    let (_, token) = provision(ctx.db.as_ref(), "alice", 1, 10).await;
    let auth = [("X-Consumer-Key", token.as_str())];

    let (status, body) = send(
        &ctx.app,
        "POST",
        "/v1/jobs",
        &auth,
        Some(json!({"command": "echo hi"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let id: uuid::Uuid = body["id"].as_str().unwrap().parse().unwrap();

    let chunks: Vec<NewLogChunk> = ["one\n", "two\n", "three\n"]
        .into_iter()
        .map(|text| NewLogChunk {
            ts: Utc::now(),
            stream: LogStream::Stdout,
            text: text.to_string(),
        })
        .collect();
    ctx.db
        .append_log_chunks(id, &chunks)
        .await
        .expect("failed to append");

    let (status, body) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{id}/logs?offset_seq=1&limit=1"),
        &auth,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["next_offset_seq"], 2);
    let page = body["chunks"].as_array().unwrap();
    assert_eq!(page.len(), 1);
    assert_eq!(page[0]["seq"], 1);
    assert_eq!(page[0]["text"], "two\n");
    assert!(page[0]["ts"].as_str().unwrap().ends_with('Z'));

    // Reading past the end returns the input offset unchanged.
    let (status, body) = send(
        &ctx.app,
        "GET",
        &format!("/v1/jobs/{id}/logs?offset_seq=50"),
        &auth,
        None,
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["next_offset_seq"], 50);
    assert!(body["chunks"].as_array().unwrap().is_empty());
}
