//! Typed consumer client for the coordinator's REST surface.

use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use reqwest::header::HeaderMap;
use reqwest::header::HeaderValue;
use serde::de::DeserializeOwned;
use uuid::Uuid;

use crate::server::api::CONSUMER_KEY_HEADER;
use crate::server::api::v1::models::JobBody;
use crate::server::api::v1::models::ListJobsResponse;
use crate::server::api::v1::models::LogsResponse;
use crate::server::api::v1::models::SubmitJobRequest;

/// Per-request timeout for coordinator calls.
const HTTP_TIMEOUT: Duration = Duration::from_secs(30);

/// A consumer-side HTTP client.
#[derive(Debug, Clone)]
pub struct Client {
    /// The underlying HTTP client with the consumer key installed.
    http: reqwest::Client,
    /// Coordinator base URL without a trailing slash.
    base: String,
}

impl Client {
    /// Create a client for the given coordinator and consumer token.
    pub fn new(server: &str, consumer_key: &str) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(
            CONSUMER_KEY_HEADER,
            HeaderValue::from_str(consumer_key)
                .context("consumer key is not a valid header value")?,
        );

        let http = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(HTTP_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;

        Ok(Self {
            http,
            base: server.trim_end_matches('/').to_string(),
        })
    }

    /// Submit a new job.
    pub async fn submit_job(&self, request: &SubmitJobRequest) -> Result<JobBody> {
        let response = self
            .http
            .post(format!("{}/v1/jobs", self.base))
            .json(request)
            .send()
            .await
            .context("submit request failed")?;
        expect_json(response).await
    }

    /// Get one of the caller's jobs.
    pub async fn get_job(&self, id: Uuid) -> Result<JobBody> {
        let response = self
            .http
            .get(format!("{}/v1/jobs/{id}", self.base))
            .send()
            .await
            .context("job request failed")?;
        expect_json(response).await
    }

    /// List the caller's jobs, newest first.
    pub async fn list_jobs(&self, limit: i64, offset: i64) -> Result<ListJobsResponse> {
        let response = self
            .http
            .get(format!("{}/v1/jobs", self.base))
            .query(&[("limit", limit), ("offset", offset)])
            .send()
            .await
            .context("list request failed")?;
        expect_json(response).await
    }

    /// Get a page of a job's logs starting at `offset_seq`.
    pub async fn get_logs(&self, id: Uuid, offset_seq: i64, limit: i64) -> Result<LogsResponse> {
        let response = self
            .http
            .get(format!("{}/v1/jobs/{id}/logs", self.base))
            .query(&[("offset_seq", offset_seq), ("limit", limit)])
            .send()
            .await
            .context("logs request failed")?;
        expect_json(response).await
    }
}

/// Decode a JSON body, converting HTTP errors into readable failures.
async fn expect_json<T: DeserializeOwned>(response: reqwest::Response) -> Result<T> {
    let status = response.status();
    if !status.is_success() {
        let detail = response.text().await.unwrap_or_default();
        if status == reqwest::StatusCode::UNAUTHORIZED {
            bail!(
                "http error {status}: {detail}\nhint: use the admin-generated consumer key \
                 (looks like `kid_….db_…`), not the consumer id"
            );
        }
        bail!("http error {status}: {detail}");
    }

    response.json().await.context("malformed response body")
}
