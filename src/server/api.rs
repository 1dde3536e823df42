//! API state and authentication helpers.

use std::sync::Arc;

use axum::http::HeaderMap;

use crate::auth;
use crate::config::ServerConfig;
use crate::db::Consumer;
use crate::db::Database;

pub mod error;
pub mod v1;

use error::Error;

/// Header carrying the consumer token (`<key_id>.<secret>`).
pub const CONSUMER_KEY_HEADER: &str = "x-consumer-key";

/// Header carrying the shared worker bearer token.
pub const WORKER_TOKEN_HEADER: &str = "x-worker-token";

/// Header carrying the worker's self-reported identifier.
pub const WORKER_ID_HEADER: &str = "x-worker-id";

/// Worker identifier used when the header is absent.
const DEFAULT_WORKER_ID: &str = "worker";

/// Application state shared by all handlers.
#[derive(Clone)]
pub struct AppState {
    /// The job store.
    db: Arc<dyn Database>,
    /// Coordinator settings (worker token, sandbox policy, log caps).
    settings: Arc<ServerConfig>,
}

impl AppState {
    /// Create new application state.
    pub fn new(db: Arc<dyn Database>, settings: Arc<ServerConfig>) -> Self {
        Self { db, settings }
    }

    /// Gets the job store.
    pub fn db(&self) -> &Arc<dyn Database> {
        &self.db
    }

    /// Gets the coordinator settings.
    pub fn settings(&self) -> &ServerConfig {
        &self.settings
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState").finish_non_exhaustive()
    }
}

/// Authenticate a consumer from request headers.
///
/// Looks the consumer up by the public key id, verifies the full token
/// against the stored salted digest in constant time, and rejects inactive
/// consumers.
pub(crate) async fn authenticate_consumer(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<Consumer, Error> {
    let token = headers
        .get(CONSUMER_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| Error::Unauthorized(String::from("missing X-Consumer-Key header")))?;

    let consumer = state
        .db
        .get_consumer_by_key_id(auth::key_id_of(token))
        .await?
        .ok_or_else(|| Error::Unauthorized(String::from("invalid consumer key")))?;

    if !auth::verify_token(token, &consumer.key_salt, &consumer.key_digest) {
        return Err(Error::Unauthorized(String::from("invalid consumer key")));
    }

    if !consumer.active {
        return Err(Error::ConsumerDisabled);
    }

    Ok(consumer)
}

/// Authenticate a worker from request headers.
///
/// A missing server-side token is a deployment error and reported as 503;
/// a mismatched client token is 401.
pub(crate) fn require_worker(state: &AppState, headers: &HeaderMap) -> Result<(), Error> {
    let expected = state
        .settings
        .worker_token
        .as_deref()
        .filter(|token| !token.is_empty())
        .ok_or(Error::WorkerTokenUnset)?;

    match headers
        .get(WORKER_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
    {
        Some(token) if token == expected => Ok(()),
        _ => Err(Error::Unauthorized(String::from("invalid worker token"))),
    }
}

/// The worker identifier from request headers, defaulted when absent.
pub(crate) fn worker_id(headers: &HeaderMap) -> String {
    headers
        .get(WORKER_ID_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|id| !id.is_empty())
        .unwrap_or(DEFAULT_WORKER_ID)
        .to_string()
}
