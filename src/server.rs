//! The coordinator: HTTP + WebSocket surface over the job store.

use std::sync::Arc;

use axum::Router;
use tower_http::trace::TraceLayer;

use crate::config::Config;
use crate::db::SqliteDatabase;

pub mod api;

pub use api::AppState;

/// Create the application router.
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .nest("/v1", api::v1::create_router(state))
        .layer(TraceLayer::new_for_http())
}

/// Run the coordinator.
///
/// Opens (and migrates) the database, then serves the API until the process
/// is stopped.
pub async fn run(config: Config) -> anyhow::Result<()> {
    let db = SqliteDatabase::new(&config.database.url).await?;

    let state = AppState::new(Arc::new(db), Arc::new(config.server.clone()));
    let app = create_router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    tracing::info!("coordinator listening on `{}`", addr);

    axum::serve(listener, app).await?;

    Ok(())
}
