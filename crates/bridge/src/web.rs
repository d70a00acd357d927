//! HTTP observability endpoint
//!
//! `GET /` returns the command line the process was started with,
//! `GET /stats.json` the current stats document. Plain HTTP, no
//! authentication; meant for internal monitoring only.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio_util::sync::CancellationToken;

/// What the endpoint serves; implemented by each binary.
pub trait StatsSource: Send + Sync + 'static {
    /// The command line, served at `/`.
    fn index(&self) -> String;
    /// The stats document, served at `/stats.json`.
    fn stats_json(&self) -> serde_json::Value;
}

pub fn router(source: Arc<dyn StatsSource>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/stats.json", get(stats_json))
        .fallback(|| async { (StatusCode::NOT_FOUND, "Could not understand request.\r\n") })
        .with_state(source)
}

async fn index(State(source): State<Arc<dyn StatsSource>>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "text/plain"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        source.index(),
    )
}

async fn stats_json(State(source): State<Arc<dyn StatsSource>>) -> impl IntoResponse {
    (
        [
            (header::CONTENT_TYPE, "application/json; charset=utf-8"),
            (header::CACHE_CONTROL, "no-cache"),
        ],
        source.stats_json().to_string(),
    )
}

/// Serve until cancelled.
pub async fn serve(
    address: SocketAddr,
    source: Arc<dyn StatsSource>,
    cancel: CancellationToken,
) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(address).await?;
    tracing::info!(address = %address, "webserver listening");
    axum::serve(listener, router(source))
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
}
