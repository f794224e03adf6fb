//! Liveness HTTP endpoint.
//!
//! `GET /health` answers as long as the process runs, whatever the state of
//! individual connections. `GET /stats` returns the current counters.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::State;
use axum::{Json, Router, routing::get};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::info;

use crate::error::Result;
use crate::stats::{GatewayStats, StatsSnapshot};

/// Shared state of the health router.
#[derive(Debug, Clone)]
pub struct HealthState {
    started_at: Instant,
    stats: Arc<GatewayStats>,
}

impl HealthState {
    /// Creates router state.
    #[must_use]
    pub fn new(started_at: Instant, stats: Arc<GatewayStats>) -> Self {
        Self { started_at, stats }
    }
}

/// Health check response.
#[derive(Debug, Serialize, Deserialize)]
pub struct HealthResponse {
    /// Service status.
    pub status: String,
    /// Service version.
    pub version: String,
    /// Seconds since the gateway started.
    pub uptime_secs: u64,
}

/// Process health.
pub async fn health(State(state): State<HealthState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.started_at.elapsed().as_secs(),
    })
}

/// Counter snapshot.
pub async fn stats(State(state): State<HealthState>) -> Json<StatsSnapshot> {
    Json(state.stats.snapshot())
}

/// Create health check routes.
pub fn health_routes(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/stats", get(stats))
        .with_state(state)
}

/// Serves the health routes on `listener` until the task is aborted.
///
/// # Errors
///
/// Returns [`crate::Error::Io`] if the server fails.
pub async fn serve_health(listener: TcpListener, state: HealthState) -> Result<()> {
    if let Ok(addr) = listener.local_addr() {
        info!(%addr, "Health endpoint listening");
    }
    axum::serve(listener, health_routes(state)).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::{
        body::Body,
        http::{Request, StatusCode},
    };
    use tower::ServiceExt;

    fn state() -> HealthState {
        HealthState::new(Instant::now(), Arc::new(GatewayStats::new()))
    }

    #[tokio::test]
    async fn test_health_endpoint() {
        let app = health_routes(state());

        let response = app
            .oneshot(
                Request::builder()
                    .uri("/health")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let health: HealthResponse = serde_json::from_slice(&body).unwrap();

        assert_eq!(health.status, "ok");
        assert!(!health.version.is_empty());
        assert_eq!(health.uptime_secs, 0);
    }

    #[tokio::test]
    async fn test_stats_endpoint() {
        let state = state();
        state.stats.record_opened();
        let app = health_routes(state);

        let response = app
            .oneshot(Request::builder().uri("/stats").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let stats: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(stats["opened"], 1);
        assert_eq!(stats["active_connections"], 1);
    }

    #[tokio::test]
    async fn test_unknown_route() {
        let response = health_routes(state())
            .oneshot(Request::builder().uri("/nope").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
