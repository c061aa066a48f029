//! HTTP surface: worker health and Prometheus metrics
//!
//! | Route | Response |
//! |-------|----------|
//! | `GET /health` | shard identity, queue length, eligible route count |
//! | `GET /metrics` | Prometheus text exposition |

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::notifications::NotificationQueue;
use crate::proxy::ProxyPool;
use crate::scheduler::Worker;
use crate::shard::ShardPartitioner;

// ============================================================================
// App State
// ============================================================================

/// Shared handler state
#[derive(Clone)]
pub struct AppState {
    pub partitioner: Arc<ShardPartitioner>,
    pub proxies: Arc<ProxyPool>,
    pub queue: Arc<NotificationQueue>,
    pub start_time: Instant,
}

impl AppState {
    pub fn from_worker(worker: &Worker) -> Self {
        Self {
            partitioner: Arc::clone(&worker.partitioner),
            proxies: Arc::clone(&worker.proxies),
            queue: Arc::clone(&worker.queue),
            start_time: Instant::now(),
        }
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub uptime_secs: u64,
    pub instance_id: String,
    pub rank: u32,
    pub total_shards: u32,
    pub queue_length: usize,
    pub eligible_routes: usize,
}

// ============================================================================
// Router
// ============================================================================

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Bind and serve until `shutdown` resolves
pub async fn serve<F>(bind_address: &str, state: AppState, shutdown: F) -> anyhow::Result<()>
where
    F: std::future::Future<Output = ()> + Send + 'static,
{
    let listener = tokio::net::TcpListener::bind(bind_address)
        .await
        .with_context(|| format!("Failed to bind to {bind_address}"))?;

    tracing::info!(address = %bind_address, "HTTP server listening");

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("Server error")
}

// ============================================================================
// Handlers
// ============================================================================

async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let eligible_routes = state.proxies.eligible_count().await;
    let queue_length = state.queue.len().await;

    Json(HealthResponse {
        status: "healthy".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
        uptime_secs: state.start_time.elapsed().as_secs(),
        instance_id: state.partitioner.instance_id().to_string(),
        rank: state.partitioner.rank(),
        total_shards: state.partitioner.total_shards(),
        queue_length,
        eligible_routes,
    })
}

async fn metrics() -> impl IntoResponse {
    match crate::metrics::encode_metrics() {
        Ok(body) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to encode metrics");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{NotificationConfig, ProxyConfig};
    use crate::notifications::{LogChannel, NotificationLimiter};
    use crate::proxy::StaticSource;
    use crate::shard::InMemoryShardRegistry;
    use std::time::Duration;

    async fn test_state() -> AppState {
        let partitioner = Arc::new(ShardPartitioner::new(
            "worker-a".to_string(),
            Arc::new(InMemoryShardRegistry::new()),
            Duration::from_secs(30),
            Duration::from_secs(120),
        ));
        partitioner.initialize(Some(0), Some(2)).await.unwrap();

        let proxies = Arc::new(
            ProxyPool::new(
                &ProxyConfig::default(),
                Box::new(StaticSource("http://u:p@10.0.0.1:8080".to_string())),
            )
            .unwrap(),
        );
        let limiter = Arc::new(NotificationLimiter::from_config(&NotificationConfig::default()));
        let queue = Arc::new(NotificationQueue::new(limiter, Arc::new(LogChannel)));

        AppState {
            partitioner,
            proxies,
            queue,
            start_time: Instant::now(),
        }
    }

    #[tokio::test]
    async fn test_health_reports_shard_and_routes() {
        let Json(health) = health_check(State(test_state().await)).await;
        assert_eq!(health.status, "healthy");
        assert_eq!(health.instance_id, "worker-a");
        assert_eq!(health.rank, 0);
        assert_eq!(health.total_shards, 2);
        assert_eq!(health.queue_length, 0);
        assert_eq!(health.eligible_routes, 1);
    }

    #[tokio::test]
    async fn test_metrics_endpoint_serves_text() {
        let _ = crate::metrics::init_metrics();
        crate::metrics::record_check("unchanged");
        let response = metrics().await.into_response();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(
            response.headers()[header::CONTENT_TYPE],
            "text/plain; version=0.0.4"
        );
    }
}
