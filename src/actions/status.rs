// Health and queue introspection endpoints.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Json},
};
use serde_json::json;
use tracing::warn;

use crate::web::AppState;

/// Pending items above this mark a queue as backed up.
const PENDING_DEGRADED_THRESHOLD: u64 = 1_000;

/// GET /health - store, KV store, and queue backlog in one view.
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let store_ok = sqlx::query("SELECT 1")
        .execute(&state.pools.primary)
        .await
        .is_ok();
    let replica_ok = sqlx::query("SELECT 1")
        .execute(&state.pools.read)
        .await
        .is_ok();
    let redis_ok = state.queue.ping().await;

    let queues = if redis_ok {
        state.queue.snapshot().await.ok()
    } else {
        None
    };

    let backlog_ok = queues
        .as_ref()
        .map(|qs| {
            qs.iter()
                .all(|q| q.pending <= PENDING_DEGRADED_THRESHOLD && q.dlq_size == 0)
        })
        .unwrap_or(false);

    let status = if store_ok && redis_ok && backlog_ok {
        "healthy"
    } else if store_ok && redis_ok {
        "degraded"
    } else {
        "unhealthy"
    };

    if status != "healthy" {
        warn!(store_ok, replica_ok, redis_ok, backlog_ok, "Health check not clean");
    }

    let code = if store_ok && redis_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        code,
        Json(json!({
            "status": status,
            "store": { "primary": store_ok, "replica": replica_ok },
            "kv_store": redis_ok,
            "queues": queues,
        })),
    )
}

/// GET /queue/status
pub async fn queue_status(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.snapshot().await {
        Ok(snapshot) => {
            let writer = state.writer_stats.snapshot().await;
            Json(json!({
                "queues": snapshot,
                "writer": writer,
                "fanout": state.hub_manager.stats().await,
            }))
            .into_response()
        }
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({ "errors": e.to_string() })),
        )
            .into_response(),
    }
}
