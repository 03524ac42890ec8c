use anyhow::Result;
use axum::{
    routing::{delete, get, post},
    Router,
};
use std::sync::Arc;
use tokio::sync::watch;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::actions;
use crate::auth::TokenVerifier;
use crate::config::Settings;
use crate::db::DbPools;
use crate::flight_separator::FlightSeparator;
use crate::flights_repo::FlightsRepository;
use crate::live::HubManager;
use crate::point_processor::ProcessorStats;
use crate::points_repo::PointsRepository;
use crate::queue::RedisQueue;
use crate::races_repo::RacesRepository;

/// Process-wide runtime handle threaded through every handler. Grouping the
/// singletons here keeps them out of arbitrary scopes.
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub pools: DbPools,
    pub queue: RedisQueue,
    pub races_repo: RacesRepository,
    /// Primary-pool repositories; writers and adapters use these
    pub flights_repo: FlightsRepository,
    pub points_repo: PointsRepository,
    /// Read-pool repository for latency-sensitive read endpoints
    pub flights_repo_read: FlightsRepository,
    pub separator: FlightSeparator,
    pub verifier: TokenVerifier,
    pub hub_manager: HubManager,
    pub writer_stats: Arc<ProcessorStats>,
    pub deletions: actions::DeletionRegistry,
    pub shutdown: watch::Receiver<bool>,
}

pub fn router(state: AppState) -> Router {
    let tracking = Router::new()
        .route("/live", post(actions::live_tracking))
        .route("/upload", post(actions::upload_track))
        .route("/flymaster/upload", post(actions::flymaster_upload))
        .route("/live/summary", get(actions::live_summary))
        .route("/live/pilot/{pilot_id}/flights", get(actions::pilot_flights))
        .route(
            "/admin/delete-pilot-flights-async/{pilot_id}",
            delete(actions::delete_pilot_flights_async),
        )
        .route(
            "/tracks/fuuid-async/{flight_uuid}",
            delete(actions::delete_track_async),
        )
        .route("/deletion-status/{deletion_id}", get(actions::deletion_status))
        .route("/ws/live/{race_id}", get(actions::live_websocket));

    let admin = Router::new()
        .route("/queue/stats", get(actions::queue_stats))
        .route(
            "/queue/{name}/dlq",
            get(actions::dlq_peek).delete(actions::dlq_clear),
        )
        .route("/queue/{name}/requeue-dlq", post(actions::dlq_requeue));

    Router::new()
        .route("/health", get(actions::health))
        .route("/queue/status", get(actions::queue_status))
        .nest("/tracking", tracking)
        .nest("/admin", admin)
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Serve HTTP + WebSocket until shutdown fires. The accept socket closes
/// immediately; in-flight connections get their grace from the caller.
pub async fn serve(
    state: AppState,
    interface: &str,
    port: u16,
    mut shutdown: watch::Receiver<bool>,
) -> Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind((interface, port)).await?;
    info!(interface, port, "Web server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            let _ = shutdown.changed().await;
        })
        .await?;

    info!("Web server stopped");
    Ok(())
}
