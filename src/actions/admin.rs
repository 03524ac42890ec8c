// Admin surface: asynchronous deletions and DLQ tooling.
//
// Deletions return 202 immediately and complete in a named background task;
// progress is polled through the deletion registry. DLQ items are only ever
// re-enqueued from here, never automatically.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{error, info};
use uuid::Uuid;

use crate::flights::FlightSource;
use crate::queue::QueueName;
use crate::web::AppState;

use super::json_error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DeletionState {
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct DeletionJob {
    pub deletion_id: Uuid,
    pub status: DeletionState,
    pub target: String,
    pub deleted_flights: u64,
    pub deleted_points: u64,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// In-process registry of deletion jobs, polled via the status endpoint.
#[derive(Clone, Default)]
pub struct DeletionRegistry {
    jobs: Arc<RwLock<HashMap<Uuid, DeletionJob>>>,
}

impl DeletionRegistry {
    pub async fn start(&self, target: String) -> Uuid {
        let deletion_id = Uuid::new_v4();
        let job = DeletionJob {
            deletion_id,
            status: DeletionState::Running,
            target,
            deleted_flights: 0,
            deleted_points: 0,
            started_at: Utc::now(),
            finished_at: None,
            error: None,
        };
        self.jobs.write().await.insert(deletion_id, job);
        deletion_id
    }

    pub async fn complete(&self, id: Uuid, flights: u64, points: u64) {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.status = DeletionState::Completed;
            job.deleted_flights = flights;
            job.deleted_points = points;
            job.finished_at = Some(Utc::now());
        }
    }

    pub async fn fail(&self, id: Uuid, error: String) {
        if let Some(job) = self.jobs.write().await.get_mut(&id) {
            job.status = DeletionState::Failed;
            job.error = Some(error);
            job.finished_at = Some(Utc::now());
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<DeletionJob> {
        self.jobs.read().await.get(&id).cloned()
    }
}

/// Delete flights (and their cascading points) after waiting for the writer
/// pool to drain any in-flight batches for the same flight ids.
async fn delete_flights_draining(
    state: &AppState,
    flight_uuids: Vec<Uuid>,
    flight_ids: Vec<String>,
) -> anyhow::Result<(u64, u64)> {
    // Wait (bounded) until no writer batch touches the victim flights
    for _ in 0..30 {
        if !state.writer_stats.is_writing_any(&flight_ids).await {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_secs(1)).await;
    }

    let mut points = 0;
    points += state
        .points_repo
        .delete_for_flights(QueueName::LivePoints, &flight_uuids)
        .await?;
    points += state
        .points_repo
        .delete_for_flights(QueueName::UploadPoints, &flight_uuids)
        .await?;
    let flights = state.flights_repo.delete_by_uuids(&flight_uuids).await?;
    Ok((flights, points))
}

/// DELETE /tracking/admin/delete-pilot-flights-async/{pilot_id}
pub async fn delete_pilot_flights_async(
    State(state): State<AppState>,
    Path(pilot_id): Path<String>,
) -> impl IntoResponse {
    let flight_uuids = match state.flights_repo.flights_for_pilot_deletion(&pilot_id).await {
        Ok(ids) => ids,
        Err(e) => {
            error!(error = %e, "Failed to enumerate pilot flights");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to enumerate flights")
                .into_response();
        }
    };

    let deletion_id = state
        .deletions
        .start(format!("pilot:{}", pilot_id))
        .await;

    let task_state = state.clone();
    tokio::spawn(async move {
        // flight_id strings are needed for the drain barrier
        let mut flight_ids = Vec::with_capacity(flight_uuids.len());
        for uuid in &flight_uuids {
            if let Ok(Some(flight)) = task_state.flights_repo.get_by_uuid(*uuid).await {
                flight_ids.push(flight.flight_id);
            }
        }

        match delete_flights_draining(&task_state, flight_uuids, flight_ids).await {
            Ok((flights, points)) => {
                info!(deletion_id = %deletion_id, flights, points, "Pilot deletion finished");
                task_state.deletions.complete(deletion_id, flights, points).await;
            }
            Err(e) => {
                error!(deletion_id = %deletion_id, error = %e, "Pilot deletion failed");
                task_state.deletions.fail(deletion_id, e.to_string()).await;
            }
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "deletion_id": deletion_id,
            "status_url": format!("/tracking/deletion-status/{}", deletion_id),
        })),
    )
        .into_response()
}

#[derive(Debug, Deserialize)]
pub struct DeleteTrackQuery {
    #[serde(default)]
    pub source: Option<FlightSource>,
}

/// DELETE /tracking/tracks/fuuid-async/{flight_uuid}?source=...
pub async fn delete_track_async(
    State(state): State<AppState>,
    Path(flight_uuid): Path<Uuid>,
    Query(query): Query<DeleteTrackQuery>,
) -> impl IntoResponse {
    let flight = match state.flights_repo.get_by_uuid(flight_uuid).await {
        Ok(Some(flight)) => flight,
        Ok(None) => return json_error(StatusCode::NOT_FOUND, "Flight not found").into_response(),
        Err(e) => {
            error!(error = %e, "Flight lookup failed");
            return json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load flight")
                .into_response();
        }
    };

    if let Some(source) = query.source {
        if flight.source != source {
            return json_error(StatusCode::CONFLICT, "Flight source does not match").into_response();
        }
    }

    let deletion_id = state
        .deletions
        .start(format!("flight:{}", flight.flight_id))
        .await;

    let task_state = state.clone();
    tokio::spawn(async move {
        match delete_flights_draining(
            &task_state,
            vec![flight.id],
            vec![flight.flight_id.clone()],
        )
        .await
        {
            Ok((flights, points)) => {
                task_state.deletions.complete(deletion_id, flights, points).await;
            }
            Err(e) => {
                task_state.deletions.fail(deletion_id, e.to_string()).await;
            }
        }
    });

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({
            "deletion_id": deletion_id,
            "status_url": format!("/tracking/deletion-status/{}", deletion_id),
        })),
    )
        .into_response()
}

/// GET /tracking/deletion-status/{deletion_id}
pub async fn deletion_status(
    State(state): State<AppState>,
    Path(deletion_id): Path<Uuid>,
) -> impl IntoResponse {
    match state.deletions.get(deletion_id).await {
        Some(job) => Json(job).into_response(),
        None => json_error(StatusCode::NOT_FOUND, "Unknown deletion id").into_response(),
    }
}

/// GET /admin/queue/stats
pub async fn queue_stats(State(state): State<AppState>) -> impl IntoResponse {
    match state.queue.snapshot().await {
        Ok(snapshot) => {
            let writer = state.writer_stats.snapshot().await;
            Json(serde_json::json!({
                "queues": snapshot,
                "writer": writer,
            }))
            .into_response()
        }
        Err(e) => {
            error!(error = %e, "Queue snapshot failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue backend unavailable")
                .into_response()
        }
    }
}

/// GET /admin/queue/{name}/dlq - peek at dead-lettered items.
pub async fn dlq_peek(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Ok(queue) = name.parse::<QueueName>() else {
        return json_error(StatusCode::NOT_FOUND, "Unknown queue").into_response();
    };
    match state.queue.dlq_peek(queue, 50).await {
        Ok(entries) => Json(serde_json::json!({
            "queue": queue.as_str(),
            "entries": entries,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "DLQ peek failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue backend unavailable")
                .into_response()
        }
    }
}

/// POST /admin/queue/{name}/requeue-dlq - the only path that re-enqueues
/// dead-lettered items.
pub async fn dlq_requeue(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Ok(queue) = name.parse::<QueueName>() else {
        return json_error(StatusCode::NOT_FOUND, "Unknown queue").into_response();
    };
    match state.queue.dlq_requeue(queue).await {
        Ok(requeued) => Json(serde_json::json!({
            "queue": queue.as_str(),
            "requeued": requeued,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "DLQ requeue failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue backend unavailable")
                .into_response()
        }
    }
}

/// DELETE /admin/queue/{name}/dlq
pub async fn dlq_clear(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> impl IntoResponse {
    let Ok(queue) = name.parse::<QueueName>() else {
        return json_error(StatusCode::NOT_FOUND, "Unknown queue").into_response();
    };
    match state.queue.dlq_clear(queue).await {
        Ok(cleared) => Json(serde_json::json!({
            "queue": queue.as_str(),
            "cleared": cleared,
        }))
        .into_response(),
        Err(e) => {
            error!(error = %e, "DLQ clear failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Queue backend unavailable")
                .into_response()
        }
    }
}
