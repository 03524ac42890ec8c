// HTTP ingest adapters and live read endpoints.
//
// Adapters translate authenticated requests into queue items. 202 means the
// points are safely queued; 201 means the queue was unavailable and the
// points were written directly; 503 means both paths failed.

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json},
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::auth::TrackingClaims;
use crate::flight_separator::TrackerPoint;
use crate::flights::{FixSummary, Flight, FlightSource};
use crate::point_processor::write_points_direct;
use crate::points::{coordinates_valid, IncomingPoint, TrackPoint};
use crate::queue::{QueueError, QueueItem, QueueName};
use crate::races::Race;
use crate::web::AppState;

use super::json_error;

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct LiveTrackingRequest {
    pub flight_id: String,
    pub track_points: Vec<IncomingPoint>,
    #[serde(default)]
    pub device_id: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct FlymasterUploadRequest {
    pub device_id: String,
    pub track_points: Vec<IncomingPoint>,
}

/// Parse and shape-check an incoming payload. Shape errors are rejected at
/// the edge and never enqueued.
fn parse_points(
    flight_id: &str,
    flight_uuid: Uuid,
    raw: &[IncomingPoint],
) -> Result<Vec<TrackPoint>, String> {
    if raw.is_empty() {
        return Err("track_points must not be empty".into());
    }

    let mut points = Vec::with_capacity(raw.len());
    for p in raw {
        if !coordinates_valid(p.lat, p.lon) {
            return Err(format!("invalid coordinates: {}, {}", p.lat, p.lon));
        }
        let Some(datetime) = p.parse_datetime() else {
            return Err(format!("unparseable datetime: {}", p.datetime));
        };
        points.push(TrackPoint {
            flight_id: flight_id.to_string(),
            flight_uuid,
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            datetime,
        });
    }
    Ok(points)
}

/// Find the mobile producer's flight or create it. Mobile flight ids are
/// opaque and never go through the separator.
async fn get_or_create_mobile_flight(
    state: &AppState,
    claims: &TrackingClaims,
    race: &Race,
    flight_id: &str,
    device_id: Option<&str>,
    source: FlightSource,
    points: &[IncomingPoint],
) -> Result<Flight, (StatusCode, String)> {
    match state.flights_repo.get_by_flight_id(flight_id).await {
        Ok(Some(flight)) => {
            if flight.pilot_id != claims.pilot_id {
                return Err((
                    StatusCode::FORBIDDEN,
                    "Not authorized to update this flight".into(),
                ));
            }
            Ok(flight)
        }
        Ok(None) => {
            let first = points
                .iter()
                .filter_map(|p| p.parse_datetime().map(|dt| (p, dt)))
                .min_by_key(|(_, dt)| *dt);
            let fix = first.map(|(p, dt)| FixSummary {
                lat: p.lat,
                lon: p.lon,
                elevation: p.elevation,
                datetime: dt,
            });

            let flight = Flight {
                id: Uuid::new_v4(),
                flight_id: flight_id.to_string(),
                race_uuid: race.id,
                race_id: race.race_id.clone(),
                pilot_id: claims.pilot_id.clone(),
                pilot_name: claims.pilot_name.clone(),
                source,
                device_id: device_id.map(str::to_string),
                first_fix: fix.clone(),
                last_fix: fix,
                total_points: 0,
                flight_state: None,
                created_at: Utc::now(),
            };
            state.flights_repo.insert(&flight).await.map_err(|e| {
                error!(error = %e, "Failed to create flight");
                (StatusCode::INTERNAL_SERVER_ERROR, "Failed to create flight record".into())
            })?;
            Ok(flight)
        }
        Err(e) => {
            error!(error = %e, "Flight lookup failed");
            Err((
                StatusCode::INTERNAL_SERVER_ERROR,
                "Failed to load flight record".into(),
            ))
        }
    }
}

/// Enqueue with the direct-write fallback. Returns the response status and
/// whether the fallback was used.
async fn enqueue_or_fallback(
    state: &AppState,
    queue: QueueName,
    flight_uuid: Uuid,
    item: QueueItem,
) -> Result<(StatusCode, bool), (StatusCode, String)> {
    match state.queue.enqueue(queue, &item).await {
        Ok(()) => Ok((StatusCode::ACCEPTED, false)),
        Err(QueueError::Unavailable(e)) => {
            warn!(error = %e, queue = %queue, "Queue unavailable, falling back to direct write");
            match write_points_direct(
                &state.points_repo,
                &state.flights_repo,
                queue,
                flight_uuid,
                &item,
            )
            .await
            {
                Ok(_) => {
                    metrics::counter!("ingest.fallback_direct_total").increment(1);
                    Ok((StatusCode::CREATED, true))
                }
                Err(e2) => {
                    error!(error = %e2, "Direct-write fallback failed");
                    Err((
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Queue and direct write both unavailable".into(),
                    ))
                }
            }
        }
        Err(e) => {
            error!(error = %e, "Enqueue failed");
            Err((
                StatusCode::SERVICE_UNAVAILABLE,
                "Failed to queue tracking data".into(),
            ))
        }
    }
}

async fn verify_and_race(
    state: &AppState,
    token: &str,
) -> Result<(TrackingClaims, Race), (StatusCode, String)> {
    // The race id lives inside the token subject; verify against itself
    let claims = state
        .verifier
        .peek(token)
        .map_err(|e| (StatusCode::UNAUTHORIZED, e.to_string()))?;
    let Some(new_race) = claims.new_race() else {
        return Err((StatusCode::UNAUTHORIZED, "token subject is not a contest".into()));
    };
    let race = state.races_repo.get_or_create(&new_race).await.map_err(|e| {
        error!(error = %e, "Race upsert failed");
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            "Failed to create race record".into(),
        )
    })?;
    Ok((claims, race))
}

/// POST /tracking/live
pub async fn live_tracking(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    Json(payload): Json<LiveTrackingRequest>,
) -> impl IntoResponse {
    ingest_mobile(
        state,
        query.token,
        payload.flight_id,
        payload.device_id,
        payload.track_points,
        FlightSource::Live,
        QueueName::LivePoints,
    )
    .await
}

/// POST /tracking/upload
pub async fn upload_track(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    Json(payload): Json<LiveTrackingRequest>,
) -> impl IntoResponse {
    ingest_mobile(
        state,
        query.token,
        payload.flight_id,
        payload.device_id,
        payload.track_points,
        FlightSource::Upload,
        QueueName::UploadPoints,
    )
    .await
}

async fn ingest_mobile(
    state: AppState,
    token: String,
    flight_id: String,
    device_id: Option<String>,
    raw_points: Vec<IncomingPoint>,
    source: FlightSource,
    queue: QueueName,
) -> axum::response::Response {
    let (claims, race) = match verify_and_race(&state, &token).await {
        Ok(pair) => pair,
        Err((status, msg)) => return json_error(status, &msg).into_response(),
    };

    let flight = match get_or_create_mobile_flight(
        &state,
        &claims,
        &race,
        &flight_id,
        device_id.as_deref(),
        source,
        &raw_points,
    )
    .await
    {
        Ok(flight) => flight,
        Err((status, msg)) => return json_error(status, &msg).into_response(),
    };

    let points = match parse_points(&flight_id, flight.id, &raw_points) {
        Ok(points) => points,
        Err(msg) => return json_error(StatusCode::UNPROCESSABLE_ENTITY, &msg).into_response(),
    };

    let count = points.len();
    let item = QueueItem::new(queue, flight_id.clone(), points);
    match enqueue_or_fallback(&state, queue, flight.id, item).await {
        Ok((status, fallback)) => {
            // Keep the pilot name fresh; it may change between sessions
            if flight.pilot_name != claims.pilot_name {
                let _ = state
                    .flights_repo
                    .update_pilot_name(flight.id, &claims.pilot_name)
                    .await;
            }
            info!(flight_id, count, queued = !fallback, "Accepted tracking points");
            (
                status,
                Json(json!({
                    "success": true,
                    "flight_id": flight_id,
                    "pilot_name": claims.pilot_name,
                    "queued": !fallback,
                    "count": count,
                })),
            )
                .into_response()
        }
        Err((status, msg)) => json_error(status, &msg).into_response(),
    }
}

/// POST /tracking/flymaster/upload - bulk device batch; flights are resolved
/// through the separator since the device streams across days.
pub async fn flymaster_upload(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
    Json(payload): Json<FlymasterUploadRequest>,
) -> impl IntoResponse {
    let (claims, race) = match verify_and_race(&state, &query.token).await {
        Ok(pair) => pair,
        Err((status, msg)) => return json_error(status, &msg).into_response(),
    };

    let mut parsed: Vec<(IncomingPoint, DateTime<Utc>)> = Vec::with_capacity(payload.track_points.len());
    for p in payload.track_points {
        if !coordinates_valid(p.lat, p.lon) {
            return json_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                &format!("invalid coordinates: {}, {}", p.lat, p.lon),
            )
            .into_response();
        }
        let Some(dt) = p.parse_datetime() else {
            return json_error(
                StatusCode::UNPROCESSABLE_ENTITY,
                &format!("unparseable datetime: {}", p.datetime),
            )
            .into_response();
        };
        parsed.push((p, dt));
    }
    if parsed.is_empty() {
        return json_error(StatusCode::UNPROCESSABLE_ENTITY, "track_points must not be empty")
            .into_response();
    }
    parsed.sort_by_key(|(_, dt)| *dt);

    // Resolve each point to its flight; a bulk upload may span separations
    let mut batches: Vec<(Uuid, String, Vec<TrackPoint>)> = Vec::new();
    for (p, dt) in parsed {
        let tracker_point = TrackerPoint {
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            timestamp: dt,
            speed_kmh: None,
        };
        let resolved = match state
            .separator
            .resolve(
                FlightSource::FlymasterLive,
                &claims.pilot_id,
                &claims.pilot_name,
                &race,
                &payload.device_id,
                &tracker_point,
            )
            .await
        {
            Ok(resolved) => resolved,
            Err(e) => {
                error!(error = %e, "Flight resolution failed");
                return json_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Failed to resolve flight for device",
                )
                .into_response();
            }
        };

        let point = TrackPoint {
            flight_id: resolved.flight_id.clone(),
            flight_uuid: resolved.flight_uuid,
            lat: p.lat,
            lon: p.lon,
            elevation: p.elevation,
            datetime: dt,
        };
        match batches.last_mut() {
            Some((uuid, _, points)) if *uuid == resolved.flight_uuid => points.push(point),
            _ => batches.push((resolved.flight_uuid, resolved.flight_id, vec![point])),
        }
    }

    let items: Vec<(Uuid, QueueItem)> = batches
        .into_iter()
        .map(|(uuid, flight_id, points)| {
            (uuid, QueueItem::new(QueueName::FlymasterPoints, flight_id, points))
        })
        .collect();

    let queue_items: Vec<QueueItem> = items.iter().map(|(_, item)| item.clone()).collect();
    match state
        .queue
        .enqueue_batch(QueueName::FlymasterPoints, &queue_items)
        .await
    {
        Ok(queued) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "success": true,
                "device_id": payload.device_id,
                "batches_queued": queued,
            })),
        )
            .into_response(),
        Err(QueueError::Unavailable(e)) => {
            warn!(error = %e, "Queue unavailable, writing flymaster batch directly");
            for (uuid, item) in &items {
                if let Err(e2) = write_points_direct(
                    &state.points_repo,
                    &state.flights_repo,
                    QueueName::FlymasterPoints,
                    *uuid,
                    item,
                )
                .await
                {
                    error!(error = %e2, "Direct-write fallback failed");
                    return json_error(
                        StatusCode::SERVICE_UNAVAILABLE,
                        "Queue and direct write both unavailable",
                    )
                    .into_response();
                }
            }
            (
                StatusCode::CREATED,
                Json(json!({
                    "success": true,
                    "device_id": payload.device_id,
                    "queued": false,
                })),
            )
                .into_response()
        }
        Err(e) => {
            error!(error = %e, "Flymaster enqueue failed");
            json_error(StatusCode::SERVICE_UNAVAILABLE, "Failed to queue device batch")
                .into_response()
        }
    }
}

/// GET /tracking/live/summary - aggregate race activity, capped at 100
/// pilots. Served from the read pool; must answer in under a second.
pub async fn live_summary(
    State(state): State<AppState>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let claims = match state.verifier.peek(&query.token) {
        Ok(claims) => claims,
        Err(e) => return json_error(StatusCode::UNAUTHORIZED, &e.to_string()).into_response(),
    };
    let Some(race_id) = claims.race_id().map(str::to_string) else {
        return json_error(StatusCode::UNAUTHORIZED, "token subject is not a contest")
            .into_response();
    };

    let summary = state.flights_repo_read.race_summary(&race_id).await;
    let pilots = state.flights_repo_read.pilot_activity(&race_id, 100).await;

    match (summary, pilots) {
        (Ok(summary), Ok(pilots)) => Json(json!({
            "summary": {
                "total_flights": summary.total_flights,
                "total_pilots": summary.total_pilots,
                "time_range": {
                    "start": summary.earliest_activity,
                    "end": summary.latest_activity,
                },
                "earliest_activity": summary.earliest_activity,
                "latest_activity": summary.latest_activity,
            },
            "pilots": pilots,
        }))
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            error!(error = %e, "Summary query failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load summary")
                .into_response()
        }
    }
}

/// GET /tracking/live/pilot/{pilot_id}/flights - up to 20 most recent.
pub async fn pilot_flights(
    State(state): State<AppState>,
    Path(pilot_id): Path<String>,
    Query(query): Query<TokenQuery>,
) -> impl IntoResponse {
    let claims = match state.verifier.peek(&query.token) {
        Ok(claims) => claims,
        Err(e) => return json_error(StatusCode::UNAUTHORIZED, &e.to_string()).into_response(),
    };
    let Some(race_id) = claims.race_id().map(str::to_string) else {
        return json_error(StatusCode::UNAUTHORIZED, "token subject is not a contest")
            .into_response();
    };

    match state
        .flights_repo_read
        .flights_for_pilot(&race_id, &pilot_id, 20)
        .await
    {
        Ok(rows) => {
            let flights: Vec<serde_json::Value> = rows
                .into_iter()
                .map(|row| {
                    let duration_seconds = match (&row.first_fix, &row.last_fix) {
                        (Some(first), Some(last)) => {
                            Some((last.datetime - first.datetime).num_seconds())
                        }
                        _ => None,
                    };
                    json!({
                        "uuid": row.id,
                        "flight_id": row.flight_id,
                        "source": row.source,
                        "first_fix": row.first_fix,
                        "last_fix": row.last_fix,
                        "total_points": row.total_points,
                        "created_at": row.created_at,
                        "duration_seconds": duration_seconds,
                    })
                })
                .collect();
            Json(json!({ "pilot_id": pilot_id, "flights": flights })).into_response()
        }
        Err(e) => {
            error!(error = %e, "Pilot flights query failed");
            json_error(StatusCode::INTERNAL_SERVER_ERROR, "Failed to load flights")
                .into_response()
        }
    }
}
