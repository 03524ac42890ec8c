// WebSocket endpoint for the live fan-out: /tracking/ws/live/{race_id}.
//
// The socket splits into a write task draining the client's hub buffer and
// a read loop handling the client message catalogue. Clients never see
// backend errors; missed ticks surface as data gaps.

use axum::{
    extract::{
        ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    response::Response,
};
use chrono::Utc;
use futures_util::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::live::hub::{HubClient, RaceHub};
use crate::live::messages::{ClientMessage, ServerMessage};
use crate::live::tiles::tiles_for_bbox;
use crate::web::AppState;

/// Server-initiated ping cadence, and how much silence the server
/// tolerates before presuming the client gone.
const PING_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_IDLE_TIMEOUT: Duration = Duration::from_secs(90);

/// Initial-data priming is capped to a 3x3 tile grid.
const MAX_INITIAL_TILES: usize = 9;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    pub token: String,
    pub client_id: String,
}

pub async fn live_websocket(
    ws: WebSocketUpgrade,
    Path(race_id): Path<String>,
    Query(query): Query<WsQuery>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, race_id, query))
}

async fn handle_socket(socket: WebSocket, state: AppState, race_id: String, query: WsQuery) {
    let claims = match state.verifier.verify(&query.token, &race_id) {
        Ok(claims) => claims,
        Err(e) => {
            debug!(error = %e, "WebSocket token rejected");
            close_with(socket, 1008, "Invalid token").await;
            return;
        }
    };

    let race = match state.races_repo.get(&race_id).await {
        Ok(Some(race)) => race,
        Ok(None) => {
            close_with(socket, 1008, "Race not found").await;
            return;
        }
        Err(e) => {
            warn!(error = %e, "Race lookup failed during WebSocket accept");
            close_with(socket, 1011, "Server error").await;
            return;
        }
    };

    let hub = state.hub_manager.hub_for(&race).await;
    let client = hub.register(&query.client_id, &claims.pilot_id).await;

    // Handshake frames go through the same ordered buffer as everything else
    client
        .buffer
        .push(ServerMessage::race_config(
            &race.race_id,
            &race.name,
            &race.timezone,
            hub.delay_seconds(),
            hub.update_interval_seconds(),
        ))
        .await;
    client
        .buffer
        .push(ServerMessage::ViewerCount {
            count: hub.viewer_count().await,
            timestamp: Utc::now(),
        })
        .await;

    let (mut sink, mut stream) = socket.split();

    // Writer: drains the hub buffer until shutdown or a dead socket
    let writer_client = Arc::clone(&client);
    let mut writer_shutdown = state.shutdown.clone();
    let write_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = writer_client.buffer.pop() => {
                    let Ok(text) = serde_json::to_string(&msg) else { continue };
                    if sink.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = writer_shutdown.changed() => {
                    if *writer_shutdown.borrow() {
                        let _ = sink
                            .send(Message::Close(Some(CloseFrame {
                                code: 1001,
                                reason: "server shutting down".into(),
                            })))
                            .await;
                        break;
                    }
                }
            }
        }
    });

    // Reader: client messages, ping cadence, idle policing
    let mut last_client_activity = Instant::now();
    loop {
        match tokio::time::timeout(PING_INTERVAL, stream.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                last_client_activity = Instant::now();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(msg) => handle_client_message(msg, &hub, &client).await,
                    Err(_) => {
                        client
                            .buffer
                            .push(ServerMessage::Error {
                                message: "Invalid message format".into(),
                            })
                            .await;
                    }
                }
            }
            Ok(Some(Ok(Message::Ping(_) | Message::Pong(_)))) => {
                last_client_activity = Instant::now();
            }
            Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
            Ok(Some(Ok(Message::Binary(_)))) => {
                last_client_activity = Instant::now();
            }
            Ok(Some(Err(_))) => break,
            Err(_) => {
                // No traffic for a ping interval
                if last_client_activity.elapsed() > CLIENT_IDLE_TIMEOUT {
                    info!(client_id = %query.client_id, "WebSocket idle past 90s, dropping");
                    break;
                }
                client
                    .buffer
                    .push(ServerMessage::Heartbeat {
                        timestamp: Utc::now(),
                    })
                    .await;
            }
        }
    }

    write_task.abort();
    hub.unregister(&query.client_id).await;
    state.hub_manager.release_if_empty(&race.race_id).await;
    info!(client_id = %query.client_id, race_id = %race.race_id, "WebSocket client disconnected");
}

async fn handle_client_message(msg: ClientMessage, hub: &Arc<RaceHub>, client: &Arc<HubClient>) {
    match msg {
        ClientMessage::ViewportUpdate { tiles } => {
            let added = client.replace_tiles(tiles).await;
            // Newly visible tiles are served immediately; the catch-up delta
            // bridges the gap until the next tick
            for tile in added {
                hub.send_tile(client, tile).await;
            }
            hub.send_catch_up(client).await;
        }
        ClientMessage::RequestInitialData { zoom, bbox } => {
            let tiles = tiles_for_bbox(bbox, zoom);
            for tile in tiles.into_iter().take(MAX_INITIAL_TILES) {
                hub.send_tile(client, tile).await;
            }
        }
        ClientMessage::Ping { timestamp } => {
            client
                .buffer
                .push(ServerMessage::Pong {
                    timestamp: Utc::now(),
                    client_timestamp: timestamp,
                })
                .await;
        }
        ClientMessage::GetStats => {
            let stats = serde_json::json!({
                "viewers": hub.viewer_count().await,
                "race_id": hub.race.race_id,
                "subscribed_tiles": client.subscribed_tiles().await.len(),
                "timestamp": Utc::now(),
            });
            client.buffer.push(ServerMessage::Stats { data: stats }).await;
        }
    }
}

async fn close_with(mut socket: WebSocket, code: u16, reason: &'static str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code,
            reason: reason.into(),
        })))
        .await;
}
