// WebSocket message catalogue for the live fan-out, protocol version 2.0.

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use chrono::{DateTime, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::io::Write;

use super::tiles::TileId;

pub const PROTOCOL_VERSION: &str = "2.0";

/// Client → server messages.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Replaces the client's subscription set atomically
    ViewportUpdate { tiles: Vec<TileId> },
    RequestInitialData {
        #[serde(default = "default_zoom")]
        zoom: u8,
        #[serde(default = "default_bbox")]
        bbox: [f64; 4],
    },
    Ping {
        #[serde(default)]
        timestamp: Option<String>,
    },
    GetStats,
}

fn default_zoom() -> u8 {
    12
}

fn default_bbox() -> [f64; 4] {
    [-180.0, -90.0, 180.0, 90.0]
}

/// Server → client messages.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    RaceConfig {
        race_id: String,
        race_name: String,
        timezone: String,
        delay_seconds: u64,
        update_interval: u64,
        interpolation_rate: u64,
        protocol_version: &'static str,
        features: serde_json::Value,
    },
    ViewerCount {
        count: usize,
        timestamp: DateTime<Utc>,
    },
    TileData {
        tile: TileCoords,
        format: &'static str,
        compression: &'static str,
        data: String,
        timestamp: DateTime<Utc>,
    },
    DeltaUpdate {
        race_id: String,
        data: String,
        timestamp: DateTime<Utc>,
        compression: &'static str,
        update_count: usize,
    },
    Heartbeat {
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
        #[serde(skip_serializing_if = "Option::is_none")]
        client_timestamp: Option<String>,
    },
    Stats {
        data: serde_json::Value,
    },
    Error {
        message: String,
    },
}

impl ServerMessage {
    pub fn race_config(
        race_id: &str,
        race_name: &str,
        timezone: &str,
        delay_seconds: u64,
        update_interval: u64,
    ) -> Self {
        ServerMessage::RaceConfig {
            race_id: race_id.to_string(),
            race_name: race_name.to_string(),
            timezone: timezone.to_string(),
            delay_seconds,
            update_interval,
            interpolation_rate: 1,
            protocol_version: PROTOCOL_VERSION,
            features: json!({
                "delta_updates": true,
                "compressed_tiles": true,
                "smooth_interpolation": true,
            }),
        }
    }

    /// A delta is the only message class that may be discarded when a
    /// client's buffer overflows; clients re-synchronise on the next tick.
    pub fn droppable(&self) -> bool {
        matches!(self, ServerMessage::DeltaUpdate { .. })
    }
}

/// `{z, x, y}` object form used inside `tile_data`.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct TileCoords {
    pub z: u8,
    pub x: u32,
    pub y: u32,
}

impl From<TileId> for TileCoords {
    fn from(t: TileId) -> Self {
        Self {
            z: t.z(),
            x: t.x(),
            y: t.y(),
        }
    }
}

/// One pilot's entry in a decoded delta payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaEntry {
    pub pilot_id: String,
    pub pilot_name: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub x_mercator: f64,
    pub y_mercator: f64,
}

/// The JSON carried (gzipped, base64) inside a `delta_update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeltaPayload {
    #[serde(rename = "type")]
    pub kind: String,
    pub timestamp: DateTime<Utc>,
    pub updates: Vec<DeltaEntry>,
}

impl DeltaPayload {
    pub fn new(timestamp: DateTime<Utc>, updates: Vec<DeltaEntry>) -> Self {
        Self {
            kind: "delta".to_string(),
            timestamp,
            updates,
        }
    }

    pub fn encode(&self) -> anyhow::Result<String> {
        let raw = serde_json::to_vec(self)?;
        Ok(gzip_base64(&raw)?)
    }
}

pub fn gzip_base64(raw: &[u8]) -> std::io::Result<String> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::new(6));
    encoder.write_all(raw)?;
    let compressed = encoder.finish()?;
    Ok(BASE64.encode(compressed))
}

#[cfg(test)]
pub fn gunzip_base64(data: &str) -> anyhow::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let compressed = BASE64.decode(data)?;
    let mut decoder = GzDecoder::new(compressed.as_slice());
    let mut raw = Vec::new();
    decoder.read_to_end(&mut raw)?;
    Ok(raw)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_client_message_parsing() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"viewport_update","tiles":[[12,2170,1463]]}"#).unwrap();
        let ClientMessage::ViewportUpdate { tiles } = msg else {
            panic!("expected viewport update");
        };
        assert_eq!(tiles, vec![TileId(12, 2170, 1463)]);

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping { .. }));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"request_initial_data","zoom":10,"bbox":[10.0,45.0,11.0,46.0]}"#,
        )
        .unwrap();
        let ClientMessage::RequestInitialData { zoom, bbox } = msg else {
            panic!("expected initial data request");
        };
        assert_eq!(zoom, 10);
        assert_eq!(bbox, [10.0, 45.0, 11.0, 46.0]);

        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"fly_away"}"#).is_err());
    }

    #[test]
    fn test_server_message_tags() {
        let msg = ServerMessage::race_config("race1", "Alps Open", "Europe/Rome", 60, 10);
        let json = serde_json::to_value(&msg).unwrap();
        assert_eq!(json["type"], "race_config");
        assert_eq!(json["protocol_version"], "2.0");
        assert_eq!(json["delay_seconds"], 60);
        assert_eq!(json["interpolation_rate"], 1);

        let msg = ServerMessage::Heartbeat {
            timestamp: Utc::now(),
        };
        assert_eq!(serde_json::to_value(&msg).unwrap()["type"], "heartbeat");
    }

    #[test]
    fn test_only_deltas_are_droppable() {
        let delta = ServerMessage::DeltaUpdate {
            race_id: "r".into(),
            data: String::new(),
            timestamp: Utc::now(),
            compression: "gzip",
            update_count: 0,
        };
        assert!(delta.droppable());

        let tile = ServerMessage::TileData {
            tile: TileCoords { z: 12, x: 0, y: 0 },
            format: "mvt",
            compression: "gzip",
            data: String::new(),
            timestamp: Utc::now(),
        };
        assert!(!tile.droppable());
    }

    #[test]
    fn test_delta_payload_round_trip() {
        let tick = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let payload = DeltaPayload::new(
            tick,
            vec![DeltaEntry {
                pilot_id: "p1".into(),
                pilot_name: "Test Pilot".into(),
                lat: 45.6,
                lon: 10.8,
                elevation: Some(1200.0),
                timestamp: tick,
                x_mercator: 1_202_250.0,
                y_mercator: 5_715_700.0,
            }],
        );

        let encoded = payload.encode().unwrap();
        let raw = gunzip_base64(&encoded).unwrap();
        let decoded: DeltaPayload = serde_json::from_slice(&raw).unwrap();

        assert_eq!(decoded.kind, "delta");
        assert_eq!(decoded.timestamp, tick);
        assert_eq!(decoded.updates.len(), 1);
        assert_eq!(decoded.updates[0].pilot_id, "p1");
    }
}
