use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// A single position report as carried through the queue and persisted into
/// the time-series tables.
///
/// Uniqueness in the store is `(flight_id, datetime, lat, lon)`; duplicate
/// inserts are silently ignored.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrackPoint {
    pub flight_id: String,
    pub flight_uuid: Uuid,
    pub lat: f64,
    pub lon: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

/// Persisted row shape, including the store-assigned row identifier.
#[derive(Debug, Clone, FromRow)]
pub struct TrackPointRow {
    pub id: i64,
    pub flight_id: String,
    pub flight_uuid: Uuid,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

/// Point payload as submitted by producers; `datetime` is parsed strictly as
/// UTC before the point enters a queue item.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IncomingPoint {
    pub lat: f64,
    pub lon: f64,
    #[serde(default)]
    pub elevation: Option<f64>,
    pub datetime: String,
}

impl IncomingPoint {
    /// Parse the payload timestamp. Accepts RFC 3339 with `Z` or offset.
    pub fn parse_datetime(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.datetime)
            .ok()
            .map(|dt| dt.with_timezone(&Utc))
    }
}

/// Shape check shared by the validator and the HTTP adapters.
pub fn coordinates_valid(lat: f64, lon: f64) -> bool {
    lat.is_finite() && lon.is_finite() && (-90.0..=90.0).contains(&lat) && (-180.0..=180.0).contains(&lon)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_coordinates_valid_bounds() {
        assert!(coordinates_valid(45.9, 10.8));
        assert!(coordinates_valid(-90.0, 180.0));
        assert!(!coordinates_valid(90.1, 0.0));
        assert!(!coordinates_valid(0.0, -180.5));
        assert!(!coordinates_valid(f64::NAN, 0.0));
    }

    #[test]
    fn test_incoming_point_datetime_parse() {
        let p = IncomingPoint {
            lat: 45.0,
            lon: 10.0,
            elevation: None,
            datetime: "2025-06-01T12:00:00Z".into(),
        };
        let dt = p.parse_datetime().unwrap();
        assert_eq!(dt.to_rfc3339(), "2025-06-01T12:00:00+00:00");

        let bad = IncomingPoint {
            lat: 45.0,
            lon: 10.0,
            elevation: None,
            datetime: "yesterday".into(),
        };
        assert!(bad.parse_datetime().is_none());
    }
}
