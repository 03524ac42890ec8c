use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// Origin tag on a flight.
///
/// Mobile producers (`Live`, `Upload`) supply their own opaque flight
/// identifiers; tracker sources go through the flight separator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[serde(rename_all = "snake_case")]
#[sqlx(type_name = "text", rename_all = "snake_case")]
pub enum FlightSource {
    Live,
    Upload,
    Tk905bLive,
    FlymasterLive,
}

impl FlightSource {
    pub fn is_tracker(&self) -> bool {
        matches!(self, FlightSource::Tk905bLive | FlightSource::FlymasterLive)
    }
}

impl std::fmt::Display for FlightSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FlightSource::Live => write!(f, "live"),
            FlightSource::Upload => write!(f, "upload"),
            FlightSource::Tk905bLive => write!(f, "tk905b_live"),
            FlightSource::FlymasterLive => write!(f, "flymaster_live"),
        }
    }
}

impl std::str::FromStr for FlightSource {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live" => Ok(FlightSource::Live),
            "upload" => Ok(FlightSource::Upload),
            "tk905b_live" => Ok(FlightSource::Tk905bLive),
            "flymaster_live" => Ok(FlightSource::FlymasterLive),
            other => Err(anyhow::anyhow!("unknown flight source: {}", other)),
        }
    }
}

/// Denormalised first/last fix summary stored as JSONB on the flight row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixSummary {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

/// One continuous flying session of one pilot with one producer.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Flight {
    pub id: Uuid,
    /// Composite string identifier; unique together with `source`
    pub flight_id: String,
    pub race_uuid: Uuid,
    pub race_id: String,
    pub pilot_id: String,
    pub pilot_name: String,
    pub source: FlightSource,
    pub device_id: Option<String>,
    #[sqlx(json(nullable))]
    pub first_fix: Option<FixSummary>,
    #[sqlx(json(nullable))]
    pub last_fix: Option<FixSummary>,
    pub total_points: i32,
    /// Landing-detection state blob, tracker sources only
    pub flight_state: Option<serde_json::Value>,
    pub created_at: DateTime<Utc>,
}

/// Builds composite flight identifiers for tracker sources:
/// `{source}-{pilot_id}-{race_id}-{device_id}[-{suffix}]`.
pub fn tracker_flight_id(
    source: FlightSource,
    pilot_id: &str,
    race_id: &str,
    device_id: &str,
    suffix: Option<&str>,
) -> String {
    match suffix {
        Some(suffix) => format!("{}-{}-{}-{}-{}", source, pilot_id, race_id, device_id, suffix),
        None => format!("{}-{}-{}-{}", source, pilot_id, race_id, device_id),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_source_round_trip() {
        for s in ["live", "upload", "tk905b_live", "flymaster_live"] {
            let parsed: FlightSource = s.parse().unwrap();
            assert_eq!(parsed.to_string(), s);
        }
        assert!("garmin".parse::<FlightSource>().is_err());
    }

    #[test]
    fn test_tracker_flight_id_format() {
        let id = tracker_flight_id(
            FlightSource::Tk905bLive,
            "p1",
            "race9",
            "8800001234",
            Some("20250101"),
        );
        assert_eq!(id, "tk905b_live-p1-race9-8800001234-20250101");

        let id = tracker_flight_id(FlightSource::FlymasterLive, "p1", "race9", "dev", None);
        assert_eq!(id, "flymaster_live-p1-race9-dev");
    }

    #[test]
    fn test_only_trackers_are_separated() {
        assert!(FlightSource::Tk905bLive.is_tracker());
        assert!(FlightSource::FlymasterLive.is_tracker());
        assert!(!FlightSource::Live.is_tracker());
        assert!(!FlightSource::Upload.is_tracker());
    }
}
