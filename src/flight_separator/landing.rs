use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;

/// Landing-detection thresholds. Documented intent: ten minutes on the
/// ground at under 5 km/h with under 10 m of altitude variation. Kept in
/// configuration rather than constants so operators can tune per event.
#[derive(Debug, Clone, Copy)]
pub struct LandingConfig {
    pub window: Duration,
    pub speed_kmh: f64,
    pub altitude_variation_m: f64,
}

impl Default for LandingConfig {
    fn default() -> Self {
        Self {
            window: Duration::minutes(10),
            speed_kmh: 5.0,
            altitude_variation_m: 10.0,
        }
    }
}

/// One sample in the rolling ground window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WindowSample {
    pub t: DateTime<Utc>,
    pub speed_kmh: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub elevation: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    Flying,
    Landed,
}

/// Per-flight landing state, persisted as the flight's `flight_state` blob
/// so a restarted separator resumes mid-window.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlightState {
    pub state: Phase,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub landed_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub window: VecDeque<WindowSample>,
}

impl Default for FlightState {
    fn default() -> Self {
        Self {
            state: Phase::Flying,
            landed_at: None,
            window: VecDeque::new(),
        }
    }
}

impl FlightState {
    pub fn from_blob(blob: Option<&serde_json::Value>) -> Self {
        blob.and_then(|v| serde_json::from_value(v.clone()).ok())
            .unwrap_or_default()
    }

    pub fn to_blob(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or(serde_json::Value::Null)
    }

    /// Feed one in-order point into the rolling window. Returns the landing
    /// instant when this point closes a full ground window.
    ///
    /// Speed exactly at the threshold does not count as grounded.
    pub fn observe(
        &mut self,
        t: DateTime<Utc>,
        speed_kmh: f64,
        elevation: Option<f64>,
        config: &LandingConfig,
    ) -> Option<DateTime<Utc>> {
        if self.state == Phase::Landed {
            return None;
        }

        if speed_kmh >= config.speed_kmh {
            // Airborne again: any accumulated ground time is void
            self.window.clear();
            return None;
        }

        self.window.push_back(WindowSample {
            t,
            speed_kmh,
            elevation,
        });

        // Keep only the trailing `window` worth of samples
        while let Some(front) = self.window.front() {
            if t - front.t > config.window {
                self.window.pop_front();
            } else {
                break;
            }
        }

        let span = match (self.window.front(), self.window.back()) {
            (Some(first), Some(last)) => last.t - first.t,
            _ => return None,
        };
        if span < config.window {
            return None;
        }

        let elevations: Vec<f64> = self.window.iter().filter_map(|s| s.elevation).collect();
        if elevations.len() >= 2 {
            let min = elevations.iter().cloned().fold(f64::INFINITY, f64::min);
            let max = elevations.iter().cloned().fold(f64::NEG_INFINITY, f64::max);
            if max - min >= config.altitude_variation_m {
                return None;
            }
        }

        self.state = Phase::Landed;
        self.landed_at = Some(t);
        self.window.clear();
        Some(t)
    }

    /// True when the flight has landed and this point is airborne again -
    /// the trigger for opening a post-landing flight.
    pub fn resumes_flight(&self, speed_kmh: f64, config: &LandingConfig) -> bool {
        self.state == Phase::Landed && speed_kmh >= config.speed_kmh
    }
}

/// Horizontal speed between consecutive points, for devices that do not
/// report speed themselves.
pub fn horizontal_speed_kmh(
    from: (f64, f64, DateTime<Utc>),
    to: (f64, f64, DateTime<Utc>),
) -> Option<f64> {
    let elapsed = (to.2 - from.2).num_seconds();
    if elapsed <= 0 {
        return None;
    }
    let meters = haversine_m(from.0, from.1, to.0, to.1);
    Some(meters / elapsed as f64 * 3.6)
}

pub(crate) fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    const EARTH_RADIUS_M: f64 = 6_371_000.0;

    let lat1_rad = lat1.to_radians();
    let lat2_rad = lat2.to_radians();
    let delta_lat = (lat2 - lat1).to_radians();
    let delta_lon = (lon2 - lon1).to_radians();

    let a = (delta_lat / 2.0).sin().powi(2)
        + lat1_rad.cos() * lat2_rad.cos() * (delta_lon / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());

    EARTH_RADIUS_M * c
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn t(minute: u32, second: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 14, minute, second).unwrap()
    }

    #[test]
    fn test_landing_after_ten_minutes_on_ground() {
        let config = LandingConfig::default();
        let mut state = FlightState::default();

        for minute in 0..10 {
            assert_eq!(state.observe(t(minute, 0), 2.0, Some(400.0), &config), None);
        }
        // The sample that stretches the window to the full ten minutes lands
        let landed = state.observe(t(10, 0), 1.0, Some(401.0), &config);
        assert_eq!(landed, Some(t(10, 0)));
        assert_eq!(state.state, Phase::Landed);
        assert_eq!(state.landed_at, Some(t(10, 0)));
    }

    #[test]
    fn test_speed_at_threshold_is_not_grounded() {
        let config = LandingConfig::default();
        let mut state = FlightState::default();

        for minute in 0..10 {
            state.observe(t(minute, 0), 2.0, Some(400.0), &config);
        }
        // Exactly 5 km/h resets the window: strict less-than
        assert_eq!(state.observe(t(10, 0), 5.0, Some(400.0), &config), None);
        assert_eq!(state.state, Phase::Flying);
        assert!(state.window.is_empty());
    }

    #[test]
    fn test_altitude_variation_blocks_landing() {
        let config = LandingConfig::default();
        let mut state = FlightState::default();

        // Slow but ridge-soaring: altitude swings more than 10 m
        for minute in 0..=10 {
            let elevation = if minute % 2 == 0 { 400.0 } else { 415.0 };
            assert_eq!(
                state.observe(t(minute, 0), 3.0, Some(elevation), &config),
                None
            );
        }
        assert_eq!(state.state, Phase::Flying);
    }

    #[test]
    fn test_resume_after_landing() {
        let config = LandingConfig::default();
        let mut state = FlightState {
            state: Phase::Landed,
            landed_at: Some(t(0, 0)),
            window: VecDeque::new(),
        };

        assert!(!state.resumes_flight(3.0, &config));
        assert!(state.resumes_flight(5.0, &config));
        assert!(state.resumes_flight(25.0, &config));
    }

    #[test]
    fn test_state_blob_round_trip() {
        let mut state = FlightState::default();
        let config = LandingConfig::default();
        state.observe(t(0, 0), 2.0, Some(400.0), &config);

        let blob = state.to_blob();
        let back = FlightState::from_blob(Some(&blob));
        assert_eq!(back.state, Phase::Flying);
        assert_eq!(back.window.len(), 1);

        // a corrupt blob falls back to a fresh flying state
        let garbage = serde_json::json!({"state": "hovering"});
        let back = FlightState::from_blob(Some(&garbage));
        assert_eq!(back.state, Phase::Flying);
    }

    #[test]
    fn test_horizontal_speed() {
        let from = (45.0, 10.0, t(0, 0));
        let to = (45.0, 10.0, t(0, 10));
        assert_eq!(horizontal_speed_kmh(from, to), Some(0.0));

        // ~111 m north in 10 s is roughly 40 km/h
        let to = (45.001, 10.0, t(0, 10));
        let speed = horizontal_speed_kmh(from, to).unwrap();
        assert!((35.0..=45.0).contains(&speed), "speed was {}", speed);

        // out-of-order points produce no speed estimate
        assert_eq!(horizontal_speed_kmh(to, from), None);
    }
}
