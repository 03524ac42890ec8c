// Flight separation for long-lived tracker devices.
//
// Trackers (TK905B, Flymaster) stream for days; this module decides whether
// an incoming point belongs to the device's open flight or opens a new one,
// splitting on day boundaries, inactivity gaps, and detected landings.
// Mobile producers supply their own flight identifiers and bypass all of it.

mod landing;

pub use landing::{horizontal_speed_kmh, FlightState, LandingConfig, Phase};

use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use chrono_tz::Tz;
use moka::future::Cache;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::flights::{tracker_flight_id, FixSummary, Flight, FlightSource};
use crate::flights_repo::FlightsRepository;
use crate::races::Race;

/// Inactivity gap that forces a new flight; the boundary is inclusive.
fn inactivity_gap() -> Duration {
    Duration::hours(3)
}

/// Cached view of a device's open flight. Stale reads are tolerated: the
/// final decision is re-verified against the store on flight creation.
#[derive(Debug, Clone)]
pub struct OpenFlightSummary {
    pub flight_uuid: Uuid,
    pub flight_id: String,
    pub last_fix: Option<FixSummary>,
    pub created_at: DateTime<Utc>,
    pub state: FlightState,
}

impl OpenFlightSummary {
    fn from_flight(flight: &Flight) -> Self {
        Self {
            flight_uuid: flight.id,
            flight_id: flight.flight_id.clone(),
            last_fix: flight.last_fix.clone(),
            created_at: flight.created_at,
            state: FlightState::from_blob(flight.flight_state.as_ref()),
        }
    }
}

/// Why a new flight was opened; determines the identifier suffix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SeparationReason {
    NoPreviousFlight,
    NewDay,
    Inactivity,
    Landed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision {
    /// Attach to the open flight; `advance_state` is false for points that
    /// arrived out of order by timestamp
    Attach { advance_state: bool },
    /// Open a new flight with the given identifier suffix
    Open {
        reason: SeparationReason,
        suffix: String,
    },
}

/// Pure decision procedure, evaluated top to bottom; first match wins.
pub fn decide(
    previous: Option<&OpenFlightSummary>,
    point_time: DateTime<Utc>,
    speed_kmh: Option<f64>,
    tz: Tz,
    landing: &LandingConfig,
) -> Decision {
    let Some(prev) = previous else {
        return Decision::Open {
            reason: SeparationReason::NoPreviousFlight,
            suffix: point_time.with_timezone(&tz).format("%Y%m%d").to_string(),
        };
    };

    let last_time = prev
        .last_fix
        .as_ref()
        .map(|f| f.datetime)
        .unwrap_or(prev.created_at);

    // Out-of-order points go into the current flight but take no part in
    // day/inactivity/landing detection.
    if point_time <= last_time {
        return Decision::Attach {
            advance_state: false,
        };
    }

    let last_local = last_time.with_timezone(&tz).date_naive();
    let point_local = point_time.with_timezone(&tz).date_naive();
    if point_local != last_local {
        return Decision::Open {
            reason: SeparationReason::NewDay,
            suffix: point_time.with_timezone(&tz).format("%Y%m%d").to_string(),
        };
    }

    if point_time - last_time >= inactivity_gap() {
        return Decision::Open {
            reason: SeparationReason::Inactivity,
            suffix: point_time.with_timezone(&tz).format("%H%M").to_string(),
        };
    }

    if let Some(speed) = speed_kmh {
        if prev.state.resumes_flight(speed, landing) {
            let landed_at = prev.state.landed_at.unwrap_or(point_time);
            return Decision::Open {
                reason: SeparationReason::Landed,
                suffix: format!("L{}", landed_at.with_timezone(&tz).format("%H%M")),
            };
        }
    }

    Decision::Attach {
        advance_state: true,
    }
}

/// The flight resolved for an incoming tracker point.
#[derive(Debug, Clone)]
pub struct ResolvedFlight {
    pub flight_uuid: Uuid,
    pub flight_id: String,
    pub opened_new: bool,
}

/// Incoming tracker point as seen by the separator.
#[derive(Debug, Clone)]
pub struct TrackerPoint {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
    /// Device-reported speed; derived from the previous fix when absent
    pub speed_kmh: Option<f64>,
}

#[derive(Clone)]
pub struct FlightSeparator {
    flights_repo: FlightsRepository,
    landing: LandingConfig,
    /// (device_id, race_id) -> open flight summary, 1 h TTL
    cache: Cache<(String, String), OpenFlightSummary>,
    /// flight_id -> cache key, for applying writer feedback
    feedback_index: Arc<RwLock<HashMap<String, (String, String)>>>,
}

impl FlightSeparator {
    pub fn new(flights_repo: FlightsRepository, landing: LandingConfig) -> Self {
        Self {
            flights_repo,
            landing,
            cache: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(std::time::Duration::from_secs(3600))
                .build(),
            feedback_index: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Hook up the writer's summary feedback; advanced last fixes refresh
    /// the matching cache entry so it never goes stale between store reads.
    pub fn spawn_feedback_listener(&self, rx: flume::Receiver<(String, FixSummary)>) {
        let separator = self.clone();
        tokio::spawn(async move {
            while let Ok((flight_id, last_fix)) = rx.recv_async().await {
                separator.apply_feedback(&flight_id, last_fix).await;
            }
        });
    }

    async fn apply_feedback(&self, flight_id: &str, last_fix: FixSummary) {
        let key = {
            let index = self.feedback_index.read().await;
            index.get(flight_id).cloned()
        };
        let Some(key) = key else { return };

        if let Some(mut summary) = self.cache.get(&key).await {
            if summary.flight_id == flight_id {
                let newer = summary
                    .last_fix
                    .as_ref()
                    .map(|f| f.datetime < last_fix.datetime)
                    .unwrap_or(true);
                if newer {
                    summary.last_fix = Some(last_fix);
                    self.cache.insert(key, summary).await;
                }
            }
        }
    }

    /// Resolve the flight for one tracker point, creating a new flight row
    /// when the decision procedure says so.
    pub async fn resolve(
        &self,
        source: FlightSource,
        pilot_id: &str,
        pilot_name: &str,
        race: &Race,
        device_id: &str,
        point: &TrackerPoint,
    ) -> Result<ResolvedFlight> {
        let key = (device_id.to_string(), race.race_id.clone());
        let tz = race.tz();

        let mut previous = match self.cache.get(&key).await {
            Some(summary) => Some(summary),
            None => {
                let flight = self
                    .flights_repo
                    .latest_for_device(device_id, &race.race_id)
                    .await?;
                flight.as_ref().map(OpenFlightSummary::from_flight)
            }
        };

        let speed = point.speed_kmh.or_else(|| {
            previous.as_ref().and_then(|p| {
                p.last_fix.as_ref().and_then(|f| {
                    horizontal_speed_kmh(
                        (f.lat, f.lon, f.datetime),
                        (point.lat, point.lon, point.timestamp),
                    )
                })
            })
        });

        let decision = decide(previous.as_ref(), point.timestamp, speed, tz, &self.landing);

        match decision {
            Decision::Attach { advance_state } => {
                let mut summary = previous
                    .take()
                    .expect("attach decision requires an open flight");

                if advance_state {
                    if let Some(landed_at) = summary.state.observe(
                        point.timestamp,
                        speed.unwrap_or(0.0),
                        point.elevation,
                        &self.landing,
                    ) {
                        info!(
                            device_id,
                            flight_id = %summary.flight_id,
                            %landed_at,
                            "Landing detected"
                        );
                        self.flights_repo
                            .update_flight_state(summary.flight_uuid, summary.state.to_blob())
                            .await?;
                    }
                    summary.last_fix = Some(FixSummary {
                        lat: point.lat,
                        lon: point.lon,
                        elevation: point.elevation,
                        datetime: point.timestamp,
                    });
                }

                let resolved = ResolvedFlight {
                    flight_uuid: summary.flight_uuid,
                    flight_id: summary.flight_id.clone(),
                    opened_new: false,
                };
                self.remember(key, summary).await;
                Ok(resolved)
            }
            Decision::Open { reason, suffix } => {
                debug!(device_id, ?reason, suffix, "Opening new tracker flight");
                let flight = self
                    .open_flight(source, pilot_id, pilot_name, race, device_id, point, &suffix)
                    .await?;

                let resolved = ResolvedFlight {
                    flight_uuid: flight.flight_uuid,
                    flight_id: flight.flight_id.clone(),
                    opened_new: true,
                };
                self.remember(key, flight).await;
                metrics::counter!("separator.flights_opened_total").increment(1);
                Ok(resolved)
            }
        }
    }

    async fn remember(&self, key: (String, String), summary: OpenFlightSummary) {
        {
            let mut index = self.feedback_index.write().await;
            index.insert(summary.flight_id.clone(), key.clone());
        }
        self.cache.insert(key, summary).await;
    }

    /// Create the flight row for a separation decision. Re-verified against
    /// the store: if another worker created the same flight first, its row
    /// wins and we adopt it.
    async fn open_flight(
        &self,
        source: FlightSource,
        pilot_id: &str,
        pilot_name: &str,
        race: &Race,
        device_id: &str,
        point: &TrackerPoint,
        suffix: &str,
    ) -> Result<OpenFlightSummary> {
        let flight_id =
            tracker_flight_id(source, pilot_id, &race.race_id, device_id, Some(suffix));

        if let Some(existing) = self.flights_repo.get_by_flight_id(&flight_id).await? {
            return Ok(OpenFlightSummary::from_flight(&existing));
        }

        let fix = FixSummary {
            lat: point.lat,
            lon: point.lon,
            elevation: point.elevation,
            datetime: point.timestamp,
        };
        let flight = Flight {
            id: Uuid::new_v4(),
            flight_id: flight_id.clone(),
            race_uuid: race.id,
            race_id: race.race_id.clone(),
            pilot_id: pilot_id.to_string(),
            pilot_name: pilot_name.to_string(),
            source,
            device_id: Some(device_id.to_string()),
            first_fix: Some(fix.clone()),
            last_fix: Some(fix),
            total_points: 0,
            flight_state: Some(FlightState::default().to_blob()),
            created_at: Utc::now(),
        };

        if let Err(e) = self.flights_repo.insert(&flight).await {
            // Lost the race to a concurrent creator: adopt the winning row
            if let Some(existing) = self.flights_repo.get_by_flight_id(&flight_id).await? {
                warn!(flight_id, "Concurrent flight creation, adopting existing row");
                return Ok(OpenFlightSummary::from_flight(&existing));
            }
            return Err(e);
        }

        Ok(OpenFlightSummary::from_flight(&flight))
    }
}

pub fn landing_config_from(settings: &crate::config::Settings) -> LandingConfig {
    LandingConfig {
        window: Duration::minutes(settings.landing_window_minutes),
        speed_kmh: settings.landing_speed_kmh,
        altitude_variation_m: settings.landing_altitude_variation_m,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use chrono_tz::Europe::Rome;

    fn summary_with_last_fix(at: DateTime<Utc>) -> OpenFlightSummary {
        OpenFlightSummary {
            flight_uuid: Uuid::new_v4(),
            flight_id: "tk905b_live-p1-race1-dev1-20250101".into(),
            last_fix: Some(FixSummary {
                lat: 45.0,
                lon: 10.0,
                elevation: Some(500.0),
                datetime: at,
            }),
            created_at: at,
            state: FlightState::default(),
        }
    }

    fn cfg() -> LandingConfig {
        LandingConfig::default()
    }

    #[test]
    fn test_first_point_opens_flight_with_local_date_suffix() {
        // 23:30 UTC on Jan 1 is already Jan 2 in Rome
        let t = Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap();
        let decision = decide(None, t, None, Rome, &cfg());
        assert_eq!(
            decision,
            Decision::Open {
                reason: SeparationReason::NoPreviousFlight,
                suffix: "20250102".into(),
            }
        );
    }

    #[test]
    fn test_day_rollover_in_race_timezone_only() {
        // Both timestamps are Jan 1 in UTC, but Rome rolls over between them
        let last = Utc.with_ymd_and_hms(2025, 1, 1, 22, 59, 0).unwrap();
        let point = Utc.with_ymd_and_hms(2025, 1, 1, 23, 1, 0).unwrap();

        let decision = decide(Some(&summary_with_last_fix(last)), point, None, Rome, &cfg());
        assert_eq!(
            decision,
            Decision::Open {
                reason: SeparationReason::NewDay,
                suffix: "20250102".into(),
            }
        );

        // Same two instants in UTC are one day: no split
        let decision = decide(
            Some(&summary_with_last_fix(last)),
            point,
            None,
            chrono_tz::UTC,
            &cfg(),
        );
        assert_eq!(
            decision,
            Decision::Attach {
                advance_state: true
            }
        );
    }

    #[test]
    fn test_inactivity_boundary_is_inclusive_at_three_hours() {
        let last = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();

        let within = last + Duration::hours(3) - Duration::seconds(1);
        assert_eq!(
            decide(Some(&summary_with_last_fix(last)), within, None, Rome, &cfg()),
            Decision::Attach {
                advance_state: true
            }
        );

        let exactly = last + Duration::hours(3);
        let decision = decide(Some(&summary_with_last_fix(last)), exactly, None, Rome, &cfg());
        assert_eq!(
            decision,
            Decision::Open {
                reason: SeparationReason::Inactivity,
                // 11:00 UTC is 13:00 in Rome (summer)
                suffix: "1300".into(),
            }
        );
    }

    #[test]
    fn test_out_of_order_point_attaches_without_advancing() {
        let last = Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap();
        let stale = last - Duration::minutes(5);

        assert_eq!(
            decide(Some(&summary_with_last_fix(last)), stale, None, Rome, &cfg()),
            Decision::Attach {
                advance_state: false
            }
        );

        // even a stale point from the previous local day must not split
        let very_stale = last - Duration::days(1);
        assert_eq!(
            decide(
                Some(&summary_with_last_fix(last)),
                very_stale,
                None,
                Rome,
                &cfg()
            ),
            Decision::Attach {
                advance_state: false
            }
        );
    }

    #[test]
    fn test_airborne_point_after_landing_opens_l_flight() {
        let landed_at = Utc.with_ymd_and_hms(2025, 6, 1, 14, 22, 0).unwrap();
        let mut summary = summary_with_last_fix(landed_at);
        summary.state = FlightState {
            state: Phase::Landed,
            landed_at: Some(landed_at),
            window: Default::default(),
        };

        // Still on the ground: points keep attaching to the landed flight
        let crawling = decide(
            Some(&summary),
            landed_at + Duration::minutes(2),
            Some(2.0),
            Rome,
            &cfg(),
        );
        assert_eq!(
            crawling,
            Decision::Attach {
                advance_state: true
            }
        );

        // First airborne point opens the post-landing flight, suffixed with
        // the landing instant in race-local time (16:22 in Rome)
        let airborne = decide(
            Some(&summary),
            landed_at + Duration::minutes(4),
            Some(12.0),
            Rome,
            &cfg(),
        );
        assert_eq!(
            airborne,
            Decision::Open {
                reason: SeparationReason::Landed,
                suffix: "L1622".into(),
            }
        );
    }

    #[test]
    fn test_assignments_monotonic_for_sorted_batch() {
        // A sorted batch never assigns a later point to an older flight:
        // once a split fires, the new flight's last fix advances with it.
        let start = Utc.with_ymd_and_hms(2025, 6, 1, 8, 0, 0).unwrap();
        let mut summary = summary_with_last_fix(start);
        let mut splits = 0;

        for i in 1..=8 {
            let point = start + Duration::hours(i);
            match decide(Some(&summary), point, None, Rome, &cfg()) {
                Decision::Attach { advance_state } => {
                    assert!(advance_state);
                    if let Some(fix) = summary.last_fix.as_mut() {
                        fix.datetime = point;
                    }
                }
                Decision::Open { .. } => {
                    splits += 1;
                    summary = summary_with_last_fix(point);
                }
            }
        }
        // hourly points never exceed the gap, so the only splits are none
        assert_eq!(splits, 0);
    }
}
