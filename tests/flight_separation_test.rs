//! Scenario tests for the flight separation decision procedure, driven the
//! way points arrive from a long-lived tracker.

use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

use thermal::flight_separator::{
    decide, Decision, FlightState, LandingConfig, OpenFlightSummary, Phase, SeparationReason,
};
use thermal::flights::FixSummary;

fn summary(last_fix_at: DateTime<Utc>) -> OpenFlightSummary {
    OpenFlightSummary {
        flight_uuid: Uuid::new_v4(),
        flight_id: "tk905b_live-p7-alps2025-8800001234-20250101".into(),
        last_fix: Some(FixSummary {
            lat: 45.9,
            lon: 11.7,
            elevation: Some(1300.0),
            datetime: last_fix_at,
        }),
        created_at: last_fix_at,
        state: FlightState::default(),
    }
}

/// Day rollover happens in the race timezone, not UTC: a point at
/// 23:59 UTC (00:59 next day in Rome) followed by one at 00:01 UTC lands
/// on two different local dates even though UTC also rolls over between
/// them; the important case is the local-only rollover below.
#[test]
fn day_rollover_uses_race_timezone() {
    let rome = chrono_tz::Europe::Rome;
    let config = LandingConfig::default();

    // 2025-01-01T23:59:00Z is 00:59 Jan 2 in Rome
    let first = Utc.with_ymd_and_hms(2025, 1, 1, 23, 59, 0).unwrap();
    // 2025-01-02T00:01:00Z is 01:01 Jan 2 in Rome: same local date
    let second = Utc.with_ymd_and_hms(2025, 1, 2, 0, 1, 0).unwrap();

    let opening = decide(None, first, None, rome, &config);
    assert_eq!(
        opening,
        Decision::Open {
            reason: SeparationReason::NoPreviousFlight,
            suffix: "20250102".into(),
        }
    );

    // Both points share the local date, so the second attaches despite the
    // UTC day boundary between them
    assert_eq!(
        decide(Some(&summary(first)), second, None, rome, &config),
        Decision::Attach {
            advance_state: true
        }
    );

    // The local rollover, in contrast, splits while UTC still reads Jan 1
    let before_local_midnight = Utc.with_ymd_and_hms(2025, 1, 1, 22, 30, 0).unwrap();
    let after_local_midnight = Utc.with_ymd_and_hms(2025, 1, 1, 23, 30, 0).unwrap();
    assert_eq!(
        decide(
            Some(&summary(before_local_midnight)),
            after_local_midnight,
            None,
            rome,
            &config
        ),
        Decision::Open {
            reason: SeparationReason::NewDay,
            suffix: "20250102".into(),
        }
    );
}

/// Points at T, T+2h, T+5h: the first gap continues the flight, the second
/// (3h, inclusive boundary) opens a new one suffixed with the arrival time
/// in race-local time.
#[test]
fn inactivity_gap_splits_at_three_hours() {
    let rome = chrono_tz::Europe::Rome;
    let config = LandingConfig::default();

    let t = Utc.with_ymd_and_hms(2025, 6, 10, 7, 0, 0).unwrap();
    let t2 = t + Duration::hours(2);
    let t5 = t + Duration::hours(5);

    assert_eq!(
        decide(Some(&summary(t)), t2, None, rome, &config),
        Decision::Attach {
            advance_state: true
        }
    );

    // last fix advanced to T+2h; T+5h is exactly 3h later
    let decision = decide(Some(&summary(t2)), t5, None, rome, &config);
    assert_eq!(
        decision,
        Decision::Open {
            reason: SeparationReason::Inactivity,
            // 12:00 UTC = 14:00 Europe/Rome in June
            suffix: "1400".into(),
        }
    );
}

/// Full landing sequence: ten minutes of slow points close the window, the
/// flight stays open while the pilot packs up, and the next airborne point
/// opens an `L`-suffixed flight stamped with the landing instant.
#[test]
fn landing_then_relaunch_opens_l_flight() {
    let rome = chrono_tz::Europe::Rome;
    let config = LandingConfig::default();

    let mut state = FlightState::default();
    let touchdown = Utc.with_ymd_and_hms(2025, 6, 10, 13, 0, 0).unwrap();

    let mut landed_at = None;
    for minute in 0..=10 {
        let t = touchdown + Duration::minutes(minute);
        landed_at = state.observe(t, 2.5, Some(412.0), &config);
        if landed_at.is_some() {
            break;
        }
    }
    let landed_at = landed_at.expect("ten slow minutes should land the flight");
    assert_eq!(state.state, Phase::Landed);

    let mut flight = summary(landed_at);
    flight.state = state;

    // Ground shuffle keeps attaching to the landed flight
    assert_eq!(
        decide(
            Some(&flight),
            landed_at + Duration::minutes(3),
            Some(1.0),
            rome,
            &config
        ),
        Decision::Attach {
            advance_state: true
        }
    );

    // Relaunch: 13:10 UTC landing is 15:10 in Rome
    assert_eq!(
        decide(
            Some(&flight),
            landed_at + Duration::minutes(6),
            Some(18.0),
            rome,
            &config
        ),
        Decision::Open {
            reason: SeparationReason::Landed,
            suffix: "L1510".into(),
        }
    );
}

/// Speed exactly at the 5 km/h threshold is airborne, not grounded, on
/// both sides of the rule: it resets the landing window and it qualifies
/// as the relaunch point.
#[test]
fn five_kmh_is_strictly_airborne() {
    let config = LandingConfig::default();
    let start = Utc.with_ymd_and_hms(2025, 6, 10, 13, 0, 0).unwrap();

    let mut state = FlightState::default();
    for minute in 0..=10 {
        let speed = if minute == 5 { 5.0 } else { 2.0 };
        assert_eq!(
            state.observe(start + Duration::minutes(minute), speed, Some(400.0), &config),
            None,
            "the 5 km/h sample at minute 5 must keep the flight airborne"
        );
    }
    assert_eq!(state.state, Phase::Flying);
}
