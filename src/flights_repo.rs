use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use std::collections::HashSet;
use tracing::info;
use uuid::Uuid;

use crate::flights::{FixSummary, Flight, FlightSource};

#[derive(Clone)]
pub struct FlightsRepository {
    pool: PgPool,
}

/// Row shape for the pilot-flights listing.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PilotFlightRow {
    pub id: Uuid,
    pub flight_id: String,
    pub source: FlightSource,
    #[sqlx(json(nullable))]
    pub first_fix: Option<FixSummary>,
    #[sqlx(json(nullable))]
    pub last_fix: Option<FixSummary>,
    pub total_points: i32,
    pub created_at: DateTime<Utc>,
}

/// Aggregates for the live summary endpoint.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PilotActivityRow {
    pub pilot_id: String,
    pub pilot_name: String,
    pub flight_count: i64,
    pub last_activity: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct RaceSummaryRow {
    pub total_flights: i64,
    pub total_pilots: i64,
    pub earliest_activity: Option<DateTime<Utc>>,
    pub latest_activity: Option<DateTime<Utc>>,
}

const FLIGHT_COLUMNS: &str = "id, flight_id, race_uuid, race_id, pilot_id, pilot_name, source, \
     device_id, first_fix, last_fix, total_points, flight_state, created_at";

impl FlightsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn insert(&self, flight: &Flight) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO flights (
                id, flight_id, race_uuid, race_id, pilot_id, pilot_name, source,
                device_id, first_fix, last_fix, total_points, flight_state, created_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13)
            "#,
        )
        .bind(flight.id)
        .bind(&flight.flight_id)
        .bind(flight.race_uuid)
        .bind(&flight.race_id)
        .bind(&flight.pilot_id)
        .bind(&flight.pilot_name)
        .bind(flight.source)
        .bind(&flight.device_id)
        .bind(flight.first_fix.as_ref().map(serde_json::to_value).transpose()?)
        .bind(flight.last_fix.as_ref().map(serde_json::to_value).transpose()?)
        .bind(flight.total_points)
        .bind(&flight.flight_state)
        .bind(flight.created_at)
        .execute(&self.pool)
        .await?;

        info!(flight_id = %flight.flight_id, source = %flight.source, "Created flight");
        Ok(())
    }

    pub async fn get_by_flight_id(&self, flight_id: &str) -> Result<Option<Flight>> {
        let flight = sqlx::query_as::<_, Flight>(&format!(
            "SELECT {FLIGHT_COLUMNS} FROM flights WHERE flight_id = $1"
        ))
        .bind(flight_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(flight)
    }

    pub async fn get_by_uuid(&self, id: Uuid) -> Result<Option<Flight>> {
        let flight = sqlx::query_as::<_, Flight>(&format!(
            "SELECT {FLIGHT_COLUMNS} FROM flights WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(flight)
    }

    /// Most recent flight for a (device, race) pair among tracker sources —
    /// the separator's "last known open flight".
    pub async fn latest_for_device(
        &self,
        device_id: &str,
        race_id: &str,
    ) -> Result<Option<Flight>> {
        let flight = sqlx::query_as::<_, Flight>(&format!(
            r#"
            SELECT {FLIGHT_COLUMNS}
            FROM flights
            WHERE device_id = $1 AND race_id = $2
              AND source IN ('tk905b_live', 'flymaster_live')
            ORDER BY created_at DESC
            LIMIT 1
            "#
        ))
        .bind(device_id)
        .bind(race_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(flight)
    }

    /// Which of the given flight ids exist. One set query per batch keeps the
    /// validator off the per-point path.
    pub async fn existing_flight_ids(&self, flight_ids: &[String]) -> Result<HashSet<String>> {
        if flight_ids.is_empty() {
            return Ok(HashSet::new());
        }
        let rows: Vec<String> =
            sqlx::query_scalar("SELECT flight_id FROM flights WHERE flight_id = ANY($1)")
                .bind(flight_ids)
                .fetch_all(&self.pool)
                .await?;
        Ok(rows.into_iter().collect())
    }

    /// Advance the denormalised summary after a successful point insert.
    /// `first_fix` is pinned once; `last_fix` only moves forward, so
    /// out-of-order batches keep `first_fix.datetime <= last_fix.datetime`.
    /// `total_points` drifts upward and is recomputed on demand.
    pub async fn advance_fix_summary(
        &self,
        id: Uuid,
        earliest: &FixSummary,
        latest: &FixSummary,
        added_points: i64,
    ) -> Result<()> {
        let earliest = serde_json::to_value(earliest)?;
        let latest = serde_json::to_value(latest)?;
        sqlx::query(
            r#"
            UPDATE flights
            SET first_fix = COALESCE(first_fix, $2),
                last_fix = CASE
                    WHEN last_fix IS NULL
                      OR (last_fix->>'datetime')::timestamptz <= ($3->>'datetime')::timestamptz
                    THEN $3
                    ELSE last_fix
                END,
                total_points = total_points + $4
            WHERE id = $1
            "#,
        )
        .bind(id)
        .bind(earliest)
        .bind(latest)
        .bind(added_points)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_flight_state(&self, id: Uuid, state: serde_json::Value) -> Result<()> {
        sqlx::query("UPDATE flights SET flight_state = $2 WHERE id = $1")
            .bind(id)
            .bind(state)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_pilot_name(&self, id: Uuid, pilot_name: &str) -> Result<()> {
        sqlx::query("UPDATE flights SET pilot_name = $2 WHERE id = $1")
            .bind(id)
            .bind(pilot_name)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn flights_for_pilot(
        &self,
        race_id: &str,
        pilot_id: &str,
        limit: i64,
    ) -> Result<Vec<PilotFlightRow>> {
        let rows = sqlx::query_as::<_, PilotFlightRow>(
            r#"
            SELECT id, flight_id, source, first_fix, last_fix, total_points, created_at
            FROM flights
            WHERE race_id = $1 AND pilot_id = $2
            ORDER BY created_at DESC
            LIMIT $3
            "#,
        )
        .bind(race_id)
        .bind(pilot_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn race_summary(&self, race_id: &str) -> Result<RaceSummaryRow> {
        let row = sqlx::query_as::<_, RaceSummaryRow>(
            r#"
            SELECT COUNT(*) AS total_flights,
                   COUNT(DISTINCT pilot_id) AS total_pilots,
                   MIN((first_fix->>'datetime')::timestamptz) AS earliest_activity,
                   MAX((last_fix->>'datetime')::timestamptz) AS latest_activity
            FROM flights
            WHERE race_id = $1
            "#,
        )
        .bind(race_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn pilot_activity(&self, race_id: &str, limit: i64) -> Result<Vec<PilotActivityRow>> {
        let rows = sqlx::query_as::<_, PilotActivityRow>(
            r#"
            SELECT pilot_id,
                   MAX(pilot_name) AS pilot_name,
                   COUNT(*) AS flight_count,
                   MAX((last_fix->>'datetime')::timestamptz) AS last_activity
            FROM flights
            WHERE race_id = $1
            GROUP BY pilot_id
            ORDER BY last_activity DESC NULLS LAST
            LIMIT $2
            "#,
        )
        .bind(race_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Live flights older than the cutoff; candidates for the retention
    /// sweep. Points cascade with the flight row.
    pub async fn stale_live_flights(
        &self,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<(Uuid, String)>> {
        let rows: Vec<(Uuid, String)> = sqlx::query_as(
            "SELECT id, flight_id FROM flights WHERE source = 'live' AND created_at < $1",
        )
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn delete_by_uuids(&self, ids: &[Uuid]) -> Result<u64> {
        if ids.is_empty() {
            return Ok(0);
        }
        let result = sqlx::query("DELETE FROM flights WHERE id = ANY($1)")
            .bind(ids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    pub async fn flights_for_pilot_deletion(&self, pilot_id: &str) -> Result<Vec<Uuid>> {
        let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM flights WHERE pilot_id = $1")
            .bind(pilot_id)
            .fetch_all(&self.pool)
            .await?;
        Ok(ids)
    }
}
