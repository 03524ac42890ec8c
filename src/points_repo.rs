use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

use crate::points::TrackPoint;
use crate::queue::QueueName;

/// Destination table for a queue family. Tracker and mobile live points
/// share the live table; post-flight uploads are persistent.
fn table_for(queue: QueueName) -> &'static str {
    match queue {
        QueueName::LivePoints | QueueName::FlymasterPoints | QueueName::ScoringPoints => {
            "live_track_points"
        }
        QueueName::UploadPoints => "uploaded_track_points",
    }
}

/// Newest delayed position of one pilot at a tick cutoff.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct PilotPosition {
    pub pilot_id: String,
    pub pilot_name: String,
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub datetime: DateTime<Utc>,
}

#[derive(Clone)]
pub struct PointsRepository {
    pool: PgPool,
}

impl PointsRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Idempotent bulk insert. Rows violating the
    /// `(flight_id, datetime, lat, lon)` uniqueness constraint are ignored,
    /// so concurrent writers inserting overlapping batches converge.
    pub async fn insert_batch(&self, queue: QueueName, points: &[TrackPoint]) -> Result<u64> {
        if points.is_empty() {
            return Ok(0);
        }

        let mut flight_ids = Vec::with_capacity(points.len());
        let mut flight_uuids = Vec::with_capacity(points.len());
        let mut lats = Vec::with_capacity(points.len());
        let mut lons = Vec::with_capacity(points.len());
        let mut elevations: Vec<Option<f64>> = Vec::with_capacity(points.len());
        let mut datetimes = Vec::with_capacity(points.len());

        for p in points {
            flight_ids.push(p.flight_id.clone());
            flight_uuids.push(p.flight_uuid);
            lats.push(p.lat);
            lons.push(p.lon);
            elevations.push(p.elevation);
            datetimes.push(p.datetime);
        }

        let sql = format!(
            r#"
            INSERT INTO {} (flight_id, flight_uuid, lat, lon, elevation, datetime)
            SELECT * FROM UNNEST(
                $1::text[], $2::uuid[], $3::float8[], $4::float8[], $5::float8[], $6::timestamptz[]
            )
            ON CONFLICT (flight_id, datetime, lat, lon) DO NOTHING
            "#,
            table_for(queue)
        );

        let result = sqlx::query(&sql)
            .bind(&flight_ids)
            .bind(&flight_uuids)
            .bind(&lats)
            .bind(&lons)
            .bind(&elevations)
            .bind(&datetimes)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    pub async fn count_for_flight(&self, queue: QueueName, flight_uuid: Uuid) -> Result<i64> {
        let sql = format!(
            "SELECT COUNT(*) FROM {} WHERE flight_uuid = $1",
            table_for(queue)
        );
        let count: i64 = sqlx::query_scalar(&sql)
            .bind(flight_uuid)
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Newest position per pilot at or before `cutoff` (the tick boundary
    /// minus the broadcast delay). Pilots silent for more than 30 minutes at
    /// the cutoff drop out of the delta.
    pub async fn delayed_positions(
        &self,
        race_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<PilotPosition>> {
        let rows = sqlx::query_as::<_, PilotPosition>(
            r#"
            SELECT DISTINCT ON (f.pilot_id)
                   f.pilot_id,
                   f.pilot_name,
                   p.lat,
                   p.lon,
                   p.elevation,
                   p.datetime
            FROM flights f
            JOIN live_track_points p ON p.flight_uuid = f.id
            WHERE f.race_id = $1
              AND p.datetime <= $2
              AND p.datetime > $2 - INTERVAL '30 minutes'
            ORDER BY f.pilot_id, p.datetime DESC
            "#,
        )
        .bind(race_id)
        .bind(cutoff)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    /// Render one Web-Mercator vector tile with `positions` and `paths`
    /// layers, delayed to `cutoff`. The store does the MVT encoding.
    pub async fn render_tile(
        &self,
        race_id: &str,
        z: i32,
        x: i32,
        y: i32,
        cutoff: DateTime<Utc>,
    ) -> Result<Option<Vec<u8>>> {
        let mvt: Option<Vec<u8>> = sqlx::query_scalar(
            r#"
            WITH delayed AS (
                SELECT DISTINCT ON (f.pilot_id)
                       f.pilot_id, f.pilot_name, p.lat, p.lon, p.elevation, p.datetime
                FROM flights f
                JOIN live_track_points p ON p.flight_uuid = f.id
                WHERE f.race_id = $1
                  AND p.datetime <= $5
                  AND p.datetime > $5 - INTERVAL '30 minutes'
                ORDER BY f.pilot_id, p.datetime DESC
            ),
            trail AS (
                SELECT f.pilot_id,
                       ST_MakeLine(
                           ST_Transform(ST_SetSRID(ST_MakePoint(p.lon, p.lat), 4326), 3857)
                           ORDER BY p.datetime
                       ) AS geom
                FROM flights f
                JOIN live_track_points p ON p.flight_uuid = f.id
                WHERE f.race_id = $1
                  AND p.datetime <= $5
                  AND p.datetime > $5 - INTERVAL '30 minutes'
                GROUP BY f.pilot_id
            ),
            position_features AS (
                SELECT d.pilot_id, d.pilot_name, d.elevation,
                       to_char(d.datetime, 'YYYY-MM-DD"T"HH24:MI:SS"Z"') AS datetime,
                       ST_AsMVTGeom(
                           ST_Transform(ST_SetSRID(ST_MakePoint(d.lon, d.lat), 4326), 3857),
                           ST_TileEnvelope($2, $3, $4), 4096, 256, true
                       ) AS geom
                FROM delayed d
            ),
            path_features AS (
                SELECT t.pilot_id,
                       ST_AsMVTGeom(t.geom, ST_TileEnvelope($2, $3, $4), 4096, 256, true) AS geom
                FROM trail t
            )
            SELECT COALESCE(
                (SELECT ST_AsMVT(pf.*, 'positions', 4096, 'geom')
                 FROM position_features pf WHERE pf.geom IS NOT NULL),
                ''::bytea
            ) ||
            COALESCE(
                (SELECT ST_AsMVT(pathf.*, 'paths', 4096, 'geom')
                 FROM path_features pathf WHERE pathf.geom IS NOT NULL),
                ''::bytea
            )
            "#,
        )
        .bind(race_id)
        .bind(z)
        .bind(x)
        .bind(y)
        .bind(cutoff)
        .fetch_optional(&self.pool)
        .await?;

        Ok(mvt.filter(|bytes| !bytes.is_empty()))
    }

    pub async fn delete_for_flights(&self, queue: QueueName, flight_uuids: &[Uuid]) -> Result<u64> {
        if flight_uuids.is_empty() {
            return Ok(0);
        }
        let sql = format!(
            "DELETE FROM {} WHERE flight_uuid = ANY($1)",
            table_for(queue)
        );
        let result = sqlx::query(&sql)
            .bind(flight_uuids)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}
