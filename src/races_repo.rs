use anyhow::Result;
use chrono::NaiveDate;
use sqlx::PgPool;
use uuid::Uuid;

use crate::races::Race;

/// Race descriptor as carried in a tracking token; used to lazily create the
/// race row on first ingest.
#[derive(Debug, Clone)]
pub struct NewRace {
    pub race_id: String,
    pub name: String,
    pub date: NaiveDate,
    pub end_date: NaiveDate,
    pub timezone: String,
    pub location: String,
}

#[derive(Clone)]
pub struct RacesRepository {
    pool: PgPool,
}

impl RacesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    pub async fn get(&self, race_id: &str) -> Result<Option<Race>> {
        let race = sqlx::query_as::<_, Race>(
            r#"
            SELECT id, race_id, name, date, end_date, timezone, location, created_at
            FROM races
            WHERE race_id = $1
            "#,
        )
        .bind(race_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(race)
    }

    /// Idempotent create-on-first-ingest. Concurrent callers converge on the
    /// row that won the insert.
    pub async fn get_or_create(&self, new: &NewRace) -> Result<Race> {
        sqlx::query(
            r#"
            INSERT INTO races (id, race_id, name, date, end_date, timezone, location, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, NOW())
            ON CONFLICT (race_id) DO NOTHING
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&new.race_id)
        .bind(&new.name)
        .bind(new.date)
        .bind(new.end_date)
        .bind(&new.timezone)
        .bind(&new.location)
        .execute(&self.pool)
        .await?;

        self.get(&new.race_id)
            .await?
            .ok_or_else(|| anyhow::anyhow!("race {} vanished after upsert", new.race_id))
    }

    pub async fn timezone(&self, race_id: &str) -> Result<Option<String>> {
        let tz: Option<String> =
            sqlx::query_scalar("SELECT timezone FROM races WHERE race_id = $1")
                .bind(race_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(tz)
    }
}
