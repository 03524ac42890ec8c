use anyhow::Result;
use chrono::{DateTime, Utc};
use sqlx::{FromRow, PgPool};
use uuid::Uuid;

/// Binding of a physical tracker to a pilot for one race. Devices are
/// registered out of band; the TCP front-end only reads.
#[derive(Debug, Clone, FromRow)]
pub struct DeviceRegistration {
    pub id: Uuid,
    pub serial_number: String,
    pub race_id: String,
    pub pilot_id: String,
    pub pilot_name: String,
    pub device_type: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone)]
pub struct DevicesRepository {
    pool: PgPool,
}

impl DevicesRepository {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The active registration for a device serial, if any. A device has at
    /// most one active registration at a time.
    pub async fn active_registration(
        &self,
        serial_number: &str,
    ) -> Result<Option<DeviceRegistration>> {
        let registration = sqlx::query_as::<_, DeviceRegistration>(
            r#"
            SELECT id, serial_number, race_id, pilot_id, pilot_name, device_type,
                   is_active, created_at
            FROM device_registrations
            WHERE serial_number = $1 AND is_active = TRUE
            ORDER BY created_at DESC
            LIMIT 1
            "#,
        )
        .bind(serial_number)
        .fetch_optional(&self.pool)
        .await?;
        Ok(registration)
    }
}
