use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use std::time::Duration;
use tracing::info;

use crate::config::Settings;

/// Primary (writer) and read pools. When no replica is configured the read
/// pool is a clone of the primary — callers never need to know.
#[derive(Clone)]
pub struct DbPools {
    pub primary: PgPool,
    pub read: PgPool,
}

pub async fn connect(settings: &Settings) -> anyhow::Result<DbPools> {
    let primary = pool_for(&settings.database_uri).await?;
    info!("Connected to primary database");

    let read = match &settings.replica_database_uri {
        Some(uri) => {
            let pool = pool_for(uri).await?;
            info!("Connected to read replica");
            pool
        }
        None => primary.clone(),
    };

    Ok(DbPools { primary, read })
}

async fn pool_for(uri: &str) -> anyhow::Result<PgPool> {
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .test_before_acquire(true)
        .connect(uri)
        .await?;
    Ok(pool)
}

/// Classify a store error for the writer retry policy. Connection-level
/// failures (resets, TLS handshakes, timeouts) are worth retrying; anything
/// else is permanent for the current batch.
pub fn is_transient(err: &sqlx::Error) -> bool {
    matches!(
        err,
        sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed
    )
}
