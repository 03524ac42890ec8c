use std::env;
use std::time::Duration;

/// Process-wide configuration, read once at startup.
///
/// Required variables abort startup when missing; everything tunable has a
/// default that matches production behaviour.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Primary (writer) database
    pub database_uri: String,
    /// Optional read replica; reads fall back to the primary when absent
    pub replica_database_uri: Option<String>,
    pub redis_url: String,
    pub redis_max_connections: u32,

    pub gps_tcp_enabled: bool,
    pub gps_tcp_port: u16,

    /// Offset between a point's timestamp and the earliest tick that may
    /// broadcast it
    pub broadcast_delay: Duration,
    /// Fan-out tick cadence
    pub update_interval: Duration,

    pub rate_limit_messages: usize,
    pub rate_limit_window: Duration,
    pub min_message_interval: Duration,

    pub live_retention_hours: i64,

    pub landing_window_minutes: i64,
    pub landing_speed_kmh: f64,
    pub landing_altitude_variation_m: f64,

    /// Secret for decoding externally-issued tracking tokens
    pub secret_key: String,
}

fn required(name: &str) -> anyhow::Result<String> {
    env::var(name).map_err(|_| anyhow::anyhow!("{} is required", name))
}

fn parsed_or<T: std::str::FromStr>(name: &str, default: T) -> T {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl Settings {
    pub fn from_env() -> anyhow::Result<Self> {
        Ok(Self {
            database_uri: required("DATABASE_URI")?,
            replica_database_uri: env::var("REPLICA_DATABASE_URI")
                .ok()
                .filter(|v| !v.is_empty()),
            redis_url: required("REDIS_URL")?,
            redis_max_connections: parsed_or("REDIS_MAX_CONNECTIONS", 10),
            gps_tcp_enabled: parsed_or("GPS_TCP_ENABLED", true),
            gps_tcp_port: parsed_or("GPS_TCP_PORT", 9090),
            broadcast_delay: Duration::from_secs(parsed_or("BROADCAST_DELAY_SECONDS", 60)),
            update_interval: Duration::from_secs(parsed_or("UPDATE_INTERVAL_SECONDS", 10)),
            rate_limit_messages: parsed_or("RATE_LIMIT_MESSAGES", 20),
            rate_limit_window: Duration::from_secs(parsed_or("RATE_LIMIT_WINDOW_SECONDS", 60)),
            min_message_interval: Duration::from_secs(parsed_or("MIN_MESSAGE_INTERVAL_SECONDS", 2)),
            live_retention_hours: parsed_or("LIVE_RETENTION_HOURS", 48),
            landing_window_minutes: parsed_or("LANDING_WINDOW_MINUTES", 10),
            landing_speed_kmh: parsed_or("LANDING_SPEED_KMH", 5.0),
            landing_altitude_variation_m: parsed_or("LANDING_ALTITUDE_VARIATION_M", 10.0),
            secret_key: required("SECRET_KEY")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parsed_or_defaults() {
        assert_eq!(parsed_or("THERMAL_TEST_UNSET_VAR", 42u16), 42);
        assert_eq!(parsed_or("THERMAL_TEST_UNSET_VAR", 5.0f64), 5.0);
    }
}
