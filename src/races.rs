use chrono::{DateTime, NaiveDate, Utc};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use tracing::warn;
use uuid::Uuid;

/// Immutable race descriptor. Owns many flights.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Race {
    pub id: Uuid,
    /// Stable external identifier carried in tracking tokens
    pub race_id: String,
    pub name: String,
    pub date: NaiveDate,
    pub end_date: NaiveDate,
    /// IANA timezone name, e.g. "Europe/Rome"
    pub timezone: String,
    pub location: String,
    pub created_at: DateTime<Utc>,
}

impl Race {
    /// Parse the race timezone, falling back to UTC when the stored name is
    /// missing or invalid.
    pub fn tz(&self) -> Tz {
        parse_timezone(&self.timezone)
    }
}

pub fn parse_timezone(name: &str) -> Tz {
    match name.parse::<Tz>() {
        Ok(tz) => tz,
        Err(_) => {
            warn!(timezone = %name, "open_question: race timezone missing or invalid, using UTC");
            chrono_tz::UTC
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timezone_valid() {
        assert_eq!(parse_timezone("Europe/Rome"), chrono_tz::Europe::Rome);
    }

    #[test]
    fn test_parse_timezone_invalid_falls_back_to_utc() {
        assert_eq!(parse_timezone("Mars/Olympus_Mons"), chrono_tz::UTC);
        assert_eq!(parse_timezone(""), chrono_tz::UTC);
    }
}
