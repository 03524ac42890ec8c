// TK103 parenthesised protocol: `(DEVICE_ID,CMD,FIELDS...)`.
//
// Location records combine each coordinate with its hemisphere suffix
// (`4536.0000N`); device ids are 10-20 digit IMEIs.

use chrono::{DateTime, Utc};

use super::watch::parse_device_datetime;

#[derive(Debug, Clone, PartialEq)]
pub struct Tk103Location {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    pub valid: bool,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum Tk103Kind {
    /// `BR00`/`BP00`/`BO01` position report
    Location(Tk103Location),
    /// `BP05` login; acknowledged with `AP05`
    Login,
    /// `BP04` heartbeat; acknowledged with `AP04`
    Heartbeat,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Tk103Frame {
    pub device_id: String,
    pub kind: Tk103Kind,
}

impl Tk103Frame {
    pub fn ack(&self) -> Option<String> {
        match self.kind {
            Tk103Kind::Login => Some(format!("({}AP05)", self.device_id)),
            Tk103Kind::Heartbeat => Some(format!("({}AP04)", self.device_id)),
            _ => None,
        }
    }
}

pub fn parse_frame(raw: &str) -> Option<Tk103Frame> {
    let content = raw.strip_prefix('(')?.strip_suffix(')')?;
    if content.is_empty() {
        return None;
    }

    let parts: Vec<&str> = content.split(',').collect();
    if parts.len() < 2 {
        return None;
    }

    let device_id = parts[0];
    if !(10..=20).contains(&device_id.len()) || !device_id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let kind = match parts[1] {
        "BR00" | "BP00" | "BO01" => Tk103Kind::Location(parse_location(&parts)?),
        "BP05" => Tk103Kind::Login,
        "BP04" => Tk103Kind::Heartbeat,
        other => Tk103Kind::Other(other.to_string()),
    };

    Some(Tk103Frame {
        device_id: device_id.to_string(),
        kind,
    })
}

/// Field layout (after id and command):
/// `...,DDMMYY,A|V,DDMM.MMMM[NS],DDDMM.MMMM[EW],SPEED,HHMMSS,HEADING`
fn parse_location(parts: &[&str]) -> Option<Tk103Location> {
    if parts.len() < 10 {
        return None;
    }

    let date = parts[3];
    let valid = parts[4] == "A";
    let time = parts[8];
    let timestamp = parse_device_datetime(date, time)?;

    let lat = parse_suffixed_coordinate(parts[5], 2, 'N', 'S')?;
    let lon = parse_suffixed_coordinate(parts[6], 3, 'E', 'W')?;
    if !crate::points::coordinates_valid(lat, lon) {
        return None;
    }

    let speed_kmh = parts[7]
        .parse::<f64>()
        .ok()
        .map(|s| s.clamp(0.0, 500.0));
    let heading = parts
        .get(9)
        .and_then(|h| h.parse::<f64>().ok())
        .map(|h| h.rem_euclid(360.0));

    Some(Tk103Location {
        timestamp,
        lat,
        lon,
        valid,
        speed_kmh,
        heading,
    })
}

/// `DDMM.MMMMN` / `DDDMM.MMMMW`: degrees+minutes with a trailing hemisphere.
fn parse_suffixed_coordinate(
    raw: &str,
    deg_digits: usize,
    positive: char,
    negative: char,
) -> Option<f64> {
    let suffix = raw.chars().last()?;
    let value = super::watch::parse_coordinate(&raw[..raw.len() - 1], deg_digits)?;
    if suffix == positive {
        Some(value)
    } else if suffix == negative {
        Some(-value)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const BR00: &str = "(013612345678,BR00,0,150625,A,4536.0000N,01048.0000E,15.0,120000,90)";

    #[test]
    fn test_parse_location() {
        let frame = parse_frame(BR00).unwrap();
        assert_eq!(frame.device_id, "013612345678");

        let Tk103Kind::Location(loc) = frame.kind else {
            panic!("expected location");
        };
        assert_eq!(
            loc.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
        );
        assert!((loc.lat - 45.6).abs() < 1e-9);
        assert!((loc.lon - 10.8).abs() < 1e-9);
        assert!(loc.valid);
        assert_eq!(loc.speed_kmh, Some(15.0));
        assert_eq!(loc.heading, Some(90.0));
    }

    #[test]
    fn test_login_and_heartbeat_acks() {
        let login = parse_frame("(013612345678,BP05)").unwrap();
        assert_eq!(login.kind, Tk103Kind::Login);
        assert_eq!(login.ack().as_deref(), Some("(013612345678AP05)"));

        let heartbeat = parse_frame("(013612345678,BP04)").unwrap();
        assert_eq!(heartbeat.kind, Tk103Kind::Heartbeat);
        assert_eq!(heartbeat.ack().as_deref(), Some("(013612345678AP04)"));

        let location = parse_frame(BR00).unwrap();
        assert_eq!(location.ack(), None);
    }

    #[test]
    fn test_southern_hemisphere() {
        let raw = "(013612345678,BR00,0,150625,A,3354.0000S,07036.0000W,0.0,120000,0)";
        let frame = parse_frame(raw).unwrap();
        let Tk103Kind::Location(loc) = frame.kind else {
            panic!("expected location");
        };
        assert!(loc.lat < 0.0);
        assert!(loc.lon < 0.0);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        // device ids must be 10-20 digit IMEIs
        assert!(parse_frame("(abc,BP05)").is_none());
        assert!(parse_frame("(123,BP05)").is_none());
        // truncated location record
        assert!(parse_frame("(013612345678,BR00,0,150625,A)").is_none());
        // wrong hemisphere letter
        assert!(
            parse_frame("(013612345678,BR00,0,150625,A,4536.0000X,01048.0000E,0,120000,0)")
                .is_none()
        );
    }

    #[test]
    fn test_unknown_command_is_tolerated() {
        let frame = parse_frame("(013612345678,BZ99,1,2,3)").unwrap();
        assert_eq!(frame.kind, Tk103Kind::Other("BZ99".into()));
    }
}
