// Watch/TK905B framed protocol.
//
// Frames are bracketed, star-delimited: `[ID*LEN*PAYLOAD]`, with an
// optional leading manufacturer code (`[SG*ID*LEN*PAYLOAD]`). The payload
// is a comma-delimited record whose first token identifies the kind.

use chrono::{DateTime, NaiveDateTime, Utc};

/// A parsed location record from a `UD`/`UD2` payload (or one entry of a
/// `UD3` batch).
#[derive(Debug, Clone, PartialEq)]
pub struct WatchLocation {
    pub timestamp: DateTime<Utc>,
    pub lat: f64,
    pub lon: f64,
    /// A-flag from the device; V-flagged fixes carry no usable position
    pub valid: bool,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
    pub elevation: Option<f64>,
    pub battery: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum WatchKind {
    Location(WatchLocation),
    LocationBatch(Vec<WatchLocation>),
    /// `LK` login/keepalive; must be acknowledged or the device reconnects
    Login,
    Heartbeat,
    Alarm,
    Other(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WatchFrame {
    pub manufacturer: Option<String>,
    pub device_id: String,
    pub kind: WatchKind,
}

impl WatchFrame {
    /// Ack frame echoed back for login/alarm payloads, mirroring the shape
    /// the device used.
    pub fn ack(&self, payload: &str) -> String {
        match &self.manufacturer {
            Some(mfg) => format!("[{}*{}*{:04X}*{}]", mfg, self.device_id, payload.len(), payload),
            None => format!("[{}*{:04X}*{}]", self.device_id, payload.len(), payload),
        }
    }
}

/// Parse one complete bracketed frame.
pub fn parse_frame(raw: &str) -> Option<WatchFrame> {
    let content = raw.strip_prefix('[')?.strip_suffix(']')?;
    if content.is_empty() {
        return None;
    }

    let parts: Vec<&str> = content.split('*').collect();
    // Either ID*LEN*PAYLOAD or MFG*ID*LEN*PAYLOAD
    let (manufacturer, device_id, payload) = match parts.len() {
        3 => (None, parts[0], parts[2].to_string()),
        4.. => (Some(parts[0].to_string()), parts[1], parts[3..].join("*")),
        _ => return None,
    };

    if device_id.is_empty() || !device_id.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }

    let fields: Vec<&str> = payload.split(',').collect();
    let kind = match fields[0] {
        "UD" | "UD2" => WatchKind::Location(parse_location(&fields[1..])?),
        "UD3" => WatchKind::LocationBatch(parse_batch(&fields[1..])?),
        "LK" => WatchKind::Login,
        "HEART" => WatchKind::Heartbeat,
        "AL" => WatchKind::Alarm,
        other => WatchKind::Other(other.to_string()),
    };

    Some(WatchFrame {
        manufacturer,
        device_id: device_id.to_string(),
        kind,
    })
}

/// Location fields after the kind token:
/// `DDMMYY,HHMMSS,A|V,DDMM.MMMM,N|S,DDDMM.MMMM,E|W[,speed,heading,alt,sats,?,battery]`
fn parse_location(fields: &[&str]) -> Option<WatchLocation> {
    if fields.len() < 7 {
        return None;
    }

    let timestamp = parse_device_datetime(fields[0], fields[1])?;
    let valid = fields[2] == "A";

    let lat = parse_coordinate(fields[3], 2)?;
    let lat = match fields[4] {
        "N" => lat,
        "S" => -lat,
        _ => return None,
    };
    let lon = parse_coordinate(fields[5], 3)?;
    let lon = match fields[6] {
        "E" => lon,
        "W" => -lon,
        _ => return None,
    };

    if !crate::points::coordinates_valid(lat, lon) {
        return None;
    }

    let mut location = WatchLocation {
        timestamp,
        lat,
        lon,
        valid,
        speed_kmh: None,
        heading: None,
        elevation: None,
        battery: None,
    };

    // Optional trailing fields; parse failures are ignored, not fatal
    if let Some(speed) = fields.get(7).and_then(|s| s.parse::<f64>().ok()) {
        location.speed_kmh = Some(speed.clamp(0.0, 500.0));
    }
    if let Some(heading) = fields.get(8).and_then(|s| s.parse::<f64>().ok()) {
        location.heading = Some(heading.rem_euclid(360.0));
    }
    if let Some(elevation) = fields.get(9).and_then(|s| s.parse::<f64>().ok()) {
        location.elevation = Some(elevation.clamp(-500.0, 9000.0));
    }
    if let Some(battery) = fields.get(12).and_then(|s| s.parse::<u8>().ok()) {
        location.battery = Some(battery.min(100));
    }

    Some(location)
}

/// `UD3` batch: `COUNT,RECORD;RECORD;...` where each record is a location
/// field list without the kind token.
fn parse_batch(fields: &[&str]) -> Option<Vec<WatchLocation>> {
    if fields.len() < 2 {
        return None;
    }
    let records = fields[1..].join(",");
    let locations: Vec<WatchLocation> = records
        .split(';')
        .filter_map(|record| {
            let record_fields: Vec<&str> = record.split(',').collect();
            parse_location(&record_fields)
        })
        .collect();

    if locations.is_empty() {
        None
    } else {
        Some(locations)
    }
}

/// Device timestamps are `DDMMYY` + `HHMMSS` in UTC.
pub(crate) fn parse_device_datetime(date: &str, time: &str) -> Option<DateTime<Utc>> {
    if date.len() != 6 || time.len() != 6 {
        return None;
    }
    let naive = NaiveDateTime::parse_from_str(&format!("{}{}", date, time), "%d%m%y%H%M%S").ok()?;
    Some(naive.and_utc())
}

/// `DDMM.MMMM`-style coordinate with `deg_digits` degree digits.
pub(crate) fn parse_coordinate(raw: &str, deg_digits: usize) -> Option<f64> {
    // Short longitudes drop the leading zero; fall back to two degree digits
    let deg_digits = if raw.len() > 4 && raw[..deg_digits].chars().all(|c| c.is_ascii_digit()) {
        deg_digits
    } else {
        2
    };
    if raw.len() <= deg_digits {
        return None;
    }
    let degrees: f64 = raw[..deg_digits].parse().ok()?;
    let minutes: f64 = raw[deg_digits..].parse().ok()?;
    Some(degrees + minutes / 60.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    const UD2: &str = "[SG*8800001234*0079*UD2,150625,120000,A,4536.0000,N,01048.0000,E,12.5,90,850,8,80,95]";

    #[test]
    fn test_parse_ud2_location() {
        let frame = parse_frame(UD2).unwrap();
        assert_eq!(frame.manufacturer.as_deref(), Some("SG"));
        assert_eq!(frame.device_id, "8800001234");

        let WatchKind::Location(loc) = frame.kind else {
            panic!("expected location");
        };
        assert_eq!(
            loc.timestamp,
            Utc.with_ymd_and_hms(2025, 6, 15, 12, 0, 0).unwrap()
        );
        assert!((loc.lat - 45.6).abs() < 1e-9);
        assert!((loc.lon - 10.8).abs() < 1e-9);
        assert!(loc.valid);
        assert_eq!(loc.speed_kmh, Some(12.5));
        assert_eq!(loc.heading, Some(90.0));
        assert_eq!(loc.elevation, Some(850.0));
        assert_eq!(loc.battery, Some(95));
    }

    #[test]
    fn test_parse_frame_without_manufacturer() {
        let frame = parse_frame("[8800001234*0002*LK]").unwrap();
        assert_eq!(frame.manufacturer, None);
        assert_eq!(frame.kind, WatchKind::Login);
        assert_eq!(frame.ack("LK"), "[8800001234*0002*LK]");
    }

    #[test]
    fn test_parse_keepalive_and_alarm() {
        let lk = parse_frame("[3G*8800001234*0002*LK]").unwrap();
        assert_eq!(lk.kind, WatchKind::Login);
        assert_eq!(lk.ack("LK"), "[3G*8800001234*0002*LK]");

        let heart = parse_frame("[3G*8800001234*0005*HEART]").unwrap();
        assert_eq!(heart.kind, WatchKind::Heartbeat);

        let al = parse_frame("[3G*8800001234*0002*AL]").unwrap();
        assert_eq!(al.kind, WatchKind::Alarm);
    }

    #[test]
    fn test_parse_ud3_batch() {
        let raw = "[SG*8800001234*00AA*UD3,2,150625,120000,A,4536.0000,N,01048.0000,E,10,0,850;150625,120010,A,4536.0100,N,01048.0100,E,11,5,855]";
        let frame = parse_frame(raw).unwrap();
        let WatchKind::LocationBatch(points) = frame.kind else {
            panic!("expected batch");
        };
        assert_eq!(points.len(), 2);
        assert!(points[1].timestamp > points[0].timestamp);
    }

    #[test]
    fn test_southern_western_hemispheres() {
        let raw = "[SG*8800001234*0040*UD2,150625,120000,A,3354.0000,S,07036.0000,W,0,0,520]";
        let frame = parse_frame(raw).unwrap();
        let WatchKind::Location(loc) = frame.kind else {
            panic!("expected location");
        };
        assert!(loc.lat < 0.0);
        assert!(loc.lon < 0.0);
    }

    #[test]
    fn test_malformed_frames_rejected() {
        assert!(parse_frame("[]").is_none());
        assert!(parse_frame("[SG*notadevice*0002*LK]").is_none());
        assert!(parse_frame("[SG*8800001234*0079*UD2,150625,120000]").is_none());
        assert!(parse_frame("[SG*8800001234*0079*UD2,999999,999999,A,4536.0,N,01048.0,E]").is_none());
        // out-of-range coordinate
        assert!(
            parse_frame("[SG*8800001234*0040*UD2,150625,120000,A,9936.0000,N,01048.0000,E]")
                .is_none()
        );
    }

    #[test]
    fn test_unknown_command_is_tolerated() {
        let frame = parse_frame("[SG*8800001234*0008*BPHRT,120,80]").unwrap();
        assert_eq!(frame.kind, WatchKind::Other("BPHRT".into()));
    }
}
