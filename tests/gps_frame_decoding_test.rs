//! End-to-end decoding of GPS tracker byte streams: frames concatenated in
//! one read, split across reads, and interleaved with line noise — the
//! realities of cellular TCP.

use thermal::gps_tcp::{extract_frames, tk103, watch};
use thermal::gps_tcp::{Tk103Kind, WatchKind};

/// A tracker flushing a backlog sends several frames in one segment.
#[test]
fn concatenated_watch_frames_decode_in_order() {
    let mut buffer = String::from(
        "[SG*8800001234*0002*LK]\
         [SG*8800001234*0040*UD2,150625,120000,A,4536.0000,N,01048.0000,E,14,90,850]\
         [SG*8800001234*0040*UD2,150625,120010,A,4536.0100,N,01048.0100,E,15,91,855]",
    );

    let (frames, garbage) = extract_frames(&mut buffer, '[', ']');
    assert!(!garbage);
    assert!(buffer.is_empty());
    assert_eq!(frames.len(), 3);

    let parsed: Vec<_> = frames
        .iter()
        .map(|f| watch::parse_frame(f).expect("frame should parse"))
        .collect();

    assert_eq!(parsed[0].kind, WatchKind::Login);
    let timestamps: Vec<_> = parsed[1..]
        .iter()
        .map(|f| match &f.kind {
            WatchKind::Location(loc) => loc.timestamp,
            other => panic!("expected location, got {:?}", other),
        })
        .collect();
    assert!(timestamps[0] < timestamps[1], "stream order preserved");
}

/// Poor coverage splits a frame across TCP segments; the partial tail waits
/// in the buffer until the rest arrives.
#[test]
fn split_watch_frame_survives_two_reads() {
    let full = "[SG*8800001234*0040*UD2,150625,120000,A,4536.0000,N,01048.0000,E,14,90,850]";
    let (first_half, second_half) = full.split_at(30);

    let mut buffer = String::from(first_half);
    let (frames, _) = extract_frames(&mut buffer, '[', ']');
    assert!(frames.is_empty());
    assert_eq!(buffer, first_half);

    buffer.push_str(second_half);
    let (frames, _) = extract_frames(&mut buffer, '[', ']');
    assert_eq!(frames.len(), 1);
    assert!(matches!(
        watch::parse_frame(&frames[0]).unwrap().kind,
        WatchKind::Location(_)
    ));
}

/// Modem chatter between frames is discarded without losing the frames.
#[test]
fn garbage_between_frames_is_skipped() {
    let mut buffer = String::from("\r\nAT+OK\r\n[SG*8800001234*0002*LK]junk[SG*8800001234*0005*HEART]");
    let (frames, garbage) = extract_frames(&mut buffer, '[', ']');

    assert!(garbage);
    assert_eq!(frames.len(), 2);
    assert_eq!(
        watch::parse_frame(&frames[0]).unwrap().kind,
        WatchKind::Login
    );
    assert_eq!(
        watch::parse_frame(&frames[1]).unwrap().kind,
        WatchKind::Heartbeat
    );
}

/// TK103 session: login, location, heartbeat, each with the expected ack.
#[test]
fn tk103_session_round_trip() {
    let mut buffer = String::from(
        "(013612345678,BP05)\
         (013612345678,BR00,0,150625,A,4536.0000N,01048.0000E,22.0,120000,180)\
         (013612345678,BP04)",
    );

    let (frames, garbage) = extract_frames(&mut buffer, '(', ')');
    assert!(!garbage);
    assert_eq!(frames.len(), 3);

    let login = tk103::parse_frame(&frames[0]).unwrap();
    assert_eq!(login.kind, Tk103Kind::Login);
    assert_eq!(login.ack().as_deref(), Some("(013612345678AP05)"));

    let location = tk103::parse_frame(&frames[1]).unwrap();
    let Tk103Kind::Location(loc) = &location.kind else {
        panic!("expected location");
    };
    assert!(loc.valid);
    assert_eq!(loc.speed_kmh, Some(22.0));
    assert_eq!(location.ack(), None);

    let heartbeat = tk103::parse_frame(&frames[2]).unwrap();
    assert_eq!(heartbeat.ack().as_deref(), Some("(013612345678AP04)"));
}

/// A UD3 backlog batch expands into multiple ordered locations.
#[test]
fn watch_batch_expands_to_ordered_locations() {
    let raw = "[SG*8800001234*00AA*UD3,3,\
               150625,120000,A,4536.0000,N,01048.0000,E,10,0,850;\
               150625,120010,A,4536.0100,N,01048.0100,E,11,5,855;\
               150625,120020,A,4536.0200,N,01048.0200,E,12,10,860]";

    let frame = watch::parse_frame(raw).unwrap();
    let WatchKind::LocationBatch(points) = frame.kind else {
        panic!("expected batch");
    };
    assert_eq!(points.len(), 3);
    assert!(points.windows(2).all(|w| w[0].timestamp < w[1].timestamp));
    assert!(points.iter().all(|p| p.valid));
}
