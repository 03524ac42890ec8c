// GPS tracker TCP front-end.
//
// One port, two protocols detected by first byte: `[` for the Watch/TK905B
// framed protocol, `(` for TK103. Cellular trackers reconnect constantly and
// split or concatenate frames arbitrarily, so the framing layer tolerates
// both and reconnections are deliberately not rate-limited.

pub mod tk103;
pub mod watch;

pub use tk103::{Tk103Frame, Tk103Kind};
pub use watch::{WatchFrame, WatchKind, WatchLocation};

use anyhow::Result;
use chrono::{DateTime, Utc};
use moka::future::Cache;
use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{watch as tokio_watch, Mutex};
use tracing::{debug, error, info, warn};

use crate::devices_repo::{DeviceRegistration, DevicesRepository};
use crate::flight_separator::{FlightSeparator, TrackerPoint};
use crate::flights_repo::FlightsRepository;
use crate::point_processor::write_points_direct;
use crate::points::TrackPoint;
use crate::points_repo::PointsRepository;
use crate::queue::{QueueError, QueueItem, QueueName, RedisQueue};
use crate::races::Race;
use crate::races_repo::RacesRepository;

const MAX_CONNECTIONS: usize = 1_000;
const MAX_CONNECTIONS_PER_IP: usize = 50;
const CONNECTION_IDLE_TIMEOUT: Duration = Duration::from_secs(300);
const MAX_BUFFER_SIZE: usize = 8_192;
/// Consecutive malformed frames tolerated before the connection closes
const MAX_MALFORMED_FRAMES: u32 = 5;
/// Malformed reads tolerated before protocol detection gives up
const MAX_PREDETECT_GARBAGE: u32 = 3;
/// Reconnection tolerance window: trackers on poor coverage reconnect often
const RECONNECT_WINDOW: Duration = Duration::from_secs(300);
const MAX_RECONNECTS_PER_WINDOW: usize = 100;
/// Above this many new connections in one second an IP is abusive
const ABUSE_CONNS_PER_SECOND: usize = 10;
const BLACKLIST_DURATION: Duration = Duration::from_secs(60);

/// Per-connection protocol, fixed by the first byte received.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Protocol {
    Watch,
    Tk103,
}

/// Connection lifecycle per the front-end state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    AwaitingLogin,
    Active,
    Idle,
    Closing,
}

/// Per-device frame rate policy: a minimum interval between frames plus a
/// rolling window cap. Violations drop the frame silently; flaky devices
/// must not be punished with disconnects.
pub struct RateLimiter {
    min_interval: Duration,
    window: Duration,
    max_in_window: usize,
    last_frame: HashMap<String, Instant>,
    frames: HashMap<String, VecDeque<Instant>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateVerdict {
    Allowed,
    TooFrequent,
    WindowExceeded,
}

impl RateLimiter {
    pub fn new(min_interval: Duration, window: Duration, max_in_window: usize) -> Self {
        Self {
            min_interval,
            window,
            max_in_window,
            last_frame: HashMap::new(),
            frames: HashMap::new(),
        }
    }

    pub fn check(&mut self, device_id: &str, now: Instant) -> RateVerdict {
        if let Some(last) = self.last_frame.get(device_id) {
            if now.duration_since(*last) < self.min_interval {
                return RateVerdict::TooFrequent;
            }
        }

        let frames = self.frames.entry(device_id.to_string()).or_default();
        while let Some(front) = frames.front() {
            if now.duration_since(*front) > self.window {
                frames.pop_front();
            } else {
                break;
            }
        }
        if frames.len() >= self.max_in_window {
            return RateVerdict::WindowExceeded;
        }

        frames.push_back(now);
        self.last_frame.insert(device_id.to_string(), now);
        RateVerdict::Allowed
    }

    pub fn forget(&mut self, device_id: &str) {
        self.last_frame.remove(device_id);
        self.frames.remove(device_id);
    }
}

/// Per-source-IP connection accounting and abuse detection. Loopback is
/// exempt so health checks never end up blacklisted.
pub struct ConnectionTracker {
    by_ip: HashMap<IpAddr, usize>,
    attempts: HashMap<IpAddr, VecDeque<Instant>>,
    blacklist: HashMap<IpAddr, Instant>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectVerdict {
    Allowed,
    Blacklisted,
    TooManyConnections,
    ReconnectLimit,
}

impl ConnectionTracker {
    pub fn new() -> Self {
        Self {
            by_ip: HashMap::new(),
            attempts: HashMap::new(),
            blacklist: HashMap::new(),
        }
    }

    pub fn can_connect(&mut self, ip: IpAddr, now: Instant) -> ConnectVerdict {
        if ip.is_loopback() {
            return ConnectVerdict::Allowed;
        }

        if let Some(until) = self.blacklist.get(&ip) {
            if now < *until {
                return ConnectVerdict::Blacklisted;
            }
            self.blacklist.remove(&ip);
        }

        if self.by_ip.get(&ip).copied().unwrap_or(0) >= MAX_CONNECTIONS_PER_IP {
            return ConnectVerdict::TooManyConnections;
        }

        let attempts = self.attempts.entry(ip).or_default();
        while let Some(front) = attempts.front() {
            if now.duration_since(*front) > RECONNECT_WINDOW {
                attempts.pop_front();
            } else {
                break;
            }
        }

        let last_second = attempts
            .iter()
            .rev()
            .take_while(|t| now.duration_since(**t) <= Duration::from_secs(1))
            .count();
        if last_second > ABUSE_CONNS_PER_SECOND {
            warn!(%ip, "Rapid reconnection burst, blacklisting for 60s");
            self.blacklist.insert(ip, now + BLACKLIST_DURATION);
            return ConnectVerdict::Blacklisted;
        }

        if attempts.len() >= MAX_RECONNECTS_PER_WINDOW {
            return ConnectVerdict::ReconnectLimit;
        }

        ConnectVerdict::Allowed
    }

    pub fn add(&mut self, ip: IpAddr, now: Instant) {
        *self.by_ip.entry(ip).or_insert(0) += 1;
        self.attempts.entry(ip).or_default().push_back(now);
    }

    pub fn remove(&mut self, ip: IpAddr) {
        if let Some(count) = self.by_ip.get_mut(&ip) {
            *count = count.saturating_sub(1);
            if *count == 0 {
                self.by_ip.remove(&ip);
            }
        }
    }
}

impl Default for ConnectionTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Pull complete delimited frames out of the connection buffer, leaving any
/// trailing partial frame in place. Garbage before an opening delimiter is
/// discarded and reported so malformed counting can react.
pub fn extract_frames(buffer: &mut String, open: char, close: char) -> (Vec<String>, bool) {
    let mut frames = Vec::new();
    let mut garbage = false;

    loop {
        let Some(start) = buffer.find(open) else {
            garbage |= !buffer.is_empty();
            buffer.clear();
            break;
        };
        if start > 0 {
            garbage = true;
            buffer.drain(..start);
        }
        let Some(end) = buffer.find(close) else {
            break;
        };
        let frame: String = buffer.drain(..=end).collect();
        frames.push(frame);
    }

    (frames, garbage)
}

/// A location normalized out of either protocol.
#[derive(Debug, Clone)]
pub struct NormalizedFix {
    pub lat: f64,
    pub lon: f64,
    pub elevation: Option<f64>,
    pub timestamp: DateTime<Utc>,
    pub speed_kmh: Option<f64>,
    pub heading: Option<f64>,
    pub battery: Option<u8>,
}

/// Turns normalized fixes into queued live points: registration lookup,
/// flight separation, enqueue at priority 1 with a direct-write fallback.
#[derive(Clone)]
pub struct GpsPipeline {
    queue: RedisQueue,
    separator: FlightSeparator,
    races_repo: RacesRepository,
    devices_repo: DevicesRepository,
    points_repo: PointsRepository,
    flights_repo: FlightsRepository,
    registrations: Cache<String, Option<DeviceRegistration>>,
    races: Cache<String, Race>,
}

impl GpsPipeline {
    pub fn new(
        queue: RedisQueue,
        separator: FlightSeparator,
        races_repo: RacesRepository,
        devices_repo: DevicesRepository,
        points_repo: PointsRepository,
        flights_repo: FlightsRepository,
    ) -> Self {
        Self {
            queue,
            separator,
            races_repo,
            devices_repo,
            points_repo,
            flights_repo,
            registrations: Cache::builder()
                .max_capacity(10_000)
                .time_to_live(Duration::from_secs(300))
                .build(),
            races: Cache::builder()
                .max_capacity(1_000)
                .time_to_live(Duration::from_secs(600))
                .build(),
        }
    }

    pub async fn registration(&self, serial: &str) -> Option<DeviceRegistration> {
        if let Some(cached) = self.registrations.get(serial).await {
            return cached;
        }
        let looked_up = self
            .devices_repo
            .active_registration(serial)
            .await
            .unwrap_or_else(|e| {
                warn!(serial, error = %e, "Device registration lookup failed");
                None
            });
        self.registrations
            .insert(serial.to_string(), looked_up.clone())
            .await;
        looked_up
    }

    async fn race(&self, race_id: &str) -> Option<Race> {
        if let Some(cached) = self.races.get(race_id).await {
            return Some(cached);
        }
        match self.races_repo.get(race_id).await {
            Ok(Some(race)) => {
                self.races.insert(race_id.to_string(), race.clone()).await;
                Some(race)
            }
            Ok(None) => None,
            Err(e) => {
                warn!(race_id, error = %e, "Race lookup failed");
                None
            }
        }
    }

    /// Ingest a device's location fixes in order. Returns how many points
    /// were accepted.
    pub async fn ingest(&self, serial: &str, fixes: Vec<NormalizedFix>) -> Result<usize> {
        let Some(registration) = self.registration(serial).await else {
            debug!(serial, "Dropping fixes from unregistered device");
            metrics::counter!("gps.unregistered_fixes_total").increment(fixes.len() as u64);
            return Ok(0);
        };
        let Some(race) = self.race(&registration.race_id).await else {
            warn!(serial, race_id = %registration.race_id, "Race missing for registered device");
            return Ok(0);
        };

        let source = crate::flights::FlightSource::Tk905bLive;
        // Group consecutive points by resolved flight so one queue item
        // never spans a separation boundary
        let mut batches: Vec<(uuid::Uuid, String, Vec<TrackPoint>)> = Vec::new();

        for fix in fixes {
            let tracker_point = TrackerPoint {
                lat: fix.lat,
                lon: fix.lon,
                elevation: fix.elevation,
                timestamp: fix.timestamp,
                speed_kmh: fix.speed_kmh,
            };
            let resolved = self
                .separator
                .resolve(
                    source,
                    &registration.pilot_id,
                    &registration.pilot_name,
                    &race,
                    serial,
                    &tracker_point,
                )
                .await?;

            let point = TrackPoint {
                flight_id: resolved.flight_id.clone(),
                flight_uuid: resolved.flight_uuid,
                lat: fix.lat,
                lon: fix.lon,
                elevation: fix.elevation,
                datetime: fix.timestamp,
            };

            match batches.last_mut() {
                Some((uuid, _, points)) if *uuid == resolved.flight_uuid => points.push(point),
                _ => batches.push((resolved.flight_uuid, resolved.flight_id, vec![point])),
            }
        }

        let mut accepted = 0;
        for (flight_uuid, flight_id, points) in batches {
            accepted += points.len();
            let item = QueueItem::new(QueueName::LivePoints, flight_id, points);
            match self.queue.enqueue(QueueName::LivePoints, &item).await {
                Ok(()) => {}
                Err(QueueError::Unavailable(e)) => {
                    warn!(error = %e, "Queue unavailable, writing GPS points directly");
                    write_points_direct(
                        &self.points_repo,
                        &self.flights_repo,
                        QueueName::LivePoints,
                        flight_uuid,
                        &item,
                    )
                    .await?;
                    metrics::counter!("gps.direct_writes_total").increment(item.count as u64);
                }
                Err(e) => return Err(e.into()),
            }
        }

        metrics::counter!("gps.points_ingested_total").increment(accepted as u64);
        Ok(accepted)
    }
}

pub struct GpsTcpServer {
    pipeline: Arc<GpsPipeline>,
    tracker: Arc<Mutex<ConnectionTracker>>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    active: Arc<AtomicUsize>,
}

impl GpsTcpServer {
    pub fn new(pipeline: GpsPipeline, settings: &crate::config::Settings) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            tracker: Arc::new(Mutex::new(ConnectionTracker::new())),
            rate_limiter: Arc::new(Mutex::new(RateLimiter::new(
                settings.min_message_interval,
                settings.rate_limit_window,
                settings.rate_limit_messages,
            ))),
            active: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Accept loop. Closes the listening socket as soon as shutdown fires;
    /// per-connection tasks drain on their own shutdown signal.
    pub async fn run(
        &self,
        port: u16,
        shutdown: tokio_watch::Receiver<bool>,
    ) -> Result<()> {
        let listener = TcpListener::bind(("0.0.0.0", port)).await?;
        info!(port, "GPS TCP server listening");

        let mut accept_shutdown = shutdown.clone();
        loop {
            tokio::select! {
                accepted = listener.accept() => {
                    let (stream, peer) = match accepted {
                        Ok(pair) => pair,
                        Err(e) => {
                            error!(error = %e, "Accept failed");
                            metrics::counter!("gps.accept_errors_total").increment(1);
                            continue;
                        }
                    };
                    self.dispatch(stream, peer.ip(), shutdown.clone()).await;
                }
                _ = accept_shutdown.changed() => {
                    if *accept_shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("GPS TCP accept loop stopped");
        Ok(())
    }

    async fn dispatch(
        &self,
        stream: TcpStream,
        ip: IpAddr,
        shutdown: tokio_watch::Receiver<bool>,
    ) {
        if self.active.load(Ordering::Relaxed) >= MAX_CONNECTIONS {
            warn!(%ip, "Connection limit reached, rejecting");
            return;
        }

        let verdict = {
            let mut tracker = self.tracker.lock().await;
            let verdict = tracker.can_connect(ip, Instant::now());
            if verdict == ConnectVerdict::Allowed {
                tracker.add(ip, Instant::now());
            }
            verdict
        };
        if verdict != ConnectVerdict::Allowed {
            debug!(%ip, ?verdict, "Connection rejected");
            metrics::counter!("gps.connections_rejected_total").increment(1);
            return;
        }

        self.active.fetch_add(1, Ordering::Relaxed);
        metrics::gauge!("gps.connections_active").increment(1.0);

        let pipeline = Arc::clone(&self.pipeline);
        let tracker = Arc::clone(&self.tracker);
        let rate_limiter = Arc::clone(&self.rate_limiter);
        let active = Arc::clone(&self.active);

        tokio::spawn(async move {
            if let Err(e) = handle_connection(stream, pipeline, rate_limiter, shutdown).await {
                debug!(%ip, error = %e, "Connection ended with error");
            }
            tracker.lock().await.remove(ip);
            active.fetch_sub(1, Ordering::Relaxed);
            metrics::gauge!("gps.connections_active").decrement(1.0);
        });
    }
}

async fn handle_connection(
    mut stream: TcpStream,
    pipeline: Arc<GpsPipeline>,
    rate_limiter: Arc<Mutex<RateLimiter>>,
    mut shutdown: tokio_watch::Receiver<bool>,
) -> Result<()> {
    let mut buffer = String::new();
    let mut chunk = [0u8; 2048];
    let mut protocol: Option<Protocol> = None;
    let mut state = ConnState::AwaitingLogin;
    let mut consecutive_malformed = 0u32;
    let mut predetect_garbage = 0u32;
    let mut device_id: Option<String> = None;
    let mut last_frame_at = Instant::now();

    while state != ConnState::Closing {
        // Short read timeout so the idle transition fires without a frame
        let read = tokio::select! {
            read = tokio::time::timeout(Duration::from_secs(2), stream.read(&mut chunk)) => {
                match read {
                    Ok(Ok(0)) => break,
                    Ok(Ok(n)) => n,
                    Ok(Err(e)) => return Err(e.into()),
                    Err(_) => {
                        let quiet = last_frame_at.elapsed();
                        if quiet > CONNECTION_IDLE_TIMEOUT {
                            debug!("Connection idle past 5 minutes, closing");
                            break;
                        }
                        if state == ConnState::Active {
                            state = ConnState::Idle;
                        }
                        continue;
                    }
                }
            }
            _ = shutdown.changed() => {
                state = ConnState::Closing;
                continue;
            }
        };

        buffer.push_str(&String::from_utf8_lossy(&chunk[..read]));
        if buffer.len() > MAX_BUFFER_SIZE {
            warn!("Connection buffer overflow, closing");
            break;
        }

        // The first byte locks the protocol for this connection
        if protocol.is_none() {
            let Some(first) = buffer.trim_start().chars().next() else {
                continue;
            };
            protocol = match first {
                '[' => Some(Protocol::Watch),
                '(' => Some(Protocol::Tk103),
                _ => {
                    predetect_garbage += 1;
                    buffer.clear();
                    if predetect_garbage >= MAX_PREDETECT_GARBAGE {
                        debug!("No recognizable protocol, dropping connection");
                        break;
                    }
                    continue;
                }
            };
        }

        let (open, close) = match protocol {
            Some(Protocol::Watch) => ('[', ']'),
            Some(Protocol::Tk103) => ('(', ')'),
            None => continue,
        };
        let (frames, garbage) = extract_frames(&mut buffer, open, close);
        if garbage {
            consecutive_malformed += 1;
        }

        for raw in frames {
            let outcome = match protocol {
                Some(Protocol::Watch) => {
                    handle_watch_frame(&raw, &mut stream, &pipeline, &rate_limiter, &mut state)
                        .await
                }
                Some(Protocol::Tk103) => {
                    handle_tk103_frame(&raw, &mut stream, &pipeline, &rate_limiter, &mut state)
                        .await
                }
                None => FrameOutcome::Malformed,
            };

            match outcome {
                FrameOutcome::Ok(id) => {
                    consecutive_malformed = 0;
                    device_id.get_or_insert(id);
                    last_frame_at = Instant::now();
                    // Any frame wakes an idle connection
                    if state == ConnState::Idle {
                        state = ConnState::Active;
                    }
                }
                FrameOutcome::Dropped => {
                    consecutive_malformed = 0;
                    last_frame_at = Instant::now();
                }
                FrameOutcome::Malformed => {
                    consecutive_malformed += 1;
                    metrics::counter!("gps.malformed_frames_total").increment(1);
                }
            }

            if consecutive_malformed >= MAX_MALFORMED_FRAMES {
                warn!("Too many consecutive malformed frames, closing connection");
                state = ConnState::Closing;
                break;
            }
        }
    }

    if let Some(id) = device_id {
        rate_limiter.lock().await.forget(&id);
    }
    Ok(())
}

enum FrameOutcome {
    /// Well-formed frame from this device id
    Ok(String),
    /// Well-formed but rate-limited; dropped silently
    Dropped,
    Malformed,
}

async fn handle_watch_frame(
    raw: &str,
    stream: &mut TcpStream,
    pipeline: &GpsPipeline,
    rate_limiter: &Mutex<RateLimiter>,
    state: &mut ConnState,
) -> FrameOutcome {
    let Some(frame) = watch::parse_frame(raw) else {
        return FrameOutcome::Malformed;
    };

    if rate_limiter.lock().await.check(&frame.device_id, Instant::now()) != RateVerdict::Allowed {
        return FrameOutcome::Dropped;
    }

    let known = pipeline.registration(&frame.device_id).await.is_some();
    let device_id = frame.device_id.clone();

    match &frame.kind {
        WatchKind::Login => {
            if known && *state == ConnState::AwaitingLogin {
                *state = ConnState::Active;
                debug!(device_id, "Watch device logged in");
            }
            let _ = stream.write_all(frame.ack("LK").as_bytes()).await;
        }
        WatchKind::Heartbeat => {}
        WatchKind::Alarm => {
            let _ = stream.write_all(frame.ack("AL").as_bytes()).await;
        }
        WatchKind::Location(loc) => {
            if known {
                // Coverage gaps mean many trackers resume with a location
                // before re-sending LK; treat that as an implicit login
                *state = ConnState::Active;
                ingest_watch_locations(pipeline, &device_id, std::slice::from_ref(loc)).await;
            }
        }
        WatchKind::LocationBatch(locs) => {
            if known {
                *state = ConnState::Active;
                ingest_watch_locations(pipeline, &device_id, locs).await;
            }
        }
        WatchKind::Other(command) => {
            debug!(device_id, command, "Ignoring unknown watch command");
        }
    }

    FrameOutcome::Ok(device_id)
}

async fn ingest_watch_locations(pipeline: &GpsPipeline, device_id: &str, locs: &[WatchLocation]) {
    let fixes: Vec<NormalizedFix> = locs
        .iter()
        .filter(|l| l.valid)
        .map(|l| NormalizedFix {
            lat: l.lat,
            lon: l.lon,
            elevation: l.elevation,
            timestamp: l.timestamp,
            speed_kmh: l.speed_kmh,
            heading: l.heading,
            battery: l.battery,
        })
        .collect();
    if fixes.is_empty() {
        return;
    }
    if let Err(e) = pipeline.ingest(device_id, fixes).await {
        error!(device_id, error = %e, "Failed to ingest watch locations");
    }
}

async fn handle_tk103_frame(
    raw: &str,
    stream: &mut TcpStream,
    pipeline: &GpsPipeline,
    rate_limiter: &Mutex<RateLimiter>,
    state: &mut ConnState,
) -> FrameOutcome {
    let Some(frame) = tk103::parse_frame(raw) else {
        return FrameOutcome::Malformed;
    };

    if rate_limiter.lock().await.check(&frame.device_id, Instant::now()) != RateVerdict::Allowed {
        return FrameOutcome::Dropped;
    }

    let known = pipeline.registration(&frame.device_id).await.is_some();
    let device_id = frame.device_id.clone();

    if let Some(ack) = frame.ack() {
        let _ = stream.write_all(ack.as_bytes()).await;
    }

    match &frame.kind {
        Tk103Kind::Login => {
            if known && *state == ConnState::AwaitingLogin {
                *state = ConnState::Active;
                debug!(device_id, "TK103 device logged in");
            }
        }
        Tk103Kind::Heartbeat => {}
        Tk103Kind::Location(loc) => {
            if known && loc.valid {
                *state = ConnState::Active;
                let fix = NormalizedFix {
                    lat: loc.lat,
                    lon: loc.lon,
                    elevation: None,
                    timestamp: loc.timestamp,
                    speed_kmh: loc.speed_kmh,
                    heading: loc.heading,
                    battery: None,
                };
                if let Err(e) = pipeline.ingest(&device_id, vec![fix]).await {
                    error!(device_id, error = %e, "Failed to ingest TK103 location");
                }
            }
        }
        Tk103Kind::Other(command) => {
            debug!(device_id, command, "Ignoring unknown TK103 command");
        }
    }

    FrameOutcome::Ok(device_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_frames_concatenated() {
        let mut buffer = "[A*1*LK][B*2*LK]".to_string();
        let (frames, garbage) = extract_frames(&mut buffer, '[', ']');
        assert_eq!(frames, vec!["[A*1*LK]", "[B*2*LK]"]);
        assert!(!garbage);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_extract_frames_partial_stays_buffered() {
        let mut buffer = "[A*1*LK][B*2*".to_string();
        let (frames, _) = extract_frames(&mut buffer, '[', ']');
        assert_eq!(frames, vec!["[A*1*LK]"]);
        assert_eq!(buffer, "[B*2*");

        // the rest of the frame arrives on the next read
        buffer.push_str("LK]");
        let (frames, _) = extract_frames(&mut buffer, '[', ']');
        assert_eq!(frames, vec!["[B*2*LK]"]);
        assert!(buffer.is_empty());
    }

    #[test]
    fn test_extract_frames_discards_leading_garbage() {
        let mut buffer = "noise[A*1*LK]".to_string();
        let (frames, garbage) = extract_frames(&mut buffer, '[', ']');
        assert_eq!(frames, vec!["[A*1*LK]"]);
        assert!(garbage);
    }

    #[test]
    fn test_rate_limiter_min_interval() {
        let mut limiter = RateLimiter::new(Duration::from_secs(2), Duration::from_secs(60), 20);
        let t0 = Instant::now();

        assert_eq!(limiter.check("dev", t0), RateVerdict::Allowed);
        assert_eq!(
            limiter.check("dev", t0 + Duration::from_millis(500)),
            RateVerdict::TooFrequent
        );
        assert_eq!(
            limiter.check("dev", t0 + Duration::from_secs(2)),
            RateVerdict::Allowed
        );
    }

    #[test]
    fn test_rate_limiter_window_cap() {
        let mut limiter = RateLimiter::new(Duration::from_secs(0), Duration::from_secs(60), 3);
        let t0 = Instant::now();

        for i in 0..3 {
            assert_eq!(
                limiter.check("dev", t0 + Duration::from_secs(i * 3)),
                RateVerdict::Allowed
            );
        }
        assert_eq!(
            limiter.check("dev", t0 + Duration::from_secs(12)),
            RateVerdict::WindowExceeded
        );
        // window slides: a minute later the device may send again
        assert_eq!(
            limiter.check("dev", t0 + Duration::from_secs(70)),
            RateVerdict::Allowed
        );
    }

    #[test]
    fn test_rate_limiter_devices_are_independent() {
        let mut limiter = RateLimiter::new(Duration::from_secs(2), Duration::from_secs(60), 20);
        let t0 = Instant::now();

        assert_eq!(limiter.check("a", t0), RateVerdict::Allowed);
        assert_eq!(limiter.check("b", t0), RateVerdict::Allowed);
    }

    #[test]
    fn test_tracker_blacklists_connection_burst() {
        let mut tracker = ConnectionTracker::new();
        let ip: IpAddr = "203.0.113.9".parse().unwrap();
        let t0 = Instant::now();

        for _ in 0..=ABUSE_CONNS_PER_SECOND {
            assert_eq!(tracker.can_connect(ip, t0), ConnectVerdict::Allowed);
            tracker.add(ip, t0);
            tracker.remove(ip);
        }
        assert_eq!(tracker.can_connect(ip, t0), ConnectVerdict::Blacklisted);
        // still blacklisted a moment later
        assert_eq!(
            tracker.can_connect(ip, t0 + Duration::from_secs(30)),
            ConnectVerdict::Blacklisted
        );
        // expires after 60 seconds
        assert_eq!(
            tracker.can_connect(ip, t0 + Duration::from_secs(61)),
            ConnectVerdict::Allowed
        );
    }

    #[test]
    fn test_tracker_tolerates_steady_reconnects() {
        let mut tracker = ConnectionTracker::new();
        let ip: IpAddr = "203.0.113.10".parse().unwrap();
        let t0 = Instant::now();

        // one reconnect every 3 seconds: normal for poor coverage
        for i in 0..99 {
            let t = t0 + Duration::from_secs(i * 3);
            assert_eq!(tracker.can_connect(ip, t), ConnectVerdict::Allowed);
            tracker.add(ip, t);
            tracker.remove(ip);
        }
    }

    #[test]
    fn test_tracker_loopback_exempt() {
        let mut tracker = ConnectionTracker::new();
        let ip: IpAddr = "127.0.0.1".parse().unwrap();
        let t0 = Instant::now();

        for _ in 0..100 {
            assert_eq!(tracker.can_connect(ip, t0), ConnectVerdict::Allowed);
            tracker.add(ip, t0);
        }
    }

    #[test]
    fn test_tracker_per_ip_connection_cap() {
        let mut tracker = ConnectionTracker::new();
        let ip: IpAddr = "203.0.113.11".parse().unwrap();

        // spread the connects out so the burst detector stays quiet
        for i in 0..MAX_CONNECTIONS_PER_IP {
            let t = Instant::now() + Duration::from_secs(i as u64 * 2);
            assert_eq!(tracker.can_connect(ip, t), ConnectVerdict::Allowed);
            tracker.add(ip, t);
        }
        let t = Instant::now() + Duration::from_secs(200);
        assert_eq!(tracker.can_connect(ip, t), ConnectVerdict::TooManyConnections);
    }
}
