// Per-race fan-out hub.
//
// One hub per active race owns the 10-second tick: it reads delayed
// positions from the read pool, stamps them with the tick boundary, and
// pushes per-client filtered deltas. Ticks are strictly serial per race and
// are skipped, never coalesced, when broadcasting overruns.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, Mutex, Notify, RwLock};
use tracing::{debug, error, info, warn};

use crate::points_repo::{PilotPosition, PointsRepository};
use crate::races::Race;

use super::messages::{DeltaEntry, DeltaPayload, ServerMessage, TileCoords};
use super::tiles::{mercator_xy, tile_for, TileId};

/// Outbound frames buffered per client before the socket write task drains
/// them. ~16 frames of headroom absorbs a slow reader for a couple of ticks.
const CLIENT_BUFFER_CAP: usize = 16;

const VIEWER_COUNT_INTERVAL: Duration = Duration::from_secs(30);

/// Bounded per-client outbox. On overflow the oldest un-sent delta is
/// discarded; demand-driven frames (tiles, config) are never dropped.
pub struct ClientBuffer {
    queue: Mutex<VecDeque<ServerMessage>>,
    notify: Notify,
    cap: usize,
}

impl ClientBuffer {
    pub fn new(cap: usize) -> Self {
        Self {
            queue: Mutex::new(VecDeque::with_capacity(cap)),
            notify: Notify::new(),
            cap,
        }
    }

    pub async fn push(&self, msg: ServerMessage) {
        let mut queue = self.queue.lock().await;
        if queue.len() >= self.cap {
            if let Some(pos) = queue.iter().position(|m| m.droppable()) {
                queue.remove(pos);
                metrics::counter!("live.deltas_dropped_total").increment(1);
            } else if msg.droppable() {
                // Buffer full of undroppable frames: shed the incoming delta
                metrics::counter!("live.deltas_dropped_total").increment(1);
                return;
            }
        }
        queue.push_back(msg);
        drop(queue);
        self.notify.notify_one();
    }

    pub async fn pop(&self) -> ServerMessage {
        loop {
            let notified = self.notify.notified();
            {
                let mut queue = self.queue.lock().await;
                if let Some(msg) = queue.pop_front() {
                    return msg;
                }
            }
            notified.await;
        }
    }

    #[cfg(test)]
    pub async fn len(&self) -> usize {
        self.queue.lock().await.len()
    }
}

/// One connected map client.
pub struct HubClient {
    pub client_id: String,
    pub pilot_id: String,
    tiles: RwLock<HashSet<TileId>>,
    pub buffer: ClientBuffer,
}

impl HubClient {
    fn new(client_id: String, pilot_id: String) -> Self {
        Self {
            client_id,
            pilot_id,
            tiles: RwLock::new(HashSet::new()),
            buffer: ClientBuffer::new(CLIENT_BUFFER_CAP),
        }
    }

    pub async fn replace_tiles(&self, tiles: Vec<TileId>) -> Vec<TileId> {
        let new_set: HashSet<TileId> = tiles.into_iter().collect();
        let mut current = self.tiles.write().await;
        let added: Vec<TileId> = new_set.difference(&current).copied().collect();
        *current = new_set;
        added
    }

    pub async fn subscribed_tiles(&self) -> HashSet<TileId> {
        self.tiles.read().await.clone()
    }
}

/// Visibility rule: a client sees a pilot when the pilot's delayed position
/// falls inside a subscribed tile, or the pilot is the client's own.
/// Zero subscribed tiles means no deltas at all.
pub fn visible_entries(
    positions: &[DeltaEntry],
    tiles: &HashSet<TileId>,
    own_pilot_id: &str,
) -> Vec<DeltaEntry> {
    if tiles.is_empty() {
        return Vec::new();
    }
    let zooms: HashSet<u8> = tiles.iter().map(|t| t.z()).collect();

    positions
        .iter()
        .filter(|p| {
            p.pilot_id == own_pilot_id
                || zooms
                    .iter()
                    .any(|&z| tiles.contains(&tile_for(p.lat, p.lon, z)))
        })
        .cloned()
        .collect()
}

pub struct RaceHub {
    pub race: Race,
    delay: Duration,
    update_interval: Duration,
    clients: RwLock<HashMap<String, Arc<HubClient>>>,
    points_repo: PointsRepository,
    /// Guards against overlapping broadcasts; an overrunning tick makes the
    /// next one skip, so clients see a gap rather than a burst
    broadcasting: AtomicBool,
    last_tick_positions: RwLock<Vec<DeltaEntry>>,
    last_viewer_count: Mutex<Option<Instant>>,
}

impl RaceHub {
    pub fn new(
        race: Race,
        points_repo: PointsRepository,
        delay: Duration,
        update_interval: Duration,
    ) -> Self {
        Self {
            race,
            delay,
            update_interval,
            clients: RwLock::new(HashMap::new()),
            points_repo,
            broadcasting: AtomicBool::new(false),
            last_tick_positions: RwLock::new(Vec::new()),
            last_viewer_count: Mutex::new(None),
        }
    }

    pub fn delay_seconds(&self) -> u64 {
        self.delay.as_secs()
    }

    pub fn update_interval_seconds(&self) -> u64 {
        self.update_interval.as_secs()
    }

    pub async fn register(&self, client_id: &str, pilot_id: &str) -> Arc<HubClient> {
        let client = Arc::new(HubClient::new(client_id.to_string(), pilot_id.to_string()));
        let mut clients = self.clients.write().await;
        clients.insert(client_id.to_string(), Arc::clone(&client));
        metrics::gauge!("live.clients").increment(1.0);
        info!(race_id = %self.race.race_id, client_id, "Client connected to race hub");
        client
    }

    pub async fn unregister(&self, client_id: &str) {
        let mut clients = self.clients.write().await;
        if clients.remove(client_id).is_some() {
            metrics::gauge!("live.clients").decrement(1.0);
        }
    }

    pub async fn viewer_count(&self) -> usize {
        self.clients.read().await.len()
    }

    /// Delayed cutoff for on-demand reads (tiles, catch-ups).
    pub fn delayed_cutoff(&self) -> DateTime<Utc> {
        Utc::now() - ChronoDuration::from_std(self.delay).unwrap_or(ChronoDuration::seconds(60))
    }

    /// Positions from the most recent tick, for catch-up deltas after a
    /// subscription change.
    pub async fn cached_positions(&self) -> Vec<DeltaEntry> {
        self.last_tick_positions.read().await.clone()
    }

    /// Push a catch-up delta covering the client's current subscription.
    pub async fn send_catch_up(&self, client: &HubClient) {
        let positions = self.cached_positions().await;
        let tiles = client.subscribed_tiles().await;
        let visible = visible_entries(&positions, &tiles, &client.pilot_id);
        if visible.is_empty() {
            return;
        }
        let timestamp = visible
            .iter()
            .map(|e| e.timestamp)
            .max()
            .unwrap_or_else(Utc::now);
        if let Some(msg) = delta_message(&self.race.race_id, timestamp, visible) {
            client.buffer.push(msg).await;
        }
    }

    /// One fan-out tick: read the delayed positions, cache them, fan out
    /// per-client filtered deltas, and emit viewer counts on cadence.
    pub async fn tick(&self) {
        if self.broadcasting.swap(true, Ordering::AcqRel) {
            warn!(race_id = %self.race.race_id, "Previous tick still broadcasting, skipping");
            metrics::counter!("live.ticks_skipped_total").increment(1);
            return;
        }

        let tick_start = Instant::now();
        let boundary = Utc::now();
        let cutoff = boundary - ChronoDuration::from_std(self.delay).unwrap_or(ChronoDuration::seconds(60));

        let result = self
            .points_repo
            .delayed_positions(&self.race.race_id, cutoff)
            .await;

        match result {
            Ok(positions) => {
                // All positions in one tick share the tick boundary timestamp
                let entries: Vec<DeltaEntry> = positions
                    .into_iter()
                    .map(|p| to_delta_entry(p, boundary))
                    .collect();
                *self.last_tick_positions.write().await = entries.clone();

                self.broadcast_entries(&entries, boundary).await;
            }
            Err(e) => {
                // Clients never see backend errors; a missed tick is a gap
                error!(race_id = %self.race.race_id, error = %e, "Tick read failed");
            }
        }

        self.maybe_send_viewer_count().await;

        metrics::histogram!("live.tick_duration_seconds")
            .record(tick_start.elapsed().as_secs_f64());
        self.broadcasting.store(false, Ordering::Release);
    }

    async fn broadcast_entries(&self, entries: &[DeltaEntry], boundary: DateTime<Utc>) {
        let clients: Vec<Arc<HubClient>> = {
            let clients = self.clients.read().await;
            clients.values().cloned().collect()
        };

        for client in clients {
            let tiles = client.subscribed_tiles().await;
            let visible = visible_entries(entries, &tiles, &client.pilot_id);
            if visible.is_empty() {
                continue;
            }
            if let Some(msg) = delta_message(&self.race.race_id, boundary, visible) {
                client.buffer.push(msg).await;
            }
        }
    }

    async fn maybe_send_viewer_count(&self) {
        let mut last = self.last_viewer_count.lock().await;
        let due = last
            .map(|at| at.elapsed() >= VIEWER_COUNT_INTERVAL)
            .unwrap_or(true);
        if !due {
            return;
        }
        *last = Some(Instant::now());
        drop(last);

        let count = self.viewer_count().await;
        let msg = ServerMessage::ViewerCount {
            count,
            timestamp: Utc::now(),
        };
        let clients = self.clients.read().await;
        for client in clients.values() {
            client.buffer.push(msg.clone()).await;
        }
    }

    /// Serve one tile on demand; `tile_data` frames are never dropped.
    pub async fn send_tile(&self, client: &HubClient, tile: TileId) {
        let cutoff = self.delayed_cutoff();
        match self
            .points_repo
            .render_tile(
                &self.race.race_id,
                tile.z() as i32,
                tile.x() as i32,
                tile.y() as i32,
                cutoff,
            )
            .await
        {
            Ok(Some(mvt)) => match super::messages::gzip_base64(&mvt) {
                Ok(data) => {
                    client
                        .buffer
                        .push(ServerMessage::TileData {
                            tile: TileCoords::from(tile),
                            format: "mvt",
                            compression: "gzip",
                            data,
                            timestamp: Utc::now(),
                        })
                        .await;
                }
                Err(e) => error!(error = %e, "Tile compression failed"),
            },
            Ok(None) => {
                debug!(race_id = %self.race.race_id, ?tile, "Empty tile, nothing to send");
            }
            Err(e) => {
                error!(race_id = %self.race.race_id, error = %e, "Tile render failed");
            }
        }
    }
}

fn to_delta_entry(p: PilotPosition, boundary: DateTime<Utc>) -> DeltaEntry {
    let (x, y) = mercator_xy(p.lat, p.lon);
    DeltaEntry {
        pilot_id: p.pilot_id,
        pilot_name: p.pilot_name,
        lat: p.lat,
        lon: p.lon,
        elevation: p.elevation,
        // the tick boundary, not the raw point time
        timestamp: boundary,
        x_mercator: x,
        y_mercator: y,
    }
}

fn delta_message(
    race_id: &str,
    timestamp: DateTime<Utc>,
    updates: Vec<DeltaEntry>,
) -> Option<ServerMessage> {
    let update_count = updates.len();
    let payload = DeltaPayload::new(timestamp, updates);
    match payload.encode() {
        Ok(data) => Some(ServerMessage::DeltaUpdate {
            race_id: race_id.to_string(),
            data,
            timestamp,
            compression: "gzip",
            update_count,
        }),
        Err(e) => {
            error!(error = %e, "Delta payload encoding failed");
            None
        }
    }
}

/// Owns the per-race hubs and their tickers. Hubs are created on the first
/// client and torn down when the last one leaves.
#[derive(Clone)]
pub struct HubManager {
    hubs: Arc<RwLock<HashMap<String, Arc<RaceHub>>>>,
    tickers: Arc<RwLock<HashMap<String, tokio::task::JoinHandle<()>>>>,
    points_repo: PointsRepository,
    delay: Duration,
    update_interval: Duration,
    shutdown: watch::Receiver<bool>,
}

impl HubManager {
    pub fn new(
        points_repo: PointsRepository,
        delay: Duration,
        update_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            hubs: Arc::new(RwLock::new(HashMap::new())),
            tickers: Arc::new(RwLock::new(HashMap::new())),
            points_repo,
            delay,
            update_interval,
            shutdown,
        }
    }

    pub async fn hub_for(&self, race: &Race) -> Arc<RaceHub> {
        {
            let hubs = self.hubs.read().await;
            if let Some(hub) = hubs.get(&race.race_id) {
                return Arc::clone(hub);
            }
        }

        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(&race.race_id) {
            return Arc::clone(hub);
        }

        let hub = Arc::new(RaceHub::new(
            race.clone(),
            self.points_repo.clone(),
            self.delay,
            self.update_interval,
        ));
        hubs.insert(race.race_id.clone(), Arc::clone(&hub));

        let ticker = self.spawn_ticker(Arc::clone(&hub));
        self.tickers
            .write()
            .await
            .insert(race.race_id.clone(), ticker);
        info!(race_id = %race.race_id, "Started fan-out hub");
        hub
    }

    fn spawn_ticker(&self, hub: Arc<RaceHub>) -> tokio::task::JoinHandle<()> {
        let mut shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(hub.update_interval);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            // the immediate first tick would broadcast before any client
            // finished its handshake
            interval.tick().await;

            loop {
                tokio::select! {
                    _ = interval.tick() => hub.tick().await,
                    _ = shutdown.changed() => {
                        if *shutdown.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    }

    /// Tear the hub down once its last client is gone.
    pub async fn release_if_empty(&self, race_id: &str) {
        let empty = {
            let hubs = self.hubs.read().await;
            match hubs.get(race_id) {
                Some(hub) => hub.viewer_count().await == 0,
                None => return,
            }
        };
        if !empty {
            return;
        }

        let mut hubs = self.hubs.write().await;
        if let Some(hub) = hubs.get(race_id) {
            if hub.viewer_count().await == 0 {
                hubs.remove(race_id);
                if let Some(ticker) = self.tickers.write().await.remove(race_id) {
                    ticker.abort();
                }
                info!(race_id, "Stopped idle fan-out hub");
            }
        }
    }

    pub async fn stats(&self) -> serde_json::Value {
        let hubs = self.hubs.read().await;
        let mut races = serde_json::Map::new();
        for (race_id, hub) in hubs.iter() {
            races.insert(
                race_id.clone(),
                serde_json::json!({ "viewers": hub.viewer_count().await }),
            );
        }
        serde_json::json!({
            "races_with_viewers": hubs.len(),
            "races": races,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(pilot_id: &str, lat: f64, lon: f64) -> DeltaEntry {
        let (x, y) = mercator_xy(lat, lon);
        DeltaEntry {
            pilot_id: pilot_id.into(),
            pilot_name: pilot_id.to_uppercase(),
            lat,
            lon,
            elevation: None,
            timestamp: Utc::now(),
            x_mercator: x,
            y_mercator: y,
        }
    }

    #[test]
    fn test_zero_tiles_means_no_deltas() {
        let positions = vec![entry("p1", 45.6, 10.8), entry("me", 45.6, 10.8)];
        // even the client's own pilot stays silent with an empty viewport
        assert!(visible_entries(&positions, &HashSet::new(), "me").is_empty());
    }

    #[test]
    fn test_viewport_filtering() {
        let inside = entry("p1", 45.6, 10.8);
        let outside = entry("p2", 46.9, 7.5);
        let positions = vec![inside, outside];

        let tiles: HashSet<TileId> = [tile_for(45.6, 10.8, 12)].into_iter().collect();
        let visible = visible_entries(&positions, &tiles, "viewer");

        assert_eq!(visible.len(), 1);
        assert_eq!(visible[0].pilot_id, "p1");
    }

    #[test]
    fn test_own_pilot_always_visible_with_any_subscription() {
        let positions = vec![entry("me", 46.9, 7.5)];
        // subscribed far away from the pilot's actual position
        let tiles: HashSet<TileId> = [tile_for(45.6, 10.8, 12)].into_iter().collect();

        let visible = visible_entries(&positions, &tiles, "me");
        assert_eq!(visible.len(), 1);
    }

    #[tokio::test]
    async fn test_client_buffer_drops_oldest_delta_on_overflow() {
        let buffer = ClientBuffer::new(2);
        let delta = |n: usize| ServerMessage::DeltaUpdate {
            race_id: format!("r{}", n),
            data: String::new(),
            timestamp: Utc::now(),
            compression: "gzip",
            update_count: n,
        };

        buffer.push(delta(1)).await;
        buffer.push(delta(2)).await;
        buffer.push(delta(3)).await;
        assert_eq!(buffer.len().await, 2);

        // delta 1 was shed; 2 and 3 survive in order
        let ServerMessage::DeltaUpdate { update_count, .. } = buffer.pop().await else {
            panic!("expected delta");
        };
        assert_eq!(update_count, 2);
    }

    #[tokio::test]
    async fn test_client_buffer_never_drops_tile_data() {
        let buffer = ClientBuffer::new(2);
        let tile = || ServerMessage::TileData {
            tile: TileCoords { z: 12, x: 0, y: 0 },
            format: "mvt",
            compression: "gzip",
            data: String::new(),
            timestamp: Utc::now(),
        };

        buffer.push(tile()).await;
        buffer.push(tile()).await;
        // a delta arriving into a buffer full of tiles is shed instead
        buffer
            .push(ServerMessage::DeltaUpdate {
                race_id: "r".into(),
                data: String::new(),
                timestamp: Utc::now(),
                compression: "gzip",
                update_count: 9,
            })
            .await;

        assert_eq!(buffer.len().await, 2);
        assert!(!buffer.pop().await.droppable());
        assert!(!buffer.pop().await.droppable());
    }

    #[tokio::test]
    async fn test_replace_tiles_reports_added() {
        let client = HubClient::new("c1".into(), "p1".into());
        let added = client
            .replace_tiles(vec![TileId(12, 1, 1), TileId(12, 1, 2)])
            .await;
        assert_eq!(added.len(), 2);

        let added = client
            .replace_tiles(vec![TileId(12, 1, 2), TileId(12, 1, 3)])
            .await;
        assert_eq!(added, vec![TileId(12, 1, 3)]);

        let tiles = client.subscribed_tiles().await;
        assert_eq!(tiles.len(), 2);
        assert!(!tiles.contains(&TileId(12, 1, 1)));
    }
}
