// Redis-backed priority queue with per-queue dead letter queues.
//
// Each queue is a sorted set `queue:{name}` whose score encodes
// (priority, enqueue time); the DLQ is a list `dlq:{name}`. Pipelined
// enqueue is the supported fast path for batch producers.

use chrono::{DateTime, Utc};
use redis::aio::{ConnectionManager, ConnectionManagerConfig};
use redis::Client;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::{error, info, warn};

use crate::points::TrackPoint;

/// Redis operations get two seconds before the caller falls back
const REDIS_OP_TIMEOUT: Duration = Duration::from_secs(2);

/// The fixed queue families. Unknown tags are rejected at enqueue time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum QueueName {
    #[serde(rename = "live_points")]
    LivePoints,
    #[serde(rename = "upload_points")]
    UploadPoints,
    #[serde(rename = "scoring_points")]
    ScoringPoints,
    #[serde(rename = "flymaster_points")]
    FlymasterPoints,
}

impl QueueName {
    pub const ALL: [QueueName; 4] = [
        QueueName::LivePoints,
        QueueName::UploadPoints,
        QueueName::ScoringPoints,
        QueueName::FlymasterPoints,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            QueueName::LivePoints => "live_points",
            QueueName::UploadPoints => "upload_points",
            QueueName::ScoringPoints => "scoring_points",
            QueueName::FlymasterPoints => "flymaster_points",
        }
    }

    /// Lower is dequeued sooner.
    pub fn priority(&self) -> i64 {
        match self {
            QueueName::LivePoints => 1,
            QueueName::UploadPoints | QueueName::ScoringPoints => 2,
            QueueName::FlymasterPoints => 3,
        }
    }

    pub fn key(&self) -> String {
        format!("queue:{}", self.as_str())
    }

    pub fn dlq_key(&self) -> String {
        format!("dlq:{}", self.as_str())
    }
}

impl std::fmt::Display for QueueName {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for QueueName {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "live_points" => Ok(QueueName::LivePoints),
            "upload_points" => Ok(QueueName::UploadPoints),
            "scoring_points" => Ok(QueueName::ScoringPoints),
            "flymaster_points" => Ok(QueueName::FlymasterPoints),
            other => Err(anyhow::anyhow!("unknown queue: {}", other)),
        }
    }
}

/// One enqueued unit of work: a batch of points for a single flight.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueItem {
    pub points: Vec<TrackPoint>,
    pub timestamp: DateTime<Utc>,
    pub count: usize,
    pub queue_type: QueueName,
    pub flight_id: String,
    #[serde(default, skip_serializing_if = "is_zero")]
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
}

fn is_zero(n: &u32) -> bool {
    *n == 0
}

impl QueueItem {
    pub fn new(queue_type: QueueName, flight_id: String, points: Vec<TrackPoint>) -> Self {
        Self {
            count: points.len(),
            points,
            timestamp: Utc::now(),
            queue_type,
            flight_id,
            retry_count: 0,
            last_error: None,
        }
    }
}

/// DLQ entry: the item plus why and when it failed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DlqEntry {
    pub item: QueueItem,
    pub reason: String,
    pub failed_at: DateTime<Utc>,
    pub retries: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// Backing store unreachable; callers fall back to direct writes
    #[error("queue backing store unavailable: {0}")]
    Unavailable(#[source] redis::RedisError),
    #[error("queue backend error: {0}")]
    Backend(#[from] redis::RedisError),
    #[error("queue item serialization failed: {0}")]
    Serde(#[from] serde_json::Error),
}

fn classify(err: redis::RedisError) -> QueueError {
    if err.is_connection_refusal() || err.is_io_error() || err.is_timeout() {
        QueueError::Unavailable(err)
    } else {
        QueueError::Backend(err)
    }
}

/// Sorted-set score: strict priority order, FIFO within a priority.
pub fn queue_score(priority: i64, enqueue_ms: i64) -> f64 {
    priority as f64 * 1e12 + enqueue_ms as f64
}

/// Per-queue snapshot for the admin surface.
#[derive(Debug, Clone, Serialize)]
pub struct QueueSnapshot {
    pub queue: String,
    pub pending: u64,
    pub dlq_size: u64,
}

#[derive(Clone)]
pub struct RedisQueue {
    conn: ConnectionManager,
}

impl RedisQueue {
    pub async fn connect(redis_url: &str) -> anyhow::Result<Self> {
        let conn = Client::open(redis_url)?
            .get_connection_manager_with_config(
                ConnectionManagerConfig::new()
                    .set_connection_timeout(REDIS_OP_TIMEOUT)
                    .set_response_timeout(REDIS_OP_TIMEOUT),
            )
            .await?;
        info!("Redis queue connection established");
        Ok(Self { conn })
    }

    /// Append one item. `QueueError::Unavailable` tells the caller to use the
    /// direct-write fallback.
    pub async fn enqueue(&self, name: QueueName, item: &QueueItem) -> Result<(), QueueError> {
        let payload = serde_json::to_string(item)?;
        let score = queue_score(name.priority(), Utc::now().timestamp_millis());

        let mut conn = self.conn.clone();
        let added: i64 = redis::cmd("ZADD")
            .arg(name.key())
            .arg(score)
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        metrics::counter!(format!("queue.{}.enqueued_total", name)).increment(added as u64);
        Ok(())
    }

    /// One round-trip for N items via pipelining. Atomicity is per-item;
    /// the returned count reports partial success.
    pub async fn enqueue_batch(
        &self,
        name: QueueName,
        items: &[QueueItem],
    ) -> Result<usize, QueueError> {
        if items.is_empty() {
            return Ok(0);
        }

        let now_ms = Utc::now().timestamp_millis();
        let mut pipe = redis::pipe();
        for item in items {
            let payload = serde_json::to_string(item)?;
            pipe.cmd("ZADD")
                .arg(name.key())
                .arg(queue_score(name.priority(), now_ms))
                .arg(payload);
        }

        let mut conn = self.conn.clone();
        let results: Vec<i64> = pipe.query_async(&mut conn).await.map_err(classify)?;
        let successful = results.iter().filter(|&&r| r >= 0).count();

        metrics::counter!(format!("queue.{}.enqueued_total", name)).increment(successful as u64);
        Ok(successful)
    }

    /// Pop up to `max_n` items in (priority, enqueue-time) order. Returns the
    /// items plus an estimate of what is still pending.
    pub async fn dequeue_batch(
        &self,
        name: QueueName,
        max_n: usize,
    ) -> Result<(Vec<QueueItem>, u64), QueueError> {
        let mut conn = self.conn.clone();
        let popped: Vec<(String, f64)> = redis::cmd("ZPOPMIN")
            .arg(name.key())
            .arg(max_n)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        let mut items = Vec::with_capacity(popped.len());
        for (raw, _score) in popped {
            match serde_json::from_str::<QueueItem>(&raw) {
                Ok(item) => items.push(item),
                Err(e) => {
                    // A malformed member can never be processed; drop it
                    warn!(queue = %name, error = %e, "Discarding unparseable queue item");
                    metrics::counter!(format!("queue.{}.parse_errors_total", name)).increment(1);
                }
            }
        }

        let remaining: u64 = redis::cmd("ZCARD")
            .arg(name.key())
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok((items, remaining))
    }

    /// Re-enqueue a dequeued item after a transient failure. The original
    /// priority is preserved; only the retry metadata changes.
    pub async fn requeue(&self, name: QueueName, item: &QueueItem) -> Result<(), QueueError> {
        self.enqueue(name, item).await
    }

    pub async fn to_dlq(
        &self,
        name: QueueName,
        item: QueueItem,
        reason: &str,
    ) -> Result<(), QueueError> {
        let retries = item.retry_count;
        let entry = DlqEntry {
            item,
            reason: reason.to_string(),
            failed_at: Utc::now(),
            retries,
        };
        let payload = serde_json::to_string(&entry)?;

        let mut conn = self.conn.clone();
        let _: i64 = redis::cmd("RPUSH")
            .arg(name.dlq_key())
            .arg(payload)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        warn!(queue = %name, reason, "Moved item to DLQ");
        metrics::counter!(format!("queue.{}.dlq_total", name)).increment(1);
        Ok(())
    }

    pub async fn pending(&self, name: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let n: u64 = redis::cmd("ZCARD")
            .arg(name.key())
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(n)
    }

    pub async fn dlq_size(&self, name: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let n: u64 = redis::cmd("LLEN")
            .arg(name.dlq_key())
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(n)
    }

    pub async fn dlq_peek(&self, name: QueueName, max_n: usize) -> Result<Vec<DlqEntry>, QueueError> {
        // LRANGE end index is inclusive; -1 means the whole list
        let end: i64 = if max_n == usize::MAX {
            -1
        } else {
            max_n as i64 - 1
        };
        let mut conn = self.conn.clone();
        let raw: Vec<String> = redis::cmd("LRANGE")
            .arg(name.dlq_key())
            .arg(0)
            .arg(end)
            .query_async(&mut conn)
            .await
            .map_err(classify)?;

        Ok(raw
            .iter()
            .filter_map(|r| serde_json::from_str(r).ok())
            .collect())
    }

    /// Operator action: move DLQ entries back onto their queue. Never runs
    /// automatically.
    pub async fn dlq_requeue(&self, name: QueueName) -> Result<usize, QueueError> {
        let mut requeued = 0;
        loop {
            let mut conn = self.conn.clone();
            let raw: Option<String> = redis::cmd("LPOP")
                .arg(name.dlq_key())
                .query_async(&mut conn)
                .await
                .map_err(classify)?;

            let Some(raw) = raw else { break };
            match serde_json::from_str::<DlqEntry>(&raw) {
                Ok(entry) => {
                    let mut item = entry.item;
                    item.retry_count = 0;
                    item.last_error = None;
                    self.enqueue(name, &item).await?;
                    requeued += 1;
                }
                Err(e) => {
                    error!(queue = %name, error = %e, "Dropping unparseable DLQ entry");
                }
            }
        }
        if requeued > 0 {
            info!(queue = %name, requeued, "Re-enqueued DLQ items");
        }
        Ok(requeued)
    }

    pub async fn dlq_clear(&self, name: QueueName) -> Result<u64, QueueError> {
        let mut conn = self.conn.clone();
        let size = self.dlq_size(name).await?;
        let _: i64 = redis::cmd("DEL")
            .arg(name.dlq_key())
            .query_async(&mut conn)
            .await
            .map_err(classify)?;
        Ok(size)
    }

    /// Drop DLQ entries whose failure time is older than `max_age_hours`.
    pub async fn dlq_reap(&self, name: QueueName, max_age_hours: i64) -> Result<u64, QueueError> {
        let cutoff = Utc::now() - chrono::Duration::hours(max_age_hours);
        let entries = self.dlq_peek(name, usize::MAX).await?;
        let keep: Vec<String> = entries
            .into_iter()
            .filter(|e| e.failed_at >= cutoff)
            .map(|e| serde_json::to_string(&e))
            .collect::<Result<_, _>>()?;

        let mut conn = self.conn.clone();
        let before = self.dlq_size(name).await?;
        let mut pipe = redis::pipe();
        pipe.atomic().cmd("DEL").arg(name.dlq_key());
        for entry in &keep {
            pipe.cmd("RPUSH").arg(name.dlq_key()).arg(entry);
        }
        let _: () = pipe.query_async(&mut conn).await.map_err(classify)?;

        Ok(before.saturating_sub(keep.len() as u64))
    }

    pub async fn snapshot(&self) -> Result<Vec<QueueSnapshot>, QueueError> {
        let mut out = Vec::with_capacity(QueueName::ALL.len());
        for name in QueueName::ALL {
            out.push(QueueSnapshot {
                queue: name.as_str().to_string(),
                pending: self.pending(name).await?,
                dlq_size: self.dlq_size(name).await?,
            });
        }
        Ok(out)
    }

    pub async fn ping(&self) -> bool {
        let mut conn = self.conn.clone();
        let pong: Result<String, _> = redis::cmd("PING").query_async(&mut conn).await;
        pong.is_ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_score_orders_by_priority_then_time() {
        let early_live = queue_score(1, 1_000);
        let late_live = queue_score(1, 2_000);
        let early_bulk = queue_score(3, 1_000);

        assert!(early_live < late_live);
        assert!(late_live < early_bulk);
    }

    #[test]
    fn test_queue_name_round_trip() {
        for name in QueueName::ALL {
            let parsed: QueueName = name.as_str().parse().unwrap();
            assert_eq!(parsed, name);
        }
        assert!("mystery_points".parse::<QueueName>().is_err());
    }

    #[test]
    fn test_queue_priorities() {
        assert_eq!(QueueName::LivePoints.priority(), 1);
        assert_eq!(QueueName::UploadPoints.priority(), 2);
        assert_eq!(QueueName::ScoringPoints.priority(), 2);
        assert_eq!(QueueName::FlymasterPoints.priority(), 3);
    }

    #[test]
    fn test_queue_item_wire_format() {
        let item = QueueItem::new(QueueName::LivePoints, "app-abc".into(), vec![]);
        let json = serde_json::to_value(&item).unwrap();

        assert_eq!(json["queue_type"], "live_points");
        assert_eq!(json["flight_id"], "app-abc");
        assert_eq!(json["count"], 0);
        // retry metadata only appears after a failed attempt
        assert!(json.get("retry_count").is_none());
        assert!(json.get("last_error").is_none());

        let mut retried = item.clone();
        retried.retry_count = 2;
        retried.last_error = Some("connection reset".into());
        let json = serde_json::to_value(&retried).unwrap();
        assert_eq!(json["retry_count"], 2);
        assert_eq!(json["last_error"], "connection reset");
    }

    #[test]
    fn test_dlq_entry_round_trip() {
        let entry = DlqEntry {
            item: QueueItem::new(QueueName::UploadPoints, "u-1".into(), vec![]),
            reason: "foreign_key_missing".into(),
            failed_at: Utc::now(),
            retries: 0,
        };
        let raw = serde_json::to_string(&entry).unwrap();
        let back: DlqEntry = serde_json::from_str(&raw).unwrap();
        assert_eq!(back.reason, "foreign_key_missing");
        assert_eq!(back.item.flight_id, "u-1");
    }
}
