// Writer pool: one cooperative worker per queue family.
//
// Each worker dequeues in batches, validates, bulk-inserts with
// ignore-on-conflict semantics, and routes failures to retry or the DLQ.
// Uniqueness in the store makes overlapping batches idempotent, so no
// per-flight insert serialization is needed.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::db::is_transient;
use crate::flights::FixSummary;
use crate::flights_repo::FlightsRepository;
use crate::points::TrackPoint;
use crate::points_repo::PointsRepository;
use crate::queue::{QueueItem, QueueName, RedisQueue};
use crate::validator::Validator;

/// Default dequeue batch size; the batching target is 500 points per
/// transaction with a hard cap of 1,000.
pub const DEFAULT_BATCH_SIZE: usize = 500;
pub const MAX_BATCH_POINTS: usize = 1_000;

const MAX_RETRIES: u32 = 3;
const MAX_RETRY_DELAY_SECS: u64 = 60;
const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
const IDLE_POLL: Duration = Duration::from_secs(1);
const ERROR_POLL: Duration = Duration::from_secs(5);

/// Shared per-worker counters for the admin surface. Writers never surface
/// per-point errors to clients.
#[derive(Default)]
pub struct ProcessorStats {
    pub processed: AtomicU64,
    pub failed: AtomicU64,
    pub retried: AtomicU64,
    pub dlq_items: AtomicU64,
    pub last_error: Mutex<Option<String>>,
    pub last_processed: Mutex<Option<DateTime<Utc>>>,
    /// Flight ids of the batch currently being written; the retention sweep
    /// waits for its targets to leave this set before deleting
    in_flight: Mutex<HashSet<String>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub processed: u64,
    pub failed: u64,
    pub retried: u64,
    pub dlq_items: u64,
    pub last_error: Option<String>,
    pub last_processed: Option<DateTime<Utc>>,
}

impl ProcessorStats {
    pub async fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            processed: self.processed.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dlq_items: self.dlq_items.load(Ordering::Relaxed),
            last_error: self.last_error.lock().await.clone(),
            last_processed: *self.last_processed.lock().await,
        }
    }

    pub async fn is_writing_any(&self, flight_ids: &[String]) -> bool {
        let in_flight = self.in_flight.lock().await;
        flight_ids.iter().any(|id| in_flight.contains(id))
    }
}

/// Backoff before a retry re-enqueue: `min(60s, 2^retry_count)`.
pub fn retry_delay(retry_count: u32) -> Duration {
    Duration::from_secs(MAX_RETRY_DELAY_SECS.min(1u64 << retry_count.min(6)))
}

#[derive(Clone)]
pub struct PointProcessor {
    queue: RedisQueue,
    validator: Validator,
    points_repo: PointsRepository,
    flights_repo: FlightsRepository,
    stats: Arc<ProcessorStats>,
    batch_size: usize,
    /// Writer → separator feedback: (flight_id, advanced last fix)
    summary_feedback: Option<flume::Sender<(String, FixSummary)>>,
}

impl PointProcessor {
    pub fn new(
        queue: RedisQueue,
        validator: Validator,
        points_repo: PointsRepository,
        flights_repo: FlightsRepository,
    ) -> Self {
        Self {
            queue,
            validator,
            points_repo,
            flights_repo,
            stats: Arc::new(ProcessorStats::default()),
            batch_size: DEFAULT_BATCH_SIZE,
            summary_feedback: None,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_summary_feedback(mut self, tx: flume::Sender<(String, FixSummary)>) -> Self {
        self.summary_feedback = Some(tx);
        self
    }

    pub fn stats(&self) -> Arc<ProcessorStats> {
        Arc::clone(&self.stats)
    }

    /// Worker loop for one queue family. Exits after draining the current
    /// batch once shutdown is signalled; it never dequeues past that point.
    pub async fn run(&self, name: QueueName, mut shutdown: watch::Receiver<bool>) {
        info!(queue = %name, "Point writer started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.process_one_batch(name).await {
                Ok(0) => {
                    tokio::select! {
                        _ = tokio::time::sleep(IDLE_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    error!(queue = %name, error = %e, "Writer batch failed");
                    *self.stats.last_error.lock().await = Some(e.to_string());
                    tokio::select! {
                        _ = tokio::time::sleep(ERROR_POLL) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        info!(queue = %name, "Point writer drained and stopped");
    }

    /// Dequeue and persist one batch. Returns the number of items taken off
    /// the queue (0 = queue idle).
    async fn process_one_batch(&self, name: QueueName) -> Result<usize> {
        let (items, remaining) = self.queue.dequeue_batch(name, self.batch_size).await?;
        metrics::gauge!(format!("queue.{}.pending", name)).set(remaining as f64);

        if items.is_empty() {
            return Ok(0);
        }
        let taken = items.len();

        // Foreign-key and shape pre-validation. A transient store failure
        // here counts as a writer failure: the popped items go back through
        // the retry path instead of being lost.
        let split = match self.validator.split(items.clone()).await {
            Ok(split) => split,
            Err(e) => {
                warn!(queue = %name, error = %e, "Validation hit store error, retrying batch");
                self.handle_write_failure(name, items, e).await?;
                return Ok(taken);
            }
        };

        for (item, reason) in split.rejected {
            self.stats.dlq_items.fetch_add(1, Ordering::Relaxed);
            self.queue.to_dlq(name, item, reason).await?;
        }

        if split.valid.is_empty() {
            return Ok(taken);
        }

        // Track the flights being written so retention can drain around them
        {
            let mut in_flight = self.stats.in_flight.lock().await;
            in_flight.extend(split.valid.iter().map(|i| i.flight_id.clone()));
        }

        let result = self.write_items(name, &split.valid).await;

        {
            let mut in_flight = self.stats.in_flight.lock().await;
            for item in &split.valid {
                in_flight.remove(&item.flight_id);
            }
        }

        match result {
            Ok(point_count) => {
                self.stats
                    .processed
                    .fetch_add(point_count, Ordering::Relaxed);
                *self.stats.last_processed.lock().await = Some(Utc::now());
                metrics::counter!(format!("writer.{}.points_total", name)).increment(point_count);
            }
            Err(e) => {
                self.handle_write_failure(name, split.valid, e).await?;
            }
        }

        Ok(taken)
    }

    async fn write_items(&self, name: QueueName, items: &[QueueItem]) -> Result<u64> {
        let points: Vec<TrackPoint> = items
            .iter()
            .flat_map(|i| i.points.iter().cloned())
            .collect();

        // Hard cap of 1,000 points per transaction
        for chunk in points.chunks(MAX_BATCH_POINTS) {
            tokio::time::timeout(WRITE_TIMEOUT, self.points_repo.insert_batch(name, chunk))
                .await
                .map_err(|_| anyhow::anyhow!("writer batch timed out"))??;
        }

        // Advance the denormalised flight summaries; triggers take over when
        // the store carries them, this keeps the core self-contained.
        for item in items {
            if let (Some(earliest), Some(latest)) = (
                item.points.iter().min_by_key(|p| p.datetime),
                item.points.iter().max_by_key(|p| p.datetime),
            ) {
                let earliest = point_summary(earliest);
                let latest = point_summary(latest);
                let flight_uuid = item.points[0].flight_uuid;
                self.flights_repo
                    .advance_fix_summary(flight_uuid, &earliest, &latest, item.count as i64)
                    .await?;

                if let Some(tx) = &self.summary_feedback {
                    let _ = tx.try_send((item.flight_id.clone(), latest));
                }
            }
        }

        Ok(points.len() as u64)
    }

    /// Retry policy: transient errors re-enqueue with a bumped retry count
    /// after exponential backoff; three strikes or a permanent error goes to
    /// the DLQ.
    async fn handle_write_failure(
        &self,
        name: QueueName,
        items: Vec<QueueItem>,
        err: anyhow::Error,
    ) -> Result<()> {
        let transient = err
            .downcast_ref::<sqlx::Error>()
            .map(is_transient)
            .unwrap_or_else(|| err.to_string().contains("timed out"));

        *self.stats.last_error.lock().await = Some(err.to_string());
        self.stats
            .failed
            .fetch_add(items.iter().map(|i| i.count as u64).sum(), Ordering::Relaxed);

        if !transient {
            let reason = err.to_string();
            for item in items {
                self.stats.dlq_items.fetch_add(1, Ordering::Relaxed);
                self.queue.to_dlq(name, item, &reason).await?;
            }
            return Ok(());
        }

        let min_retry = items.iter().map(|i| i.retry_count).min().unwrap_or(0);
        tokio::time::sleep(retry_delay(min_retry)).await;

        for mut item in items {
            if item.retry_count >= MAX_RETRIES {
                self.stats.dlq_items.fetch_add(1, Ordering::Relaxed);
                self.queue.to_dlq(name, item, "max_retries").await?;
            } else {
                item.retry_count += 1;
                item.last_error = Some(err.to_string());
                self.stats.retried.fetch_add(1, Ordering::Relaxed);
                self.queue.requeue(name, &item).await?;
            }
        }

        Ok(())
    }
}

fn point_summary(p: &TrackPoint) -> FixSummary {
    FixSummary {
        lat: p.lat,
        lon: p.lon,
        elevation: p.elevation,
        datetime: p.datetime,
    }
}

/// Direct-write fallback used by the HTTP adapters when the queue is
/// unavailable. Bypasses the queue but not the insert semantics.
pub async fn write_points_direct(
    points_repo: &PointsRepository,
    flights_repo: &FlightsRepository,
    name: QueueName,
    flight_uuid: Uuid,
    item: &QueueItem,
) -> Result<u64> {
    let inserted = points_repo.insert_batch(name, &item.points).await?;

    if let (Some(earliest), Some(latest)) = (
        item.points.iter().min_by_key(|p| p.datetime),
        item.points.iter().max_by_key(|p| p.datetime),
    ) {
        flights_repo
            .advance_fix_summary(
                flight_uuid,
                &point_summary(earliest),
                &point_summary(latest),
                item.count as i64,
            )
            .await?;
    }

    Ok(inserted)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_delay_backoff() {
        assert_eq!(retry_delay(0), Duration::from_secs(1));
        assert_eq!(retry_delay(1), Duration::from_secs(2));
        assert_eq!(retry_delay(2), Duration::from_secs(4));
        // capped at 60 seconds no matter how high the count climbs
        assert_eq!(retry_delay(6), Duration::from_secs(60));
        assert_eq!(retry_delay(40), Duration::from_secs(60));
    }
}
