// Scheduled background maintenance: the live-flight retention sweep and the
// DLQ reaper. Both are named, cancellable tasks on a daily cadence.

use chrono::{Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::flights_repo::FlightsRepository;
use crate::point_processor::ProcessorStats;
use crate::points_repo::PointsRepository;
use crate::queue::{QueueName, RedisQueue};

const SWEEP_INTERVAL: Duration = Duration::from_secs(24 * 3600);
const DLQ_MAX_AGE_HOURS: i64 = 24;
/// How long the sweep waits for writers to drain a victim flight
const DRAIN_WAIT: Duration = Duration::from_secs(30);

/// Delete live-sourced flights older than the retention horizon. The sweep
/// is a single-writer operation: it waits for the writer pool to finish any
/// batch touching the victim flight ids before deleting, so a flight never
/// gains points while its row is being removed.
pub async fn retention_sweep(
    flights_repo: &FlightsRepository,
    points_repo: &PointsRepository,
    writer_stats: &ProcessorStats,
    retention_hours: i64,
) -> anyhow::Result<(u64, u64)> {
    let cutoff = Utc::now() - ChronoDuration::hours(retention_hours);
    let stale = flights_repo.stale_live_flights(cutoff).await?;
    if stale.is_empty() {
        return Ok((0, 0));
    }

    let (uuids, flight_ids): (Vec<_>, Vec<_>) = stale.into_iter().unzip();

    let drain_deadline = tokio::time::Instant::now() + DRAIN_WAIT;
    while writer_stats.is_writing_any(&flight_ids).await {
        if tokio::time::Instant::now() >= drain_deadline {
            info!("Writer drain wait elapsed, proceeding with sweep");
            break;
        }
        tokio::time::sleep(Duration::from_secs(1)).await;
    }

    // Live points cascade with the flight; the explicit delete keeps the
    // sweep correct on stores without the cascade configured
    let points = points_repo
        .delete_for_flights(QueueName::LivePoints, &uuids)
        .await?;
    let flights = flights_repo.delete_by_uuids(&uuids).await?;

    info!(flights, points, "Retention sweep removed expired live flights");
    metrics::counter!("retention.flights_deleted_total").increment(flights);
    Ok((flights, points))
}

/// Daily retention ticker.
pub fn spawn_retention_sweeper(
    flights_repo: FlightsRepository,
    points_repo: PointsRepository,
    writer_stats: Arc<ProcessorStats>,
    retention_hours: i64,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) =
                        retention_sweep(&flights_repo, &points_repo, &writer_stats, retention_hours)
                            .await
                    {
                        error!(error = %e, "Retention sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}

/// Daily DLQ reaper: drops dead-lettered items older than 24 hours.
/// Operator re-enqueueing is the only other way items leave a DLQ.
pub fn spawn_dlq_reaper(
    queue: RedisQueue,
    mut shutdown: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(SWEEP_INTERVAL);
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    for name in QueueName::ALL {
                        match queue.dlq_reap(name, DLQ_MAX_AGE_HOURS).await {
                            Ok(0) => {}
                            Ok(reaped) => {
                                info!(queue = %name, reaped, "Reaped aged DLQ items");
                            }
                            Err(e) => error!(queue = %name, error = %e, "DLQ reap failed"),
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
    })
}
