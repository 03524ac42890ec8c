use anyhow::Result;
use std::collections::HashSet;

use crate::flights_repo::FlightsRepository;
use crate::points::coordinates_valid;
use crate::queue::QueueItem;

/// DLQ reason for items whose flight row is gone or never existed.
/// Foreign-key misses are permanent, so they are never retried.
pub const REASON_FOREIGN_KEY: &str = "foreign_key_missing";
/// DLQ reason for malformed point data.
pub const REASON_SHAPE: &str = "invalid_shape";

/// Pre-flight check for dequeued batches: every referenced flight must exist
/// and every point must be well-formed before the writer attempts an insert.
#[derive(Clone)]
pub struct Validator {
    flights_repo: FlightsRepository,
}

pub struct ValidationSplit {
    pub valid: Vec<QueueItem>,
    pub rejected: Vec<(QueueItem, &'static str)>,
}

impl Validator {
    pub fn new(flights_repo: FlightsRepository) -> Self {
        Self { flights_repo }
    }

    /// Split a dequeued batch into writable items and DLQ-bound items.
    ///
    /// A transient store failure during the existence query propagates as an
    /// error; the caller treats it like any writer failure and retries.
    pub async fn split(&self, items: Vec<QueueItem>) -> Result<ValidationSplit> {
        let flight_ids: Vec<String> = items
            .iter()
            .map(|i| i.flight_id.clone())
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();

        let existing = self.flights_repo.existing_flight_ids(&flight_ids).await?;

        let mut valid = Vec::with_capacity(items.len());
        let mut rejected = Vec::new();

        for item in items {
            if !existing.contains(&item.flight_id) {
                rejected.push((item, REASON_FOREIGN_KEY));
                continue;
            }
            if !Self::shape_ok(&item) {
                rejected.push((item, REASON_SHAPE));
                continue;
            }
            valid.push(item);
        }

        Ok(ValidationSplit { valid, rejected })
    }

    fn shape_ok(item: &QueueItem) -> bool {
        !item.points.is_empty()
            && item
                .points
                .iter()
                .all(|p| coordinates_valid(p.lat, p.lon) && p.flight_id == item.flight_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::points::TrackPoint;
    use crate::queue::QueueName;
    use chrono::Utc;
    use uuid::Uuid;

    fn item_with_point(flight_id: &str, lat: f64, lon: f64) -> QueueItem {
        QueueItem::new(
            QueueName::LivePoints,
            flight_id.into(),
            vec![TrackPoint {
                flight_id: flight_id.into(),
                flight_uuid: Uuid::new_v4(),
                lat,
                lon,
                elevation: None,
                datetime: Utc::now(),
            }],
        )
    }

    #[test]
    fn test_shape_check() {
        assert!(Validator::shape_ok(&item_with_point("f", 45.0, 10.0)));
        assert!(!Validator::shape_ok(&item_with_point("f", 95.0, 10.0)));
        assert!(!Validator::shape_ok(&item_with_point("f", 45.0, -190.0)));

        // empty batches carry nothing worth writing
        let empty = QueueItem::new(QueueName::LivePoints, "f".into(), vec![]);
        assert!(!Validator::shape_ok(&empty));

        // a point smuggled in under another flight's item is malformed
        let mut crossed = item_with_point("f", 45.0, 10.0);
        crossed.points[0].flight_id = "other".into();
        assert!(!Validator::shape_ok(&crossed));
    }
}
