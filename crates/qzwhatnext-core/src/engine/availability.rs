use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::warn;
use uuid::Uuid;

use crate::config::EngineConfig;
use crate::error::EngineError;

/// Half-open interval of absolute time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

impl Interval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Self {
        Self { start, end }
    }

    pub fn length(&self) -> Duration {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }

    pub fn intersects(&self, other: &Interval) -> bool {
        self.start < other.end && other.start < self.end
    }

    /// Clip to the given bounds; may come back empty.
    pub fn clipped(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Interval {
        Interval::new(self.start.max(start), self.end.min(end))
    }
}

/// A reserved interval read from the availability provider. Only the bounds,
/// the managed marker, and (for managed detection) the event id are exposed;
/// titles, notes and attendees never cross this boundary.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    /// Provider-side marker: the event carries the engine's managed
    /// property.
    pub engine_managed: bool,
    /// External event id, used to cross-check against stored block linkage.
    pub event_id: Option<String>,
}

/// Boundary 1: read-only external calendar access.
#[async_trait]
pub trait AvailabilityProvider: Send + Sync {
    async fn busy_intervals(
        &self,
        user_id: Uuid,
        window: Interval,
    ) -> Result<Vec<BusyInterval>, EngineError>;
}

#[derive(Debug, Clone)]
struct Snapshot {
    taken_at: DateTime<Utc>,
    intervals: Vec<BusyInterval>,
}

/// Last successful provider read per user, consulted when the provider is
/// down and the snapshot is still within tolerance.
#[derive(Debug, Default)]
pub struct SnapshotCache {
    inner: Mutex<HashMap<Uuid, Snapshot>>,
}

impl SnapshotCache {
    pub fn new() -> Self {
        Self::default()
    }

    fn store(&self, user_id: Uuid, intervals: Vec<BusyInterval>, taken_at: DateTime<Utc>) {
        if let Ok(mut cache) = self.inner.lock() {
            cache.insert(
                user_id,
                Snapshot {
                    taken_at,
                    intervals,
                },
            );
        }
    }

    fn fresh(&self, user_id: Uuid, now: DateTime<Utc>, max_age: Duration) -> Option<Vec<BusyInterval>> {
        let cache = self.inner.lock().ok()?;
        let snapshot = cache.get(&user_id)?;
        (now - snapshot.taken_at <= max_age).then(|| snapshot.intervals.clone())
    }
}

/// Read busy intervals with timeout, bounded retries and exponential
/// backoff. On final failure, fall back to a snapshot no older than the
/// configured tolerance; otherwise the rebuild aborts with
/// `AvailabilityUnavailable`. `Unauthorized` aborts immediately.
pub async fn fetch_busy_intervals(
    provider: &dyn AvailabilityProvider,
    cache: &SnapshotCache,
    config: &EngineConfig,
    user_id: Uuid,
    window: Interval,
    now: DateTime<Utc>,
    cancel: &CancellationToken,
) -> Result<Vec<BusyInterval>, EngineError> {
    let mut backoff = std::time::Duration::from_millis(500);
    let backoff_cap = std::time::Duration::from_secs(8);

    for attempt in 1..=config.remote_retry_attempts.max(1) {
        if cancel.is_cancelled() {
            return Err(EngineError::Cancelled);
        }

        match tokio::time::timeout(config.remote_timeout(), provider.busy_intervals(user_id, window))
            .await
        {
            Ok(Ok(intervals)) => {
                cache.store(user_id, intervals.clone(), now);
                return Ok(intervals);
            }
            Ok(Err(e @ EngineError::Unauthorized(_))) => return Err(e),
            Ok(Err(e)) => {
                warn!(user_id = %user_id, attempt, error = %e, "availability read failed");
            }
            Err(_) => {
                warn!(user_id = %user_id, attempt, "availability read timed out");
            }
        }

        if attempt < config.remote_retry_attempts.max(1) {
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(backoff_cap);
        }
    }

    match cache.fresh(user_id, now, config.availability_snapshot_max_age()) {
        Some(intervals) => {
            warn!(user_id = %user_id, "availability provider down, using cached snapshot");
            Ok(intervals)
        }
        None => Err(EngineError::AvailabilityUnavailable),
    }
}

/// Merge overlapping or touching reserved intervals into a normalized,
/// ordered list.
pub fn merge_intervals(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.retain(|iv| !iv.is_empty());
    intervals.sort_by_key(|iv| (iv.start, iv.end));

    let mut merged: Vec<Interval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                last.end = last.end.max(interval.end);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Subtract reserved time from the horizon, producing the free-interval
/// list: half-open, ordered, non-overlapping.
pub fn build_free_intervals(horizon: Interval, reserved: &[Interval]) -> Vec<Interval> {
    let reserved = merge_intervals(reserved.to_vec());
    let mut free = Vec::new();
    let mut cursor = horizon.start;

    for busy in &reserved {
        if busy.end <= horizon.start || busy.start >= horizon.end {
            continue;
        }
        let clipped = busy.clipped(horizon.start, horizon.end);
        if clipped.start > cursor {
            free.push(Interval::new(cursor, clipped.start));
        }
        cursor = cursor.max(clipped.end);
    }

    if cursor < horizon.end {
        free.push(Interval::new(cursor, horizon.end));
    }

    free
}

/// Remove one placed interval from the free list, splitting as needed.
pub fn subtract_from_free(free: &mut Vec<Interval>, placed: Interval) {
    let mut result = Vec::with_capacity(free.len() + 1);
    for interval in free.drain(..) {
        if !interval.intersects(&placed) {
            result.push(interval);
            continue;
        }
        if interval.start < placed.start {
            result.push(Interval::new(interval.start, placed.start));
        }
        if placed.end < interval.end {
            result.push(Interval::new(placed.end, interval.end));
        }
    }
    *free = result;
}
