//! Segment persistence store.
//!
//! The store is the source of truth across runs: a segment with a record is
//! never sent to the sign or geocoding services again. Writes are idempotent
//! upserts keyed by segment id (records) or dedup key (speeding events).

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use log::{debug, warn};
use serde::{Deserialize, Serialize};

use crate::detector::SpeedingEvent;
use crate::error::{Result, SpeedMatchError};
use crate::retry::RetryPolicy;
use crate::{SegmentCacheRecord, TracePoint};

/// Durable key-value store for segment records and speeding events.
pub trait SegmentStore: Send + Sync {
    /// Records for the given ids. Missing ids are absent from the map.
    fn get_many(&self, ids: &[String]) -> Result<HashMap<String, SegmentCacheRecord>>;

    /// Upsert records; an existing id is overwritten.
    fn put_many(&self, records: &[SegmentCacheRecord]) -> Result<()>;

    /// Upsert events by their dedup key.
    fn put_events(&self, events: &[SpeedingEventRecord]) -> Result<()>;

    fn event_count(&self) -> Result<usize>;
}

impl<T: SegmentStore + ?Sized> SegmentStore for Arc<T> {
    fn get_many(&self, ids: &[String]) -> Result<HashMap<String, SegmentCacheRecord>> {
        (**self).get_many(ids)
    }

    fn put_many(&self, records: &[SegmentCacheRecord]) -> Result<()> {
        (**self).put_many(records)
    }

    fn put_events(&self, events: &[SpeedingEventRecord]) -> Result<()> {
        (**self).put_events(events)
    }

    fn event_count(&self) -> Result<usize> {
        (**self).event_count()
    }
}

/// A speeding event as persisted for one user.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedingEventRecord {
    pub segment_id: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub duration_seconds: i64,
    pub user_id: String,
    pub max_excess_mph: f64,
    pub points: Vec<TracePoint>,
}

impl SpeedingEventRecord {
    pub fn from_event(event: &SpeedingEvent, user_id: &str) -> Self {
        Self {
            segment_id: event.segment_id.clone(),
            start_timestamp: event.start_timestamp,
            end_timestamp: event.end_timestamp,
            duration_seconds: event.duration_seconds,
            user_id: user_id.to_string(),
            max_excess_mph: event.max_excess_mph,
            points: event.points.clone(),
        }
    }

    /// `segment#start#user`: one record per user, segment and start time.
    pub fn dedup_key(&self) -> String {
        format!("{}#{}#{}", self.segment_id, self.start_timestamp, self.user_id)
    }
}

// ============================================================================
// In-memory store
// ============================================================================

/// Mutex-guarded in-process store.
///
/// Used for tests and for runs that do not need durability.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    records: Mutex<HashMap<String, SegmentCacheRecord>>,
    events: Mutex<HashMap<String, SpeedingEventRecord>>,
    get_calls: AtomicUsize,
    put_calls: AtomicUsize,
    failing_writes: AtomicUsize,
    failing_reads: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Store pre-populated with records.
    pub fn with_records(records: impl IntoIterator<Item = SegmentCacheRecord>) -> Self {
        let store = Self::new();
        store
            .records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(records.into_iter().map(|r| (r.segment_id.clone(), r)));
        store
    }

    /// Make the next `n` write calls fail, to simulate an unavailable backend.
    pub fn fail_next_writes(&self, n: usize) {
        self.failing_writes.store(n, Ordering::SeqCst);
    }

    /// Make the next `n` read calls fail.
    pub fn fail_next_reads(&self, n: usize) {
        self.failing_reads.store(n, Ordering::SeqCst);
    }

    pub fn record(&self, segment_id: &str) -> Option<SegmentCacheRecord> {
        self.records
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(segment_id)
            .cloned()
    }

    pub fn record_count(&self) -> usize {
        self.records.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn events(&self) -> Vec<SpeedingEventRecord> {
        let mut events: Vec<SpeedingEventRecord> = self
            .events
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();
        events.sort_by_key(|e| e.start_timestamp);
        events
    }

    pub fn get_calls(&self) -> usize {
        self.get_calls.load(Ordering::SeqCst)
    }

    pub fn put_calls(&self) -> usize {
        self.put_calls.load(Ordering::SeqCst)
    }

    fn check_write(&self) -> Result<()> {
        self.put_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_writes
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SpeedMatchError::PersistenceWrite {
                message: "store unavailable".to_string(),
            });
        }
        Ok(())
    }
}

impl SegmentStore for InMemoryStore {
    fn get_many(&self, ids: &[String]) -> Result<HashMap<String, SegmentCacheRecord>> {
        self.get_calls.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failing_reads
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if failing.is_ok() {
            return Err(SpeedMatchError::PersistenceRead {
                message: "store unavailable".to_string(),
            });
        }
        let records = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        Ok(ids
            .iter()
            .filter_map(|id| records.get(id).map(|r| (id.clone(), r.clone())))
            .collect())
    }

    fn put_many(&self, records: &[SegmentCacheRecord]) -> Result<()> {
        self.check_write()?;
        let mut stored = self.records.lock().unwrap_or_else(PoisonError::into_inner);
        for record in records {
            stored.insert(record.segment_id.clone(), record.clone());
        }
        Ok(())
    }

    fn put_events(&self, events: &[SpeedingEventRecord]) -> Result<()> {
        self.check_write()?;
        let mut stored = self.events.lock().unwrap_or_else(PoisonError::into_inner);
        for event in events {
            stored.insert(event.dedup_key(), event.clone());
        }
        Ok(())
    }

    fn event_count(&self) -> Result<usize> {
        Ok(self.events.lock().unwrap_or_else(PoisonError::into_inner).len())
    }
}

// ============================================================================
// Chunked writes
// ============================================================================

/// Outcome of a chunked write.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub written: usize,
    pub dropped_batches: usize,
    pub dropped_records: usize,
}

/// Write `items` in chunks of `chunk_size`, retrying each chunk under `retry`.
///
/// A chunk that still fails after its retries is logged and dropped; the
/// remaining chunks are still attempted.
pub async fn write_chunked<T, F>(
    label: &str,
    items: &[T],
    chunk_size: usize,
    retry: &RetryPolicy,
    write: F,
) -> WriteReport
where
    F: Fn(&[T]) -> Result<()>,
{
    let mut report = WriteReport::default();
    let write = &write;

    for (i, chunk) in items.chunks(chunk_size.max(1)).enumerate() {
        match retry.run(label, move || async move { write(chunk) }).await {
            Ok(()) => {
                report.written += chunk.len();
                debug!("[Store] {} chunk {} wrote {} items", label, i, chunk.len());
            }
            Err(e) => {
                report.dropped_batches += 1;
                report.dropped_records += chunk.len();
                warn!(
                    "[Store] Dropping {} chunk {} ({} items): {}",
                    label,
                    i,
                    chunk.len(),
                    e
                );
            }
        }
    }

    report
}
