//! # SQLite Segment Store
//!
//! Durable [`SegmentStore`] backed by a single SQLite database.
//!
//! ## Tables
//!
//! - `segment_limits`: one row per segment id with the per-source limits and
//!   the long-window contextual averages
//! - `speeding_events`: one row per dedup key, event points stored as a
//!   MessagePack blob
//!
//! Every batch is written in one transaction with `INSERT OR REPLACE`, so
//! re-writing the same key overwrites instead of duplicating.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Mutex, PoisonError};

use log::{debug, info};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{Result, SpeedMatchError};
use crate::store::{SegmentStore, SpeedingEventRecord};
use crate::{SegmentCacheRecord, TracePoint};

/// SQLite-backed segment store.
pub struct SqliteStore {
    db: Mutex<Connection>,
}

fn read_error(e: rusqlite::Error) -> SpeedMatchError {
    SpeedMatchError::PersistenceRead {
        message: e.to_string(),
    }
}

impl SqliteStore {
    /// Open (or create) the database at `path`.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let db = Connection::open(path.as_ref())?;
        Self::init_schema(&db)?;
        info!("[Store] Opened segment store at {}", path.as_ref().display());
        Ok(Self { db: Mutex::new(db) })
    }

    /// Create an in-memory database (for testing).
    pub fn in_memory() -> Result<Self> {
        let db = Connection::open_in_memory()?;
        Self::init_schema(&db)?;
        Ok(Self { db: Mutex::new(db) })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            -- Resolved limits per segment (zero = not resolved by that source)
            CREATE TABLE IF NOT EXISTS segment_limits (
                segment_id TEXT PRIMARY KEY,
                road_name TEXT NOT NULL,
                road_type TEXT NOT NULL,
                osm_limit REAL NOT NULL DEFAULT 0,
                sign_limit REAL NOT NULL DEFAULT 0,
                reverse_geocode_limit REAL NOT NULL DEFAULT 0,
                contextual_avg_30_day REAL NOT NULL DEFAULT 0,
                contextual_avg_60_day REAL NOT NULL DEFAULT 0,
                contextual_avg_180_day REAL NOT NULL DEFAULT 0,
                updated_at INTEGER NOT NULL
            );

            -- Speeding events keyed by segment#start#user
            CREATE TABLE IF NOT EXISTS speeding_events (
                dedup_key TEXT PRIMARY KEY,
                segment_id TEXT NOT NULL,
                user_id TEXT NOT NULL,
                start_timestamp INTEGER NOT NULL,
                end_timestamp INTEGER NOT NULL,
                duration_seconds INTEGER NOT NULL,
                max_excess_mph REAL NOT NULL,
                points BLOB NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_events_user ON speeding_events(user_id, start_timestamp);
        "#,
        )?;
        Ok(())
    }

    /// Events recorded for one user, ordered by start time.
    pub fn events_for_user(&self, user_id: &str) -> Result<Vec<SpeedingEventRecord>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db
            .prepare(
                "SELECT segment_id, start_timestamp, end_timestamp, duration_seconds,
                        user_id, max_excess_mph, points
                 FROM speeding_events WHERE user_id = ? ORDER BY start_timestamp",
            )
            .map_err(read_error)?;

        let rows = stmt
            .query_map(params![user_id], |row| {
                Ok((
                    row.get::<_, String>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                    row.get::<_, i64>(3)?,
                    row.get::<_, String>(4)?,
                    row.get::<_, f64>(5)?,
                    row.get::<_, Vec<u8>>(6)?,
                ))
            })
            .map_err(read_error)?;

        let mut events = Vec::new();
        for row in rows {
            let (segment_id, start, end, duration, user_id, max_excess, blob) =
                row.map_err(read_error)?;
            let points: Vec<TracePoint> = rmp_serde::from_slice(&blob)?;
            events.push(SpeedingEventRecord {
                segment_id,
                start_timestamp: start,
                end_timestamp: end,
                duration_seconds: duration,
                user_id,
                max_excess_mph: max_excess,
                points,
            });
        }
        Ok(events)
    }
}

impl SegmentStore for SqliteStore {
    fn get_many(&self, ids: &[String]) -> Result<HashMap<String, SegmentCacheRecord>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db
            .prepare_cached(
                "SELECT segment_id, road_name, road_type, osm_limit, sign_limit,
                        reverse_geocode_limit, contextual_avg_30_day, contextual_avg_60_day,
                        contextual_avg_180_day, updated_at
                 FROM segment_limits WHERE segment_id = ?",
            )
            .map_err(read_error)?;

        let mut found = HashMap::new();
        for id in ids {
            let record = stmt
                .query_row(params![id], |row| {
                    Ok(SegmentCacheRecord {
                        segment_id: row.get(0)?,
                        road_name: row.get(1)?,
                        road_type: row.get(2)?,
                        osm_limit: row.get(3)?,
                        sign_limit: row.get(4)?,
                        reverse_geocode_limit: row.get(5)?,
                        contextual_avg_30_day: row.get(6)?,
                        contextual_avg_60_day: row.get(7)?,
                        contextual_avg_180_day: row.get(8)?,
                        updated_at: row.get(9)?,
                    })
                })
                .optional()
                .map_err(read_error)?;
            if let Some(record) = record {
                found.insert(id.clone(), record);
            }
        }

        debug!("[Store] {} of {} segment records found", found.len(), ids.len());
        Ok(found)
    }

    fn put_many(&self, records: &[SegmentCacheRecord]) -> Result<()> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO segment_limits
                    (segment_id, road_name, road_type, osm_limit, sign_limit,
                     reverse_geocode_limit, contextual_avg_30_day, contextual_avg_60_day,
                     contextual_avg_180_day, updated_at)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for r in records {
                stmt.execute(params![
                    r.segment_id,
                    r.road_name,
                    r.road_type,
                    r.osm_limit,
                    r.sign_limit,
                    r.reverse_geocode_limit,
                    r.contextual_avg_30_day,
                    r.contextual_avg_60_day,
                    r.contextual_avg_180_day,
                    r.updated_at,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn put_events(&self, events: &[SpeedingEventRecord]) -> Result<()> {
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = db.transaction()?;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR REPLACE INTO speeding_events
                    (dedup_key, segment_id, user_id, start_timestamp, end_timestamp,
                     duration_seconds, max_excess_mph, points)
                 VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
            )?;
            for e in events {
                let points_blob = rmp_serde::to_vec(&e.points)?;
                stmt.execute(params![
                    e.dedup_key(),
                    e.segment_id,
                    e.user_id,
                    e.start_timestamp,
                    e.end_timestamp,
                    e.duration_seconds,
                    e.max_excess_mph,
                    points_blob,
                ])?;
            }
        }
        tx.commit()?;
        Ok(())
    }

    fn event_count(&self) -> Result<usize> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let count: i64 = db
            .query_row("SELECT COUNT(*) FROM speeding_events", [], |row| row.get(0))
            .map_err(read_error)?;
        Ok(count as usize)
    }
}
