//! End-to-end speeding analysis of one trace.
//!
//! Stages run as bulk transformations over the whole trace:
//! batch -> fetch road network per window -> match points -> resolve limits
//! per unique segment -> write back -> detect speeding -> persist events ->
//! summarize. External-service stages run with bounded concurrency; every
//! point-level output is joined back by point index and segment id, so it is
//! in timestamp order regardless of completion order.

use std::collections::HashMap;

use log::{info, warn};
use serde::{Deserialize, Serialize};

use crate::batcher::batch_trace;
use crate::config::PipelineConfig;
use crate::detector::{detect_speeding, ResolvedPoint, RoadTypeStats, SpeedingEvent};
use crate::error::Result;
use crate::matcher::match_windows;
use crate::resolver::{ResolutionOutcome, ReverseGeocoder, SpeedLimitResolver};
use crate::road_network::{RoadNetworkResolver, RoadNetworkService};
use crate::signs::TrafficSignService;
use crate::store::{write_chunked, SegmentStore, SpeedingEventRecord};
use crate::summary::{summarize_trip, TripSummary};
use crate::{LimitSource, MatchResult, RoadSegment, SegmentCacheRecord, TracePoint};

/// Road type reported for points that matched no segment.
pub const UNMATCHED_ROAD_TYPE: &str = "unmatched";

/// Everything known about one trace point after the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PointResolution {
    pub point: TracePoint,
    pub matched: Option<MatchResult>,
    pub road_name: Option<String>,
    pub road_type: Option<String>,
    /// Enforceable limit in mph
    pub speed_limit: Option<f64>,
    pub limit_source: Option<LimitSource>,
    /// Point belongs to an emitted speeding event
    pub speeding: bool,
}

/// Counters for one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PipelineStats {
    pub points: usize,
    pub windows: usize,
    pub road_network_fetches: usize,
    pub failed_windows: usize,
    pub unmatched_points: usize,
    pub unique_segments: usize,
    /// Segments matched by too few points to be written to the store
    pub noise_segments: usize,
    /// The store could not be read, so segment records were not written back
    pub cache_read_failed: bool,
    /// Segments answered by the store, including persisted all-zero records
    pub cache_hits: usize,
    pub sign_lookups: usize,
    pub geocode_lookups: usize,
    pub unknown_limits: usize,
    pub records_written: usize,
    pub write_batches_dropped: usize,
    pub events_emitted: usize,
    pub events_persisted: usize,
}

/// Output of [`SpeedingPipeline::run`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TripReport {
    /// One entry per input point, in timestamp order
    pub resolutions: Vec<PointResolution>,
    pub events: Vec<SpeedingEvent>,
    pub road_stats: Vec<RoadTypeStats>,
    pub summary: TripSummary,
    pub stats: PipelineStats,
}

/// The map-matching, limit-resolution and speeding-detection pipeline.
pub struct SpeedingPipeline<R, T, G, S> {
    road_network: RoadNetworkResolver<R>,
    speed_limits: SpeedLimitResolver<T, G>,
    store: S,
    config: PipelineConfig,
}

impl<R, T, G, S> SpeedingPipeline<R, T, G, S>
where
    R: RoadNetworkService,
    T: TrafficSignService,
    G: ReverseGeocoder,
    S: SegmentStore,
{
    /// Build a pipeline from its collaborators. Fails on an invalid config.
    pub fn new(road_network: R, signs: T, geocoder: G, store: S, config: PipelineConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            road_network: RoadNetworkResolver::new(road_network, config.retry),
            speed_limits: SpeedLimitResolver::new(
                signs,
                geocoder,
                config.retry,
                config.sign_match_radius_m,
            ),
            store,
            config,
        })
    }

    pub fn road_network(&self) -> &RoadNetworkResolver<R> {
        &self.road_network
    }

    pub fn speed_limits(&self) -> &SpeedLimitResolver<T, G> {
        &self.speed_limits
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    /// Analyze one complete trace.
    ///
    /// Service and store failures degrade the affected points or writes and
    /// are reported in [`PipelineStats`]; they never abort the run.
    pub async fn run(&self, trace: &[TracePoint]) -> TripReport {
        if trace.is_empty() {
            info!("[Pipeline] Empty trace, nothing to do");
            return TripReport::default();
        }

        let config = &self.config;
        let mut stats = PipelineStats {
            points: trace.len(),
            ..Default::default()
        };

        let mut points = trace.to_vec();
        points.sort_by_key(|p| p.timestamp);

        // Road network per window
        let windows = batch_trace(&points, config.window_size);
        let fetches_before = self.road_network.fetch_count();
        let segment_sets = self
            .road_network
            .resolve_windows(&windows, config.concurrency)
            .await;
        stats.windows = windows.len();
        stats.road_network_fetches = self.road_network.fetch_count() - fetches_before;
        stats.failed_windows = segment_sets.iter().filter(|s| s.failed).count();

        // Nearest segment per point
        let matches = match_windows(&points, &windows, &segment_sets);
        stats.unmatched_points = matches.iter().filter(|m| m.is_none()).count();

        let mut segments_by_id: HashMap<&str, &RoadSegment> = HashMap::new();
        for set in &segment_sets {
            for segment in set.segments.iter() {
                segments_by_id.entry(segment.id.as_str()).or_insert(segment);
            }
        }

        // Unique matched segments, in first-match order
        let mut occurrences: HashMap<&str, usize> = HashMap::new();
        let mut unique: Vec<RoadSegment> = Vec::new();
        for m in matches.iter().flatten() {
            let count = occurrences.entry(m.segment_id.as_str()).or_insert(0);
            if *count == 0 {
                if let Some(segment) = segments_by_id.get(m.segment_id.as_str()) {
                    unique.push((*segment).clone());
                }
            }
            *count += 1;
        }
        stats.unique_segments = unique.len();

        // Limits: cache first, then the source chain
        let ids: Vec<String> = unique.iter().map(|s| s.id.clone()).collect();
        let cached = match self.store.get_many(&ids) {
            Ok(cached) => cached,
            Err(e) => {
                warn!("[Pipeline] Cache read failed, resolving all segments: {}", e);
                stats.cache_read_failed = true;
                HashMap::new()
            }
        };

        let hits_before = self.speed_limits.cache_hits();
        let sign_before = self.speed_limits.sign_lookups();
        let geocode_before = self.speed_limits.geocode_lookups();
        let outcomes = self
            .speed_limits
            .resolve_segments(&unique, &cached, config.concurrency)
            .await;
        stats.cache_hits = self.speed_limits.cache_hits() - hits_before;
        stats.sign_lookups = self.speed_limits.sign_lookups() - sign_before;
        stats.geocode_lookups = self.speed_limits.geocode_lookups() - geocode_before;
        stats.unknown_limits = outcomes.iter().filter(|o| !o.resolved.is_enforceable()).count();

        // Write back, skipping GPS-noise segments. Without a cache read the
        // store may already hold higher-priority values for these ids.
        let mut records: Vec<SegmentCacheRecord> = Vec::new();
        let new_records: Vec<&SegmentCacheRecord> = if stats.cache_read_failed {
            warn!("[Pipeline] Skipping segment write-back after failed cache read");
            Vec::new()
        } else {
            outcomes.iter().filter_map(|o| o.new_record.as_ref()).collect()
        };
        for record in new_records {
            let seen = occurrences.get(record.segment_id.as_str()).copied().unwrap_or(0);
            if seen >= config.min_segment_occurrences {
                records.push(record.clone());
            } else {
                stats.noise_segments += 1;
            }
        }
        let written = write_chunked(
            "segment records",
            &records,
            config.write_chunk_size,
            &config.retry,
            |chunk| self.store.put_many(chunk),
        )
        .await;
        stats.records_written = written.written;
        stats.write_batches_dropped += written.dropped_batches;

        // Sustained speeding over the joined stream
        let limits_by_id: HashMap<&str, &ResolutionOutcome> = outcomes
            .iter()
            .map(|o| (o.resolved.segment_id.as_str(), o))
            .collect();
        let resolved_points: Vec<ResolvedPoint> = points
            .iter()
            .zip(&matches)
            .map(|(point, m)| {
                let segment = m.as_ref().and_then(|m| segments_by_id.get(m.segment_id.as_str()));
                ResolvedPoint {
                    point: *point,
                    segment_id: m.as_ref().map(|m| m.segment_id.clone()),
                    road_type: segment
                        .map(|s| s.road_type.clone())
                        .unwrap_or_else(|| UNMATCHED_ROAD_TYPE.to_string()),
                    speed_limit: m
                        .as_ref()
                        .and_then(|m| limits_by_id.get(m.segment_id.as_str()))
                        .and_then(|o| o.resolved.value),
                }
            })
            .collect();

        let detection = detect_speeding(&resolved_points, &config.speeding);
        stats.events_emitted = detection.events.len();

        let event_records: Vec<SpeedingEventRecord> = detection
            .events
            .iter()
            .map(|e| SpeedingEventRecord::from_event(e, &config.user_id))
            .collect();
        let persisted = write_chunked(
            "speeding events",
            &event_records,
            config.write_chunk_size,
            &config.retry,
            |chunk| self.store.put_events(chunk),
        )
        .await;
        stats.events_persisted = persisted.written;
        stats.write_batches_dropped += persisted.dropped_batches;

        let resolutions: Vec<PointResolution> = resolved_points
            .iter()
            .zip(matches)
            .zip(&detection.point_events)
            .map(|((rp, matched), event)| {
                let segment = matched
                    .as_ref()
                    .and_then(|m| segments_by_id.get(m.segment_id.as_str()));
                let outcome = matched
                    .as_ref()
                    .and_then(|m| limits_by_id.get(m.segment_id.as_str()));
                PointResolution {
                    point: rp.point,
                    road_name: segment.map(|s| s.name.clone()),
                    road_type: segment.map(|s| s.road_type.clone()),
                    speed_limit: rp.speed_limit,
                    limit_source: outcome.map(|o| o.resolved.source),
                    speeding: event.is_some(),
                    matched,
                }
            })
            .collect();

        let summary = summarize_trip(&points);

        info!(
            "[Pipeline] {} points, {} segments ({} cached, {} unknown), {} events, {:.2} km in {} s",
            stats.points,
            stats.unique_segments,
            stats.cache_hits,
            stats.unknown_limits,
            stats.events_emitted,
            summary.distance_km(),
            summary.duration_secs
        );

        TripReport {
            resolutions,
            events: detection.events,
            road_stats: detection.road_stats,
            summary,
            stats,
        }
    }
}
