//! Sustained speeding detection.
//!
//! A single left-to-right scan over the time-ordered trace. A point is
//! speeding when its travel speed exceeds the resolved limit by at least the
//! configured threshold. Consecutive speeding points form an open event; the
//! first non-speeding point closes it, and it is emitted only if its span
//! (last timestamp minus first timestamp) reaches the minimum duration.
//!
//! Points without an enforceable limit are handled per
//! [`UnknownLimitPolicy`]: skipped entirely, or treated as non-speeding.

use std::collections::BTreeMap;

use log::debug;
use serde::{Deserialize, Serialize};

use crate::config::{SpeedingConfig, UnknownLimitPolicy};
use crate::geo_utils::haversine_distance;
use crate::TracePoint;

/// A trace point joined with its matched segment and resolved limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedPoint {
    pub point: TracePoint,
    /// `None` when the point could not be matched
    pub segment_id: Option<String>,
    pub road_type: String,
    /// Enforceable limit in mph; `None` for unknown
    pub speed_limit: Option<f64>,
}

impl ResolvedPoint {
    fn enforceable_limit(&self) -> Option<f64> {
        self.speed_limit.filter(|v| v.is_finite() && *v > 0.0)
    }
}

/// A sustained interval of travel above the limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SpeedingEvent {
    /// Segment of the event's first point
    pub segment_id: String,
    pub start_timestamp: i64,
    pub end_timestamp: i64,
    pub duration_seconds: i64,
    pub points: Vec<TracePoint>,
    /// Largest speed minus limit observed during the event
    pub max_excess_mph: f64,
}

/// Distance and time driven on one road type over the trip.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadTypeStats {
    pub road_type: String,
    pub total_distance_m: f64,
    pub total_time_secs: i64,
    pub speeding_distance_m: f64,
    pub speeding_time_secs: i64,
    /// Speeding distance on this road type as a share of the whole trip's distance
    pub speeding_distance_pct: f64,
    /// Speeding time on this road type as a share of the whole trip's duration
    pub speeding_time_pct: f64,
}

impl RoadTypeStats {
    fn new(road_type: &str) -> Self {
        Self {
            road_type: road_type.to_string(),
            total_distance_m: 0.0,
            total_time_secs: 0,
            speeding_distance_m: 0.0,
            speeding_time_secs: 0,
            speeding_distance_pct: 0.0,
            speeding_time_pct: 0.0,
        }
    }
}

/// Output of [`detect_speeding`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SpeedingReport {
    /// Emitted events in timestamp order, never overlapping
    pub events: Vec<SpeedingEvent>,
    /// Per input point, the index of the emitted event containing it
    pub point_events: Vec<Option<usize>>,
    /// Sorted by road type
    pub road_stats: Vec<RoadTypeStats>,
    pub total_distance_m: f64,
    pub total_time_secs: i64,
    pub speeding_distance_m: f64,
    pub speeding_time_secs: i64,
}

/// Open event: indices into the input and the running maximum excess.
struct OpenEvent {
    members: Vec<usize>,
    max_excess: f64,
}

impl OpenEvent {
    fn new() -> Self {
        Self {
            members: Vec::new(),
            max_excess: f64::MIN,
        }
    }

    fn push(&mut self, index: usize, excess: f64) {
        self.members.push(index);
        self.max_excess = self.max_excess.max(excess);
    }

    /// Emit the open event if it spans at least `min_duration` and reset.
    fn close(
        &mut self,
        points: &[ResolvedPoint],
        min_duration: i64,
        events: &mut Vec<(Vec<usize>, f64)>,
    ) {
        if let (Some(&first), Some(&last)) = (self.members.first(), self.members.last()) {
            let span = points[last].point.timestamp - points[first].point.timestamp;
            if span >= min_duration {
                events.push((std::mem::take(&mut self.members), self.max_excess));
            }
        }
        self.members.clear();
        self.max_excess = f64::MIN;
    }
}

/// Detect sustained speeding events and per-road-type exposure.
///
/// `points` must be sorted by timestamp.
pub fn detect_speeding(points: &[ResolvedPoint], config: &SpeedingConfig) -> SpeedingReport {
    let min_duration = config.min_duration_secs;
    let mut closed: Vec<(Vec<usize>, f64)> = Vec::new();
    let mut open = OpenEvent::new();

    for (i, rp) in points.iter().enumerate() {
        let Some(limit) = rp.enforceable_limit() else {
            match config.unknown_limit_policy {
                UnknownLimitPolicy::Skip => continue,
                UnknownLimitPolicy::Break => {
                    open.close(points, min_duration, &mut closed);
                    continue;
                }
            }
        };

        let excess = rp.point.speed_mph - limit;
        if excess >= config.excess_threshold_mph {
            open.push(i, excess);
        } else {
            open.close(points, min_duration, &mut closed);
        }
    }
    open.close(points, min_duration, &mut closed);

    let mut point_events = vec![None; points.len()];
    let events: Vec<SpeedingEvent> = closed
        .iter()
        .enumerate()
        .map(|(event_index, (members, max_excess))| {
            for &m in members {
                point_events[m] = Some(event_index);
            }
            build_event(points, members, *max_excess)
        })
        .collect();

    let mut report = road_statistics(points, &closed);
    report.events = events;
    report.point_events = point_events;

    debug!(
        "[Speeding] {} events over {} points ({} s speeding of {} s)",
        report.events.len(),
        points.len(),
        report.speeding_time_secs,
        report.total_time_secs
    );
    report
}

fn build_event(points: &[ResolvedPoint], members: &[usize], max_excess: f64) -> SpeedingEvent {
    let first = &points[members[0]];
    let last = &points[members[members.len() - 1]];
    SpeedingEvent {
        segment_id: first.segment_id.clone().unwrap_or_default(),
        start_timestamp: first.point.timestamp,
        end_timestamp: last.point.timestamp,
        duration_seconds: last.point.timestamp - first.point.timestamp,
        points: members.iter().map(|&m| points[m].point).collect(),
        max_excess_mph: max_excess,
    }
}

/// Trip totals by road type, with each event's distance and time attributed
/// to the road type of its first point.
fn road_statistics(points: &[ResolvedPoint], events: &[(Vec<usize>, f64)]) -> SpeedingReport {
    let mut by_type: BTreeMap<&str, RoadTypeStats> = BTreeMap::new();
    let mut report = SpeedingReport::default();

    for pair in points.windows(2) {
        let (prev, cur) = (&pair[0], &pair[1]);
        let distance = haversine_distance(&prev.point.position(), &cur.point.position());
        let elapsed = cur.point.timestamp - prev.point.timestamp;

        let stats = by_type
            .entry(cur.road_type.as_str())
            .or_insert_with(|| RoadTypeStats::new(&cur.road_type));
        stats.total_distance_m += distance;
        stats.total_time_secs += elapsed;
        report.total_distance_m += distance;
        report.total_time_secs += elapsed;
    }

    for (members, _) in events {
        let first = &points[members[0]];
        let last = &points[members[members.len() - 1]];
        let distance: f64 = members
            .windows(2)
            .map(|w| haversine_distance(&points[w[0]].point.position(), &points[w[1]].point.position()))
            .sum();
        let elapsed = last.point.timestamp - first.point.timestamp;

        let stats = by_type
            .entry(first.road_type.as_str())
            .or_insert_with(|| RoadTypeStats::new(&first.road_type));
        stats.speeding_distance_m += distance;
        stats.speeding_time_secs += elapsed;
        report.speeding_distance_m += distance;
        report.speeding_time_secs += elapsed;
    }

    for stats in by_type.values_mut() {
        if report.total_distance_m > 0.0 {
            stats.speeding_distance_pct = stats.speeding_distance_m / report.total_distance_m * 100.0;
        }
        if report.total_time_secs > 0 {
            stats.speeding_time_pct =
                stats.speeding_time_secs as f64 / report.total_time_secs as f64 * 100.0;
        }
    }

    report.road_stats = by_type.into_values().collect();
    report
}

#[cfg(test)]
mod tests {
    use super::*;

    fn point(t: i64, speed: f64, limit: Option<f64>) -> ResolvedPoint {
        ResolvedPoint {
            point: TracePoint::new(29.7000 + t as f64 * 0.0001, -95.7500, speed, t),
            segment_id: Some("way-1".to_string()),
            road_type: "residential".to_string(),
            speed_limit: limit,
        }
    }

    fn steady(range: std::ops::Range<i64>, speed: f64, limit: f64) -> Vec<ResolvedPoint> {
        range.map(|t| point(t, speed, Some(limit))).collect()
    }

    #[test]
    fn test_sustained_event_emitted() {
        // 12 mph over for t=0..6
        let mut points = steady(0..7, 47.0, 35.0);
        points.push(point(7, 30.0, Some(35.0)));

        let report = detect_speeding(&points, &SpeedingConfig::default());
        assert_eq!(report.events.len(), 1);
        let event = &report.events[0];
        assert_eq!(event.start_timestamp, 0);
        assert_eq!(event.end_timestamp, 6);
        assert_eq!(event.duration_seconds, 6);
        assert_eq!(event.points.len(), 7);
        assert_eq!(event.segment_id, "way-1");
        assert!((event.max_excess_mph - 12.0).abs() < 1e-9);
        assert_eq!(report.point_events[6], Some(0));
        assert_eq!(report.point_events[7], None);
    }

    #[test]
    fn test_short_event_discarded() {
        let mut points = steady(0..4, 47.0, 35.0);
        points.push(point(4, 30.0, Some(35.0)));
        let report = detect_speeding(&points, &SpeedingConfig::default());
        assert!(report.events.is_empty());
        assert!(report.point_events.iter().all(Option::is_none));
    }

    #[test]
    fn test_threshold_is_inclusive() {
        let points = steady(0..6, 46.0, 35.0);
        assert_eq!(detect_speeding(&points, &SpeedingConfig::default()).events.len(), 1);

        let points = steady(0..6, 45.9, 35.0);
        assert!(detect_speeding(&points, &SpeedingConfig::default()).events.is_empty());
    }

    #[test]
    fn test_event_open_at_end_is_closed() {
        let points = steady(0..10, 60.0, 35.0);
        let report = detect_speeding(&points, &SpeedingConfig::default());
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].duration_seconds, 9);
    }

    fn with_unknown_gap() -> Vec<ResolvedPoint> {
        let mut points = steady(0..7, 50.0, 35.0);
        points.push(point(7, 50.0, None));
        points.extend(steady(8..15, 50.0, 35.0));
        points
    }

    #[test]
    fn test_unknown_limit_skipped() {
        let report = detect_speeding(&with_unknown_gap(), &SpeedingConfig::default());
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.events[0].start_timestamp, 0);
        assert_eq!(report.events[0].end_timestamp, 14);
        assert_eq!(report.events[0].points.len(), 14);
        assert_eq!(report.point_events[7], None);
    }

    #[test]
    fn test_unknown_limit_breaks() {
        let config = SpeedingConfig {
            unknown_limit_policy: UnknownLimitPolicy::Break,
            ..Default::default()
        };
        let report = detect_speeding(&with_unknown_gap(), &config);
        assert_eq!(report.events.len(), 2);
        assert_eq!(report.events[0].end_timestamp, 6);
        assert_eq!(report.events[1].start_timestamp, 8);
    }

    #[test]
    fn test_zero_limit_never_speeding() {
        let points = steady(0..10, 80.0, 0.0);
        assert!(detect_speeding(&points, &SpeedingConfig::default()).events.is_empty());
    }

    #[test]
    fn test_events_respect_minimum_and_never_overlap() {
        // Deterministic pseudo-random speeds around the limit
        let mut seed: u64 = 42;
        let points: Vec<ResolvedPoint> = (0..500)
            .map(|t| {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let speed = 30.0 + (seed >> 33) as f64 % 25.0;
                let limit = if (seed >> 20) % 17 == 0 { None } else { Some(35.0) };
                point(t, speed, limit)
            })
            .collect();

        for policy in [UnknownLimitPolicy::Skip, UnknownLimitPolicy::Break] {
            let config = SpeedingConfig {
                min_duration_secs: 3,
                unknown_limit_policy: policy,
                ..Default::default()
            };
            let report = detect_speeding(&points, &config);
            for event in &report.events {
                assert!(event.duration_seconds >= 3);
            }
            for pair in report.events.windows(2) {
                assert!(pair[0].end_timestamp < pair[1].start_timestamp);
            }
        }
    }

    #[test]
    fn test_road_type_statistics() {
        let mut points = steady(0..6, 50.0, 35.0);
        for p in points.iter_mut().skip(3) {
            p.road_type = "primary".to_string();
        }
        points.extend((6..10).map(|t| {
            let mut p = point(t, 30.0, Some(35.0));
            p.road_type = "primary".to_string();
            p
        }));

        let report = detect_speeding(&points, &SpeedingConfig::default());
        assert_eq!(report.events.len(), 1);
        assert_eq!(report.total_time_secs, 9);
        assert_eq!(report.speeding_time_secs, 5);

        let types: Vec<&str> = report.road_stats.iter().map(|s| s.road_type.as_str()).collect();
        assert_eq!(types, vec!["primary", "residential"]);

        let residential = &report.road_stats[1];
        // Intervals ending at t=1 and t=2
        assert_eq!(residential.total_time_secs, 2);
        // Event starts on residential, so all of it lands there
        assert_eq!(residential.speeding_time_secs, 5);
        assert!((residential.speeding_time_pct - 5.0 / 9.0 * 100.0).abs() < 1e-9);

        let primary = &report.road_stats[0];
        assert_eq!(primary.total_time_secs, 7);
        assert_eq!(primary.speeding_time_secs, 0);

        let distance_sum: f64 = report.road_stats.iter().map(|s| s.total_distance_m).sum();
        assert!((distance_sum - report.total_distance_m).abs() < 1e-6);
        assert!((report.speeding_distance_m - residential.speeding_distance_m).abs() < 1e-9);
    }

    #[test]
    fn test_empty_input() {
        let report = detect_speeding(&[], &SpeedingConfig::default());
        assert!(report.events.is_empty());
        assert!(report.road_stats.is_empty());
        assert_eq!(report.total_distance_m, 0.0);
    }
}
