//! Nearest road segment matching.
//!
//! Each point is compared against every segment of its window: the distance
//! to a segment is the minimum over its polyline edges of the great-circle
//! distance to the clamped projection. Cost is O(segments x vertices) per
//! point with no allocation inside the loop.

#[cfg(feature = "parallel")]
use rayon::prelude::*;

use log::debug;

use crate::batcher::TraceWindow;
use crate::geo_utils::distance_to_polyline;
use crate::road_network::WindowSegments;
use crate::{MatchResult, RoadSegment, TracePoint};

/// Index of the nearest segment and its distance in meters.
///
/// Ties keep the first segment encountered. Returns `None` for an empty set.
pub fn nearest_segment(point: &TracePoint, segments: &[RoadSegment]) -> Option<(usize, f64)> {
    let position = point.position();
    let mut best: Option<(usize, f64)> = None;

    for (i, segment) in segments.iter().enumerate() {
        let distance = distance_to_polyline(&position, &segment.polyline);
        if !distance.is_finite() {
            continue;
        }
        match best {
            Some((_, best_distance)) if distance >= best_distance => {}
            _ => best = Some((i, distance)),
        }
    }

    best
}

/// Match one point against a segment set. "No match" is not an error.
pub fn match_point(point: &TracePoint, segments: &[RoadSegment]) -> Option<MatchResult> {
    nearest_segment(point, segments).map(|(i, distance)| MatchResult {
        point: *point,
        segment_id: segments[i].id.clone(),
        distance_meters: distance.max(0.0),
    })
}

fn match_window(points: &[TracePoint], window: &TraceWindow, segments: &[RoadSegment]) -> Vec<Option<MatchResult>> {
    if window.is_empty() || segments.is_empty() {
        return vec![None; window.len()];
    }
    points[window.range.clone()]
        .iter()
        .map(|p| match_point(p, segments))
        .collect()
}

/// Match every point of the trace against its own window's segment set.
///
/// `segment_sets` must be aligned with `windows`. Output is in trace order,
/// one entry per point.
pub fn match_windows(
    points: &[TracePoint],
    windows: &[TraceWindow],
    segment_sets: &[WindowSegments],
) -> Vec<Option<MatchResult>> {
    debug_assert_eq!(windows.len(), segment_sets.len());

    #[cfg(feature = "parallel")]
    let per_window: Vec<Vec<Option<MatchResult>>> = windows
        .par_iter()
        .zip(segment_sets.par_iter())
        .map(|(window, set)| match_window(points, window, &set.segments))
        .collect();

    #[cfg(not(feature = "parallel"))]
    let per_window: Vec<Vec<Option<MatchResult>>> = windows
        .iter()
        .zip(segment_sets.iter())
        .map(|(window, set)| match_window(points, window, &set.segments))
        .collect();

    let matches: Vec<Option<MatchResult>> = per_window.into_iter().flatten().collect();
    debug!(
        "[MapMatcher] Matched {}/{} points",
        matches.iter().filter(|m| m.is_some()).count(),
        matches.len()
    );
    matches
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geo_utils::distance_to_polyline;
    use crate::{batch_trace, Bounds, GpsPoint};
    use std::sync::Arc;

    fn segment(id: &str, polyline: Vec<GpsPoint>) -> RoadSegment {
        RoadSegment {
            id: id.to_string(),
            name: id.to_string(),
            road_type: "residential".to_string(),
            bounds: Bounds::from_points(&polyline).unwrap(),
            polyline,
            tagged_speed_limit: None,
        }
    }

    fn grid() -> Vec<RoadSegment> {
        vec![
            // East-west road along lat 29.7000
            segment(
                "east-west",
                vec![GpsPoint::new(29.7000, -95.7500), GpsPoint::new(29.7000, -95.7400)],
            ),
            // North-south road along lng -95.7450, starting north of the first road
            segment(
                "north-south",
                vec![GpsPoint::new(29.7010, -95.7450), GpsPoint::new(29.7100, -95.7450)],
            ),
            // Bent road to the south
            segment(
                "bent",
                vec![
                    GpsPoint::new(29.6950, -95.7500),
                    GpsPoint::new(29.6960, -95.7450),
                    GpsPoint::new(29.6950, -95.7400),
                ],
            ),
        ]
    }

    #[test]
    fn test_empty_segment_set_is_no_match() {
        let p = TracePoint::new(29.7, -95.75, 30.0, 0);
        assert!(match_point(&p, &[]).is_none());
    }

    #[test]
    fn test_matches_nearest_by_perpendicular_distance() {
        let segments = grid();

        // Between vertices of east-west road: vertex distance would be large,
        // perpendicular distance is ~11 m
        let p = TracePoint::new(29.7001, -95.7480, 30.0, 0);
        let m = match_point(&p, &segments).unwrap();
        assert_eq!(m.segment_id, "east-west");
        assert!((m.distance_meters - 11.1).abs() < 0.5);

        let p = TracePoint::new(29.7050, -95.7449, 30.0, 1);
        assert_eq!(match_point(&p, &segments).unwrap().segment_id, "north-south");

        let p = TracePoint::new(29.6958, -95.7450, 30.0, 2);
        assert_eq!(match_point(&p, &segments).unwrap().segment_id, "bent");
    }

    #[test]
    fn test_no_closer_segment_exists() {
        let segments = grid();
        for i in 0..40 {
            let p = TracePoint::new(29.694 + i as f64 * 0.0004, -95.749 + i as f64 * 0.0002, 30.0, i);
            let m = match_point(&p, &segments).unwrap();
            for s in &segments {
                assert!(m.distance_meters <= distance_to_polyline(&p.position(), &s.polyline));
            }
        }
    }

    #[test]
    fn test_tie_keeps_first_segment() {
        let line = vec![GpsPoint::new(29.7, -95.75), GpsPoint::new(29.7, -95.74)];
        let segments = vec![segment("first", line.clone()), segment("second", line)];
        let p = TracePoint::new(29.7002, -95.745, 30.0, 0);
        assert_eq!(match_point(&p, &segments).unwrap().segment_id, "first");
    }

    #[test]
    fn test_match_windows_uses_each_window_set() {
        let points: Vec<TracePoint> = (0..4)
            .map(|i| TracePoint::new(29.7001, -95.749 + i as f64 * 0.002, 30.0, i))
            .collect();
        let windows = batch_trace(&points, 2);
        let sets = vec![
            WindowSegments {
                window: 0,
                segments: Arc::new(grid()),
                failed: false,
            },
            WindowSegments {
                window: 1,
                segments: Arc::new(Vec::new()),
                failed: true,
            },
        ];

        let matches = match_windows(&points, &windows, &sets);
        assert_eq!(matches.len(), 4);
        assert!(matches[0].is_some());
        assert!(matches[1].is_some());
        assert!(matches[2].is_none());
        assert!(matches[3].is_none());
        assert_eq!(matches[1].as_ref().unwrap().point.timestamp, 1);
    }
}
