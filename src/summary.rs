//! Trip distance and duration.

use serde::{Deserialize, Serialize};

use crate::geo_utils::{haversine_distance, meters_to_km, meters_to_miles};
use crate::TracePoint;

/// Total geodesic distance and elapsed time of a trace.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct TripSummary {
    pub distance_m: f64,
    pub duration_secs: i64,
    pub point_count: usize,
}

impl TripSummary {
    pub fn distance_km(&self) -> f64 {
        meters_to_km(self.distance_m)
    }

    pub fn distance_miles(&self) -> f64 {
        meters_to_miles(self.distance_m)
    }

    /// Duration split into whole minutes and remaining seconds.
    pub fn duration_minutes_seconds(&self) -> (i64, i64) {
        (self.duration_secs / 60, self.duration_secs % 60)
    }
}

/// Summarize a trace. Points are re-sorted by timestamp before summing.
///
/// Fewer than two points yields zero distance and duration.
pub fn summarize_trip(points: &[TracePoint]) -> TripSummary {
    if points.len() < 2 {
        return TripSummary {
            point_count: points.len(),
            ..Default::default()
        };
    }

    let mut sorted = points.to_vec();
    sorted.sort_by_key(|p| p.timestamp);

    let distance_m = sorted
        .windows(2)
        .map(|w| haversine_distance(&w[0].position(), &w[1].position()))
        .sum();

    TripSummary {
        distance_m,
        duration_secs: sorted[sorted.len() - 1].timestamp - sorted[0].timestamp,
        point_count: sorted.len(),
    }
}
