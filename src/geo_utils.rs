//! Geographic utilities: great-circle distance and point-to-polyline distance.
//!
//! All distances are haversine great-circle meters. Projection onto a polyline
//! edge is done in (lng, lat) coordinate space and clamped to the edge, then
//! measured back on the sphere.

use geo::{Closest, ClosestPoint, Coord, Distance, Haversine, Line, Point};

use crate::GpsPoint;

pub const METERS_PER_MILE: f64 = 1_609.344;
pub const METERS_PER_KM: f64 = 1_000.0;

#[inline]
fn to_point(p: &GpsPoint) -> Point<f64> {
    Point::new(p.longitude, p.latitude)
}

#[inline]
fn to_coord(p: &GpsPoint) -> Coord<f64> {
    Coord {
        x: p.longitude,
        y: p.latitude,
    }
}

/// Calculate haversine distance between two GPS points in meters.
pub fn haversine_distance(p1: &GpsPoint, p2: &GpsPoint) -> f64 {
    Haversine::distance(to_point(p1), to_point(p2))
}

/// Total length of a path in meters.
pub fn polyline_length(points: &[GpsPoint]) -> f64 {
    points
        .windows(2)
        .map(|w| haversine_distance(&w[0], &w[1]))
        .sum()
}

/// Closest point to `point` on the edge `a`-`b`, clamped to the edge's extent.
pub fn project_onto_edge(point: &GpsPoint, a: &GpsPoint, b: &GpsPoint) -> GpsPoint {
    let line = Line::new(to_coord(a), to_coord(b));
    match line.closest_point(&to_point(point)) {
        Closest::Intersection(p) | Closest::SinglePoint(p) => GpsPoint::new(p.y(), p.x()),
        // Zero-length edge
        Closest::Indeterminate => *a,
    }
}

/// Minimum perpendicular distance in meters from `point` to a polyline.
///
/// Each pair of consecutive vertices is treated as a bounded edge. A single
/// vertex polyline degrades to point distance; an empty one is infinitely far.
pub fn distance_to_polyline(point: &GpsPoint, polyline: &[GpsPoint]) -> f64 {
    match polyline {
        [] => f64::INFINITY,
        [only] => haversine_distance(point, only),
        _ => polyline
            .windows(2)
            .map(|edge| haversine_distance(point, &project_onto_edge(point, &edge[0], &edge[1])))
            .fold(f64::INFINITY, f64::min),
    }
}

pub fn meters_to_miles(meters: f64) -> f64 {
    meters / METERS_PER_MILE
}

pub fn meters_to_km(meters: f64) -> f64 {
    meters / METERS_PER_KM
}
