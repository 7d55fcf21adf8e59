//! # Speed Matcher
//!
//! Map matching, multi-source speed-limit resolution and sustained speeding
//! detection for GPS traces recorded by a moving vehicle.
//!
//! This library provides:
//! - Nearest road segment matching by perpendicular distance to polylines
//! - Speed-limit resolution across a persistent cache, road tags, traffic
//!   signs and a reverse-geocoding fallback
//! - Sustained speeding event detection with per-road-type exposure stats
//! - Trip distance and duration summaries
//!
//! ## Features
//!
//! - **`http`** - HTTP clients for the road network, sign and geocoding services
//! - **`persistence`** - SQLite segment store
//! - **`parallel`** - Parallel map matching with rayon
//! - **`full`** - Enable all features
//!
//! ## Quick Start
//!
//! ```rust
//! use speed_matcher::{detect_speeding, ResolvedPoint, SpeedingConfig, TracePoint};
//!
//! // Seven seconds at 47 mph on a 35 mph road
//! let points: Vec<ResolvedPoint> = (0..7)
//!     .map(|t| ResolvedPoint {
//!         point: TracePoint::new(29.7132, -95.7471, 47.0, t),
//!         segment_id: Some("way-1".to_string()),
//!         road_type: "residential".to_string(),
//!         speed_limit: Some(35.0),
//!     })
//!     .collect();
//!
//! let report = detect_speeding(&points, &SpeedingConfig::default());
//! assert_eq!(report.events.len(), 1);
//! assert_eq!(report.events[0].duration_seconds, 6);
//! ```

use rstar::{RTreeObject, AABB};
use serde::{Deserialize, Serialize};

// Unified error handling
pub mod error;
pub use error::{OptionExt, Result, Service, SpeedMatchError};

// Explicit configuration for every component
pub mod config;
pub use config::{PipelineConfig, ServiceConfig, SpeedingConfig, UnknownLimitPolicy};

// Bounded retry with exponential backoff
pub mod retry;
pub use retry::RetryPolicy;

// Geographic utilities (distance, projection onto polylines)
pub mod geo_utils;

// Wire formats of the external services (pure parsing, no I/O)
pub mod wire;

// Trace windowing
pub mod batcher;
pub use batcher::{batch_trace, TraceWindow};

// Road network lookup per bounding box
pub mod road_network;
pub use road_network::{RoadNetworkResolver, RoadNetworkService, WindowSegments};

// Nearest segment matching
pub mod matcher;
pub use matcher::{match_point, match_windows};

// Traffic sign layer
pub mod signs;
pub use signs::{parse_sign_value, PrefetchedSignLayer, SignIndex, TrafficSignService};

// Speed-limit priority chain
pub mod resolver;
pub use resolver::{ResolutionOutcome, ReverseGeocoder, SpeedLimitResolver};

// Segment persistence store
pub mod store;
pub use store::{write_chunked, InMemoryStore, SegmentStore, SpeedingEventRecord, WriteReport};

#[cfg(feature = "persistence")]
pub mod sqlite;
#[cfg(feature = "persistence")]
pub use sqlite::SqliteStore;

// Sustained speeding detection
pub mod detector;
pub use detector::{detect_speeding, ResolvedPoint, RoadTypeStats, SpeedingEvent, SpeedingReport};

// Trip distance and duration
pub mod summary;
pub use summary::{summarize_trip, TripSummary};

// End-to-end orchestration
pub mod pipeline;
pub use pipeline::{PipelineStats, PointResolution, SpeedingPipeline, TripReport};

// HTTP clients for the external services
#[cfg(feature = "http")]
pub mod http;
#[cfg(feature = "http")]
pub use http::{MapQuestGeocoder, MapillarySignClient, OverpassClient};

// ============================================================================
// Core Types
// ============================================================================

/// A GPS coordinate with latitude and longitude.
///
/// # Example
/// ```
/// use speed_matcher::GpsPoint;
/// let point = GpsPoint::new(29.7132, -95.7471); // Katy, TX
/// assert!(point.is_valid());
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GpsPoint {
    pub latitude: f64,
    pub longitude: f64,
}

impl GpsPoint {
    /// Create a new GPS point.
    pub fn new(latitude: f64, longitude: f64) -> Self {
        Self {
            latitude,
            longitude,
        }
    }

    /// Check if the point has valid coordinates.
    pub fn is_valid(&self) -> bool {
        self.latitude.is_finite()
            && self.longitude.is_finite()
            && self.latitude >= -90.0
            && self.latitude <= 90.0
            && self.longitude >= -180.0
            && self.longitude <= 180.0
    }
}

/// One sample of the vehicle trace.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TracePoint {
    pub latitude: f64,
    pub longitude: f64,
    /// Driver was flagged as distracted at this sample
    pub distracted: bool,
    /// Travel speed in mph
    pub speed_mph: f64,
    /// Unix timestamp (seconds since epoch)
    pub timestamp: i64,
}

impl TracePoint {
    pub fn new(latitude: f64, longitude: f64, speed_mph: f64, timestamp: i64) -> Self {
        Self {
            latitude,
            longitude,
            distracted: false,
            speed_mph,
            timestamp,
        }
    }

    pub fn with_distracted(mut self, distracted: bool) -> Self {
        self.distracted = distracted;
        self
    }

    pub fn position(&self) -> GpsPoint {
        GpsPoint::new(self.latitude, self.longitude)
    }
}

/// Bounding box used to scope spatial queries.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Bounds {
    pub min_lat: f64,
    pub max_lat: f64,
    pub min_lng: f64,
    pub max_lng: f64,
}

impl Bounds {
    pub fn new(min_lat: f64, max_lat: f64, min_lng: f64, max_lng: f64) -> Self {
        Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        }
    }

    /// Create bounds from GPS points.
    pub fn from_points(points: &[GpsPoint]) -> Option<Self> {
        Self::from_coords(points.iter().copied())
    }

    /// Create bounds enclosing trace samples.
    pub fn from_trace(points: &[TracePoint]) -> Option<Self> {
        Self::from_coords(points.iter().map(TracePoint::position))
    }

    fn from_coords(coords: impl IntoIterator<Item = GpsPoint>) -> Option<Self> {
        let mut coords = coords.into_iter().peekable();
        coords.peek()?;

        let mut min_lat = f64::MAX;
        let mut max_lat = f64::MIN;
        let mut min_lng = f64::MAX;
        let mut max_lng = f64::MIN;

        for p in coords {
            min_lat = min_lat.min(p.latitude);
            max_lat = max_lat.max(p.latitude);
            min_lng = min_lng.min(p.longitude);
            max_lng = max_lng.max(p.longitude);
        }

        Some(Self {
            min_lat,
            max_lat,
            min_lng,
            max_lng,
        })
    }

    /// Get the center point of the bounds.
    pub fn center(&self) -> GpsPoint {
        GpsPoint::new(
            (self.min_lat + self.max_lat) / 2.0,
            (self.min_lng + self.max_lng) / 2.0,
        )
    }

    /// Inclusive containment test.
    pub fn contains(&self, point: &GpsPoint) -> bool {
        point.latitude >= self.min_lat
            && point.latitude <= self.max_lat
            && point.longitude >= self.min_lng
            && point.longitude <= self.max_lng
    }

    /// Exact identity of the box, usable as a hash key.
    pub fn key(&self) -> BoundsKey {
        BoundsKey([
            self.min_lat.to_bits(),
            self.max_lat.to_bits(),
            self.min_lng.to_bits(),
            self.max_lng.to_bits(),
        ])
    }

    /// R-tree envelope in (lng, lat) order.
    pub fn envelope(&self) -> AABB<[f64; 2]> {
        AABB::from_corners([self.min_lng, self.min_lat], [self.max_lng, self.max_lat])
    }
}

/// Bit-exact bounding box tuple. Two boxes share a key only if every edge is identical.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BoundsKey([u64; 4]);

/// A road way fetched from the road network service.
///
/// Segments may repeat across windows; identity is `id`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoadSegment {
    pub id: String,
    pub name: String,
    /// Highway classification (e.g. "residential", "motorway")
    pub road_type: String,
    /// Ordered vertices of the way
    pub polyline: Vec<GpsPoint>,
    pub bounds: Bounds,
    /// Posted limit from the way's own tag, in mph
    pub tagged_speed_limit: Option<f64>,
}

impl RoadSegment {
    /// Vertex at the middle index of the polyline.
    pub fn midpoint(&self) -> Option<GpsPoint> {
        self.polyline.get(self.polyline.len() / 2).copied()
    }
}

impl RTreeObject for RoadSegment {
    type Envelope = AABB<[f64; 2]>;

    fn envelope(&self) -> Self::Envelope {
        self.bounds.envelope()
    }
}

/// A traffic sign from the sign layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrafficSign {
    pub id: String,
    pub location: GpsPoint,
    /// Encoded value, e.g. "regulatory--maximum-speed-limit-40--g3"
    pub raw_value: String,
    pub parsed_speed_limit: Option<f64>,
}

/// Nearest segment for one trace point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub point: TracePoint,
    pub segment_id: String,
    /// Perpendicular distance to the segment polyline, never negative
    pub distance_meters: f64,
}

/// Where a resolved speed limit came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LimitSource {
    Cached,
    TagOsm,
    SignMatch,
    ReverseGeocode,
    /// No enforceable limit; a terminal state, not an error
    Unknown,
}

/// Per-source speed limits in mph. Zero means "not resolved by this source".
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct SourceLimits {
    pub osm: f64,
    pub sign: f64,
    pub reverse_geocode: f64,
}

impl SourceLimits {
    /// First strictly positive limit in priority order: tag, sign, reverse geocode.
    pub fn effective(&self) -> Option<f64> {
        [self.osm, self.sign, self.reverse_geocode]
            .into_iter()
            .find(|v| v.is_finite() && *v > 0.0)
    }
}

/// The authoritative limit for one segment in one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolvedSpeedLimit {
    pub segment_id: String,
    /// Only present when strictly positive
    pub value: Option<f64>,
    pub source: LimitSource,
    /// Full per-source set backing `value`
    pub limits: SourceLimits,
    /// Unix timestamp of resolution
    pub resolved_at: i64,
}

impl ResolvedSpeedLimit {
    pub fn new(segment_id: &str, limits: SourceLimits, source: LimitSource) -> Self {
        let value = limits.effective();
        Self {
            segment_id: segment_id.to_string(),
            value,
            source: if value.is_some() {
                source
            } else {
                LimitSource::Unknown
            },
            limits,
            resolved_at: chrono::Utc::now().timestamp(),
        }
    }

    pub fn is_enforceable(&self) -> bool {
        self.value.is_some()
    }
}

/// Durable per-segment record held by the [`SegmentStore`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SegmentCacheRecord {
    pub segment_id: String,
    pub road_name: String,
    pub road_type: String,
    pub osm_limit: f64,
    pub sign_limit: f64,
    pub reverse_geocode_limit: f64,
    pub contextual_avg_30_day: f64,
    pub contextual_avg_60_day: f64,
    pub contextual_avg_180_day: f64,
    /// Unix timestamp of the last write
    pub updated_at: i64,
}

impl SegmentCacheRecord {
    /// Fresh record for a segment. Contextual averages start at zero.
    pub fn new(segment: &RoadSegment, limits: SourceLimits, updated_at: i64) -> Self {
        Self {
            segment_id: segment.id.clone(),
            road_name: segment.name.clone(),
            road_type: segment.road_type.clone(),
            osm_limit: limits.osm,
            sign_limit: limits.sign,
            reverse_geocode_limit: limits.reverse_geocode,
            contextual_avg_30_day: 0.0,
            contextual_avg_60_day: 0.0,
            contextual_avg_180_day: 0.0,
            updated_at,
        }
    }

    pub fn limits(&self) -> SourceLimits {
        SourceLimits {
            osm: self.osm_limit,
            sign: self.sign_limit,
            reverse_geocode: self.reverse_geocode_limit,
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_segment() -> RoadSegment {
        let polyline = vec![
            GpsPoint::new(29.7130, -95.7475),
            GpsPoint::new(29.7132, -95.7471),
            GpsPoint::new(29.7135, -95.7468),
        ];
        RoadSegment {
            id: "1001".to_string(),
            name: "Main St".to_string(),
            road_type: "residential".to_string(),
            bounds: Bounds::from_points(&polyline).unwrap(),
            polyline,
            tagged_speed_limit: None,
        }
    }

    #[test]
    fn test_gps_point_validation() {
        assert!(GpsPoint::new(29.7132, -95.7471).is_valid());
        assert!(!GpsPoint::new(91.0, 0.0).is_valid());
        assert!(!GpsPoint::new(0.0, 181.0).is_valid());
        assert!(!GpsPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_bounds_from_trace() {
        let trace = vec![
            TracePoint::new(29.70, -95.75, 30.0, 0),
            TracePoint::new(29.72, -95.74, 30.0, 1),
            TracePoint::new(29.71, -95.76, 30.0, 2),
        ];
        let bounds = Bounds::from_trace(&trace).unwrap();
        assert_eq!(bounds, Bounds::new(29.70, 29.72, -95.76, -95.74));
        assert!(bounds.contains(&GpsPoint::new(29.71, -95.75)));
        assert!(bounds.contains(&GpsPoint::new(29.70, -95.76)));
        assert!(!bounds.contains(&GpsPoint::new(29.73, -95.75)));
        assert!(Bounds::from_trace(&[]).is_none());
    }

    #[test]
    fn test_bounds_key_is_exact() {
        let a = Bounds::new(1.0, 2.0, 3.0, 4.0);
        let b = Bounds::new(1.0, 2.0, 3.0, 4.0);
        let c = Bounds::new(1.0, 2.0, 3.0, 4.000_000_1);
        assert_eq!(a.key(), b.key());
        assert_ne!(a.key(), c.key());
    }

    #[test]
    fn test_segment_midpoint() {
        let segment = sample_segment();
        assert_eq!(segment.midpoint(), Some(GpsPoint::new(29.7132, -95.7471)));
    }

    #[test]
    fn test_source_limits_priority() {
        let limits = SourceLimits {
            osm: 0.0,
            sign: 40.0,
            reverse_geocode: 45.0,
        };
        assert_eq!(limits.effective(), Some(40.0));
        assert_eq!(SourceLimits::default().effective(), None);
    }

    #[test]
    fn test_resolved_limit_without_value_is_unknown() {
        let resolved =
            ResolvedSpeedLimit::new("1001", SourceLimits::default(), LimitSource::ReverseGeocode);
        assert_eq!(resolved.source, LimitSource::Unknown);
        assert!(!resolved.is_enforceable());
    }
}
