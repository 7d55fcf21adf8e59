//! Speed-limit priority chain.
//!
//! Each unique matched segment is resolved once per run by walking, in order:
//! the persistent cache, the segment's own `maxspeed` tag, the traffic-sign
//! layer, and finally a reverse-geocoding lookup at the polyline midpoint.
//! The first source that yields a positive limit wins. A step whose service
//! fails is logged and skipped, so the chain always terminates, possibly at
//! [`LimitSource::Unknown`].

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::signs::{sign_for_segment, TrafficSignService};
use crate::{
    GpsPoint, LimitSource, ResolvedSpeedLimit, RoadSegment, SegmentCacheRecord, SourceLimits,
};

/// Fallback lookup of the posted limit of the road nearest to a coordinate.
pub trait ReverseGeocoder: Send + Sync {
    /// Limit in mph, or `None` when the service knows no limit there.
    fn speed_limit_at(&self, point: &GpsPoint)
        -> impl Future<Output = Result<Option<f64>>> + Send;
}

/// Result of resolving one segment.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolutionOutcome {
    pub resolved: ResolvedSpeedLimit,
    /// Record to write back. `None` when served from the cache, or when the
    /// chain ended at Unknown only because a service was unreachable.
    pub new_record: Option<SegmentCacheRecord>,
    /// At least one step failed and was skipped
    pub degraded: bool,
}

/// Resolves segment speed limits through the priority chain.
pub struct SpeedLimitResolver<T, G> {
    signs: T,
    geocoder: G,
    retry: RetryPolicy,
    sign_radius_m: f64,
    cache_hits: AtomicUsize,
    sign_lookups: AtomicUsize,
    geocode_lookups: AtomicUsize,
    unknown: AtomicUsize,
}

impl<T: TrafficSignService, G: ReverseGeocoder> SpeedLimitResolver<T, G> {
    pub fn new(signs: T, geocoder: G, retry: RetryPolicy, sign_radius_m: f64) -> Self {
        Self {
            signs,
            geocoder,
            retry,
            sign_radius_m,
            cache_hits: AtomicUsize::new(0),
            sign_lookups: AtomicUsize::new(0),
            geocode_lookups: AtomicUsize::new(0),
            unknown: AtomicUsize::new(0),
        }
    }

    pub fn signs(&self) -> &T {
        &self.signs
    }

    pub fn geocoder(&self) -> &G {
        &self.geocoder
    }

    pub fn cache_hits(&self) -> usize {
        self.cache_hits.load(Ordering::Relaxed)
    }

    /// Segments that reached the sign step.
    pub fn sign_lookups(&self) -> usize {
        self.sign_lookups.load(Ordering::Relaxed)
    }

    /// Segments that reached the reverse-geocoding step.
    pub fn geocode_lookups(&self) -> usize {
        self.geocode_lookups.load(Ordering::Relaxed)
    }

    pub fn unknown_count(&self) -> usize {
        self.unknown.load(Ordering::Relaxed)
    }

    /// Resolve one segment. `cached` is its store record, if any.
    pub async fn resolve(
        &self,
        segment: &RoadSegment,
        cached: Option<&SegmentCacheRecord>,
    ) -> ResolutionOutcome {
        if let Some(record) = cached {
            self.cache_hits.fetch_add(1, Ordering::Relaxed);
            debug!("[SpeedLimits] {} served from cache", segment.id);
            let resolved =
                ResolvedSpeedLimit::new(&segment.id, record.limits(), LimitSource::Cached);
            return ResolutionOutcome {
                resolved,
                new_record: None,
                degraded: false,
            };
        }

        let (limits, source, degraded) = self.resolve_uncached(segment).await;
        let resolved = ResolvedSpeedLimit::new(&segment.id, limits, source);

        if !resolved.is_enforceable() {
            self.unknown.fetch_add(1, Ordering::Relaxed);
            info!(
                "[SpeedLimits] No limit for {} ({}){}",
                segment.id,
                segment.name,
                if degraded { ", services degraded" } else { "" }
            );
        }

        // A transient outage must not pin the segment to Unknown in the cache
        let new_record = if resolved.is_enforceable() || !degraded {
            Some(SegmentCacheRecord::new(segment, limits, resolved.resolved_at))
        } else {
            None
        };

        ResolutionOutcome {
            resolved,
            new_record,
            degraded,
        }
    }

    async fn resolve_uncached(&self, segment: &RoadSegment) -> (SourceLimits, LimitSource, bool) {
        let mut limits = SourceLimits::default();
        let mut degraded = false;

        if let Some(tagged) = segment.tagged_speed_limit.filter(|v| v.is_finite() && *v > 0.0) {
            debug!("[SpeedLimits] {} tagged {} mph", segment.id, tagged);
            limits.osm = tagged;
            return (limits, LimitSource::TagOsm, degraded);
        }

        match self.sign_limit(segment).await {
            Ok(Some(value)) => {
                limits.sign = value;
                return (limits, LimitSource::SignMatch, degraded);
            }
            Ok(None) => {}
            Err(e) => {
                degraded = true;
                warn!("[SpeedLimits] Sign lookup for {} skipped: {}", segment.id, e);
            }
        }

        match self.geocoded_limit(segment).await {
            Ok(Some(value)) => {
                limits.reverse_geocode = value;
                (limits, LimitSource::ReverseGeocode, degraded)
            }
            Ok(None) => (limits, LimitSource::Unknown, degraded),
            Err(e) => {
                warn!("[SpeedLimits] Reverse geocode for {} skipped: {}", segment.id, e);
                (limits, LimitSource::Unknown, true)
            }
        }
    }

    async fn sign_limit(&self, segment: &RoadSegment) -> Result<Option<f64>> {
        self.sign_lookups.fetch_add(1, Ordering::Relaxed);
        let service = &self.signs;
        let bbox = &segment.bounds;
        let candidates = self
            .retry
            .run("traffic sign lookup", move || service.signs_in(bbox))
            .await?;

        Ok(
            sign_for_segment(segment, &candidates, self.sign_radius_m).and_then(|(sign, distance)| {
                debug!(
                    "[SpeedLimits] {} matched sign {} at {:.1} m",
                    segment.id, sign.id, distance
                );
                sign.parsed_speed_limit
            }),
        )
    }

    async fn geocoded_limit(&self, segment: &RoadSegment) -> Result<Option<f64>> {
        let Some(midpoint) = segment.midpoint() else {
            return Ok(None);
        };
        self.geocode_lookups.fetch_add(1, Ordering::Relaxed);
        let geocoder = &self.geocoder;
        let midpoint = &midpoint;
        let value = self
            .retry
            .run("reverse geocode", move || geocoder.speed_limit_at(midpoint))
            .await?;
        Ok(value.filter(|v| v.is_finite() && *v > 0.0))
    }

    /// Resolve every segment with at most `concurrency` lookups in flight.
    ///
    /// Output is aligned with `segments`, regardless of completion order.
    pub async fn resolve_segments(
        &self,
        segments: &[RoadSegment],
        cached: &HashMap<String, SegmentCacheRecord>,
        concurrency: usize,
    ) -> Vec<ResolutionOutcome> {
        let outcomes: Vec<ResolutionOutcome> = stream::iter(segments.iter())
            .map(|segment| self.resolve(segment, cached.get(&segment.id)))
            .buffered(concurrency.max(1))
            .collect()
            .await;

        info!(
            "[SpeedLimits] Resolved {} segments ({} cached, {} unknown)",
            outcomes.len(),
            outcomes.iter().filter(|o| o.resolved.source == LimitSource::Cached).count(),
            outcomes.iter().filter(|o| !o.resolved.is_enforceable()).count()
        );
        outcomes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Service, SpeedMatchError};
    use crate::signs::parse_sign_value;
    use crate::{Bounds, TrafficSign};

    struct FakeSigns {
        signs: Vec<TrafficSign>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeSigns {
        fn with(signs: Vec<TrafficSign>) -> Self {
            Self {
                signs,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl TrafficSignService for FakeSigns {
        async fn signs_in(&self, bbox: &Bounds) -> Result<Vec<TrafficSign>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SpeedMatchError::network(Service::TrafficSigns, "timeout"));
            }
            Ok(self
                .signs
                .iter()
                .filter(|s| bbox.contains(&s.location))
                .cloned()
                .collect())
        }
    }

    struct FakeGeocoder {
        limit: Option<f64>,
        fail: bool,
        calls: AtomicUsize,
    }

    impl FakeGeocoder {
        fn returning(limit: Option<f64>) -> Self {
            Self {
                limit,
                fail: false,
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl ReverseGeocoder for FakeGeocoder {
        async fn speed_limit_at(&self, _point: &GpsPoint) -> Result<Option<f64>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(SpeedMatchError::network(Service::ReverseGeocode, "timeout"));
            }
            Ok(self.limit)
        }
    }

    fn road(id: &str, tagged: Option<f64>) -> RoadSegment {
        let polyline = vec![GpsPoint::new(29.7000, -95.7500), GpsPoint::new(29.7010, -95.7400)];
        RoadSegment {
            id: id.to_string(),
            name: "Test Rd".to_string(),
            road_type: "secondary".to_string(),
            bounds: Bounds::from_points(&polyline).unwrap(),
            polyline,
            tagged_speed_limit: tagged,
        }
    }

    fn sign(lat: f64, lon: f64, value: &str) -> TrafficSign {
        TrafficSign {
            id: "sign-1".to_string(),
            location: GpsPoint::new(lat, lon),
            raw_value: value.to_string(),
            parsed_speed_limit: parse_sign_value(value),
        }
    }

    fn resolver(
        signs: FakeSigns,
        geocoder: FakeGeocoder,
    ) -> SpeedLimitResolver<FakeSigns, FakeGeocoder> {
        let retry = RetryPolicy {
            max_retries: 1,
            base_backoff_ms: 0,
        };
        SpeedLimitResolver::new(signs, geocoder, retry, 10.0)
    }

    #[tokio::test]
    async fn test_tag_resolves_without_external_calls() {
        let r = resolver(FakeSigns::with(vec![]), FakeGeocoder::returning(Some(45.0)));
        let outcome = r.resolve(&road("way-1", Some(35.0)), None).await;

        assert_eq!(outcome.resolved.source, LimitSource::TagOsm);
        assert_eq!(outcome.resolved.value, Some(35.0));
        let record = outcome.new_record.unwrap();
        assert_eq!(record.osm_limit, 35.0);
        assert_eq!(record.sign_limit, 0.0);
        assert_eq!(record.reverse_geocode_limit, 0.0);
        assert_eq!(r.signs().calls.load(Ordering::SeqCst), 0);
        assert_eq!(r.geocoder().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_nearby_sign_resolves() {
        // ~4 m north of the polyline midpoint
        let signs = FakeSigns::with(vec![sign(
            29.700536,
            -95.745,
            "regulatory--maximum-speed-limit-40--g3",
        )]);
        let r = resolver(signs, FakeGeocoder::returning(Some(45.0)));
        let outcome = r.resolve(&road("way-1", None), None).await;

        assert_eq!(outcome.resolved.source, LimitSource::SignMatch);
        assert_eq!(outcome.resolved.value, Some(40.0));
        assert_eq!(outcome.new_record.unwrap().sign_limit, 40.0);
        assert_eq!(r.geocoder().calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_distant_sign_falls_through_to_geocode() {
        // ~15 m off the road
        let signs = FakeSigns::with(vec![sign(
            29.700635,
            -95.745,
            "regulatory--maximum-speed-limit-40--g3",
        )]);
        let r = resolver(signs, FakeGeocoder::returning(Some(45.0)));
        let outcome = r.resolve(&road("way-1", None), None).await;

        assert_eq!(outcome.resolved.source, LimitSource::ReverseGeocode);
        assert_eq!(outcome.resolved.value, Some(45.0));
        assert_eq!(r.geocoder().calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_unknown_is_persisted_as_zero() {
        let r = resolver(FakeSigns::with(vec![]), FakeGeocoder::returning(None));
        let outcome = r.resolve(&road("way-1", None), None).await;

        assert_eq!(outcome.resolved.source, LimitSource::Unknown);
        assert_eq!(outcome.resolved.value, None);
        let record = outcome.new_record.unwrap();
        assert_eq!(record.limits(), SourceLimits::default());
        assert_eq!(r.unknown_count(), 1);
    }

    #[tokio::test]
    async fn test_failed_steps_fall_through_and_are_not_cached() {
        let mut signs = FakeSigns::with(vec![]);
        signs.fail = true;
        let mut geocoder = FakeGeocoder::returning(Some(45.0));
        geocoder.fail = true;
        let r = resolver(signs, geocoder);

        let outcome = r.resolve(&road("way-1", None), None).await;
        assert_eq!(outcome.resolved.source, LimitSource::Unknown);
        assert!(outcome.degraded);
        assert!(outcome.new_record.is_none());
        // One attempt plus one retry per step
        assert_eq!(r.signs().calls.load(Ordering::SeqCst), 2);
        assert_eq!(r.geocoder().calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_sign_failure_still_reaches_geocode() {
        let mut signs = FakeSigns::with(vec![]);
        signs.fail = true;
        let r = resolver(signs, FakeGeocoder::returning(Some(30.0)));

        let outcome = r.resolve(&road("way-1", None), None).await;
        assert_eq!(outcome.resolved.source, LimitSource::ReverseGeocode);
        assert!(outcome.degraded);
        assert_eq!(outcome.new_record.unwrap().reverse_geocode_limit, 30.0);
    }

    #[tokio::test]
    async fn test_cached_record_is_idempotent() {
        let r = resolver(FakeSigns::with(vec![]), FakeGeocoder::returning(Some(45.0)));
        let segment = road("way-1", None);

        let first = r.resolve(&segment, None).await;
        let record = first.new_record.clone().unwrap();

        let again = r.resolve(&segment, Some(&record)).await;
        assert_eq!(again.resolved.source, LimitSource::Cached);
        assert_eq!(again.resolved.value, first.resolved.value);
        assert_eq!(again.resolved.limits, first.resolved.limits);
        assert!(again.new_record.is_none());
        assert_eq!(r.signs().calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.geocoder().calls.load(Ordering::SeqCst), 1);
        assert_eq!(r.cache_hits(), 1);
    }

    #[tokio::test]
    async fn test_resolve_segments_keeps_input_order() {
        let r = resolver(FakeSigns::with(vec![]), FakeGeocoder::returning(None));
        let segments = vec![
            road("a", Some(25.0)),
            road("b", None),
            road("c", Some(55.0)),
        ];
        let mut cached = HashMap::new();
        cached.insert(
            "b".to_string(),
            SegmentCacheRecord::new(
                &segments[1],
                SourceLimits {
                    sign: 30.0,
                    ..Default::default()
                },
                0,
            ),
        );

        let outcomes = r.resolve_segments(&segments, &cached, 2).await;
        let ids: Vec<&str> = outcomes.iter().map(|o| o.resolved.segment_id.as_str()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
        assert_eq!(outcomes[1].resolved.source, LimitSource::Cached);
        assert_eq!(outcomes[1].resolved.value, Some(30.0));
        assert_eq!(outcomes[2].resolved.value, Some(55.0));
    }
}
