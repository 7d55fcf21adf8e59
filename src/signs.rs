//! Traffic sign layer.
//!
//! Signs are point features carrying an encoded value such as
//! `regulatory--maximum-speed-limit-40--g3`. A sign applies to a road segment
//! when it lies inside the segment's bounding box and within a small radius
//! of its polyline.

use std::future::Future;

use log::{debug, info};
use rstar::primitives::GeomWithData;
use rstar::RTree;
use tokio::sync::OnceCell;

use crate::error::{Result, SpeedMatchError};
use crate::geo_utils::distance_to_polyline;
use crate::retry::RetryPolicy;
use crate::{Bounds, RoadSegment, TrafficSign};

const SPEED_LIMIT_PATTERN: &str = "regulatory--maximum-speed-limit";

/// Source of traffic signs.
pub trait TrafficSignService: Send + Sync {
    /// Maximum speed limit signs located inside `bbox`.
    fn signs_in(&self, bbox: &Bounds) -> impl Future<Output = Result<Vec<TrafficSign>>> + Send;
}

/// True for values in the "regulatory maximum speed limit" family.
pub fn is_speed_limit_sign(raw_value: &str) -> bool {
    raw_value.contains(SPEED_LIMIT_PATTERN)
}

/// Extract the numeric limit from an encoded sign value.
///
/// The value is split on `-` and the third-from-last token is the limit:
/// `regulatory--maximum-speed-limit-40--g3` gives 40.
pub fn parse_sign_value(raw_value: &str) -> Option<f64> {
    let parts: Vec<&str> = raw_value.split('-').collect();
    if parts.len() < 4 {
        return None;
    }
    let value: f64 = parts[parts.len() - 3].trim().parse().ok()?;
    (value.is_finite() && value > 0.0).then_some(value)
}

/// First sign that applies to `segment`, with its distance to the polyline.
///
/// Candidates are taken in the given order. A sign applies when it has a
/// parsed limit, lies inside the segment bounds, and is strictly closer than
/// `radius_m` to the polyline.
pub fn sign_for_segment<'a>(
    segment: &RoadSegment,
    signs: &'a [TrafficSign],
    radius_m: f64,
) -> Option<(&'a TrafficSign, f64)> {
    signs
        .iter()
        .filter(|s| s.parsed_speed_limit.is_some() && segment.bounds.contains(&s.location))
        .map(|s| (s, distance_to_polyline(&s.location, &segment.polyline)))
        .find(|(_, distance)| *distance < radius_m)
}

type IndexedSign = GeomWithData<[f64; 2], usize>;

/// R-tree over a fixed set of signs for envelope queries.
pub struct SignIndex {
    signs: Vec<TrafficSign>,
    tree: RTree<IndexedSign>,
}

impl SignIndex {
    pub fn new(signs: Vec<TrafficSign>) -> Self {
        let entries = signs
            .iter()
            .enumerate()
            .map(|(i, s)| GeomWithData::new([s.location.longitude, s.location.latitude], i))
            .collect();
        Self {
            tree: RTree::bulk_load(entries),
            signs,
        }
    }

    pub fn len(&self) -> usize {
        self.signs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.signs.is_empty()
    }

    /// Signs inside `bbox`, in their original order.
    pub fn within(&self, bbox: &Bounds) -> Vec<TrafficSign> {
        let mut hits: Vec<usize> = self
            .tree
            .locate_in_envelope(&bbox.envelope())
            .map(|entry| entry.data)
            .collect();
        hits.sort_unstable();
        hits.into_iter().map(|i| self.signs[i].clone()).collect()
    }
}

/// Sign service that downloads the whole trip area once and answers
/// per-segment queries from a local index.
///
/// The download happens on the first query. A failed download is not cached,
/// so the next query tries again.
pub struct PrefetchedSignLayer<S> {
    service: S,
    trip_bounds: Bounds,
    retry: RetryPolicy,
    index: OnceCell<SignIndex>,
}

impl<S: TrafficSignService> PrefetchedSignLayer<S> {
    pub fn new(service: S, trip_bounds: Bounds, retry: RetryPolicy) -> Self {
        Self {
            service,
            trip_bounds,
            retry,
            index: OnceCell::new(),
        }
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    async fn index(&self) -> Result<&SignIndex> {
        self.index
            .get_or_try_init(|| async {
                let service = &self.service;
                let bbox = &self.trip_bounds;
                let signs = self
                    .retry
                    .run("traffic sign prefetch", move || service.signs_in(bbox))
                    .await?;
                info!("[SignLayer] Prefetched {} speed limit signs", signs.len());
                Ok::<_, SpeedMatchError>(SignIndex::new(signs))
            })
            .await
    }
}

impl<S: TrafficSignService> TrafficSignService for PrefetchedSignLayer<S> {
    async fn signs_in(&self, bbox: &Bounds) -> Result<Vec<TrafficSign>> {
        let index = self.index().await?;
        let signs = index.within(bbox);
        debug!("[SignLayer] {} of {} signs inside {:?}", signs.len(), index.len(), bbox);
        Ok(signs)
    }
}
