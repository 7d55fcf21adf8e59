//! Road network lookup per bounding box.
//!
//! Fetch results are memoized by the exact bounding box for the lifetime of
//! the resolver, so two windows with an identical box share one request.
//! Overlapping but different boxes are fetched separately.

use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use futures::stream::{self, StreamExt};
use log::{debug, info, warn};

use crate::batcher::TraceWindow;
use crate::error::Result;
use crate::retry::RetryPolicy;
use crate::{Bounds, BoundsKey, RoadSegment};

/// Source of road segment geometries and tags.
pub trait RoadNetworkService: Send + Sync {
    /// All road segments intersecting `bbox`.
    fn segments_in(&self, bbox: &Bounds)
        -> impl Future<Output = Result<Vec<RoadSegment>>> + Send;
}

/// The segment set effective for one trace window.
#[derive(Debug, Clone)]
pub struct WindowSegments {
    pub window: usize,
    pub segments: Arc<Vec<RoadSegment>>,
    /// The fetch failed and the window degraded to an empty set
    pub failed: bool,
}

/// Memoizing road network resolver.
pub struct RoadNetworkResolver<S> {
    service: S,
    retry: RetryPolicy,
    memo: Mutex<HashMap<BoundsKey, Arc<Vec<RoadSegment>>>>,
    fetches: AtomicUsize,
}

impl<S: RoadNetworkService> RoadNetworkResolver<S> {
    pub fn new(service: S, retry: RetryPolicy) -> Self {
        Self {
            service,
            retry,
            memo: Mutex::new(HashMap::new()),
            fetches: AtomicUsize::new(0),
        }
    }

    /// Number of requests issued to the service, retries included.
    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::Relaxed)
    }

    pub fn service(&self) -> &S {
        &self.service
    }

    /// Segments for `bbox`, from the memo or the service.
    ///
    /// Failures are returned to the caller and are not memoized.
    pub async fn resolve(&self, bbox: &Bounds) -> Result<Arc<Vec<RoadSegment>>> {
        let key = bbox.key();
        if let Some(hit) = self
            .memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&key)
        {
            debug!("[RoadNetwork] Memo hit for {:?}", bbox);
            return Ok(Arc::clone(hit));
        }

        let service = &self.service;
        let fetches = &self.fetches;
        let segments = self
            .retry
            .run("road network fetch", move || {
                fetches.fetch_add(1, Ordering::Relaxed);
                service.segments_in(bbox)
            })
            .await?;

        let segments = Arc::new(segments);
        self.memo
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key, Arc::clone(&segments));
        Ok(segments)
    }

    /// Resolve every window's segment set with at most `concurrency` requests in flight.
    ///
    /// Output is in window order. A window whose fetch fails gets an empty
    /// set, so its points surface as unmatched instead of aborting the run.
    pub async fn resolve_windows(
        &self,
        windows: &[TraceWindow],
        concurrency: usize,
    ) -> Vec<WindowSegments> {
        // Identical boxes are requested once
        let mut unique: Vec<Bounds> = Vec::new();
        let mut slot_of: HashMap<BoundsKey, usize> = HashMap::new();
        for window in windows {
            slot_of.entry(window.bounds.key()).or_insert_with(|| {
                unique.push(window.bounds);
                unique.len() - 1
            });
        }

        let results: Vec<Result<Arc<Vec<RoadSegment>>>> = stream::iter(unique.iter())
            .map(|bbox| self.resolve(bbox))
            .buffered(concurrency.max(1))
            .collect()
            .await;

        let output: Vec<WindowSegments> = windows
            .iter()
            .map(|window| match &results[slot_of[&window.bounds.key()]] {
                Ok(segments) => WindowSegments {
                    window: window.index,
                    segments: Arc::clone(segments),
                    failed: false,
                },
                Err(e) => {
                    warn!(
                        "[RoadNetwork] Window {} ({} points) degraded to no segments: {}",
                        window.index,
                        window.len(),
                        e
                    );
                    WindowSegments {
                        window: window.index,
                        segments: Arc::new(Vec::new()),
                        failed: true,
                    }
                }
            })
            .collect();

        info!(
            "[RoadNetwork] Resolved {} windows ({} unique boxes, {} failed)",
            windows.len(),
            unique.len(),
            output.iter().filter(|w| w.failed).count()
        );

        output
    }
}
