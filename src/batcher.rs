//! Trace windowing.
//!
//! The road network is fetched per window rather than for the whole trip so
//! that each query stays small and its bounding box tight around the road
//! actually driven.

use std::ops::Range;

use crate::{Bounds, TracePoint};

/// A contiguous run of trace points and the box enclosing them.
#[derive(Debug, Clone, PartialEq)]
pub struct TraceWindow {
    /// Position of the window in the trace
    pub index: usize,
    /// Indices of the window's points in the trace
    pub range: Range<usize>,
    pub bounds: Bounds,
}

impl TraceWindow {
    pub fn len(&self) -> usize {
        self.range.len()
    }

    pub fn is_empty(&self) -> bool {
        self.range.is_empty()
    }
}

/// Split a trace into windows of `window_size` points (the last may be shorter).
///
/// Returns an empty list for an empty trace. A `window_size` of zero is
/// treated as one.
pub fn batch_trace(points: &[TracePoint], window_size: usize) -> Vec<TraceWindow> {
    let size = window_size.max(1);
    points
        .chunks(size)
        .enumerate()
        .filter_map(|(index, chunk)| {
            let start = index * size;
            Some(TraceWindow {
                index,
                range: start..start + chunk.len(),
                bounds: Bounds::from_trace(chunk)?,
            })
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn trace(n: usize) -> Vec<TracePoint> {
        (0..n)
            .map(|i| TracePoint::new(29.70 + i as f64 * 0.001, -95.75 - i as f64 * 0.001, 30.0, i as i64))
            .collect()
    }

    #[test]
    fn test_empty_trace() {
        assert!(batch_trace(&[], 20).is_empty());
    }

    #[test]
    fn test_window_sizes_and_ranges() {
        let points = trace(45);
        let windows = batch_trace(&points, 20);
        assert_eq!(windows.len(), 3);
        assert_eq!(windows[0].range, 0..20);
        assert_eq!(windows[1].range, 20..40);
        assert_eq!(windows[2].range, 40..45);
        assert_eq!(windows[2].len(), 5);
        assert_eq!(windows[2].index, 2);
    }

    #[test]
    fn test_window_bounds() {
        let points = trace(45);
        let windows = batch_trace(&points, 20);
        let b = windows[1].bounds;
        assert!((b.min_lat - 29.72).abs() < 1e-9);
        assert!((b.max_lat - 29.739).abs() < 1e-9);
        assert!((b.max_lng - -95.77).abs() < 1e-9);
        assert!((b.min_lng - -95.789).abs() < 1e-9);
        for p in &points[windows[1].range.clone()] {
            assert!(b.contains(&p.position()));
        }
    }

    #[test]
    fn test_zero_window_size() {
        let windows = batch_trace(&trace(3), 0);
        assert_eq!(windows.len(), 3);
    }
}
