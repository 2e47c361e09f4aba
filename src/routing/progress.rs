// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};

use crate::obf::QueryController;

/// f64 stored as bits in an [AtomicU64].
#[derive(Debug, Default)]
struct AtomicF64(AtomicU64);

impl AtomicF64 {
    fn load(&self) -> f64 {
        f64::from_bits(self.0.load(Ordering::Relaxed))
    }

    fn store(&self, v: f64) {
        self.0.store(v.to_bits(), Ordering::Relaxed);
    }

    fn fetch_max(&self, v: f64) {
        let mut current = self.0.load(Ordering::Relaxed);
        while v > f64::from_bits(current) {
            match self
                .0
                .compare_exchange_weak(current, v.to_bits(), Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
    }
}

/// Progress of a route calculation, shared between the calculating thread
/// and observers. Also serves as the cancellation switch.
#[derive(Debug)]
pub struct RouteCalculationProgress {
    cancelled: AtomicBool,
    segment_not_found: AtomicI32,
    distance_from_begin: AtomicF64,
    distance_from_end: AtomicF64,
    total_estimated_distance: AtomicF64,
    direct_queue_size: AtomicUsize,
    reverse_queue_size: AtomicUsize,
    visited_segments: AtomicUsize,
    loaded_tiles: AtomicUsize,
    routing_calculated_time: AtomicF64,
}

impl Default for RouteCalculationProgress {
    fn default() -> Self {
        Self {
            cancelled: AtomicBool::new(false),
            segment_not_found: AtomicI32::new(-1),
            distance_from_begin: AtomicF64::default(),
            distance_from_end: AtomicF64::default(),
            total_estimated_distance: AtomicF64::default(),
            direct_queue_size: AtomicUsize::new(0),
            reverse_queue_size: AtomicUsize::new(0),
            visited_segments: AtomicUsize::new(0),
            loaded_tiles: AtomicUsize::new(0),
            routing_calculated_time: AtomicF64::default(),
        }
    }
}

impl RouteCalculationProgress {
    pub fn new() -> Self {
        Self::default()
    }

    /// Requests the calculation to stop. The search notices within 100 iterations.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }

    /// Records that no road was found near a route point:
    /// 0 for the start, 1 for the end, and `k` for the k-th point in general.
    pub fn set_segment_not_found(&self, point_index: usize) {
        self.segment_not_found
            .store(point_index.min(i32::MAX as usize) as i32, Ordering::Relaxed);
    }

    /// Index of the route point which couldn't be matched to a road, if any.
    pub fn segment_not_found(&self) -> Option<usize> {
        match self.segment_not_found.load(Ordering::Relaxed) {
            i if i < 0 => None,
            i => Some(i as usize),
        }
    }

    /// Publishes the state of the search frontiers. Distances only grow.
    pub fn update_status(
        &self,
        distance_from_begin: f64,
        direct_queue_size: usize,
        distance_from_end: f64,
        reverse_queue_size: usize,
    ) {
        self.distance_from_begin.fetch_max(distance_from_begin);
        self.distance_from_end.fetch_max(distance_from_end);
        self.direct_queue_size.store(direct_queue_size, Ordering::Relaxed);
        self.reverse_queue_size.store(reverse_queue_size, Ordering::Relaxed);
    }

    pub fn set_total_estimated_distance(&self, d: f64) {
        self.total_estimated_distance.store(d);
    }

    pub fn distance_from_begin(&self) -> f64 {
        self.distance_from_begin.load()
    }

    pub fn distance_from_end(&self) -> f64 {
        self.distance_from_end.load()
    }

    pub fn direct_queue_size(&self) -> usize {
        self.direct_queue_size.load(Ordering::Relaxed)
    }

    pub fn reverse_queue_size(&self) -> usize {
        self.reverse_queue_size.load(Ordering::Relaxed)
    }

    pub fn add_visited_segments(&self, n: usize) {
        self.visited_segments.fetch_add(n, Ordering::Relaxed);
    }

    pub fn visited_segments(&self) -> usize {
        self.visited_segments.load(Ordering::Relaxed)
    }

    pub fn add_loaded_tiles(&self, n: usize) {
        self.loaded_tiles.fetch_add(n, Ordering::Relaxed);
    }

    pub fn loaded_tiles(&self) -> usize {
        self.loaded_tiles.load(Ordering::Relaxed)
    }

    /// Estimated travel time (in seconds) of the last calculated route.
    pub fn set_routing_calculated_time(&self, t: f64) {
        self.routing_calculated_time.store(t);
    }

    pub fn routing_calculated_time(&self) -> f64 {
        self.routing_calculated_time.load()
    }

    /// Rough completion estimate in `[0, 1]`, based on how far both
    /// frontiers got relative to the estimated route cost.
    pub fn calculation_progress(&self) -> f64 {
        let total = self.total_estimated_distance.load();
        if total <= 0.0 {
            return 0.0;
        }
        ((self.distance_from_begin() + self.distance_from_end()) / total).clamp(0.0, 1.0)
    }
}

impl QueryController for RouteCalculationProgress {
    fn is_aborted(&self) -> bool {
        self.is_cancelled()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_distances_only_grow() {
        let p = RouteCalculationProgress::new();
        p.update_status(10.0, 3, 5.0, 2);
        p.update_status(8.0, 4, 7.0, 1);
        assert_eq!(p.distance_from_begin(), 10.0);
        assert_eq!(p.distance_from_end(), 7.0);
        assert_eq!(p.direct_queue_size(), 4);
        assert_eq!(p.reverse_queue_size(), 1);
    }

    #[test]
    fn progress_estimate() {
        let p = RouteCalculationProgress::new();
        assert_eq!(p.calculation_progress(), 0.0);
        p.set_total_estimated_distance(100.0);
        p.update_status(20.0, 0, 30.0, 0);
        assert!((p.calculation_progress() - 0.5).abs() < 1e-9);
        p.update_status(200.0, 0, 0.0, 0);
        assert_eq!(p.calculation_progress(), 1.0);
    }

    #[test]
    fn cancellation_and_not_found() {
        let p = RouteCalculationProgress::new();
        assert!(!p.is_aborted());
        assert_eq!(p.segment_not_found(), None);
        p.set_segment_not_found(1);
        p.cancel();
        assert!(p.is_aborted());
        assert_eq!(p.segment_not_found(), Some(1));
    }
}
