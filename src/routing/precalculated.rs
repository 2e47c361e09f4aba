// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use super::result::RouteSegmentResult;
use super::router::GeneralRouter;
use crate::geo::{get_projection_point, measured_dist_31, square_dist_31_tile_metric, square_root_dist_31};
use crate::obf::PointI;

/// Largest offset (on either axis) at which a point of the route is
/// still considered near a queried position.
const MAX_INDEX_SHIFT: i64 = 1 << 24;

/// PointTree implements the [k-d tree data structure](https://en.wikipedia.org/wiki/K-d_tree)
/// over the points of a precalculated route, to quickly find the route point nearest
/// to a position. Distances use the tile metric.
#[derive(Debug, Clone)]
struct PointTree {
    pivot: (PointI, usize),
    left: Option<Box<PointTree>>,
    right: Option<Box<PointTree>>,
}

impl PointTree {
    fn build(points: &mut [(PointI, usize)]) -> Option<Self> {
        Self::build_impl(points, false)
    }

    fn build_impl(points: &mut [(PointI, usize)], x_divides: bool) -> Option<Self> {
        match points.len() {
            0 => None,
            1 => Some(Self {
                pivot: points[0],
                left: None,
                right: None,
            }),
            _ => {
                if x_divides {
                    points.sort_by_key(|(p, i)| (p.x, *i));
                } else {
                    points.sort_by_key(|(p, i)| (p.y, *i));
                }
                let median = points.len() / 2;
                let pivot = points[median];
                let (left, right_and_pivot) = points.split_at_mut(median);
                let right = &mut right_and_pivot[1..];
                Some(Self {
                    pivot,
                    left: Self::build_impl(left, !x_divides).map(Box::new),
                    right: Self::build_impl(right, !x_divides).map(Box::new),
                })
            }
        }
    }

    fn nearest(&self, p: PointI) -> (usize, f64) {
        self.nearest_impl(p, false)
    }

    fn nearest_impl(&self, p: PointI, x_divides: bool) -> (usize, f64) {
        let (pivot, pivot_idx) = self.pivot;
        let mut best = pivot_idx;
        let mut best_dist = square_dist_31_tile_metric(p.x, p.y, pivot.x, pivot.y);

        let first_left = if x_divides { p.x < pivot.x } else { p.y < pivot.y };
        let (first, second) = if first_left {
            (&self.left, &self.right)
        } else {
            (&self.right, &self.left)
        };

        if let Some(ref branch) = first {
            let (alt, alt_dist) = branch.nearest_impl(p, !x_divides);
            if alt_dist < best_dist || (alt_dist == best_dist && alt < best) {
                best = alt;
                best_dist = alt_dist;
            }
        }

        if let Some(ref branch) = second {
            // A closer point is possible in the second branch only if
            // the splitting axis is closer than the current best candidate.
            let dist_to_axis = if x_divides {
                square_dist_31_tile_metric(p.x, p.y, pivot.x, p.y)
            } else {
                square_dist_31_tile_metric(p.x, p.y, p.x, pivot.y)
            };

            if dist_to_axis <= best_dist {
                let (alt, alt_dist) = branch.nearest_impl(p, !x_divides);
                if alt_dist < best_dist || (alt_dist == best_dist && alt < best) {
                    best = alt;
                    best_dist = alt_dist;
                }
            }
        }

        return (best, best_dist);
    }
}

/// A previously calculated (usually coarse) route, used as the search heuristic
/// of a detailed route calculation along the same corridor.
///
/// `times[i]` is the travel time from the i-th point to the last point.
#[derive(Debug, Clone, Default)]
pub struct PrecalculatedRouteDirection {
    points: Vec<PointI>,
    times: Vec<f64>,
    tree: Option<Arc<PointTree>>,

    min_speed: f64,
    max_speed: f64,

    start_point: Option<PointI>,
    end_point: Option<PointI>,
    start_finish_time: f64,
    end_finish_time: f64,

    pub follow_next: bool,
}

impl PrecalculatedRouteDirection {
    /// Builds a direction from route results, skipping `cutoff_distance` meters
    /// at both ends. Returns `None` if nothing remains after the cut.
    pub fn build(results: &[RouteSegmentResult], cutoff_distance: f64, max_speed: f64) -> Option<Self> {
        let mut begin = 0;
        let mut d = cutoff_distance;
        while begin < results.len() {
            d -= results[begin].distance;
            if d < 0.0 {
                break;
            }
            begin += 1;
        }

        let mut end = results.len();
        d = cutoff_distance;
        while end > 0 {
            d -= results[end - 1].distance;
            if d < 0.0 {
                break;
            }
            end -= 1;
        }

        if begin < end {
            Some(Self::from_results(&results[begin..end], max_speed))
        } else {
            None
        }
    }

    /// Builds a direction from route results, with the speed of every
    /// segment taken from its distance and routing time.
    pub fn from_results(results: &[RouteSegmentResult], max_speed: f64) -> Self {
        let mut points = Vec::new();
        let mut speeds = Vec::new();
        for s in results {
            let speed = if s.routing_time == 0.0 || s.distance == 0.0 {
                max_speed
            } else {
                s.distance / s.routing_time
            };

            for p in s.points().skip(1) {
                points.push(p);
                speeds.push(speed);
            }
        }
        Self::from_speeds(points, &speeds, max_speed)
    }

    /// Builds a direction from a polyline driven at `max_speed`.
    pub fn from_points(points: Vec<PointI>, max_speed: f64) -> Self {
        let speeds = vec![max_speed; points.len()];
        Self::from_speeds(points, &speeds, max_speed)
    }

    fn from_speeds(points: Vec<PointI>, speeds: &[f64], max_speed: f64) -> Self {
        let mut times = Vec::with_capacity(points.len());
        let mut total = 0.0;
        for (i, p) in points.iter().enumerate() {
            let prev = points[i.saturating_sub(1)];
            let t = measured_dist_31(prev.x, prev.y, p.x, p.y) / speeds[i];
            times.push(t);
            total += t;
        }

        // Convert per-point times into times remaining to the end
        let mut remaining = total;
        for t in times.iter_mut() {
            remaining -= *t;
            *t = remaining;
        }

        let mut indexed: Vec<(PointI, usize)> = points.iter().copied().zip(0..).collect();
        Self {
            tree: PointTree::build(&mut indexed).map(Arc::new),
            points,
            times,
            max_speed,
            ..Default::default()
        }
    }

    /// The points between `s1` and `s2` (inclusive, in file order),
    /// with times relative to `s2` (or `s1` if `s1 > s2`).
    fn sub_range(&self, s1: usize, s2: usize) -> Self {
        let (lo, hi, inverse) = if s1 > s2 { (s2, s1, true) } else { (s1, s2, false) };
        let base = self.times[if inverse { lo } else { hi }];
        let points = self.points[lo..=hi].to_vec();
        let times = self.times[lo..=hi].iter().map(|t| t - base).collect();
        let mut indexed: Vec<(PointI, usize)> = points.iter().copied().zip(0..).collect();
        Self {
            tree: PointTree::build(&mut indexed).map(Arc::new),
            points,
            times,
            min_speed: self.min_speed,
            max_speed: self.max_speed,
            ..Default::default()
        }
    }

    pub fn len(&self) -> usize {
        self.points.len()
    }

    pub fn is_empty(&self) -> bool {
        self.points.is_empty()
    }

    /// Restricts the direction to the part between the points nearest to
    /// `start` and `target`, and calibrates it to the router's speeds.
    /// Returns `None` if either point is far from the direction.
    pub fn adopt(&self, start: PointI, target: PointI, router: &GeneralRouter) -> Option<Self> {
        let Some(ind1) = self.index_of(start) else {
            log::warn!("precalculated direction: start {start:?} is too far from the route");
            return None;
        };
        let Some(ind2) = self.index_of(target) else {
            log::warn!("precalculated direction: target {target:?} is too far from the route");
            return None;
        };

        let max_speed = router.max_speed;
        let mut adopted = self.sub_range(ind1, ind2);
        adopted.min_speed = router.min_speed;
        adopted.max_speed = max_speed;
        adopted.start_point = Some(start);
        adopted.start_finish_time = {
            let p = self.points[ind1];
            square_root_dist_31(p.x, p.y, start.x, start.y) / max_speed
        };
        adopted.end_point = Some(target);
        adopted.end_finish_time = {
            let p = self.points[ind2];
            square_root_dist_31(p.x, p.y, target.x, target.y) / max_speed
        };
        adopted.follow_next = self.follow_next;
        Some(adopted)
    }

    /// Index of the route point nearest to `p`, if it lies within the search radius.
    pub fn index_of(&self, p: PointI) -> Option<usize> {
        let (idx, _) = self.tree.as_ref()?.nearest(p);
        let q = self.points[idx];
        let within = (q.x as i64 - p.x as i64).abs() <= MAX_INDEX_SHIFT
            && (q.y as i64 - p.y as i64).abs() <= MAX_INDEX_SHIFT;
        within.then_some(idx)
    }

    /// Distance (in meters) from `p` to the route around the `ind`-th point.
    /// Zero at the ends of the route.
    pub fn deviation_distance(&self, p: PointI, ind: usize) -> f64 {
        if ind == 0 || ind + 1 >= self.points.len() {
            return 0.0;
        }

        let next = self.points[ind + 1];
        let prev = self.points[ind - 1];
        let nx = square_root_dist_31(p.x, p.y, next.x, next.y);
        let pr = square_root_dist_31(p.x, p.y, prev.x, prev.y);
        let neighbour = if nx > pr { prev } else { next };
        let a = self.points[ind];
        let (px, py) = get_projection_point(p.x, p.y, a.x, a.y, neighbour.x, neighbour.y);
        square_root_dist_31(p.x, p.y, px, py)
    }

    /// Estimated time (in seconds) between `begin` and `end`, one of which must be
    /// the start or target this direction was adopted for.
    ///
    /// Returns -2 if neither point is an endpoint, -1 if the other point can't
    /// be placed on the route.
    pub fn time_estimate(&self, begin: PointI, end: PointI) -> f64 {
        let is_endpoint = |p: PointI| Some(p) == self.start_point || Some(p) == self.end_point;
        let (other, start) = if is_endpoint(begin) {
            (end, Some(begin) == self.start_point)
        } else if is_endpoint(end) {
            (begin, Some(end) == self.start_point)
        } else {
            return -2.0;
        };

        let Some(ind) = self.index_of(other) else {
            return -1.0;
        };
        if (ind == 0 && start) || (ind + 1 == self.points.len() && !start) {
            return -1.0;
        }

        let deviation_penalty = self.deviation_distance(other, ind) / self.min_speed;
        if start {
            self.times[0] - self.times[ind] + deviation_penalty + self.start_finish_time
        } else {
            self.times[ind] + deviation_penalty + self.end_finish_time
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::router::car_router;

    macro_rules! assert_almost_eq {
        ($a:expr, $b:expr, $eps:expr) => {
            assert!((($a - $b).abs() < $eps), "assertion failed: {} ≈ {}", $a, $b)
        };
    }

    const BASE: i32 = 1 << 30;

    fn line(n: i32) -> Vec<PointI> {
        (0..n).map(|i| PointI::new(BASE + i * 10_000, BASE)).collect()
    }

    #[test]
    fn nearest_point() {
        let mut pts = vec![
            (PointI::new(0, 0), 0),
            (PointI::new(100, 0), 1),
            (PointI::new(100, 100), 2),
            (PointI::new(0, 100), 3),
            (PointI::new(50, 50), 4),
        ];
        let tree = PointTree::build(&mut pts).expect("tree from non-empty slice must not be empty");
        assert_eq!(tree.nearest(PointI::new(90, 5)).0, 1);
        assert_eq!(tree.nearest(PointI::new(45, 55)).0, 4);
        assert_eq!(tree.nearest(PointI::new(-10, 120)).0, 3);
    }

    #[test]
    fn remaining_times_decrease() {
        let d = PrecalculatedRouteDirection::from_points(line(5), 10.0);
        assert_eq!(d.len(), 5);
        assert_eq!(*d.times.last().unwrap(), 0.0);
        assert!(d.times.windows(2).all(|w| w[0] > w[1]));
    }

    #[test]
    fn far_points_are_not_indexed() {
        let d = PrecalculatedRouteDirection::from_points(line(5), 10.0);
        assert_eq!(d.index_of(PointI::new(BASE + 21_000, BASE + 100)), Some(2));
        assert_eq!(d.index_of(PointI::new(BASE, BASE + (1 << 25))), None);
    }

    #[test]
    fn estimates_after_adoption() {
        let router = car_router();
        let d = PrecalculatedRouteDirection::from_points(line(11), 10.0);
        let start = PointI::new(BASE, BASE);
        let target = PointI::new(BASE + 100_000, BASE);
        let a = d.adopt(start, target, &router).expect("endpoints lie on the route");
        assert_eq!(a.len(), 11);

        // From the 5th point to the target: the time stored for that point
        let mid = PointI::new(BASE + 50_000, BASE);
        assert_almost_eq!(a.time_estimate(mid, target), a.times[5], 1e-9);
        // From the start to the 5th point: time already spent
        assert_almost_eq!(a.time_estimate(start, mid), a.times[0] - a.times[5], 1e-9);
        // Neither point is an endpoint
        assert_eq!(a.time_estimate(mid, mid), -2.0);
        // Start point evaluated against the start itself
        assert_eq!(a.time_estimate(start, start), -1.0);
    }

    #[test]
    fn cutoff_drops_short_routes() {
        assert!(PrecalculatedRouteDirection::build(&[], 3000.0, 10.0).is_none());
    }
}
