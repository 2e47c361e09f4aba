// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::f64::consts::PI;
use std::sync::Arc;

use super::segment::RoadPoint;
use super::turn::TurnType;
use crate::geo::align_angle_difference;
use crate::obf::{PointI, RouteDataObject};

/// Look-ahead distance (in meters) used to compute bearings.
pub const DIST_BEARING_DETECT: f64 = 5.0;

/// Look-ahead distance (in meters) used to compute bearings on unmatched roads.
pub const DIST_BEARING_DETECT_UNMATCHED: f64 = 50.0;

/// Highway value of synthetic roads built from straight lines.
pub const UNMATCHED_HIGHWAY_TYPE: &str = "unmatched";

/// A part of a road driven by a route, from `start_point_index` to
/// `end_point_index` (inclusive, possibly backwards).
#[derive(Debug, Clone)]
pub struct RouteSegmentResult {
    pub object: Arc<RouteDataObject>,
    start_point_index: usize,
    end_point_index: usize,

    /// Time (in seconds) to drive the segment, as presented to the user.
    pub segment_time: f64,

    /// Speed (in m/s) used to compute `segment_time`.
    pub segment_speed: f64,

    /// Cost (in seconds) of the segment, as seen by the route search.
    pub routing_time: f64,

    /// Length in meters.
    pub distance: f64,

    /// Roads leaving the segment's points, by point offset from the start.
    attached_routes: Vec<Vec<RouteSegmentResult>>,

    /// Roads found at the segment's points during the search, by point offset from the start.
    pre_attached_routes: Vec<Vec<RoadPoint>>,

    pub turn_type: Option<TurnType>,
    pub description: String,
}

impl RouteSegmentResult {
    pub fn new(object: Arc<RouteDataObject>, start_point_index: usize, end_point_index: usize) -> Self {
        Self {
            object,
            start_point_index,
            end_point_index,
            segment_time: 0.0,
            segment_speed: 0.0,
            routing_time: 0.0,
            distance: 0.0,
            attached_routes: Vec::new(),
            pre_attached_routes: Vec::new(),
            turn_type: None,
            description: String::new(),
        }
    }

    #[inline]
    pub fn start_point_index(&self) -> usize {
        self.start_point_index
    }

    #[inline]
    pub fn end_point_index(&self) -> usize {
        self.end_point_index
    }

    pub fn set_start_point_index(&mut self, i: usize) {
        self.start_point_index = i;
        self.update_capacity();
    }

    pub fn set_end_point_index(&mut self, i: usize) {
        self.end_point_index = i;
        self.update_capacity();
    }

    fn update_capacity(&mut self) {
        let capacity = self.start_point_index.abs_diff(self.end_point_index) + 1;
        self.attached_routes.truncate(capacity);
    }

    #[inline]
    pub fn is_forward_direction(&self) -> bool {
        self.end_point_index > self.start_point_index
    }

    /// Indices of the driven points, from start to end (inclusive).
    pub fn point_indices(&self) -> Box<dyn Iterator<Item = usize>> {
        if self.is_forward_direction() {
            Box::new(self.start_point_index..=self.end_point_index)
        } else {
            Box::new((self.end_point_index..=self.start_point_index).rev())
        }
    }

    /// Driven points, from start to end (inclusive).
    pub fn points(&self) -> impl Iterator<Item = PointI> + '_ {
        self.point_indices().map(|i| self.object.points[i])
    }

    #[inline]
    pub fn start_point(&self) -> PointI {
        self.object.points[self.start_point_index]
    }

    #[inline]
    pub fn end_point(&self) -> PointI {
        self.object.points[self.end_point_index]
    }

    /// Records a road leaving the point `road_index`. Deleted roads are skipped.
    pub fn attach_route(&mut self, road_index: usize, r: RouteSegmentResult) {
        if r.object.is_road_deleted() {
            return;
        }
        let st = road_index.abs_diff(self.start_point_index);
        if st >= self.attached_routes.len() {
            self.attached_routes.resize_with(st + 1, Vec::new);
        }
        self.attached_routes[st].push(r);
    }

    pub fn attached_routes(&self, route_index: usize) -> &[RouteSegmentResult] {
        let st = route_index.abs_diff(self.start_point_index);
        self.attached_routes.get(st).map_or(&[], |v| v.as_slice())
    }

    pub fn set_pre_attached_routes(&mut self, routes: Vec<Vec<RoadPoint>>) {
        self.pre_attached_routes = routes;
    }

    pub fn pre_attached_routes(&self, route_index: usize) -> &[RoadPoint] {
        let st = route_index.abs_diff(self.start_point_index);
        self.pre_attached_routes.get(st).map_or(&[], |v| v.as_slice())
    }

    /// Takes over the pre-attached routes of `other`, skipping its first `shift` points.
    pub fn copy_pre_attached_routes(&mut self, other: &RouteSegmentResult, shift: usize) {
        if !other.pre_attached_routes.is_empty() {
            self.pre_attached_routes = other.pre_attached_routes.iter().skip(shift).cloned().collect();
        }
    }

    /// Realigns pre-attached routes after a new start point was inserted into the road,
    /// either in front of the old start (`prepend`) or in its place.
    pub fn shift_pre_attached_routes(&mut self, prepend: bool) {
        if self.pre_attached_routes.is_empty() {
            return;
        }
        if prepend {
            self.pre_attached_routes.insert(0, Vec::new());
        } else {
            self.pre_attached_routes[0].clear();
        }
    }

    /// Bearing (in degrees) when leaving the start point.
    pub fn bearing_begin(&self) -> f64 {
        self.bearing_begin_at(self.start_point_index, DIST_BEARING_DETECT)
    }

    /// Bearing (in degrees) when arriving at the end point.
    pub fn bearing_end(&self) -> f64 {
        self.bearing_end_at(self.end_point_index, DIST_BEARING_DETECT)
    }

    pub fn bearing_begin_at(&self, point: usize, dist: f64) -> f64 {
        let dr = self
            .object
            .direction_route_dist(point, self.start_point_index < self.end_point_index, dist);
        dr / PI * 180.0
    }

    pub fn bearing_end_at(&self, point: usize, dist: f64) -> f64 {
        let dr = self
            .object
            .direction_route_dist(point, self.start_point_index > self.end_point_index, dist);
        align_angle_difference(dr - PI) / PI * 180.0
    }

    /// Distance from `point` to the end (`plus`) or from the start to `point`.
    pub fn distance_at(&self, point: usize, plus: bool) -> f64 {
        if plus {
            self.object.distance(point, self.end_point_index)
        } else {
            self.object.distance(self.start_point_index, point)
        }
    }

    /// Interleaved `[distance, height]` pairs of the driven points, in driving order.
    /// Empty if the road has no elevation data.
    pub fn height_values(&self) -> Vec<f64> {
        let pf = self.object.calculate_height_array();
        if pf.is_empty() {
            return pf;
        }

        let st = self.start_point_index.min(self.end_point_index);
        let end = self.start_point_index.max(self.end_point_index);
        let sz = (end - st + 1) * 2;
        let mut res = vec![0.0; sz];

        if self.start_point_index > self.end_point_index {
            let mut e = end;
            for k in 1..=sz / 2 {
                let ind = 2 * e;
                if ind < pf.len() && k < sz / 2 {
                    res[2 * k] = pf[ind];
                }
                if ind + 1 < pf.len() {
                    res[2 * (k - 1) + 1] = pf[ind + 1];
                }
                e = e.saturating_sub(1);
            }
        } else {
            for k in 0..sz / 2 {
                let ind = 2 * (st + k);
                if k > 0 && ind < pf.len() {
                    res[2 * k] = pf[ind];
                }
                if ind + 1 < pf.len() {
                    res[2 * k + 1] = pf[ind + 1];
                }
            }
        }
        res
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obf::road::tests::rules;

    fn road() -> Arc<RouteDataObject> {
        let mut r = RouteDataObject::new(1, rules(&[("highway", "primary")]));
        r.types = vec![1];
        r.points = (0..5).map(|i| PointI::new(1 << 30, (1 << 30) + i * 2000)).collect();
        Arc::new(r)
    }

    #[test]
    fn direction_and_points() {
        let r = RouteSegmentResult::new(road(), 3, 1);
        assert!(!r.is_forward_direction());
        assert_eq!(r.point_indices().collect::<Vec<_>>(), vec![3, 2, 1]);
        assert_eq!(r.end_point(), r.object.points[1]);
    }

    #[test]
    fn bearings_follow_driving_direction() {
        // y31 grows southwards, so driving with increasing indices heads south
        let fwd = RouteSegmentResult::new(road(), 0, 4);
        assert!((fwd.bearing_begin().abs() - 180.0).abs() < 1e-6);
        assert!((fwd.bearing_end().abs() - 180.0).abs() < 1e-6);

        let back = RouteSegmentResult::new(road(), 4, 0);
        assert!(back.bearing_begin().abs() < 1e-6);
        assert!(back.bearing_end().abs() < 1e-6);
    }

    #[test]
    fn attached_routes_by_offset() {
        let mut r = RouteSegmentResult::new(road(), 1, 4);
        r.attach_route(3, RouteSegmentResult::new(road(), 3, 0));
        assert_eq!(r.attached_routes(3).len(), 1);
        assert!(r.attached_routes(2).is_empty());
        assert!(r.attached_routes(10).is_empty());

        // Shrinking the segment drops attachments beyond its end
        r.set_end_point_index(2);
        assert!(r.attached_routes(3).is_empty());
    }
}
