// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::cmp::Ordering;
use std::ops::{Index, IndexMut};
use std::sync::Arc;

use crate::obf::{PointI, RouteDataObject};

/// Number of low bits of a route point id used for the point index and direction.
pub const ROUTE_POINTS: u32 = 11;

/// Identifier of a directed interval of a road: `(road id << 11) + (interval << 1) + positive`.
#[inline]
pub fn route_point_id(road_id: i64, interval: i64, positive: bool) -> i64 {
    (road_id << ROUTE_POINTS) + (interval << 1) + positive as i64
}

/// Compares the priorities `g + coefficient * h` of two segments.
/// Lower values are expanded first.
#[inline]
pub fn priority_cmp(
    a_from_start: f64,
    a_to_end: f64,
    b_from_start: f64,
    b_to_end: f64,
    heuristic_coefficient: f64,
) -> Ordering {
    let f1 = a_from_start + heuristic_coefficient * a_to_end;
    let f2 = b_from_start + heuristic_coefficient * b_to_end;
    f1.partial_cmp(&f2).unwrap_or(Ordering::Equal)
}

/// A road passing through a graph node, with the index of the node on that road.
#[derive(Debug, Clone)]
pub struct RoadPoint {
    pub road: Arc<RouteDataObject>,
    pub point: usize,
}

impl RoadPoint {
    pub fn new(road: Arc<RouteDataObject>, point: usize) -> Self {
        Self { road, point }
    }

    #[inline]
    pub fn location(&self) -> PointI {
        self.road.points[self.point]
    }
}

/// A road matched to a requested route point.
#[derive(Debug, Clone)]
pub struct RouteSegmentPoint {
    pub road: Arc<RouteDataObject>,

    /// Index of the end of the road interval closest to the requested point.
    pub start: usize,

    /// Projection of the requested point onto the road.
    pub precise: PointI,

    /// Squared tile-metric distance from the requested point to `precise`.
    pub dist: f64,

    /// Farther candidates, used when the search can't leave the closest one.
    pub others: Vec<RouteSegmentPoint>,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum SegmentDirection {
    #[default]
    Unassigned,
    Positive,
    Negative,
}

/// Marks a segment joining the forward and the reverse search.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub enum FinalState {
    #[default]
    NotFinal,

    /// Created by the reverse search.
    ReverseFinal,

    /// Created by the forward search.
    ForwardFinal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SegmentId(u32);

/// Search-time state of moving along a road from `start` in a direction.
#[derive(Debug, Clone)]
pub struct RouteSegment {
    pub road: Arc<RouteDataObject>,
    pub start: usize,
    pub direction: SegmentDirection,

    pub parent: Option<SegmentId>,

    /// Point of the parent's road at which this segment was entered.
    pub parent_end: usize,

    /// Cost (in seconds) from the origin of the search.
    pub distance_from_start: f64,

    /// Estimated cost (in seconds) to the target of the search.
    pub distance_to_end: f64,

    pub final_state: FinalState,

    /// For final segments, the segment of the other search they join.
    pub opposite: Option<SegmentId>,
}

impl RouteSegment {
    pub fn new(road: Arc<RouteDataObject>, start: usize) -> Self {
        Self {
            road,
            start,
            direction: SegmentDirection::Unassigned,
            parent: None,
            parent_end: 0,
            distance_from_start: 0.0,
            distance_to_end: 0.0,
            final_state: FinalState::NotFinal,
            opposite: None,
        }
    }

    #[inline]
    pub fn is_final(&self) -> bool {
        self.final_state != FinalState::NotFinal
    }

    #[inline]
    pub fn is_reverse_final(&self) -> bool {
        self.final_state == FinalState::ReverseFinal
    }

    #[inline]
    pub fn is_positive(&self) -> bool {
        self.direction == SegmentDirection::Positive
    }

    /// Route point id of the interval leaving `start` towards `positive`.
    pub fn point_id(&self, positive: bool) -> i64 {
        let interval = if positive {
            self.start as i64
        } else {
            self.start as i64 - 1
        };
        route_point_id(self.road.id, interval, positive)
    }
}

/// Owner of all segments created by one search.
#[derive(Debug, Default)]
pub struct SegmentArena {
    segments: Vec<RouteSegment>,
}

impl SegmentArena {
    pub fn push(&mut self, segment: RouteSegment) -> SegmentId {
        let id = SegmentId(self.segments.len() as u32);
        self.segments.push(segment);
        id
    }

    pub fn len(&self) -> usize {
        self.segments.len()
    }

    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Walks the parent chain starting at (and including) `id`.
    pub fn ancestors(&self, id: Option<SegmentId>) -> impl Iterator<Item = SegmentId> + '_ {
        std::iter::successors(id, move |&i| self[i].parent)
    }
}

impl Index<SegmentId> for SegmentArena {
    type Output = RouteSegment;

    fn index(&self, id: SegmentId) -> &RouteSegment {
        &self.segments[id.0 as usize]
    }
}

impl IndexMut<SegmentId> for SegmentArena {
    fn index_mut(&mut self, id: SegmentId) -> &mut RouteSegment {
        &mut self.segments[id.0 as usize]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obf::road::tests::rules;

    #[test]
    fn point_ids() {
        assert_eq!(route_point_id(1, 0, false), 2048);
        assert_eq!(route_point_id(1, 3, true), 2048 + 7);

        let mut road = RouteDataObject::new(5, rules(&[]));
        road.points = vec![PointI::new(0, 0), PointI::new(1, 0), PointI::new(2, 0)];
        let s = RouteSegment::new(Arc::new(road), 1);
        assert_eq!(s.point_id(true), route_point_id(5, 1, true));
        assert_eq!(s.point_id(false), route_point_id(5, 0, false));
    }

    #[test]
    fn priorities() {
        assert_eq!(priority_cmp(1.0, 10.0, 5.0, 5.0, 1.0), Ordering::Greater);
        assert_eq!(priority_cmp(1.0, 10.0, 5.0, 5.0, 0.5), Ordering::Less);
        assert_eq!(priority_cmp(2.0, 2.0, 3.0, 1.0, 1.0), Ordering::Equal);
    }

    #[test]
    fn arena_parent_chain() {
        let road = Arc::new(RouteDataObject::new(1, rules(&[])));
        let mut arena = SegmentArena::default();
        let a = arena.push(RouteSegment::new(road.clone(), 0));
        let b = arena.push(RouteSegment::new(road.clone(), 1));
        let c = arena.push(RouteSegment::new(road, 2));
        arena[b].parent = Some(a);
        arena[c].parent = Some(b);
        assert_eq!(arena.ancestors(Some(c)).collect::<Vec<_>>(), vec![c, b, a]);
        assert_eq!(arena.len(), 3);
    }
}
