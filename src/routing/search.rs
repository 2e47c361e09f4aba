// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Bidirectional A* over the roads of a [RoutingContext].
//!
//! The forward search expands from the start, the reverse search from the target.
//! Each search walks whole roads from a segment's start point, marking intervals
//! as visited and queueing the roads crossing every point. The searches meet once
//! one of them reaches an interval the other has already visited in the same
//! driving direction; a final segment joining both half-paths is queued then,
//! and popping it ends the search.

use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap};
use std::f64::consts::PI;
use std::sync::Arc;

use super::context::{RouteCalculationMode, RoutingContext};
use super::result::RouteSegmentResult;
use super::router::GeneralRouter;
use super::segment::{
    priority_cmp, route_point_id, FinalState, RoadPoint, RouteSegment, RouteSegmentPoint, SegmentArena,
    SegmentDirection, SegmentId,
};
use crate::geo::{align_angle_difference, square_root_dist_31};
use crate::obf::{PointI, RestrictionKind, RouteDataObject};
use crate::Error;

/// Penalty (in seconds) of starting against the initial direction of travel.
const INITIAL_DIRECTION_PENALTY: f64 = 500.0;

/// Number of iterations between progress updates and cancellation checks.
const ITERATIONS_BETWEEN_CHECKS: usize = 100;

/// Heuristic coefficient used to decide which search to expand next.
const DIRECTION_SELECTION_COEFFICIENT: f64 = 0.5;

/// Time (in seconds) to drive `distance` meters over `road`, plus `obstacles_time`.
pub fn calculate_time_with_obstacles(
    router: &GeneralRouter,
    road: &RouteDataObject,
    distance: f64,
    obstacles_time: f64,
) -> f64 {
    let priority = router.define_speed_priority(road);
    let mut speed = router.define_routing_speed(road) * priority;
    if speed == 0.0 {
        speed = router.min_speed * priority;
    }
    if speed > router.max_speed {
        speed = router.max_speed;
    }
    obstacles_time + distance / speed
}

#[derive(Debug, Clone, Copy)]
struct QueueEntry {
    from_start: f64,
    to_end: f64,
    priority: f64,
    order: u64,
    id: SegmentId,
}

impl PartialEq for QueueEntry {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for QueueEntry {}

impl PartialOrd for QueueEntry {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueueEntry {
    // BinaryHeap is a max-heap: lower priorities and earlier entries must compare greater
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .priority
            .total_cmp(&self.priority)
            .then_with(|| other.order.cmp(&self.order))
    }
}

/// State of one search direction.
#[derive(Debug, Default)]
struct Frontier {
    queue: BinaryHeap<QueueEntry>,

    /// Route point id of a crossed interval → segment which crossed it.
    visited: HashMap<i64, SegmentId>,

    /// Queued segments by (road id, start point, positive).
    segments: HashMap<(i64, usize, bool), SegmentId>,
    pushed: u64,
    last_distance: f64,
}

impl Frontier {
    fn push(&mut self, arena: &SegmentArena, id: SegmentId, heuristic_coefficient: f64) {
        let s = &arena[id];
        self.queue.push(QueueEntry {
            from_start: s.distance_from_start,
            to_end: s.distance_to_end,
            priority: s.distance_from_start + heuristic_coefficient * s.distance_to_end,
            order: self.pushed,
            id,
        });
        self.pushed += 1;
    }
}

/// How a restriction treats a candidate road at an intersection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPermission {
    Free,
    Forbidden,
    Exclusive,

    /// Entering the current road from the candidate is forbidden by an only_*
    /// restriction of the candidate pointing elsewhere.
    ReverseOnly,
}

fn permission_of(kind: Option<RestrictionKind>) -> TurnPermission {
    match kind {
        None => TurnPermission::Free,
        Some(k) if k.is_only() => TurnPermission::Exclusive,
        Some(_) => TurnPermission::Forbidden,
    }
}

struct BinaryRoutePlanner<'a> {
    ctx: &'a mut RoutingContext,
    router: Arc<GeneralRouter>,
    arena: SegmentArena,
    direct: Frontier,
    reverse: Frontier,
    heuristic_coefficient: f64,
    start: PointI,
    target: PointI,
}

impl<'a> BinaryRoutePlanner<'a> {
    fn new(ctx: &'a mut RoutingContext, start: PointI, target: PointI) -> Self {
        let router = Arc::clone(&ctx.config.router);
        let heuristic_coefficient = ctx.config.heuristic_coefficient;
        Self {
            ctx,
            router,
            arena: SegmentArena::default(),
            direct: Frontier::default(),
            reverse: Frontier::default(),
            heuristic_coefficient,
            start,
            target,
        }
    }

    fn frontier(&self, reverse: bool) -> &Frontier {
        if reverse {
            &self.reverse
        } else {
            &self.direct
        }
    }

    fn frontier_mut(&mut self, reverse: bool) -> &mut Frontier {
        if reverse {
            &mut self.reverse
        } else {
            &mut self.direct
        }
    }

    fn enqueue(&mut self, id: SegmentId, reverse: bool) {
        let coefficient = self.heuristic_coefficient;
        let frontier = if reverse {
            &mut self.reverse
        } else {
            &mut self.direct
        };
        frontier.push(&self.arena, id, coefficient);
    }

    /// Estimated time (in seconds) from `from` to `to`.
    fn h(&self, from: PointI, to: PointI) -> f64 {
        if let Some(p) = &self.ctx.precalculated_route_direction {
            let te = p.time_estimate(from, to);
            if te > 0.0 {
                return te;
            }
        }
        square_root_dist_31(from.x, from.y, to.x, to.y) / self.router.max_speed
    }

    /// Queues both directions of a matched route point.
    fn seed(&mut self, point: &RouteSegmentPoint, reverse: bool) {
        let goal = if reverse { self.start } else { self.target };
        let estimate = self.h(point.precise, goal);

        let mut penalty_positive = 0.0;
        let mut penalty_negative = 0.0;
        if !reverse {
            if let Some(direction) = self.ctx.config.initial_direction {
                let plus = point.road.direction_route(point.start.saturating_sub(1), true);
                let diff = plus - direction;
                if align_angle_difference(diff).abs() <= PI / 3.0 {
                    penalty_negative = INITIAL_DIRECTION_PENALTY;
                } else if align_angle_difference(diff - PI).abs() <= PI / 3.0 {
                    penalty_positive = INITIAL_DIRECTION_PENALTY;
                }
            }
        }

        for (positive, penalty) in [(true, penalty_positive), (false, penalty_negative)] {
            let start = if positive {
                point.start.saturating_sub(1)
            } else {
                point.start
            };
            if (positive && start + 1 >= point.road.points.len()) || (!positive && start == 0) {
                continue;
            }
            let mut s = RouteSegment::new(Arc::clone(&point.road), start);
            s.direction = if positive {
                SegmentDirection::Positive
            } else {
                SegmentDirection::Negative
            };
            s.distance_from_start = penalty;
            s.distance_to_end = estimate;
            let id = self.arena.push(s);
            self.enqueue(id, reverse);
        }
    }

    /// Whether the segment may be walked at all: one-way roads (seen in reverse
    /// by the reverse search), and intervals already visited.
    fn initial_movement_allowed(&self, segment: &RouteSegment, reverse: bool) -> bool {
        let oneway = self.router.is_one_way(&segment.road);
        let allowed = if segment.is_positive() != reverse {
            oneway >= 0
        } else {
            oneway <= 0
        };
        allowed
            && !self
                .frontier(reverse)
                .visited
                .contains_key(&segment.point_id(segment.is_positive()))
    }

    fn process_route_segment(&mut self, id: SegmentId, reverse: bool, no_intersections: bool) -> Result<(), Error> {
        let segment = self.arena[id].clone();
        if !self.initial_movement_allowed(&segment, reverse) {
            return Ok(());
        }

        let road = Arc::clone(&segment.road);
        let router = Arc::clone(&self.router);
        let positive = segment.is_positive();
        let driving_forward = positive != reverse;

        let mut obstacles_time = 0.0;
        let mut segment_dist = 0.0;
        let mut point = segment.start;
        let mut prev = road.points[point];

        loop {
            let prev_ind = point;
            if positive {
                point += 1;
            } else if point == 0 {
                break;
            } else {
                point -= 1;
            }
            if point >= road.points.len() {
                break;
            }

            let interval = if positive { point as i64 - 1 } else { point as i64 };
            let visit_id = route_point_id(road.id, interval, positive);
            let frontier = self.frontier_mut(reverse);
            if frontier.visited.contains_key(&visit_id) {
                break;
            }
            frontier.visited.insert(visit_id, id);

            let p = road.points[point];
            segment_dist += square_root_dist_31(prev.x, prev.y, p.x, p.y);
            prev = p;

            let obstacle = router.define_routing_obstacle(&road, point, driving_forward);
            if obstacle < 0.0 {
                break;
            }
            obstacles_time += obstacle;
            obstacles_time += if driving_forward {
                router.define_height_obstacle(&road, prev_ind, point)
            } else {
                router.define_height_obstacle(&road, point, prev_ind)
            };

            if self.check_if_opposite_segment_was_visited(id, reverse, point, segment_dist, obstacles_time) {
                break;
            }
            if no_intersections {
                continue;
            }

            let dist_from_start = segment.distance_from_start
                + calculate_time_with_obstacles(&router, &road, segment_dist, obstacles_time);
            let chain = self.ctx.load_route_segment(p.x, p.y)?;
            if !self.process_intersections(id, &segment, reverse, point, dist_from_start, &chain) {
                break;
            }
        }
        Ok(())
    }

    /// Creates the final segment if the other search already crossed the
    /// interval ending at `point` in the same driving direction.
    fn check_if_opposite_segment_was_visited(
        &mut self,
        id: SegmentId,
        reverse: bool,
        point: usize,
        segment_dist: f64,
        obstacles_time: f64,
    ) -> bool {
        let segment = &self.arena[id];
        if segment.is_final() {
            return false;
        }
        let positive = segment.is_positive();
        let interval = if positive { point as i64 - 1 } else { point as i64 };
        let opposite_id = route_point_id(segment.road.id, interval, !positive);
        let Some(&opposite) = self.frontier(!reverse).visited.get(&opposite_id) else {
            return false;
        };
        if self.meeting_breaks_via_restriction(id, opposite, reverse) {
            return false;
        }

        let dist = segment.distance_from_start
            + calculate_time_with_obstacles(&self.router, &segment.road, segment_dist, obstacles_time);
        let mut frs = RouteSegment::new(Arc::clone(&segment.road), point);
        frs.direction = segment.direction;
        frs.parent = Some(id);
        frs.parent_end = point;
        frs.final_state = if reverse {
            FinalState::ReverseFinal
        } else {
            FinalState::ForwardFinal
        };
        frs.distance_from_start = self.arena[opposite].distance_from_start + dist;
        frs.distance_to_end = 0.0;
        frs.opposite = Some(opposite);

        let final_id = self.arena.push(frs);
        self.enqueue(final_id, reverse);
        true
    }

    /// Whether joining the half-paths ending in `id` and `opposite` (both on the
    /// same road) drives through a restriction with that road as its via.
    fn meeting_breaks_via_restriction(&self, id: SegmentId, opposite: SegmentId, reverse: bool) -> bool {
        if !self.router.restrictions_aware {
            return false;
        }
        let (from, to) = if reverse {
            (self.parent_road(opposite), self.parent_road(id))
        } else {
            (self.parent_road(id), self.parent_road(opposite))
        };
        let (Some(from), Some(to)) = (from, to) else {
            return false;
        };

        let via = self.arena[id].road.id;
        let mut only_elsewhere = false;
        for r in from.restrictions.iter().filter(|r| r.via == Some(via)) {
            if r.to == to.id {
                return !r.kind.is_only();
            }
            only_elsewhere |= r.kind.is_only();
        }
        only_elsewhere
    }

    fn parent_road(&self, id: SegmentId) -> Option<&RouteDataObject> {
        self.arena[id].parent.map(|p| self.arena[p].road.as_ref())
    }

    /// Queues the roads crossing `point`. Returns whether the walk along
    /// the current road may continue past it.
    fn process_intersections(
        &mut self,
        id: SegmentId,
        segment: &RouteSegment,
        reverse: bool,
        point: usize,
        dist_from_start: f64,
        chain: &[RoadPoint],
    ) -> bool {
        let road = &segment.road;
        let location = road.points[point];
        let goal = if reverse { self.start } else { self.target };
        let distance_to_end = self.h(location, goal);

        let others: Vec<RoadPoint> = chain
            .iter()
            .filter(|rp| !(rp.road.id == road.id && rp.location() == location))
            .cloned()
            .collect();

        let (allowed, continue_road) = match self.process_restrictions(segment, &others, reverse) {
            Some(r) => r,
            None => (others, true),
        };

        for rp in &allowed {
            for positive in [true, false] {
                self.process_one_road_intersection(id, segment, reverse, point, dist_from_start, distance_to_end, rp, positive);
            }
        }
        continue_road
    }

    /// Filters candidate roads by turn restrictions. Returns `None` if no
    /// restriction applies, otherwise the allowed roads and whether the
    /// current road may be followed further.
    fn process_restrictions(
        &self,
        segment: &RouteSegment,
        candidates: &[RoadPoint],
        reverse: bool,
    ) -> Option<(Vec<RoadPoint>, bool)> {
        if !self.router.restrictions_aware {
            return None;
        }
        let road = &segment.road;
        let parent = segment.parent.map(|p| Arc::clone(&self.arena[p].road));
        if !reverse && road.restrictions.is_empty() && parent.as_ref().map_or(true, |p| p.restrictions.is_empty()) {
            return None;
        }

        let mut prescripted = Vec::new();
        let mut not_forbidden = Vec::new();
        let mut exclusive = false;

        for next in candidates {
            let permission = if reverse {
                Self::reverse_permission(road, parent.as_deref(), &next.road, candidates)
            } else {
                Self::forward_permission(road, parent.as_deref(), &next.road)
            };

            match permission {
                TurnPermission::ReverseOnly | TurnPermission::Forbidden => {}
                TurnPermission::Free if exclusive => {}
                TurnPermission::Free => not_forbidden.push(next.clone()),
                TurnPermission::Exclusive if reverse => not_forbidden.push(next.clone()),
                TurnPermission::Exclusive => {
                    // Going forward, the restricted road is the only way out
                    exclusive = true;
                    not_forbidden.clear();
                    prescripted.push(next.clone());
                }
            }
        }

        prescripted.extend(not_forbidden);
        Some((prescripted, !exclusive))
    }

    fn forward_permission(
        road: &RouteDataObject,
        parent: Option<&RouteDataObject>,
        next: &RouteDataObject,
    ) -> TurnPermission {
        let mut kind = road
            .restrictions
            .iter()
            .find(|r| r.to == next.id && r.via.is_none())
            .map(|r| r.kind);
        if kind.is_none() {
            if let Some(parent) = parent {
                kind = parent
                    .restrictions
                    .iter()
                    .find(|r| r.via == Some(road.id) && r.to == next.id)
                    .map(|r| r.kind);
            }
        }
        permission_of(kind)
    }

    /// Whether the reverse search may step from `road` back onto `next`, given
    /// the other roads crossing the same point.
    fn reverse_permission(
        road: &RouteDataObject,
        parent: Option<&RouteDataObject>,
        next: &RouteDataObject,
        candidates: &[RoadPoint],
    ) -> TurnPermission {
        let mut reverse_only = false;
        for r in &next.restrictions {
            let direct = r.via.is_none() && r.to == road.id;
            let via = r.via == Some(road.id) && parent.is_some_and(|p| p.id == r.to);
            if direct || via {
                return permission_of(Some(r.kind));
            }
            // An only_* restriction binds here only if its target leaves this point
            if r.via.is_none() && r.kind.is_only() && candidates.iter().any(|c| c.road.id == r.to) {
                reverse_only = true;
            }
        }
        if reverse_only {
            TurnPermission::ReverseOnly
        } else {
            TurnPermission::Free
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn process_one_road_intersection(
        &mut self,
        id: SegmentId,
        segment: &RouteSegment,
        reverse: bool,
        point: usize,
        dist_from_start: f64,
        distance_to_end: f64,
        next: &RoadPoint,
        positive: bool,
    ) {
        let len = next.road.points.len();
        if (positive && next.point + 1 >= len) || (!positive && next.point == 0) {
            return;
        }

        let turn_time = self.router.calculate_turn_time(
            &next.road,
            next.point,
            if positive { len - 1 } else { 0 },
            &segment.road,
            segment.start,
            point,
        );
        let dist = dist_from_start + turn_time;

        let interval = if positive { next.point as i64 } else { next.point as i64 - 1 };
        let visit_id = route_point_id(next.road.id, interval, positive);
        if let Some(&visited) = self.frontier(reverse).visited.get(&visit_id) {
            if dist < self.arena[visited].distance_from_start && self.heuristic_coefficient <= 1.0 {
                log::warn!(
                    "better route found for already visited segment: road {} point {} ({:.1} < {:.1})",
                    next.road.id,
                    next.point,
                    dist,
                    self.arena[visited].distance_from_start,
                );
            }
            return;
        }

        let key = (next.road.id, next.point, positive);
        let existing = self.frontier(reverse).segments.get(&key).copied();
        let target = match existing {
            Some(existing) => {
                let e = &self.arena[existing];
                let better = priority_cmp(
                    e.distance_from_start,
                    e.distance_to_end,
                    dist,
                    distance_to_end,
                    self.heuristic_coefficient,
                ) == Ordering::Greater;
                if !better {
                    return;
                }
                existing
            }
            None => {
                let mut s = RouteSegment::new(Arc::clone(&next.road), next.point);
                s.direction = if positive {
                    SegmentDirection::Positive
                } else {
                    SegmentDirection::Negative
                };
                let new_id = self.arena.push(s);
                self.frontier_mut(reverse).segments.insert(key, new_id);
                new_id
            }
        };

        let s = &mut self.arena[target];
        s.distance_from_start = dist;
        s.distance_to_end = distance_to_end;
        s.parent = Some(id);
        s.parent_end = point;
        self.enqueue(target, reverse);
    }

    /// Re-seeds an exhausted search from alternative matches of its route point.
    /// Returns true if the search can't continue.
    fn check_if_graph_is_empty(&mut self, allowed: bool, reverse: bool, others: &mut Vec<RouteSegmentPoint>) -> bool {
        if !allowed || !self.frontier(reverse).queue.is_empty() {
            return false;
        }

        while !others.is_empty() {
            let next = others.remove(0);
            let visited = &self.frontier(reverse).visited;
            let pos = route_point_id(next.road.id, next.start as i64 - 1, true);
            let neg = route_point_id(next.road.id, next.start as i64 - 1, false);
            if visited.contains_key(&pos) || visited.contains_key(&neg) {
                continue;
            }
            self.seed(&next, reverse);
            if !self.frontier(reverse).queue.is_empty() {
                return false;
            }
        }

        if reverse {
            log::warn!("route is not found to the selected target point");
        } else {
            log::warn!("route is not found from the selected start point");
        }
        self.ctx.progress.set_segment_not_found(reverse as usize);
        true
    }

    /// Picks the search to expand next.
    fn select_forward_search(&self) -> bool {
        let plan = self.ctx.config.plan_road_direction;
        if plan == 0 {
            match (self.direct.queue.peek(), self.reverse.queue.peek()) {
                (Some(d), Some(r)) => {
                    priority_cmp(d.from_start, d.to_end, r.from_start, r.to_end, DIRECTION_SELECTION_COEFFICIENT)
                        != Ordering::Greater
                }
                (Some(_), None) => true,
                (None, _) => false,
            }
        } else {
            let only_forward = plan > 0;
            let only_backward = plan < 0;
            let mut forward = only_forward;
            if only_backward && !self.direct.queue.is_empty() {
                forward = true;
            }
            if only_forward && !self.reverse.queue.is_empty() {
                forward = false;
            }
            forward
        }
    }

    fn run(&mut self, start: &RouteSegmentPoint, end: &RouteSegmentPoint) -> Result<Option<SegmentId>, Error> {
        let plan = self.ctx.config.plan_road_direction;
        let only_forward = plan > 0;
        let only_backward = plan < 0;
        let mut start_others = start.others.clone();
        let mut end_others = end.others.clone();

        self.seed(start, false);
        self.seed(end, true);
        self.ctx
            .progress
            .set_total_estimated_distance(self.h(start.precise, end.precise) * 2.0);

        let mut iterations = 0;
        let mut final_segment = None;
        loop {
            if self.check_if_graph_is_empty(!only_backward, false, &mut start_others)
                || self.check_if_graph_is_empty(!only_forward, true, &mut end_others)
            {
                break;
            }

            let forward = self.select_forward_search();
            let Some(entry) = self.frontier_mut(!forward).queue.pop() else {
                break;
            };
            if self.arena[entry.id].is_final() {
                final_segment = Some(entry.id);
                break;
            }

            self.ctx.progress.add_visited_segments(1);
            self.frontier_mut(!forward).last_distance = entry.from_start;
            if forward {
                self.process_route_segment(entry.id, false, only_backward)?;
            } else {
                self.process_route_segment(entry.id, true, only_forward)?;
            }

            iterations += 1;
            if iterations % ITERATIONS_BETWEEN_CHECKS == 0 {
                self.ctx.progress.update_status(
                    self.direct.last_distance,
                    self.direct.queue.len(),
                    self.reverse.last_distance,
                    self.reverse.queue.len(),
                );
                if self.ctx.progress.is_cancelled() {
                    log::info!("route calculation cancelled after {iterations} iterations");
                    return Ok(None);
                }
            }
        }

        log::info!(
            "search finished: {} iterations, {} segments, {} direct and {} reverse intervals visited, {} tiles loaded",
            iterations,
            self.arena.len(),
            self.direct.visited.len(),
            self.reverse.visited.len(),
            self.ctx.loaded_tiles(),
        );
        Ok(final_segment)
    }

    fn convert_final_segment_to_results(&self, final_id: SegmentId) -> Vec<RouteSegmentResult> {
        let base = self.ctx.calculation_mode == RouteCalculationMode::Base;
        let fs = &self.arena[final_id];
        let Some(opposite) = fs.opposite else {
            return Vec::new();
        };
        let opp = &self.arena[opposite];
        let reverse_final = fs.is_reverse_final();
        let mut result = Vec::new();

        // Half-path of the reverse search, walked from the meeting point to the target
        let mut segment = if reverse_final { Some(final_id) } else { opp.parent };
        let mut parent_start = if reverse_final { opp.start } else { opp.parent_end };
        let mut parent_time = None;
        while let Some(id) = segment {
            let s = &self.arena[id];
            let mut res = RouteSegmentResult::new(Arc::clone(&s.road), parent_start, s.start);
            parent_time = Self::calc_routing_time(parent_time, final_id, id, s, &mut res);
            parent_start = s.parent_end;
            segment = s.parent;
            add_route_segment_to_result(&mut result, res, false, base);
        }
        result.reverse();

        // Half-path of the forward search, walked from the meeting point to the start
        let mut segment = if reverse_final { opp.parent } else { Some(final_id) };
        let mut parent_end = if reverse_final { opp.parent_end } else { opp.start };
        let mut parent_time = None;
        while let Some(id) = segment {
            let s = &self.arena[id];
            let mut res = RouteSegmentResult::new(Arc::clone(&s.road), s.start, parent_end);
            parent_time = Self::calc_routing_time(parent_time, final_id, id, s, &mut res);
            parent_end = s.parent_end;
            segment = s.parent;
            add_route_segment_to_result(&mut result, res, true, base);
        }
        result.reverse();

        let total = fs.distance_from_start;
        let progress = &self.ctx.progress;
        progress.set_routing_calculated_time(progress.routing_calculated_time() + total);
        log::info!("route found: {} segments, {:.1} s", result.len(), total);
        result
    }

    fn calc_routing_time(
        parent_time: Option<f64>,
        final_id: SegmentId,
        id: SegmentId,
        s: &RouteSegment,
        res: &mut RouteSegmentResult,
    ) -> Option<f64> {
        if id == final_id {
            return parent_time;
        }
        if let Some(t) = parent_time {
            res.routing_time = t - s.distance_from_start;
        }
        Some(s.distance_from_start)
    }
}

/// Appends `res` to `result`, merging it with the last result if it continues the same road.
fn add_route_segment_to_result(
    result: &mut Vec<RouteSegmentResult>,
    res: RouteSegmentResult,
    reverse: bool,
    base: bool,
) {
    if res.start_point_index() == res.end_point_index() {
        return;
    }
    if !base {
        if let Some(last) = result.last_mut() {
            if Arc::ptr_eq(&last.object, &res.object) && combine_two_segment_result(&res, last, reverse) {
                return;
            }
        }
    }
    result.push(res);
}

fn combine_two_segment_result(
    to_add: &RouteSegmentResult,
    previous: &mut RouteSegmentResult,
    reverse: bool,
) -> bool {
    if to_add.is_forward_direction() != previous.is_forward_direction() {
        return false;
    }
    if !reverse && to_add.start_point_index() == previous.end_point_index() {
        previous.set_end_point_index(to_add.end_point_index());
    } else if reverse && to_add.end_point_index() == previous.start_point_index() {
        previous.set_start_point_index(to_add.start_point_index());
    } else {
        return false;
    }
    previous.routing_time += to_add.routing_time;
    true
}

/// Finds the fastest route between two matched route points.
/// Returns an empty vector if no route exists or the calculation was cancelled.
pub fn search_route_internal(
    ctx: &mut RoutingContext,
    start: &RouteSegmentPoint,
    end: &RouteSegmentPoint,
) -> Result<Vec<RouteSegmentResult>, Error> {
    let mut planner = BinaryRoutePlanner::new(ctx, start.precise, end.precise);
    match planner.run(start, end)? {
        Some(final_id) => Ok(planner.convert_final_segment_to_results(final_id)),
        None => Ok(Vec::new()),
    }
}

/// Records, for every point of every result, the roads crossing it.
pub fn attach_connected_roads(ctx: &mut RoutingContext, results: &mut [RouteSegmentResult]) -> Result<(), Error> {
    for res in results.iter_mut() {
        let mut pre_attached = Vec::new();
        let indices: Vec<usize> = res.point_indices().collect();
        for &j in &indices[..indices.len().saturating_sub(1)] {
            let p = res.object.points[j];
            let chain = ctx.load_route_segment(p.x, p.y)?;
            pre_attached.push(chain.roads.clone());
        }
        res.set_pre_attached_routes(pre_attached);
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::obf::road::Restriction;
    use crate::obf::AreaI;
    use crate::routing::context::tests::{context, road, BASE};
    use crate::routing::context::MemoryRouteSource;

    pub const A: i64 = 1;
    pub const B: i64 = 2;
    pub const C: i64 = 3;
    pub const D: i64 = 4;
    pub const E: i64 = 5;

    /// A square of roads: A runs east to a junction, from which B goes south
    /// and D continues east; C runs east from B's end, E joins D's end to C's end.
    pub fn square(b_oneway_north: bool, a_restrictions: Vec<Restriction>) -> MemoryRouteSource {
        let primary = [("highway", "primary")];
        let mut a = road(A, &primary, &[(0, 0), (1000, 0)]);
        a.restrictions = a_restrictions;
        let b = if b_oneway_north {
            road(B, &[("highway", "primary"), ("oneway", "yes")], &[(1000, 1000), (1000, 0)])
        } else {
            road(B, &primary, &[(1000, 0), (1000, 1000)])
        };
        let c = road(C, &primary, &[(1000, 1000), (2000, 1000)]);
        let d = road(D, &primary, &[(1000, 0), (2000, 0)]);
        let e = road(E, &primary, &[(2000, 0), (2000, 1000)]);

        let mut source = MemoryRouteSource::new();
        source.add_block(AreaI::new(BASE, BASE, BASE + 10_000, BASE + 10_000), false, vec![a, b, c, d, e]);
        source
    }

    pub fn point_on(ctx: &mut RoutingContext, id: i64, x: i32, y: i32) -> RouteSegmentPoint {
        let chain = ctx.load_tile_data(BASE + x, BASE + y, 17).unwrap();
        let road = chain.into_iter().find(|r| r.id == id).unwrap();
        RouteSegmentPoint {
            road,
            start: 1,
            precise: PointI::new(BASE + x, BASE + y),
            dist: 0.0,
            others: Vec::new(),
        }
    }

    fn route(source: MemoryRouteSource, plan: i32) -> Vec<RouteSegmentResult> {
        let mut ctx = context(source);
        ctx.config.plan_road_direction = plan;
        let start = point_on(&mut ctx, A, 500, 0);
        let end = point_on(&mut ctx, C, 1500, 1000);
        search_route_internal(&mut ctx, &start, &end).unwrap()
    }

    fn ids(results: &[RouteSegmentResult]) -> Vec<i64> {
        results.iter().map(|r| r.object.id).collect()
    }

    #[test]
    fn shortest_path_through_the_junction() {
        let results = route(square(false, Vec::new()), 0);
        assert_eq!(ids(&results), vec![A, B, C]);
        assert_eq!(results[0].start_point_index(), 0);
        assert_eq!(results[0].end_point_index(), 1);
        assert_eq!(results[2].start_point_index(), 0);
        assert_eq!(results[2].end_point_index(), 1);
    }

    #[test]
    fn one_directional_searches_agree() {
        assert_eq!(ids(&route(square(false, Vec::new()), 1)), vec![A, B, C]);
        assert_eq!(ids(&route(square(false, Vec::new()), -1)), vec![A, B, C]);
    }

    #[test]
    fn no_right_turn_is_respected() {
        let r = Restriction {
            to: B,
            via: None,
            kind: RestrictionKind::NoRightTurn,
        };
        let results = route(square(false, vec![r]), 0);
        assert_eq!(ids(&results), vec![A, D, E, C]);
        assert!(!results[3].is_forward_direction());
    }

    #[test]
    fn only_straight_on_excludes_other_exits() {
        let r = Restriction {
            to: D,
            via: None,
            kind: RestrictionKind::OnlyStraightOn,
        };
        for plan in [0, 1, -1] {
            assert_eq!(ids(&route(square(false, vec![r]), plan)), vec![A, D, E, C], "plan {plan}");
        }
    }

    fn source(roads: Vec<RouteDataObject>) -> MemoryRouteSource {
        let mut source = MemoryRouteSource::new();
        source.add_block(AreaI::new(BASE - 10_000, BASE - 10_000, BASE + 10_000, BASE + 10_000), false, roads);
        source
    }

    fn route_between(
        roads: Vec<RouteDataObject>,
        plan: i32,
        from: (i64, i32, i32),
        to: (i64, i32, i32),
    ) -> Vec<RouteSegmentResult> {
        let mut ctx = context(source(roads));
        ctx.config.plan_road_direction = plan;
        let start = point_on(&mut ctx, from.0, from.1, from.2);
        let end = point_on(&mut ctx, to.0, to.1, to.2);
        search_route_internal(&mut ctx, &start, &end).unwrap()
    }

    #[test]
    fn only_straight_on_binds_only_where_its_target_is() {
        // N's only_straight_on onto Z applies at N's eastern end;
        // leaving N westwards onto R stays allowed
        let primary = [("highway", "primary")];
        let mut n = road(1, &primary, &[(1000, 0), (2000, 0)]);
        n.restrictions = vec![Restriction {
            to: 2,
            via: None,
            kind: RestrictionKind::OnlyStraightOn,
        }];
        let z = road(2, &primary, &[(2000, 0), (3000, 0)]);
        let r = road(3, &primary, &[(1000, 0), (1000, 1000)]);

        for plan in [0, 1, -1] {
            let results = route_between(vec![n.clone(), z.clone(), r.clone()], plan, (1, 1500, 0), (3, 1000, 500));
            assert_eq!(ids(&results), vec![1, 3], "plan {plan}");
        }
    }

    /// A road D joins A's end from the north; B leads south from there to C.
    /// A carries a no_left_turn restriction onto C via B.
    fn via_network() -> Vec<RouteDataObject> {
        let primary = [("highway", "primary")];
        let mut a = road(A, &primary, &[(0, 0), (1000, 0)]);
        a.restrictions = vec![Restriction {
            to: C,
            via: Some(B),
            kind: RestrictionKind::NoLeftTurn,
        }];
        vec![
            a,
            road(B, &primary, &[(1000, 0), (1000, 1000)]),
            road(C, &primary, &[(1000, 1000), (2000, 1000)]),
            road(D, &primary, &[(1000, -1000), (1000, 0)]),
        ]
    }

    #[test]
    fn via_restriction_blocks_only_its_entry() {
        for plan in [0, 1, -1] {
            let blocked = route_between(via_network(), plan, (A, 500, 0), (C, 1500, 1000));
            assert!(blocked.is_empty(), "plan {plan}: {:?}", ids(&blocked));

            let allowed = route_between(via_network(), plan, (D, 1000, -500), (C, 1500, 1000));
            assert_eq!(ids(&allowed), vec![D, B, C], "plan {plan}");
        }
    }

    #[test]
    fn total_time_sums_roads_and_turns() {
        let mut ctx = context(square(false, Vec::new()));
        ctx.config.plan_road_direction = 1;
        let start = point_on(&mut ctx, A, 500, 0);
        let end = point_on(&mut ctx, C, 1500, 1000);
        let results = search_route_internal(&mut ctx, &start, &end).unwrap();
        assert_eq!(ids(&results), vec![A, B, C]);

        // Seeds cover whole intervals, so every road counts in full
        let router = Arc::clone(&ctx.config.router);
        let time = |r: &RouteDataObject| {
            let (p, q) = (r.points[0], r.points[1]);
            calculate_time_with_obstacles(&router, r, square_root_dist_31(p.x, p.y, q.x, q.y), 0.0)
        };
        let (a, b, c) = (results[0].object.as_ref(), results[1].object.as_ref(), results[2].object.as_ref());
        let expected = time(a)
            + router.calculate_turn_time(b, 0, 1, a, 0, 1)
            + time(b)
            + router.calculate_turn_time(c, 0, 1, b, 0, 1)
            + time(c);

        let total = ctx.progress.routing_calculated_time();
        assert!((total - expected).abs() < 1e-6, "{total} != {expected}");
    }

    #[test]
    fn one_way_roads_are_not_driven_backwards() {
        let results = route(square(true, Vec::new()), 0);
        assert_eq!(ids(&results), vec![A, D, E, C]);
    }

    #[test]
    fn disconnected_target_yields_no_route() {
        let mut source = square(false, Vec::new());
        source.add_block(
            AreaI::new(BASE + 20_000, BASE, BASE + 30_000, BASE + 10_000),
            false,
            vec![road(9, &[("highway", "primary")], &[(20_000, 0), (21_000, 0)])],
        );
        let mut ctx = context(source);
        let start = point_on(&mut ctx, A, 500, 0);
        let end = point_on(&mut ctx, 9, 20_500, 0);
        assert!(search_route_internal(&mut ctx, &start, &end).unwrap().is_empty());
        assert!(ctx.progress.segment_not_found().is_some());
    }

    #[test]
    fn connected_roads_are_attached() {
        let mut ctx = context(square(false, Vec::new()));
        let start = point_on(&mut ctx, A, 500, 0);
        let end = point_on(&mut ctx, C, 1500, 1000);
        let mut results = search_route_internal(&mut ctx, &start, &end).unwrap();
        attach_connected_roads(&mut ctx, &mut results).unwrap();

        // At B's first point: A, B and D meet
        let mut at_junction: Vec<i64> = results[1].pre_attached_routes(0).iter().map(|rp| rp.road.id).collect();
        at_junction.sort();
        assert_eq!(at_junction, vec![A, B, D]);
    }

    #[test]
    fn queue_pops_lowest_priority_first() {
        let mut heap = BinaryHeap::new();
        let mut arena = SegmentArena::default();
        let r = Arc::new(road(1, &[], &[(0, 0), (1, 0)]));
        for (i, p) in [3.0, 1.0, 2.0, 1.0].into_iter().enumerate() {
            let id = arena.push(RouteSegment::new(Arc::clone(&r), 0));
            heap.push(QueueEntry {
                from_start: p,
                to_end: 0.0,
                priority: p,
                order: i as u64,
                id,
            });
        }
        let order: Vec<u64> = std::iter::from_fn(|| heap.pop()).map(|e| e.order).collect();
        assert_eq!(order, vec![1, 3, 2, 0]);
    }
}
