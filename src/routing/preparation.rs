// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Post-processing of raw search results: area shortcuts, splitting roads
//! at decision points, attaching side roads, timing and turn guidance.

use std::collections::BTreeSet;
use std::sync::Arc;

use super::context::RoutingContext;
use super::lanes;
use super::result::{RouteSegmentResult, DIST_BEARING_DETECT, DIST_BEARING_DETECT_UNMATCHED, UNMATCHED_HIGHWAY_TYPE};
use super::router::{GeneralRouter, RouterProfile};
use super::segment::RoadPoint;
use super::turn::{classify_turn, TurnKind, TurnType, TURN_DEGREE_MIN};
use crate::geo::{degrees_diff, lines_intersect, measured_dist_31, ray_intersect_x, square_root_dist_31};
use crate::obf::{PointI, RouteDataObject};
use crate::Error;

const MAX_SPEAK_PRIORITY: i32 = 5;
const UNMATCHED_TURN_DEGREE_MINIMUM: f64 = 45.0;
const SPLIT_TURN_DEGREE_NOT_STRAIGHT: f64 = 100.0;

/// Extra seconds per meter of ascent for pedestrians (Naismith's rule):
/// six minutes per 100 meters.
const NAISMITH_SECONDS_PER_METER: f64 = 3.6;

/// Runs the whole preparation pipeline over the results of a route search.
pub fn prepare_result(ctx: &mut RoutingContext, result: &mut Vec<RouteSegmentResult>) -> Result<(), Error> {
    let router = Arc::clone(&ctx.config.router);
    combine_way_points_for_area_routing(&router, result);
    validate_all_points_connected(result);
    split_roads_and_attach_road_segments(ctx, result)?;
    for seg in result.iter_mut() {
        filter_minor_stops(seg);
    }
    calculate_time_speed(&router, result);

    if ctx.progress.is_cancelled() {
        return Ok(());
    }
    prepare_turn_results(ctx.left_side_navigation, result);
    Ok(())
}

fn is_motorway(s: &RouteSegmentResult) -> bool {
    matches!(s.object.highway(), "motorway" | "motorway_link" | "trunk" | "trunk_link")
}

// Area routing

#[derive(Debug, Clone, Copy)]
struct AreaPoint {
    x: i32,
    y: i32,
    original_index: usize,
}

/// Whether the straight line from `p` to `n` stays inside the polygon, without
/// crossing any of its edges.
fn segment_line_belongs_to_polygon(p: &AreaPoint, n: &AreaPoint, original_way: &[AreaPoint]) -> bool {
    let mut intersections = 0;
    let mx = p.x / 2 + n.x / 2;
    let my = p.y / 2 + n.y / 2;
    for i in 1..original_way.len() {
        let p2 = &original_way[i - 1];
        let n2 = &original_way[i];
        let touches = |a: &AreaPoint| a.original_index == i || a.original_index == i - 1;
        if !touches(p)
            && !touches(n)
            && lines_intersect(
                p.x as f64, p.y as f64, n.x as f64, n.y as f64, p2.x as f64, p2.y as f64, n2.x as f64, n2.y as f64,
            )
        {
            return false;
        }
        if let Some(fx) = ray_intersect_x(p2.x, p2.y, n2.x, n2.y, my) {
            if mx >= fx {
                intersections += 1;
            }
        }
    }
    intersections % 2 == 1
}

/// Repeatedly replaces the longest run of points with a straight line lying
/// inside the polygon.
fn simplify_area_route_way(route_way: &mut Vec<AreaPoint>, original_way: &[AreaPoint]) {
    loop {
        let mut connect: Option<(usize, usize)> = None;
        let mut dist = 0.0;
        let mut length = route_way.len().saturating_sub(1);
        while length > 0 && connect.is_none() {
            for i in 0..route_way.len() - length {
                let p = &route_way[i];
                let n = &route_way[i + length];
                if segment_line_belongs_to_polygon(p, n, original_way) {
                    let d = square_root_dist_31(p.x, p.y, n.x, n.y);
                    if d > dist {
                        dist = d;
                        connect = Some((i, length));
                    }
                }
            }
            length -= 1;
        }

        match connect {
            Some((start, len)) if len > 1 => {
                route_way.drain(start + 1..start + len);
            }
            _ => break,
        }
    }
}

fn combine_way_points_for_area_routing(router: &GeneralRouter, result: &mut [RouteSegmentResult]) {
    for rsr in result.iter_mut() {
        let obj = &rsr.object;
        if !obj.is_loop() || !router.is_area(obj) {
            continue;
        }

        let (start, end) = (rsr.start_point_index(), rsr.end_point_index());
        let mut original_way = Vec::with_capacity(obj.points.len());
        let mut route_way = Vec::new();
        for (j, p) in obj.points.iter().enumerate() {
            let pnt = AreaPoint {
                x: p.x,
                y: p.y,
                original_index: j,
            };
            original_way.push(pnt);
            if j >= start && j <= end {
                route_way.push(pnt);
            } else if j <= start && j >= end {
                route_way.insert(0, pnt);
            }
        }

        let original_size = route_way.len();
        simplify_area_route_way(&mut route_way, &original_way);
        if route_way.len() == original_size {
            continue;
        }

        let mut trimmed = RouteDataObject::clone(obj);
        trimmed.points = route_way.iter().map(|p| PointI::new(p.x, p.y)).collect();
        trimmed.restrictions.clear();
        trimmed.point_types.clear();
        trimmed.point_names.clear();
        log::debug!(
            "area road {} shortcut from {} to {} points",
            trimmed.id,
            original_size,
            route_way.len()
        );
        *rsr = RouteSegmentResult::new(Arc::new(trimmed), 0, route_way.len() - 1);
    }
}

// Connectivity

fn validate_all_points_connected(result: &[RouteSegmentResult]) {
    for w in result.windows(2) {
        let (pr, rr) = (&w[0], &w[1]);
        let a = pr.end_point();
        let b = rr.start_point();
        let d = measured_dist_31(a.x, a.y, b.x, b.y);
        if d > 0.0 {
            log::error!(
                "points are not connected: road {} ({}) -> road {} ({}), {:.2} meters",
                pr.object.id,
                pr.end_point_index(),
                rr.object.id,
                rr.start_point_index(),
                d,
            );
        }
    }
}

// Splitting and attaching side roads

/// Adds a side road starting at `rp` to `attached`, in every direction it may be driven,
/// skipping ways which overlap the route.
fn attach_segments(
    router: &GeneralRouter,
    rp: &RoadPoint,
    road: &RouteDataObject,
    previous_road_id: i64,
    prev_l: Option<PointI>,
    next_l: Option<PointI>,
    attached: &mut Vec<RouteSegmentResult>,
) {
    if rp.road.id == road.id || rp.road.id == previous_road_id {
        return;
    }
    let add_road = &rp.road;
    let len = add_road.points.len();
    let one_way = router.is_one_way(add_road);
    let overlaps = |p: PointI| Some(p) == next_l || Some(p) == prev_l;

    if one_way >= 0 && rp.point + 1 < len && !overlaps(add_road.points[rp.point + 1]) {
        attached.push(RouteSegmentResult::new(Arc::clone(add_road), rp.point, len - 1));
    }
    if one_way <= 0 && rp.point > 0 && !overlaps(add_road.points[rp.point - 1]) {
        attached.push(RouteSegmentResult::new(Arc::clone(add_road), rp.point, 0));
    }
}

fn attach_road_segments(
    ctx: &mut RoutingContext,
    result: &mut [RouteSegmentResult],
    route_ind: usize,
    point_ind: usize,
) -> Result<(), Error> {
    let rr = &result[route_ind];
    let road = Arc::clone(&rr.object);
    let next_l = road.points.get(point_ind + 1).copied();
    let prev_l = point_ind.checked_sub(1).map(|i| road.points[i]);

    let mut attached = Vec::new();
    let mut previous_road_id = road.id;
    if point_ind == rr.start_point_index() && route_ind > 0 {
        let prev = &result[route_ind - 1];
        previous_road_id = prev.object.id;
        if previous_road_id != road.id {
            // The continuation of the previous road past the junction
            let (s, e) = (prev.start_point_index(), prev.end_point_index());
            let last = prev.object.points.len() - 1;
            if s < e && e < last {
                attached.push(RouteSegmentResult::new(Arc::clone(&prev.object), e, last));
            } else if s > e && e > 0 {
                attached.push(RouteSegmentResult::new(Arc::clone(&prev.object), e, 0));
            }
        }
    }

    let pre_attached = result[route_ind].pre_attached_routes(point_ind).to_vec();
    let candidates = if pre_attached.is_empty() {
        let p = road.points[point_ind];
        ctx.load_route_segment(p.x, p.y)?.roads.clone()
    } else {
        pre_attached
    };

    let router = Arc::clone(&ctx.config.router);
    for rp in &candidates {
        attach_segments(&router, rp, &road, previous_road_id, prev_l, next_l, &mut attached);
    }

    let rr = &mut result[route_ind];
    for a in attached {
        rr.attach_route(point_ind, a);
    }
    Ok(())
}

/// Splits results at points where a driver faces a decision, attaching
/// the side roads of every point on the way.
fn split_roads_and_attach_road_segments(
    ctx: &mut RoutingContext,
    result: &mut Vec<RouteSegmentResult>,
) -> Result<(), Error> {
    let mut i = 0;
    while i < result.len() {
        let plus = result[i].is_forward_direction();
        let unmatched = result[i].object.highway() == UNMATCHED_HIGHWAY_TYPE;
        let mut j = result[i].start_point_index();

        while j != result[i].end_point_index() {
            let next = if plus { j + 1 } else { j - 1 };
            if j == result[i].start_point_index() {
                attach_road_segments(ctx, result, i, j)?;
            }
            if next != result[i].end_point_index() {
                attach_road_segments(ctx, result, i, next)?;
            }

            let rr = &result[i];
            // A zero-length step is handled together with the next point
            let try_to_split =
                next != rr.end_point_index() && !rr.object.is_roundabout() && rr.distance_at(next, plus) != 0.0;

            if try_to_split {
                let dist_bearing = if unmatched {
                    DIST_BEARING_DETECT_UNMATCHED
                } else {
                    DIST_BEARING_DETECT
                };

                // Avoid small zigzags
                let mut before = rr.bearing_end_at(next, dist_bearing);
                let mut after = rr.bearing_begin_at(next, dist_bearing);
                if rr.distance_at(next, plus) < dist_bearing {
                    after = before;
                } else if rr.distance_at(next, !plus) < dist_bearing {
                    before = after;
                }

                let cont_angle = degrees_diff(before, after).abs();
                let straight = cont_angle < TURN_DEGREE_MIN;
                let mut is_split = unmatched && cont_angle >= UNMATCHED_TURN_DEGREE_MINIMUM;
                for rs in rr.attached_routes(next) {
                    let diff = degrees_diff(before, rs.bearing_begin()).abs();
                    if diff <= TURN_DEGREE_MIN || (!straight && diff < SPLIT_TURN_DEGREE_NOT_STRAIGHT) {
                        is_split = true;
                    }
                }

                if is_split {
                    let mut split = RouteSegmentResult::new(Arc::clone(&rr.object), next, rr.end_point_index());
                    split.copy_pre_attached_routes(rr, next.abs_diff(rr.start_point_index()));
                    result[i].set_end_point_index(next);
                    result.insert(i + 1, split);
                    i += 1;
                }
            }
            j = next;
        }
        i += 1;
    }
    Ok(())
}

// Stops

/// How much a road of the given class deserves an announcement; lower is more important.
pub fn highway_speak_priority(highway: &str) -> i32 {
    if highway.is_empty()
        || highway.ends_with("track")
        || highway.ends_with("services")
        || highway.ends_with("service")
        || highway.ends_with("path")
    {
        MAX_SPEAK_PRIORITY
    } else if highway.ends_with("_link")
        || highway.ends_with("unclassified")
        || highway.ends_with("road")
        || highway.ends_with("living_street")
        || highway.ends_with("residential")
        || highway.ends_with("tertiary")
    {
        1
    } else {
        0
    }
}

/// Drops stop signs marked as minor where the segment meets a less important road.
fn filter_minor_stops(seg: &mut RouteSegmentResult) {
    let rules = &seg.object.rules;
    let (Some(stop_minor), Some(stop_sign)) = (rules.find("stop", "minor"), rules.find("highway", "stop")) else {
        return;
    };

    let stops: Vec<usize> = seg
        .point_indices()
        .filter(|&i| i != seg.end_point_index() && seg.object.point_types(i).contains(&stop_minor))
        .collect();

    let seg_priority = highway_speak_priority(seg.object.highway());
    for stop in stops {
        let superseded = seg
            .attached_routes(stop)
            .iter()
            .any(|a| seg_priority < highway_speak_priority(a.object.highway()));
        if superseded {
            Arc::make_mut(&mut seg.object).remove_point_type(stop, stop_sign);
        }
    }
}

// Time and speed

fn calculate_time_speed(router: &GeneralRouter, result: &mut [RouteSegmentResult]) {
    let use_pedestrian_height = router.profile == RouterProfile::Pedestrian && router.height_obstacles;

    for rr in result.iter_mut() {
        let road = Arc::clone(&rr.object);
        let mut speed = router.define_vehicle_speed(&road);
        if speed == 0.0 {
            speed = router.default_speed;
        } else if speed > 15.0 {
            // Slow down proportionally above 15 m/s: 30 m/s becomes 28 m/s
            speed -= (speed / 15.0 - 1.0) * 2.0;
        }

        let plus = rr.is_forward_direction();
        let heights = if use_pedestrian_height {
            road.calculate_height_array()
        } else {
            Vec::new()
        };

        let mut time = 0.0;
        let mut distance = 0.0;
        let indices: Vec<usize> = rr.point_indices().collect();
        for w in indices.windows(2) {
            let (j, next) = (w[0], w[1]);
            let (a, b) = (road.points[j], road.points[next]);
            let d = measured_dist_31(a.x, a.y, b.x, b.y);
            distance += d;
            let obstacle = router.define_obstacle(&road, j, plus).max(0.0);
            time += d / speed + obstacle;

            if let (Some(&from), Some(&to)) = (heights.get(2 * j + 1), heights.get(2 * next + 1)) {
                if to > from {
                    time += (to - from) * NAISMITH_SECONDS_PER_METER;
                }
            }
        }

        rr.segment_time = time;
        rr.segment_speed = speed;
        rr.distance = distance;
    }
}

// Turns

fn prepare_turn_results(left_side: bool, result: &mut [RouteSegmentResult]) {
    for i in 0..result.len() {
        result[i].turn_type = get_turn_info(result, i, left_side);
    }
    determine_turns_to_merge(result);
    ignore_preceding_straights_on_same_intersection(result);
    justify_u_turns(result);
    add_turn_info_descriptions(result);
}

fn get_turn_info(result: &[RouteSegmentResult], i: usize, left_side: bool) -> Option<TurnType> {
    if i == 0 {
        return Some(TurnType::straight());
    }
    let prev = &result[i - 1];
    if prev.object.is_roundabout() {
        // Covered by the turn at the roundabout entrance
        return None;
    }
    let rr = &result[i];
    if rr.object.is_roundabout() {
        return Some(process_roundabout_turn(result, i, left_side));
    }

    let bearing_dist = if rr.object.highway() == UNMATCHED_HIGHWAY_TYPE {
        DIST_BEARING_DETECT_UNMATCHED
    } else {
        DIST_BEARING_DETECT
    };
    let mpi = degrees_diff(
        prev.bearing_end_at(prev.end_point_index(), bearing_dist),
        rr.bearing_begin_at(rr.start_point_index(), bearing_dist),
    );

    let mut t = match classify_turn(mpi, left_side) {
        Some(kind) => {
            let mut t = TurnType::value_of(kind, left_side);
            t.lanes = turn_lanes_info(prev, t.value);
            Some(t)
        }
        None => attach_keep_left_info_and_lanes(left_side, prev, rr),
    };
    if let Some(t) = &mut t {
        t.turn_angle = -mpi;
    }
    t
}

/// Collapses consecutive roundabout segments into a single "take the n-th exit" turn.
fn process_roundabout_turn(result: &[RouteSegmentResult], i: usize, left_side: bool) -> TurnType {
    let prev = &result[i - 1];
    let mut exit = 1;
    let mut last = i;
    let mut last_roundabout = i;
    for (j, rnext) in result.iter().enumerate().skip(i) {
        last = j;
        if !rnext.object.is_roundabout() {
            break;
        }
        last_roundabout = j;
        for k in rnext.point_indices() {
            if k != rnext.end_point_index() && !rnext.attached_routes(k).is_empty() {
                exit += 1;
            }
        }
    }

    let mut t = TurnType::exit_turn(exit, 0.0, left_side);
    // Usually covers more than expected
    let based_on_out_roads = degrees_diff(result[last].bearing_begin(), prev.bearing_end());
    // Usually covers less than expected
    let based_on_circle = -degrees_diff(result[i].bearing_begin(), result[last_roundabout].bearing_end() + 180.0);
    t.turn_angle = if (based_on_out_roads - based_on_circle).abs() > 180.0 {
        based_on_circle
    } else {
        (based_on_circle + based_on_out_roads) / 2.0
    };
    t
}

/// `turn:lanes` of the road in the driving direction of `segment`.
fn turn_lanes_string(segment: &RouteSegmentResult) -> String {
    let tag = if segment.object.oneway() != 0 {
        "turn:lanes"
    } else if segment.is_forward_direction() {
        "turn:lanes:forward"
    } else {
        "turn:lanes:backward"
    };
    segment.object.value(tag).unwrap_or("").to_string()
}

/// Lanes of `prev` with those leading to `main_turn` marked active.
fn turn_lanes_info(prev: &RouteSegmentResult, main_turn: TurnKind) -> Vec<u32> {
    let turn_lanes = turn_lanes_string(prev);
    let mut lanes_array = if turn_lanes.is_empty() {
        // Carry over the active lanes of a short preceding segment
        match &prev.turn_type {
            Some(tt) if !tt.lanes.is_empty() && prev.distance < 100.0 => {
                tt.lanes
                    .iter()
                    .filter(|&&l| lanes::is_active(l))
                    .map(|&l| (l >> 1) << 1)
                    .collect()
            }
            _ => return Vec::new(),
        }
    } else {
        lanes::calculate_raw_turn_lanes(&turn_lanes, Some(main_turn))
    };

    if !lanes::set_allowed_lanes(main_turn, &mut lanes_array) && !lanes_array.is_empty() {
        // The outermost lane may be used for the turn without being tagged so
        let left = main_turn.is_left_turn();
        let ind = if left { 0 } else { lanes_array.len() - 1 };
        let mut primary = lanes::primary(lanes_array[ind]);
        let secondary = lanes::secondary(lanes_array[ind]);
        let (fits, forced) = if left {
            (primary.is_some_and(TurnKind::is_left_turn), TurnKind::TL)
        } else {
            (primary.is_some_and(TurnKind::is_right_turn), TurnKind::TR)
        };
        if !fits {
            lanes::set_primary_and_reset(&mut lanes_array, ind, Some(forced));
            lanes::set_secondary(&mut lanes_array, ind, primary);
            lanes::set_tertiary(&mut lanes_array, ind, secondary);
            primary = Some(forced);
            lanes_array[ind] |= 1;
        }
        if let Some(p) = primary {
            lanes::set_allowed_lanes(p, &mut lanes_array);
        }
    }
    lanes_array
}

/// Number of lanes (at least 1) of a side road in its driving direction.
fn count_lanes_min_one(attached: &RouteSegmentResult) -> i32 {
    let obj = &attached.object;
    let lns = obj.lanes();
    if lns <= 0 {
        let tls = turn_lanes_string(attached);
        if !tls.is_empty() {
            return tls.split('|').count() as i32;
        }
    }
    if obj.oneway() != 0 {
        return lns.max(1);
    }

    let directional = if attached.is_forward_direction() {
        obj.value("lanes:forward")
    } else {
        obj.value("lanes:backward")
    };
    if let Some(v) = directional.and_then(|v| v.trim().parse::<i32>().ok()) {
        return v;
    }
    ((lns + 1) / 2).max(1)
}

#[derive(Debug, Default)]
struct RoadSplitStructure {
    keep_left: bool,
    keep_right: bool,
    speak: bool,
    left_lanes_info: Vec<Vec<u32>>,
    left_lanes: i32,
    right_lanes_info: Vec<Vec<u32>>,
    right_lanes: i32,
    roads_on_left: i32,
    add_roads_on_left: i32,
    roads_on_right: i32,
    add_roads_on_right: i32,
}

fn calculate_road_split_structure(
    prev: &RouteSegmentResult,
    current: &RouteSegmentResult,
    attached_routes: &[RouteSegmentResult],
) -> RoadSplitStructure {
    let mut rs = RoadSplitStructure::default();
    let speak_priority = highway_speak_priority(prev.object.highway()).max(highway_speak_priority(current.object.highway()));

    for attached in attached_routes {
        let restricted = prev
            .object
            .restrictions
            .iter()
            .any(|r| r.to == attached.object.id && !r.kind.is_only());
        if restricted {
            continue;
        }

        let ex = degrees_diff(attached.bearing_begin(), current.bearing_begin());
        let mpi = degrees_diff(prev.bearing_end(), attached.bearing_begin()).abs();
        let rs_speak_priority = highway_speak_priority(attached.object.highway());
        let lanes = count_lanes_min_one(attached);
        let turn_lanes = lanes::parse_turn_lanes(&attached.object, attached.bearing_begin().to_radians());
        let small_straight_variation = mpi < TURN_DEGREE_MIN;
        let small_target_variation = ex.abs() < TURN_DEGREE_MIN;
        let on_the_right = ex >= 0.0;

        if on_the_right {
            rs.roads_on_right += 1;
        } else {
            rs.roads_on_left += 1;
        }

        if rs_speak_priority != MAX_SPEAK_PRIORITY || speak_priority == MAX_SPEAK_PRIORITY {
            if small_target_variation || small_straight_variation {
                if on_the_right {
                    rs.keep_left = true;
                    rs.right_lanes += lanes;
                    if !turn_lanes.is_empty() {
                        rs.right_lanes_info.push(turn_lanes);
                    }
                } else {
                    rs.keep_right = true;
                    rs.left_lanes += lanes;
                    if !turn_lanes.is_empty() {
                        rs.left_lanes_info.push(turn_lanes);
                    }
                }
                rs.speak = rs.speak || rs_speak_priority <= speak_priority;
            } else if on_the_right {
                rs.add_roads_on_right += 1;
            } else {
                rs.add_roads_on_left += 1;
            }
        }
    }
    rs
}

fn create_simple_keep_left_right_turn(
    left_side: bool,
    prev: &RouteSegmentResult,
    current: &RouteSegmentResult,
    rs: &mut RoadSplitStructure,
) -> Option<TurnType> {
    let deviation = degrees_diff(prev.bearing_end(), current.bearing_begin()).abs();
    let make_slight_turn = deviation > 5.0 && (!is_motorway(prev) || !is_motorway(current));

    let (kind, lane_type) = if rs.keep_left && rs.keep_right {
        (TurnKind::C, TurnKind::C)
    } else if rs.keep_left {
        if make_slight_turn {
            (TurnKind::TSLL, TurnKind::TSLL)
        } else {
            (TurnKind::KL, TurnKind::C)
        }
    } else if rs.keep_right {
        if make_slight_turn {
            (TurnKind::TSLR, TurnKind::TSLR)
        } else {
            (TurnKind::KR, TurnKind::C)
        }
    } else {
        return None;
    };

    let current_lanes = count_lanes_min_one(current);
    let total = current_lanes + rs.left_lanes + rs.right_lanes;
    let lane_bits: Vec<u32> = (0..total)
        .map(|it| {
            if it < rs.left_lanes || it >= rs.left_lanes + current_lanes {
                TurnKind::C.raw() << 1
            } else {
                (lane_type.raw() << 1) | 1
            }
        })
        .collect();

    if current_lanes <= rs.left_lanes + rs.right_lanes && (rs.left_lanes > 1 || rs.right_lanes > 1) {
        rs.speak = true;
    }

    let mut t = TurnType::value_of(kind, left_side);
    t.skip_to_speak = !rs.speak;
    t.lanes = lane_bits;
    Some(t)
}

fn create_keep_left_right_turn_based_on_turn_types(
    rs: &mut RoadSplitStructure,
    prev: &RouteSegmentResult,
    current: &RouteSegmentResult,
    turn_lanes: &str,
    left_side: bool,
) -> Option<TurnType> {
    // Maybe going straight at a 90-degree intersection
    let mut t = TurnType::value_of(TurnKind::C, left_side);
    let mut raw_lanes = lanes::calculate_raw_turn_lanes(turn_lanes, Some(TurnKind::C));
    let mut possibly_left_turn = rs.roads_on_left == 0;
    let mut possibly_right_turn = rs.roads_on_right == 0;
    for &l in &raw_lanes {
        if lanes::has_any_turn_lane(l, TurnKind::TU) {
            possibly_left_turn = true;
        }
        if lanes::has_any_turn_lane(l, TurnKind::TRU) {
            possibly_right_turn = true;
        }
    }

    if rs.keep_left || rs.keep_right {
        let options: Vec<&str> = turn_lanes.split('|').collect();
        let begin = lanes::find_active_index(
            &raw_lanes,
            &options,
            rs.left_lanes,
            true,
            &rs.left_lanes_info,
            rs.roads_on_left,
            rs.add_roads_on_left,
        );
        let end = lanes::find_active_index(
            &raw_lanes,
            &options,
            rs.right_lanes,
            false,
            &rs.right_lanes_info,
            rs.roads_on_right,
            rs.add_roads_on_right,
        );
        let (begin, end) = match (begin, end) {
            (Some(b), Some(e)) if b <= e => (b, e),
            _ => return create_simple_keep_left_right_turn(left_side, prev, current, rs),
        };

        for lane in &mut raw_lanes[begin..=end] {
            *lane |= 1;
        }

        let tp = lanes::infer_slight_turn_from_active_lanes(&raw_lanes, rs.keep_left, rs.keep_right);
        if let Some(tp) = tp {
            // Other lanes with the same turn are active as well
            for k in 0..raw_lanes.len() {
                if lanes::secondary(raw_lanes[k]) == Some(tp) {
                    lanes::set_secondary_to_primary(&mut raw_lanes, k);
                    raw_lanes[k] |= 1;
                } else if lanes::primary(raw_lanes[k]) == Some(tp) {
                    raw_lanes[k] |= 1;
                }
            }
        }

        match tp {
            Some(tp) if tp != t.value => t = TurnType::value_of(tp, left_side),
            _ => {
                let edge = if rs.keep_right && lanes::secondary(raw_lanes[end]).is_none() {
                    Some(end)
                } else if rs.keep_left && lanes::secondary(raw_lanes[begin]).is_none() {
                    Some(begin)
                } else {
                    None
                };
                if let Some(kind) = edge.and_then(|e| lanes::primary(raw_lanes[e])) {
                    t = TurnType::value_of(kind, left_side);
                }
            }
        }
    } else {
        // Going straight: find the lanes which lead straight on
        let possible = lanes::possible_turns(&raw_lanes, false, false);
        let mut tp = TurnKind::C;
        if possible.len() == 1 {
            tp = possible[0];
        } else if possible.len() == 3 && (!possibly_left_turn || !possibly_right_turn) && possible[1].is_slight_turn() {
            tp = possible[1];
            t = TurnType::value_of(tp, left_side);
        }

        for k in 0..raw_lanes.len() {
            let turn = lanes::primary(raw_lanes[k]);
            let sturn = lanes::secondary(raw_lanes[k]);
            let tturn = lanes::tertiary(raw_lanes[k]);
            let possible_side = |t: Option<TurnKind>| {
                t.is_some_and(|t| (t.is_right_turn() && possibly_right_turn) || (t.is_left_turn() && possibly_left_turn))
            };

            // Lanes which may still turn are resolved when merging with the next turn
            let active = if possible_side(sturn) {
                lanes::set_secondary_to_primary(&mut raw_lanes, k);
                true
            } else if possible_side(tturn) {
                lanes::set_tertiary_to_primary(&mut raw_lanes, k);
                true
            } else {
                possible_side(turn) || turn == Some(tp)
            };
            if active {
                raw_lanes[k] |= 1;
            }
        }
    }

    t.skip_to_speak = !rs.speak;
    t.lanes = raw_lanes;
    t.possibly_left_turn = possibly_left_turn;
    t.possibly_right_turn = possibly_right_turn;
    Some(t)
}

/// Keep-left/right guidance for a junction without a significant bearing change.
fn attach_keep_left_info_and_lanes(
    left_side: bool,
    prev: &RouteSegmentResult,
    current: &RouteSegmentResult,
) -> Option<TurnType> {
    let attached_routes = current.attached_routes(current.start_point_index());
    if attached_routes.is_empty() {
        return None;
    }

    let mut rs = calculate_road_split_structure(prev, current, attached_routes);
    if rs.roads_on_left + rs.roads_on_right == 0 {
        return None;
    }

    let turn_lanes = turn_lanes_string(prev);
    if !turn_lanes.is_empty() {
        create_keep_left_right_turn_based_on_turn_types(&mut rs, prev, current, &turn_lanes, left_side)
    } else if rs.keep_left || rs.keep_right {
        create_simple_keep_left_right_turn(left_side, prev, current, &mut rs)
    } else {
        None
    }
}

// Lane merging

/// Active lane range of a turn.
struct MergeTurnLaneTurn {
    original_lanes: Vec<u32>,
    disabled_lanes: Vec<u32>,
    active_start_index: i32,
    active_end_index: i32,
    active_len: i32,
}

impl MergeTurnLaneTurn {
    fn new(turn: Option<&TurnType>) -> Self {
        let original_lanes = turn.map(|t| t.lanes.clone()).unwrap_or_default();
        let mut m = Self {
            disabled_lanes: original_lanes.iter().map(|&l| l & !1).collect(),
            original_lanes,
            active_start_index: -1,
            active_end_index: -1,
            active_len: 0,
        };
        for (i, &l) in m.original_lanes.iter().enumerate() {
            if lanes::is_active(l) {
                if m.active_start_index == -1 {
                    m.active_start_index = i as i32;
                }
                m.active_end_index = i as i32;
                m.active_len += 1;
            }
        }
        m
    }

    fn is_active_turn_most_left(&self) -> bool {
        self.active_start_index == 0
    }

    fn is_active_turn_most_right(&self) -> bool {
        self.active_end_index == self.original_lanes.len() as i32 - 1
    }
}

/// Narrows the active lanes of `current` to the ones leading to the active lanes of `next`.
fn merge_turn_lanes(current: &mut RouteSegmentResult, next: &RouteSegmentResult) -> bool {
    let mut active = MergeTurnLaneTurn::new(current.turn_type.as_ref());
    let target = MergeTurnLaneTurn::new(next.turn_type.as_ref());
    if active.active_len < 2 || target.active_start_index == -1 {
        return false;
    }

    let mut changed = false;
    if target.is_active_turn_most_left() {
        // Only the leftmost lanes stay enabled
        if target.active_len < active.active_len {
            active.active_end_index -= active.active_len - target.active_len;
            changed = true;
        }
    } else if target.is_active_turn_most_right() {
        if target.active_len < active.active_len {
            active.active_start_index += active.active_len - target.active_len;
            changed = true;
        }
    } else if target.active_len < active.active_len {
        // The next turn goes through: drop the outer lanes
        if target.original_lanes.len() as i32 == active.active_len {
            active.active_end_index = active.active_start_index + target.active_end_index;
            active.active_start_index += target.active_start_index;
            changed = true;
        } else {
            let mut straight_len = 0;
            let mut straight_begin = -1;
            for i in active.active_start_index..=active.active_end_index {
                if lanes::has_any_turn_lane(active.original_lanes[i as usize], TurnKind::C) {
                    straight_len += 1;
                    if straight_begin == -1 {
                        straight_begin = i;
                    }
                }
            }
            if straight_begin != -1 && straight_len <= target.active_len {
                active.active_start_index = straight_begin;
                active.active_end_index = straight_begin + straight_len - 1;
            } else {
                if active.active_start_index == 0 {
                    active.active_start_index += 1;
                    active.active_len -= 1;
                }
                if active.active_end_index == active.original_lanes.len() as i32 - 1 {
                    active.active_end_index -= 1;
                    active.active_len -= 1;
                }
                let ratio = (active.active_len - target.active_len) as f64 / 2.0;
                if ratio > 0.0 {
                    active.active_end_index = (active.active_end_index as f64 - ratio).ceil() as i32;
                    active.active_start_index = (active.active_start_index as f64 + ratio).floor() as i32;
                }
            }
            changed = true;
        }
    }
    if !changed {
        return false;
    }

    for (i, lane) in active.disabled_lanes.iter_mut().enumerate() {
        let i32_i = i as i32;
        if i32_i >= active.active_start_index
            && i32_i <= active.active_end_index
            && lanes::is_active(active.original_lanes[i])
        {
            *lane |= 1;
        }
    }
    if let Some(t) = current.turn_type.as_mut() {
        t.lanes = active.disabled_lanes;
    }
    true
}

/// Makes the turn shared by all active lanes (or the one matching the next turn) primary,
/// disabling the lanes without it.
fn infer_common_active_lane(current: &mut TurnType, next: &TurnType) {
    let turn_set: BTreeSet<TurnKind> = current
        .lanes
        .iter()
        .filter(|&&l| lanes::is_active(l))
        .flat_map(|&l| lanes::turns(l))
        .collect();

    let mut single_turn = None;
    if turn_set.len() == 1 {
        single_turn = turn_set.first().copied();
    } else if current.go_ahead() && turn_set.contains(&next.value) {
        let common = next.active_common_lane_turn();
        if current.possibly_left_turn && next.value.is_left_turn() {
            single_turn = Some(next.value);
        } else if current.possibly_left_turn && common.is_some_and(TurnKind::is_left_turn) {
            single_turn = common;
        } else if current.possibly_right_turn && next.value.is_right_turn() {
            single_turn = Some(next.value);
        } else if current.possibly_right_turn && common.is_some_and(TurnKind::is_right_turn) {
            single_turn = common;
        }
    }

    let single_turn = match single_turn {
        Some(t) => t,
        None if matches!(current.value, TurnKind::KL | TurnKind::KR) => return,
        None => current.value,
    };

    let bits = &mut current.lanes;
    for i in 0..bits.len() {
        let l = bits[i];
        if !lanes::is_active(l) || lanes::primary(l) == Some(single_turn) {
            continue;
        }
        let primary = lanes::primary(l);
        if lanes::secondary(l) == Some(single_turn) {
            lanes::set_secondary(bits, i, primary);
            lanes::set_primary(bits, i, Some(single_turn));
        } else if lanes::tertiary(l) == Some(single_turn) {
            lanes::set_tertiary(bits, i, primary);
            lanes::set_primary(bits, i, Some(single_turn));
        } else {
            bits[i] &= !1;
        }
    }
}

/// Moves `kind` to the primary position of every lane having it, disabling the other lanes.
fn infer_active_turn_lanes_from_turn(tt: &mut TurnType, kind: TurnKind) {
    let found = tt.value == kind && tt.lanes.iter().any(|&l| lanes::has_any_turn_lane(l, kind));
    if !found {
        return;
    }
    let bits = &mut tt.lanes;
    for i in 0..bits.len() {
        let l = bits[i];
        let primary = lanes::primary(l);
        if primary == Some(kind) {
            continue;
        }
        if lanes::secondary(l) == Some(kind) {
            lanes::set_secondary(bits, i, primary);
            lanes::set_primary(bits, i, Some(kind));
        } else if lanes::tertiary(l) == Some(kind) {
            lanes::set_tertiary(bits, i, primary);
            lanes::set_primary(bits, i, Some(kind));
        } else {
            bits[i] = l & !1;
        }
    }
}

fn determine_turns_to_merge(result: &mut [RouteSegmentResult]) {
    let mut next_segment: Option<usize> = None;
    let mut dist = 0.0;
    for i in (0..result.len()).rev() {
        dist += result[i].distance;
        let has_lanes = result[i].turn_type.as_ref().is_some_and(|t| !t.lanes.is_empty());
        if !has_lanes {
            continue;
        }

        let mut merged = false;
        if let Some(n) = next_segment {
            let hw = result[i].object.highway();
            let merge_distance = if hw.starts_with("trunk") || hw.starts_with("motorway") {
                400.0
            } else {
                200.0
            };
            if dist < merge_distance {
                let (head, tail) = result.split_at_mut(n);
                let current = &mut head[i];
                let next = &tail[0];
                merge_turn_lanes(current, next);

                if let Some(tt) = &current.turn_type {
                    let possible = lanes::possible_turns(&tt.lanes, true, true);
                    if possible.len() == 1 {
                        let mut nt = TurnType::value_of(possible[0], tt.is_left_side());
                        nt.lanes = tt.lanes.clone();
                        nt.skip_to_speak = tt.skip_to_speak;
                        current.turn_type = Some(nt);
                    }
                }
                if let (Some(ct), Some(nt)) = (current.turn_type.as_mut(), next.turn_type.as_ref()) {
                    infer_common_active_lane(ct, nt);
                }
                merged = true;
            }
        }
        if !merged {
            if let Some(tt) = result[i].turn_type.as_mut() {
                let kind = tt.value;
                infer_active_turn_lanes_from_turn(tt, kind);
            }
        }
        next_segment = Some(i);
        dist = 0.0;
    }
}

/// Silences "go straight" announcements closely followed by a real turn,
/// as both likely belong to the same intersection.
fn ignore_preceding_straights_on_same_intersection(result: &mut [RouteSegmentResult]) {
    let mut next_segment: Option<usize> = None;
    let mut distance_to_next_turn: Option<f64> = None;
    for i in (0..result.len()).rev() {
        if let Some(n) = next_segment {
            let next = &result[n];
            let real_turn = next.turn_type.as_ref().is_some_and(|t| t.value != TurnKind::C);
            if real_turn && !is_motorway(next) && distance_to_next_turn.is_none() {
                distance_to_next_turn = Some(0.0);
            }
        }

        let current = &mut result[i];
        if let Some(d) = distance_to_next_turn.as_mut() {
            *d += current.distance;
        }
        let straight = current.turn_type.as_ref().is_some_and(|t| t.value == TurnKind::C);
        match (straight, distance_to_next_turn) {
            (true, Some(d)) if d <= 100.0 => {
                if let Some(t) = current.turn_type.as_mut() {
                    t.skip_to_speak = true;
                }
            }
            _ => {
                next_segment = Some(i);
                distance_to_next_turn = None;
            }
        }
    }
}

/// Name of the road of result `i`, or of its neighbour (next with `dir`, previous otherwise).
fn street_name(result: &[RouteSegmentResult], i: usize, dir: bool) -> &str {
    let nm = result[i].object.name();
    if !nm.is_empty() {
        return nm;
    }
    if !dir {
        i.checked_sub(1).map_or("", |p| result[p].object.name())
    } else {
        result.get(i + 1).map_or("", |n| n.object.name())
    }
}

/// Replaces two opposite turns in quick succession between the carriageways
/// of a divided road with a single U-turn.
fn justify_u_turn(result: &mut [RouteSegmentResult], i: usize) -> Option<TurnType> {
    let t = result[i].turn_type.as_ref()?;
    let tl = t.value.is_left_turn_no_u_turn();
    let tr = t.value.is_right_turn_no_u_turn();
    if !(tl || tr) || result[i + 1].turn_type.is_none() || result[i].distance >= 50.0 {
        return None;
    }

    let u_turn = degrees_diff(result[i - 1].bearing_end(), result[i + 1].bearing_begin());
    let ut = u_turn.abs() >= 120.0
        && result[i - 1].object.oneway() != 0
        && result[i + 1].object.oneway() != 0
        && street_name(result, i - 1, false) == street_name(result, i + 1, true);
    if !ut {
        return None;
    }

    let lanes = t.lanes.clone();
    let next = result[i + 1].turn_type.as_mut()?;
    next.skip_to_speak = true;
    let left_side = if tl && next.value.is_left_turn_no_u_turn() {
        false
    } else if tr && next.value.is_right_turn_no_u_turn() {
        true
    } else {
        return None;
    };
    let mut tt = TurnType::value_of(TurnKind::TU, left_side);
    tt.lanes = lanes;
    Some(tt)
}

fn justify_u_turns(result: &mut [RouteSegmentResult]) {
    let mut i = 1;
    while i + 1 < result.len() {
        match justify_u_turn(result, i) {
            Some(jt) => {
                result[i].turn_type = Some(jt);
                i += 2;
            }
            None => i += 1,
        }
    }
}

fn add_turn_info_descriptions(result: &mut [RouteSegmentResult]) {
    let mut prev_segment: Option<usize> = None;
    let mut dist = 0.0;
    for i in 0..=result.len() {
        if i == result.len() || result[i].turn_type.is_some() {
            if let Some(p) = prev_segment {
                if let Some(turn) = &result[p].turn_type {
                    let prefix = if turn.skip_to_speak { "-*" } else { "" };
                    result[p].description = format!("{prefix}{turn} and go {dist:.2} meters");
                }
            }
            prev_segment = Some(i);
            dist = 0.0;
        }
        if let Some(r) = result.get(i) {
            dist += r.distance;
        }
    }
}
