// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use super::config::DEVIATION_RADIUS;
use super::context::{RouteCalculationMode, RoutingContext};
use super::precalculated::PrecalculatedRouteDirection;
use super::preparation::prepare_result;
use super::result::{RouteSegmentResult, UNMATCHED_HIGHWAY_TYPE};
use super::search::{attach_connected_roads, search_route_internal};
use super::segment::RouteSegmentPoint;
use super::turn::TurnType;
use crate::geo::{
    earth_distance, get_31_tile_number_x, get_31_tile_number_y, get_projection_point, measured_dist_31,
    square_dist_31_tile_metric,
};
use crate::obf::{PointI, RouteDataObject, RouteRules};
use crate::Error;

/// Intermediate points are snapped to the closest result segment within this distance (meters).
const INTERMEDIATE_SNAP_DISTANCE: f64 = 500.0;

/// Results past the first matching segment scanned for a closer one when snapping an
/// intermediate point.
const INTERMEDIATE_SNAP_LOOKAHEAD: usize = 15;

/// Entry point of route calculation: matches the requested points to roads,
/// searches every leg and post-processes the joined result.
#[derive(Debug, Default, Clone, Copy)]
pub struct RoutePlanner;

impl RoutePlanner {
    pub fn new() -> Self {
        Self
    }

    /// Calculates a route from `start` through `intermediates` to `end`.
    ///
    /// Returns an empty list if no route exists; `ctx.progress` then tells
    /// which point couldn't be matched to a road, if that was the reason.
    pub fn search_route(
        &self,
        ctx: &mut RoutingContext,
        start: PointI,
        end: PointI,
        intermediates: &[PointI],
        precalculated: Option<PrecalculatedRouteDirection>,
    ) -> Result<Vec<RouteSegmentResult>, Error> {
        let mut targets = Vec::with_capacity(intermediates.len() + 2);
        targets.push(start);
        targets.extend_from_slice(intermediates);
        targets.push(end);

        let mut precalculated = precalculated;
        if ctx.calculation_mode == RouteCalculationMode::Complex
            && precalculated.is_none()
            && longest_leg(&targets) > DEVIATION_RADIUS * 6.0
        {
            log::debug!("calculating a basemap route to guide the detailed search");
            let mut base = ctx.fork(RouteCalculationMode::Base);
            let base_route = self.search_route(&mut base, start, end, intermediates, None)?;
            precalculated =
                PrecalculatedRouteDirection::build(&base_route, DEVIATION_RADIUS, ctx.config.router.max_speed);
        }

        let mut points = Vec::with_capacity(targets.len());
        for (i, &p) in targets.iter().enumerate() {
            match find_route_segment(ctx, p.x, p.y)? {
                Some(rsp) => {
                    log::debug!("point {i} matched to road {}", rsp.road.id);
                    points.push(rsp);
                }
                None => {
                    log::warn!("point {i} ({p:?}) is not near any road");
                    ctx.progress.set_segment_not_found(i);
                    return Ok(Vec::new());
                }
            }
        }

        let mut result = Vec::new();
        for (i, leg_ends) in points.windows(2).enumerate() {
            let leg = self.search_leg(ctx, &leg_ends[0], &leg_ends[1], precalculated.as_ref())?;
            if leg.is_empty() {
                log::warn!("no route found for leg {i}");
                return Ok(Vec::new());
            }
            result.extend(leg);
        }

        make_start_end_points_precise(&mut result, start, end, intermediates);
        prepare_result(ctx, &mut result)?;
        ctx.unload_all_data(None);

        if !result.is_empty() {
            print_results(start, end, &result);
        }
        Ok(result)
    }

    fn search_leg(
        &self,
        ctx: &RoutingContext,
        start: &RouteSegmentPoint,
        end: &RouteSegmentPoint,
        precalculated: Option<&PrecalculatedRouteDirection>,
    ) -> Result<Vec<RouteSegmentResult>, Error> {
        let mut leg = ctx.fork(ctx.calculation_mode);
        leg.precalculated_route_direction = precalculated.cloned();
        leg.init_start_and_target_points(start.precise, end.precise);

        let mut res = search_route_internal(&mut leg, start, end)?;
        attach_connected_roads(&mut leg, &mut res)?;
        leg.unload_all_data(Some(ctx));
        Ok(res)
    }
}

fn longest_leg(points: &[PointI]) -> f64 {
    points
        .windows(2)
        .map(|w| measured_dist_31(w[0].x, w[0].y, w[1].x, w[1].y))
        .fold(0.0, f64::max)
}

/// Matches a point to the closest road, looking at the surrounding zoom-17 tile
/// (zoom-15 if that one is empty). Other nearby roads are kept as fallbacks.
pub fn find_route_segment(ctx: &mut RoutingContext, px: i32, py: i32) -> Result<Option<RouteSegmentPoint>, Error> {
    let mut roads = ctx.load_tile_data(px, py, 17)?;
    if roads.is_empty() {
        roads = ctx.load_tile_data(px, py, 15)?;
    }

    let mut candidates: Vec<RouteSegmentPoint> = roads
        .into_iter()
        .filter_map(|road| closest_interval(road, px, py))
        .collect();
    candidates.sort_by(|a, b| a.dist.total_cmp(&b.dist));

    if candidates.is_empty() {
        return Ok(None);
    }
    let mut best = candidates.remove(0);
    best.others = candidates;
    Ok(Some(best))
}

fn closest_interval(road: Arc<RouteDataObject>, px: i32, py: i32) -> Option<RouteSegmentPoint> {
    let mut best: Option<(usize, PointI, f64)> = None;
    for (j, w) in road.points.windows(2).enumerate() {
        let (x, y) = get_projection_point(px, py, w[0].x, w[0].y, w[1].x, w[1].y);
        let d = square_dist_31_tile_metric(x, y, px, py);
        if best.map_or(true, |(_, _, bd)| d < bd) {
            best = Some((j + 1, PointI::new(x, y), d));
        }
    }

    best.map(|(start, precise, dist)| RouteSegmentPoint {
        road,
        start,
        precise,
        dist,
        others: Vec::new(),
    })
}

fn project_distance(res: &RouteSegmentResult, p: PointI) -> f64 {
    let (a, b) = (res.start_point(), res.end_point());
    let (x, y) = get_projection_point(p.x, p.y, a.x, a.y, b.x, b.y);
    measured_dist_31(x, y, p.x, p.y)
}

/// Moves the start (`at_start`) or the end of `res` onto the projection of `p`,
/// inserting the projection into a copy of the road if it's closer than the current point.
fn update_result(res: &mut RouteSegmentResult, p: PointI, at_start: bool) {
    let pind = if at_start {
        res.start_point_index()
    } else {
        res.end_point_index()
    };
    let points = &res.object.points;
    let here = points[pind];
    let before = pind
        .checked_sub(1)
        .map(|i| get_projection_point(p.x, p.y, points[i].x, points[i].y, here.x, here.y));
    let after = points
        .get(pind + 1)
        .map(|n| get_projection_point(p.x, p.y, n.x, n.y, here.x, here.y));

    let dd = measured_dist_31(p.x, p.y, here.x, here.y);
    let dd_before = before.map_or(f64::INFINITY, |(x, y)| measured_dist_31(p.x, p.y, x, y));
    let dd_after = after.map_or(f64::INFINITY, |(x, y)| measured_dist_31(p.x, p.y, x, y));

    let (insert_after, (x, y)) = match (before, after) {
        (_, Some(a)) if dd_after < dd && dd_after < dd_before => (true, a),
        (Some(b), _) if dd_before < dd => (false, b),
        _ => return,
    };

    let forward = res.is_forward_direction();
    if at_start && forward {
        res.set_end_point_index(res.end_point_index() + 1);
    }
    if !at_start && !forward {
        res.set_start_point_index(res.start_point_index() + 1);
    }

    let road = Arc::make_mut(&mut res.object);
    if insert_after {
        road.insert_point(pind + 1, x, y);
        if at_start {
            res.set_start_point_index(res.start_point_index() + 1);
        } else {
            res.set_end_point_index(res.end_point_index() + 1);
        }
    } else {
        road.insert_point(pind, x, y);
    }

    // The new start is a projected point no other road crosses
    if at_start {
        res.shift_pre_attached_routes(insert_after != forward);
    }
}

fn make_start_end_points_precise(res: &mut [RouteSegmentResult], start: PointI, end: PointI, intermediates: &[PointI]) {
    let Some(last) = res.len().checked_sub(1) else {
        return;
    };
    update_result(&mut res[0], start, true);
    update_result(&mut res[last], end, false);

    let mut k = 1;
    for &p in intermediates {
        while k < res.len() {
            let mut current = project_distance(&res[k], p);
            if current < INTERMEDIATE_SNAP_DISTANCE {
                for k1 in k + 1..res.len() {
                    let c2 = project_distance(&res[k1], p);
                    if c2 < current {
                        k = k1;
                        current = c2;
                    } else if k1 - k > INTERMEDIATE_SNAP_LOOKAHEAD {
                        break;
                    }
                }
                update_result(&mut res[k], p, false);
                if k + 1 < res.len() {
                    update_result(&mut res[k + 1], p, true);
                }
                break;
            }
            k += 1;
        }
    }
}

fn print_results(start: PointI, end: PointI, result: &[RouteSegmentResult]) {
    let distance: f64 = result.iter().map(|r| r.distance).sum();
    let time: f64 = result.iter().map(|r| r.segment_time).sum();
    let routing_time: f64 = result.iter().map(|r| r.routing_time).sum();
    log::info!(
        "route {:?} -> {:?}: {:.1} m, {:.1} s (routing time {:.1} s), {} segments",
        start,
        end,
        distance,
        time,
        routing_time,
        result.len(),
    );
}

/// A single segment following `points` (latitude, longitude) in a straight
/// line, for stretches without road data.
pub fn generate_straight_line_segment(average_speed: f64, points: &[(f64, f64)]) -> Option<RouteSegmentResult> {
    if points.len() < 2 {
        return None;
    }

    let mut rules = RouteRules::new();
    let highway = rules.find_or_insert("highway", UNMATCHED_HIGHWAY_TYPE);
    let mut road = RouteDataObject::new(-1, Arc::new(rules));
    road.types = vec![highway];
    road.points = points
        .iter()
        .map(|&(lat, lon)| PointI::new(get_31_tile_number_x(lon), get_31_tile_number_y(lat)))
        .collect();

    let distance: f64 = points
        .windows(2)
        .map(|w| earth_distance(w[0].0, w[0].1, w[1].0, w[1].1))
        .sum();

    let mut segment = RouteSegmentResult::new(Arc::new(road), 0, points.len() - 1);
    segment.segment_time = distance / average_speed;
    segment.segment_speed = average_speed;
    segment.distance = distance;
    segment.turn_type = Some(TurnType::straight());
    Some(segment)
}
