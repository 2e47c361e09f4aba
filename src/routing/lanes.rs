// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Lane bitfields and `turn:lanes` interpretation.
//!
//! Every lane is a `u32`: bit 0 marks the lane as recommended ("active"),
//! bits 1-4 hold the primary turn, bits 5-9 the secondary turn and bits 10+
//! the tertiary turn, each as a raw [TurnKind] (0 meaning none).

use std::collections::BTreeSet;
use std::f64::consts::FRAC_PI_2;

use super::turn::TurnKind;
use crate::geo::align_angle_difference;
use crate::obf::RouteDataObject;

#[inline]
fn raw(t: Option<TurnKind>) -> u32 {
    t.map_or(0, TurnKind::raw)
}

#[inline]
pub fn is_active(lane: u32) -> bool {
    lane & 1 == 1
}

#[inline]
pub fn primary(lane: u32) -> Option<TurnKind> {
    TurnKind::from_raw((lane >> 1) & 15)
}

#[inline]
pub fn secondary(lane: u32) -> Option<TurnKind> {
    TurnKind::from_raw((lane >> 5) & 31)
}

#[inline]
pub fn tertiary(lane: u32) -> Option<TurnKind> {
    TurnKind::from_raw(lane >> 10)
}

/// Sets the primary turn, clearing the other turns and the active bit.
pub fn set_primary_and_reset(lanes: &mut [u32], i: usize, t: Option<TurnKind>) {
    lanes[i] = raw(t) << 1;
}

pub fn set_primary(lanes: &mut [u32], i: usize, t: Option<TurnKind>) {
    lanes[i] &= !(15 << 1);
    lanes[i] |= raw(t) << 1;
}

pub fn set_secondary(lanes: &mut [u32], i: usize, t: Option<TurnKind>) {
    lanes[i] &= !(15 << 5);
    lanes[i] |= raw(t) << 5;
}

pub fn set_tertiary(lanes: &mut [u32], i: usize, t: Option<TurnKind>) {
    lanes[i] &= !(15 << 10);
    lanes[i] |= raw(t) << 10;
}

/// Makes `t` the primary turn, moving the previous primary and secondary turns down.
pub fn set_primary_shift_others(lanes: &mut [u32], i: usize, t: TurnKind) {
    let pt = primary(lanes[i]);
    let st = secondary(lanes[i]);
    set_primary_and_reset(lanes, i, Some(t));
    set_secondary(lanes, i, pt);
    set_tertiary(lanes, i, st);
}

pub fn set_secondary_to_primary(lanes: &mut [u32], i: usize) {
    let st = secondary(lanes[i]);
    let pt = primary(lanes[i]);
    set_primary(lanes, i, st);
    set_secondary(lanes, i, pt);
}

pub fn set_tertiary_to_primary(lanes: &mut [u32], i: usize) {
    let tt = tertiary(lanes[i]);
    let pt = primary(lanes[i]);
    set_primary(lanes, i, tt);
    set_tertiary(lanes, i, pt);
}

/// All turns (primary, secondary and tertiary) of a lane.
pub fn turns(lane: u32) -> impl Iterator<Item = TurnKind> {
    [primary(lane), secondary(lane), tertiary(lane)].into_iter().flatten()
}

pub fn has_any_slight_turn_lane(lane: u32) -> bool {
    turns(lane).any(TurnKind::is_slight_turn)
}

pub fn has_any_turn_lane(lane: u32, turn: TurnKind) -> bool {
    turns(lane).any(|t| t == turn)
}

pub fn to_string(lanes: &[u32]) -> String {
    let mut s = String::new();
    for (i, &l) in lanes.iter().enumerate() {
        if i > 0 {
            s.push('|');
        }
        if is_active(l) {
            s.push('+');
        }
        s.push_str(primary(l).unwrap_or(TurnKind::C).code());
        for t in [secondary(l), tertiary(l)].into_iter().flatten() {
            s.push(',');
            s.push_str(t.code());
        }
    }
    s
}

/// Parses a `turn:lanes` value. Among the options of a lane, the one matching
/// `calc_turn` (exactly, or by side) becomes the primary turn.
pub fn calculate_raw_turn_lanes(turn_lanes: &str, calc_turn: Option<TurnKind>) -> Vec<u32> {
    let options: Vec<&str> = turn_lanes.split('|').collect();
    let mut lanes = vec![0u32; options.len()];
    for (i, lane) in options.iter().enumerate() {
        for option in lane.split(';').filter(|o| !o.is_empty()) {
            let turn = TurnKind::from_lane_tag(option);
            if primary(lanes[i]).is_none() {
                set_primary_and_reset(&mut lanes, i, Some(turn));
                continue;
            }

            let matches_calc = match calc_turn {
                Some(c) => {
                    turn == c
                        || (c.is_right_turn() && turn.is_right_turn())
                        || (c.is_left_turn() && turn.is_left_turn())
                }
                None => false,
            };
            if matches_calc {
                set_primary_shift_others(&mut lanes, i, turn);
            } else if secondary(lanes[i]).is_none() {
                set_secondary(&mut lanes, i, Some(turn));
            } else if tertiary(lanes[i]).is_none() {
                set_tertiary(&mut lanes, i, Some(turn));
            }
        }
    }
    lanes
}

/// Marks lanes with `main_turn` as their primary turn active.
/// Returns whether any lane was marked.
pub fn set_allowed_lanes(main_turn: TurnKind, lanes: &mut [u32]) -> bool {
    let mut set = false;
    for l in lanes.iter_mut() {
        if primary(*l) == Some(main_turn) {
            *l |= 1;
            set = true;
        }
    }
    set
}

/// Distinct turns available on the lanes, ordered from left to right.
///
/// With `unique_from_active`, only turns shared by all active lanes
/// and absent from inactive lanes are returned.
pub fn possible_turns(lanes: &[u32], only_primary: bool, unique_from_active: bool) -> Vec<TurnKind> {
    let lane_turns = |l: u32| -> BTreeSet<TurnKind> {
        if only_primary {
            primary(l).into_iter().collect()
        } else {
            turns(l).collect()
        }
    };

    let mut possible: BTreeSet<TurnKind> = BTreeSet::new();
    for &l in lanes {
        let u = lane_turns(l);
        if !unique_from_active {
            possible.extend(u);
        } else if is_active(l) {
            if possible.is_empty() {
                possible = u;
            } else {
                possible.retain(|t| u.contains(t));
                if possible.is_empty() {
                    break;
                }
            }
        }
    }

    if unique_from_active {
        for &l in lanes.iter().filter(|&&l| !is_active(l)) {
            for t in turns(l) {
                possible.remove(&t);
            }
        }
    }

    let mut result: Vec<TurnKind> = possible.into_iter().collect();
    result.sort_by_key(|t| t.order_from_left_to_right());
    result
}

/// Guesses the single turn the active lanes lead to.
pub fn infer_slight_turn_from_active_lanes(lanes: &[u32], most_left: bool, most_right: bool) -> Option<TurnKind> {
    let possible = possible_turns(lanes, false, true);
    match possible.len() {
        0 => None,
        1 => Some(possible[0]),
        _ if most_left && !most_right => Some(possible[0]),
        n if most_right && !most_left => Some(possible[n - 1]),
        _ => Some(possible[1]),
    }
}

/// Finds the first lane (counting from the left or the right edge) which is not
/// consumed by the `roads` diverging on that side.
pub fn find_active_index(
    raw_lanes: &[u32],
    lane_options: &[&str],
    mut lanes: i32,
    left: bool,
    lanes_info: &[Vec<u32>],
    roads: i32,
    add_roads: i32,
) -> Option<usize> {
    let mut active_start = None;
    let mut lookup_slight_turn = add_roads > 0;
    let mut added_turns = BTreeSet::new();

    // Every additional turn direction of a diverging road needs its own lanes
    let mut diff_turn_roads = roads;
    let increase_turn_roads = lanes_info
        .last()
        .map(|li| {
            let set: BTreeSet<TurnKind> = li.iter().flat_map(|&l| turns(l)).collect();
            (set.len() as i32 - 1).max(0)
        })
        .unwrap_or(0);

    for i in 0..raw_lanes.len() {
        let ind = if left { i } else { raw_lanes.len() - i - 1 };
        if !lookup_slight_turn || has_any_slight_turn_lane(raw_lanes[ind]) {
            let mut cnt = 0;
            for option in lane_options.get(ind).copied().unwrap_or("").split(';') {
                if added_turns.insert(TurnKind::from_lane_tag(option)) {
                    cnt += 1;
                    diff_turn_roads -= 1;
                }
            }
            lanes -= cnt;
            lookup_slight_turn = false;
        }

        if lanes < 0 || diff_turn_roads + increase_turn_roads < 0 {
            active_start = Some(ind);
            break;
        } else if diff_turn_roads < 0 && active_start.is_none() {
            active_start = Some(ind);
        }
    }
    active_start
}

/// `turn:lanes` of a road as driven in the direction `dir` (radians),
/// picking the forward or backward variant on two-way roads.
pub fn parse_turn_lanes(road: &RouteDataObject, dir: f64) -> Vec<u32> {
    let value = if road.oneway() == 0 {
        let cmp = road.direction_route(0, true);
        if align_angle_difference(dir - cmp).abs() < FRAC_PI_2 {
            road.value("turn:lanes:forward")
        } else {
            road.value("turn:lanes:backward")
        }
    } else {
        road.value("turn:lanes")
    };
    match value {
        Some(v) if !v.is_empty() => calculate_raw_turn_lanes(v, None),
        _ => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bitfields() {
        let mut l = vec![0u32];
        set_primary_and_reset(&mut l, 0, Some(TurnKind::TL));
        set_primary_shift_others(&mut l, 0, TurnKind::TR);
        assert_eq!(primary(l[0]), Some(TurnKind::TR));
        assert_eq!(secondary(l[0]), Some(TurnKind::TL));
        assert_eq!(tertiary(l[0]), None);
        set_secondary_to_primary(&mut l, 0);
        assert_eq!(primary(l[0]), Some(TurnKind::TL));
        assert_eq!(secondary(l[0]), Some(TurnKind::TR));
        assert!(!is_active(l[0]));
    }

    #[test]
    fn raw_lanes_prefer_calculated_turn() {
        let mut lanes = calculate_raw_turn_lanes("left|through;right|right", Some(TurnKind::TR));
        assert_eq!(to_string(&lanes), "TL|TR,C|TR");
        assert!(set_allowed_lanes(TurnKind::TR, &mut lanes));
        assert_eq!(to_string(&lanes), "TL|+TR,C|+TR");

        assert_eq!(
            possible_turns(&lanes, false, false),
            vec![TurnKind::TL, TurnKind::C, TurnKind::TR]
        );
        assert_eq!(possible_turns(&lanes, false, true), vec![TurnKind::TR]);
        assert_eq!(infer_slight_turn_from_active_lanes(&lanes, false, true), Some(TurnKind::TR));
    }

    #[test]
    fn active_index_skips_lanes_of_diverging_roads() {
        let turn_lanes = "left|through|through|right";
        let raw = calculate_raw_turn_lanes(turn_lanes, Some(TurnKind::C));
        let options: Vec<&str> = turn_lanes.split('|').collect();
        assert_eq!(find_active_index(&raw, &options, 1, false, &[], 1, 0), Some(2));
        assert_eq!(find_active_index(&raw, &options, 1, true, &[], 1, 0), Some(1));
    }
}
