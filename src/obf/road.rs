// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use super::area::{AreaI, PointI};
use crate::geo;

/// Height value of a point without elevation data.
pub const HEIGHT_UNDEFINED: f64 = -80000.0;

/// Speed assumed for `maxspeed=none`, in m/s.
pub const NONE_MAX_SPEED: f32 = 40.0;

/// Interpretation of a routing encoding rule, derived from its tag and value.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteRuleKind {
    Access,
    OneWay,
    Highway,
    MaxSpeed,
    Roundabout,
    TrafficSignals,
    RailwayCrossing,
    Lanes,
    #[default]
    Other,
}

/// One `tag=value` pair of a routing section's encoding table.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RouteRule {
    pub tag: String,
    pub value: String,
    pub kind: RouteRuleKind,
    int_value: i32,
    float_value: f32,
}

impl RouteRule {
    pub fn new(tag: &str, value: &str) -> Self {
        let value = match value {
            "true" => "yes",
            "false" => "no",
            v => v,
        };

        let mut rule = Self {
            tag: tag.to_string(),
            value: value.to_string(),
            kind: RouteRuleKind::Other,
            int_value: 0,
            float_value: 0.0,
        };

        let tag_lower = tag.to_ascii_lowercase();
        match tag_lower.as_str() {
            "oneway" => {
                rule.kind = RouteRuleKind::OneWay;
                rule.int_value = match value {
                    "-1" | "reverse" => -1,
                    "1" | "yes" => 1,
                    _ => 0,
                };
            }
            "highway" if value == "traffic_signals" => rule.kind = RouteRuleKind::TrafficSignals,
            "railway" if value == "crossing" || value == "level_crossing" => {
                rule.kind = RouteRuleKind::RailwayCrossing
            }
            "roundabout" if !value.is_empty() => rule.kind = RouteRuleKind::Roundabout,
            "junction" if value.eq_ignore_ascii_case("roundabout") => {
                rule.kind = RouteRuleKind::Roundabout
            }
            "highway" if !value.is_empty() => rule.kind = RouteRuleKind::Highway,
            t if t.starts_with("access") && !value.is_empty() => rule.kind = RouteRuleKind::Access,
            "maxspeed" if !value.is_empty() => {
                rule.kind = RouteRuleKind::MaxSpeed;
                rule.float_value = parse_speed(value, -1.0);
            }
            "lanes" if !value.is_empty() => {
                rule.kind = RouteRuleKind::Lanes;
                rule.int_value = match first_number_end_index(value) {
                    0 => -1,
                    i => value[..i].parse().unwrap_or(-1),
                };
            }
            _ => {}
        }

        rule
    }

    /// -1 for reverse one-way roads, 1 for forward one-way roads, 0 otherwise.
    #[inline]
    pub fn oneway_direction(&self) -> i32 {
        if self.kind == RouteRuleKind::OneWay {
            self.int_value
        } else {
            0
        }
    }

    #[inline]
    pub fn is_roundabout(&self) -> bool {
        self.kind == RouteRuleKind::Roundabout
    }

    /// Parsed `maxspeed` in m/s, or a negative number if unknown.
    #[inline]
    pub fn max_speed(&self) -> f32 {
        self.float_value
    }

    /// Parsed `lanes` count, or -1 if unknown.
    #[inline]
    pub fn lanes(&self) -> i32 {
        self.int_value
    }
}

/// Encoding table of a routing section, indexed by rule id.
#[derive(Debug, Default, Clone)]
pub struct RouteRules {
    rules: Vec<RouteRule>,
    pub name_rule: Option<u32>,
    pub ref_rule: Option<u32>,
    pub destination_rule: Option<u32>,
    pub destination_ref_rule: Option<u32>,
}

impl RouteRules {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a rule under the given id, growing the table as needed.
    pub fn insert(&mut self, id: u32, tag: &str, value: &str) {
        let idx = id as usize;
        if self.rules.len() <= idx {
            self.rules.resize(idx + 1, RouteRule::default());
        }
        self.rules[idx] = RouteRule::new(tag, value);

        if tag == "name" {
            self.name_rule = Some(id);
        } else if tag == "ref" {
            self.ref_rule = Some(id);
        } else if matches!(tag, "destination" | "destination:forward" | "destination:backward")
            || tag.starts_with("destination:lang:")
        {
            self.destination_rule = Some(id);
        } else if matches!(
            tag,
            "destination:ref" | "destination:ref:forward" | "destination:ref:backward"
        ) {
            self.destination_ref_rule = Some(id);
        }
    }

    #[inline]
    pub fn get(&self, id: u32) -> Option<&RouteRule> {
        self.rules.get(id as usize)
    }

    /// Iterates over all registered `(id, rule)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (u32, &RouteRule)> + '_ {
        self.rules
            .iter()
            .enumerate()
            .filter(|(_, r)| !r.tag.is_empty())
            .map(|(i, r)| (i as u32, r))
    }

    /// Looks up the id of an exact `tag=value` rule.
    pub fn find(&self, tag: &str, value: &str) -> Option<u32> {
        self.rules
            .iter()
            .position(|r| r.tag == tag && r.value == value)
            .map(|i| i as u32)
    }

    /// Returns the id of `tag=value`, adding the rule at the end of the table if absent.
    pub fn find_or_insert(&mut self, tag: &str, value: &str) -> u32 {
        match self.find(tag, value) {
            Some(id) => id,
            None => {
                let id = self.rules.len().max(1) as u32;
                self.insert(id, tag, value);
                id
            }
        }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Turn restriction type, as stored in routing data blocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RestrictionKind {
    NoRightTurn = 1,
    NoLeftTurn = 2,
    NoUTurn = 3,
    NoStraightOn = 4,
    OnlyRightTurn = 5,
    OnlyLeftTurn = 6,
    OnlyStraightOn = 7,
}

impl RestrictionKind {
    pub fn from_raw(raw: u32) -> Option<Self> {
        match raw {
            1 => Some(Self::NoRightTurn),
            2 => Some(Self::NoLeftTurn),
            3 => Some(Self::NoUTurn),
            4 => Some(Self::NoStraightOn),
            5 => Some(Self::OnlyRightTurn),
            6 => Some(Self::OnlyLeftTurn),
            7 => Some(Self::OnlyStraightOn),
            _ => None,
        }
    }

    /// Whether this is an `only_*` restriction, which forbids every other exit.
    #[inline]
    pub fn is_only(self) -> bool {
        matches!(
            self,
            Self::OnlyRightTurn | Self::OnlyLeftTurn | Self::OnlyStraightOn
        )
    }
}

/// Restriction on turning from the owning road onto `to`.
/// With `via` set, it applies when passing through the `via` road on the way to `to`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Restriction {
    pub to: i64,
    pub via: Option<i64>,
    pub kind: RestrictionKind,
}

/// A road decoded from a routing section. Immutable once decoded and shared between tiles.
#[derive(Debug, Clone)]
pub struct RouteDataObject {
    pub id: i64,
    pub rules: Arc<RouteRules>,
    pub types: Vec<u32>,
    pub points: Vec<PointI>,
    pub point_types: Vec<Vec<u32>>,

    /// Names of the road, as `(rule id, value)` pairs in file order.
    pub names: Vec<(u32, String)>,

    /// Names attached to single points, as `(point index, rule id, value)`.
    pub point_names: Vec<(usize, u32, String)>,
    pub restrictions: Vec<Restriction>,
}

impl RouteDataObject {
    pub fn new(id: i64, rules: Arc<RouteRules>) -> Self {
        Self {
            id,
            rules,
            types: Vec::new(),
            points: Vec::new(),
            point_types: Vec::new(),
            names: Vec::new(),
            point_names: Vec::new(),
            restrictions: Vec::new(),
        }
    }

    #[inline]
    pub fn point_count(&self) -> usize {
        self.points.len()
    }

    #[inline]
    pub fn x(&self, i: usize) -> i32 {
        self.points[i].x
    }

    #[inline]
    pub fn y(&self, i: usize) -> i32 {
        self.points[i].y
    }

    pub fn bbox(&self) -> AreaI {
        let mut points = self.points.iter();
        let Some(first) = points.next() else {
            return AreaI::default();
        };
        let mut area = AreaI::new(first.x, first.y, first.x, first.y);
        for p in points {
            area.enlarge_to_include_point(p.x, p.y);
        }
        area
    }

    fn type_rules(&self) -> impl Iterator<Item = &RouteRule> + '_ {
        self.types.iter().filter_map(|&t| self.rules.get(t))
    }

    /// Value of the first type rule with the given tag.
    pub fn value(&self, tag: &str) -> Option<&str> {
        self.type_rules()
            .find(|r| r.tag == tag)
            .map(|r| r.value.as_str())
    }

    pub fn has_type(&self, tag: &str, value: &str) -> bool {
        self.type_rules().any(|r| r.tag == tag && r.value == value)
    }

    /// Value of the `highway` tag, or an empty string.
    pub fn highway(&self) -> &str {
        self.type_rules()
            .find(|r| r.kind == RouteRuleKind::Highway)
            .map(|r| r.value.as_str())
            .unwrap_or("")
    }

    pub fn name(&self) -> &str {
        self.name_by_rule(self.rules.name_rule)
            .or_else(|| self.names.first().map(|(_, n)| n.as_str()))
            .unwrap_or("")
    }

    pub fn reference(&self) -> &str {
        self.name_by_rule(self.rules.ref_rule).unwrap_or("")
    }

    pub fn destination(&self) -> &str {
        self.name_by_rule(self.rules.destination_rule).unwrap_or("")
    }

    fn name_by_rule(&self, rule: Option<u32>) -> Option<&str> {
        let rule = rule?;
        self.names
            .iter()
            .find(|(r, _)| *r == rule)
            .map(|(_, n)| n.as_str())
    }

    /// One-way flag: 1 (forward only), -1 (backward only) or 0 (both directions).
    /// Roundabouts without an explicit flag are forward-only.
    pub fn oneway(&self) -> i32 {
        for r in self.type_rules() {
            if r.oneway_direction() != 0 {
                return r.oneway_direction();
            } else if r.is_roundabout() {
                return 1;
            }
        }
        0
    }

    pub fn is_loop(&self) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => self.points.len() > 1 && a == b,
            _ => false,
        }
    }

    pub fn is_roundabout(&self) -> bool {
        self.type_rules().any(|r| {
            r.is_roundabout()
                || r.value == "roundabout"
                || (r.kind == RouteRuleKind::OneWay && r.value != "no" && self.is_loop())
        })
    }

    pub fn is_tunnel(&self) -> bool {
        self.type_rules()
            .any(|r| (r.tag == "tunnel" && r.value == "yes") || (r.tag == "layer" && r.value == "-1"))
    }

    /// Whether the road was marked as deleted by a live update.
    pub fn is_road_deleted(&self) -> bool {
        self.has_type("osmand_change", "delete")
    }

    /// Maximum speed in m/s, or 0 if unknown.
    pub fn maximum_speed(&self) -> f32 {
        self.type_rules()
            .find(|r| r.kind == RouteRuleKind::MaxSpeed)
            .map(|r| r.max_speed().max(0.0))
            .unwrap_or(0.0)
    }

    /// Number of lanes, or -1 if unknown.
    pub fn lanes(&self) -> i32 {
        self.type_rules()
            .find(|r| r.kind == RouteRuleKind::Lanes)
            .map(|r| r.lanes())
            .unwrap_or(-1)
    }

    /// Rule ids attached to a specific point.
    pub fn point_types(&self, i: usize) -> &[u32] {
        self.point_types.get(i).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn point_rules(&self, i: usize) -> impl Iterator<Item = &RouteRule> + '_ {
        self.point_types(i).iter().filter_map(|&t| self.rules.get(t))
    }

    pub fn has_point_type(&self, i: usize, tag: &str, value: &str) -> bool {
        self.point_rules(i).any(|r| r.tag == tag && r.value == value)
    }

    pub fn remove_point_type(&mut self, i: usize, rule: u32) {
        if let Some(types) = self.point_types.get_mut(i) {
            types.retain(|&t| t != rule);
        }
    }

    /// Inserts a new point before position `at`, keeping per-point data aligned.
    pub fn insert_point(&mut self, at: usize, x: i32, y: i32) {
        self.points.insert(at, PointI::new(x, y));
        if at < self.point_types.len() {
            self.point_types.insert(at, Vec::new());
        }
        for (i, _, _) in &mut self.point_names {
            if *i >= at {
                *i += 1;
            }
        }
    }

    /// Direction of the road from `start` (east of north, in radians within `(-π, π]`),
    /// measured towards the point at least `dist` tile-metric meters away.
    pub fn direction_route_dist(&self, start: usize, plus: bool, dist: f64) -> f64 {
        let x = self.x(start);
        let y = self.y(start);
        let mut nx = start;
        let (mut px, mut py) = (x, y);
        let mut total = 0.0;

        loop {
            if plus {
                nx += 1;
                if nx >= self.point_count() {
                    break;
                }
            } else {
                if nx == 0 {
                    break;
                }
                nx -= 1;
            }
            px = self.x(nx);
            py = self.y(nx);
            total += (px as f64 - x as f64).abs() * 0.011 + (py as f64 - y as f64).abs() * 0.01863;
            if total >= dist {
                break;
            }
        }

        -((x as f64 - px as f64).atan2(y as f64 - py as f64))
    }

    /// [RouteDataObject::direction_route_dist] with the default 5 meter look-ahead.
    #[inline]
    pub fn direction_route(&self, start: usize, plus: bool) -> f64 {
        self.direction_route_dist(start, plus, 5.0)
    }

    /// Haversine length of the road between two point indices, in meters.
    pub fn distance(&self, start: usize, end: usize) -> f64 {
        let (lo, hi) = if start <= end { (start, end) } else { (end, start) };
        (lo..hi)
            .map(|i| geo::measured_dist_31(self.x(i), self.y(i), self.x(i + 1), self.y(i + 1)))
            .sum()
    }

    /// Interleaved `[distance from previous point, height]` pairs for every point,
    /// computed from `osmand_ele_*` tags. Empty if the road has no elevation data.
    pub fn calculate_height_array(&self) -> Vec<f64> {
        let Some(start) = self.value("osmand_ele_start").and_then(|s| s.parse::<f64>().ok()) else {
            return Vec::new();
        };
        let start_height = start.trunc();
        let end_height = self
            .value("osmand_ele_end")
            .and_then(|s| s.parse::<f64>().ok())
            .map(f64::trunc)
            .unwrap_or(start_height);

        let n = self.point_count();
        let mut arr = vec![0.0; 2 * n];
        if n == 0 {
            return arr;
        }
        arr[1] = start_height;
        let mut prev_height = start_height;

        for k in 1..n {
            let dd = geo::measured_dist_31(self.x(k - 1), self.y(k - 1), self.x(k), self.y(k));
            let height = if k == n - 1 {
                end_height
            } else {
                self.point_rules(k)
                    .find_map(|r| {
                        let v: f64 = r.value.parse().ok()?;
                        match r.tag.as_str() {
                            "osmand_ele_asc" => Some(prev_height + v),
                            "osmand_ele_desc" => Some(prev_height - v),
                            _ => None,
                        }
                    })
                    .unwrap_or(HEIGHT_UNDEFINED)
            };

            arr[2 * k] = dd;
            arr[2 * k + 1] = height;

            if height != HEIGHT_UNDEFINED {
                // Interpolate preceding points without height
                let mut total = dd;
                let mut first_undefined = k;
                while first_undefined > 1 && arr[2 * (first_undefined - 1) + 1] == HEIGHT_UNDEFINED {
                    first_undefined -= 1;
                    total += arr[2 * first_undefined];
                }
                if total > 0.0 {
                    let angle = (height - prev_height) / total;
                    for j in first_undefined..k {
                        arr[2 * j + 1] = arr[2 * j] * angle + arr[2 * j - 1];
                    }
                }
                prev_height = height;
            }
        }

        arr
    }

    /// Rough memory footprint used by the routing context's budget.
    pub fn estimated_size(&self) -> usize {
        std::mem::size_of::<Self>()
            + self.points.capacity() * std::mem::size_of::<PointI>()
            + self.types.capacity() * 4
            + self.point_types.iter().map(|t| t.capacity() * 4 + 24).sum::<usize>()
            + self.names.iter().map(|(_, n)| n.capacity() + 32).sum::<usize>()
            + self.restrictions.capacity() * std::mem::size_of::<Restriction>()
    }
}

/// Parses a speed like `50`, `30 mph` or `none` into m/s.
pub fn parse_speed(v: &str, default: f32) -> f32 {
    if v == "none" {
        return NONE_MAX_SPEED;
    }
    match first_number_end_index(v) {
        0 => default,
        i => match v[..i].parse::<f32>() {
            Ok(f) if v.contains("mph") => f / 3.6 * 1.6,
            Ok(f) => f / 3.6,
            Err(_) => default,
        },
    }
}

/// Parses a length like `3.5` or `12 ft` into meters.
pub fn parse_length(v: &str, default: f32) -> f32 {
    match first_number_end_index(v) {
        0 => default,
        i => match v[..i].parse::<f32>() {
            Ok(f) if v.contains('"') || v.contains("ft") => f * 0.3048,
            Ok(f) => f,
            Err(_) => default,
        },
    }
}

/// Parses a weight like `7.5` or `3000 lbs` into metric tons.
pub fn parse_weight_in_ton(v: &str, default: f32) -> f32 {
    match first_number_end_index(v) {
        0 => default,
        i => match v[..i].parse::<f32>() {
            Ok(f) if v.contains('"') || v.contains("lbs") => f * 0.4535 / 1000.0,
            Ok(f) => f,
            Err(_) => default,
        },
    }
}

/// Length of the leading decimal number (digits with at most one dot).
pub fn first_number_end_index(v: &str) -> usize {
    let mut seen_dot = false;
    for (i, c) in v.char_indices() {
        match c {
            '0'..='9' => {}
            '.' if !seen_dot && i > 0 => seen_dot = true,
            _ => return i,
        }
    }
    v.len()
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    macro_rules! assert_almost_eq {
        ($a:expr, $b:expr, $eps:expr) => {
            assert!((($a - $b).abs() < $eps), "assertion failed: {} ≈ {}", $a, $b)
        };
    }

    pub fn rules(pairs: &[(&str, &str)]) -> Arc<RouteRules> {
        let mut r = RouteRules::new();
        for (i, (tag, value)) in pairs.iter().enumerate() {
            r.insert(i as u32 + 1, tag, value);
        }
        Arc::new(r)
    }

    fn road(types: &[u32], rules: Arc<RouteRules>, points: &[(i32, i32)]) -> RouteDataObject {
        let mut r = RouteDataObject::new(1, rules);
        r.types = types.to_vec();
        r.points = points.iter().map(|&(x, y)| PointI::new(x, y)).collect();
        r
    }

    #[test]
    fn rule_classification() {
        assert_eq!(RouteRule::new("oneway", "-1").oneway_direction(), -1);
        assert_eq!(RouteRule::new("oneway", "true").oneway_direction(), 1);
        assert_eq!(RouteRule::new("oneway", "true").value, "yes");
        assert_eq!(RouteRule::new("oneway", "no").oneway_direction(), 0);
        assert_eq!(
            RouteRule::new("highway", "traffic_signals").kind,
            RouteRuleKind::TrafficSignals
        );
        assert_eq!(RouteRule::new("highway", "primary").kind, RouteRuleKind::Highway);
        assert_eq!(RouteRule::new("junction", "roundabout").kind, RouteRuleKind::Roundabout);
        assert_eq!(RouteRule::new("access:hgv", "no").kind, RouteRuleKind::Access);
        assert_eq!(RouteRule::new("lanes", "3").lanes(), 3);
        assert_almost_eq!(RouteRule::new("maxspeed", "36").max_speed(), 10.0, 1e-5);
        assert_eq!(RouteRule::new("railway", "level_crossing").kind, RouteRuleKind::RailwayCrossing);
    }

    #[test]
    fn speed_and_length_parsing() {
        assert_almost_eq!(parse_speed("72", 0.0), 20.0, 1e-5);
        assert_almost_eq!(parse_speed("none", 0.0), NONE_MAX_SPEED, 1e-5);
        assert_almost_eq!(parse_speed("signals", -1.0), -1.0, 1e-5);
        assert_almost_eq!(parse_length("10 ft", 0.0), 3.048, 1e-4);
        assert_almost_eq!(parse_length("2.5", 0.0), 2.5, 1e-6);
        assert_almost_eq!(parse_weight_in_ton("7.5", 0.0), 7.5, 1e-6);
        assert_eq!(first_number_end_index("12.5t"), 4);
    }

    #[test]
    fn road_attributes() {
        let rules = rules(&[
            ("highway", "residential"),
            ("oneway", "yes"),
            ("lanes", "2"),
            ("maxspeed", "50"),
            ("name", "Main"),
        ]);
        let mut r = road(&[1, 2, 3, 4], rules, &[(0, 0), (100, 0), (200, 0)]);
        r.names.push((5, "Main Street".into()));
        assert_eq!(r.highway(), "residential");
        assert_eq!(r.oneway(), 1);
        assert_eq!(r.lanes(), 2);
        assert_almost_eq!(r.maximum_speed(), 50.0 / 3.6, 1e-4);
        assert_eq!(r.name(), "Main Street");
        assert!(!r.is_roundabout());
        assert!(!r.is_loop());
    }

    #[test]
    fn closed_oneway_is_roundabout() {
        let rules = rules(&[("highway", "primary"), ("oneway", "yes")]);
        let r = road(&[1, 2], rules, &[(0, 0), (100, 0), (100, 100), (0, 0)]);
        assert!(r.is_loop());
        assert!(r.is_roundabout());
    }

    #[test]
    fn direction_route_east_and_north() {
        let r = road(&[], rules(&[]), &[(0, 1000), (1000, 1000), (1000, 0)]);
        // Eastwards: 90° east of north
        assert_almost_eq!(r.direction_route(0, true), std::f64::consts::FRAC_PI_2, 1e-9);
        // Northwards (y decreases)
        assert_almost_eq!(r.direction_route(1, true).abs(), 0.0, 1e-9);
        // Back west from the middle point
        assert_almost_eq!(r.direction_route(1, false), -std::f64::consts::FRAC_PI_2, 1e-9);
    }

    #[test]
    fn height_array_interpolates() {
        let rules = rules(&[("osmand_ele_start", "100"), ("osmand_ele_end", "130")]);
        let r = road(&[1, 2], rules, &[(0, 0), (10_000, 0), (20_000, 0)]);
        let h = r.calculate_height_array();
        assert_eq!(h.len(), 6);
        assert_almost_eq!(h[1], 100.0, 1e-9);
        assert_almost_eq!(h[5], 130.0, 1e-9);
        // The middle point sits halfway
        assert_almost_eq!(h[3], 115.0, 0.1);
    }

    #[test]
    fn restriction_kinds() {
        assert_eq!(RestrictionKind::from_raw(2), Some(RestrictionKind::NoLeftTurn));
        assert!(RestrictionKind::OnlyStraightOn.is_only());
        assert!(!RestrictionKind::NoUTurn.is_only());
        assert_eq!(RestrictionKind::from_raw(9), None);
    }
}
