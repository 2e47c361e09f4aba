// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::f64::consts::PI;

use crate::geo::align_angle_difference;
use crate::obf::road::{parse_length, parse_speed, parse_weight_in_ton, first_number_end_index};
use crate::obf::{RouteDataObject, RouteRule, RouteRuleKind};

/// Speed (in m/s) used as the upper bound when the shortest route is requested.
const CAR_SHORTEST_DEFAULT_SPEED: f64 = 55.0 / 3.6;

pub const USE_SHORTEST_WAY: &str = "short_way";
pub const USE_HEIGHT_OBSTACLES: &str = "height_obstacles";
pub const ALLOW_PRIVATE: &str = "allow_private";
pub const DEFAULT_SPEED: &str = "default_speed";
pub const MIN_SPEED: &str = "min_speed";
pub const MAX_SPEED: &str = "max_speed";

/// Kind of traveller a [GeneralRouter] describes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouterProfile {
    #[default]
    Car,
    Pedestrian,
    Bicycle,
    Boat,
    PublicTransport,
}

impl RouterProfile {
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "car" => Some(Self::Car),
            "pedestrian" => Some(Self::Pedestrian),
            "bicycle" => Some(Self::Bicycle),
            "boat" => Some(Self::Boat),
            "public_transport" => Some(Self::PublicTransport),
            _ => None,
        }
    }
}

/// Property of a road (or of a road point) computed by a router's rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteAttribute {
    Speed,
    Priority,
    Access,
    ObstacleTime,
    Obstacle,
    OneWay,
    PenaltyTransition,
    ObstacleSrtmAltSpeed,
    Area,
}

impl RouteAttribute {
    pub const COUNT: usize = 9;

    pub fn from_name(name: &str) -> Option<Self> {
        match name {
            "speed" => Some(Self::Speed),
            "priority" => Some(Self::Priority),
            "access" => Some(Self::Access),
            "obstacle_time" => Some(Self::ObstacleTime),
            "obstacle" => Some(Self::Obstacle),
            "oneway" => Some(Self::OneWay),
            "penalty_transition" => Some(Self::PenaltyTransition),
            "obstacle_srtm_alt_speed" => Some(Self::ObstacleSrtmAltSpeed),
            "area" => Some(Self::Area),
            _ => None,
        }
    }

    #[inline]
    fn index(self) -> usize {
        self as usize
    }
}

/// Parses a numeric rule value. `value_type` selects the unit conversion:
/// `speed` (to m/s), `weight` (to tons), `length` (to meters) or a plain number.
pub fn parse_value(value: &str, value_type: &str) -> Option<f64> {
    let v = match value_type {
        "speed" => parse_speed(value, -1.0),
        "weight" => parse_weight_in_ton(value, -1.0),
        "length" => parse_length(value, -1.0),
        _ => {
            // Plain numbers may be negative
            let (sign, digits) = match value.strip_prefix('-') {
                Some(rest) => (-1.0, rest),
                None => (1.0, value),
            };
            return match first_number_end_index(digits) {
                0 => None,
                i => digits[..i].parse::<f64>().ok().map(|f| sign * f),
            };
        }
    };
    if v == -1.0 {
        None
    } else {
        Some(v as f64)
    }
}

/// Operand of a rule: a constant, a `$tag` lookup, a `:param` lookup or the `:incline` variable.
#[derive(Debug, Clone, PartialEq)]
enum Operand {
    Missing,
    Number(f64),
    Tag(String),
    Param(String),
    Incline,
}

impl Operand {
    fn parse(value: &str, value_type: &str) -> Self {
        if value == ":incline" {
            Self::Incline
        } else if let Some(tag) = value.strip_prefix('$') {
            Self::Tag(tag.to_string())
        } else if let Some(param) = value.strip_prefix(':') {
            Self::Param(param.to_string())
        } else {
            parse_value(value, value_type).map_or(Self::Missing, Self::Number)
        }
    }

    fn eval(&self, env: &Env<'_>, value_type: &str) -> Option<f64> {
        match self {
            Self::Missing => None,
            Self::Number(n) => Some(*n),
            Self::Incline => Some(env.incline),
            Self::Tag(tag) => env
                .types
                .iter()
                .find(|r| r.tag == *tag)
                .and_then(|r| parse_value(&r.value, value_type)),
            Self::Param(p) => env.params.get(p).and_then(|v| parse_value(v, value_type)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Comparison {
    /// `value1 <= value2`
    LessOrEqual,

    /// `value1 >= value2`
    GreaterOrEqual,

    Equal,
}

#[derive(Debug, Clone, PartialEq)]
struct Expression {
    comparison: Comparison,
    operands: [Operand; 2],
    value_type: String,
}

impl Expression {
    fn matches(&self, env: &Env<'_>) -> bool {
        let (Some(a), Some(b)) = (
            self.operands[0].eval(env, &self.value_type),
            self.operands[1].eval(env, &self.value_type),
        ) else {
            return false;
        };
        match self.comparison {
            Comparison::LessOrEqual => a <= b,
            Comparison::GreaterOrEqual => a >= b,
            Comparison::Equal => a == b,
        }
    }
}

/// Set of things a rule is evaluated against.
struct Env<'a> {
    types: &'a [&'a RouteRule],
    params: &'a HashMap<String, String>,
    incline: f64,
}

impl Env<'_> {
    fn has(&self, tag: &str, value: &str) -> bool {
        self.types.iter().any(|r| r.tag == tag && r.value == value)
    }

    fn has_tag(&self, tag: &str) -> bool {
        self.types.iter().any(|r| r.tag == tag)
    }

    fn param_set(&self, name: &str) -> bool {
        self.params.get(name).is_some_and(|v| v != "false")
    }
}

/// A single `select` rule: returns its value if all of its conditions match.
#[derive(Debug, Clone, PartialEq)]
pub struct EvalRule {
    select: Operand,
    select_type: String,
    params: Vec<(String, bool)>,
    tags: Vec<(String, String, bool)>,
    only_tags: Vec<(String, bool)>,
    expressions: Vec<Expression>,
}

impl EvalRule {
    pub fn select(value: &str, value_type: &str) -> Self {
        Self {
            select: Operand::parse(value, value_type),
            select_type: value_type.to_string(),
            params: Vec::new(),
            tags: Vec::new(),
            only_tags: Vec::new(),
            expressions: Vec::new(),
        }
    }

    /// Requires (or with `negated`, forbids) a `tag=value` type on the road.
    /// An empty `value` matches any value of the tag.
    pub fn add_tag_condition(&mut self, tag: &str, value: &str, negated: bool) {
        if value.is_empty() {
            self.only_tags.push((tag.to_string(), negated));
        } else {
            self.tags.push((tag.to_string(), value.to_string(), negated));
        }
    }

    /// Requires (or with `negated`, forbids) a routing parameter to be set.
    /// A leading `-` in the name also negates the condition.
    pub fn add_param_condition(&mut self, param: &str, negated: bool) {
        match param.strip_prefix('-') {
            Some(p) => self.params.push((p.to_string(), !negated)),
            None => self.params.push((param.to_string(), negated)),
        }
    }

    pub fn add_expression(&mut self, comparison: Comparison, value1: &str, value2: &str, value_type: &str) {
        self.expressions.push(Expression {
            comparison,
            operands: [
                Operand::parse(value1, value_type),
                Operand::parse(value2, value_type),
            ],
            value_type: value_type.to_string(),
        });
    }

    pub fn with_tag(mut self, tag: &str, value: &str) -> Self {
        self.add_tag_condition(tag, value, false);
        self
    }

    pub fn without_tag(mut self, tag: &str, value: &str) -> Self {
        self.add_tag_condition(tag, value, true);
        self
    }

    pub fn with_param(mut self, param: &str) -> Self {
        self.add_param_condition(param, false);
        self
    }

    pub fn with_expression(mut self, comparison: Comparison, value1: &str, value2: &str) -> Self {
        let value_type = self.select_type.clone();
        self.add_expression(comparison, value1, value2, &value_type);
        self
    }

    fn matches(&self, env: &Env<'_>) -> bool {
        self.params.iter().all(|(p, neg)| env.param_set(p) != *neg)
            && self.tags.iter().all(|(t, v, neg)| env.has(t, v) != *neg)
            && self.only_tags.iter().all(|(t, neg)| env.has_tag(t) != *neg)
            && self.expressions.iter().all(|e| e.matches(env))
    }

    fn eval(&self, env: &Env<'_>) -> Option<f64> {
        if self.matches(env) {
            self.select.eval(env, &self.select_type)
        } else {
            None
        }
    }
}

/// Ordered list of rules for one [RouteAttribute]; the first rule producing a value wins.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AttributeContext {
    rules: Vec<EvalRule>,
}

impl AttributeContext {
    pub fn push(&mut self, rule: EvalRule) {
        self.rules.push(rule);
    }

    pub fn last_rule_mut(&mut self) -> Option<&mut EvalRule> {
        self.rules.last_mut()
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    fn evaluate(&self, env: &Env<'_>) -> Option<f64> {
        self.rules.iter().find_map(|r| r.eval(env))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParameterKind {
    Boolean,
    Numeric,
}

/// User-facing switch of a routing profile, like "avoid motorways".
#[derive(Debug, Clone, PartialEq)]
pub struct RoutingParameter {
    pub id: String,
    pub name: String,
    pub description: String,
    pub kind: ParameterKind,
    pub default_bool: bool,
    pub possible_values: Vec<f64>,
}

/// Rule-driven description of how a traveller uses roads: which roads are
/// accessible, how fast they are traversed, and what slows the traveller down.
#[derive(Debug, Clone)]
pub struct GeneralRouter {
    pub profile: RouterProfile,
    attributes: HashMap<String, String>,
    contexts: Vec<AttributeContext>,
    parameters: Vec<RoutingParameter>,
    params: HashMap<String, String>,

    pub restrictions_aware: bool,
    pub height_obstacles: bool,
    pub sharp_turn: f64,
    pub slight_turn: f64,
    pub roundabout_turn: f64,

    /// Speeds in m/s.
    pub min_speed: f64,
    pub default_speed: f64,
    pub max_speed: f64,
    pub max_vehicle_speed: f64,

    pub shortest_route: bool,
    pub allow_private: bool,
    pub impassable_road_ids: HashSet<i64>,
}

impl Default for GeneralRouter {
    fn default() -> Self {
        Self::new(RouterProfile::Car, &[])
    }
}

impl GeneralRouter {
    pub fn new(profile: RouterProfile, attributes: &[(&str, &str)]) -> Self {
        let mut r = Self {
            profile,
            attributes: HashMap::new(),
            contexts: vec![AttributeContext::default(); RouteAttribute::COUNT],
            parameters: Vec::new(),
            params: HashMap::new(),
            restrictions_aware: true,
            height_obstacles: false,
            sharp_turn: 0.0,
            slight_turn: 0.0,
            roundabout_turn: 0.0,
            min_speed: 0.28,
            default_speed: 1.0,
            max_speed: 10.0,
            max_vehicle_speed: 10.0,
            shortest_route: false,
            allow_private: false,
            impassable_road_ids: HashSet::new(),
        };
        for (k, v) in attributes {
            r.add_attribute(k, v);
        }
        r
    }

    /// Sets a router attribute. Speed attributes are given in km/h.
    pub fn add_attribute(&mut self, key: &str, value: &str) {
        self.attributes.insert(key.to_string(), value.to_string());
        let float = |def: f64| match value.parse::<f64>() {
            Ok(f) => f,
            Err(_) => {
                log::warn!("router attribute {key}={value:?} is not a number");
                def
            }
        };
        match key {
            "restrictionsAware" => self.restrictions_aware = value == "true",
            "heightObstacles" => self.height_obstacles = value == "true",
            "sharpTurn" | "leftTurn" => self.sharp_turn = float(self.sharp_turn),
            "slightTurn" | "rightTurn" => self.slight_turn = float(self.slight_turn),
            "roundaboutTurn" => self.roundabout_turn = float(self.roundabout_turn),
            "minDefaultSpeed" | "defaultSpeed" => self.default_speed = float(self.default_speed * 3.6) / 3.6,
            "minSpeed" => self.min_speed = float(self.min_speed * 3.6) / 3.6,
            "maxDefaultSpeed" | "maxSpeed" => {
                self.max_speed = float(self.max_speed * 3.6) / 3.6;
                self.max_vehicle_speed = self.max_speed;
            }
            _ => {}
        }
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    pub fn context(&self, attr: RouteAttribute) -> &AttributeContext {
        &self.contexts[attr.index()]
    }

    pub fn context_mut(&mut self, attr: RouteAttribute) -> &mut AttributeContext {
        &mut self.contexts[attr.index()]
    }

    pub fn register_parameter(&mut self, parameter: RoutingParameter) {
        self.parameters.retain(|p| p.id != parameter.id);
        self.parameters.push(parameter);
    }

    pub fn parameters(&self) -> &[RoutingParameter] {
        &self.parameters
    }

    /// Derives a router with the given parameter values. Boolean parameters
    /// which default to true are set unless overridden.
    pub fn build(&self, params: &HashMap<String, String>) -> Self {
        let mut r = self.clone();
        r.params.clear();
        for p in &self.parameters {
            if p.kind == ParameterKind::Boolean && p.default_bool {
                r.params.insert(p.id.clone(), "true".to_string());
            }
        }
        r.params.extend(params.iter().map(|(k, v)| (k.clone(), v.clone())));

        let flag = |key: &str| r.params.get(key).map(|v| v == "true");
        let num = |key: &str| r.params.get(key).and_then(|v| v.parse::<f64>().ok());
        r.allow_private = flag(ALLOW_PRIVATE).unwrap_or(false);
        r.shortest_route = flag(USE_SHORTEST_WAY).unwrap_or(false);
        r.height_obstacles = flag(USE_HEIGHT_OBSTACLES).unwrap_or(self.height_obstacles);
        r.default_speed = num(DEFAULT_SPEED).unwrap_or(r.default_speed);
        r.min_speed = num(MIN_SPEED).unwrap_or(r.min_speed);
        r.max_speed = num(MAX_SPEED).unwrap_or(r.max_speed);
        r.max_vehicle_speed = r.max_speed;
        if r.shortest_route {
            r.max_speed = r.max_speed.min(CAR_SHORTEST_DEFAULT_SPEED);
        }
        if r.allow_private {
            r.params.insert(ALLOW_PRIVATE.to_string(), "true".to_string());
        }
        r
    }

    pub fn params(&self) -> &HashMap<String, String> {
        &self.params
    }

    fn evaluate(&self, attr: RouteAttribute, types: &[&RouteRule], incline: f64) -> Option<f64> {
        let env = Env {
            types,
            params: &self.params,
            incline,
        };
        self.contexts[attr.index()].evaluate(&env)
    }

    fn evaluate_road(&self, attr: RouteAttribute, road: &RouteDataObject) -> Option<f64> {
        let types: Vec<&RouteRule> = road.types.iter().filter_map(|&t| road.rules.get(t)).collect();
        self.evaluate(attr, &types, 0.0)
    }

    fn evaluate_point(&self, attr: RouteAttribute, road: &RouteDataObject, point: usize, dir: bool) -> f64 {
        let types = filter_direction_tags(road.point_rules(point).collect(), dir);
        if types.is_empty() {
            return 0.0;
        }
        self.evaluate(attr, &types, 0.0).unwrap_or(0.0)
    }

    /// Whether the road may be used at all.
    pub fn accept_line(&self, road: &RouteDataObject) -> bool {
        if self.impassable_road_ids.contains(&road.id) {
            return false;
        }
        self.evaluate_road(RouteAttribute::Access, road).unwrap_or(0.0) as i32 >= 0
    }

    /// 1 if the road may only be traversed forward, -1 if only backward, 0 otherwise.
    pub fn is_one_way(&self, road: &RouteDataObject) -> i32 {
        self.evaluate_road(RouteAttribute::OneWay, road).unwrap_or(0.0) as i32
    }

    pub fn is_area(&self, road: &RouteDataObject) -> bool {
        self.evaluate_road(RouteAttribute::Area, road).unwrap_or(0.0) as i32 == 1
    }

    /// Delay in seconds caused by an obstacle at a point, 0 if none.
    /// `dir` is true when moving along increasing point indices.
    pub fn define_obstacle(&self, road: &RouteDataObject, point: usize, dir: bool) -> f64 {
        self.evaluate_point(RouteAttribute::ObstacleTime, road, point, dir)
    }

    /// Like [GeneralRouter::define_obstacle], used by the search. Negative means impassable.
    pub fn define_routing_obstacle(&self, road: &RouteDataObject, point: usize, dir: bool) -> f64 {
        self.evaluate_point(RouteAttribute::Obstacle, road, point, dir)
    }

    /// Extra seconds spent on inclines between two point indices.
    pub fn define_height_obstacle(&self, road: &RouteDataObject, start: usize, end: usize) -> f64 {
        if !self.height_obstacles || start == end {
            return 0.0;
        }
        let heights = road.calculate_height_array();
        if heights.is_empty() {
            return 0.0;
        }
        let types: Vec<&RouteRule> = road.types.iter().filter_map(|&t| road.rules.get(t)).collect();

        let mut sum = 0.0;
        let mut k = start;
        while k != end {
            let next = if start < end { k + 1 } else { k - 1 };
            let dist = if start < end { heights[2 * next] } else { heights[2 * k] };
            let diff = heights[2 * next + 1] - heights[2 * k + 1];
            if diff != 0.0 && dist > 0.0 {
                let percent = ((diff / dist).abs() * 100.0) as i32;
                // Buckets of 1, 4, 7, 10...
                let percent = (percent + 2) / 3 * 3 - 2;
                if percent >= 1 {
                    let incline = if diff > 0.0 { percent } else { -percent };
                    let per_meter = self
                        .evaluate(RouteAttribute::ObstacleSrtmAltSpeed, &types, incline as f64)
                        .unwrap_or(0.0);
                    sum += per_meter * diff.abs();
                }
            }
            k = next;
        }
        sum
    }

    /// Speed in m/s used by the search, clamped to `[min_speed, max_speed]`.
    pub fn define_routing_speed(&self, road: &RouteDataObject) -> f64 {
        let spd = self
            .evaluate_road(RouteAttribute::Speed, road)
            .unwrap_or(self.default_speed);
        spd.min(self.max_speed).max(self.min_speed)
    }

    /// Real speed in m/s of the vehicle, clamped to `[min_speed, max_vehicle_speed]`.
    pub fn define_vehicle_speed(&self, road: &RouteDataObject) -> f64 {
        let spd = self
            .evaluate_road(RouteAttribute::Speed, road)
            .unwrap_or(self.default_speed);
        spd.min(self.max_vehicle_speed).max(self.min_speed)
    }

    pub fn define_penalty_transition(&self, road: &RouteDataObject) -> f64 {
        self.evaluate_road(RouteAttribute::PenaltyTransition, road)
            .unwrap_or(0.0)
    }

    pub fn define_speed_priority(&self, road: &RouteDataObject) -> f64 {
        self.evaluate_road(RouteAttribute::Priority, road).unwrap_or(1.0)
    }

    /// Seconds spent turning from `prev` (which ends at `prev_end`) onto `segment`.
    pub fn calculate_turn_time(
        &self,
        segment: &RouteDataObject,
        segment_start: usize,
        segment_end: usize,
        prev: &RouteDataObject,
        prev_start: usize,
        prev_end: usize,
    ) -> f64 {
        let ts = self.define_penalty_transition(segment);
        let prev_ts = self.define_penalty_transition(prev);

        let mut total = 0.0;
        if prev_ts != ts {
            total += (ts - prev_ts).abs() / 2.0;
        }

        if segment.is_roundabout() && !prev.is_roundabout() {
            if self.roundabout_turn > 0.0 {
                total += self.roundabout_turn;
            }
        } else if self.sharp_turn > 0.0 || self.slight_turn > 0.0 {
            let a1 = segment.direction_route(segment_start, segment_start < segment_end);
            let a2 = prev.direction_route(prev_end, prev_end < prev_start);
            let diff = align_angle_difference(a1 - a2 - PI).abs();
            if diff > 2.0 * PI / 3.0 {
                total += self.sharp_turn;
            } else if diff > PI / 3.0 {
                total += self.slight_turn;
            }
        }
        total
    }
}

/// Drops stop signs and traffic signals which apply to the opposite direction
/// of travel. `dir` is true when moving along increasing point indices.
fn filter_direction_tags(types: Vec<&RouteRule>, dir: bool) -> Vec<&RouteRule> {
    let opposite = if dir { -1 } else { 1 };
    let mut direction = 0;
    let mut signals_direction = 0;
    for r in &types {
        match (r.tag.as_str(), r.value.as_str()) {
            ("direction", "backward") => direction = -1,
            ("direction", "forward") => direction = 1,
            ("traffic_signals:direction", "backward") => signals_direction = -1,
            ("traffic_signals:direction", "forward") => signals_direction = 1,
            _ => {}
        }
    }
    if direction == 0 && signals_direction == 0 {
        return types;
    }

    types
        .into_iter()
        .filter(|r| {
            let sign = r.tag == "highway" && (r.value == "stop" || r.value == "give_way");
            let signals = r.kind == RouteRuleKind::TrafficSignals;
            !(sign && direction == opposite) && !(signals && signals_direction == opposite)
        })
        .collect()
}

/// Speed and priority of a `highway=*` class in a built-in profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HighwayClass<'a> {
    pub value: &'a str,

    /// Speed in km/h.
    pub speed: f32,
    pub priority: f32,
}

/// Routable road classes of the built-in car profile.
pub const CAR_HIGHWAYS: &[HighwayClass] = &[
    HighwayClass { value: "motorway", speed: 110.0, priority: 1.2 },
    HighwayClass { value: "motorway_link", speed: 80.0, priority: 1.1 },
    HighwayClass { value: "trunk", speed: 100.0, priority: 1.2 },
    HighwayClass { value: "trunk_link", speed: 75.0, priority: 1.1 },
    HighwayClass { value: "primary", speed: 65.0, priority: 1.05 },
    HighwayClass { value: "primary_link", speed: 50.0, priority: 1.0 },
    HighwayClass { value: "secondary", speed: 60.0, priority: 1.0 },
    HighwayClass { value: "secondary_link", speed: 50.0, priority: 1.0 },
    HighwayClass { value: "tertiary", speed: 45.0, priority: 0.95 },
    HighwayClass { value: "tertiary_link", speed: 40.0, priority: 0.95 },
    HighwayClass { value: "unclassified", speed: 35.0, priority: 0.7 },
    HighwayClass { value: "road", speed: 35.0, priority: 0.7 },
    HighwayClass { value: "residential", speed: 35.0, priority: 0.7 },
    HighwayClass { value: "living_street", speed: 20.0, priority: 0.5 },
    HighwayClass { value: "service", speed: 20.0, priority: 0.5 },
    HighwayClass { value: "track", speed: 15.0, priority: 0.3 },
];

/// Routable road classes of the built-in bicycle profile.
pub const BICYCLE_HIGHWAYS: &[HighwayClass] = &[
    HighwayClass { value: "cycleway", speed: 18.0, priority: 1.3 },
    HighwayClass { value: "primary", speed: 16.0, priority: 0.8 },
    HighwayClass { value: "primary_link", speed: 16.0, priority: 0.8 },
    HighwayClass { value: "secondary", speed: 16.0, priority: 0.9 },
    HighwayClass { value: "secondary_link", speed: 16.0, priority: 0.9 },
    HighwayClass { value: "tertiary", speed: 16.0, priority: 1.0 },
    HighwayClass { value: "tertiary_link", speed: 16.0, priority: 1.0 },
    HighwayClass { value: "unclassified", speed: 16.0, priority: 1.0 },
    HighwayClass { value: "road", speed: 16.0, priority: 1.0 },
    HighwayClass { value: "residential", speed: 16.0, priority: 1.1 },
    HighwayClass { value: "living_street", speed: 14.0, priority: 1.1 },
    HighwayClass { value: "service", speed: 14.0, priority: 1.0 },
    HighwayClass { value: "track", speed: 12.0, priority: 0.9 },
    HighwayClass { value: "path", speed: 10.0, priority: 0.9 },
    HighwayClass { value: "footway", speed: 8.0, priority: 0.7 },
    HighwayClass { value: "pedestrian", speed: 8.0, priority: 0.7 },
];

/// Routable road classes of the built-in pedestrian profile.
pub const PEDESTRIAN_HIGHWAYS: &[HighwayClass] = &[
    HighwayClass { value: "footway", speed: 5.0, priority: 1.2 },
    HighwayClass { value: "pedestrian", speed: 5.0, priority: 1.2 },
    HighwayClass { value: "path", speed: 5.0, priority: 1.1 },
    HighwayClass { value: "steps", speed: 3.0, priority: 1.0 },
    HighwayClass { value: "living_street", speed: 5.0, priority: 1.1 },
    HighwayClass { value: "residential", speed: 5.0, priority: 1.0 },
    HighwayClass { value: "service", speed: 5.0, priority: 1.0 },
    HighwayClass { value: "track", speed: 5.0, priority: 1.0 },
    HighwayClass { value: "cycleway", speed: 5.0, priority: 0.9 },
    HighwayClass { value: "unclassified", speed: 5.0, priority: 0.9 },
    HighwayClass { value: "road", speed: 5.0, priority: 0.9 },
    HighwayClass { value: "tertiary", speed: 5.0, priority: 0.8 },
    HighwayClass { value: "tertiary_link", speed: 5.0, priority: 0.8 },
    HighwayClass { value: "secondary", speed: 5.0, priority: 0.7 },
    HighwayClass { value: "secondary_link", speed: 5.0, priority: 0.7 },
    HighwayClass { value: "primary", speed: 5.0, priority: 0.6 },
    HighwayClass { value: "primary_link", speed: 5.0, priority: 0.6 },
];

fn add_highway_classes(r: &mut GeneralRouter, classes: &[HighwayClass]) {
    for c in classes {
        r.context_mut(RouteAttribute::Speed)
            .push(EvalRule::select(&c.speed.to_string(), "speed").with_tag("highway", c.value));
        r.context_mut(RouteAttribute::Priority)
            .push(EvalRule::select(&c.priority.to_string(), "").with_tag("highway", c.value));
        r.context_mut(RouteAttribute::Access)
            .push(EvalRule::select("1", "").with_tag("highway", c.value));
    }
    r.context_mut(RouteAttribute::Access).push(EvalRule::select("-1", ""));
}

fn add_oneway_rules(r: &mut GeneralRouter) {
    let ctx = r.context_mut(RouteAttribute::OneWay);
    ctx.push(EvalRule::select("1", "").with_tag("oneway", "yes"));
    ctx.push(EvalRule::select("1", "").with_tag("oneway", "1"));
    ctx.push(EvalRule::select("-1", "").with_tag("oneway", "-1"));
    ctx.push(EvalRule::select("-1", "").with_tag("oneway", "reverse"));
    ctx.push(EvalRule::select("1", "").with_tag("junction", "roundabout"));
}

fn add_private_access_rules(r: &mut GeneralRouter, mode: &str) {
    let ctx = r.context_mut(RouteAttribute::Access);
    ctx.push(EvalRule::select("1", "").with_tag(mode, "yes"));
    ctx.push(EvalRule::select("-1", "").with_tag(mode, "no"));
    ctx.push(EvalRule::select("-1", "").with_tag("access", "no"));
    let mut private = EvalRule::select("-1", "").with_tag("access", "private");
    private.add_param_condition(ALLOW_PRIVATE, true);
    ctx.push(private);
}

fn boolean_parameter(id: &str, name: &str) -> RoutingParameter {
    RoutingParameter {
        id: id.to_string(),
        name: name.to_string(),
        description: String::new(),
        kind: ParameterKind::Boolean,
        default_bool: false,
        possible_values: Vec::new(),
    }
}

/// Router for cars, available without any configuration file.
pub fn car_router() -> GeneralRouter {
    let mut r = GeneralRouter::new(
        RouterProfile::Car,
        &[
            ("restrictionsAware", "true"),
            ("defaultSpeed", "45"),
            ("minSpeed", "2"),
            ("maxSpeed", "130"),
            ("roundaboutTurn", "5"),
            ("sharpTurn", "10"),
            ("slightTurn", "3"),
        ],
    );
    r.register_parameter(boolean_parameter(USE_SHORTEST_WAY, "Use shortest way"));
    r.register_parameter(boolean_parameter(ALLOW_PRIVATE, "Allow private access"));
    r.register_parameter(boolean_parameter("avoid_motorway", "Avoid motorways"));

    r.context_mut(RouteAttribute::Speed)
        .push(EvalRule::select("$maxspeed", "speed"));
    add_private_access_rules(&mut r, "motor_vehicle");
    for motorway in ["motorway", "motorway_link"] {
        r.context_mut(RouteAttribute::Access).push(
            EvalRule::select("-1", "")
                .with_tag("highway", motorway)
                .with_param("avoid_motorway"),
        );
    }
    add_highway_classes(&mut r, CAR_HIGHWAYS);
    add_oneway_rules(&mut r);

    let obstacles = r.context_mut(RouteAttribute::ObstacleTime);
    obstacles.push(EvalRule::select("25", "").with_tag("highway", "traffic_signals"));
    obstacles.push(EvalRule::select("25", "").with_tag("railway", "level_crossing"));
    obstacles.push(EvalRule::select("25", "").with_tag("railway", "crossing"));
    obstacles.push(EvalRule::select("5", "").with_tag("highway", "stop"));
    obstacles.push(EvalRule::select("2", "").with_tag("highway", "give_way"));

    let routing = r.context_mut(RouteAttribute::Obstacle);
    routing.push(EvalRule::select("-1", "").with_tag("barrier", "bollard"));
    routing.push(EvalRule::select("-1", "").with_tag("barrier", "block"));
    routing.push(EvalRule::select("25", "").with_tag("highway", "traffic_signals"));
    routing.push(EvalRule::select("25", "").with_tag("railway", "level_crossing"));

    let transition = r.context_mut(RouteAttribute::PenaltyTransition);
    transition.push(EvalRule::select("0", "").with_tag("highway", "motorway"));
    transition.push(EvalRule::select("0", "").with_tag("highway", "trunk"));
    transition.push(EvalRule::select("5", "").with_tag("highway", "residential"));
    transition.push(EvalRule::select("10", "").with_tag("highway", "service"));
    r
}

/// Router for bicycles, available without any configuration file.
pub fn bicycle_router() -> GeneralRouter {
    let mut r = GeneralRouter::new(
        RouterProfile::Bicycle,
        &[
            ("restrictionsAware", "true"),
            ("defaultSpeed", "10"),
            ("minSpeed", "3"),
            ("maxSpeed", "18"),
        ],
    );
    r.register_parameter(boolean_parameter(ALLOW_PRIVATE, "Allow private access"));
    r.register_parameter(boolean_parameter(USE_HEIGHT_OBSTACLES, "Use elevation data"));
    add_private_access_rules(&mut r, "bicycle");
    add_highway_classes(&mut r, BICYCLE_HIGHWAYS);
    add_oneway_rules(&mut r);

    let obstacles = r.context_mut(RouteAttribute::ObstacleTime);
    obstacles.push(EvalRule::select("15", "").with_tag("highway", "traffic_signals"));
    obstacles.push(EvalRule::select("15", "").with_tag("railway", "level_crossing"));
    r.context_mut(RouteAttribute::Obstacle)
        .push(EvalRule::select("15", "").with_tag("highway", "traffic_signals"));

    let alt = r.context_mut(RouteAttribute::ObstacleSrtmAltSpeed);
    alt.push(EvalRule::select("3", "").with_expression(Comparison::GreaterOrEqual, ":incline", "1"));
    alt.push(EvalRule::select("0", ""));
    r
}

/// Router for pedestrians, available without any configuration file.
/// Pedestrians ignore one-way roads and turn restrictions.
pub fn pedestrian_router() -> GeneralRouter {
    let mut r = GeneralRouter::new(
        RouterProfile::Pedestrian,
        &[
            ("restrictionsAware", "false"),
            ("defaultSpeed", "4"),
            ("minSpeed", "1"),
            ("maxSpeed", "5"),
        ],
    );
    r.register_parameter(boolean_parameter(ALLOW_PRIVATE, "Allow private access"));
    r.register_parameter(boolean_parameter(USE_HEIGHT_OBSTACLES, "Use elevation data"));
    add_private_access_rules(&mut r, "foot");
    add_highway_classes(&mut r, PEDESTRIAN_HIGHWAYS);

    r.context_mut(RouteAttribute::ObstacleTime)
        .push(EvalRule::select("10", "").with_tag("highway", "traffic_signals"));
    r.context_mut(RouteAttribute::Obstacle)
        .push(EvalRule::select("10", "").with_tag("highway", "traffic_signals"));
    r.context_mut(RouteAttribute::Area)
        .push(EvalRule::select("1", "").with_tag("area", "yes"));

    // Six extra seconds per meter climbed on inclines of 1% and more
    let alt = r.context_mut(RouteAttribute::ObstacleSrtmAltSpeed);
    alt.push(EvalRule::select("6", "").with_expression(Comparison::GreaterOrEqual, ":incline", "1"));
    alt.push(EvalRule::select("0", ""));
    r
}

/// Looks up a built-in router by name (`car`, `bicycle` or `pedestrian`).
pub fn builtin_router(name: &str) -> Option<GeneralRouter> {
    match name {
        "car" => Some(car_router()),
        "bicycle" => Some(bicycle_router()),
        "pedestrian" => Some(pedestrian_router()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obf::road::tests::rules;
    use crate::obf::PointI;

    macro_rules! assert_almost_eq {
        ($a:expr, $b:expr, $eps:expr) => {
            assert!((($a - $b).abs() < $eps), "assertion failed: {} ≈ {}", $a, $b)
        };
    }

    fn road(pairs: &[(&str, &str)], points: &[(i32, i32)]) -> RouteDataObject {
        let mut r = RouteDataObject::new(7, rules(pairs));
        r.types = (1..=pairs.len() as u32).collect();
        r.points = points.iter().map(|&(x, y)| PointI::new(x, y)).collect();
        r
    }

    #[test]
    fn car_speeds_and_access() {
        let r = car_router().build(&HashMap::new());
        let primary = road(&[("highway", "primary")], &[(0, 0), (100, 0)]);
        assert!(r.accept_line(&primary));
        assert_almost_eq!(r.define_routing_speed(&primary), 65.0 / 3.6, 1e-3);
        assert_almost_eq!(r.define_speed_priority(&primary), 1.05, 1e-6);

        let limited = road(&[("highway", "primary"), ("maxspeed", "30")], &[(0, 0), (100, 0)]);
        assert_almost_eq!(r.define_routing_speed(&limited), 30.0 / 3.6, 1e-3);

        let footway = road(&[("highway", "footway")], &[(0, 0), (100, 0)]);
        assert!(!r.accept_line(&footway));

        let private = road(&[("highway", "residential"), ("access", "private")], &[(0, 0), (1, 0)]);
        assert!(!r.accept_line(&private));
        let mut params = HashMap::new();
        params.insert(ALLOW_PRIVATE.to_string(), "true".to_string());
        assert!(car_router().build(&params).accept_line(&private));
    }

    #[test]
    fn impassable_roads_are_rejected() {
        let mut r = car_router().build(&HashMap::new());
        let primary = road(&[("highway", "primary")], &[(0, 0), (100, 0)]);
        r.impassable_road_ids.insert(primary.id);
        assert!(!r.accept_line(&primary));
    }

    #[test]
    fn oneway_per_profile() {
        let oneway = road(&[("highway", "residential"), ("oneway", "yes")], &[(0, 0), (1, 0)]);
        let reverse = road(&[("highway", "residential"), ("oneway", "-1")], &[(0, 0), (1, 0)]);
        let car = car_router();
        assert_eq!(car.is_one_way(&oneway), 1);
        assert_eq!(car.is_one_way(&reverse), -1);
        assert_eq!(pedestrian_router().is_one_way(&oneway), 0);
    }

    #[test]
    fn speed_is_clamped() {
        let r = car_router().build(&HashMap::new());
        let fast = road(&[("highway", "motorway"), ("maxspeed", "300")], &[(0, 0), (1, 0)]);
        assert_almost_eq!(r.define_routing_speed(&fast), 130.0 / 3.6, 1e-3);

        let mut params = HashMap::new();
        params.insert(USE_SHORTEST_WAY.to_string(), "true".to_string());
        let short = car_router().build(&params);
        assert_almost_eq!(short.define_routing_speed(&fast), 55.0 / 3.6, 1e-3);
        assert_almost_eq!(short.define_vehicle_speed(&fast), 130.0 / 3.6, 1e-3);
    }

    #[test]
    fn point_obstacles_respect_direction() {
        let mut r = road(
            &[("highway", "primary"), ("highway", "stop"), ("direction", "forward")],
            &[(0, 0), (100, 0), (200, 0)],
        );
        r.types = vec![1];
        r.point_types = vec![vec![], vec![2, 3], vec![]];
        let car = car_router();
        assert_almost_eq!(car.define_obstacle(&r, 1, true), 5.0, 1e-9);
        assert_almost_eq!(car.define_obstacle(&r, 1, false), 0.0, 1e-9);
        assert_almost_eq!(car.define_obstacle(&r, 0, true), 0.0, 1e-9);
    }

    #[test]
    fn turn_time_penalties() {
        let car = car_router();
        // Eastwards, then a right-angle turn southwards
        let a = road(&[("highway", "primary")], &[(0, 0), (10_000, 0)]);
        let b = road(&[("highway", "primary")], &[(10_000, 0), (10_000, 10_000)]);
        let t = car.calculate_turn_time(&b, 0, 1, &a, 0, 1);
        assert_almost_eq!(t, 3.0, 1e-9);

        // Straight on costs nothing
        let c = road(&[("highway", "primary")], &[(10_000, 0), (20_000, 0)]);
        assert_almost_eq!(car.calculate_turn_time(&c, 0, 1, &a, 0, 1), 0.0, 1e-9);

        // Going back is a sharp turn
        assert_almost_eq!(car.calculate_turn_time(&a, 1, 0, &a, 0, 1), 10.0, 1e-9);

        // Transition penalties are averaged
        let d = road(&[("highway", "service")], &[(10_000, 0), (20_000, 0)]);
        assert_almost_eq!(car.calculate_turn_time(&d, 0, 1, &a, 0, 1), 5.0, 1e-9);
    }

    #[test]
    fn parameters_and_expressions() {
        let mut r = GeneralRouter::new(RouterProfile::Car, &[("maxSpeed", "100")]);
        r.register_parameter(RoutingParameter {
            default_bool: true,
            ..boolean_parameter("slow", "Slow")
        });
        r.context_mut(RouteAttribute::Speed)
            .push(EvalRule::select("10", "speed").with_param("slow"));
        r.context_mut(RouteAttribute::Speed).push(
            EvalRule::select("$maxspeed", "speed").with_expression(Comparison::LessOrEqual, "$maxspeed", "50"),
        );
        let limited = road(&[("maxspeed", "40")], &[(0, 0), (1, 0)]);

        let built = r.build(&HashMap::new());
        assert_almost_eq!(built.define_routing_speed(&limited), 10.0 / 3.6, 1e-3);

        let mut params = HashMap::new();
        params.insert("slow".to_string(), "false".to_string());
        let built = r.build(&params);
        assert_almost_eq!(built.define_routing_speed(&limited), 40.0 / 3.6, 1e-3);
    }

    #[test]
    fn height_obstacles_follow_incline() {
        let mut params = HashMap::new();
        params.insert(USE_HEIGHT_OBSTACLES.to_string(), "true".to_string());
        let r = pedestrian_router().build(&params);
        let hill = road(
            &[("highway", "footway"), ("osmand_ele_start", "100"), ("osmand_ele_end", "110")],
            &[(0, 0), (10_000, 0)],
        );
        assert_almost_eq!(r.define_height_obstacle(&hill, 0, 1), 60.0, 1e-6);
        assert_almost_eq!(r.define_height_obstacle(&hill, 1, 0), 0.0, 1e-6);
        assert_almost_eq!(pedestrian_router().define_height_obstacle(&hill, 0, 1), 0.0, 1e-6);
    }

    #[test]
    fn value_parsing() {
        assert_eq!(parse_value("-1", ""), Some(-1.0));
        assert_eq!(parse_value("2.5", ""), Some(2.5));
        assert_eq!(parse_value("abc", ""), None);
        assert!((parse_value("36", "speed").unwrap() - 10.0).abs() < 1e-5);
    }
}
