// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::HashMap;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;
use std::str::from_utf8;
use std::sync::Arc;

use quick_xml::events::{BytesStart, Event};

use super::router::{
    builtin_router, car_router, Comparison, EvalRule, GeneralRouter, ParameterKind, RouteAttribute,
    RouterProfile, RoutingParameter,
};
use crate::obf::source::decompress;
use crate::obf::{FileFormat, PointI};
use crate::Error;

/// Maximum distance (in meters) between a detailed route and the
/// precalculated base route guiding it.
pub const DEVIATION_RADIUS: f64 = 3000.0;

pub const DEFAULT_MEMORY_LIMIT_MB: usize = 100;

/// Tunables of a single route calculation, together with the router to use.
#[derive(Debug, Clone)]
pub struct RoutingConfiguration {
    pub router: Arc<GeneralRouter>,
    pub router_name: String,

    /// Memory budget of loaded road tiles, in megabytes.
    pub memory_limit_mb: usize,

    /// Bearing (in radians) the traveller is currently heading, used to
    /// prefer start segments going the same way.
    pub initial_direction: Option<f64>,

    /// Zoom level of the tiles in which road data is loaded.
    pub zoom_to_load: u8,

    /// Weight of the distance-to-target estimate in the search priority.
    pub heuristic_coefficient: f64,

    /// 0 searches from both ends, a positive value only from the start,
    /// a negative value only from the end.
    pub plan_road_direction: i32,

    /// Distance (in meters) after which a route is recalculated rather than reused.
    pub recalculate_distance: f64,
}

impl RoutingConfiguration {
    pub fn new(router: GeneralRouter, router_name: &str) -> Self {
        Self {
            router: Arc::new(router),
            router_name: router_name.to_string(),
            memory_limit_mb: DEFAULT_MEMORY_LIMIT_MB,
            initial_direction: None,
            zoom_to_load: 16,
            heuristic_coefficient: 1.0,
            plan_road_direction: 0,
            recalculate_distance: 20000.0,
        }
    }

    /// Reads the tunables from router attributes, falling back to `global` ones.
    fn init_params(&mut self, global: &HashMap<String, String>) {
        let router = Arc::clone(&self.router);
        let lookup = |key: &str| -> Option<&str> {
            router
                .attribute(key)
                .or_else(|| global.get(key).map(String::as_str))
        };

        if let Some(v) = parse_attribute(lookup("planRoadDirection"), "planRoadDirection") {
            self.plan_road_direction = v;
        }
        if let Some(v) = parse_attribute(lookup("heuristicCoefficient"), "heuristicCoefficient") {
            self.heuristic_coefficient = v;
        }
        if let Some(v) = parse_attribute(lookup("recalculateDistanceHelp"), "recalculateDistanceHelp") {
            self.recalculate_distance = v;
        }
        if let Some(v) = parse_attribute(lookup("nativeMemoryLimitInMB"), "nativeMemoryLimitInMB") {
            self.memory_limit_mb = v;
        }
        if let Some(v) = parse_attribute(lookup("zoomToLoadTiles"), "zoomToLoadTiles") {
            self.zoom_to_load = v;
        }
    }
}

fn parse_attribute<T: std::str::FromStr>(value: Option<&str>, key: &str) -> Option<T> {
    let value = value?;
    match value.trim().parse::<T>() {
        Ok(v) => Some(v),
        Err(_) => {
            log::warn!("ignoring routing attribute {key}={value:?}: not a valid number");
            None
        }
    }
}

/// Collection of named routers and global attributes, usually loaded from a `routing.xml`.
#[derive(Debug, Clone, Default)]
pub struct RoutingConfigurationBuilder {
    routers: HashMap<String, GeneralRouter>,
    attributes: HashMap<String, String>,
    pub default_router: String,
    impassable_roads: HashMap<i64, PointI>,
}

impl RoutingConfigurationBuilder {
    /// Builder with only the built-in `car`, `bicycle` and `pedestrian` routers.
    pub fn with_builtin() -> Self {
        let mut b = Self::default();
        for name in ["car", "bicycle", "pedestrian"] {
            if let Some(r) = builtin_router(name) {
                b.add_router(name, r);
            }
        }
        b.default_router = "car".to_string();
        b
    }

    /// Loads a routing configuration file, which may be gzip or bzip2 compressed.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, Error> {
        let mut raw = Vec::new();
        File::open(path.as_ref())?.read_to_end(&mut raw)?;
        let data = decompress(raw, FileFormat::Unknown)?;
        Self::from_xml(data.as_slice())
    }

    /// Parses an OsmAnd-style `routing.xml` document.
    pub fn from_xml<R: io::BufRead>(reader: R) -> Result<Self, Error> {
        let mut builder = Self::default();
        let mut handler = RulesHandler::new(&mut builder);
        let mut xml = quick_xml::Reader::from_reader(reader);
        let mut buf = Vec::new();

        loop {
            match xml.read_event_into(&mut buf)? {
                Event::Start(start) => handler.start(&start)?,
                Event::Empty(start) => {
                    handler.start(&start)?;
                    handler.end(start.local_name().as_ref());
                }
                Event::End(end) => handler.end(end.local_name().as_ref()),
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        Ok(builder)
    }

    pub fn add_router(&mut self, name: &str, router: GeneralRouter) {
        self.routers.insert(name.to_string(), router);
    }

    pub fn router(&self, name: &str) -> Option<&GeneralRouter> {
        self.routers.get(name)
    }

    pub fn router_names(&self) -> impl Iterator<Item = &str> + '_ {
        self.routers.keys().map(String::as_str)
    }

    pub fn add_attribute(&mut self, key: &str, value: &str) {
        self.attributes.insert(key.to_string(), value.to_string());
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Marks a road as impassable for every configuration built afterwards.
    /// `location` is a point on the road, kept for the caller's bookkeeping.
    pub fn add_impassable_road(&mut self, road_id: i64, location: PointI) {
        self.impassable_roads.insert(road_id, location);
    }

    pub fn remove_impassable_road(&mut self, road_id: i64) {
        self.impassable_roads.remove(&road_id);
    }

    pub fn impassable_roads(&self) -> &HashMap<i64, PointI> {
        &self.impassable_roads
    }

    /// Creates a configuration for the named router with the given parameter values.
    ///
    /// Unknown router names fall back to the default router,
    /// and then to the built-in car router.
    pub fn build(&self, router_name: &str, params: &HashMap<String, String>) -> RoutingConfiguration {
        let (name, base) = match self.routers.get(router_name) {
            Some(r) => (router_name, r.clone()),
            None => match self.routers.get(&self.default_router) {
                Some(r) => {
                    log::debug!("unknown router {router_name:?}, using {:?}", self.default_router);
                    (self.default_router.as_str(), r.clone())
                }
                None => {
                    log::debug!("unknown router {router_name:?}, using built-in car");
                    ("car", car_router())
                }
            },
        };

        let mut router = base.build(params);
        router.impassable_road_ids.extend(self.impassable_roads.keys().copied());

        let mut config = RoutingConfiguration::new(router, name);
        config.init_params(&self.attributes);
        config
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RuleTagName {
    Select,
    If,
    IfNot,
    Gt,
    Le,
    Eq,
}

impl RuleTagName {
    fn from_bytes(name: &[u8]) -> Option<Self> {
        match name {
            b"select" => Some(Self::Select),
            b"if" => Some(Self::If),
            b"ifnot" => Some(Self::IfNot),
            b"gt" => Some(Self::Gt),
            b"le" => Some(Self::Le),
            b"eq" => Some(Self::Eq),
            _ => None,
        }
    }
}

/// Conditions of one rule element, kept on a stack while its children are parsed.
#[derive(Debug, Clone)]
struct RuleTag {
    name: RuleTagName,
    t: String,
    v: String,
    param: String,
    value1: String,
    value2: String,
    value_type: String,
}

impl RuleTag {
    fn add_subclause(&self, rule: &mut EvalRule) {
        let negated = self.name == RuleTagName::IfNot;
        if !self.param.is_empty() {
            rule.add_param_condition(&self.param, negated);
        }
        if !self.t.is_empty() {
            rule.add_tag_condition(&self.t, &self.v, negated);
        }
        let comparison = match self.name {
            RuleTagName::Gt => Comparison::GreaterOrEqual,
            RuleTagName::Le => Comparison::LessOrEqual,
            RuleTagName::Eq => Comparison::Equal,
            _ => return,
        };
        rule.add_expression(comparison, &self.value1, &self.value2, &self.value_type);
    }
}

struct RulesHandler<'a> {
    builder: &'a mut RoutingConfigurationBuilder,
    current_router: Option<String>,
    current_attribute: Option<RouteAttribute>,
    pre_type: String,
    stack: Vec<RuleTag>,
}

impl<'a> RulesHandler<'a> {
    fn new(builder: &'a mut RoutingConfigurationBuilder) -> Self {
        Self {
            builder,
            current_router: None,
            current_attribute: None,
            pre_type: String::new(),
            stack: Vec::new(),
        }
    }

    fn current_router_mut(&mut self, element: &str) -> Result<&mut GeneralRouter, Error> {
        self.current_router
            .as_ref()
            .and_then(|name| self.builder.routers.get_mut(name))
            .ok_or_else(|| Error::Config(format!("<{element}> outside of <routingProfile>")))
    }

    fn start(&mut self, start: &BytesStart<'_>) -> Result<(), Error> {
        let attrs = parse_attributes(start)?;
        let get = |key: &str| attrs.get(key).cloned().unwrap_or_default();

        match start.local_name().as_ref() {
            b"osmand_routing_config" => self.builder.default_router = get("defaultProfile"),

            b"routingProfile" => {
                let name = get("name");
                let profile = RouterProfile::from_name(&get("baseProfile")).unwrap_or_default();
                let pairs: Vec<(&str, &str)> = attrs.iter().map(|(k, v)| (k.as_str(), v.as_str())).collect();
                self.builder.add_router(&name, GeneralRouter::new(profile, &pairs));
                self.current_router = Some(name);
            }

            b"attribute" => {
                let (name, value) = (get("name"), get("value"));
                if self.current_router.is_some() {
                    self.current_router_mut("attribute")?.add_attribute(&name, &value);
                } else {
                    self.builder.add_attribute(&name, &value);
                }
            }

            b"parameter" => {
                let kind = match get("type").to_ascii_lowercase().as_str() {
                    "boolean" => ParameterKind::Boolean,
                    "numeric" => ParameterKind::Numeric,
                    other => {
                        log::warn!("ignoring routing parameter {:?} of unknown type {other:?}", get("id"));
                        return Ok(());
                    }
                };
                let parameter = RoutingParameter {
                    id: get("id"),
                    name: get("name"),
                    description: get("description"),
                    kind,
                    default_bool: get("default") == "true",
                    possible_values: get("values")
                        .split(',')
                        .filter_map(|v| v.trim().parse().ok())
                        .collect(),
                };
                self.current_router_mut("parameter")?.register_parameter(parameter);
            }

            b"way" | b"point" => {
                let attribute = get("attribute");
                self.current_attribute = Some(
                    RouteAttribute::from_name(&attribute)
                        .ok_or_else(|| Error::Config(format!("unknown rule attribute {attribute:?}")))?,
                );
                self.pre_type = get("type");
            }

            other => {
                if let Some(name) = RuleTagName::from_bytes(other) {
                    let value_type = match get("type") {
                        t if t.is_empty() => self.pre_type.clone(),
                        t => t,
                    };
                    let tag = RuleTag {
                        name,
                        t: get("t"),
                        v: get("v"),
                        param: get("param"),
                        value1: get("value1"),
                        value2: get("value2"),
                        value_type,
                    };
                    self.parse_rule(tag, &get("value"))?;
                }
            }
        }

        Ok(())
    }

    fn parse_rule(&mut self, tag: RuleTag, select_value: &str) -> Result<(), Error> {
        let attribute = self
            .current_attribute
            .ok_or_else(|| Error::Config("rule outside of <way> or <point>".to_string()))?;

        // Temporarily take the stack to borrow the router mutably
        let stack = std::mem::take(&mut self.stack);
        let ctx = self.current_router_mut("select")?.context_mut(attribute);

        if tag.name == RuleTagName::Select {
            ctx.push(EvalRule::select(select_value, &tag.value_type));
            if let Some(rule) = ctx.last_rule_mut() {
                tag.add_subclause(rule);
                for parent in &stack {
                    parent.add_subclause(rule);
                }
            }
        } else if stack.last().is_some_and(|t| t.name == RuleTagName::Select) {
            if let Some(rule) = ctx.last_rule_mut() {
                tag.add_subclause(rule);
            }
        }

        self.stack = stack;
        self.stack.push(tag);
        Ok(())
    }

    fn end(&mut self, name: &[u8]) {
        if RuleTagName::from_bytes(name).is_some() {
            self.stack.pop();
        } else if name == b"routingProfile" {
            self.current_router = None;
        } else if name == b"way" || name == b"point" {
            self.current_attribute = None;
        }
    }
}

fn parse_attributes(start: &BytesStart<'_>) -> Result<HashMap<String, String>, Error> {
    let mut attrs = HashMap::new();
    for attr in start.attributes() {
        let attr = attr.map_err(quick_xml::Error::from)?;
        let key = from_utf8(attr.key.as_ref()).map_err(|e| Error::Config(e.to_string()))?;
        let value = from_utf8(&attr.value).map_err(|e| Error::Config(e.to_string()))?;
        attrs.insert(key.to_string(), value.to_string());
    }
    Ok(attrs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obf::road::tests::rules;
    use crate::obf::RouteDataObject;

    const ROUTING_XML: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<osmand_routing_config defaultProfile="car">
  <attribute name="zoomToLoadTiles" value="15"/>
  <attribute name="heuristicCoefficient" value="1.2"/>

  <routingProfile name="car" baseProfile="car" restrictionsAware="true" minDefaultSpeed="45.0" maxDefaultSpeed="130.0">
    <attribute name="heuristicCoefficient" value="1.5"/>
    <parameter id="avoid_motorway" name="Avoid motorways" type="boolean"/>

    <way attribute="access">
      <select value="-1" t="highway" v="motorway">
        <if param="avoid_motorway"/>
      </select>
      <select value="1" t="highway"/>
      <select value="-1"/>
    </way>

    <way attribute="speed" type="speed">
      <if t="highway" v="residential">
        <select value="30"/>
      </if>
      <select value="$maxspeed"/>
      <select value="90" t="highway" v="primary"/>
    </way>

    <way attribute="oneway">
      <select value="1" t="oneway" v="yes"/>
      <select value="0"/>
    </way>
  </routingProfile>

  <routingProfile name="foot" baseProfile="pedestrian" minDefaultSpeed="4" maxDefaultSpeed="6">
    <way attribute="access">
      <ifnot t="highway" v="motorway">
        <select value="1"/>
      </ifnot>
      <select value="-1"/>
    </way>
  </routingProfile>
</osmand_routing_config>
"#;

    fn road(pairs: &[(&str, &str)]) -> RouteDataObject {
        let mut r = RouteDataObject::new(1, rules(pairs));
        r.types = (1..=pairs.len() as u32).collect();
        r.points = vec![PointI::new(0, 0), PointI::new(100, 0)];
        r
    }

    fn assert_speed(router: &GeneralRouter, pairs: &[(&str, &str)], kmh: f64) {
        let got = router.define_routing_speed(&road(pairs)) * 3.6;
        assert!((got - kmh).abs() < 1e-3, "speed of {pairs:?}: {got} != {kmh}");
    }

    #[test]
    fn parses_profiles() {
        let builder = RoutingConfigurationBuilder::from_xml(ROUTING_XML.as_bytes()).unwrap();
        assert_eq!(builder.default_router, "car");
        assert_eq!(builder.attribute("zoomToLoadTiles"), Some("15"));

        let car = builder.router("car").unwrap();
        assert_eq!(car.profile, RouterProfile::Car);
        assert_eq!(car.context(RouteAttribute::Access).len(), 3);
        assert_eq!(car.context(RouteAttribute::Speed).len(), 3);
        assert_eq!(car.parameters().len(), 1);
        assert!((car.max_speed - 130.0 / 3.6).abs() < 1e-9);

        let foot = builder.router("foot").unwrap();
        assert_eq!(foot.profile, RouterProfile::Pedestrian);
    }

    #[test]
    fn evaluates_nested_rules() {
        let builder = RoutingConfigurationBuilder::from_xml(ROUTING_XML.as_bytes()).unwrap();
        let config = builder.build("car", &HashMap::new());
        let router = &config.router;

        assert_speed(router, &[("highway", "primary")], 90.0);
        assert_speed(router, &[("highway", "primary"), ("maxspeed", "50")], 50.0);
        assert_speed(router, &[("highway", "residential"), ("maxspeed", "20")], 30.0);
        assert_speed(router, &[("highway", "track")], 45.0);

        assert!(router.accept_line(&road(&[("highway", "motorway")])));
        assert!(!router.accept_line(&road(&[("railway", "rail")])));
        assert_eq!(router.is_one_way(&road(&[("highway", "primary"), ("oneway", "yes")])), 1);
        assert_eq!(router.is_one_way(&road(&[("highway", "primary")])), 0);

        let mut params = HashMap::new();
        params.insert("avoid_motorway".to_string(), "true".to_string());
        let avoiding = builder.build("car", &params);
        assert!(!avoiding.router.accept_line(&road(&[("highway", "motorway")])));

        let foot = builder.build("foot", &HashMap::new());
        assert!(foot.router.accept_line(&road(&[("highway", "footway")])));
        assert!(!foot.router.accept_line(&road(&[("highway", "motorway")])));
    }

    #[test]
    fn router_attributes_override_global_ones() {
        let builder = RoutingConfigurationBuilder::from_xml(ROUTING_XML.as_bytes()).unwrap();
        let car = builder.build("car", &HashMap::new());
        assert_eq!(car.zoom_to_load, 15);
        assert!((car.heuristic_coefficient - 1.5).abs() < 1e-9);
        assert_eq!(car.memory_limit_mb, DEFAULT_MEMORY_LIMIT_MB);

        let foot = builder.build("foot", &HashMap::new());
        assert!((foot.heuristic_coefficient - 1.2).abs() < 1e-9);
    }

    #[test]
    fn unknown_router_falls_back() {
        let builder = RoutingConfigurationBuilder::from_xml(ROUTING_XML.as_bytes()).unwrap();
        assert_eq!(builder.build("boat", &HashMap::new()).router_name, "car");

        let empty = RoutingConfigurationBuilder::default();
        let config = empty.build("boat", &HashMap::new());
        assert_eq!(config.router_name, "car");
        assert_eq!(config.router.profile, RouterProfile::Car);
    }

    #[test]
    fn builtin_routers() {
        let builder = RoutingConfigurationBuilder::with_builtin();
        let bicycle = builder.build("bicycle", &HashMap::new());
        assert_eq!(bicycle.router.profile, RouterProfile::Bicycle);
        let pedestrian = builder.build("pedestrian", &HashMap::new());
        assert!(!pedestrian.router.restrictions_aware);
    }

    #[test]
    fn impassable_roads_reach_the_router() {
        let mut builder = RoutingConfigurationBuilder::with_builtin();
        builder.add_impassable_road(1, PointI::new(0, 0));
        let config = builder.build("car", &HashMap::new());
        assert!(!config.router.accept_line(&road(&[("highway", "primary")])));

        builder.remove_impassable_road(1);
        let config = builder.build("car", &HashMap::new());
        assert!(config.router.accept_line(&road(&[("highway", "primary")])));
    }

    #[test]
    fn invalid_documents() {
        let outside = r#"<osmand_routing_config><way attribute="access"><select value="1"/></way></osmand_routing_config>"#;
        assert!(matches!(
            RoutingConfigurationBuilder::from_xml(outside.as_bytes()),
            Err(Error::Config(_))
        ));

        let unknown = r#"<osmand_routing_config><routingProfile name="x"><way attribute="colour"/></routingProfile></osmand_routing_config>"#;
        assert!(matches!(
            RoutingConfigurationBuilder::from_xml(unknown.as_bytes()),
            Err(Error::Config(_))
        ));

        let broken = r#"<osmand_routing_config><routingProfile name="x"></osmand_routing_config>"#;
        assert!(RoutingConfigurationBuilder::from_xml(broken.as_bytes()).is_err());
    }
}
