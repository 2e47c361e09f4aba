// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Route calculation over roads loaded lazily from OBF routing sections.
//!
//! A calculation starts with a [RoutingConfiguration] (router profile and search
//! tunables) and a [RoutingContext] over a [RouteDataSource]. [RoutePlanner::search_route]
//! then matches the requested points to roads, runs a bidirectional A* search for every
//! leg, and post-processes the result into [RouteSegmentResult]s with turn and
//! lane guidance.
//!
//! ```no_run
//! use std::sync::Arc;
//! use obfroute::obf::{FileFormat, ObfFile, PointI};
//! use obfroute::routing::{
//!     car_router, ObfRouteSource, RouteCalculationMode, RoutePlanner, RoutingConfiguration, RoutingContext,
//! };
//!
//! let mut source = ObfRouteSource::default();
//! let file = ObfFile::open("path/to/Monaco.obf", FileFormat::Unknown).expect("failed to open the map");
//! source.add_file(file).expect("failed to read the map");
//!
//! let config = RoutingConfiguration::new(car_router(), "car");
//! let mut ctx = RoutingContext::new(config, Arc::new(source), RouteCalculationMode::Normal);
//! let start = PointI::from_lat_lon(43.7384, 7.4246);
//! let end = PointI::from_lat_lon(43.7478, 7.4323);
//! let route = RoutePlanner::new().search_route(&mut ctx, start, end, &[], None).expect("failed to read roads");
//! for segment in &route {
//!     println!("{} {:.0} m", segment.object.name(), segment.distance);
//! }
//! ```

pub mod config;
pub mod context;
pub mod lanes;
pub mod planner;
pub mod precalculated;
pub mod preparation;
pub mod progress;
pub mod result;
pub mod router;
pub mod search;
pub mod segment;
pub mod turn;

pub use config::{RoutingConfiguration, RoutingConfigurationBuilder, DEVIATION_RADIUS};
pub use context::{MemoryRouteSource, ObfRouteSource, RouteCalculationMode, RouteDataSource, RoutingContext};
pub use planner::{find_route_segment, generate_straight_line_segment, RoutePlanner};
pub use precalculated::PrecalculatedRouteDirection;
pub use preparation::prepare_result;
pub use progress::RouteCalculationProgress;
pub use result::RouteSegmentResult;
pub use router::{bicycle_router, builtin_router, car_router, pedestrian_router, GeneralRouter, RouterProfile};
pub use search::{attach_connected_roads, search_route_internal};
pub use segment::{RoadPoint, RouteSegmentPoint};
pub use turn::{TurnKind, TurnType};
