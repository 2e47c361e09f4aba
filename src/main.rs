// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::{BTreeMap, HashMap};
use std::error::Error;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use clap::{Parser, Subcommand};
use obfroute::obf::{self, AreaI, FileFormat, MapQuery, ObfFile, PointI};
use obfroute::routing::{
    ObfRouteSource, RouteCalculationMode, RoutePlanner, RouteSegmentResult, RoutingConfigurationBuilder,
    RoutingContext,
};

#[derive(Debug, thiserror::Error)]
#[error("{0}: {1}")]
struct FileLoadError(PathBuf, #[source] obfroute::Error);

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Calculates a route and prints it as GeoJSON
    Route {
        /// OBF files with the road network
        #[arg(required = true)]
        files: Vec<PathBuf>,

        /// Start point, as "LAT,LON"
        #[arg(long, value_parser = parse_lat_lon)]
        start: (f64, f64),

        /// End point, as "LAT,LON"
        #[arg(long, value_parser = parse_lat_lon)]
        end: (f64, f64),

        /// Intermediate points, as "LAT,LON"
        #[arg(long, value_parser = parse_lat_lon)]
        via: Vec<(f64, f64)>,

        /// Router profile name
        #[arg(long, default_value = "car")]
        profile: String,

        /// Path to a routing.xml file; built-in profiles are used without it
        #[arg(long)]
        config: Option<PathBuf>,

        /// Guide long routes with a basemap pre-calculation
        #[arg(long)]
        complex: bool,
    },

    /// Prints the sections of an OBF file
    Info {
        file: PathBuf,
    },

    /// Counts map objects per type
    Map {
        file: PathBuf,

        /// Zoom level of the query
        #[arg(long, default_value_t = 15)]
        zoom: u8,

        /// Query box, as "MIN_LAT,MIN_LON,MAX_LAT,MAX_LON"
        #[arg(long, value_parser = parse_bbox)]
        bbox: Option<AreaI>,
    },
}

fn parse_lat_lon(s: &str) -> Result<(f64, f64), String> {
    let (lat, lon) = s.split_once(',').ok_or_else(|| format!("expected LAT,LON, got {s:?}"))?;
    let lat: f64 = lat.trim().parse().map_err(|e| format!("invalid latitude: {e}"))?;
    let lon: f64 = lon.trim().parse().map_err(|e| format!("invalid longitude: {e}"))?;
    Ok((lat, lon))
}

fn parse_bbox(s: &str) -> Result<AreaI, String> {
    let parts = s
        .split(',')
        .map(|p| p.trim().parse::<f64>().map_err(|e| e.to_string()))
        .collect::<Result<Vec<_>, _>>()?;
    let &[min_lat, min_lon, max_lat, max_lon] = parts.as_slice() else {
        return Err(format!("expected MIN_LAT,MIN_LON,MAX_LAT,MAX_LON, got {s:?}"));
    };
    let a = PointI::from_lat_lon(max_lat, min_lon);
    let b = PointI::from_lat_lon(min_lat, max_lon);
    Ok(AreaI::from_points(a, b))
}

pub fn main() -> Result<(), Box<dyn Error>> {
    colog::init();
    let cli = Cli::parse();

    match cli.command {
        Command::Route {
            files,
            start,
            end,
            via,
            profile,
            config,
            complex,
        } => route(&files, start, end, &via, &profile, config.as_deref(), complex),
        Command::Info { file } => info(&file),
        Command::Map { file, zoom, bbox } => map(&file, zoom, bbox),
    }
}

fn open_file(path: &Path) -> Result<ObfFile, FileLoadError> {
    ObfFile::open(path, FileFormat::Unknown).map_err(|e| FileLoadError(path.to_path_buf(), e))
}

fn route(
    files: &[PathBuf],
    start: (f64, f64),
    end: (f64, f64),
    via: &[(f64, f64)],
    profile: &str,
    config: Option<&Path>,
    complex: bool,
) -> Result<(), Box<dyn Error>> {
    let mut source = ObfRouteSource::default();
    for path in files {
        let file = open_file(path)?;
        let sections = source
            .add_file(file)
            .map_err(|e| FileLoadError(path.clone(), e))?;
        log::info!("{}: {} routing section(s)", path.display(), sections);
    }

    let builder = match config {
        Some(path) => RoutingConfigurationBuilder::open(path).map_err(|e| FileLoadError(path.to_path_buf(), e))?,
        None => RoutingConfigurationBuilder::with_builtin(),
    };
    let config = builder.build(profile, &HashMap::new());
    let mode = if complex {
        RouteCalculationMode::Complex
    } else {
        RouteCalculationMode::Normal
    };
    let mut ctx = RoutingContext::new(config, Arc::new(source), mode);

    let start = PointI::from_lat_lon(start.0, start.1);
    let end = PointI::from_lat_lon(end.0, end.1);
    let via: Vec<PointI> = via.iter().map(|&(lat, lon)| PointI::from_lat_lon(lat, lon)).collect();

    let route = RoutePlanner::new().search_route(&mut ctx, start, end, &via, None)?;
    if route.is_empty() {
        return Err(match ctx.progress.segment_not_found() {
            Some(i) => format!("point {i} is not near any road").into(),
            None => "no route found".into(),
        });
    }

    print_geojson(&route);
    Ok(())
}

fn json_string(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for c in s.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if (c as u32) < 0x20 => out.push_str(&format!("\\u{:04x}", c as u32)),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

fn print_geojson(route: &[RouteSegmentResult]) {
    println!("{{");
    println!("  \"type\": \"FeatureCollection\",");
    println!("  \"features\": [");

    let mut segments = route.iter().peekable();
    while let Some(seg) = segments.next() {
        let turn = seg.turn_type.as_ref().map(|t| t.to_string()).unwrap_or_default();
        println!("    {{");
        println!("      \"type\": \"Feature\",");
        println!("      \"properties\": {{");
        println!("        \"road_id\": {},", seg.object.id);
        println!("        \"name\": {},", json_string(seg.object.name()));
        println!("        \"distance\": {:.1},", seg.distance);
        println!("        \"time\": {:.1},", seg.segment_time);
        println!("        \"turn\": {}", json_string(&turn));
        println!("      }},");
        println!("      \"geometry\": {{");
        println!("        \"type\": \"LineString\",");
        println!("        \"coordinates\": [");

        let mut points = seg.points().peekable();
        while let Some(p) = points.next() {
            let (lat, lon) = p.lat_lon();
            let suffix = if points.peek().is_some() { "," } else { "" };
            println!("          [{lon:.7}, {lat:.7}]{suffix}");
        }

        println!("        ]");
        println!("      }}");
        let suffix = if segments.peek().is_some() { "," } else { "" };
        println!("    }}{suffix}");
    }

    println!("  ]");
    println!("}}");
}

fn info(path: &Path) -> Result<(), Box<dyn Error>> {
    let file = open_file(path)?;
    let info = obf::obtain_info(&file).map_err(|e| FileLoadError(path.to_path_buf(), e))?;

    println!("version: {}", info.version);
    println!("date created: {}", info.date_created);
    for s in &info.map_sections {
        println!(
            "map section {:?} (offset {}, length {}{})",
            s.name,
            s.offset,
            s.length,
            if s.is_basemap { ", basemap" } else { "" },
        );
        for l in &s.levels {
            println!("  zoom {}-{}: {:?}", l.min_zoom, l.max_zoom, l.area);
        }
    }
    for s in &info.routing_sections {
        println!(
            "routing section {:?} (offset {}, length {}): {} rules, {} subregions, {} basemap subregions",
            s.name,
            s.offset,
            s.length,
            s.rules.len(),
            s.subregions.len(),
            s.basemap_subregions.len(),
        );
    }
    for s in info
        .poi_sections
        .iter()
        .chain(&info.address_sections)
        .chain(&info.transport_sections)
    {
        println!("{:?} section {:?} (offset {}, length {})", s.kind, s.name, s.offset, s.length);
    }
    Ok(())
}

fn map(path: &Path, zoom: u8, bbox: Option<AreaI>) -> Result<(), Box<dyn Error>> {
    let file = open_file(path)?;
    let info = obf::obtain_info(&file).map_err(|e| FileLoadError(path.to_path_buf(), e))?;

    let mut query = MapQuery::new(zoom);
    if let Some(bbox) = bbox {
        query = query.with_bbox(bbox);
    }

    let mut counts: BTreeMap<String, usize> = BTreeMap::new();
    let mut total = 0;
    for section in &info.map_sections {
        let result = obf::load_map_objects(&file, section, &query).map_err(|e| FileLoadError(path.to_path_buf(), e))?;
        total += result.objects.len();
        for o in &result.objects {
            let key = match o.type_pairs().next() {
                Some((tag, value)) => format!("{tag}={value}"),
                None => String::from("(untyped)"),
            };
            *counts.entry(key).or_default() += 1;
        }
    }

    for (t, n) in &counts {
        println!("{n:>8} {t}");
    }
    println!("{total:>8} total");
    Ok(())
}
