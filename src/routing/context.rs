// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Road graph adapter: loads road tiles on demand, indexes roads by their
//! points and evicts unused tiles when the memory budget runs out.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::ops::Deref;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use super::config::RoutingConfiguration;
use super::precalculated::PrecalculatedRouteDirection;
use super::progress::RouteCalculationProgress;
use super::segment::RoadPoint;
use crate::geo::pack_point;
use crate::obf::block_cache::BlockRef;
use crate::obf::routing::{load_subregion_roads_cached, RoadBlock};
use crate::obf::{
    obtain_info, search_subregions, AreaI, DataBlockCache, DataBlockId, ObfFile, PointI, RouteDataObject,
    RouteSubregion, RoutingSection,
};
use crate::Error;

/// Number of road blocks kept by [ObfRouteSource] once no context uses them.
pub const DEFAULT_BLOCK_CACHE_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RouteCalculationMode {
    /// Search over the coarse basemap roads only.
    Base,
    #[default]
    Normal,

    /// Guide long detailed searches by a basemap route.
    Complex,
}

/// A subregion with road data, as reported by a [RouteDataSource].
#[derive(Debug, Clone)]
pub struct SubregionRef {
    pub id: DataBlockId,
    pub area: AreaI,

    /// Position of the owning file in the source.
    pub source_index: usize,
    pub header: RouteSubregion,
}

/// Decoded roads of a subregion.
#[derive(Debug)]
pub enum TileRoads {
    Cached(BlockRef<RoadBlock>),
    Owned(Arc<RoadBlock>),
}

impl Deref for TileRoads {
    type Target = RoadBlock;

    fn deref(&self) -> &RoadBlock {
        match self {
            TileRoads::Cached(r) => r,
            TileRoads::Owned(r) => r,
        }
    }
}

/// Provider of road data for a [RoutingContext].
pub trait RouteDataSource: Send + Sync + fmt::Debug {
    /// Subregions with data intersecting `bbox`, in the basemap or detailed trees.
    fn search_subregions(&self, bbox: &AreaI, basemap: bool) -> Result<Vec<SubregionRef>, Error>;

    /// Decodes the roads of a subregion returned by [RouteDataSource::search_subregions].
    fn load_roads(&self, subregion: &SubregionRef, zoom: u8) -> Result<TileRoads, Error>;
}

/// Road data of OBF files, with decoded blocks shared through a [DataBlockCache].
pub struct ObfRouteSource {
    sections: Vec<(ObfFile, Arc<RoutingSection>)>,
    cache: DataBlockCache<RoadBlock>,
}

impl fmt::Debug for ObfRouteSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObfRouteSource")
            .field("sections", &self.sections.len())
            .field("cached_blocks", &self.cache.len())
            .finish()
    }
}

impl Default for ObfRouteSource {
    fn default() -> Self {
        Self::new(DataBlockCache::new(DEFAULT_BLOCK_CACHE_CAPACITY))
    }
}

impl ObfRouteSource {
    pub fn new(cache: DataBlockCache<RoadBlock>) -> Self {
        Self {
            sections: Vec::new(),
            cache,
        }
    }

    /// Registers all routing sections of a file. Returns the number of sections found.
    pub fn add_file(&mut self, file: ObfFile) -> Result<usize, Error> {
        let info = obtain_info(&file)?;
        let n = info.routing_sections.len();
        for section in info.routing_sections {
            log::debug!("{}: routing section {:?}", file.file_name(), section.name);
            self.sections.push((file.clone(), section));
        }
        Ok(n)
    }

    pub fn add_section(&mut self, file: ObfFile, section: Arc<RoutingSection>) {
        self.sections.push((file, section));
    }

    pub fn is_empty(&self) -> bool {
        self.sections.is_empty()
    }
}

impl RouteDataSource for ObfRouteSource {
    fn search_subregions(&self, bbox: &AreaI, basemap: bool) -> Result<Vec<SubregionRef>, Error> {
        let mut found = Vec::new();
        for (i, (file, section)) in self.sections.iter().enumerate() {
            for sub in search_subregions(file, section, basemap, bbox)? {
                if let Some(id) = sub.block_id(section) {
                    found.push(SubregionRef {
                        id,
                        area: sub.area,
                        source_index: i,
                        header: sub,
                    });
                }
            }
        }
        Ok(found)
    }

    fn load_roads(&self, subregion: &SubregionRef, zoom: u8) -> Result<TileRoads, Error> {
        let (file, section) = &self.sections[subregion.source_index];
        match load_subregion_roads_cached(file, section, &subregion.header, zoom, &self.cache)? {
            Some(r) => Ok(TileRoads::Cached(r)),
            None => Ok(TileRoads::Owned(Arc::new(Vec::new()))),
        }
    }
}

/// Road data held in memory, mostly for tests and synthetic networks.
#[derive(Debug, Default)]
pub struct MemoryRouteSource {
    blocks: Vec<(AreaI, bool, Arc<RoadBlock>)>,
    loads: AtomicUsize,
}

impl MemoryRouteSource {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a block of roads covering `area`.
    pub fn add_block(&mut self, area: AreaI, basemap: bool, roads: Vec<RouteDataObject>) {
        let roads = roads.into_iter().map(Arc::new).collect();
        self.blocks.push((area, basemap, Arc::new(roads)));
    }

    /// Number of [RouteDataSource::load_roads] calls so far.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }
}

impl RouteDataSource for MemoryRouteSource {
    fn search_subregions(&self, bbox: &AreaI, basemap: bool) -> Result<Vec<SubregionRef>, Error> {
        Ok(self
            .blocks
            .iter()
            .enumerate()
            .filter(|(_, (area, b, _))| *b == basemap && area.intersects(bbox))
            .map(|(i, (area, b, _))| SubregionRef {
                id: DataBlockId {
                    section_runtime_id: 0,
                    offset: i,
                },
                area: *area,
                source_index: 0,
                header: RouteSubregion {
                    offset: 0,
                    length: 0,
                    area: *area,
                    data_offset: Some(i),
                    basemap: *b,
                },
            })
            .collect())
    }

    fn load_roads(&self, subregion: &SubregionRef, _zoom: u8) -> Result<TileRoads, Error> {
        self.loads.fetch_add(1, Ordering::Relaxed);
        let roads = self
            .blocks
            .get(subregion.id.offset)
            .map(|(_, _, r)| Arc::clone(r))
            .unwrap_or_default();
        Ok(TileRoads::Owned(roads))
    }
}

/// Roads of a loaded subregion, indexed by packed point coordinates.
#[derive(Debug)]
struct LoadedTile {
    roads: TileRoads,

    /// Packed point → (index in `roads`, point index).
    routes: HashMap<u64, Vec<(usize, usize)>>,

    /// Indices of roads accepted by the router.
    accepted: Vec<usize>,

    /// Ids of roads rejected by the router.
    excluded: HashSet<i64>,
    size: usize,
}

#[derive(Debug, Clone)]
struct SubregionTile {
    subregion: SubregionRef,

    /// Positive when loaded; the absolute value counts loads.
    loaded: i32,
    access: u32,
    data: Option<Arc<LoadedTile>>,
}

impl SubregionTile {
    fn new(subregion: SubregionRef) -> Self {
        Self {
            subregion,
            loaded: 0,
            access: 0,
            data: None,
        }
    }

    #[inline]
    fn is_loaded(&self) -> bool {
        self.loaded > 0
    }

    fn unload_count(&self) -> i32 {
        self.loaded.abs()
    }

    fn set_loaded(&mut self, data: LoadedTile) {
        self.loaded = self.loaded.abs() + 1;
        self.data = Some(Arc::new(data));
    }

    fn unload(&mut self) {
        self.loaded = -self.loaded.abs();
        self.data = None;
    }

    fn size(&self) -> usize {
        self.data.as_ref().map_or(0, |d| d.size)
    }

    /// Whether a live [SegmentChain] (or another context) holds the tile.
    fn is_pinned(&self) -> bool {
        self.data.as_ref().is_some_and(|d| Arc::strong_count(d) > 1)
    }

    /// Eviction score; tiles with lower scores are evicted first.
    fn eviction_score(&self) -> f64 {
        (self.access as f64 + 1.0) * 10f64.powi(self.unload_count() - 1)
    }
}

/// Roads passing through a single point. Holds the tiles they come from
/// loaded for as long as the chain lives.
#[derive(Debug)]
pub struct SegmentChain {
    pub roads: Vec<RoadPoint>,
    _tiles: Vec<Arc<LoadedTile>>,
}

impl Deref for SegmentChain {
    type Target = [RoadPoint];

    fn deref(&self) -> &[RoadPoint] {
        &self.roads
    }
}

/// State shared by all searches of one route calculation: configuration,
/// loaded road tiles and progress.
#[derive(Debug)]
pub struct RoutingContext {
    pub config: RoutingConfiguration,
    pub calculation_mode: RouteCalculationMode,
    pub progress: Arc<RouteCalculationProgress>,
    pub left_side_navigation: bool,

    pub start: Option<PointI>,
    pub target: Option<PointI>,
    pub precalculated_route_direction: Option<PrecalculatedRouteDirection>,

    source: Arc<dyn RouteDataSource>,
    basemap: bool,
    memory_limit: usize,

    tiles: Vec<SubregionTile>,
    tile_by_block: HashMap<DataBlockId, usize>,
    indexed_tiles: HashMap<i64, Vec<usize>>,
}

impl RoutingContext {
    pub fn new(config: RoutingConfiguration, source: Arc<dyn RouteDataSource>, mode: RouteCalculationMode) -> Self {
        let memory_limit = config.memory_limit_mb.saturating_mul(1024 * 1024);
        Self {
            config,
            calculation_mode: mode,
            progress: Arc::new(RouteCalculationProgress::new()),
            left_side_navigation: false,
            start: None,
            target: None,
            precalculated_route_direction: None,
            source,
            basemap: mode == RouteCalculationMode::Base,
            memory_limit,
            tiles: Vec::new(),
            tile_by_block: HashMap::new(),
            indexed_tiles: HashMap::new(),
        }
    }

    /// A context for a sub-search sharing configuration, data source, progress
    /// and already loaded tiles with `self`.
    pub fn fork(&self, mode: RouteCalculationMode) -> Self {
        let basemap = mode == RouteCalculationMode::Base;
        let mut forked = Self {
            config: self.config.clone(),
            calculation_mode: mode,
            progress: Arc::clone(&self.progress),
            left_side_navigation: self.left_side_navigation,
            start: None,
            target: None,
            precalculated_route_direction: None,
            source: Arc::clone(&self.source),
            basemap,
            memory_limit: self.memory_limit,
            tiles: Vec::new(),
            tile_by_block: HashMap::new(),
            indexed_tiles: HashMap::new(),
        };

        // Basemap and detailed tiles come from different trees
        if basemap == self.basemap {
            forked.tiles = self.tiles.clone();
            forked.tile_by_block = self.tile_by_block.clone();
            forked.indexed_tiles = self.indexed_tiles.clone();
        }
        forked
    }

    #[inline]
    pub fn is_basemap(&self) -> bool {
        self.basemap
    }

    /// Memory budget of loaded tiles, in bytes.
    pub fn memory_limit(&self) -> usize {
        self.memory_limit
    }

    pub fn set_memory_limit(&mut self, bytes: usize) {
        self.memory_limit = bytes;
    }

    /// Estimated size (in bytes) of all loaded tiles.
    pub fn size(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_loaded()).map(SubregionTile::size).sum()
    }

    pub fn loaded_tiles(&self) -> usize {
        self.tiles.iter().filter(|t| t.is_loaded()).count()
    }

    /// Sets the endpoints of the next search, adopting the precalculated direction (if any) to them.
    pub fn init_start_and_target_points(&mut self, start: PointI, target: PointI) {
        self.start = Some(start);
        self.target = Some(target);
        if let Some(p) = self.precalculated_route_direction.take() {
            self.precalculated_route_direction = p.adopt(start, target, &self.config.router);
        }
    }

    /// Loads (if needed) all subregions covering the tile `(xloc, yloc)` at
    /// the configured zoom, and returns their indices.
    fn load_headers(&mut self, xloc: i32, yloc: i32) -> Result<Vec<usize>, Error> {
        let zoom = self.config.zoom_to_load;
        let tile_id = ((xloc as i64) << zoom) + yloc as i64;
        if let Some(indices) = self.indexed_tiles.get(&tile_id) {
            let indices = indices.clone();
            self.load_header_objects(&indices)?;
            return Ok(indices);
        }

        let bbox = AreaI::from_tile(zoom, xloc, yloc);
        let mut indices = Vec::new();
        for sub in self.source.search_subregions(&bbox, self.basemap)? {
            let idx = match self.tile_by_block.get(&sub.id) {
                Some(&i) => i,
                None => {
                    let i = self.tiles.len();
                    self.tile_by_block.insert(sub.id, i);
                    self.tiles.push(SubregionTile::new(sub));
                    i
                }
            };
            indices.push(idx);
        }
        self.indexed_tiles.insert(tile_id, indices.clone());
        self.load_header_objects(&indices)?;
        Ok(indices)
    }

    fn load_header_objects(&mut self, indices: &[usize]) -> Result<(), Error> {
        if indices.iter().all(|&i| self.tiles[i].is_loaded()) {
            return Ok(());
        }
        self.unload_unused_tiles();

        let mut excluded: HashSet<i64> = HashSet::new();
        for t in self.tiles.iter().filter(|t| t.is_loaded()) {
            if let Some(d) = &t.data {
                excluded.extend(d.excluded.iter().copied());
            }
        }

        let mut loaded = 0;
        for &i in indices {
            if self.tiles[i].is_loaded() {
                continue;
            }
            let roads = self.source.load_roads(&self.tiles[i].subregion, self.config.zoom_to_load)?;
            let data = self.index_roads(roads, &mut excluded);
            self.tiles[i].set_loaded(data);
            loaded += 1;
        }
        self.progress.add_loaded_tiles(loaded);
        Ok(())
    }

    fn index_roads(&self, roads: TileRoads, excluded: &mut HashSet<i64>) -> LoadedTile {
        let router = &self.config.router;
        let mut routes: HashMap<u64, Vec<(usize, usize)>> = HashMap::new();
        let mut accepted = Vec::new();
        let mut own_excluded = HashSet::new();
        let mut size = 0;

        for (idx, road) in roads.iter().enumerate() {
            if road.points.is_empty() {
                continue;
            }
            if router.accept_line(road) && !excluded.contains(&road.id) {
                for (j, p) in road.points.iter().enumerate() {
                    routes.entry(pack_point(p.x, p.y)).or_default().push((idx, j));
                }
                accepted.push(idx);
                size += road.estimated_size();
            } else if road.id > 0 {
                excluded.insert(road.id);
                own_excluded.insert(road.id);
            }
        }

        LoadedTile {
            roads,
            routes,
            accepted,
            excluded: own_excluded,
            size,
        }
    }

    /// Evicts tiles with the lowest scores once the loaded data takes more than
    /// 90% of the budget, until it takes less than 70%. Pinned tiles are kept.
    fn unload_unused_tiles(&mut self) {
        if self.memory_limit == 0 {
            return;
        }
        let size = self.size();
        let critical = self.memory_limit as f64 * 0.9;
        if (size as f64) < critical {
            return;
        }
        let desirable = self.memory_limit as f64 * 0.7;

        let mut candidates: Vec<usize> = (0..self.tiles.len())
            .filter(|&i| self.tiles[i].is_loaded() && !self.tiles[i].is_pinned())
            .collect();
        candidates.sort_by(|&a, &b| {
            self.tiles[a]
                .eviction_score()
                .total_cmp(&self.tiles[b].eviction_score())
        });

        let loaded = self.loaded_tiles();
        let mut current = size;
        let mut unloaded = 0;
        for i in candidates {
            if (current as f64) < desirable {
                break;
            }
            current -= self.tiles[i].size();
            self.tiles[i].unload();
            unloaded += 1;
        }

        for t in &mut self.tiles {
            t.access /= 3;
        }
        log::info!("Run GC (before {size} after {current} bytes) unload {unloaded} of {loaded} tiles");
    }

    /// Loads the tiles around a point, and returns the accepted roads in them.
    /// With `zoom_around` below the load zoom, a neighbourhood of tiles is loaded.
    pub fn load_tile_data(&mut self, x31: i32, y31: i32, zoom_around: u8) -> Result<Vec<Arc<RouteDataObject>>, Error> {
        let zoom_to_load = self.config.zoom_to_load;
        let (t, shift) = if zoom_to_load <= zoom_around {
            (1, 1i64 << (31 - zoom_around as u32))
        } else {
            (1i64 << (zoom_to_load - zoom_around), 1i64 << (31 - zoom_to_load as u32))
        };

        let mut indices = Vec::new();
        for i in -t..=t {
            for j in -t..=t {
                let x = x31 as i64 + i * shift;
                let y = y31 as i64 + j * shift;
                if !(0..=i32::MAX as i64).contains(&x) || !(0..=i32::MAX as i64).contains(&y) {
                    continue;
                }
                let xloc = (x >> (31 - zoom_to_load as u32)) as i32;
                let yloc = (y >> (31 - zoom_to_load as u32)) as i32;
                for idx in self.load_headers(xloc, yloc)? {
                    if !indices.contains(&idx) {
                        indices.push(idx);
                    }
                }
            }
        }

        let mut seen = HashSet::new();
        let mut roads = Vec::new();
        for idx in indices {
            let Some(data) = &self.tiles[idx].data else {
                continue;
            };
            for &r in &data.accepted {
                let road = &data.roads[r];
                if seen.insert(road.id) {
                    roads.push(Arc::clone(road));
                }
            }
        }
        Ok(roads)
    }

    /// All roads passing through the exact point `(x31, y31)`. A road loaded from
    /// several overlapping tiles is returned once, from the tile with its longest part.
    pub fn load_route_segment(&mut self, x31: i32, y31: i32) -> Result<SegmentChain, Error> {
        let z = 31 - self.config.zoom_to_load as u32;
        let indices = self.load_headers(x31 >> z, y31 >> z)?;
        let key = pack_point(x31, y31);

        let mut roads: Vec<RoadPoint> = Vec::new();
        let mut tiles = Vec::new();
        for idx in indices {
            let tile = &mut self.tiles[idx];
            tile.access += 1;
            let Some(data) = &tile.data else {
                continue;
            };
            let Some(list) = data.routes.get(&key) else {
                continue;
            };

            for &(r, point) in list {
                let road = &data.roads[r];
                let duplicate = roads
                    .iter()
                    .position(|rp| rp.road.id == road.id && !Arc::ptr_eq(&rp.road, road));
                match duplicate {
                    Some(pos) => {
                        if road.points.len() > roads[pos].road.points.len() {
                            roads[pos] = RoadPoint::new(Arc::clone(road), point);
                        }
                    }
                    None => roads.push(RoadPoint::new(Arc::clone(road), point)),
                }
            }
            tiles.push(Arc::clone(data));
        }

        Ok(SegmentChain { roads, _tiles: tiles })
    }

    /// Unloads every tile, except ones also loaded in `except`.
    pub fn unload_all_data(&mut self, except: Option<&RoutingContext>) {
        for t in &mut self.tiles {
            if !t.is_loaded() {
                continue;
            }
            let kept = except.is_some_and(|e| {
                e.tile_by_block
                    .get(&t.subregion.id)
                    .is_some_and(|&i| e.tiles[i].is_loaded())
            });
            if kept {
                t.data = None;
            } else {
                t.unload();
            }
        }
        self.tiles.clear();
        self.tile_by_block.clear();
        self.indexed_tiles.clear();
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::obf::road::tests::rules;
    use crate::obf::RouteRules;
    use crate::routing::router::car_router;

    /// Base of synthetic road networks: a point inside one zoom-16 tile neighbourhood.
    pub const BASE: i32 = 1 << 30;

    /// Rules shared by synthetic roads; `tags` are given as `(tag, value)` pairs.
    pub fn road_rules() -> Arc<RouteRules> {
        rules(&[
            ("highway", "primary"),
            ("oneway", "yes"),
            ("highway", "residential"),
            ("highway", "traffic_signals"),
            ("junction", "roundabout"),
            ("highway", "footway"),
            ("name", ""),
            ("highway", "stop"),
        ])
    }

    /// A road with the given `tag=value` types and points.
    pub fn road(id: i64, tags: &[(&str, &str)], points: &[(i32, i32)]) -> RouteDataObject {
        let rules = road_rules();
        let mut r = RouteDataObject::new(id, Arc::clone(&rules));
        r.types = tags.iter().filter_map(|(t, v)| rules.find(t, v)).collect();
        r.points = points.iter().map(|&(x, y)| PointI::new(BASE + x, BASE + y)).collect();
        r
    }

    pub fn context(source: MemoryRouteSource) -> RoutingContext {
        let config = RoutingConfiguration::new(car_router(), "car");
        RoutingContext::new(config, Arc::new(source), RouteCalculationMode::Normal)
    }

    fn tile_area(dx: i32) -> AreaI {
        let size = 1 << 15;
        AreaI::new(BASE + dx * size, BASE, BASE + (dx + 1) * size - 1, BASE + size - 1)
    }

    #[test]
    fn indexes_roads_by_point() {
        let mut source = MemoryRouteSource::new();
        source.add_block(
            tile_area(0),
            false,
            vec![
                road(1, &[("highway", "primary")], &[(0, 0), (100, 0)]),
                road(2, &[("highway", "primary")], &[(100, 0), (100, 100)]),
                road(3, &[("highway", "footway")], &[(100, 0), (200, 0)]),
            ],
        );
        let mut ctx = context(source);

        let chain = ctx.load_route_segment(BASE + 100, BASE).unwrap();
        let mut found: Vec<(i64, usize)> = chain.iter().map(|rp| (rp.road.id, rp.point)).collect();
        found.sort();
        // The footway isn't accepted by the car router
        assert_eq!(found, vec![(1, 1), (2, 0)]);
        assert_eq!(ctx.loaded_tiles(), 1);
        assert_eq!(ctx.progress.loaded_tiles(), 1);
    }

    #[test]
    fn duplicates_keep_the_longest_part() {
        let mut source = MemoryRouteSource::new();
        source.add_block(
            tile_area(0),
            false,
            vec![road(1, &[("highway", "primary")], &[(0, 0), (100, 0)])],
        );
        source.add_block(
            AreaI::new(BASE, BASE, BASE + 1000, BASE + 1000),
            false,
            vec![road(1, &[("highway", "primary")], &[(0, 0), (100, 0), (200, 0)])],
        );
        let mut ctx = context(source);

        let chain = ctx.load_route_segment(BASE + 100, BASE).unwrap();
        assert_eq!(chain.len(), 1);
        assert_eq!(chain[0].road.points.len(), 3);
        assert_eq!(chain[0].point, 1);
    }

    #[test]
    fn eviction_keeps_referenced_tiles() {
        let mut source = MemoryRouteSource::new();
        for dx in 0..4 {
            let x = dx * (1 << 15);
            source.add_block(
                tile_area(dx),
                false,
                vec![road(dx as i64 + 1, &[("highway", "primary")], &[(x, 0), (x + 100, 0)])],
            );
        }
        let mut ctx = context(source);

        let held = ctx.load_route_segment(BASE, BASE).unwrap();
        assert_eq!(held.len(), 1);
        for dx in 1..3 {
            ctx.load_route_segment(BASE + dx * (1 << 15), BASE).unwrap();
        }
        assert_eq!(ctx.loaded_tiles(), 3);

        // Budget which the three loaded tiles exceed
        let per_tile = ctx.size() / 3;
        let limit = per_tile * 3;
        ctx.set_memory_limit(limit);

        ctx.load_route_segment(BASE + 3 * (1 << 15), BASE).unwrap();

        // The held tile survives; enough others went away to get under 70% before loading
        let first = ctx.tile_by_block[&DataBlockId { section_runtime_id: 0, offset: 0 }];
        assert!(ctx.tiles[first].is_loaded());
        assert!(ctx.loaded_tiles() < 4);
        assert!(ctx.size() - per_tile <= (limit as f64 * 0.7) as usize);
        drop(held);
    }

    #[test]
    fn reloaded_tiles_are_evicted_last() {
        let sub = SubregionRef {
            id: DataBlockId {
                section_runtime_id: 0,
                offset: 0,
            },
            area: AreaI::default(),
            source_index: 0,
            header: RouteSubregion {
                offset: 0,
                length: 0,
                area: AreaI::default(),
                data_offset: Some(0),
                basemap: false,
            },
        };
        let empty = || LoadedTile {
            roads: TileRoads::Owned(Arc::new(Vec::new())),
            routes: HashMap::new(),
            accepted: Vec::new(),
            excluded: HashSet::new(),
            size: 0,
        };

        let mut t = SubregionTile::new(sub);
        t.set_loaded(empty());
        assert_eq!(t.eviction_score(), 1.0);
        t.unload();
        assert!(!t.is_loaded());
        t.set_loaded(empty());
        assert_eq!(t.unload_count(), 2);
        assert_eq!(t.eviction_score(), 10.0);
    }

    #[test]
    fn fork_shares_loaded_tiles() {
        let mut source = MemoryRouteSource::new();
        source.add_block(
            tile_area(0),
            false,
            vec![road(1, &[("highway", "primary")], &[(0, 0), (100, 0)])],
        );
        let source = Arc::new(source);
        let config = RoutingConfiguration::new(car_router(), "car");
        let mut parent = RoutingContext::new(config, source.clone(), RouteCalculationMode::Normal);
        parent.load_route_segment(BASE, BASE).unwrap();

        let mut child = parent.fork(RouteCalculationMode::Normal);
        assert_eq!(child.load_route_segment(BASE, BASE).unwrap().len(), 1);
        assert_eq!(source.loads(), 1);

        child.unload_all_data(Some(&parent));
        assert_eq!(child.loaded_tiles(), 0);
        assert_eq!(parent.loaded_tiles(), 1);
    }
}
