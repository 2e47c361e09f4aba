// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use super::area::{AreaI, PointI};
use super::block_cache::{BlockRef, DataBlockCache, DataBlockId};
use super::cursor::{CodedCursor, WireType};
use super::info::{read_encoding_rule, MapSection};
use super::source::ObfFile;
use super::tree::{self, Foundation, TreeMetrics, TreeNode};
use super::{NeverAbort, ObfObjectId, QueryController};
use crate::Error;

const SECTION_FIELD_RULES: u32 = 4;

const BLOCK_FIELD_BASE_ID: u32 = 10;
const BLOCK_FIELD_DATA_OBJECTS: u32 = 12;
const BLOCK_FIELD_STRING_TABLE: u32 = 15;

const DATA_FIELD_COORDINATES: u32 = 1;
const DATA_FIELD_AREA_COORDINATES: u32 = 2;
const DATA_FIELD_INNER_POLYGON: u32 = 4;
const DATA_FIELD_ADDITIONAL_TYPES: u32 = 6;
const DATA_FIELD_TYPES: u32 = 7;
const DATA_FIELD_STRING_NAMES: u32 = 10;
const DATA_FIELD_ID: u32 = 12;

const STRING_TABLE_FIELD_S: u32 = 1;

const SHIFT_COORDINATES: u32 = 5;
const MASK_TO_READ: i32 = !((1 << SHIFT_COORDINATES) - 1);

/// Substituted for names referencing a string outside of the block's table.
pub const INVALID_STRING_MARKER: &str = "#INVALID STRING ID#";

/// Decoding table of a map section.
#[derive(Debug, Default, Clone)]
pub struct MapRules {
    rules: HashMap<u32, (String, String)>,
    pub name_rule: Option<u32>,
    pub ref_rule: Option<u32>,
    pub coastline_rule: Option<u32>,
    pub coastline_broken_rule: Option<u32>,
    pub land_rule: Option<u32>,
    pub oneway_rule: Option<u32>,
    pub oneway_reverse_rule: Option<u32>,
    pub positive_layers: HashSet<u32>,
    pub negative_layers: HashSet<u32>,
}

impl MapRules {
    pub fn insert(&mut self, id: u32, tag: &str, value: &str) {
        match (tag, value) {
            ("name", _) => self.name_rule = Some(id),
            ("ref", _) => self.ref_rule = Some(id),
            ("natural", "coastline") => self.coastline_rule = Some(id),
            ("natural", "land") => self.land_rule = Some(id),
            ("oneway", "yes") => self.oneway_rule = Some(id),
            ("oneway", "-1") => self.oneway_reverse_rule = Some(id),
            ("tunnel", v) if v != "no" => {
                self.negative_layers.insert(id);
            }
            ("bridge", v) if v != "no" => {
                self.positive_layers.insert(id);
            }
            ("layer", v) if !v.is_empty() && v != "0" => {
                if v.starts_with('-') {
                    self.negative_layers.insert(id);
                } else {
                    self.positive_layers.insert(id);
                }
            }
            _ => {}
        }
        self.rules.insert(id, (tag.to_string(), value.to_string()));
    }

    /// Adds the synthetic `natural=coastline_broken` and `natural=land` rules.
    pub fn finish(&mut self) {
        let mut free = self.rules.len() as u32 * 2 + 1;
        self.coastline_broken_rule = Some(free);
        self.insert(free, "natural", "coastline_broken");
        free += 1;
        if self.land_rule.is_none() {
            self.insert(free, "natural", "land");
        }
    }

    pub fn get(&self, id: u32) -> Option<(&str, &str)> {
        self.rules.get(&id).map(|(t, v)| (t.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }
}

/// Map object decoded from a map section.
#[derive(Debug, Clone)]
pub struct MapObject {
    pub id: ObfObjectId,
    pub section_runtime_id: u32,
    pub rules: Arc<MapRules>,
    pub types: Vec<u32>,
    pub extra_types: Vec<u32>,
    pub points: Vec<PointI>,
    pub inner_polygons: Vec<Vec<PointI>>,
    pub is_area: bool,
    pub bbox: AreaI,

    /// Captions, as `(rule id, text)` pairs in file order.
    pub names: Vec<(u32, String)>,
    pub foundation: Foundation,
}

impl MapObject {
    /// The main `name` caption, or an empty string.
    pub fn name(&self) -> &str {
        let Some(rule) = self.rules.name_rule else { return "" };
        self.names
            .iter()
            .find(|(r, _)| *r == rule)
            .map(|(_, n)| n.as_str())
            .unwrap_or("")
    }

    pub fn is_closed(&self) -> bool {
        match (self.points.first(), self.points.last()) {
            (Some(a), Some(b)) => self.points.len() > 2 && a == b,
            _ => false,
        }
    }

    pub fn contains_type(&self, tag: &str, value: &str) -> bool {
        self.types
            .iter()
            .chain(self.extra_types.iter())
            .filter_map(|&t| self.rules.get(t))
            .any(|(t, v)| t == tag && v == value)
    }

    /// Type rules as `(tag, value)` pairs.
    pub fn type_pairs(&self) -> impl Iterator<Item = (&str, &str)> + '_ {
        self.types.iter().filter_map(|&t| self.rules.get(t))
    }
}

/// Objects of one decoded data block, shared through the [DataBlockCache].
pub type MapBlock = Vec<Arc<MapObject>>;

/// Parameters of [load_map_objects].
pub struct MapQuery<'a> {
    pub zoom: u8,
    pub bbox: Option<AreaI>,

    /// Objects for which the filter returns false are skipped.
    pub filter: Option<&'a dyn Fn(&MapObject) -> bool>,

    /// Called for every accepted object; returning false drops the object from the result.
    pub visitor: Option<&'a dyn Fn(&MapObject) -> bool>,
    pub controller: &'a dyn QueryController,
    pub cache: Option<&'a DataBlockCache<MapBlock>>,
}

impl<'a> MapQuery<'a> {
    pub fn new(zoom: u8) -> Self {
        Self {
            zoom,
            bbox: None,
            filter: None,
            visitor: None,
            controller: &NeverAbort,
            cache: None,
        }
    }

    pub fn with_bbox(mut self, bbox: AreaI) -> Self {
        self.bbox = Some(bbox);
        self
    }

    pub fn with_cache(mut self, cache: &'a DataBlockCache<MapBlock>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_controller(mut self, controller: &'a dyn QueryController) -> Self {
        self.controller = controller;
        self
    }
}

/// Outcome of [load_map_objects]. Held cache blocks are released when this is dropped.
#[derive(Debug, Default)]
pub struct MapQueryResult {
    pub objects: Vec<Arc<MapObject>>,
    pub foundation: Foundation,
    pub metrics: TreeMetrics,
    blocks: Vec<BlockRef<MapBlock>>,
}

impl MapQueryResult {
    /// Number of data blocks referenced from the block cache.
    pub fn referenced_blocks(&self) -> usize {
        self.blocks.len()
    }
}

impl MapSection {
    /// Encoding rules of the section, read once on first use.
    pub fn map_rules(&self, file: &ObfFile) -> Result<Arc<MapRules>, Error> {
        self.rules
            .get_or_try_init(|| read_map_rules(file, self.offset, self.length).map(Arc::new))
            .cloned()
    }
}

fn read_map_rules(file: &ObfFile, offset: usize, length: usize) -> Result<MapRules, Error> {
    let mut c = file.cursor();
    c.seek(offset)?;
    let old = c.push_limit(length)?;

    let mut rules = MapRules::default();
    let mut next_id = 1;
    while let Some(tag) = c.read_tag()? {
        if tag.field == SECTION_FIELD_RULES && tag.wire_type == WireType::LengthDelimited {
            let (id, tag, value) = c.with_length_limit(|c| read_encoding_rule(c, next_id))?;
            rules.insert(id, &tag, &value);
            next_id += 1;
        } else {
            c.skip_unknown_field(tag)?;
        }
    }

    c.pop_limit(old);
    rules.finish();
    Ok(rules)
}

/// Loads all map objects of a section visible at `query.zoom` within `query.bbox`.
///
/// Objects crossing several data blocks are returned once. The query stops early,
/// returning what was gathered, once its controller reports an abort.
pub fn load_map_objects(
    file: &ObfFile,
    section: &MapSection,
    query: &MapQuery,
) -> Result<MapQueryResult, Error> {
    let rules = section.map_rules(file)?;
    let mut result = MapQueryResult::default();
    let mut seen = HashSet::new();
    let mut c = file.cursor();

    for level in &section.levels {
        if !level.covers_zoom(query.zoom) {
            continue;
        }
        if query.bbox.is_some_and(|b| !b.intersects(&level.area)) {
            continue;
        }

        let roots = level.root_nodes(file)?;
        let d = tree::collect_nodes_with_data(&mut c, roots, query.bbox.as_ref(), query.controller)?;
        result.metrics.visited += d.metrics.visited;
        result.metrics.accepted += d.metrics.accepted;
        result.foundation = result.foundation.merge(d.foundation);

        for node in &d.nodes {
            if query.controller.is_aborted() {
                return Ok(result);
            }
            let Some(data_offset) = node.data_offset else { continue };

            let id = DataBlockId {
                section_runtime_id: section.runtime_id,
                offset: data_offset,
            };

            let objects = match query.cache {
                Some(cache) if cache.should_cache_block(id, &node.area, query.bbox.as_ref()) => {
                    let block = cache.get_or_load(id, query.zoom, level.min_zoom..=level.max_zoom, || {
                        read_map_block(file, &rules, section.runtime_id, node, None)
                    })?;
                    let objects: Vec<_> = block
                        .iter()
                        .filter(|o| query.bbox.map_or(true, |b| b.intersects(&o.bbox)))
                        .cloned()
                        .collect();
                    result.blocks.push(block);
                    objects
                }
                _ => read_map_block(file, &rules, section.runtime_id, node, query.bbox.as_ref())?,
            };

            for obj in objects {
                if query.filter.is_some_and(|f| !f(&obj)) {
                    continue;
                }
                if query.visitor.is_some_and(|v| !v(&obj)) {
                    continue;
                }
                if seen.insert(obj.id) {
                    result.objects.push(obj);
                }
            }
        }
    }

    log::debug!(
        "map section {:?} zoom {}: {} object(s), {}/{} node(s) accepted",
        section.name,
        query.zoom,
        result.objects.len(),
        result.metrics.accepted,
        result.metrics.visited,
    );
    Ok(result)
}

/// Decodes the data block of a tree node. With a bbox, objects entirely
/// outside of it are skipped without being materialised.
pub(crate) fn read_map_block(
    file: &ObfFile,
    rules: &Arc<MapRules>,
    section_runtime_id: u32,
    node: &TreeNode,
    bbox: Option<&AreaI>,
) -> Result<MapBlock, Error> {
    let Some(data_offset) = node.data_offset else {
        return Ok(Vec::new());
    };

    let mut c = file.cursor();
    c.seek(data_offset)?;
    let length = c.read_length()?;
    let old = c.push_limit(length)?;

    let mut base_id: u64 = 0;
    let mut objects: Vec<(MapObject, Vec<(u32, u32)>)> = Vec::new();
    let mut strings: Vec<String> = Vec::new();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (BLOCK_FIELD_BASE_ID, WireType::Varint) => base_id = c.read_varint64()?,
            (BLOCK_FIELD_DATA_OBJECTS, WireType::LengthDelimited) => {
                let obj = c.with_length_limit(|c| read_map_object(c, node, bbox))?;
                if let Some((mut obj, names)) = obj {
                    let raw_id = (base_id as i64).wrapping_add(obj.id.0 as i64);
                    obj.id = ObfObjectId::from_raw(raw_id, section_runtime_id);
                    obj.section_runtime_id = section_runtime_id;
                    obj.rules = rules.clone();
                    obj.foundation = node.foundation;
                    objects.push((obj, names));
                }
            }
            (BLOCK_FIELD_STRING_TABLE, WireType::LengthDelimited) => {
                if objects.is_empty() {
                    c.skip_unknown_field(tag)?;
                } else {
                    strings = c.with_length_limit(read_string_table)?;
                }
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    c.pop_limit(old);

    let block = objects
        .into_iter()
        .map(|(mut obj, names)| {
            obj.names = resolve_names(&names, &strings, data_offset);
            Arc::new(obj)
        })
        .collect();
    Ok(block)
}

pub(crate) fn read_string_table(c: &mut CodedCursor) -> Result<Vec<String>, Error> {
    let mut strings = Vec::new();
    while let Some(tag) = c.read_tag()? {
        if tag.field == STRING_TABLE_FIELD_S && tag.wire_type == WireType::LengthDelimited {
            strings.push(c.read_string()?);
        } else {
            c.skip_unknown_field(tag)?;
        }
    }
    Ok(strings)
}

/// Replaces `(rule, string index)` placeholders with the strings of the block.
pub(crate) fn resolve_names(
    names: &[(u32, u32)],
    strings: &[String],
    block_offset: usize,
) -> Vec<(u32, String)> {
    names
        .iter()
        .map(|&(rule, idx)| match strings.get(idx as usize) {
            Some(s) => (rule, s.clone()),
            None => {
                log::warn!(
                    "block at {block_offset}: string id {idx} is outside of the table of {} string(s)",
                    strings.len(),
                );
                (rule, INVALID_STRING_MARKER.to_string())
            }
        })
        .collect()
}

/// Decodes delta-encoded points, starting from the masked node origin.
fn read_points(c: &mut CodedCursor, origin: &AreaI) -> Result<Vec<PointI>, Error> {
    let mut px = origin.left & MASK_TO_READ;
    let mut py = origin.top & MASK_TO_READ;
    let mut points = Vec::new();
    while c.bytes_until_limit() > 0 {
        let x = (c.read_sint32()? << SHIFT_COORDINATES).wrapping_add(px);
        let y = (c.read_sint32()? << SHIFT_COORDINATES).wrapping_add(py);
        points.push(PointI::new(x, y));
        px = x;
        py = y;
    }
    Ok(points)
}

fn read_packed_varints(c: &mut CodedCursor) -> Result<Vec<u32>, Error> {
    let mut values = Vec::new();
    while c.bytes_until_limit() > 0 {
        values.push(c.read_varint32()?);
    }
    Ok(values)
}

type PendingObject = (MapObject, Vec<(u32, u32)>);

fn read_map_object(
    c: &mut CodedCursor,
    node: &TreeNode,
    bbox: Option<&AreaI>,
) -> Result<Option<PendingObject>, Error> {
    let mut obj = MapObject {
        id: ObfObjectId(0),
        section_runtime_id: 0,
        rules: Arc::default(),
        types: Vec::new(),
        extra_types: Vec::new(),
        points: Vec::new(),
        inner_polygons: Vec::new(),
        is_area: false,
        bbox: AreaI::default(),
        names: Vec::new(),
        foundation: Foundation::Undefined,
    };
    let mut names = Vec::new();
    let block_offset = c.position();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (DATA_FIELD_COORDINATES | DATA_FIELD_AREA_COORDINATES, WireType::LengthDelimited) => {
                obj.is_area = tag.field == DATA_FIELD_AREA_COORDINATES;
                obj.points = c.with_length_limit(|c| read_points(c, &node.area))?;

                let Some(first) = obj.points.first() else { continue };
                obj.bbox = AreaI::new(first.x, first.y, first.x, first.y);
                obj.points.iter().for_each(|p| obj.bbox.enlarge_to_include_point(p.x, p.y));

                if let Some(bbox) = bbox {
                    let contains = obj.points.iter().any(|p| bbox.contains_point(p.x, p.y))
                        || bbox.intersects(&obj.bbox);
                    if !contains {
                        return Ok(None);
                    }
                }
            }
            (DATA_FIELD_INNER_POLYGON, WireType::LengthDelimited) => {
                let polygon = c.with_length_limit(|c| read_points(c, &node.area))?;
                obj.inner_polygons.push(polygon);
            }
            (DATA_FIELD_ADDITIONAL_TYPES, WireType::LengthDelimited) => {
                obj.extra_types = c.with_length_limit(read_packed_varints)?;
            }
            (DATA_FIELD_TYPES, WireType::LengthDelimited) => {
                obj.types = c.with_length_limit(read_packed_varints)?;
            }
            (DATA_FIELD_STRING_NAMES, WireType::LengthDelimited) => {
                let raw = c.with_length_limit(read_packed_varints)?;
                names.extend(raw.chunks_exact(2).map(|p| (p[0], p[1])));
            }
            (DATA_FIELD_ID, WireType::Varint) => obj.id = ObfObjectId(c.read_sint64()? as u64),
            _ => c.skip_unknown_field(tag)?,
        }
    }

    if obj.points.is_empty() {
        log::warn!("map object at {block_offset} has no points, dropping it");
        return Ok(None);
    }

    Ok(Some((obj, names)))
}
