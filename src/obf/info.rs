// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

use std::sync::Arc;

use super::area::AreaI;
use super::cursor::{CodedCursor, WireType};
use super::map::MapRules;
use super::road::RouteRules;
use super::routing::RouteSubregion;
use super::source::ObfFile;
use super::tree::{self, Foundation, TreeNode};
use super::{next_section_runtime_id, OnceLoad};
use crate::Error;

const FIELD_VERSION: u32 = 1;
const FIELD_TRANSPORT_INDEX: u32 = 4;
const FIELD_MAP_INDEX: u32 = 6;
const FIELD_ADDRESS_INDEX: u32 = 7;
const FIELD_POI_INDEX: u32 = 8;
const FIELD_ROUTING_INDEX: u32 = 9;
const FIELD_DATE_CREATED: u32 = 18;
const FIELD_VERSION_CONFIRM: u32 = 32;

const MAP_FIELD_NAME: u32 = 2;
const MAP_FIELD_LEVELS: u32 = 5;

const LEVEL_FIELD_MAX_ZOOM: u32 = 1;
const LEVEL_FIELD_MIN_ZOOM: u32 = 2;
const LEVEL_FIELD_LEFT: u32 = 3;
const LEVEL_FIELD_RIGHT: u32 = 4;
const LEVEL_FIELD_TOP: u32 = 5;
const LEVEL_FIELD_BOTTOM: u32 = 6;
const LEVEL_FIELD_BOXES: u32 = 7;

const ROUTING_FIELD_NAME: u32 = 1;
const ROUTING_FIELD_RULES: u32 = 2;
const ROUTING_FIELD_ROOT_BOXES: u32 = 3;
const ROUTING_FIELD_BASEMAP_BOXES: u32 = 4;

const RULE_FIELD_TAG: u32 = 3;
const RULE_FIELD_VALUE: u32 = 5;
const RULE_FIELD_ID: u32 = 7;

const OTHER_FIELD_NAME: u32 = 1;

/// Description of all sections of an OBF file.
#[derive(Debug, Default)]
pub struct ObfInfo {
    pub version: u32,
    pub date_created: u64,
    pub map_sections: Vec<Arc<MapSection>>,
    pub routing_sections: Vec<Arc<RoutingSection>>,
    pub poi_sections: Vec<OtherSection>,
    pub address_sections: Vec<OtherSection>,
    pub transport_sections: Vec<OtherSection>,
}

impl ObfInfo {
    pub fn is_basemap(&self) -> bool {
        self.map_sections.iter().any(|s| s.is_basemap)
    }
}

/// Map objects section. Encoding rules and level roots are loaded on first use.
#[derive(Debug)]
pub struct MapSection {
    pub runtime_id: u32,
    pub offset: usize,
    pub length: usize,
    pub name: String,
    pub is_basemap: bool,
    pub levels: Vec<MapLevel>,
    pub(crate) rules: OnceLoad<Arc<MapRules>>,
}

impl MapSection {
    pub fn new(offset: usize, length: usize, name: String, levels: Vec<MapLevel>) -> Self {
        Self {
            runtime_id: next_section_runtime_id(),
            offset,
            length,
            is_basemap: name.to_ascii_lowercase().contains("basemap"),
            name,
            levels,
            rules: OnceLoad::new(),
        }
    }
}

/// One zoom range of a map section, with its own tree.
#[derive(Debug)]
pub struct MapLevel {
    pub offset: usize,
    pub length: usize,
    pub min_zoom: u8,
    pub max_zoom: u8,
    pub area: AreaI,
    pub(crate) boxes_offset: Option<usize>,
    pub(crate) roots: OnceLoad<Vec<TreeNode>>,
}

impl MapLevel {
    pub fn new(offset: usize, length: usize, min_zoom: u8, max_zoom: u8, area: AreaI) -> Self {
        Self {
            offset,
            length,
            min_zoom,
            max_zoom,
            area,
            boxes_offset: None,
            roots: OnceLoad::new(),
        }
    }

    #[inline]
    pub fn covers_zoom(&self, zoom: u8) -> bool {
        self.min_zoom <= zoom && zoom <= self.max_zoom
    }

    /// Root tree nodes of the level, read once and kept afterwards.
    pub(crate) fn root_nodes(&self, file: &ObfFile) -> Result<&[TreeNode], Error> {
        self.roots
            .get_or_try_init(|| {
                let mut c = file.cursor();
                c.seek(self.offset)?;
                let old = c.push_limit(self.length)?;
                if let Some(boxes) = self.boxes_offset {
                    c.seek(boxes)?;
                }

                let mut roots = Vec::new();
                while let Some(tag) = c.read_tag()? {
                    if tag.field == LEVEL_FIELD_BOXES && tag.wire_type == WireType::Fixed32 {
                        let length = c.read_big_endian_int()? as usize;
                        roots.push(tree::read_node(&mut c, length, &self.area, Foundation::Undefined, true)?);
                    } else {
                        c.skip_unknown_field(tag)?;
                    }
                }

                c.pop_limit(old);
                Ok(roots)
            })
            .map(Vec::as_slice)
    }
}

/// Road network section.
#[derive(Debug)]
pub struct RoutingSection {
    pub runtime_id: u32,
    pub offset: usize,
    pub length: usize,
    pub name: String,
    pub rules: Arc<RouteRules>,
    pub subregions: Vec<RouteSubregion>,
    pub basemap_subregions: Vec<RouteSubregion>,
}

impl RoutingSection {
    pub fn new(offset: usize, length: usize, name: String, rules: Arc<RouteRules>) -> Self {
        Self {
            runtime_id: next_section_runtime_id(),
            offset,
            length,
            name,
            rules,
            subregions: Vec::new(),
            basemap_subregions: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OtherSectionKind {
    Poi,
    Address,
    Transport,
}

/// Header of a section which isn't decoded by this crate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OtherSection {
    pub kind: OtherSectionKind,
    pub offset: usize,
    pub length: usize,
    pub name: String,
}

/// Scans the top-level structure of an OBF file.
///
/// The file is rejected unless it ends with a `versionConfirm` field
/// equal to the leading `version`.
pub fn obtain_info(file: &ObfFile) -> Result<ObfInfo, Error> {
    let mut c = file.cursor();
    let mut info = ObfInfo::default();
    let mut confirm = None;

    while let Some(tag) = c.read_tag()? {
        match tag.field {
            FIELD_VERSION => info.version = c.read_varint32()?,
            FIELD_DATE_CREATED => info.date_created = c.read_varint64()?,
            FIELD_VERSION_CONFIRM => confirm = Some(c.read_varint32()?),

            FIELD_MAP_INDEX
            | FIELD_ROUTING_INDEX
            | FIELD_POI_INDEX
            | FIELD_ADDRESS_INDEX
            | FIELD_TRANSPORT_INDEX => {
                let length = c.read_big_endian_int()? as usize;
                let offset = c.position();
                let old = c.push_limit(length)?;

                match tag.field {
                    FIELD_MAP_INDEX => {
                        let s = read_map_section(&mut c, offset, length)?;
                        info.map_sections.push(Arc::new(s));
                    }
                    FIELD_ROUTING_INDEX => {
                        let s = read_routing_section(&mut c, offset, length)?;
                        info.routing_sections.push(Arc::new(s));
                    }
                    FIELD_POI_INDEX => info.poi_sections.push(read_other_section(
                        &mut c,
                        OtherSectionKind::Poi,
                        offset,
                        length,
                    )?),
                    FIELD_ADDRESS_INDEX => info.address_sections.push(read_other_section(
                        &mut c,
                        OtherSectionKind::Address,
                        offset,
                        length,
                    )?),
                    _ => info.transport_sections.push(read_other_section(
                        &mut c,
                        OtherSectionKind::Transport,
                        offset,
                        length,
                    )?),
                }

                c.pop_limit(old);
                c.seek(offset + length)?;
            }

            _ => c.skip_unknown_field(tag)?,
        }
    }

    match confirm {
        None => Err(Error::MissingVersionConfirm),
        Some(confirm) if confirm != info.version => Err(Error::VersionMismatch {
            version: info.version,
            confirm,
        }),
        Some(_) => {
            log::debug!(
                "{}: version {}, {} map section(s), {} routing section(s)",
                file.path().display(),
                info.version,
                info.map_sections.len(),
                info.routing_sections.len(),
            );
            Ok(info)
        }
    }
}

fn read_map_section(c: &mut CodedCursor, offset: usize, length: usize) -> Result<MapSection, Error> {
    let mut name = String::new();
    let mut levels = Vec::new();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (MAP_FIELD_NAME, WireType::LengthDelimited) => name = c.read_string()?,
            (MAP_FIELD_LEVELS, WireType::Fixed32) => {
                let level_length = c.read_big_endian_int()? as usize;
                let level_offset = c.position();
                let old = c.push_limit(level_length)?;
                levels.push(read_map_level(c, level_offset, level_length)?);
                c.skip_to_limit();
                c.pop_limit(old);
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    Ok(MapSection::new(offset, length, name, levels))
}

fn read_map_level(c: &mut CodedCursor, offset: usize, length: usize) -> Result<MapLevel, Error> {
    let mut level = MapLevel::new(offset, length, 0, 0, AreaI::default());

    loop {
        let tag_pos = c.position();
        let Some(tag) = c.read_tag()? else { break };
        match tag.field {
            LEVEL_FIELD_MAX_ZOOM => level.max_zoom = c.read_varint32()? as u8,
            LEVEL_FIELD_MIN_ZOOM => level.min_zoom = c.read_varint32()? as u8,
            LEVEL_FIELD_LEFT => level.area.left = c.read_varint32()? as i32,
            LEVEL_FIELD_RIGHT => level.area.right = c.read_varint32()? as i32,
            LEVEL_FIELD_TOP => level.area.top = c.read_varint32()? as i32,
            LEVEL_FIELD_BOTTOM => level.area.bottom = c.read_varint32()? as i32,
            LEVEL_FIELD_BOXES => {
                level.boxes_offset = Some(tag_pos);
                break;
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    Ok(level)
}

fn read_routing_section(
    c: &mut CodedCursor,
    offset: usize,
    length: usize,
) -> Result<RoutingSection, Error> {
    let mut name = String::new();
    let mut rules = RouteRules::new();
    let mut next_rule_id = 1;
    let mut roots = Vec::new();
    let mut basemap_roots = Vec::new();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (ROUTING_FIELD_NAME, WireType::LengthDelimited) => name = c.read_string()?,
            (ROUTING_FIELD_RULES, WireType::LengthDelimited) => {
                let (id, tag, value) = c.with_length_limit(|c| read_encoding_rule(c, next_rule_id))?;
                rules.insert(id, &tag, &value);
                next_rule_id = id.max(next_rule_id) + 1;
            }
            (ROUTING_FIELD_ROOT_BOXES | ROUTING_FIELD_BASEMAP_BOXES, WireType::Fixed32) => {
                let basemap = tag.field == ROUTING_FIELD_BASEMAP_BOXES;
                let node_length = c.read_big_endian_int()? as usize;
                let node = tree::read_node(c, node_length, &AreaI::default(), Foundation::Undefined, false)?;
                let sub = RouteSubregion::from_node(&node, basemap);
                if basemap {
                    basemap_roots.push(sub);
                } else {
                    roots.push(sub);
                }
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    let mut section = RoutingSection::new(offset, length, name, Arc::new(rules));
    section.subregions = roots;
    section.basemap_subregions = basemap_roots;
    Ok(section)
}

/// Reads one `tag=value` encoding rule message. Returns `(id, tag, value)`.
pub(crate) fn read_encoding_rule(
    c: &mut CodedCursor,
    default_id: u32,
) -> Result<(u32, String, String), Error> {
    let mut id = default_id;
    let mut tag_s = String::new();
    let mut value = String::new();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (RULE_FIELD_TAG, WireType::LengthDelimited) => tag_s = c.read_string()?,
            (RULE_FIELD_VALUE, WireType::LengthDelimited) => value = c.read_string()?,
            (RULE_FIELD_ID, WireType::Varint) => id = c.read_varint32()?,
            _ => c.skip_unknown_field(tag)?,
        }
    }

    Ok((id, tag_s, value))
}

fn read_other_section(
    c: &mut CodedCursor,
    kind: OtherSectionKind,
    offset: usize,
    length: usize,
) -> Result<OtherSection, Error> {
    let mut name = String::new();
    while let Some(tag) = c.read_tag()? {
        if tag.field == OTHER_FIELD_NAME && tag.wire_type == WireType::LengthDelimited {
            name = c.read_string()?;
            break;
        }
        c.skip_unknown_field(tag)?;
    }
    Ok(OtherSection {
        kind,
        offset,
        length,
        name,
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::obf::test_writer::ObfWriter;
    use crate::obf::tree::tests::{write_node, N};

    /// Writes a complete file around `body`, with matching version fields.
    pub fn write_file<F: FnOnce(&mut ObfWriter)>(version: u32, confirm: Option<u32>, body: F) -> Vec<u8> {
        let mut w = ObfWriter::default();
        w.uint32(FIELD_VERSION, version);
        w.uint64(FIELD_DATE_CREATED, 1_700_000_000_000);
        body(&mut w);
        if let Some(confirm) = confirm {
            w.uint32(FIELD_VERSION_CONFIRM, confirm);
        }
        w.finish()
    }

    pub fn write_rule(w: &mut ObfWriter, field: u32, tag: &str, value: &str, id: Option<u32>) {
        w.message(field, |w| {
            w.string(RULE_FIELD_TAG, tag);
            w.string(RULE_FIELD_VALUE, value);
            if let Some(id) = id {
                w.uint32(RULE_FIELD_ID, id);
            }
        });
    }

    #[test]
    fn reads_sections() {
        let data = write_file(2, Some(2), |w| {
            let pos = w.begin_be(FIELD_MAP_INDEX);
            w.string(MAP_FIELD_NAME, "Basemap_World");
            let level = w.begin_be(MAP_FIELD_LEVELS);
            w.uint32(LEVEL_FIELD_MAX_ZOOM, 11);
            w.uint32(LEVEL_FIELD_MIN_ZOOM, 5);
            w.uint32(LEVEL_FIELD_LEFT, 0);
            w.uint32(LEVEL_FIELD_RIGHT, 1000);
            w.uint32(LEVEL_FIELD_TOP, 0);
            w.uint32(LEVEL_FIELD_BOTTOM, 1000);
            write_node(w, &AreaI::new(0, 0, 1000, 1000), &N::leaf(AreaI::new(0, 0, 500, 500), 8));
            w.end_be(level);
            w.end_be(pos);

            let pos = w.begin_be(FIELD_ROUTING_INDEX);
            w.string(ROUTING_FIELD_NAME, "roads");
            write_rule(w, ROUTING_FIELD_RULES, "highway", "primary", None);
            write_rule(w, ROUTING_FIELD_RULES, "oneway", "yes", None);
            write_rule(w, ROUTING_FIELD_RULES, "name", "", Some(10));
            let root = w.begin_be(ROUTING_FIELD_ROOT_BOXES);
            w.sint32(1, 100);
            w.sint32(2, 900);
            w.sint32(3, 200);
            w.sint32(4, 800);
            w.end_be(root);
            w.end_be(pos);

            let pos = w.begin_be(FIELD_POI_INDEX);
            w.string(OTHER_FIELD_NAME, "pois");
            w.end_be(pos);
        });
        let file = ObfFile::from_bytes(data);
        let info = obtain_info(&file).unwrap();

        assert_eq!(info.version, 2);
        assert_eq!(info.date_created, 1_700_000_000_000);
        assert!(info.is_basemap());

        let map = &info.map_sections[0];
        assert_eq!(map.name, "Basemap_World");
        assert_eq!(map.levels.len(), 1);
        let level = &map.levels[0];
        assert_eq!((level.min_zoom, level.max_zoom), (5, 11));
        assert_eq!(level.area, AreaI::new(0, 0, 1000, 1000));
        assert!(level.covers_zoom(7) && !level.covers_zoom(12));

        let roots = level.root_nodes(&file).unwrap();
        assert_eq!(roots.len(), 1);
        assert_eq!(roots[0].area, AreaI::new(0, 0, 500, 500));

        let routing = &info.routing_sections[0];
        assert_eq!(routing.name, "roads");
        assert_eq!(routing.rules.get(1).unwrap().tag, "highway");
        assert_eq!(routing.rules.get(2).unwrap().oneway_direction(), 1);
        assert_eq!(routing.rules.name_rule, Some(10));
        assert_eq!(routing.subregions.len(), 1);
        assert_eq!(routing.subregions[0].area, AreaI::new(100, 200, 900, 800));
        assert!(routing.basemap_subregions.is_empty());
        assert_ne!(routing.runtime_id, map.runtime_id);

        assert_eq!(info.poi_sections[0].name, "pois");
        assert_eq!(info.poi_sections[0].kind, OtherSectionKind::Poi);
    }

    #[test]
    fn version_confirm_is_required() {
        let file = ObfFile::from_bytes(write_file(2, Some(3), |_| {}));
        assert!(matches!(
            obtain_info(&file),
            Err(Error::VersionMismatch { version: 2, confirm: 3 })
        ));

        let file = ObfFile::from_bytes(write_file(2, None, |_| {}));
        assert!(matches!(obtain_info(&file), Err(Error::MissingVersionConfirm)));
    }

    #[test]
    fn truncated_section_is_fatal() {
        let mut data = write_file(2, Some(2), |w| {
            let pos = w.begin_be(FIELD_POI_INDEX);
            w.string(OTHER_FIELD_NAME, "pois");
            w.end_be(pos);
        });
        // Claim a much longer section than what's in the file
        let len_pos = data.iter().position(|&b| b == ((FIELD_POI_INDEX << 3) | 5) as u8).unwrap() + 1;
        data[len_pos..len_pos + 4].copy_from_slice(&1000u32.to_be_bytes());
        let file = ObfFile::from_bytes(data);
        assert!(obtain_info(&file).is_err());
    }
}
