// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Persisted summary of previously scanned OBF files.
//!
//! Scanning the top-level structure of a large collection of OBF files is slow,
//! so the headers of every file are stored in a protobuf message keyed by the
//! file's name and size. A cache written with a different [CachedIndexes::VERSION]
//! is discarded as a whole.

use std::io;
use std::sync::Arc;

use protobuf::{CodedInputStream, CodedOutputStream, UnknownFields};

use super::area::AreaI;
use super::info::{MapLevel, MapSection, ObfInfo, OtherSection, OtherSectionKind, RoutingSection};
use super::road::RouteRules;
use super::routing::RouteSubregion;
use crate::Error;

const STORED_FIELD_VERSION: u32 = 1;
const STORED_FIELD_FILE_INDEX: u32 = 7;
const STORED_FIELD_DATE_CREATED: u32 = 18;

const FILE_FIELD_SIZE: u32 = 1;
const FILE_FIELD_DATE_MODIFIED: u32 = 2;
const FILE_FIELD_FILE_NAME: u32 = 3;
const FILE_FIELD_VERSION: u32 = 4;
const FILE_FIELD_MAP_INDEX: u32 = 8;
const FILE_FIELD_ROUTING_INDEX: u32 = 9;
const FILE_FIELD_OTHER_INDEX: u32 = 10;

const PART_FIELD_SIZE: u32 = 1;
const PART_FIELD_OFFSET: u32 = 2;
const PART_FIELD_NAME: u32 = 3;
const PART_FIELD_CHILDREN: u32 = 5;
const PART_FIELD_RULES: u32 = 6;

const BOX_FIELD_SIZE: u32 = 1;
const BOX_FIELD_OFFSET: u32 = 2;
const BOX_FIELD_LEFT: u32 = 4;
const BOX_FIELD_RIGHT: u32 = 5;
const BOX_FIELD_TOP: u32 = 6;
const BOX_FIELD_BOTTOM: u32 = 7;
const BOX_FIELD_MIN_ZOOM: u32 = 8;
const BOX_FIELD_MAX_ZOOM: u32 = 9;
const BOX_FIELD_SHIFT_TO_DATA: u32 = 10;
const BOX_FIELD_BASEMAP: u32 = 11;

const RULE_FIELD_TAG: u32 = 1;
const RULE_FIELD_VALUE: u32 = 2;
const RULE_FIELD_ID: u32 = 3;

const OTHER_FIELD_KIND: u32 = 1;
const OTHER_FIELD_SIZE: u32 = 2;
const OTHER_FIELD_OFFSET: u32 = 3;
const OTHER_FIELD_NAME: u32 = 4;

#[derive(Debug, Clone)]
struct CachedFile {
    file_name: String,
    size: u64,
    version: u32,
    date_created: u64,
    map_sections: Vec<CachedMapSection>,
    routing_sections: Vec<CachedRoutingSection>,
    other_sections: Vec<OtherSection>,
}

#[derive(Debug, Clone)]
struct CachedMapSection {
    offset: usize,
    length: usize,
    name: String,
    levels: Vec<CachedMapLevel>,
}

#[derive(Debug, Clone, Copy)]
struct CachedMapLevel {
    offset: usize,
    length: usize,
    min_zoom: u8,
    max_zoom: u8,
    area: AreaI,
}

#[derive(Debug, Clone)]
struct CachedRoutingSection {
    offset: usize,
    length: usize,
    name: String,
    rules: Vec<(u32, String, String)>,
    subregions: Vec<RouteSubregion>,
}

/// Headers of scanned OBF files, persisted between runs.
#[derive(Debug, Clone, Default)]
pub struct CachedIndexes {
    date_created: u64,
    files: Vec<CachedFile>,
}

impl CachedIndexes {
    pub const VERSION: u32 = 2;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Records the headers of a scanned file, replacing any previous entry
    /// with the same name.
    pub fn add_to_cache(&mut self, file_name: &str, file_size: u64, info: &ObfInfo) {
        self.files.retain(|f| f.file_name != file_name);

        let map_sections = info
            .map_sections
            .iter()
            .map(|s| CachedMapSection {
                offset: s.offset,
                length: s.length,
                name: s.name.clone(),
                levels: s
                    .levels
                    .iter()
                    .map(|l| CachedMapLevel {
                        offset: l.offset,
                        length: l.length,
                        min_zoom: l.min_zoom,
                        max_zoom: l.max_zoom,
                        area: l.area,
                    })
                    .collect(),
            })
            .collect();

        let routing_sections = info
            .routing_sections
            .iter()
            .map(|s| CachedRoutingSection {
                offset: s.offset,
                length: s.length,
                name: s.name.clone(),
                rules: s
                    .rules
                    .iter()
                    .map(|(id, r)| (id, r.tag.clone(), r.value.clone()))
                    .collect(),
                subregions: s
                    .subregions
                    .iter()
                    .chain(s.basemap_subregions.iter())
                    .cloned()
                    .collect(),
            })
            .collect();

        let other_sections = info
            .poi_sections
            .iter()
            .chain(info.address_sections.iter())
            .chain(info.transport_sections.iter())
            .cloned()
            .collect();

        self.files.push(CachedFile {
            file_name: file_name.to_string(),
            size: file_size,
            version: info.version,
            date_created: info.date_created,
            map_sections,
            routing_sections,
            other_sections,
        });
    }

    /// Rebuilds [ObfInfo] of a file with the given name and size. Sections get
    /// fresh runtime ids; their lazily-loaded parts are read from the file on first use.
    pub fn get(&self, file_name: &str, file_size: u64) -> Option<ObfInfo> {
        let f = self
            .files
            .iter()
            .find(|f| f.size == file_size && f.file_name == file_name)?;

        let mut info = ObfInfo {
            version: f.version,
            date_created: f.date_created,
            ..Default::default()
        };

        for s in &f.map_sections {
            let levels = s
                .levels
                .iter()
                .map(|l| MapLevel::new(l.offset, l.length, l.min_zoom, l.max_zoom, l.area))
                .collect();
            info.map_sections
                .push(Arc::new(MapSection::new(s.offset, s.length, s.name.clone(), levels)));
        }

        for s in &f.routing_sections {
            let mut rules = RouteRules::new();
            for (id, tag, value) in &s.rules {
                rules.insert(*id, tag, value);
            }
            let mut section = RoutingSection::new(s.offset, s.length, s.name.clone(), Arc::new(rules));
            let (basemap, detailed): (Vec<_>, Vec<_>) = s.subregions.iter().cloned().partition(|r| r.basemap);
            section.subregions = detailed;
            section.basemap_subregions = basemap;
            info.routing_sections.push(Arc::new(section));
        }

        for s in &f.other_sections {
            match s.kind {
                OtherSectionKind::Poi => info.poi_sections.push(s.clone()),
                OtherSectionKind::Address => info.address_sections.push(s.clone()),
                OtherSectionKind::Transport => info.transport_sections.push(s.clone()),
            }
        }

        Some(info)
    }

    pub fn write_to<W: io::Write>(&self, writer: &mut W) -> Result<(), Error> {
        let mut os = CodedOutputStream::new(writer);
        os.write_uint32(STORED_FIELD_VERSION, Self::VERSION)?;
        os.write_uint64(STORED_FIELD_DATE_CREATED, self.date_created)?;
        for f in &self.files {
            nested(&mut os, STORED_FIELD_FILE_INDEX, |os| write_file(os, f))?;
        }
        os.flush()?;
        Ok(())
    }

    /// Parses a stored cache. A cache of a different version is discarded
    /// (an empty cache is returned), as the files will be scanned again anyway.
    pub fn read_from(data: &[u8]) -> Result<Self, Error> {
        let mut is = CodedInputStream::from_bytes(data);
        let mut cache = Self::default();
        let mut version = None;

        while let Some(tag) = is.read_raw_tag_or_eof()? {
            match tag >> 3 {
                STORED_FIELD_VERSION => version = Some(is.read_uint32()?),
                STORED_FIELD_DATE_CREATED => cache.date_created = is.read_uint64()?,
                STORED_FIELD_FILE_INDEX => cache.files.push(read_nested(&mut is, read_file)?),
                _ => skip(&mut is, tag)?,
            }
        }

        if version != Some(Self::VERSION) {
            log::warn!(
                "discarding index cache of version {version:?}, expected {}",
                Self::VERSION,
            );
            return Ok(Self::default());
        }

        log::debug!("index cache with {} file(s) loaded", cache.files.len());
        Ok(cache)
    }
}

fn nested<F>(os: &mut CodedOutputStream, field: u32, f: F) -> Result<(), Error>
where
    F: FnOnce(&mut CodedOutputStream) -> Result<(), Error>,
{
    let mut buf = Vec::new();
    {
        let mut inner = CodedOutputStream::vec(&mut buf);
        f(&mut inner)?;
        inner.flush()?;
    }
    os.write_bytes(field, &buf)?;
    Ok(())
}

fn read_nested<T, F>(is: &mut CodedInputStream, f: F) -> Result<T, Error>
where
    F: FnOnce(&mut CodedInputStream) -> Result<T, Error>,
{
    let len = is.read_raw_varint64()?;
    let old = is.push_limit(len)?;
    let value = f(is)?;
    is.pop_limit(old);
    Ok(value)
}

fn skip(is: &mut CodedInputStream, tag: u32) -> Result<(), Error> {
    protobuf::rt::read_unknown_or_skip_group(tag, is, &mut UnknownFields::new())?;
    Ok(())
}

fn write_file(os: &mut CodedOutputStream, f: &CachedFile) -> Result<(), Error> {
    os.write_uint64(FILE_FIELD_SIZE, f.size)?;
    os.write_uint64(FILE_FIELD_DATE_MODIFIED, f.date_created)?;
    os.write_string(FILE_FIELD_FILE_NAME, &f.file_name)?;
    os.write_uint32(FILE_FIELD_VERSION, f.version)?;

    for s in &f.map_sections {
        nested(os, FILE_FIELD_MAP_INDEX, |os| {
            os.write_uint64(PART_FIELD_SIZE, s.length as u64)?;
            os.write_uint64(PART_FIELD_OFFSET, s.offset as u64)?;
            os.write_string(PART_FIELD_NAME, &s.name)?;
            for l in &s.levels {
                nested(os, PART_FIELD_CHILDREN, |os| {
                    write_box(os, l.offset, l.length, &l.area)?;
                    os.write_uint32(BOX_FIELD_MIN_ZOOM, l.min_zoom as u32)?;
                    os.write_uint32(BOX_FIELD_MAX_ZOOM, l.max_zoom as u32)?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;
    }

    for s in &f.routing_sections {
        nested(os, FILE_FIELD_ROUTING_INDEX, |os| {
            os.write_uint64(PART_FIELD_SIZE, s.length as u64)?;
            os.write_uint64(PART_FIELD_OFFSET, s.offset as u64)?;
            os.write_string(PART_FIELD_NAME, &s.name)?;
            for (id, tag, value) in &s.rules {
                nested(os, PART_FIELD_RULES, |os| {
                    os.write_string(RULE_FIELD_TAG, tag)?;
                    os.write_string(RULE_FIELD_VALUE, value)?;
                    os.write_uint32(RULE_FIELD_ID, *id)?;
                    Ok(())
                })?;
            }
            for r in &s.subregions {
                nested(os, PART_FIELD_CHILDREN, |os| {
                    write_box(os, r.offset, r.length, &r.area)?;
                    if let Some(data) = r.data_offset {
                        os.write_uint64(BOX_FIELD_SHIFT_TO_DATA, (data - r.offset) as u64)?;
                    }
                    os.write_bool(BOX_FIELD_BASEMAP, r.basemap)?;
                    Ok(())
                })?;
            }
            Ok(())
        })?;
    }

    for s in &f.other_sections {
        nested(os, FILE_FIELD_OTHER_INDEX, |os| {
            let kind = match s.kind {
                OtherSectionKind::Poi => 1,
                OtherSectionKind::Address => 2,
                OtherSectionKind::Transport => 3,
            };
            os.write_uint32(OTHER_FIELD_KIND, kind)?;
            os.write_uint64(OTHER_FIELD_SIZE, s.length as u64)?;
            os.write_uint64(OTHER_FIELD_OFFSET, s.offset as u64)?;
            os.write_string(OTHER_FIELD_NAME, &s.name)?;
            Ok(())
        })?;
    }

    Ok(())
}

fn write_box(os: &mut CodedOutputStream, offset: usize, length: usize, area: &AreaI) -> Result<(), Error> {
    os.write_uint64(BOX_FIELD_SIZE, length as u64)?;
    os.write_uint64(BOX_FIELD_OFFSET, offset as u64)?;
    os.write_uint32(BOX_FIELD_LEFT, area.left as u32)?;
    os.write_uint32(BOX_FIELD_RIGHT, area.right as u32)?;
    os.write_uint32(BOX_FIELD_TOP, area.top as u32)?;
    os.write_uint32(BOX_FIELD_BOTTOM, area.bottom as u32)?;
    Ok(())
}

fn read_file(is: &mut CodedInputStream) -> Result<CachedFile, Error> {
    let mut f = CachedFile {
        file_name: String::new(),
        size: 0,
        version: 0,
        date_created: 0,
        map_sections: Vec::new(),
        routing_sections: Vec::new(),
        other_sections: Vec::new(),
    };

    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            FILE_FIELD_SIZE => f.size = is.read_uint64()?,
            FILE_FIELD_DATE_MODIFIED => f.date_created = is.read_uint64()?,
            FILE_FIELD_FILE_NAME => f.file_name = is.read_string()?,
            FILE_FIELD_VERSION => f.version = is.read_uint32()?,
            FILE_FIELD_MAP_INDEX => f.map_sections.push(read_nested(is, read_map_part)?),
            FILE_FIELD_ROUTING_INDEX => f.routing_sections.push(read_nested(is, read_routing_part)?),
            FILE_FIELD_OTHER_INDEX => f.other_sections.push(read_nested(is, read_other_part)?),
            _ => skip(is, tag)?,
        }
    }

    Ok(f)
}

fn read_map_part(is: &mut CodedInputStream) -> Result<CachedMapSection, Error> {
    let mut s = CachedMapSection {
        offset: 0,
        length: 0,
        name: String::new(),
        levels: Vec::new(),
    };
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            PART_FIELD_SIZE => s.length = is.read_uint64()? as usize,
            PART_FIELD_OFFSET => s.offset = is.read_uint64()? as usize,
            PART_FIELD_NAME => s.name = is.read_string()?,
            PART_FIELD_CHILDREN => s.levels.push(read_nested(is, |is| {
                let b = read_box(is)?;
                Ok(CachedMapLevel {
                    offset: b.offset,
                    length: b.length,
                    min_zoom: b.min_zoom,
                    max_zoom: b.max_zoom,
                    area: b.area,
                })
            })?),
            _ => skip(is, tag)?,
        }
    }
    Ok(s)
}

fn read_routing_part(is: &mut CodedInputStream) -> Result<CachedRoutingSection, Error> {
    let mut s = CachedRoutingSection {
        offset: 0,
        length: 0,
        name: String::new(),
        rules: Vec::new(),
        subregions: Vec::new(),
    };
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            PART_FIELD_SIZE => s.length = is.read_uint64()? as usize,
            PART_FIELD_OFFSET => s.offset = is.read_uint64()? as usize,
            PART_FIELD_NAME => s.name = is.read_string()?,
            PART_FIELD_RULES => s.rules.push(read_nested(is, read_rule)?),
            PART_FIELD_CHILDREN => s.subregions.push(read_nested(is, |is| {
                let b = read_box(is)?;
                Ok(RouteSubregion {
                    offset: b.offset,
                    length: b.length,
                    area: b.area,
                    data_offset: b.shift_to_data.map(|s| b.offset + s),
                    basemap: b.basemap,
                })
            })?),
            _ => skip(is, tag)?,
        }
    }
    Ok(s)
}

fn read_rule(is: &mut CodedInputStream) -> Result<(u32, String, String), Error> {
    let mut rule = (0, String::new(), String::new());
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            RULE_FIELD_TAG => rule.1 = is.read_string()?,
            RULE_FIELD_VALUE => rule.2 = is.read_string()?,
            RULE_FIELD_ID => rule.0 = is.read_uint32()?,
            _ => skip(is, tag)?,
        }
    }
    Ok(rule)
}

fn read_other_part(is: &mut CodedInputStream) -> Result<OtherSection, Error> {
    let mut s = OtherSection {
        kind: OtherSectionKind::Poi,
        offset: 0,
        length: 0,
        name: String::new(),
    };
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            OTHER_FIELD_KIND => {
                s.kind = match is.read_uint32()? {
                    2 => OtherSectionKind::Address,
                    3 => OtherSectionKind::Transport,
                    _ => OtherSectionKind::Poi,
                }
            }
            OTHER_FIELD_SIZE => s.length = is.read_uint64()? as usize,
            OTHER_FIELD_OFFSET => s.offset = is.read_uint64()? as usize,
            OTHER_FIELD_NAME => s.name = is.read_string()?,
            _ => skip(is, tag)?,
        }
    }
    Ok(s)
}

#[derive(Default)]
struct CachedBox {
    offset: usize,
    length: usize,
    area: AreaI,
    min_zoom: u8,
    max_zoom: u8,
    shift_to_data: Option<usize>,
    basemap: bool,
}

fn read_box(is: &mut CodedInputStream) -> Result<CachedBox, Error> {
    let mut b = CachedBox::default();
    while let Some(tag) = is.read_raw_tag_or_eof()? {
        match tag >> 3 {
            BOX_FIELD_SIZE => b.length = is.read_uint64()? as usize,
            BOX_FIELD_OFFSET => b.offset = is.read_uint64()? as usize,
            BOX_FIELD_LEFT => b.area.left = is.read_uint32()? as i32,
            BOX_FIELD_RIGHT => b.area.right = is.read_uint32()? as i32,
            BOX_FIELD_TOP => b.area.top = is.read_uint32()? as i32,
            BOX_FIELD_BOTTOM => b.area.bottom = is.read_uint32()? as i32,
            BOX_FIELD_MIN_ZOOM => b.min_zoom = is.read_uint32()? as u8,
            BOX_FIELD_MAX_ZOOM => b.max_zoom = is.read_uint32()? as u8,
            BOX_FIELD_SHIFT_TO_DATA => b.shift_to_data = Some(is.read_uint64()? as usize),
            BOX_FIELD_BASEMAP => b.basemap = is.read_bool()?,
            _ => skip(is, tag)?,
        }
    }
    Ok(b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::obf::info::obtain_info;
    use crate::obf::map::tests::sample_map_file;
    use crate::obf::map::{load_map_objects, MapQuery};
    use crate::obf::routing::tests::sample_routing_file;
    use crate::obf::routing::{load_subregion_roads, search_subregions};
    use crate::obf::ObfFile;

    fn round_trip(cache: &CachedIndexes) -> CachedIndexes {
        let mut buf = Vec::new();
        cache.write_to(&mut buf).unwrap();
        CachedIndexes::read_from(&buf).unwrap()
    }

    #[test]
    fn restored_routing_info_reads_roads() {
        let file = ObfFile::from_bytes(sample_routing_file());
        let info = obtain_info(&file).unwrap();

        let mut cache = CachedIndexes::new();
        cache.add_to_cache("roads.obf", file.size(), &info);
        let cache = round_trip(&cache);
        assert_eq!(cache.len(), 1);

        assert!(cache.get("roads.obf", file.size() + 1).is_none());
        assert!(cache.get("other.obf", file.size()).is_none());

        let restored = cache.get("roads.obf", file.size()).unwrap();
        assert_eq!(restored.version, info.version);
        assert_eq!(restored.date_created, info.date_created);

        let section = &restored.routing_sections[0];
        let original = &info.routing_sections[0];
        assert_eq!(section.name, "Roads");
        assert_eq!(section.subregions, original.subregions);
        assert_eq!(section.basemap_subregions, original.basemap_subregions);
        assert_eq!(section.rules.len(), original.rules.len());
        assert_ne!(section.runtime_id, original.runtime_id);

        let bbox = AreaI::new(0, 0, 10_000, 10_000);
        let subs = search_subregions(&file, section, false, &bbox).unwrap();
        let roads = load_subregion_roads(&file, section, &subs[0]).unwrap();
        assert_eq!(roads.len(), 3);
        assert_eq!(roads[0].name(), "Main Street");
    }

    #[test]
    fn restored_map_info_reads_objects() {
        let file = ObfFile::from_bytes(sample_map_file());
        let info = obtain_info(&file).unwrap();

        let mut cache = CachedIndexes::new();
        cache.add_to_cache("map.obf", file.size(), &info);
        let restored = round_trip(&cache).get("map.obf", file.size()).unwrap();

        let section = &restored.map_sections[0];
        assert_eq!(section.levels[0].area, info.map_sections[0].levels[0].area);
        let r = load_map_objects(&file, section, &MapQuery::new(12)).unwrap();
        assert_eq!(r.objects.len(), 4);
    }

    #[test]
    fn replaces_entries_with_the_same_name() {
        let file = ObfFile::from_bytes(sample_routing_file());
        let info = obtain_info(&file).unwrap();
        let mut cache = CachedIndexes::new();
        cache.add_to_cache("roads.obf", 1, &info);
        cache.add_to_cache("roads.obf", 2, &info);
        assert_eq!(cache.len(), 1);
        assert!(cache.get("roads.obf", 1).is_none());
        assert!(cache.get("roads.obf", 2).is_some());
    }

    #[test]
    fn other_version_is_discarded() {
        let mut buf = Vec::new();
        {
            let mut os = CodedOutputStream::vec(&mut buf);
            os.write_uint32(STORED_FIELD_VERSION, CachedIndexes::VERSION + 1).unwrap();
            nested(&mut os, STORED_FIELD_FILE_INDEX, |os| {
                os.write_string(FILE_FIELD_FILE_NAME, "a.obf")?;
                Ok(())
            })
            .unwrap();
            os.flush().unwrap();
        }
        let cache = CachedIndexes::read_from(&buf).unwrap();
        assert!(cache.is_empty());
    }
}
