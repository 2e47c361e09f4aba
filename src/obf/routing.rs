// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Reader of road network sections.
//!
//! A routing section holds two independent trees: a detailed one and a coarse
//! basemap one. Their nodes are called subregions; every subregion with a data
//! block stores a batch of roads together with their turn restrictions.

use std::collections::HashMap;
use std::sync::Arc;

use super::area::{AreaI, PointI};
use super::block_cache::{BlockRef, DataBlockCache, DataBlockId};
use super::cursor::{CodedCursor, WireType};
use super::info::RoutingSection;
use super::map::{read_string_table, resolve_names};
use super::road::{Restriction, RestrictionKind, RouteDataObject, RouteRules};
use super::source::ObfFile;
use super::tree::{self, Foundation, TreeNode};
use super::NeverAbort;
use crate::Error;

const BLOCK_FIELD_ID_TABLE: u32 = 5;
const BLOCK_FIELD_DATA_OBJECTS: u32 = 6;
const BLOCK_FIELD_RESTRICTIONS: u32 = 7;
const BLOCK_FIELD_STRING_TABLE: u32 = 8;

const ID_TABLE_FIELD_ROUTE_ID: u32 = 1;

const RESTRICTION_FIELD_TYPE: u32 = 1;
const RESTRICTION_FIELD_FROM: u32 = 2;
const RESTRICTION_FIELD_TO: u32 = 3;
const RESTRICTION_FIELD_VIA: u32 = 4;

const DATA_FIELD_POINTS: u32 = 1;
const DATA_FIELD_POINT_TYPES: u32 = 4;
const DATA_FIELD_POINT_NAMES: u32 = 5;
const DATA_FIELD_TYPES: u32 = 7;
const DATA_FIELD_ROUTE_ID: u32 = 12;
const DATA_FIELD_STRING_NAMES: u32 = 14;

const SHIFT_COORDINATES: u32 = 5;

/// Decoded roads of one subregion data block.
pub type RoadBlock = Vec<Arc<RouteDataObject>>;

/// Header of a routing tree node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteSubregion {
    pub offset: usize,
    pub length: usize,
    pub area: AreaI,
    pub data_offset: Option<usize>,
    pub basemap: bool,
}

impl RouteSubregion {
    pub fn from_node(node: &TreeNode, basemap: bool) -> Self {
        Self {
            offset: node.offset,
            length: node.length,
            area: node.area,
            data_offset: node.data_offset,
            basemap,
        }
    }

    /// Identity of the subregion's data block, if it has one.
    pub fn block_id(&self, section: &RoutingSection) -> Option<DataBlockId> {
        self.data_offset.map(|offset| DataBlockId {
            section_runtime_id: section.runtime_id,
            offset,
        })
    }
}

/// Finds all subregions with data intersecting `bbox` in either the basemap
/// or the detailed tree of a section. Results are sorted by data offset.
pub fn search_subregions(
    file: &ObfFile,
    section: &RoutingSection,
    basemap: bool,
    bbox: &AreaI,
) -> Result<Vec<RouteSubregion>, Error> {
    let headers = if basemap {
        &section.basemap_subregions
    } else {
        &section.subregions
    };

    let mut c = file.cursor();
    let mut roots = Vec::with_capacity(headers.len());
    for h in headers {
        // Root deltas are relative to the zero area, and aren't checked for containment
        roots.push(tree::read_node_at(
            &mut c,
            h.offset,
            h.length,
            &AreaI::default(),
            Foundation::Undefined,
            false,
        )?);
    }

    let d = tree::collect_nodes_with_data(&mut c, &roots, Some(bbox), &NeverAbort)?;
    log::trace!(
        "routing section {:?}: {} subregion(s) in {bbox:?}, {}/{} node(s) accepted",
        section.name,
        d.nodes.len(),
        d.metrics.accepted,
        d.metrics.visited,
    );
    Ok(d.nodes.iter().map(|n| RouteSubregion::from_node(n, basemap)).collect())
}

/// Decodes all roads of a subregion's data block.
pub fn load_subregion_roads(
    file: &ObfFile,
    section: &RoutingSection,
    subregion: &RouteSubregion,
) -> Result<RoadBlock, Error> {
    let Some(data_offset) = subregion.data_offset else {
        return Ok(Vec::new());
    };

    let mut c = file.cursor();
    c.seek(data_offset)?;
    let length = c.read_length()?;
    let old = c.push_limit(length)?;

    let mut id_table: Vec<i64> = Vec::new();
    let mut objects: Vec<PendingRoad> = Vec::new();
    let mut raw_restrictions: Vec<RawRestriction> = Vec::new();
    let mut strings: Vec<String> = Vec::new();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (BLOCK_FIELD_ID_TABLE, WireType::LengthDelimited) => {
                c.with_length_limit(|c| read_id_table(c, &mut id_table))?;
            }
            (BLOCK_FIELD_DATA_OBJECTS, WireType::LengthDelimited) => {
                let road = c.with_length_limit(|c| read_road(c, &section.rules, &subregion.area))?;
                objects.push(road);
            }
            (BLOCK_FIELD_RESTRICTIONS, WireType::LengthDelimited) => {
                raw_restrictions.push(c.with_length_limit(read_restriction)?);
            }
            (BLOCK_FIELD_STRING_TABLE, WireType::LengthDelimited) => {
                strings = c.with_length_limit(read_string_table)?;
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    c.pop_limit(old);

    let global_id = |internal: i64| -> i64 {
        usize::try_from(internal)
            .ok()
            .and_then(|i| id_table.get(i).copied())
            .unwrap_or(internal)
    };

    // Restrictions reference roads by their index within the block
    let by_internal_id: HashMap<i64, usize> = objects
        .iter()
        .enumerate()
        .map(|(i, o)| (o.road.id, i))
        .collect();

    for r in raw_restrictions {
        let Some(kind) = RestrictionKind::from_raw(r.kind) else {
            log::warn!("block at {data_offset}: unknown restriction type {}", r.kind);
            continue;
        };
        let Some(&from) = by_internal_id.get(&r.from) else {
            log::debug!("block at {data_offset}: restriction from missing road {}", r.from);
            continue;
        };
        objects[from].road.restrictions.push(Restriction {
            to: global_id(r.to),
            via: r.via.map(global_id),
            kind,
        });
    }

    let mut roads = Vec::with_capacity(objects.len());
    for mut o in objects {
        o.road.id = global_id(o.road.id);
        o.road.names = resolve_names(&o.names, &strings, data_offset);
        let point_refs: Vec<(u32, u32)> = o.point_names.iter().map(|&(_, rule, s)| (rule, s)).collect();
        o.road.point_names = o
            .point_names
            .iter()
            .zip(resolve_names(&point_refs, &strings, data_offset))
            .map(|(&(idx, _, _), (rule, name))| (idx, rule, name))
            .collect();

        if o.road.points.is_empty() {
            log::warn!("road {} at {data_offset} has no points, dropping it", o.road.id);
            continue;
        }
        roads.push(Arc::new(o.road));
    }

    Ok(roads)
}

/// Like [load_subregion_roads], but goes through a shared block cache so that
/// every block is decoded at most once.
pub fn load_subregion_roads_cached(
    file: &ObfFile,
    section: &RoutingSection,
    subregion: &RouteSubregion,
    zoom: u8,
    cache: &DataBlockCache<RoadBlock>,
) -> Result<Option<BlockRef<RoadBlock>>, Error> {
    let Some(id) = subregion.block_id(section) else {
        return Ok(None);
    };
    cache
        .get_or_load(id, zoom, zoom..=zoom, || load_subregion_roads(file, section, subregion))
        .map(Some)
}

struct PendingRoad {
    road: RouteDataObject,
    names: Vec<(u32, u32)>,
    point_names: Vec<(usize, u32, u32)>,
}

struct RawRestriction {
    kind: u32,
    from: i64,
    to: i64,
    via: Option<i64>,
}

fn read_id_table(c: &mut CodedCursor, table: &mut Vec<i64>) -> Result<(), Error> {
    let mut id: i64 = 0;
    while let Some(tag) = c.read_tag()? {
        if tag.field == ID_TABLE_FIELD_ROUTE_ID && tag.wire_type == WireType::Varint {
            id = id.wrapping_add(c.read_sint64()?);
            table.push(id);
        } else {
            c.skip_unknown_field(tag)?;
        }
    }
    Ok(())
}

fn read_restriction(c: &mut CodedCursor) -> Result<RawRestriction, Error> {
    let mut r = RawRestriction {
        kind: 0,
        from: 0,
        to: 0,
        via: None,
    };
    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (RESTRICTION_FIELD_TYPE, WireType::Varint) => r.kind = c.read_varint32()?,
            (RESTRICTION_FIELD_FROM, WireType::Varint) => r.from = c.read_varint64()? as i64,
            (RESTRICTION_FIELD_TO, WireType::Varint) => r.to = c.read_varint64()? as i64,
            (RESTRICTION_FIELD_VIA, WireType::Varint) => r.via = Some(c.read_varint64()? as i64),
            _ => c.skip_unknown_field(tag)?,
        }
    }
    Ok(r)
}

fn read_road(c: &mut CodedCursor, rules: &Arc<RouteRules>, origin: &AreaI) -> Result<PendingRoad, Error> {
    let mut road = RouteDataObject::new(0, rules.clone());
    let mut names = Vec::new();
    let mut point_names = Vec::new();

    while let Some(tag) = c.read_tag()? {
        match (tag.field, tag.wire_type) {
            (DATA_FIELD_TYPES, WireType::LengthDelimited) => {
                c.with_length_limit(|c| {
                    while c.bytes_until_limit() > 0 {
                        road.types.push(c.read_varint32()?);
                    }
                    Ok(())
                })?;
            }
            (DATA_FIELD_ROUTE_ID, WireType::Varint) => road.id = c.read_varint64()? as i64,
            (DATA_FIELD_POINTS, WireType::LengthDelimited) => {
                road.points = c.with_length_limit(|c| read_points(c, origin))?;
            }
            (DATA_FIELD_STRING_NAMES, WireType::LengthDelimited) => {
                c.with_length_limit(|c| {
                    while c.bytes_until_limit() > 0 {
                        let rule = c.read_varint32()?;
                        let s = c.read_varint32()?;
                        names.push((rule, s));
                    }
                    Ok(())
                })?;
            }
            (DATA_FIELD_POINT_NAMES, WireType::LengthDelimited) => {
                c.with_length_limit(|c| {
                    while c.bytes_until_limit() > 0 {
                        let idx = c.read_varint32()? as usize;
                        let rule = c.read_varint32()?;
                        let s = c.read_varint32()?;
                        point_names.push((idx, rule, s));
                    }
                    Ok(())
                })?;
            }
            (DATA_FIELD_POINT_TYPES, WireType::LengthDelimited) => {
                c.with_length_limit(|c| {
                    while c.bytes_until_limit() > 0 {
                        let idx = c.read_varint32()? as usize;
                        let len = c.read_length()?;
                        // Every point takes at least a byte
                        if idx >= c.data_len() {
                            return Err(Error::LimitExceeded {
                                offset: c.position(),
                                len: idx,
                                limit: c.data_len(),
                            });
                        }
                        if road.point_types.len() <= idx {
                            road.point_types.resize(idx + 1, Vec::new());
                        }
                        let old = c.push_limit(len)?;
                        while c.bytes_until_limit() > 0 {
                            road.point_types[idx].push(c.read_varint32()?);
                        }
                        c.pop_limit(old);
                    }
                    Ok(())
                })?;
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    Ok(PendingRoad {
        road,
        names,
        point_names,
    })
}

/// Road points are deltas on a grid 32 times coarser than 31-bit tile coordinates,
/// starting from the subregion's top-left corner.
fn read_points(c: &mut CodedCursor, origin: &AreaI) -> Result<Vec<PointI>, Error> {
    let mut px = origin.left >> SHIFT_COORDINATES;
    let mut py = origin.top >> SHIFT_COORDINATES;
    let mut points = Vec::new();
    while c.bytes_until_limit() > 0 {
        let x = px.wrapping_add(c.read_sint32()?);
        let y = py.wrapping_add(c.read_sint32()?);
        points.push(PointI::new(x << SHIFT_COORDINATES, y << SHIFT_COORDINATES));
        px = x;
        py = y;
    }
    Ok(points)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::obf::cursor::zigzag_encode32;
    use crate::obf::info::obtain_info;
    use crate::obf::info::tests::{write_file, write_rule};
    use crate::obf::test_writer::ObfWriter;

    pub struct Road {
        pub internal_id: u64,
        pub points: Vec<(i32, i32)>,
        pub types: Vec<u32>,
        pub point_types: Vec<(u32, Vec<u32>)>,
        pub names: Vec<(u32, u32)>,
    }

    fn packed(values: &[u32]) -> Vec<u8> {
        let mut w = ObfWriter::default();
        values.iter().for_each(|&v| w.raw_varint(v as u64));
        w.finish()
    }

    fn write_points(points: &[(i32, i32)], origin: &AreaI) -> Vec<u8> {
        let mut w = ObfWriter::default();
        let mut px = origin.left >> SHIFT_COORDINATES;
        let mut py = origin.top >> SHIFT_COORDINATES;
        for &(x, y) in points {
            let (x, y) = (x >> SHIFT_COORDINATES, y >> SHIFT_COORDINATES);
            w.raw_varint(zigzag_encode32(x - px) as u64);
            w.raw_varint(zigzag_encode32(y - py) as u64);
            px = x;
            py = y;
        }
        w.finish()
    }

    /// Writes a varint-framed road block: `ids` are global ids of roads by
    /// internal index; restrictions are `(type, from, to, via)` internal ids.
    pub fn write_road_block(
        w: &mut ObfWriter,
        origin: &AreaI,
        ids: &[i64],
        roads: &[Road],
        restrictions: &[(u32, u64, u64, Option<u64>)],
        strings: &[&str],
    ) {
        let mut b = ObfWriter::default();
        b.message(BLOCK_FIELD_ID_TABLE, |w| {
            let mut prev = 0;
            for &id in ids {
                w.sint64(ID_TABLE_FIELD_ROUTE_ID, id - prev);
                prev = id;
            }
        });
        for r in roads {
            b.message(BLOCK_FIELD_DATA_OBJECTS, |w| {
                w.bytes(DATA_FIELD_POINTS, &write_points(&r.points, origin));
                w.bytes(DATA_FIELD_TYPES, &packed(&r.types));
                if !r.point_types.is_empty() {
                    let mut pt = ObfWriter::default();
                    for (idx, types) in &r.point_types {
                        pt.raw_varint(*idx as u64);
                        let body = packed(types);
                        pt.raw_varint(body.len() as u64);
                        pt.raw(&body);
                    }
                    w.bytes(DATA_FIELD_POINT_TYPES, &pt.finish());
                }
                if !r.names.is_empty() {
                    let flat: Vec<u32> = r.names.iter().flat_map(|&(a, b)| [a, b]).collect();
                    w.bytes(DATA_FIELD_STRING_NAMES, &packed(&flat));
                }
                w.uint64(DATA_FIELD_ROUTE_ID, r.internal_id);
            });
        }
        for &(kind, from, to, via) in restrictions {
            b.message(BLOCK_FIELD_RESTRICTIONS, |w| {
                w.uint32(RESTRICTION_FIELD_TYPE, kind);
                w.uint64(RESTRICTION_FIELD_FROM, from);
                w.uint64(RESTRICTION_FIELD_TO, to);
                if let Some(via) = via {
                    w.uint64(RESTRICTION_FIELD_VIA, via);
                }
            });
        }
        b.message(BLOCK_FIELD_STRING_TABLE, |w| {
            strings.iter().for_each(|s| w.string(1, s));
        });
        let b = b.finish();
        w.raw_varint(b.len() as u64);
        w.raw(&b);
    }

    /// A routing section with a root over (0, 0, 2^20, 2^20) split into two
    /// leaves, only the western one having data, plus a basemap root with data.
    pub fn sample_routing_file() -> Vec<u8> {
        let root = AreaI::new(0, 0, 1 << 20, 1 << 20);
        let west = AreaI::new(0, 0, 1 << 19, 1 << 20);
        let east = AreaI::new(1 << 19, 0, 1 << 20, 1 << 20);

        write_file(2, Some(2), |w| {
            let section = w.begin_be(9);
            w.string(1, "Roads");
            write_rule(w, 2, "highway", "primary", None);
            write_rule(w, 2, "oneway", "yes", None);
            write_rule(w, 2, "name", "", None);
            write_rule(w, 2, "highway", "traffic_signals", None);

            let root_pos = w.begin_be(3);
            w.sint32(1, root.left);
            w.sint32(2, root.right);
            w.sint32(3, root.top);
            w.sint32(4, root.bottom);

            let west_pos = w.begin_be(7);
            w.sint32(1, west.left - root.left);
            w.sint32(2, west.right - root.right);
            w.sint32(3, west.top - root.top);
            w.sint32(4, west.bottom - root.bottom);
            let west_shift = w.be_uint32_placeholder(5);
            w.end_be(west_pos);

            let east_pos = w.begin_be(7);
            w.sint32(1, east.left - root.left);
            w.sint32(2, east.right - root.right);
            w.sint32(3, east.top - root.top);
            w.sint32(4, east.bottom - root.bottom);
            w.end_be(east_pos);
            w.end_be(root_pos);

            let base_pos = w.begin_be(4);
            w.sint32(1, root.left);
            w.sint32(2, root.right);
            w.sint32(3, root.top);
            w.sint32(4, root.bottom);
            let base_shift = w.be_uint32_placeholder(5);
            w.end_be(base_pos);

            w.tag(5, 2);
            w.patch_be_uint32(west_shift, (w.len() - (west_pos + 4)) as u32);
            write_road_block(
                w,
                &west,
                &[1000, 2000, 3000],
                &[
                    Road {
                        internal_id: 0,
                        points: vec![(1024, 1024), (2048, 1024), (4096, 1024)],
                        types: vec![1, 2],
                        point_types: vec![(1, vec![4])],
                        names: vec![(3, 0)],
                    },
                    Road {
                        internal_id: 1,
                        points: vec![(4096, 1024), (4096, 8192)],
                        types: vec![1],
                        point_types: vec![],
                        names: vec![(3, 5)],
                    },
                    Road {
                        internal_id: 2,
                        points: vec![(4096, 1024), (8192, 1024)],
                        types: vec![1],
                        point_types: vec![],
                        names: vec![],
                    },
                ],
                &[(2, 0, 1, None), (7, 0, 2, Some(1)), (1, 9, 0, None)],
                &["Main Street"],
            );

            w.tag(5, 2);
            w.patch_be_uint32(base_shift, (w.len() - (base_pos + 4)) as u32);
            write_road_block(
                w,
                &root,
                &[77],
                &[Road {
                    internal_id: 0,
                    points: vec![(0, 0), (1 << 19, 1 << 19)],
                    types: vec![1],
                    point_types: vec![],
                    names: vec![],
                }],
                &[],
                &[],
            );

            w.end_be(section);
        })
    }

    #[test]
    fn searches_detailed_and_basemap_trees_separately() {
        let file = ObfFile::from_bytes(sample_routing_file());
        let info = obtain_info(&file).unwrap();
        let section = &info.routing_sections[0];

        let subs = search_subregions(&file, section, false, &AreaI::new(0, 0, 1 << 20, 1 << 20)).unwrap();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].area, AreaI::new(0, 0, 1 << 19, 1 << 20));
        assert!(!subs[0].basemap);

        let subs = search_subregions(&file, section, false, &AreaI::new(900_000, 0, 1_000_000, 10)).unwrap();
        assert!(subs.is_empty());

        let base = search_subregions(&file, section, true, &AreaI::new(0, 0, 10, 10)).unwrap();
        assert_eq!(base.len(), 1);
        assert!(base[0].basemap);
        let roads = load_subregion_roads(&file, section, &base[0]).unwrap();
        assert_eq!(roads.len(), 1);
        assert_eq!(roads[0].id, 77);
    }

    #[test]
    fn decodes_roads_and_restrictions() {
        let file = ObfFile::from_bytes(sample_routing_file());
        let info = obtain_info(&file).unwrap();
        let section = &info.routing_sections[0];
        let subs = search_subregions(&file, section, false, &AreaI::new(0, 0, 10_000, 10_000)).unwrap();
        let roads = load_subregion_roads(&file, section, &subs[0]).unwrap();

        let ids: Vec<_> = roads.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![1000, 2000, 3000]);

        let a = &roads[0];
        assert_eq!(
            a.points,
            vec![PointI::new(1024, 1024), PointI::new(2048, 1024), PointI::new(4096, 1024)]
        );
        assert_eq!(a.highway(), "primary");
        assert_eq!(a.oneway(), 1);
        assert_eq!(a.name(), "Main Street");
        assert!(a.has_point_type(1, "highway", "traffic_signals"));
        assert!(a.point_types(0).is_empty());

        // The restriction from an unknown road is dropped
        assert_eq!(
            a.restrictions,
            vec![
                Restriction { to: 2000, via: None, kind: RestrictionKind::NoLeftTurn },
                Restriction { to: 3000, via: Some(2000), kind: RestrictionKind::OnlyStraightOn },
            ]
        );
        assert!(roads[1].restrictions.is_empty());

        // String id outside of the table
        assert_eq!(roads[1].name(), crate::obf::map::INVALID_STRING_MARKER);
    }

    #[test]
    fn point_type_index_past_the_data_is_rejected() {
        let mut pt = ObfWriter::default();
        pt.raw_varint(u32::MAX as u64 - 1);
        let body = packed(&[1]);
        pt.raw_varint(body.len() as u64);
        pt.raw(&body);

        let mut w = ObfWriter::default();
        w.bytes(DATA_FIELD_POINT_TYPES, &pt.finish());
        let data = w.finish();

        let rules = crate::obf::road::tests::rules(&[("highway", "primary")]);
        let result = read_road(&mut CodedCursor::new(&data), &rules, &AreaI::new(0, 0, 1 << 20, 1 << 20));
        assert!(matches!(result, Err(Error::LimitExceeded { .. })));
    }

    #[test]
    fn cached_loads_share_blocks() {
        let file = ObfFile::from_bytes(sample_routing_file());
        let info = obtain_info(&file).unwrap();
        let section = &info.routing_sections[0];
        let subs = search_subregions(&file, section, false, &AreaI::new(0, 0, 10_000, 10_000)).unwrap();
        let cache = DataBlockCache::new(4);

        let a = load_subregion_roads_cached(&file, section, &subs[0], 16, &cache).unwrap().unwrap();
        let b = load_subregion_roads_cached(&file, section, &subs[0], 16, &cache).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a[0], &b[0]));
        assert_eq!(cache.references(a.id(), 16), 2);
    }
}
