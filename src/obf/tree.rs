// (c) Copyright 2025 Mikołaj Kuranowski
// SPDX-License-Identifier: MIT

//! Spatial tree stored inline in map and routing sections.
//!
//! Every node is a big-endian framed message with its bounding box encoded as
//! zig-zag deltas against the parent box, an optional big-endian offset of its
//! data block (relative to the node body), an optional ocean flag and nested child
//! nodes. Map boxes and routing subregions share this layout.

use super::area::AreaI;
use super::cursor::{CodedCursor, WireType};
use super::QueryController;
use crate::Error;

const FIELD_LEFT: u32 = 1;
const FIELD_RIGHT: u32 = 2;
const FIELD_TOP: u32 = 3;
const FIELD_BOTTOM: u32 = 4;
const FIELD_SHIFT_TO_DATA: u32 = 5;
const FIELD_OCEAN: u32 = 6;
pub(crate) const FIELD_BOXES: u32 = 7;

const MASK_ALL_BOUNDS: u8 = 0b1111;

/// Land/water classification of a tree node, used to fill tiles without objects.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Foundation {
    #[default]
    Undefined,
    FullLand,
    FullWater,
    Mixed,
}

impl Foundation {
    /// Combines foundations of sibling nodes. Undefined values are ignored,
    /// and disagreeing values collapse into [Foundation::Mixed].
    pub fn merge(self, other: Foundation) -> Foundation {
        match (self, other) {
            (Foundation::Undefined, x) | (x, Foundation::Undefined) => x,
            (a, b) if a == b => a,
            _ => Foundation::Mixed,
        }
    }
}

/// Diagnostic counters of a tree descent.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TreeMetrics {
    /// Number of decoded nodes.
    pub visited: usize,

    /// Number of decoded nodes which were not rejected by the query box.
    pub accepted: usize,
}

/// A decoded spatial tree node. All offsets are absolute file positions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeNode {
    pub offset: usize,
    pub length: usize,
    pub area: AreaI,
    pub data_offset: Option<usize>,
    pub children_offset: Option<usize>,
    pub foundation: Foundation,
}

impl TreeNode {
    #[inline]
    pub fn end(&self) -> usize {
        self.offset + self.length
    }
}

/// Reads a node whose body starts at the cursor position and spans `length` bytes.
///
/// Parsing stops at the first child box once all four bounds are known; the cursor
/// is always left at the end of the node. With `check_containment`, a node whose
/// area escapes `parent_area` is reported as [Error::ChildOutsideParent].
pub(crate) fn read_node(
    c: &mut CodedCursor,
    length: usize,
    parent_area: &AreaI,
    inherited: Foundation,
    check_containment: bool,
) -> Result<TreeNode, Error> {
    let offset = c.position();
    let old = c.push_limit(length)?;

    let mut node = TreeNode {
        offset,
        length,
        area: *parent_area,
        data_offset: None,
        children_offset: None,
        foundation: inherited,
    };
    let mut mask: u8 = 0;

    loop {
        let tag_pos = c.position();
        let Some(tag) = c.read_tag()? else { break };
        match (tag.field, tag.wire_type) {
            (FIELD_LEFT, WireType::Varint) => {
                node.area.left = parent_area.left.wrapping_add(c.read_sint32()?);
                mask |= 1;
            }
            (FIELD_RIGHT, WireType::Varint) => {
                node.area.right = parent_area.right.wrapping_add(c.read_sint32()?);
                mask |= 2;
            }
            (FIELD_TOP, WireType::Varint) => {
                node.area.top = parent_area.top.wrapping_add(c.read_sint32()?);
                mask |= 4;
            }
            (FIELD_BOTTOM, WireType::Varint) => {
                node.area.bottom = parent_area.bottom.wrapping_add(c.read_sint32()?);
                mask |= 8;
            }
            (FIELD_SHIFT_TO_DATA, _) => {
                let shift = c.read_big_endian_int()? as usize;
                if shift > 0 {
                    node.data_offset = Some(offset + shift);
                }
            }
            (FIELD_OCEAN, _) => {
                node.foundation = if c.read_varint32()? != 0 {
                    Foundation::FullWater
                } else {
                    Foundation::FullLand
                };
            }
            (FIELD_BOXES, _) => {
                if node.children_offset.is_none() {
                    node.children_offset = Some(tag_pos);
                }
                if mask == MASK_ALL_BOUNDS {
                    c.skip_to_limit();
                    break;
                }
                c.skip_unknown_field(tag)?;
            }
            _ => c.skip_unknown_field(tag)?,
        }
    }

    c.skip_to_limit();
    c.pop_limit(old);

    if check_containment && !parent_area.contains(&node.area) {
        return Err(Error::ChildOutsideParent(offset));
    }

    Ok(node)
}

/// Reads a node given by its absolute position, regardless of the cursor state.
pub(crate) fn read_node_at(
    c: &mut CodedCursor,
    offset: usize,
    length: usize,
    parent_area: &AreaI,
    inherited: Foundation,
    check_containment: bool,
) -> Result<TreeNode, Error> {
    c.seek(offset)?;
    read_node(c, length, parent_area, inherited, check_containment)
}

/// Decodes all direct children of `node`.
pub(crate) fn read_children(c: &mut CodedCursor, node: &TreeNode) -> Result<Vec<TreeNode>, Error> {
    let mut children = Vec::new();
    visit_children(c, node, |c, length| {
        let child = read_node(c, length, &node.area, node.foundation, true)?;
        children.push(child);
        Ok(())
    })?;
    Ok(children)
}

fn visit_children<F>(c: &mut CodedCursor, node: &TreeNode, mut f: F) -> Result<(), Error>
where
    F: FnMut(&mut CodedCursor, usize) -> Result<(), Error>,
{
    let Some(children_offset) = node.children_offset else {
        return Ok(());
    };

    c.seek(node.offset)?;
    let old = c.push_limit(node.length)?;
    c.seek(children_offset)?;

    while let Some(tag) = c.read_tag()? {
        if tag.field == FIELD_BOXES && tag.wire_type == WireType::Fixed32 {
            let length = c.read_big_endian_int()? as usize;
            let child_start = c.position();
            f(c, length)?;
            c.seek(child_start + length)?;
        } else {
            c.skip_unknown_field(tag)?;
        }
    }

    c.pop_limit(old);
    Ok(())
}

/// Result of [collect_nodes_with_data].
#[derive(Debug, Default)]
pub(crate) struct Descent {
    /// Nodes with data blocks, sorted by ascending data offset.
    pub nodes: Vec<TreeNode>,
    pub foundation: Foundation,
    pub metrics: TreeMetrics,
}

/// Descends from the provided roots, collecting every node with a data block
/// whose area intersects `bbox` (or every such node if there's no bbox).
///
/// Roots are filtered and counted like any other node. Descent stops early
/// (returning what was gathered so far) once `controller` reports an abort.
pub(crate) fn collect_nodes_with_data(
    c: &mut CodedCursor,
    roots: &[TreeNode],
    bbox: Option<&AreaI>,
    controller: &dyn QueryController,
) -> Result<Descent, Error> {
    let mut d = Descent::default();

    for root in roots {
        if controller.is_aborted() {
            break;
        }
        d.metrics.visited += 1;
        if bbox.is_some_and(|b| !b.intersects(&root.area)) {
            continue;
        }
        d.metrics.accepted += 1;

        d.foundation = d.foundation.merge(root.foundation);
        if root.data_offset.is_some() {
            d.nodes.push(root.clone());
        }
        descend(c, root, bbox, &mut d, controller)?;
    }

    d.nodes.sort_by_key(|n| n.data_offset);
    Ok(d)
}

fn descend(
    c: &mut CodedCursor,
    node: &TreeNode,
    bbox: Option<&AreaI>,
    d: &mut Descent,
    controller: &dyn QueryController,
) -> Result<(), Error> {
    let mut accepted = Vec::new();
    visit_children(c, node, |c, length| {
        let child = read_node(c, length, &node.area, node.foundation, true)?;
        d.metrics.visited += 1;
        if bbox.is_some_and(|b| !b.intersects(&child.area)) {
            return Ok(());
        }
        d.metrics.accepted += 1;
        accepted.push(child);
        Ok(())
    })?;

    for child in accepted {
        if controller.is_aborted() {
            return Ok(());
        }
        d.foundation = d.foundation.merge(child.foundation);
        if child.data_offset.is_some() {
            d.nodes.push(child.clone());
        }
        if child.children_offset.is_some() {
            descend(c, &child, bbox, d, controller)?;
        }
    }

    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::obf::test_writer::ObfWriter;
    use crate::obf::NeverAbort;

    /// Description of a synthetic tree node.
    #[derive(Debug, Clone)]
    pub struct N {
        pub area: AreaI,
        pub shift: u32,
        pub ocean: Option<bool>,
        pub children: Vec<N>,
    }

    impl N {
        pub fn leaf(area: AreaI, shift: u32) -> Self {
            Self {
                area,
                shift,
                ocean: None,
                children: Vec::new(),
            }
        }
    }

    /// Writes `n` as a boxes field and returns the offset of its body.
    pub fn write_node(w: &mut ObfWriter, parent: &AreaI, n: &N) -> usize {
        let len_pos = w.begin_be(FIELD_BOXES);
        w.sint32(FIELD_LEFT, n.area.left - parent.left);
        w.sint32(FIELD_RIGHT, n.area.right - parent.right);
        w.sint32(FIELD_TOP, n.area.top - parent.top);
        w.sint32(FIELD_BOTTOM, n.area.bottom - parent.bottom);
        if n.shift > 0 {
            w.be_uint32(FIELD_SHIFT_TO_DATA, n.shift);
        }
        if let Some(ocean) = n.ocean {
            w.uint32(FIELD_OCEAN, ocean as u32);
        }
        for child in &n.children {
            write_node(w, &n.area, child);
        }
        w.end_be(len_pos);
        len_pos + 4
    }

    fn read_root(data: &[u8], parent: &AreaI) -> TreeNode {
        let mut c = CodedCursor::new(data);
        let tag = c.read_tag().unwrap().unwrap();
        assert_eq!(tag.field, FIELD_BOXES);
        let len = c.read_big_endian_int().unwrap() as usize;
        read_node(&mut c, len, parent, Foundation::Undefined, true).unwrap()
    }

    fn sample_tree() -> N {
        let q = |l, t, r, b, shift| N::leaf(AreaI::new(l, t, r, b), shift);
        N {
            area: AreaI::new(0, 0, 1000, 1000),
            shift: 0,
            ocean: None,
            children: vec![
                N {
                    area: AreaI::new(0, 0, 499, 499),
                    shift: 5000,
                    ocean: Some(false),
                    children: vec![q(0, 0, 249, 249, 3000), q(250, 250, 499, 499, 10)],
                },
                N {
                    area: AreaI::new(500, 0, 1000, 499),
                    shift: 0,
                    ocean: Some(true),
                    children: vec![q(500, 0, 749, 249, 20)],
                },
                q(0, 500, 1000, 1000, 30),
            ],
        }
    }

    fn all_nodes(n: &N, out: &mut Vec<AreaI>) {
        for child in &n.children {
            out.push(child.area);
            all_nodes(child, out);
        }
    }

    #[test]
    fn reads_node_fields() {
        let mut w = ObfWriter::default();
        let parent = AreaI::new(100, 100, 900, 900);
        let body = write_node(
            &mut w,
            &parent,
            &N {
                area: AreaI::new(150, 120, 800, 850),
                shift: 40,
                ocean: Some(true),
                children: vec![N::leaf(AreaI::new(150, 120, 200, 200), 0)],
            },
        );
        let data = w.finish();

        let node = read_root(&data, &parent);
        assert_eq!(node.offset, body);
        assert_eq!(node.end(), data.len());
        assert_eq!(node.area, AreaI::new(150, 120, 800, 850));
        assert_eq!(node.data_offset, Some(body + 40));
        assert_eq!(node.foundation, Foundation::FullWater);
        assert!(node.children_offset.is_some());

        let mut c = CodedCursor::new(&data);
        let children = read_children(&mut c, &node).unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children[0].area, AreaI::new(150, 120, 200, 200));
        assert_eq!(children[0].foundation, Foundation::FullWater);
        assert!(node.area.contains(&children[0].area));
    }

    #[test]
    fn child_outside_parent_is_fatal() {
        let mut w = ObfWriter::default();
        let parent = AreaI::new(0, 0, 100, 100);
        write_node(&mut w, &parent, &N::leaf(AreaI::new(0, 0, 200, 100), 0));
        let data = w.finish();

        let mut c = CodedCursor::new(&data);
        c.read_tag().unwrap();
        let len = c.read_big_endian_int().unwrap() as usize;
        let r = read_node(&mut c, len, &parent, Foundation::Undefined, true);
        assert!(matches!(r, Err(Error::ChildOutsideParent(_))));
    }

    #[test]
    fn descent_matches_brute_force() {
        let tree = sample_tree();
        let mut w = ObfWriter::default();
        write_node(&mut w, &AreaI::new(0, 0, 1000, 1000), &tree);
        let data = w.finish();
        let root = read_root(&data, &AreaI::new(0, 0, 1000, 1000));

        let mut every = vec![tree.area];
        all_nodes(&tree, &mut every);

        for bbox in [
            AreaI::new(10, 10, 20, 20),
            AreaI::new(240, 240, 260, 260),
            AreaI::new(600, 100, 700, 200),
            AreaI::new(0, 0, 1000, 1000),
            AreaI::new(2000, 2000, 3000, 3000),
        ] {
            let mut c = CodedCursor::new(&data);
            let d = collect_nodes_with_data(&mut c, std::slice::from_ref(&root), Some(&bbox), &NeverAbort)
                .unwrap();

            // Children of rejected nodes are never decoded
            let expected_accepted = every.iter().filter(|a| a.intersects(&bbox)).count();
            assert_eq!(d.metrics.accepted, expected_accepted, "bbox {bbox:?}");
            assert!(d.metrics.visited >= d.metrics.accepted);
            assert!(d.nodes.iter().all(|n| n.area.intersects(&bbox)));
        }
    }

    #[test]
    fn nodes_are_sorted_by_data_offset() {
        let tree = sample_tree();
        let mut w = ObfWriter::default();
        write_node(&mut w, &AreaI::new(0, 0, 1000, 1000), &tree);
        let data = w.finish();
        let root = read_root(&data, &AreaI::new(0, 0, 1000, 1000));

        let mut c = CodedCursor::new(&data);
        let d = collect_nodes_with_data(&mut c, &[root], None, &NeverAbort).unwrap();
        assert_eq!(d.nodes.len(), 5);
        let offsets: Vec<_> = d.nodes.iter().map(|n| n.data_offset.unwrap()).collect();
        let mut sorted = offsets.clone();
        sorted.sort();
        assert_eq!(offsets, sorted);

        // The first child has a large data shift, so it's read last
        assert_eq!(d.nodes.last().unwrap().area, AreaI::new(0, 0, 499, 499));
        assert_eq!(d.foundation, Foundation::Mixed);
    }

    #[test]
    fn foundation_merge() {
        use Foundation::*;
        assert_eq!(Undefined.merge(FullLand), FullLand);
        assert_eq!(FullWater.merge(Undefined), FullWater);
        assert_eq!(FullLand.merge(FullLand), FullLand);
        assert_eq!(FullLand.merge(FullWater), Mixed);
        assert_eq!(Mixed.merge(Undefined), Mixed);
    }
}
