//! Sparse hierarchical voxel tree
//!
//! A `Tree` is a root table of top-level entries keyed by origin, each entry a
//! constant tile or an owned node subtree. Every subtree has exactly
//! `layout.depth()` levels: internal nodes above a single leaf level. Regions
//! that are entirely background have no entry at all.

mod mask;
mod node;

pub use mask::NodeMask;
pub use node::{slot_coord, slot_index, InternalNode, LeafNode, Node, NodeKind, Slot};

use std::collections::BTreeMap;

use glam::IVec3;

use crate::error::{config_error, invalid_volume, VdbResult};
use crate::volume::{IndexBox, Volume};

/// Maximum number of node levels below the root
pub const MAX_DEPTH: usize = 8;

/// Largest supported log2 branching factor of a single level
pub const MAX_LOG2_DIM: u32 = 7;

/// Largest supported log2 side length of a top-level node
pub const MAX_LOG2_SPAN: u32 = 21;

/// Branching factors of every node level, top-level first, leaf last
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize)]
pub struct TreeLayout {
    log2_dims: Vec<u32>,
}

impl TreeLayout {
    pub fn new(log2_dims: Vec<u32>) -> VdbResult<Self> {
        if log2_dims.is_empty() || log2_dims.len() > MAX_DEPTH {
            return Err(config_error(format!(
                "tree depth must be between 1 and {}, got {}",
                MAX_DEPTH,
                log2_dims.len()
            )));
        }
        if let Some(bad) = log2_dims.iter().find(|&&d| d == 0 || d > MAX_LOG2_DIM) {
            return Err(config_error(format!(
                "log2 branching factor {} outside 1..={}",
                bad, MAX_LOG2_DIM
            )));
        }
        let span: u32 = log2_dims.iter().sum();
        if span > MAX_LOG2_SPAN {
            return Err(config_error(format!(
                "top-level node span 2^{} exceeds 2^{}",
                span, MAX_LOG2_SPAN
            )));
        }
        Ok(Self { log2_dims })
    }

    pub fn depth(&self) -> usize {
        self.log2_dims.len()
    }

    pub fn log2_dims(&self) -> &[u32] {
        &self.log2_dims
    }

    /// Branching factors below and including `level`
    pub fn tail(&self, level: usize) -> &[u32] {
        &self.log2_dims[level..]
    }

    pub fn log2_dim(&self, level: usize) -> u32 {
        self.log2_dims[level]
    }

    /// log2 side length of a node at `level`
    pub fn log2_span(&self, level: usize) -> u32 {
        self.log2_dims[level..].iter().sum()
    }

    pub fn top_log2_span(&self) -> u32 {
        self.log2_span(0)
    }

    pub fn kind_at(&self, level: usize) -> NodeKind {
        if level + 1 == self.depth() {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        }
    }
}

impl Default for TreeLayout {
    /// 32^3 and 16^3 internal levels above 8^3 leaves
    fn default() -> Self {
        Self {
            log2_dims: vec![5, 4, 3],
        }
    }
}

/// Root table key; orders entries by z, then y, then x
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
struct RootKey {
    z: i32,
    y: i32,
    x: i32,
}

impl From<IVec3> for RootKey {
    fn from(v: IVec3) -> Self {
        Self { z: v.z, y: v.y, x: v.x }
    }
}

impl RootKey {
    fn origin(&self) -> IVec3 {
        IVec3::new(self.x, self.y, self.z)
    }
}

/// One entry of the root table
#[derive(Debug, Clone, PartialEq)]
pub enum RootEntry {
    Tile(f32),
    Child(Node),
}

/// Node and tile counts of a tree
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct TreeStats {
    pub leaf_nodes: usize,
    pub internal_nodes: usize,
    pub tiles: usize,
    pub active_voxels: u64,
}

/// Sparse voxel tree with a fixed-depth hierarchy under a root table
#[derive(Debug, Clone, PartialEq)]
pub struct Tree {
    layout: TreeLayout,
    background: f32,
    bbox: IndexBox,
    root: BTreeMap<RootKey, RootEntry>,
}

impl Tree {
    /// Empty tree covering `bbox`
    pub fn new(layout: TreeLayout, background: f32, bbox: IndexBox) -> Self {
        Self {
            layout,
            background,
            bbox,
            root: BTreeMap::new(),
        }
    }

    pub fn layout(&self) -> &TreeLayout {
        &self.layout
    }

    pub fn background(&self) -> f32 {
        self.background
    }

    /// Index bounding box of the source volume
    pub fn bbox(&self) -> IndexBox {
        self.bbox
    }

    /// Whether the root table is empty
    pub fn is_empty(&self) -> bool {
        self.root.is_empty()
    }

    pub fn root_len(&self) -> usize {
        self.root.len()
    }

    /// Origin of the top-level node containing `ijk`
    pub fn top_origin(&self, ijk: IVec3) -> IVec3 {
        let mask = !((1i32 << self.layout.top_log2_span()) - 1);
        IVec3::new(ijk.x & mask, ijk.y & mask, ijk.z & mask)
    }

    pub(crate) fn insert(&mut self, origin: IVec3, entry: RootEntry) {
        self.root.insert(RootKey::from(origin), entry);
    }

    /// Root entries in file order (z, then y, then x)
    pub fn root_entries(&self) -> impl Iterator<Item = (IVec3, &RootEntry)> + '_ {
        self.root.iter().map(|(key, entry)| (key.origin(), entry))
    }

    /// Value at an index-space coordinate; background where nothing is stored
    pub fn value_at(&self, ijk: IVec3) -> f32 {
        self.stored_value(ijk).unwrap_or(self.background)
    }

    /// Stored value at a coordinate, `None` where the background is implied
    pub fn stored_value(&self, ijk: IVec3) -> Option<f32> {
        match self.root.get(&RootKey::from(self.top_origin(ijk)))? {
            RootEntry::Tile(value) => Some(*value),
            RootEntry::Child(node) => node.value_at(ijk),
        }
    }

    /// Visit every node of every subtree
    pub fn visit_nodes<F: FnMut(&Node)>(&self, mut visitor: F) {
        for entry in self.root.values() {
            if let RootEntry::Child(node) = entry {
                node.visit(&mut visitor);
            }
        }
    }

    pub fn stats(&self) -> TreeStats {
        let mut stats = TreeStats::default();
        let top_voxels = 1u64 << (3 * self.layout.top_log2_span());

        for entry in self.root.values() {
            match entry {
                RootEntry::Tile(_) => {
                    stats.tiles += 1;
                    stats.active_voxels += top_voxels;
                }
                RootEntry::Child(node) => stats.active_voxels += node.active_voxel_count(),
            }
        }
        self.visit_nodes(|node| match node {
            Node::Leaf(_) => stats.leaf_nodes += 1,
            Node::Internal(internal) => {
                stats.internal_nodes += 1;
                stats.tiles += internal.tiles().len();
            }
        });
        stats
    }

    pub fn leaf_count(&self) -> usize {
        self.stats().leaf_nodes
    }

    pub fn active_voxel_count(&self) -> u64 {
        self.stats().active_voxels
    }

    /// Tight bounds of every stored value, `None` for an empty tree
    pub fn active_bbox(&self) -> Option<IndexBox> {
        let mut bounds: Option<IndexBox> = None;
        let mut grow = |region: IndexBox| {
            bounds = Some(match bounds {
                Some(current) => current.union(&region),
                None => region,
            });
        };

        for (origin, entry) in self.root_entries() {
            match entry {
                RootEntry::Tile(_) => grow(IndexBox::from_span(origin, self.layout.top_log2_span())),
                RootEntry::Child(node) => node.visit(&mut |node| match node {
                    Node::Leaf(leaf) => {
                        for (ijk, _) in leaf.iter_active() {
                            grow(IndexBox::new(ijk, ijk));
                        }
                    }
                    Node::Internal(internal) => {
                        for (slot, _) in internal.iter_tiles() {
                            grow(IndexBox::from_span(
                                internal.slot_origin(slot),
                                internal.child_log2_span(),
                            ));
                        }
                    }
                }),
            }
        }
        bounds
    }

    /// Bytes held by node masks, leaf values and tile values
    ///
    /// Struct and pointer overhead is left out so the figure does not depend
    /// on the host it was computed on.
    pub fn memory_usage(&self) -> u64 {
        const VALUE_BYTES: u64 = 4;
        let root_tiles = self
            .root
            .values()
            .filter(|entry| matches!(entry, RootEntry::Tile(_)))
            .count() as u64;
        let mut bytes = root_tiles * VALUE_BYTES;
        self.visit_nodes(|node| match node {
            Node::Leaf(leaf) => {
                bytes += NodeMask::byte_len(leaf.value_mask().len()) as u64;
                bytes += leaf.values().len() as u64 * VALUE_BYTES;
            }
            Node::Internal(internal) => {
                bytes += 2 * NodeMask::byte_len(internal.presence_mask().len()) as u64;
                bytes += internal.tiles().len() as u64 * VALUE_BYTES;
            }
        });
        bytes
    }

    /// Expand the tree back into a dense volume over its bounding box
    pub fn to_dense(&self, spacing: [f64; 3], origin: [f64; 3]) -> VdbResult<Volume> {
        let extent = self.bbox.extent();
        if extent.cmple(IVec3::ZERO).any() {
            return Err(invalid_volume(format!("tree bounding box {:?} is empty", self.bbox)));
        }

        let dims = [extent.x as usize, extent.y as usize, extent.z as usize];
        let mut data = Vec::with_capacity(dims[0] * dims[1] * dims[2]);
        for z in self.bbox.min.z..=self.bbox.max.z {
            for y in self.bbox.min.y..=self.bbox.max.y {
                for x in self.bbox.min.x..=self.bbox.max.x {
                    data.push(self.value_at(IVec3::new(x, y, z)));
                }
            }
        }
        Volume::new(dims, data, spacing, origin)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_validation() {
        assert!(TreeLayout::new(vec![]).is_err());
        assert!(TreeLayout::new(vec![5, 0, 3]).is_err());
        assert!(TreeLayout::new(vec![8, 3]).is_err());
        assert!(TreeLayout::new(vec![7; 5]).is_err());

        let layout = TreeLayout::default();
        assert_eq!(layout.depth(), 3);
        assert_eq!(layout.top_log2_span(), 12);
        assert_eq!(layout.log2_span(1), 7);
        assert_eq!(layout.kind_at(2), NodeKind::Leaf);
        assert_eq!(layout.kind_at(0), NodeKind::Internal);
    }

    #[test]
    fn test_root_order_is_z_then_y_then_x() {
        let layout = TreeLayout::new(vec![3]).expect("layout is valid");
        let mut tree = Tree::new(layout, 0.0, IndexBox::from_dims([32, 32, 32]));
        tree.insert(IVec3::new(8, 0, 0), RootEntry::Tile(1.0));
        tree.insert(IVec3::new(0, 0, 8), RootEntry::Tile(2.0));
        tree.insert(IVec3::new(0, 8, 0), RootEntry::Tile(3.0));

        let origins: Vec<IVec3> = tree.root_entries().map(|(o, _)| o).collect();
        assert_eq!(
            origins,
            vec![IVec3::new(8, 0, 0), IVec3::new(0, 8, 0), IVec3::new(0, 0, 8)]
        );
    }

    #[test]
    fn test_empty_tree_reads_background() {
        let tree = Tree::new(TreeLayout::default(), 7.0, IndexBox::from_dims([4, 4, 4]));
        assert!(tree.is_empty());
        assert_eq!(tree.value_at(IVec3::new(1, 2, 3)), 7.0);
        assert_eq!(tree.stored_value(IVec3::new(1, 2, 3)), None);
        assert_eq!(tree.active_bbox(), None);
        assert_eq!(tree.stats(), TreeStats::default());
    }

    #[test]
    fn test_top_origin_handles_negative_coordinates() {
        let tree = Tree::new(TreeLayout::default(), 0.0, IndexBox::from_dims([1, 1, 1]));
        assert_eq!(tree.top_origin(IVec3::new(5, 4095, 4096)), IVec3::new(0, 0, 4096));
        assert_eq!(tree.top_origin(IVec3::new(-1, 0, 0)), IVec3::new(-4096, 0, 0));
    }

    #[test]
    fn test_memory_usage_counts_masks_and_values() {
        let layout = TreeLayout::new(vec![1, 3]).expect("layout is valid");
        let mut tree = Tree::new(layout, 0.0, IndexBox::from_dims([32, 16, 16]));
        assert_eq!(tree.memory_usage(), 0);

        let mut leaf_mask = NodeMask::new(512);
        leaf_mask.set_on(0);
        leaf_mask.set_on(9);
        let leaf = LeafNode::new(IVec3::ZERO, 3, leaf_mask, vec![1.0, 2.0]).expect("leaf");

        let mut presence = NodeMask::new(8);
        let mut tiles = NodeMask::new(8);
        presence.set_on(0);
        presence.set_on(3);
        tiles.set_on(3);
        let internal =
            InternalNode::new(IVec3::ZERO, 1, 3, presence, tiles, vec![5.0], vec![Node::Leaf(leaf)])
                .expect("internal node");

        tree.insert(IVec3::ZERO, RootEntry::Child(Node::Internal(internal)));
        tree.insert(IVec3::new(16, 0, 0), RootEntry::Tile(3.0));

        // leaf: 64 mask bytes + 2 values; internal: 2 one-byte masks + 1 tile;
        // root: 1 tile
        assert_eq!(tree.memory_usage(), (64 + 8) + (2 + 4) + 4);
    }
}
