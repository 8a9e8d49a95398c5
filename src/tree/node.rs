//! Leaf and internal nodes
//!
//! Both node kinds cover a cube of `dim^3` slots, `dim = 1 << log2_dim`, and
//! address their slots in scan order: x fastest, then y, then z. A leaf slot
//! is one voxel. An internal slot is either empty, a constant tile, or an
//! exclusively owned child node.

use glam::IVec3;

use crate::error::{corrupt_data, VdbResult};
use crate::tree::NodeMask;

/// Which of the two node encodings a node uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeKind {
    Leaf,
    Internal,
}

/// Linear slot index of a local coordinate
#[inline]
pub fn slot_index(local: IVec3, log2_dim: u32) -> usize {
    (local.x as usize) | ((local.y as usize) << log2_dim) | ((local.z as usize) << (2 * log2_dim))
}

/// Local coordinate of a linear slot index
#[inline]
pub fn slot_coord(slot: usize, log2_dim: u32) -> IVec3 {
    let mask = (1usize << log2_dim) - 1;
    IVec3::new(
        (slot & mask) as i32,
        ((slot >> log2_dim) & mask) as i32,
        (slot >> (2 * log2_dim)) as i32,
    )
}

/// Bottom-level node holding per-voxel values
#[derive(Debug, Clone, PartialEq)]
pub struct LeafNode {
    origin: IVec3,
    log2_dim: u32,
    value_mask: NodeMask,
    /// One value per active voxel, in scan order
    values: Vec<f32>,
}

impl LeafNode {
    pub fn new(
        origin: IVec3,
        log2_dim: u32,
        value_mask: NodeMask,
        values: Vec<f32>,
    ) -> VdbResult<Self> {
        let slots = 1usize << (3 * log2_dim);
        if value_mask.len() != slots {
            return Err(corrupt_data(format!(
                "leaf mask has {} bits, expected {}",
                value_mask.len(),
                slots
            )));
        }
        if value_mask.is_off() {
            return Err(corrupt_data(format!("leaf at {} has no active voxels", origin)));
        }
        if values.len() != value_mask.count_on() {
            return Err(corrupt_data(format!(
                "leaf has {} values for {} active voxels",
                values.len(),
                value_mask.count_on()
            )));
        }
        Ok(Self {
            origin,
            log2_dim,
            value_mask,
            values,
        })
    }

    pub fn origin(&self) -> IVec3 {
        self.origin
    }

    pub fn log2_dim(&self) -> u32 {
        self.log2_dim
    }

    pub fn value_mask(&self) -> &NodeMask {
        &self.value_mask
    }

    pub fn values(&self) -> &[f32] {
        &self.values
    }

    pub fn active_count(&self) -> usize {
        self.values.len()
    }

    /// Value of an active slot, `None` for inactive ones
    pub fn value_at_slot(&self, slot: usize) -> Option<f32> {
        if self.value_mask.is_on(slot) {
            Some(self.values[self.value_mask.rank(slot)])
        } else {
            None
        }
    }

    /// Active voxels as `(coordinate, value)` pairs in scan order
    pub fn iter_active(&self) -> impl Iterator<Item = (IVec3, f32)> + '_ {
        self.value_mask
            .iter_on()
            .zip(self.values.iter().copied())
            .map(move |(slot, value)| (self.origin + slot_coord(slot, self.log2_dim), value))
    }
}

/// Contents of one internal node slot
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Slot<'a> {
    Empty,
    Tile(f32),
    Child(&'a Node),
}

/// Upper-level node holding tiles and child nodes
#[derive(Debug, Clone, PartialEq)]
pub struct InternalNode {
    origin: IVec3,
    log2_dim: u32,
    child_log2_span: u32,
    /// Slots holding either a tile or a child
    presence_mask: NodeMask,
    /// Subset of `presence_mask` holding tiles
    tile_mask: NodeMask,
    /// One value per tile slot, in scan order
    tiles: Vec<f32>,
    /// One node per child slot, in scan order
    children: Vec<Node>,
}

impl InternalNode {
    pub fn new(
        origin: IVec3,
        log2_dim: u32,
        child_log2_span: u32,
        presence_mask: NodeMask,
        tile_mask: NodeMask,
        tiles: Vec<f32>,
        children: Vec<Node>,
    ) -> VdbResult<Self> {
        let slots = 1usize << (3 * log2_dim);
        if presence_mask.len() != slots || tile_mask.len() != slots {
            return Err(corrupt_data(format!(
                "internal node masks must have {} bits",
                slots
            )));
        }
        if presence_mask.is_off() {
            return Err(corrupt_data(format!("internal node at {} has no slots", origin)));
        }
        if !tile_mask.is_subset_of(&presence_mask) {
            return Err(corrupt_data("tile mask marks slots that are not present"));
        }

        let tile_count = tile_mask.count_on();
        let child_count = presence_mask.count_on() - tile_count;
        if tiles.len() != tile_count || children.len() != child_count {
            return Err(corrupt_data(format!(
                "internal node has {} tiles and {} children, masks expect {} and {}",
                tiles.len(),
                children.len(),
                tile_count,
                child_count
            )));
        }

        Ok(Self {
            origin,
            log2_dim,
            child_log2_span,
            presence_mask,
            tile_mask,
            tiles,
            children,
        })
    }

    pub fn origin(&self) -> IVec3 {
        self.origin
    }

    pub fn log2_dim(&self) -> u32 {
        self.log2_dim
    }

    /// log2 of the side length covered by one slot
    pub fn child_log2_span(&self) -> u32 {
        self.child_log2_span
    }

    pub fn presence_mask(&self) -> &NodeMask {
        &self.presence_mask
    }

    pub fn tile_mask(&self) -> &NodeMask {
        &self.tile_mask
    }

    pub fn tiles(&self) -> &[f32] {
        &self.tiles
    }

    pub fn children(&self) -> &[Node] {
        &self.children
    }

    /// Origin of the region covered by `slot`
    pub fn slot_origin(&self, slot: usize) -> IVec3 {
        self.origin + (slot_coord(slot, self.log2_dim) << self.child_log2_span as i32)
    }

    pub fn slot(&self, slot: usize) -> Slot<'_> {
        if !self.presence_mask.is_on(slot) {
            return Slot::Empty;
        }
        if self.tile_mask.is_on(slot) {
            return Slot::Tile(self.tiles[self.tile_mask.rank(slot)]);
        }
        // children occupy the present slots that are not tiles
        let child_rank = self.presence_mask.rank(slot) - self.tile_mask.rank(slot);
        Slot::Child(&self.children[child_rank])
    }

    /// Tile slots as `(slot, value)` pairs in scan order
    pub fn iter_tiles(&self) -> impl Iterator<Item = (usize, f32)> + '_ {
        self.tile_mask.iter_on().zip(self.tiles.iter().copied())
    }

    /// Child slots as `(slot, node)` pairs in scan order
    pub fn iter_children(&self) -> impl Iterator<Item = (usize, &Node)> + '_ {
        self.presence_mask
            .iter_on()
            .filter(move |&slot| !self.tile_mask.is_on(slot))
            .zip(self.children.iter())
    }
}

/// A node of either kind
#[derive(Debug, Clone, PartialEq)]
pub enum Node {
    Leaf(LeafNode),
    Internal(InternalNode),
}

impl Node {
    pub fn kind(&self) -> NodeKind {
        match self {
            Node::Leaf(_) => NodeKind::Leaf,
            Node::Internal(_) => NodeKind::Internal,
        }
    }

    pub fn origin(&self) -> IVec3 {
        match self {
            Node::Leaf(leaf) => leaf.origin(),
            Node::Internal(internal) => internal.origin(),
        }
    }

    /// log2 of the side length covered by the whole node
    pub fn log2_span(&self) -> u32 {
        match self {
            Node::Leaf(leaf) => leaf.log2_dim(),
            Node::Internal(internal) => internal.log2_dim() + internal.child_log2_span(),
        }
    }

    /// Value at a coordinate inside this node, or `None` for background
    pub fn value_at(&self, ijk: IVec3) -> Option<f32> {
        match self {
            Node::Leaf(leaf) => {
                let local = ijk - leaf.origin();
                leaf.value_at_slot(slot_index(local, leaf.log2_dim()))
            }
            Node::Internal(internal) => {
                let local = (ijk - internal.origin()) >> internal.child_log2_span() as i32;
                match internal.slot(slot_index(local, internal.log2_dim())) {
                    Slot::Empty => None,
                    Slot::Tile(value) => Some(value),
                    Slot::Child(child) => child.value_at(ijk),
                }
            }
        }
    }

    /// Visit this node and every descendant, parents before children
    pub fn visit<F: FnMut(&Node)>(&self, visitor: &mut F) {
        visitor(self);
        if let Node::Internal(internal) = self {
            for child in internal.children() {
                child.visit(visitor);
            }
        }
    }

    /// Active voxels, counting every voxel covered by a tile
    pub fn active_voxel_count(&self) -> u64 {
        match self {
            Node::Leaf(leaf) => leaf.active_count() as u64,
            Node::Internal(internal) => {
                let tile_voxels = 1u64 << (3 * internal.child_log2_span());
                internal.tiles().len() as u64 * tile_voxels
                    + internal
                        .children()
                        .iter()
                        .map(Node::active_voxel_count)
                        .sum::<u64>()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdbError;

    fn leaf_with(origin: IVec3, active: &[(usize, f32)]) -> LeafNode {
        let mut mask = NodeMask::new(512);
        for (slot, _) in active {
            mask.set_on(*slot);
        }
        let values = active.iter().map(|(_, v)| *v).collect();
        LeafNode::new(origin, 3, mask, values).expect("leaf is consistent")
    }

    #[test]
    fn test_slot_index_round_trip() {
        for slot in [0, 1, 7, 8, 63, 64, 511] {
            assert_eq!(slot_index(slot_coord(slot, 3), 3), slot);
        }
        assert_eq!(slot_coord(1, 3), IVec3::new(1, 0, 0));
        assert_eq!(slot_coord(8, 3), IVec3::new(0, 1, 0));
        assert_eq!(slot_coord(64, 3), IVec3::new(0, 0, 1));
    }

    #[test]
    fn test_leaf_lookup() {
        let leaf = leaf_with(IVec3::new(8, 0, 0), &[(0, 1.0), (65, 2.5)]);
        let node = Node::Leaf(leaf);

        assert_eq!(node.value_at(IVec3::new(8, 0, 0)), Some(1.0));
        assert_eq!(node.value_at(IVec3::new(9, 0, 1)), Some(2.5));
        assert_eq!(node.value_at(IVec3::new(10, 0, 0)), None);
        assert_eq!(node.active_voxel_count(), 2);
    }

    #[test]
    fn test_leaf_rejects_value_count_mismatch() {
        let mut mask = NodeMask::new(512);
        mask.set_on(3);
        assert!(LeafNode::new(IVec3::ZERO, 3, mask, vec![]).is_err());
    }

    #[test]
    fn test_empty_nodes_are_rejected() {
        let empty_leaf = LeafNode::new(IVec3::ZERO, 3, NodeMask::new(512), vec![]);
        assert!(matches!(empty_leaf, Err(VdbError::CorruptData(_))));

        let empty_internal = InternalNode::new(
            IVec3::ZERO,
            1,
            3,
            NodeMask::new(8),
            NodeMask::new(8),
            vec![],
            vec![],
        );
        assert!(matches!(empty_internal, Err(VdbError::CorruptData(_))));

        // a node made only of tiles is not empty
        let mut presence = NodeMask::new(8);
        presence.set_on(5);
        let tiles = presence.clone();
        assert!(InternalNode::new(IVec3::ZERO, 1, 3, presence, tiles, vec![2.0], vec![]).is_ok());
    }

    #[test]
    fn test_internal_slots() {
        // 2x2x2 slots of 8^3 leaves: slot 0 is a child, slot 1 a tile
        let mut presence = NodeMask::new(8);
        let mut tiles = NodeMask::new(8);
        presence.set_on(0);
        presence.set_on(1);
        tiles.set_on(1);

        let child = Node::Leaf(leaf_with(IVec3::ZERO, &[(0, 4.0)]));
        let internal = InternalNode::new(IVec3::ZERO, 1, 3, presence, tiles, vec![9.0], vec![child])
            .expect("internal node is consistent");

        assert_eq!(internal.slot_origin(1), IVec3::new(8, 0, 0));
        assert!(matches!(internal.slot(0), Slot::Child(_)));
        assert_eq!(internal.slot(1), Slot::Tile(9.0));
        assert_eq!(internal.slot(2), Slot::Empty);

        let node = Node::Internal(internal);
        assert_eq!(node.value_at(IVec3::new(0, 0, 0)), Some(4.0));
        assert_eq!(node.value_at(IVec3::new(12, 3, 7)), Some(9.0));
        assert_eq!(node.value_at(IVec3::new(0, 8, 0)), None);
        assert_eq!(node.active_voxel_count(), 1 + 512);
        assert_eq!(node.log2_span(), 4);
    }

    #[test]
    fn test_internal_rejects_tile_outside_presence() {
        let presence = NodeMask::new(8);
        let mut tiles = NodeMask::new(8);
        tiles.set_on(2);
        let result = InternalNode::new(IVec3::ZERO, 1, 3, presence, tiles, vec![1.0], vec![]);
        assert!(result.is_err());
    }
}
