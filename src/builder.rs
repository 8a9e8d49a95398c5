//! Dense volume to sparse tree conversion
//!
//! The index space is partitioned top-down into the fixed node hierarchy.
//! Every region is built bottom-up from its children and then resolved into
//! one of three outcomes:
//!
//! 1. every voxel is inactive (within `tolerance` of the background): the
//!    region is absent
//! 2. the tile policy allows it, the first voxel is active and every voxel is
//!    within `tolerance` of it: the region becomes a constant tile
//! 3. otherwise the region becomes a node owning its children
//!
//! Boundary regions are padded conceptually: voxels outside the volume read
//! as background, the volume itself is never indexed out of bounds.
//!
//! Work is scattered over the child slots of the top-level nodes and gathered
//! back in slot order, so the tree does not depend on the worker count.

use std::time::Instant;

use glam::IVec3;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::error::{config_error, invalid_volume, VdbResult};
use crate::tree::{
    slot_index, InternalNode, LeafNode, Node, NodeMask, RootEntry, Tree, TreeLayout,
};
use crate::volume::{IndexBox, Volume};

/// When constant regions collapse into tiles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TilePolicy {
    /// Collapse every constant, active region into a tile
    #[default]
    Constant,
    /// Always materialise leaves
    Disabled,
}

/// Immutable parameters of one build
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub layout: TreeLayout,
    pub background: f32,
    pub tolerance: f32,
    pub tile_policy: TilePolicy,
    /// Worker threads; 0 uses one per core
    pub workers: usize,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            layout: TreeLayout::default(),
            background: 0.0,
            tolerance: 0.0,
            tile_policy: TilePolicy::Constant,
            workers: 0,
        }
    }
}

impl BuildOptions {
    pub fn validate(&self) -> VdbResult<()> {
        if !self.background.is_finite() {
            return Err(config_error(format!(
                "background value {} must be finite",
                self.background
            )));
        }
        if !self.tolerance.is_finite() || self.tolerance < 0.0 {
            return Err(config_error(format!(
                "tolerance {} must be finite and non-negative",
                self.tolerance
            )));
        }
        Ok(())
    }
}

/// Value statistics of a built region, padding included
#[derive(Debug, Clone, Copy)]
struct RegionStats {
    /// Value at the minimum corner
    first: f32,
    min: f32,
    max: f32,
    any_active: bool,
}

impl RegionStats {
    fn background(value: f32) -> Self {
        Self {
            first: value,
            min: value,
            max: value,
            any_active: false,
        }
    }

    fn include(&mut self, other: &RegionStats) {
        self.min = self.min.min(other.min);
        self.max = self.max.max(other.max);
        self.any_active |= other.any_active;
    }

    fn within(&self, tolerance: f32) -> bool {
        self.max - self.first <= tolerance && self.first - self.min <= tolerance
    }
}

/// Outcome of building one region
#[derive(Debug)]
enum Content {
    Empty,
    Tile(f32),
    Node(Node),
}

#[derive(Debug)]
struct Built {
    content: Content,
    stats: RegionStats,
}

/// Converts dense volumes into sparse trees
#[derive(Debug, Clone)]
pub struct GridBuilder {
    options: BuildOptions,
}

impl GridBuilder {
    pub fn new(options: BuildOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    /// Build the sparse tree of `volume`
    pub fn build(&self, volume: &Volume) -> VdbResult<Tree> {
        self.options.validate()?;
        validate_volume(volume)?;

        let start = Instant::now();
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.options.workers)
            .thread_name(|idx| format!("vdb-build-{}", idx))
            .build()
            .map_err(|e| {
                std::io::Error::new(
                    std::io::ErrorKind::Other,
                    format!("Failed to start build workers: {}", e),
                )
            })?;

        let tree = pool.install(|| self.build_tree(volume))?;

        let stats = tree.stats();
        log::info!(
            "Built {:?} volume into {} leaves, {} internal nodes, {} tiles ({} active voxels) in {:.2?}",
            volume.dims(),
            stats.leaf_nodes,
            stats.internal_nodes,
            stats.tiles,
            stats.active_voxels,
            start.elapsed()
        );
        if tree.is_empty() {
            log::warn!("Volume contains only background values; the grid is empty");
        }
        Ok(tree)
    }

    fn build_tree(&self, volume: &Volume) -> VdbResult<Tree> {
        let layout = &self.options.layout;
        let bbox = volume.index_bbox();
        let mut tree = Tree::new(layout.clone(), self.options.background, bbox);

        let top_span = layout.top_log2_span();
        let top_origins = top_origins(&bbox, top_span);

        if layout.depth() == 1 {
            let built = top_origins
                .par_iter()
                .map(|&origin| self.build_region(volume, 0, origin))
                .collect::<VdbResult<Vec<_>>>()?;
            for (origin, region) in top_origins.into_iter().zip(built) {
                insert_root(&mut tree, origin, region);
            }
            return Ok(tree);
        }

        // scatter: one unit per top-level slot that touches the volume
        let top_dim = layout.log2_dim(0);
        let child_span = layout.log2_span(1);
        let units: Vec<(usize, usize, IVec3)> = top_origins
            .iter()
            .enumerate()
            .flat_map(|(top, &origin)| {
                overlapping_slots(&bbox, origin, top_dim, child_span)
                    .into_iter()
                    .map(move |(slot, slot_origin)| (top, slot, slot_origin))
            })
            .collect();
        log::debug!(
            "Scattering {} work units over {} top-level nodes",
            units.len(),
            top_origins.len()
        );

        let built = units
            .par_iter()
            .map(|&(_, _, slot_origin)| self.build_region(volume, 1, slot_origin))
            .collect::<VdbResult<Vec<_>>>()?;

        // gather: units are ordered by top-level node, then slot
        let mut per_top: Vec<Vec<(usize, Built)>> = top_origins.iter().map(|_| Vec::new()).collect();
        for ((top, slot, _), region) in units.into_iter().zip(built) {
            per_top[top].push((slot, region));
        }
        for (origin, slots) in top_origins.into_iter().zip(per_top) {
            let region = self.assemble(0, origin, slots)?;
            insert_root(&mut tree, origin, region);
        }

        Ok(tree)
    }

    /// Build the region of the node at `level` whose minimum corner is `origin`
    fn build_region(&self, volume: &Volume, level: usize, origin: IVec3) -> VdbResult<Built> {
        let layout = &self.options.layout;
        let bbox = volume.index_bbox();
        let region = IndexBox::from_span(origin, layout.log2_span(level));
        if !bbox.intersects(&region) {
            return Ok(self.outside());
        }

        if level + 1 == layout.depth() {
            return self.build_leaf(volume, origin, layout.log2_dim(level));
        }

        let child_span = layout.log2_span(level + 1);
        let children = overlapping_slots(&bbox, origin, layout.log2_dim(level), child_span)
            .into_iter()
            .map(|(slot, child_origin)| {
                self.build_region(volume, level + 1, child_origin)
                    .map(|built| (slot, built))
            })
            .collect::<VdbResult<Vec<_>>>()?;

        self.assemble(level, origin, children)
    }

    fn build_leaf(&self, volume: &Volume, origin: IVec3, log2_dim: u32) -> VdbResult<Built> {
        let background = self.options.background;
        let tolerance = self.options.tolerance;
        let dim = 1i32 << log2_dim;

        let mut mask = NodeMask::new(1usize << (3 * log2_dim));
        let mut values = Vec::new();
        let mut stats = RegionStats::background(volume.sample(origin).unwrap_or(background));

        for z in 0..dim {
            for y in 0..dim {
                for x in 0..dim {
                    let local = IVec3::new(x, y, z);
                    let value = volume.sample(origin + local).unwrap_or(background);
                    stats.min = stats.min.min(value);
                    stats.max = stats.max.max(value);
                    if (value - background).abs() > tolerance {
                        mask.set_on(slot_index(local, log2_dim));
                        values.push(value);
                    }
                }
            }
        }
        stats.any_active = !values.is_empty();

        self.resolve(stats, || {
            LeafNode::new(origin, log2_dim, mask, values).map(Node::Leaf)
        })
    }

    /// Combine built child slots, in ascending slot order, into one region
    fn assemble(&self, level: usize, origin: IVec3, children: Vec<(usize, Built)>) -> VdbResult<Built> {
        let layout = &self.options.layout;
        let log2_dim = layout.log2_dim(level);
        let slots = 1usize << (3 * log2_dim);
        let background = self.options.background;

        let first = match children.first() {
            Some((0, built)) => built.stats.first,
            _ => background,
        };
        let mut stats = RegionStats::background(first);
        if children.len() < slots {
            // slots outside the volume read as background
            stats.include(&RegionStats::background(background));
        }
        for (_, built) in &children {
            stats.include(&built.stats);
        }

        self.resolve(stats, move || {
            let mut presence = NodeMask::new(slots);
            let mut tile_mask = NodeMask::new(slots);
            let mut tiles = Vec::new();
            let mut nodes = Vec::new();

            for (slot, built) in children {
                match built.content {
                    Content::Empty => {}
                    Content::Tile(value) => {
                        presence.set_on(slot);
                        tile_mask.set_on(slot);
                        tiles.push(value);
                    }
                    Content::Node(node) => {
                        presence.set_on(slot);
                        nodes.push(node);
                    }
                }
            }

            InternalNode::new(
                origin,
                log2_dim,
                layout.log2_span(level + 1),
                presence,
                tile_mask,
                tiles,
                nodes,
            )
            .map(Node::Internal)
        })
    }

    /// Pick empty, tile or node for a region with the given statistics
    fn resolve<F>(&self, stats: RegionStats, make_node: F) -> VdbResult<Built>
    where
        F: FnOnce() -> VdbResult<Node>,
    {
        let content = if !stats.any_active {
            Content::Empty
        } else if self.options.tile_policy == TilePolicy::Constant
            && (stats.first - self.options.background).abs() > self.options.tolerance
            && stats.within(self.options.tolerance)
        {
            Content::Tile(stats.first)
        } else {
            Content::Node(make_node()?)
        };
        Ok(Built { content, stats })
    }

    fn outside(&self) -> Built {
        Built {
            content: Content::Empty,
            stats: RegionStats::background(self.options.background),
        }
    }
}

/// Build a tree with the default layout and tile policy
pub fn build(volume: &Volume, background_value: f32, tolerance: f32) -> VdbResult<Tree> {
    GridBuilder::new(BuildOptions {
        background: background_value,
        tolerance,
        ..BuildOptions::default()
    })
    .build(volume)
}

fn validate_volume(volume: &Volume) -> VdbResult<()> {
    let dims = volume.dims();
    if dims.iter().any(|&d| d == 0) {
        return Err(invalid_volume(format!("dimensions {:?} contain zero", dims)));
    }
    let spacing = volume.spacing();
    if !spacing.is_finite() || spacing.cmple(glam::DVec3::ZERO).any() {
        return Err(invalid_volume(format!(
            "voxel spacing {} must be finite and positive",
            spacing
        )));
    }
    Ok(())
}

fn insert_root(tree: &mut Tree, origin: IVec3, region: Built) {
    match region.content {
        Content::Empty => {}
        Content::Tile(value) => tree.insert(origin, RootEntry::Tile(value)),
        Content::Node(node) => tree.insert(origin, RootEntry::Child(node)),
    }
}

/// Origins of every top-level node touching `bbox`, in z, y, x order
fn top_origins(bbox: &IndexBox, log2_span: u32) -> Vec<IVec3> {
    let lo = bbox.min >> log2_span as i32;
    let hi = bbox.max >> log2_span as i32;
    let mut origins = Vec::new();
    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                origins.push(IVec3::new(x, y, z) << log2_span as i32);
            }
        }
    }
    origins
}

/// Slots of a node that touch `bbox`, ascending, with their origins
fn overlapping_slots(
    bbox: &IndexBox,
    origin: IVec3,
    log2_dim: u32,
    child_span: u32,
) -> Vec<(usize, IVec3)> {
    let last = IVec3::splat((1i32 << log2_dim) - 1);
    let lo = ((bbox.min - origin).max(IVec3::ZERO) >> child_span as i32).min(last);
    let hi = (bbox.max - origin) >> child_span as i32;
    if hi.cmplt(IVec3::ZERO).any() {
        return Vec::new();
    }
    let hi = hi.min(last);

    let mut slots = Vec::new();
    for z in lo.z..=hi.z {
        for y in lo.y..=hi.y {
            for x in lo.x..=hi.x {
                let local = IVec3::new(x, y, z);
                slots.push((slot_index(local, log2_dim), origin + (local << child_span as i32)));
            }
        }
    }
    slots
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdbError;
    use crate::tree::Slot;

    fn options(log2_dims: Vec<u32>) -> BuildOptions {
        BuildOptions {
            layout: TreeLayout::new(log2_dims).expect("layout is valid"),
            ..BuildOptions::default()
        }
    }

    #[test]
    fn test_all_background_builds_empty_tree() {
        let volume = Volume::filled([16, 16, 16], 0.0).expect("volume is valid");
        let tree = build(&volume, 0.0, 0.0).expect("build succeeds");

        assert!(tree.is_empty());
        assert_eq!(tree.stats().leaf_nodes, 0);
        assert_eq!(tree.stats().internal_nodes, 0);
    }

    #[test]
    fn test_single_voxel_builds_single_leaf() {
        let mut volume = Volume::filled([16, 16, 16], 0.0).expect("volume is valid");
        volume.set(0, 0, 0, 255.0).expect("voxel is inside");

        let tree = build(&volume, 0.0, 0.0).expect("build succeeds");
        let stats = tree.stats();

        assert_eq!(stats.leaf_nodes, 1);
        assert_eq!(stats.internal_nodes, 2);
        assert_eq!(stats.tiles, 0);
        assert_eq!(stats.active_voxels, 1);

        let mut leaves = Vec::new();
        tree.visit_nodes(|node| {
            if let Node::Leaf(leaf) = node {
                leaves.push(leaf.clone());
            }
        });
        assert_eq!(leaves[0].value_mask().count_on(), 1);
        assert_eq!(leaves[0].values(), &[255.0]);

        assert_eq!(tree.value_at(IVec3::ZERO), 255.0);
        assert_eq!(tree.value_at(IVec3::new(1, 0, 0)), 0.0);
    }

    #[test]
    fn test_constant_blocks_become_tiles() {
        let volume = Volume::filled([16, 16, 16], 7.0).expect("volume is valid");
        let tree = build(&volume, 0.0, 0.0).expect("build succeeds");
        let stats = tree.stats();

        // the 16^3 level covers padding, so only the eight 8^3 blocks are constant
        assert_eq!(stats.leaf_nodes, 0);
        assert_eq!(stats.tiles, 8);
        assert_eq!(stats.active_voxels, 16 * 16 * 16);
        assert_eq!(tree.value_at(IVec3::new(15, 15, 15)), 7.0);
        assert_eq!(tree.value_at(IVec3::new(16, 0, 0)), 0.0);
    }

    #[test]
    fn test_disabled_tiles_keep_leaves() {
        let volume = Volume::filled([16, 16, 16], 7.0).expect("volume is valid");
        let builder = GridBuilder::new(BuildOptions {
            tile_policy: TilePolicy::Disabled,
            ..BuildOptions::default()
        });
        let tree = builder.build(&volume).expect("build succeeds");

        assert_eq!(tree.stats().leaf_nodes, 8);
        assert_eq!(tree.stats().tiles, 0);
    }

    #[test]
    fn test_fully_constant_top_level_becomes_root_tile() {
        let volume = Volume::filled([8, 8, 8], 3.0).expect("volume is valid");
        let tree = GridBuilder::new(options(vec![1, 2]))
            .build(&volume)
            .expect("build succeeds");

        let entries: Vec<_> = tree.root_entries().collect();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0], (IVec3::ZERO, &RootEntry::Tile(3.0)));
    }

    #[test]
    fn test_tolerance_controls_activity() {
        let data = vec![0.0, 0.4, 0.6, 5.0];
        let volume = Volume::new([4, 1, 1], data, [1.0; 3], [0.0; 3]).expect("volume is valid");
        let tree = build(&volume, 0.0, 0.5).expect("build succeeds");

        assert_eq!(tree.active_voxel_count(), 2);
        assert_eq!(tree.value_at(IVec3::new(1, 0, 0)), 0.0);
        assert_eq!(tree.value_at(IVec3::new(2, 0, 0)), 0.6);
        assert_eq!(tree.value_at(IVec3::new(3, 0, 0)), 5.0);
    }

    #[test]
    fn test_tiles_are_constant_within_tolerance() {
        // one 2^3 block of values close to 10 and one with a spread of 2
        let mut data = vec![10.0; 4 * 2 * 2];
        data[1] = 10.4;
        data[3] = 12.0;
        let volume = Volume::new([4, 2, 2], data, [1.0; 3], [0.0; 3]).expect("volume is valid");

        let tree = GridBuilder::new(BuildOptions {
            tolerance: 0.5,
            ..options(vec![1, 1])
        })
        .build(&volume)
        .expect("build succeeds");

        let Some((_, RootEntry::Child(Node::Internal(top)))) = tree.root_entries().next() else {
            panic!("expected an internal top-level node");
        };
        assert_eq!(top.slot(0), Slot::Tile(10.0));
        assert!(matches!(top.slot(1), Slot::Child(Node::Leaf(_))));
    }

    #[test]
    fn test_non_multiple_dimensions() {
        let dims = [10, 13, 7];
        let data: Vec<f32> = (0..dims[0] * dims[1] * dims[2]).map(|i| (i % 5) as f32).collect();
        let volume = Volume::new(dims, data, [1.0; 3], [0.0; 3]).expect("volume is valid");
        let tree = build(&volume, 0.0, 0.0).expect("build succeeds");

        for z in 0..dims[2] {
            for y in 0..dims[1] {
                for x in 0..dims[0] {
                    let expected = volume.get(x, y, z).expect("inside");
                    let ijk = IVec3::new(x as i32, y as i32, z as i32);
                    assert_eq!(tree.value_at(ijk), expected);
                }
            }
        }
        assert_eq!(tree.value_at(IVec3::new(10, 0, 0)), 0.0);
        assert_eq!(tree.bbox(), volume.index_bbox());
    }

    #[test]
    fn test_worker_count_does_not_change_tree() {
        let dims = [40, 33, 9];
        let data: Vec<f32> = (0..dims[0] * dims[1] * dims[2])
            .map(|i| if i % 7 < 3 { 0.0 } else { (i % 11) as f32 })
            .collect();
        let volume = Volume::new(dims, data, [1.0; 3], [0.0; 3]).expect("volume is valid");

        let trees: Vec<Tree> = [1, 4]
            .into_iter()
            .map(|workers| {
                GridBuilder::new(BuildOptions {
                    workers,
                    ..options(vec![2, 3])
                })
                .build(&volume)
                .expect("build succeeds")
            })
            .collect();
        assert_eq!(trees[0], trees[1]);
        assert!(trees[0].root_len() > 1);
    }

    #[test]
    fn test_rejects_bad_options() {
        let volume = Volume::filled([2, 2, 2], 0.0).expect("volume is valid");
        let result = build(&volume, 0.0, -1.0);
        assert!(matches!(result, Err(VdbError::Config(_))));

        let result = build(&volume, f32::NAN, 0.0);
        assert!(matches!(result, Err(VdbError::Config(_))));
    }

    #[test]
    fn test_overlapping_slots_clip_to_volume() {
        let bbox = IndexBox::from_dims([20, 8, 8]);
        let slots = overlapping_slots(&bbox, IVec3::ZERO, 2, 3);
        let origins: Vec<IVec3> = slots.iter().map(|(_, o)| *o).collect();
        assert_eq!(
            origins,
            vec![IVec3::new(0, 0, 0), IVec3::new(8, 0, 0), IVec3::new(16, 0, 0)]
        );
        assert_eq!(slots[2].0, 2);

        let far = overlapping_slots(&bbox, IVec3::new(64, 0, 0), 2, 3);
        assert!(far.is_empty());
    }
}
