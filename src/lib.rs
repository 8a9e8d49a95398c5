//! Dense Z-stack volumes to sparse hierarchical voxel grid files
//!
//! A [`Volume`] is partitioned by the [`GridBuilder`] into a fixed-depth
//! [`Tree`] of internal nodes and leaves under a sparse root table, then
//! written by the [`GridSerializer`] as a self-describing binary container.
//! [`ExportJob`] drives the whole pipeline over a time series of stacks.

pub mod builder;
pub mod codec;
pub mod config;
pub mod container;
pub mod error;
pub mod export;
pub mod transform;
pub mod tree;
pub mod volume;

pub use builder::{build, BuildOptions, GridBuilder, TilePolicy};
pub use codec::{ByteOrder, NodeCodec, ValueEncoding, ValueType};
pub use config::{ExportConfig, Selection};
pub use container::{
    write, BlockCompression, GridFile, GridSerializer, MetaValue, Metadata, WriteOptions,
};
pub use error::{VdbError, VdbResult};
pub use export::{ExportJob, ExportReport, VolumeSeries};
pub use transform::Transform;
pub use tree::{InternalNode, LeafNode, Node, NodeKind, NodeMask, RootEntry, Tree, TreeLayout};
pub use volume::{IndexBox, Roi, Volume};
