//! Grid container format
//!
//! A file is a fixed 12 byte header, the grid descriptor, the transform, the
//! metadata block and the tree block, optionally followed by a CRC-32 of
//! everything before it. Root children are stored as self-contained node
//! blobs, each compressed on its own, so they can be encoded and decoded in
//! parallel.

mod atomic;
mod compression;
mod metadata;

pub use atomic::atomic_write;
pub use compression::{BlockCompression, Compressor};
pub use metadata::{MetaValue, Metadata, DEFAULT_GRID_NAME, NAME_KEY};

use std::io::Write;
use std::path::Path;
use std::time::Instant;

use glam::{DVec3, IVec3};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};

use crate::codec::{ByteOrder, ByteReader, ByteWriter, NodeCodec, ValueEncoding, ValueType};
use crate::error::{corrupt_data, unsupported, IoContext, VdbError, VdbResult};
use crate::transform::Transform;
use crate::tree::{RootEntry, Tree, TreeLayout, TreeStats};
use crate::volume::IndexBox;

/// Magic bytes opening every grid file
pub const GRID_MAGIC: &[u8; 4] = b"SVDB";

/// Version written by this crate
pub const FORMAT_VERSION: u32 = 1;

/// Versions this crate can decode
pub const SUPPORTED_VERSIONS: &[u32] = &[1];

/// Size of the fixed header
pub const HEADER_LEN: usize = 12;

const FLAG_CHECKSUM: u8 = 0b0000_0001;
const KNOWN_FLAGS: u8 = FLAG_CHECKSUM;

const TRANSFORM_SCALE_TRANSLATE: u8 = 1;

const ENTRY_TILE: u8 = 0;
const ENTRY_CHILD: u8 = 1;

/// How a grid is laid out on disk
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteOptions {
    pub encoding: ValueEncoding,
    pub compression: BlockCompression,
    /// Append a CRC-32 of the whole file
    pub checksum: bool,
    /// Add `file_*` statistics to the metadata
    pub write_stats: bool,
}

impl Default for WriteOptions {
    fn default() -> Self {
        Self {
            encoding: ValueEncoding::default(),
            compression: BlockCompression::None,
            checksum: true,
            write_stats: true,
        }
    }
}

/// Fixed-size file header
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FileHeader {
    pub version: u32,
    pub encoding: ValueEncoding,
    pub compression: BlockCompression,
    pub checksum: bool,
}

impl FileHeader {
    fn write_to(&self, writer: &mut ByteWriter) {
        writer.put_bytes(GRID_MAGIC);
        writer.put_u8(self.encoding.byte_order.tag());
        writer.put_u8(self.encoding.value_type.tag());
        writer.put_u8(self.compression.tag());
        writer.put_u8(if self.checksum { FLAG_CHECKSUM } else { 0 });
        writer.put_u32(self.version);
    }

    /// Parse and validate the header at the start of `data`
    pub fn parse(data: &[u8]) -> VdbResult<Self> {
        if data.len() < HEADER_LEN {
            return Err(corrupt_data(format!(
                "{} bytes is too small to contain a grid header",
                data.len()
            )));
        }
        if &data[..4] != GRID_MAGIC {
            return Err(corrupt_data("Invalid grid magic"));
        }

        let byte_order = ByteOrder::from_tag(data[4])?;
        let value_type = ValueType::from_tag(data[5])?;
        let compression = BlockCompression::from_tag(data[6])?;
        let flags = data[7];
        if flags & !KNOWN_FLAGS != 0 {
            return Err(unsupported(format!("unknown header flags {:#010b}", flags)));
        }

        let mut reader = ByteReader::new(&data[8..HEADER_LEN], byte_order);
        let version = reader.get_u32()?;
        if !SUPPORTED_VERSIONS.contains(&version) {
            return Err(unsupported(format!(
                "format version {} (supported: {:?})",
                version, SUPPORTED_VERSIONS
            )));
        }

        Ok(Self {
            version,
            encoding: ValueEncoding::new(value_type, byte_order),
            compression,
            checksum: flags & FLAG_CHECKSUM != 0,
        })
    }
}

/// Grid name, background and index layout
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GridDescriptor {
    pub name: String,
    pub background: f32,
    pub bbox: IndexBox,
    pub layout: TreeLayout,
}

impl GridDescriptor {
    fn write_to(&self, writer: &mut ByteWriter, value_type: ValueType) {
        writer.put_str(&self.name);
        writer.put_value(self.background, value_type);
        for c in self.bbox.min.to_array().into_iter().chain(self.bbox.max.to_array()) {
            writer.put_i32(c);
        }
        writer.put_u8(self.layout.depth() as u8);
        for &log2_dim in self.layout.log2_dims() {
            writer.put_u8(log2_dim as u8);
        }
    }

    fn read_from(reader: &mut ByteReader<'_>, encoding: &ValueEncoding) -> VdbResult<Self> {
        let name = reader.get_str()?;
        let background = reader.get_value(encoding)?;
        let min = IVec3::new(reader.get_i32()?, reader.get_i32()?, reader.get_i32()?);
        let max = IVec3::new(reader.get_i32()?, reader.get_i32()?, reader.get_i32()?);
        if min.cmpgt(max).any() {
            return Err(corrupt_data(format!("bounding box {:?}..{:?} is inverted", min, max)));
        }

        let depth = reader.get_u8()? as usize;
        let log2_dims = reader
            .take(depth)?
            .iter()
            .map(|&d| u32::from(d))
            .collect::<Vec<_>>();
        let layout = TreeLayout::new(log2_dims)
            .map_err(|e| corrupt_data(format!("invalid tree layout: {}", e)))?;

        Ok(Self {
            name,
            background,
            bbox: IndexBox::new(min, max),
            layout,
        })
    }
}

fn write_transform(writer: &mut ByteWriter, transform: &Transform) {
    writer.put_u8(TRANSFORM_SCALE_TRANSLATE);
    for c in transform.scale().to_array() {
        writer.put_f64(c);
    }
    for c in transform.translation().to_array() {
        writer.put_f64(c);
    }
}

fn read_transform(reader: &mut ByteReader<'_>) -> VdbResult<Transform> {
    let tag = reader.get_u8()?;
    if tag != TRANSFORM_SCALE_TRANSLATE {
        return Err(unsupported(format!("unknown transform tag {}", tag)));
    }
    let scale = DVec3::new(reader.get_f64()?, reader.get_f64()?, reader.get_f64()?);
    let translation = DVec3::new(reader.get_f64()?, reader.get_f64()?, reader.get_f64()?);
    Transform::build(scale, translation)
        .map_err(|e| corrupt_data(format!("invalid transform: {}", e)))
}

/// A fully decoded grid file
#[derive(Debug, Clone, PartialEq)]
pub struct GridFile {
    pub header: FileHeader,
    pub descriptor: GridDescriptor,
    pub transform: Transform,
    pub metadata: Metadata,
    pub tree: Tree,
}

/// Human-readable description of a grid file
#[derive(Debug, Clone, Serialize)]
pub struct GridSummary {
    pub name: String,
    pub version: u32,
    pub value_type: &'static str,
    pub byte_order: ByteOrder,
    pub compression: BlockCompression,
    pub checksum: bool,
    pub background: f32,
    pub bbox_min: [i32; 3],
    pub bbox_max: [i32; 3],
    pub log2_dims: Vec<u32>,
    pub voxel_size: [f64; 3],
    pub origin: [f64; 3],
    pub root_entries: usize,
    pub stats: TreeStats,
    pub metadata: Metadata,
}

impl GridFile {
    pub fn summary(&self) -> GridSummary {
        GridSummary {
            name: self.descriptor.name.clone(),
            version: self.header.version,
            value_type: self.header.encoding.value_type.name(),
            byte_order: self.header.encoding.byte_order,
            compression: self.header.compression,
            checksum: self.header.checksum,
            background: self.descriptor.background,
            bbox_min: self.descriptor.bbox.min.to_array(),
            bbox_max: self.descriptor.bbox.max.to_array(),
            log2_dims: self.descriptor.layout.log2_dims().to_vec(),
            voxel_size: self.transform.voxel_size().to_array(),
            origin: self.transform.translation().to_array(),
            root_entries: self.tree.root_len(),
            stats: self.tree.stats(),
            metadata: self.metadata.clone(),
        }
    }
}

/// Encodes trees into grid files and back
#[derive(Debug, Clone, Default)]
pub struct GridSerializer {
    options: WriteOptions,
}

impl GridSerializer {
    pub fn new(options: WriteOptions) -> Self {
        Self { options }
    }

    pub fn options(&self) -> &WriteOptions {
        &self.options
    }

    /// Encode a complete grid file in memory
    pub fn serialize(
        &self,
        tree: &Tree,
        transform: &Transform,
        metadata: &Metadata,
    ) -> VdbResult<Vec<u8>> {
        let start = Instant::now();
        let encoding = self.options.encoding;
        let compressor = Compressor::new(self.options.compression)?;
        let codec = NodeCodec::new(encoding);

        if !encoding.value_type.represents_exactly(tree.background()) {
            log::warn!(
                "Background {} is not exactly representable as {}",
                tree.background(),
                encoding.value_type.name()
            );
        }

        let entries: Vec<(IVec3, &RootEntry)> = tree.root_entries().collect();
        let blobs = entries
            .par_iter()
            .map(|(_, entry)| match entry {
                RootEntry::Tile(_) => Ok(None),
                RootEntry::Child(node) => compressor.compress(codec.encode(node)).map(Some),
            })
            .collect::<VdbResult<Vec<_>>>()?;

        let mut metadata = metadata.clone();
        if self.options.write_stats {
            add_stats(&mut metadata, tree);
        }

        let header = FileHeader {
            version: FORMAT_VERSION,
            encoding,
            compression: self.options.compression,
            checksum: self.options.checksum,
        };
        let descriptor = GridDescriptor {
            name: metadata.grid_name().to_string(),
            background: tree.background(),
            bbox: tree.bbox(),
            layout: tree.layout().clone(),
        };

        let blob_bytes: usize = blobs.iter().flatten().map(Vec::len).sum();
        let mut writer = ByteWriter::with_capacity(encoding.byte_order, blob_bytes + 256);
        header.write_to(&mut writer);
        descriptor.write_to(&mut writer, encoding.value_type);
        write_transform(&mut writer, transform);
        metadata.write_to(&mut writer);

        writer.put_u32(entries.len() as u32);
        for ((origin, entry), blob) in entries.iter().zip(&blobs) {
            for c in origin.to_array() {
                writer.put_i32(c);
            }
            match (entry, blob) {
                (RootEntry::Tile(value), _) => {
                    writer.put_u8(ENTRY_TILE);
                    writer.put_value(*value, encoding.value_type);
                }
                (RootEntry::Child(_), Some(blob)) => {
                    writer.put_u8(ENTRY_CHILD);
                    writer.put_u64(blob.len() as u64);
                    writer.put_bytes(blob);
                }
                (RootEntry::Child(_), None) => {
                    return Err(corrupt_data("root child encoded without a blob"));
                }
            }
        }

        if self.options.checksum {
            let crc = crc32fast::hash(writer.as_slice());
            writer.put_u32(crc);
        }

        let bytes = writer.into_inner();
        log::debug!(
            "Serialized grid '{}' ({} root entries) into {} bytes in {:.2?}",
            descriptor.name,
            entries.len(),
            bytes.len(),
            start.elapsed()
        );
        Ok(bytes)
    }

    /// Encode a grid and write it to `output`
    ///
    /// The file is fully encoded before the first byte is written, so an
    /// encoding failure never produces partial output. Use
    /// [`GridSerializer::write_file`] for crash-safe replacement on disk.
    pub fn write<W: Write>(
        &self,
        tree: &Tree,
        transform: &Transform,
        metadata: &Metadata,
        output: &mut W,
    ) -> VdbResult<()> {
        let bytes = self.serialize(tree, transform, metadata)?;
        output.write_all(&bytes)?;
        output.flush()?;
        Ok(())
    }

    /// Encode a grid and atomically write it to `path`
    pub fn write_file(
        &self,
        tree: &Tree,
        transform: &Transform,
        metadata: &Metadata,
        path: &Path,
    ) -> VdbResult<()> {
        let bytes = self.serialize(tree, transform, metadata)?;
        atomic_write(path, &bytes)?;
        log::info!("Wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    /// Decode a complete grid file
    pub fn deserialize(data: &[u8]) -> VdbResult<GridFile> {
        let header = FileHeader::parse(data)?;
        let compressor = Compressor::new(header.compression)?;
        let encoding = header.encoding;

        let body = if header.checksum {
            if data.len() < HEADER_LEN + 4 {
                return Err(corrupt_data("file too small to hold its checksum"));
            }
            let (body, trailer) = data.split_at(data.len() - 4);
            let mut trailer = ByteReader::new(trailer, encoding.byte_order);
            let stored = trailer.get_u32()?;
            let computed = crc32fast::hash(body);
            if stored != computed {
                return Err(corrupt_data(format!(
                    "Checksum mismatch: expected {:08x}, got {:08x}",
                    stored, computed
                )));
            }
            body
        } else {
            data
        };

        let mut reader = ByteReader::new(body, encoding.byte_order);
        reader.take(HEADER_LEN)?;
        let descriptor = GridDescriptor::read_from(&mut reader, &encoding)?;
        let transform = read_transform(&mut reader)?;
        let metadata = Metadata::read_from(&mut reader)?;

        let layout = descriptor.layout.clone();
        let top_span = layout.top_log2_span();
        let alignment = (1i32 << top_span) - 1;

        let count = reader.get_u32()?;
        let mut raw_entries = Vec::new();
        let mut previous: Option<(i32, i32, i32)> = None;
        for _ in 0..count {
            let origin = IVec3::new(reader.get_i32()?, reader.get_i32()?, reader.get_i32()?);
            if (origin & IVec3::splat(alignment)) != IVec3::ZERO {
                return Err(corrupt_data(format!(
                    "root origin {:?} is not aligned to the top-level span",
                    origin
                )));
            }
            let key = (origin.z, origin.y, origin.x);
            if previous.is_some_and(|p| p >= key) {
                return Err(corrupt_data(format!("root origin {:?} is out of order", origin)));
            }
            previous = Some(key);

            let entry = match reader.get_u8()? {
                ENTRY_TILE => RawEntry::Tile(reader.get_value(&encoding)?),
                ENTRY_CHILD => {
                    let len = reader.get_len()?;
                    RawEntry::Child(reader.take(len)?)
                }
                other => return Err(corrupt_data(format!("unknown root entry kind {}", other))),
            };
            raw_entries.push((origin, entry));
        }
        if reader.remaining() != 0 {
            return Err(corrupt_data(format!(
                "{} trailing bytes after the tree block",
                reader.remaining()
            )));
        }

        let codec = NodeCodec::new(encoding);
        let root_kind = layout.kind_at(0);
        let decoded = raw_entries
            .par_iter()
            .map(|(origin, entry)| match entry {
                RawEntry::Tile(value) => Ok((*origin, RootEntry::Tile(*value))),
                RawEntry::Child(blob) => {
                    let bytes = compressor.decompress(blob)?;
                    let node = codec.decode(&bytes, root_kind, layout.log2_dims(), *origin)?;
                    Ok((*origin, RootEntry::Child(node)))
                }
            })
            .collect::<VdbResult<Vec<_>>>()?;

        let mut tree = Tree::new(layout, descriptor.background, descriptor.bbox);
        for (origin, entry) in decoded {
            tree.insert(origin, entry);
        }

        Ok(GridFile {
            header,
            descriptor,
            transform,
            metadata,
            tree,
        })
    }

    /// Read and decode a grid from any reader
    pub fn read<R: std::io::Read>(input: &mut R) -> VdbResult<GridFile> {
        let mut data = Vec::new();
        input.read_to_end(&mut data)?;
        Self::deserialize(&data)
    }

    /// Read and decode a grid file from disk
    pub fn read_file(path: &Path) -> VdbResult<GridFile> {
        let data = std::fs::read(path).io_context("read", path)?;
        Self::deserialize(&data).map_err(|e| match e {
            VdbError::CorruptData(reason) => {
                corrupt_data(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
    }
}

enum RawEntry<'a> {
    Tile(f32),
    Child(&'a [u8]),
}

fn add_stats(metadata: &mut Metadata, tree: &Tree) {
    let active = tree.active_voxel_count();
    metadata.insert(
        "file_active_voxel_count",
        i64::try_from(active).unwrap_or(i64::MAX),
    );
    if let Some(bbox) = tree.active_bbox() {
        metadata.insert("file_bbox_min", bbox.min);
        metadata.insert("file_bbox_max", bbox.max);
    }
    metadata.insert(
        "file_mem_bytes",
        i64::try_from(tree.memory_usage()).unwrap_or(i64::MAX),
    );
}

/// Write `tree` as a grid file to `output` with the default options
///
/// The background value travels with the tree and the grid name with the
/// metadata.
pub fn write<W: Write>(
    tree: &Tree,
    transform: &Transform,
    metadata: &Metadata,
    output: &mut W,
) -> VdbResult<()> {
    GridSerializer::default().write(tree, transform, metadata, output)
}
