//! Encoding of single nodes
//!
//! Leaf layout:
//!
//! ```text
//! value mask      ceil(dim^3 / 8) bytes
//! values          one scalar per active voxel, scan order
//! ```
//!
//! Internal layout:
//!
//! ```text
//! presence mask   ceil(dim^3 / 8) bytes
//! tile mask       ceil(dim^3 / 8) bytes, subset of the presence mask
//! tile values     one scalar per tile slot, scan order
//! offset table    one u64 per child slot, from the start of this node
//! children        child encodings, scan order
//! ```
//!
//! The offset table lets a reader jump to one child without decoding its
//! siblings. Decoding checks every length exactly; trailing or missing bytes
//! are corruption.

use glam::IVec3;

use crate::codec::{ByteReader, ByteWriter, ValueEncoding};
use crate::error::{corrupt_data, VdbResult};
use crate::tree::{slot_coord, InternalNode, LeafNode, Node, NodeKind, NodeMask};

/// Encodes and decodes nodes in one value encoding
#[derive(Debug, Clone, Copy)]
pub struct NodeCodec {
    encoding: ValueEncoding,
}

impl NodeCodec {
    pub fn new(encoding: ValueEncoding) -> Self {
        Self { encoding }
    }

    pub fn encoding(&self) -> ValueEncoding {
        self.encoding
    }

    /// Encode a node and all of its descendants
    pub fn encode(&self, node: &Node) -> Vec<u8> {
        let mut writer = ByteWriter::new(self.encoding.byte_order);
        self.encode_into(node, &mut writer);
        writer.into_inner()
    }

    fn encode_into(&self, node: &Node, writer: &mut ByteWriter) {
        match node {
            Node::Leaf(leaf) => {
                writer.put_bytes(&leaf.value_mask().to_bytes());
                for &value in leaf.values() {
                    writer.put_value(value, self.encoding.value_type);
                }
            }
            Node::Internal(internal) => {
                let start = writer.len();
                writer.put_bytes(&internal.presence_mask().to_bytes());
                writer.put_bytes(&internal.tile_mask().to_bytes());
                for &value in internal.tiles() {
                    writer.put_value(value, self.encoding.value_type);
                }

                let table = writer.len();
                for _ in internal.children() {
                    writer.put_u64(0);
                }
                for (index, child) in internal.children().iter().enumerate() {
                    let offset = (writer.len() - start) as u64;
                    writer.patch_u64(table + index * 8, offset);
                    self.encode_into(child, writer);
                }
            }
        }
    }

    /// Decode a node whose branching factors, from its own level down to the
    /// leaf level, are `log2_dims`
    pub fn decode(
        &self,
        bytes: &[u8],
        kind: NodeKind,
        log2_dims: &[u32],
        origin: IVec3,
    ) -> VdbResult<Node> {
        let expected = match log2_dims.len() {
            0 => return Err(corrupt_data("node without a level layout")),
            1 => NodeKind::Leaf,
            _ => NodeKind::Internal,
        };
        if kind != expected {
            return Err(corrupt_data(format!(
                "{:?} node requested at a level holding {:?} nodes",
                kind, expected
            )));
        }

        match kind {
            NodeKind::Leaf => self.decode_leaf(bytes, log2_dims[0], origin).map(Node::Leaf),
            NodeKind::Internal => self.decode_internal(bytes, log2_dims, origin).map(Node::Internal),
        }
    }

    fn decode_leaf(&self, bytes: &[u8], log2_dim: u32, origin: IVec3) -> VdbResult<LeafNode> {
        let slots = 1usize << (3 * log2_dim);
        let mut reader = ByteReader::new(bytes, self.encoding.byte_order);

        let value_mask = NodeMask::from_bytes(reader.take(NodeMask::byte_len(slots))?, slots)?;
        let active = value_mask.count_on();
        if active == 0 {
            return Err(corrupt_data(format!("leaf at {} has no active voxels", origin)));
        }
        if reader.remaining() != active * self.encoding.width() {
            return Err(corrupt_data(format!(
                "leaf at {} holds {} value bytes for {} active voxels",
                origin,
                reader.remaining(),
                active
            )));
        }

        let values = (0..active)
            .map(|_| reader.get_value(&self.encoding))
            .collect::<VdbResult<Vec<f32>>>()?;
        LeafNode::new(origin, log2_dim, value_mask, values)
    }

    fn decode_internal(
        &self,
        bytes: &[u8],
        log2_dims: &[u32],
        origin: IVec3,
    ) -> VdbResult<InternalNode> {
        let log2_dim = log2_dims[0];
        let child_dims = &log2_dims[1..];
        let child_log2_span: u32 = child_dims.iter().sum();
        let child_kind = if child_dims.len() == 1 {
            NodeKind::Leaf
        } else {
            NodeKind::Internal
        };

        let mut reader = ByteReader::new(bytes, self.encoding.byte_order);
        let header = self.read_internal_header(&mut reader, log2_dim)?;
        let offsets = header.child_ranges(bytes.len(), reader.position())?;

        let mut children = Vec::with_capacity(offsets.len());
        for (slot, range) in header.child_slots().zip(offsets) {
            let child_origin = origin + (slot_coord(slot, log2_dim) << child_log2_span as i32);
            children.push(self.decode(&bytes[range], child_kind, child_dims, child_origin)?);
        }

        InternalNode::new(
            origin,
            log2_dim,
            child_log2_span,
            header.presence_mask,
            header.tile_mask,
            header.tiles,
            children,
        )
    }

    fn read_internal_header(
        &self,
        reader: &mut ByteReader<'_>,
        log2_dim: u32,
    ) -> VdbResult<InternalHeader> {
        let slots = 1usize << (3 * log2_dim);
        let mask_len = NodeMask::byte_len(slots);

        let presence_mask = NodeMask::from_bytes(reader.take(mask_len)?, slots)?;
        let tile_mask = NodeMask::from_bytes(reader.take(mask_len)?, slots)?;
        if presence_mask.is_off() {
            return Err(corrupt_data("internal node has no populated slots"));
        }
        if !tile_mask.is_subset_of(&presence_mask) {
            return Err(corrupt_data("tile mask marks slots that are not present"));
        }

        let tiles = (0..tile_mask.count_on())
            .map(|_| reader.get_value(&self.encoding))
            .collect::<VdbResult<Vec<f32>>>()?;

        let child_count = presence_mask.count_on() - tile_mask.count_on();
        let mut offsets = Vec::with_capacity(child_count);
        for _ in 0..child_count {
            offsets.push(reader.get_u64()?);
        }

        Ok(InternalHeader {
            presence_mask,
            tile_mask,
            tiles,
            offsets,
        })
    }

    /// Encoded bytes of the child in `slot` of an encoded internal node
    ///
    /// Returns `None` when the slot is empty or holds a tile. Only the masks
    /// and the offset table are parsed; sibling subtrees are not touched.
    pub fn child_bytes<'a>(
        &self,
        bytes: &'a [u8],
        log2_dim: u32,
        slot: usize,
    ) -> VdbResult<Option<&'a [u8]>> {
        let mut reader = ByteReader::new(bytes, self.encoding.byte_order);
        let header = self.read_internal_header(&mut reader, log2_dim)?;
        if slot >= header.presence_mask.len()
            || !header.presence_mask.is_on(slot)
            || header.tile_mask.is_on(slot)
        {
            return Ok(None);
        }

        let rank = header.presence_mask.rank(slot) - header.tile_mask.rank(slot);
        let ranges = header.child_ranges(bytes.len(), reader.position())?;
        Ok(Some(&bytes[ranges[rank].clone()]))
    }
}

/// Masks, tiles and raw offsets of an encoded internal node
struct InternalHeader {
    presence_mask: NodeMask,
    tile_mask: NodeMask,
    tiles: Vec<f32>,
    offsets: Vec<u64>,
}

impl InternalHeader {
    fn child_slots(&self) -> impl Iterator<Item = usize> + '_ {
        self.presence_mask
            .iter_on()
            .filter(move |&slot| !self.tile_mask.is_on(slot))
    }

    /// Byte range of every child, validated against the node length
    fn child_ranges(
        &self,
        node_len: usize,
        table_end: usize,
    ) -> VdbResult<Vec<std::ops::Range<usize>>> {
        if self.offsets.is_empty() {
            if node_len != table_end {
                return Err(corrupt_data(format!(
                    "internal node without children has {} trailing bytes",
                    node_len - table_end
                )));
            }
            return Ok(Vec::new());
        }

        let mut ranges = Vec::with_capacity(self.offsets.len());
        let mut expected_start = table_end;
        for (index, &offset) in self.offsets.iter().enumerate() {
            let start = usize::try_from(offset).unwrap_or(usize::MAX);
            if start != expected_start {
                return Err(corrupt_data(format!(
                    "child {} starts at offset {}, expected {}",
                    index, offset, expected_start
                )));
            }
            let end = match self.offsets.get(index + 1) {
                Some(&next) => usize::try_from(next).unwrap_or(usize::MAX),
                None => node_len,
            };
            if end <= start || end > node_len {
                return Err(corrupt_data(format!(
                    "child {} has invalid byte range {}..{} in a node of {} bytes",
                    index, start, end, node_len
                )));
            }
            ranges.push(start..end);
            expected_start = end;
        }
        Ok(ranges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ByteOrder, ValueType};
    use crate::error::VdbError;

    fn leaf(origin: IVec3, active: &[(usize, f32)]) -> Node {
        let mut mask = NodeMask::new(512);
        for (slot, _) in active {
            mask.set_on(*slot);
        }
        let values = active.iter().map(|(_, v)| *v).collect();
        Node::Leaf(LeafNode::new(origin, 3, mask, values).expect("leaf is consistent"))
    }

    /// 2^3 slots of 8^3 leaves: slot 0 and 7 children, slot 3 a tile
    fn internal() -> Node {
        let mut presence = NodeMask::new(8);
        let mut tiles = NodeMask::new(8);
        for slot in [0, 3, 7] {
            presence.set_on(slot);
        }
        tiles.set_on(3);

        let children = vec![
            leaf(IVec3::ZERO, &[(0, 255.0)]),
            leaf(IVec3::new(8, 8, 8), &[(1, 2.0), (511, 3.0)]),
        ];
        Node::Internal(
            InternalNode::new(IVec3::ZERO, 1, 3, presence, tiles, vec![42.0], children)
                .expect("internal node is consistent"),
        )
    }

    #[test]
    fn test_leaf_layout() {
        let codec = NodeCodec::new(ValueEncoding::default());
        let bytes = codec.encode(&leaf(IVec3::ZERO, &[(0, 255.0)]));

        assert_eq!(bytes.len(), 64 + 4);
        assert_eq!(bytes[0], 0b1000_0000);
        assert!(bytes[1..64].iter().all(|&b| b == 0));
        assert_eq!(&bytes[64..], &255.0f32.to_le_bytes());
    }

    #[test]
    fn test_internal_round_trip() {
        for encoding in [
            ValueEncoding::new(ValueType::F32, ByteOrder::Little),
            ValueEncoding::new(ValueType::F64, ByteOrder::Big),
            ValueEncoding::new(ValueType::U8, ByteOrder::Little),
            ValueEncoding::new(ValueType::U16, ByteOrder::Big),
        ] {
            let codec = NodeCodec::new(encoding);
            let node = internal();
            let bytes = codec.encode(&node);
            let decoded = codec
                .decode(&bytes, NodeKind::Internal, &[1, 3], IVec3::ZERO)
                .expect("encoded node decodes");
            assert_eq!(decoded, node, "round trip with {:?}", encoding);
        }
    }

    #[test]
    fn test_child_random_access() {
        let codec = NodeCodec::new(ValueEncoding::default());
        let node = internal();
        let bytes = codec.encode(&node);

        let child = codec
            .child_bytes(&bytes, 1, 7)
            .expect("header parses")
            .expect("slot 7 holds a child");
        let decoded = codec
            .decode(child, NodeKind::Leaf, &[3], IVec3::new(8, 8, 8))
            .expect("child decodes on its own");
        assert_eq!(decoded, leaf(IVec3::new(8, 8, 8), &[(1, 2.0), (511, 3.0)]));

        assert_eq!(codec.child_bytes(&bytes, 1, 3).expect("header parses"), None);
        assert_eq!(codec.child_bytes(&bytes, 1, 5).expect("header parses"), None);
    }

    #[test]
    fn test_rejects_tile_outside_presence() {
        let codec = NodeCodec::new(ValueEncoding::default());
        let mut bytes = codec.encode(&internal());
        // tile mask byte: also claim slot 1, which is absent
        bytes[1] |= 0b0100_0000;

        let result = codec.decode(&bytes, NodeKind::Internal, &[1, 3], IVec3::ZERO);
        assert!(matches!(result, Err(VdbError::CorruptData(_))));
    }

    #[test]
    fn test_rejects_truncated_and_padded_leaves() {
        let codec = NodeCodec::new(ValueEncoding::default());
        let bytes = codec.encode(&leaf(IVec3::ZERO, &[(0, 1.0), (9, 2.0)]));

        let truncated = &bytes[..bytes.len() - 1];
        assert!(codec.decode(truncated, NodeKind::Leaf, &[3], IVec3::ZERO).is_err());

        let mut padded = bytes.clone();
        padded.push(0);
        assert!(codec.decode(&padded, NodeKind::Leaf, &[3], IVec3::ZERO).is_err());
    }

    #[test]
    fn test_rejects_bad_offsets() {
        let codec = NodeCodec::new(ValueEncoding::default());
        let mut bytes = codec.encode(&internal());
        // first offset sits after two 1-byte masks and one f32 tile
        bytes[6..14].copy_from_slice(&5u64.to_le_bytes());

        let result = codec.decode(&bytes, NodeKind::Internal, &[1, 3], IVec3::ZERO);
        assert!(matches!(result, Err(VdbError::CorruptData(_))));
    }

    #[test]
    fn test_rejects_kind_mismatch() {
        let codec = NodeCodec::new(ValueEncoding::default());
        let bytes = codec.encode(&leaf(IVec3::ZERO, &[(0, 1.0)]));
        assert!(codec.decode(&bytes, NodeKind::Internal, &[3], IVec3::ZERO).is_err());
    }
}
