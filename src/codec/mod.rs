//! Node codec and scalar encodings
//!
//! Scalars are written with a fixed width in a fixed byte order. Both are
//! recorded in the file header as one-byte tags; a decoder seeing a tag it
//! does not know reports `UnsupportedEncoding` instead of guessing.

mod bytes;
mod node;

pub use bytes::{ByteReader, ByteWriter};
pub use node::NodeCodec;

use serde::{Deserialize, Serialize};

use crate::error::{unsupported, VdbResult};

/// Byte order of every multi-byte field in a file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ByteOrder {
    Little,
    Big,
}

impl ByteOrder {
    pub fn tag(self) -> u8 {
        match self {
            ByteOrder::Little => 0,
            ByteOrder::Big => 1,
        }
    }

    pub fn from_tag(tag: u8) -> VdbResult<Self> {
        match tag {
            0 => Ok(ByteOrder::Little),
            1 => Ok(ByteOrder::Big),
            other => Err(unsupported(format!("unknown byte order tag {}", other))),
        }
    }
}

/// Stored width and interpretation of one scalar
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    F32,
    F64,
    U8,
    U16,
}

impl ValueType {
    pub fn tag(self) -> u8 {
        match self {
            ValueType::F32 => 0,
            ValueType::F64 => 1,
            ValueType::U8 => 2,
            ValueType::U16 => 3,
        }
    }

    pub fn from_tag(tag: u8) -> VdbResult<Self> {
        match tag {
            0 => Ok(ValueType::F32),
            1 => Ok(ValueType::F64),
            2 => Ok(ValueType::U8),
            3 => Ok(ValueType::U16),
            other => Err(unsupported(format!("unknown value type tag {}", other))),
        }
    }

    /// Bytes per stored scalar
    pub fn width(self) -> usize {
        match self {
            ValueType::F32 => 4,
            ValueType::F64 => 8,
            ValueType::U8 => 1,
            ValueType::U16 => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ValueType::F32 => "float",
            ValueType::F64 => "double",
            ValueType::U8 => "uint8",
            ValueType::U16 => "uint16",
        }
    }

    /// Whether `value` survives a write/read cycle unchanged
    pub fn represents_exactly(self, value: f32) -> bool {
        match self {
            ValueType::F32 | ValueType::F64 => true,
            ValueType::U8 => value.fract() == 0.0 && (0.0..=255.0).contains(&value),
            ValueType::U16 => value.fract() == 0.0 && (0.0..=65535.0).contains(&value),
        }
    }
}

/// Scalar width plus byte order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ValueEncoding {
    pub value_type: ValueType,
    pub byte_order: ByteOrder,
}

impl ValueEncoding {
    pub fn new(value_type: ValueType, byte_order: ByteOrder) -> Self {
        Self {
            value_type,
            byte_order,
        }
    }

    pub fn width(&self) -> usize {
        self.value_type.width()
    }
}

impl Default for ValueEncoding {
    fn default() -> Self {
        Self {
            value_type: ValueType::F32,
            byte_order: ByteOrder::Little,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VdbError;

    #[test]
    fn test_tags_round_trip() {
        for value_type in [ValueType::F32, ValueType::F64, ValueType::U8, ValueType::U16] {
            let tag = value_type.tag();
            assert_eq!(ValueType::from_tag(tag).expect("known tag"), value_type);
        }
        for order in [ByteOrder::Little, ByteOrder::Big] {
            assert_eq!(ByteOrder::from_tag(order.tag()).expect("known tag"), order);
        }
    }

    #[test]
    fn test_unknown_tags_are_unsupported() {
        assert!(matches!(ValueType::from_tag(9), Err(VdbError::UnsupportedEncoding(_))));
        assert!(matches!(ByteOrder::from_tag(2), Err(VdbError::UnsupportedEncoding(_))));
    }

    #[test]
    fn test_exact_representation() {
        assert!(ValueType::U8.represents_exactly(255.0));
        assert!(!ValueType::U8.represents_exactly(255.5));
        assert!(!ValueType::U8.represents_exactly(256.0));
        assert!(ValueType::U16.represents_exactly(1000.0));
        assert!(ValueType::F32.represents_exactly(0.1));
    }
}
