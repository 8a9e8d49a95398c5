//! Byte-order aware cursors
//!
//! Every multi-byte field goes through these helpers so that the byte order
//! declared in the file header is honoured everywhere, independent of the
//! host.

use crate::codec::{ByteOrder, ValueEncoding, ValueType};
use crate::error::{corrupt_data, VdbResult};

macro_rules! put_int {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self, value: $ty) {
            match self.order {
                ByteOrder::Little => self.buf.extend_from_slice(&value.to_le_bytes()),
                ByteOrder::Big => self.buf.extend_from_slice(&value.to_be_bytes()),
            }
        }
    };
}

macro_rules! get_int {
    ($name:ident, $ty:ty) => {
        pub fn $name(&mut self) -> VdbResult<$ty> {
            const N: usize = std::mem::size_of::<$ty>();
            let bytes: [u8; N] = self
                .take(N)?
                .try_into()
                .map_err(|_| corrupt_data("short read"))?;
            Ok(match self.order {
                ByteOrder::Little => <$ty>::from_le_bytes(bytes),
                ByteOrder::Big => <$ty>::from_be_bytes(bytes),
            })
        }
    };
}

/// Growable output buffer writing in a fixed byte order
#[derive(Debug)]
pub struct ByteWriter {
    buf: Vec<u8>,
    order: ByteOrder,
}

impl ByteWriter {
    pub fn new(order: ByteOrder) -> Self {
        Self {
            buf: Vec::new(),
            order,
        }
    }

    pub fn with_capacity(order: ByteOrder, capacity: usize) -> Self {
        Self {
            buf: Vec::with_capacity(capacity),
            order,
        }
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }

    pub fn put_u8(&mut self, value: u8) {
        self.buf.push(value);
    }

    pub fn put_bytes(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    put_int!(put_u16, u16);
    put_int!(put_u32, u32);
    put_int!(put_u64, u64);
    put_int!(put_i32, i32);
    put_int!(put_i64, i64);
    put_int!(put_f32, f32);
    put_int!(put_f64, f64);

    /// Length-prefixed UTF-8 string
    pub fn put_str(&mut self, value: &str) {
        self.put_u32(value.len() as u32);
        self.put_bytes(value.as_bytes());
    }

    /// Overwrite a `u64` previously written at `offset`
    pub fn patch_u64(&mut self, offset: usize, value: u64) {
        let bytes = match self.order {
            ByteOrder::Little => value.to_le_bytes(),
            ByteOrder::Big => value.to_be_bytes(),
        };
        self.buf[offset..offset + 8].copy_from_slice(&bytes);
    }

    /// One scalar in the given value encoding
    ///
    /// Integer encodings round to nearest and saturate at the type bounds.
    pub fn put_value(&mut self, value: f32, value_type: ValueType) {
        match value_type {
            ValueType::F32 => self.put_f32(value),
            ValueType::F64 => self.put_f64(value as f64),
            ValueType::U8 => self.put_u8(value.round() as u8),
            ValueType::U16 => self.put_u16(value.round() as u16),
        }
    }
}

/// Bounds-checked reader over an encoded byte slice
#[derive(Debug, Clone)]
pub struct ByteReader<'a> {
    data: &'a [u8],
    pos: usize,
    order: ByteOrder,
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8], order: ByteOrder) -> Self {
        Self {
            data,
            pos: 0,
            order,
        }
    }

    pub fn position(&self) -> usize {
        self.pos
    }

    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    pub fn set_order(&mut self, order: ByteOrder) {
        self.order = order;
    }

    /// Next `len` bytes; running past the end is corruption
    pub fn take(&mut self, len: usize) -> VdbResult<&'a [u8]> {
        if len > self.remaining() {
            return Err(corrupt_data(format!(
                "unexpected end of data: need {} bytes at offset {}, {} left",
                len,
                self.pos,
                self.remaining()
            )));
        }
        let slice = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    pub fn get_u8(&mut self) -> VdbResult<u8> {
        Ok(self.take(1)?[0])
    }

    get_int!(get_u16, u16);
    get_int!(get_u32, u32);
    get_int!(get_u64, u64);
    get_int!(get_i32, i32);
    get_int!(get_i64, i64);
    get_int!(get_f32, f32);
    get_int!(get_f64, f64);

    /// Length-prefixed UTF-8 string
    pub fn get_str(&mut self) -> VdbResult<String> {
        let len = self.get_u32()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|e| corrupt_data(format!("invalid UTF-8 string: {}", e)))
    }

    /// Length as `usize`, rejecting values that cannot fit in the remaining data
    pub fn get_len(&mut self) -> VdbResult<usize> {
        let len = self.get_u64()?;
        usize::try_from(len)
            .ok()
            .filter(|&len| len <= self.remaining())
            .ok_or_else(|| corrupt_data(format!("length {} exceeds the remaining data", len)))
    }

    pub fn get_value(&mut self, encoding: &ValueEncoding) -> VdbResult<f32> {
        match encoding.value_type {
            ValueType::F32 => self.get_f32(),
            ValueType::F64 => Ok(self.get_f64()? as f32),
            ValueType::U8 => Ok(self.get_u8()? as f32),
            ValueType::U16 => Ok(self.get_u16()? as f32),
        }
    }
}
