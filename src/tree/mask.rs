//! Fixed-size bit masks for node slots
//!
//! Bits are stored in a `BitVec` in slot scan order. On disk a mask occupies
//! `ceil(len / 8)` bytes with the most significant bit of each byte first,
//! which is what `BitVec::to_bytes` produces.

use bit_vec::BitVec;

use crate::error::{corrupt_data, VdbResult};

/// Bit mask over the slots of one node
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeMask {
    bits: BitVec,
}

impl NodeMask {
    /// All-off mask of `len` bits
    pub fn new(len: usize) -> Self {
        Self {
            bits: BitVec::from_elem(len, false),
        }
    }

    /// Bytes needed to store a mask of `len` bits
    pub fn byte_len(len: usize) -> usize {
        len.div_ceil(8)
    }

    /// Parse a mask of `len` bits; padding bits in the last byte must be off
    pub fn from_bytes(bytes: &[u8], len: usize) -> VdbResult<Self> {
        if bytes.len() != Self::byte_len(len) {
            return Err(corrupt_data(format!(
                "mask of {} bits needs {} bytes, got {}",
                len,
                Self::byte_len(len),
                bytes.len()
            )));
        }

        let mut bits = BitVec::from_bytes(bytes);
        if bits.iter().skip(len).any(|b| b) {
            return Err(corrupt_data("mask has bits set past its length"));
        }
        bits.truncate(len);

        Ok(Self { bits })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.to_bytes()
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }

    #[inline]
    pub fn set_on(&mut self, index: usize) {
        self.bits.set(index, true);
    }

    #[inline]
    pub fn is_on(&self, index: usize) -> bool {
        self.bits.get(index).unwrap_or(false)
    }

    pub fn count_on(&self) -> usize {
        self.bits
            .storage()
            .iter()
            .map(|block| block.count_ones() as usize)
            .sum()
    }

    pub fn is_off(&self) -> bool {
        self.bits.none()
    }

    /// Number of on bits strictly before `index`
    pub fn rank(&self, index: usize) -> usize {
        let storage = self.bits.storage();
        let full = index / 32;
        let rem = index % 32;

        let mut count: usize = storage[..full.min(storage.len())]
            .iter()
            .map(|block| block.count_ones() as usize)
            .sum();
        if rem > 0 {
            if let Some(block) = storage.get(full) {
                count += (block & ((1u32 << rem) - 1)).count_ones() as usize;
            }
        }
        count
    }

    /// Indices of on bits in ascending order
    pub fn iter_on(&self) -> impl Iterator<Item = usize> + '_ {
        self.bits
            .storage()
            .iter()
            .enumerate()
            .flat_map(|(word_index, &word)| {
                let mut word = word;
                std::iter::from_fn(move || {
                    if word == 0 {
                        return None;
                    }
                    let bit = word.trailing_zeros() as usize;
                    word &= word - 1;
                    Some(word_index * 32 + bit)
                })
            })
    }

    /// Whether every on bit of `self` is also on in `other`
    pub fn is_subset_of(&self, other: &NodeMask) -> bool {
        self.len() == other.len()
            && self
                .bits
                .storage()
                .iter()
                .zip(other.bits.storage())
                .all(|(a, b)| a & !b == 0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rank_and_iteration() {
        let mut mask = NodeMask::new(512);
        for index in [0, 5, 31, 32, 100, 511] {
            mask.set_on(index);
        }

        assert_eq!(mask.count_on(), 6);
        assert_eq!(mask.rank(0), 0);
        assert_eq!(mask.rank(6), 2);
        assert_eq!(mask.rank(32), 3);
        assert_eq!(mask.rank(33), 4);
        assert_eq!(mask.rank(511), 5);
        assert_eq!(mask.iter_on().collect::<Vec<_>>(), vec![0, 5, 31, 32, 100, 511]);
    }

    #[test]
    fn test_byte_layout_is_msb_first() {
        let mut mask = NodeMask::new(12);
        mask.set_on(0);
        mask.set_on(9);

        let bytes = mask.to_bytes();
        assert_eq!(bytes, vec![0b1000_0000, 0b0100_0000]);

        let parsed = NodeMask::from_bytes(&bytes, 12).expect("mask bytes are valid");
        assert_eq!(parsed, mask);
    }

    #[test]
    fn test_rejects_bad_mask_bytes() {
        assert!(NodeMask::from_bytes(&[0xff], 12).is_err());
        // bit 12 lies in the padding of a 12-bit mask
        assert!(NodeMask::from_bytes(&[0x00, 0b0000_1000], 12).is_err());
    }

    #[test]
    fn test_subset() {
        let mut tiles = NodeMask::new(64);
        let mut present = NodeMask::new(64);
        present.set_on(3);
        present.set_on(40);
        tiles.set_on(40);

        assert!(tiles.is_subset_of(&present));
        tiles.set_on(41);
        assert!(!tiles.is_subset_of(&present));
    }
}
