use std::io::{Read, Write};

use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression as FlateCompression;
use serde::{Deserialize, Serialize};

use crate::error::{corrupt_data, unsupported, VdbResult};

/// Compression applied to each top-level node blob
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockCompression {
    /// Store node encodings as they are
    #[default]
    None,
    /// Zlib (deflate), always available
    Zlib,
    /// Zstandard, requires the `native` feature
    Zstd,
    /// LZ4 with a size prefix, requires the `native` feature
    Lz4,
}

impl BlockCompression {
    pub fn tag(self) -> u8 {
        match self {
            BlockCompression::None => 0,
            BlockCompression::Zlib => 1,
            BlockCompression::Zstd => 2,
            BlockCompression::Lz4 => 3,
        }
    }

    pub fn from_tag(tag: u8) -> VdbResult<Self> {
        match tag {
            0 => Ok(BlockCompression::None),
            1 => Ok(BlockCompression::Zlib),
            2 => Ok(BlockCompression::Zstd),
            3 => Ok(BlockCompression::Lz4),
            other => Err(unsupported(format!("unknown compression tag {}", other))),
        }
    }

    /// Whether this build can encode and decode the scheme
    pub fn is_available(self) -> bool {
        match self {
            BlockCompression::None | BlockCompression::Zlib => true,
            BlockCompression::Zstd | BlockCompression::Lz4 => cfg!(feature = "native"),
        }
    }

    pub fn ensure_available(self) -> VdbResult<()> {
        if self.is_available() {
            Ok(())
        } else {
            Err(unsupported(format!(
                "{:?} compression is not compiled into this build",
                self
            )))
        }
    }
}

/// Compresses and decompresses node blobs
#[derive(Debug, Clone, Copy)]
pub struct Compressor {
    compression: BlockCompression,
}

impl Compressor {
    pub fn new(compression: BlockCompression) -> VdbResult<Self> {
        compression.ensure_available()?;
        Ok(Self { compression })
    }

    pub fn compression(&self) -> BlockCompression {
        self.compression
    }

    pub fn compress(&self, data: Vec<u8>) -> VdbResult<Vec<u8>> {
        match self.compression {
            BlockCompression::None => Ok(data),
            BlockCompression::Zlib => compress_zlib(&data),
            BlockCompression::Zstd => compress_zstd(&data),
            BlockCompression::Lz4 => compress_lz4(&data),
        }
    }

    pub fn decompress<'a>(&self, data: &'a [u8]) -> VdbResult<std::borrow::Cow<'a, [u8]>> {
        match self.compression {
            BlockCompression::None => Ok(std::borrow::Cow::Borrowed(data)),
            BlockCompression::Zlib => decompress_zlib(data).map(std::borrow::Cow::Owned),
            BlockCompression::Zstd => decompress_zstd(data).map(std::borrow::Cow::Owned),
            BlockCompression::Lz4 => decompress_lz4(data).map(std::borrow::Cow::Owned),
        }
    }
}

fn compress_zlib(data: &[u8]) -> VdbResult<Vec<u8>> {
    let mut encoder = ZlibEncoder::new(Vec::new(), FlateCompression::default());
    encoder.write_all(data)?;
    Ok(encoder.finish()?)
}

fn decompress_zlib(data: &[u8]) -> VdbResult<Vec<u8>> {
    let mut decoder = ZlibDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .map_err(|e| corrupt_data(format!("Zlib decompression failed: {}", e)))?;
    Ok(decompressed)
}

#[cfg(feature = "native")]
fn compress_zstd(data: &[u8]) -> VdbResult<Vec<u8>> {
    Ok(zstd::encode_all(data, 3)?)
}

#[cfg(feature = "native")]
fn decompress_zstd(data: &[u8]) -> VdbResult<Vec<u8>> {
    zstd::decode_all(data).map_err(|e| corrupt_data(format!("Zstd decompression failed: {}", e)))
}

#[cfg(feature = "native")]
fn compress_lz4(data: &[u8]) -> VdbResult<Vec<u8>> {
    Ok(lz4_flex::compress_prepend_size(data))
}

#[cfg(feature = "native")]
fn decompress_lz4(data: &[u8]) -> VdbResult<Vec<u8>> {
    lz4_flex::decompress_size_prepended(data)
        .map_err(|e| corrupt_data(format!("LZ4 decompression failed: {}", e)))
}

#[cfg(not(feature = "native"))]
fn compress_zstd(_data: &[u8]) -> VdbResult<Vec<u8>> {
    BlockCompression::Zstd.ensure_available().map(|_| Vec::new())
}

#[cfg(not(feature = "native"))]
fn decompress_zstd(_data: &[u8]) -> VdbResult<Vec<u8>> {
    BlockCompression::Zstd.ensure_available().map(|_| Vec::new())
}

#[cfg(not(feature = "native"))]
fn compress_lz4(_data: &[u8]) -> VdbResult<Vec<u8>> {
    BlockCompression::Lz4.ensure_available().map(|_| Vec::new())
}

#[cfg(not(feature = "native"))]
fn decompress_lz4(_data: &[u8]) -> VdbResult<Vec<u8>> {
    BlockCompression::Lz4.ensure_available().map(|_| Vec::new())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_blob() -> Vec<u8> {
        (0..4096u32).map(|i| (i % 7) as u8).collect()
    }

    #[test]
    fn test_zlib_round_trip() {
        let compressor = Compressor::new(BlockCompression::Zlib).expect("zlib is always available");
        let data = sample_blob();
        let compressed = compressor.compress(data.clone()).expect("compression succeeds");
        assert!(compressed.len() < data.len());

        let restored = compressor.decompress(&compressed).expect("decompression succeeds");
        assert_eq!(restored.as_ref(), data.as_slice());
    }

    #[cfg(feature = "native")]
    #[test]
    fn test_native_round_trips() {
        for compression in [BlockCompression::Zstd, BlockCompression::Lz4] {
            let compressor = Compressor::new(compression).expect("native codecs are available");
            let data = sample_blob();
            let compressed = compressor.compress(data.clone()).expect("compression succeeds");
            let restored = compressor.decompress(&compressed).expect("decompression succeeds");
            assert_eq!(restored.as_ref(), data.as_slice(), "{:?}", compression);
        }
    }

    #[test]
    fn test_garbage_is_corruption() {
        let compressor = Compressor::new(BlockCompression::Zlib).expect("zlib is always available");
        let result = compressor.decompress(&[0xde, 0xad, 0xbe, 0xef]);
        assert!(matches!(result, Err(crate::error::VdbError::CorruptData(_))));
    }

    #[test]
    fn test_unknown_tag() {
        assert!(BlockCompression::from_tag(7).is_err());
        assert_eq!(BlockCompression::from_tag(1).expect("known tag"), BlockCompression::Zlib);
    }
}
