//! Error taxonomy for building, encoding and decoding grids
//!
//! Every failure in the crate is one of these kinds. Nothing is retried
//! internally and nothing is repaired: build and write errors abort the whole
//! export job, decode errors abort that decode.

use std::path::Path;

/// Result type for grid operations
pub type VdbResult<T> = Result<T, VdbError>;

/// Errors that can occur while building, writing or reading a grid
#[derive(Debug, thiserror::Error)]
pub enum VdbError {
    /// Malformed or degenerate input geometry
    #[error("Invalid volume: {0}")]
    InvalidVolume(String),

    /// Version, value width or byte order the decoder does not support
    #[error("Unsupported encoding: {0}")]
    UnsupportedEncoding(String),

    /// Underlying storage failure
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Checksum mismatch or structurally inconsistent data
    #[error("Corrupt data: {0}")]
    CorruptData(String),

    /// Rejected configuration value
    #[error("Configuration error: {0}")]
    Config(String),
}

impl VdbError {
    /// Whether the caller may retry the whole job
    pub fn is_retryable(&self) -> bool {
        matches!(self, VdbError::Io(_))
    }
}

/// Helper trait attaching a path to I/O failures
pub trait IoContext<T> {
    fn io_context(self, action: &str, path: &Path) -> VdbResult<T>;
}

impl<T> IoContext<T> for Result<T, std::io::Error> {
    fn io_context(self, action: &str, path: &Path) -> VdbResult<T> {
        self.map_err(|e| {
            VdbError::Io(std::io::Error::new(
                e.kind(),
                format!("{} {}: {}", action, path.display(), e),
            ))
        })
    }
}

/// Create an invalid volume error
pub fn invalid_volume(reason: impl Into<String>) -> VdbError {
    VdbError::InvalidVolume(reason.into())
}

/// Create an unsupported encoding error
pub fn unsupported(reason: impl Into<String>) -> VdbError {
    VdbError::UnsupportedEncoding(reason.into())
}

/// Create a corrupted data error
pub fn corrupt_data(reason: impl Into<String>) -> VdbError {
    VdbError::CorruptData(reason.into())
}

/// Create a configuration error
pub fn config_error(reason: impl Into<String>) -> VdbError {
    VdbError::Config(reason.into())
}
