//! Error types for the hfstore storage engine.

use crate::record::ChainFault;
use std::io;
use thiserror::Error;

/// The result type used throughout hfstore.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for hfstore operations.
#[derive(Debug, Error)]
pub enum Error {
    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Data corruption was detected in a file outside the block chains.
    #[error("Data corruption: {0}")]
    Corruption(String),

    /// A block chain failed structural validation.
    #[error("Structural mismatch at block {block}: {fault}")]
    StructuralMismatch {
        /// The block where the walk stopped.
        block: u32,
        /// What was wrong with it.
        fault: ChainFault,
    },

    /// An invalid argument was provided.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The key does not fit in the embedded key field.
    #[error("Key too long: {len} bytes, maximum is {max}")]
    KeyTooLong {
        /// Encoded length of the rejected key.
        len: usize,
        /// Maximum encoded key length.
        max: usize,
    },

    /// The store is in an invalid state.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A serialization or deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Compressing or decompressing a payload failed.
    #[error("Compression error: {0}")]
    Compression(String),

    /// A checksum mismatch was detected.
    #[error("Checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch {
        /// The expected checksum value.
        expected: u32,
        /// The actual checksum value.
        actual: u32,
    },

    /// The store already exists.
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// A file or directory was not found.
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation needs a feature this build does not include.
    #[error("Not supported: {0}")]
    NotSupported(String),
}

impl Error {
    /// Creates a new corruption error.
    pub fn corruption(msg: impl Into<String>) -> Self {
        Error::Corruption(msg.into())
    }

    /// Creates a new invalid argument error.
    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Error::InvalidArgument(msg.into())
    }

    /// Creates a new invalid state error.
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a structural mismatch error for `block`.
    pub fn structural(block: u32, fault: impl Into<ChainFault>) -> Self {
        Error::StructuralMismatch { block, fault: fault.into() }
    }

    /// Returns true for block chain faults.
    pub fn is_structural(&self) -> bool {
        matches!(self, Error::StructuralMismatch { .. })
    }

    /// Returns true if a persisted file could not be trusted.
    ///
    /// The store answers these at open time with a rebuild.
    pub fn is_corruption(&self) -> bool {
        matches!(self, Error::Corruption(_) | Error::ChecksumMismatch { .. })
    }
}

impl From<bincode::Error> for Error {
    fn from(err: bincode::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
