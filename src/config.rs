//! Configuration options for the hfstore storage engine.

/// Default block size for new data files (in bytes).
pub const DEFAULT_BLOCK_SIZE: u16 = 2048;

/// Smallest accepted block size. Leaves room for a full header with a
/// 255-byte key plus payload.
pub const MIN_BLOCK_SIZE: u16 = 512;

/// Maximum encoded length of a key.
pub const MAX_KEY_LENGTH: usize = 255;

/// Configuration options for opening a store.
#[derive(Debug, Clone)]
pub struct Options {
    /// Create the store directory if it doesn't exist.
    /// Default: true
    pub create_if_missing: bool,

    /// Error if the store directory already exists.
    /// Default: false
    pub error_if_exists: bool,

    /// Block size requested for a new data file (in bytes).
    /// An existing data file keeps the block size it was created with.
    /// Default: 2KB
    pub block_size: u16,

    /// Compression algorithm for large payloads.
    /// Default: CompressionType::Snappy
    pub compression: CompressionType,

    /// Payloads whose encoded size exceeds this many kilobytes are compressed.
    /// Set to 0 to disable compression.
    /// Default: 100
    pub compress_over_kb: u32,

    /// Sync the data file after every set or delete.
    /// Default: false
    pub sync_writes: bool,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            create_if_missing: true,
            error_if_exists: false,
            block_size: DEFAULT_BLOCK_SIZE,
            compression: CompressionType::default(),
            compress_over_kb: 100,
            sync_writes: false,
        }
    }
}

/// Compression algorithms supported by hfstore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum CompressionType {
    /// No compression.
    None = 0,

    /// Snappy compression (fast, moderate compression ratio).
    #[cfg(feature = "snappy")]
    Snappy = 1,
}

impl Default for CompressionType {
    fn default() -> Self {
        #[cfg(feature = "snappy")]
        return CompressionType::Snappy;

        #[cfg(not(feature = "snappy"))]
        CompressionType::None
    }
}

impl Options {
    /// Creates a new Options with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets whether to create the store if it doesn't exist.
    pub fn create_if_missing(mut self, value: bool) -> Self {
        self.create_if_missing = value;
        self
    }

    /// Sets whether opening an existing store is an error.
    pub fn error_if_exists(mut self, value: bool) -> Self {
        self.error_if_exists = value;
        self
    }

    /// Sets the block size for a new data file.
    pub fn block_size(mut self, size: u16) -> Self {
        self.block_size = size;
        self
    }

    /// Sets the compression algorithm.
    pub fn compression(mut self, compression: CompressionType) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the compression threshold in kilobytes.
    pub fn compress_over_kb(mut self, kb: u32) -> Self {
        self.compress_over_kb = kb;
        self
    }

    /// Enables or disables syncing after every mutation.
    pub fn sync_writes(mut self, value: bool) -> Self {
        self.sync_writes = value;
        self
    }

    /// Payload size in bytes above which compression kicks in, if any.
    pub fn compression_threshold(&self) -> Option<usize> {
        if self.compression == CompressionType::None || self.compress_over_kb == 0 {
            None
        } else {
            Some(self.compress_over_kb as usize * 1024)
        }
    }

    /// Validates the options and returns an error if any are invalid.
    pub fn validate(&self) -> crate::Result<()> {
        if self.block_size < MIN_BLOCK_SIZE {
            return Err(crate::Error::invalid_argument(format!(
                "block_size must be >= {}",
                MIN_BLOCK_SIZE
            )));
        }
        Ok(())
    }
}
