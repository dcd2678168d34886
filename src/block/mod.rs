pub mod allocator;
pub mod files;
pub mod header;
pub mod storage;

pub use allocator::Allocator;
pub use header::{BlockFileHeader, FileLock};

/// Size in bytes of the header at the start of every block file.
pub const BLOCK_HEADER_SIZE: usize = 8192;

/// Bytes of the header preceding the allocation bitmap.
pub const HEADER_FIELDS_SIZE: usize = 80;

/// Number of 32-bit words in the allocation bitmap.
pub const MAP_WORDS: usize = (BLOCK_HEADER_SIZE - HEADER_FIELDS_SIZE) / 4;

/// Largest number of blocks a block file can track.
pub const MAX_BLOCKS: u32 = (MAP_WORDS * 32) as u32;

pub const BLOCK_MAGIC: u32 = 0xc104_cac3;

/// Format version 2.0.
pub const CURRENT_VERSION: u32 = 0x0002_0000;

/// First file number used for chained files. Lower numbers belong to the
/// well-known file of each block type.
pub const FIRST_ADDITIONAL_BLOCK_FILE: u32 = 4;
