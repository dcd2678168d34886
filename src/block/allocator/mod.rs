pub mod bitmap;

pub use bitmap::{
    classify_nibble, create_map_block, delete_map_block, fix_allocation_counters, used_map_block,
};

use crate::error::Result;

/// An implementation of `Allocator` can manage runs of 1 to 4 blocks.
pub trait Allocator {
    /// Allocates `count` contiguous blocks, returning the index of the first.
    fn allocate(&mut self, count: u32) -> Result<u32>;

    /// Deallocates `count` blocks starting at `start`.
    fn deallocate(&mut self, start: u32, count: u32) -> Result<()>;

    /// Returns the number of blocks known to be available for allocation.
    fn available(&self) -> u32;
}
