use crate::{
    block::MAX_BLOCKS,
    error::{Error, Result},
};

/// Growth and chaining policy of a set of block files.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// Blocks added to a file each time it grows. Must be a multiple of 32.
    pub growth_increment: u32,

    /// Largest number of blocks a single file may hold.
    pub max_blocks: u32,

    /// A file that already has a chained next file is skipped once fewer than
    /// this percentage of `max_blocks` blocks is free in it.
    pub switch_free_percent: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            growth_increment: 1024,
            max_blocks: MAX_BLOCKS,
            switch_free_percent: 10,
        }
    }
}

impl Config {
    pub fn validate(&self) -> Result<()> {
        if self.growth_increment == 0 || self.growth_increment % 32 != 0 {
            return Err(Error::InvalidArgument(
                "growth increment must be a non-zero multiple of 32",
            ));
        }
        if self.max_blocks == 0 || self.max_blocks > MAX_BLOCKS || self.max_blocks % 32 != 0 {
            return Err(Error::InvalidArgument(
                "max blocks must be a non-zero multiple of 32 within the bitmap",
            ));
        }
        if self.switch_free_percent > 100 {
            return Err(Error::InvalidArgument(
                "switch threshold is a percentage",
            ));
        }
        Ok(())
    }

    /// Number of free blocks under which a chained file is skipped.
    pub(crate) fn switch_threshold(&self) -> u32 {
        (u64::from(self.max_blocks) * u64::from(self.switch_free_percent) / 100) as u32
    }
}
