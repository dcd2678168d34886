use std::ops::{Deref, DerefMut};

use bitvec::prelude::*;
use zerocopy::{
    FromBytes, FromZeros, Immutable, IntoBytes, KnownLayout, Unaligned,
    little_endian::{I16, I32, U32},
};

use crate::{
    addr::{FileType, MAX_NUM_BLOCKS},
    block::{BLOCK_HEADER_SIZE, BLOCK_MAGIC, CURRENT_VERSION, MAP_WORDS},
};

/// Control structure stored at the start of every block file.
///
/// `empty[i]` counts nibbles of the bitmap whose leading free run is `i + 1`
/// blocks long, so it counts runs, not blocks. `hints[i]` is the bitmap word
/// where the last run of class `i + 1` was found.
#[repr(C)]
#[derive(FromBytes, IntoBytes, Immutable, KnownLayout, Unaligned)]
pub struct BlockFileHeader {
    pub magic: U32,
    pub version: U32,
    pub this_file: I16,
    pub next_file: I16,
    pub entry_size: I32,
    pub num_entries: I32,
    pub max_entries: I32,
    pub empty: [I32; 4],
    pub hints: [I32; 4],
    /// Non-zero while the header is being modified.
    pub updating: I32,
    pub user: [I32; 5],
    pub allocation_map: [U32; MAP_WORDS],
}

const _: () = assert!(size_of::<BlockFileHeader>() == BLOCK_HEADER_SIZE);

impl BlockFileHeader {
    /// Constructs the header of an empty file holding blocks of `file_type`.
    pub fn new(file_type: FileType, this_file: u32) -> Box<Self> {
        let mut header = Box::new(Self::new_zeroed());
        header.magic.set(BLOCK_MAGIC);
        header.version.set(CURRENT_VERSION);
        header.this_file.set(this_file as i16);
        header.entry_size.set(file_type.block_size() as i32);
        header
    }

    /// Returns true if the magic number and format version are known.
    pub fn is_valid(&self) -> bool {
        self.magic.get() == BLOCK_MAGIC && self.version.get() == CURRENT_VERSION
    }

    pub fn this_file(&self) -> u32 {
        self.this_file.get() as u32
    }

    pub fn next_file(&self) -> u32 {
        self.next_file.get() as u32
    }

    pub fn entry_size(&self) -> u32 {
        self.entry_size.get().max(0) as u32
    }

    pub fn num_entries(&self) -> u32 {
        self.num_entries.get().max(0) as u32
    }

    pub fn max_entries(&self) -> u32 {
        self.max_entries.get().max(0) as u32
    }

    /// Number of bitmap words covering `max_entries`.
    pub fn map_words(&self) -> usize {
        (self.max_entries() as usize / 32).min(MAP_WORDS)
    }

    /// Returns the number of free runs of `class` blocks.
    pub fn empty(&self, class: u32) -> i32 {
        self.empty[class as usize - 1].get()
    }

    pub(crate) fn add_empty(&mut self, class: u32, delta: i32) {
        let counter = &mut self.empty[class as usize - 1];
        counter.set(counter.get() + delta);
        debug_assert!(counter.get() >= 0, "negative free run count");
    }

    pub(crate) fn add_entries(&mut self, delta: i32) {
        self.num_entries.set(self.num_entries.get() + delta);
        debug_assert!(self.num_entries.get() >= 0, "negative entry count");
    }

    /// Returns the number of blocks in the free runs tracked by `empty`.
    pub fn empty_blocks(&self) -> u32 {
        (1..=MAX_NUM_BLOCKS)
            .map(|class| self.empty(class).max(0) as u32 * class)
            .sum()
    }

    /// Returns the bitmap as a bit slice, bit `i` tracking block `i`.
    pub fn map_bits(&self) -> &BitSlice<u8, Lsb0> {
        self.allocation_map.as_bytes().view_bits::<Lsb0>()
    }

    /// Returns the expected length of a file with this header.
    pub fn expected_len(&self) -> u64 {
        u64::from(self.entry_size()) * u64::from(self.max_entries()) + BLOCK_HEADER_SIZE as u64
    }
}

/// Marks a header as being modified for as long as the guard lives.
///
/// If the process dies while a `FileLock` exists, `updating` stays non-zero
/// on disk and the file is repaired when it is opened again. This provides no
/// mutual exclusion.
pub struct FileLock<'a> {
    header: &'a mut BlockFileHeader,
}

impl<'a> FileLock<'a> {
    pub fn new(header: &'a mut BlockFileHeader) -> Self {
        header.updating.set(header.updating.get() + 1);
        Self { header }
    }
}

impl Deref for FileLock<'_> {
    type Target = BlockFileHeader;

    fn deref(&self) -> &Self::Target {
        self.header
    }
}

impl DerefMut for FileLock<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        self.header
    }
}

impl Drop for FileLock<'_> {
    fn drop(&mut self) {
        self.header.updating.set(self.header.updating.get() - 1);
    }
}
