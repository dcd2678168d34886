use std::fmt;

const INITIALIZED_MASK: u32 = 0x8000_0000;
const FILE_TYPE_MASK: u32 = 0x7000_0000;
const FILE_TYPE_OFFSET: u32 = 28;
const RESERVED_MASK: u32 = 0x0c00_0000;
const NUM_BLOCKS_MASK: u32 = 0x0300_0000;
const NUM_BLOCKS_OFFSET: u32 = 24;
const FILE_SELECTOR_MASK: u32 = 0x00ff_0000;
const FILE_SELECTOR_OFFSET: u32 = 16;
const START_BLOCK_MASK: u32 = 0x0000_ffff;
const FILE_NAME_MASK: u32 = 0x0fff_ffff;

/// Largest number of contiguous blocks a single record may span.
pub const MAX_NUM_BLOCKS: u32 = 4;

/// Largest file number a block-file address can refer to.
pub const MAX_BLOCK_FILE: u32 = 255;

/// Size classes of stored records.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum FileType {
    /// Stored in a standalone file, outside of any block file.
    External = 0,
    Rankings = 1,
    Block256 = 2,
    Block1K = 3,
    Block4K = 4,
}

impl FileType {
    /// Every type that is backed by a block file, in file-number order.
    pub const BLOCK_TYPES: [FileType; 4] = [
        FileType::Rankings,
        FileType::Block256,
        FileType::Block1K,
        FileType::Block4K,
    ];

    /// Returns the size in bytes of one block of this type, or 0 for
    /// [`FileType::External`].
    pub const fn block_size(self) -> u32 {
        match self {
            FileType::External => 0,
            FileType::Rankings => 36,
            FileType::Block256 => 256,
            FileType::Block1K => 1024,
            FileType::Block4K => 4096,
        }
    }

    /// Returns the smallest type able to hold a record of `size` bytes in at
    /// most [`MAX_NUM_BLOCKS`] blocks.
    pub const fn required_for(size: u32) -> Self {
        if size < 1024 {
            FileType::Block256
        } else if size < 4096 {
            FileType::Block1K
        } else if size <= 4096 * 4 {
            FileType::Block4K
        } else {
            FileType::External
        }
    }

    /// Maps a block size back to its type.
    pub fn from_entry_size(entry_size: u32) -> Option<Self> {
        Self::BLOCK_TYPES
            .into_iter()
            .find(|t| t.block_size() == entry_size)
    }

    fn from_bits(bits: u32) -> Option<Self> {
        match bits {
            0 => Some(FileType::External),
            1 => Some(FileType::Rankings),
            2 => Some(FileType::Block256),
            3 => Some(FileType::Block1K),
            4 => Some(FileType::Block4K),
            _ => None,
        }
    }
}

/// A record's location on disk.
///
/// Block-file addresses select a file, a block type, a start block and a
/// count of 1 to 4 blocks. Separate-file addresses only carry a file number.
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Addr(u32);

impl Addr {
    /// Encodes a block-file address.
    ///
    /// # Panics
    /// Panics if:
    /// - `file_type` is [`FileType::External`]
    /// - `num_blocks` is not in `1..=4`
    /// - `file_number` is larger than [`MAX_BLOCK_FILE`]
    /// - `start_block` does not fit in 16 bits
    pub fn new(file_type: FileType, num_blocks: u32, file_number: u32, start_block: u32) -> Self {
        assert!(
            file_type != FileType::External,
            "external records have no block address"
        );
        assert!(
            (1..=MAX_NUM_BLOCKS).contains(&num_blocks),
            "'num_blocks' must be in 1..=4, got {num_blocks}"
        );
        assert!(
            file_number <= MAX_BLOCK_FILE,
            "'file_number' {file_number} out of range"
        );
        assert!(
            start_block <= START_BLOCK_MASK,
            "'start_block' {start_block} out of range"
        );

        Self(
            INITIALIZED_MASK
                | (file_type as u32) << FILE_TYPE_OFFSET
                | (num_blocks - 1) << NUM_BLOCKS_OFFSET
                | file_number << FILE_SELECTOR_OFFSET
                | start_block,
        )
    }

    /// Encodes the address of a record stored in its own file.
    ///
    /// # Panics
    /// Panics if `file_number` does not fit in 28 bits.
    pub fn new_separate_file(file_number: u32) -> Self {
        assert!(
            file_number <= FILE_NAME_MASK,
            "'file_number' {file_number} out of range"
        );
        Self(INITIALIZED_MASK | file_number)
    }

    pub const fn from_value(value: u32) -> Self {
        Self(value)
    }

    pub const fn value(&self) -> u32 {
        self.0
    }

    pub const fn is_initialized(&self) -> bool {
        self.0 & INITIALIZED_MASK != 0
    }

    pub const fn is_separate_file(&self) -> bool {
        self.0 & FILE_TYPE_MASK == 0
    }

    pub const fn is_block_file(&self) -> bool {
        !self.is_separate_file()
    }

    /// Returns the record type, or `None` if the type bits hold an unknown
    /// value.
    pub fn file_type(&self) -> Option<FileType> {
        FileType::from_bits((self.0 & FILE_TYPE_MASK) >> FILE_TYPE_OFFSET)
    }

    pub fn file_number(&self) -> u32 {
        if self.is_separate_file() {
            self.0 & FILE_NAME_MASK
        } else {
            (self.0 & FILE_SELECTOR_MASK) >> FILE_SELECTOR_OFFSET
        }
    }

    pub fn start_block(&self) -> u32 {
        debug_assert!(self.is_block_file());
        self.0 & START_BLOCK_MASK
    }

    pub fn num_blocks(&self) -> u32 {
        debug_assert!(self.is_block_file());
        ((self.0 & NUM_BLOCKS_MASK) >> NUM_BLOCKS_OFFSET) + 1
    }

    /// Returns the size of one block of this address' type.
    pub fn block_size(&self) -> u32 {
        self.file_type().map_or(0, FileType::block_size)
    }

    /// Returns the number of bytes spanned by the record.
    pub fn record_size(&self) -> u32 {
        if self.is_separate_file() {
            return 0;
        }
        self.block_size() * self.num_blocks()
    }

    /// Checks that the encoded fields are self-consistent. Does not look at
    /// any file.
    pub fn sanity_check(&self) -> bool {
        if !self.is_initialized() {
            return self.0 == 0;
        }
        if self.is_separate_file() {
            return true;
        }
        match self.file_type() {
            Some(FileType::External) | None => false,
            Some(_) => {
                self.0 & RESERVED_MASK == 0
                    && self.start_block() + self.num_blocks() <= START_BLOCK_MASK + 1
            }
        }
    }
}

impl fmt::Debug for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.is_initialized() {
            return write!(f, "Addr(none)");
        }
        if self.is_separate_file() {
            return write!(f, "Addr(f_{:06x})", self.file_number());
        }
        f.debug_struct("Addr")
            .field("file_type", &self.file_type())
            .field("file", &self.file_number())
            .field("start", &self.start_block())
            .field("blocks", &self.num_blocks())
            .finish()
    }
}

impl fmt::Display for Addr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_block_file() {
        let addr = Addr::new(FileType::Block1K, 3, 5, 0x1234);
        assert!(addr.is_initialized());
        assert!(addr.is_block_file());
        assert_eq!(addr.file_type(), Some(FileType::Block1K));
        assert_eq!(addr.num_blocks(), 3);
        assert_eq!(addr.file_number(), 5);
        assert_eq!(addr.start_block(), 0x1234);
        assert_eq!(addr.record_size(), 3 * 1024);
        assert_eq!(addr.value(), 0xb205_1234);
    }

    #[test]
    fn encode_separate_file() {
        let addr = Addr::new_separate_file(0x12_3456);
        assert!(addr.is_initialized());
        assert!(addr.is_separate_file());
        assert_eq!(addr.file_type(), Some(FileType::External));
        assert_eq!(addr.file_number(), 0x12_3456);
        assert_eq!(addr.block_size(), 0);
    }

    #[test]
    fn default_is_uninitialized() {
        let addr = Addr::default();
        assert!(!addr.is_initialized());
        assert!(addr.sanity_check());
    }

    #[test]
    #[should_panic]
    fn too_many_blocks() {
        Addr::new(FileType::Block256, 5, 0, 0);
    }

    #[test]
    #[should_panic]
    fn zero_blocks() {
        Addr::new(FileType::Block256, 0, 0, 0);
    }

    #[test]
    #[should_panic]
    fn external_block_address() {
        Addr::new(FileType::External, 1, 0, 0);
    }

    #[test]
    fn sanity_check() {
        assert!(Addr::new(FileType::Rankings, 1, 0, 10).sanity_check());
        // Reserved bits set
        assert!(!Addr::from_value(0xa400_0001).sanity_check());
        // Unknown type
        assert!(!Addr::from_value(0xf000_0001).sanity_check());
        // Runs past the addressable range
        assert!(!Addr::new(FileType::Block4K, 4, 1, 0xfffe).sanity_check());
        // Garbage without the initialized bit
        assert!(!Addr::from_value(0x0000_0010).sanity_check());
    }

    #[test]
    fn block_sizes() {
        assert_eq!(FileType::External.block_size(), 0);
        assert_eq!(FileType::Rankings.block_size(), 36);
        assert_eq!(FileType::Block256.block_size(), 256);
        assert_eq!(FileType::Block1K.block_size(), 1024);
        assert_eq!(FileType::Block4K.block_size(), 4096);
    }

    #[test]
    fn required_file_type() {
        assert_eq!(FileType::required_for(1), FileType::Block256);
        assert_eq!(FileType::required_for(1023), FileType::Block256);
        assert_eq!(FileType::required_for(1024), FileType::Block1K);
        assert_eq!(FileType::required_for(4095), FileType::Block1K);
        assert_eq!(FileType::required_for(4096), FileType::Block4K);
        assert_eq!(FileType::required_for(16384), FileType::Block4K);
        assert_eq!(FileType::required_for(16385), FileType::External);
    }

    #[test]
    fn from_entry_size() {
        for file_type in FileType::BLOCK_TYPES {
            assert_eq!(
                FileType::from_entry_size(file_type.block_size()),
                Some(file_type)
            );
        }
        assert_eq!(FileType::from_entry_size(512), None);
    }
}
