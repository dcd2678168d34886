use std::{
    ops::Range,
    path::{Path, PathBuf},
    sync::Arc,
};

use parking_lot::{Mutex, RwLock};
use zerocopy::{FromBytes, IntoBytes};

use crate::{
    addr::{Addr, FileType, MAX_BLOCK_FILE, MAX_NUM_BLOCKS},
    block::{
        BLOCK_HEADER_SIZE, FIRST_ADDITIONAL_BLOCK_FILE, MAX_BLOCKS,
        allocator::{Allocator, fix_allocation_counters, used_map_block},
        header::{BlockFileHeader, FileLock},
        storage::MappedFile,
    },
    config::Config,
    error::{Error, Result},
};

/// Prefix of every block file name.
pub const BLOCK_NAME: &str = "data_";

/// A header repair is only attempted while fewer nested updates than this are
/// pending.
const MAX_PENDING_UPDATES: i32 = 10;

/// Value of `updating` marking a file that failed to grow and must be
/// replaced at the next start.
const BROKEN_FILE_MARK: i32 = 100;

/// An open block file.
pub struct BlockFile {
    storage: MappedFile,
    removed: bool,
}

impl BlockFile {
    pub fn header(&self) -> &BlockFileHeader {
        BlockFileHeader::ref_from_prefix(self.storage.bytes())
            .expect("block files are never mapped shorter than a header")
            .0
    }

    pub fn header_mut(&mut self) -> &mut BlockFileHeader {
        BlockFileHeader::mut_from_prefix(self.storage.bytes_mut())
            .expect("block files are never mapped shorter than a header")
            .0
    }

    pub fn path(&self) -> &Path {
        self.storage.path()
    }

    /// Returns the length of the file in bytes.
    pub fn len(&self) -> u64 {
        self.storage.len()
    }

    pub fn is_empty(&self) -> bool {
        self.header().num_entries() == 0
    }

    fn corrupted(&self, reason: impl Into<String>) -> Error {
        Error::Corrupted {
            path: self.path().to_owned(),
            reason: reason.into(),
        }
    }

    /// Returns the byte range of a record inside the mapping.
    fn record_range(&self, addr: Addr) -> Result<Range<usize>> {
        let header = self.header();
        if addr.block_size() != header.entry_size()
            || addr.start_block() + addr.num_blocks() > header.max_entries()
        {
            return Err(Error::InvalidAddress(addr));
        }

        let start = BLOCK_HEADER_SIZE + addr.start_block() as usize * header.entry_size() as usize;
        let end = start + addr.record_size() as usize;
        if end as u64 > self.len() {
            return Err(Error::InvalidAddress(addr));
        }
        Ok(start..end)
    }

    /// Checks the file length against the header and rebuilds the allocation
    /// counters.
    ///
    /// A file longer than the header says is the result of a growth that was
    /// interrupted and is adopted. Any other mismatch is corruption.
    fn fix_header(&mut self) -> Result<()> {
        let file_len = self.len();
        let header = self.header();
        let entry_size = u64::from(header.entry_size());
        let expected = header.expected_len();

        if file_len != expected {
            let max_expected = entry_size * u64::from(MAX_BLOCKS) + BLOCK_HEADER_SIZE as u64;
            if entry_size == 0
                || file_len < expected
                || header.empty(4) != 0
                || file_len > max_expected
            {
                log::error!(
                    "unexpected size of {}: {file_len} bytes, expected {expected}",
                    self.path().display()
                );
                return Err(self.corrupted(format!(
                    "{file_len} bytes where the header expects {expected}"
                )));
            }

            // Files only ever grow by whole bitmap words.
            let data_len = file_len - BLOCK_HEADER_SIZE as u64;
            let max_entries = data_len / entry_size;
            if data_len % entry_size != 0 || max_entries % 32 != 0 {
                log::error!(
                    "{} is not a whole number of bitmap words long",
                    self.path().display()
                );
                return Err(self.corrupted(format!("partial block run of {file_len} bytes")));
            }
            log::warn!(
                "{} was growing, adopting {max_entries} blocks",
                self.path().display()
            );
            self.header_mut().max_entries.set(max_entries as i32);
        }

        let header = self.header_mut();
        fix_allocation_counters(header);
        header.updating.set(0);
        Ok(())
    }

    /// Adds `config.growth_increment` blocks to the file, up to
    /// `config.max_blocks`.
    fn grow(&mut self, config: &Config) -> Result<()> {
        let header = self.header();
        let old_size = header.max_entries();
        if old_size >= config.max_blocks {
            return Err(Error::NoSpace);
        }
        let new_size = (old_size + config.growth_increment).min(config.max_blocks);
        let new_len = u64::from(header.entry_size()) * u64::from(new_size) + BLOCK_HEADER_SIZE as u64;

        begin_update(self.header_mut());
        let result = if new_len < self.len() {
            Err(self.corrupted("growing would truncate the file"))
        } else {
            self.storage.set_len(new_len)
        };

        if let Err(err) = result {
            log::error!("failed to grow {}: {err}", self.path().display());
            if self.header().updating.get() < MAX_PENDING_UPDATES {
                // The header may be wrong after an earlier crash.
                if let Err(fix_err) = self.fix_header() {
                    log::error!("{} is marked for replacement: {fix_err}", self.path().display());
                    self.header_mut().updating.set(BROKEN_FILE_MARK);
                    return Err(err);
                }
            } else {
                end_update(self.header_mut());
            }
            return if self.header().max_entries() >= new_size {
                Ok(())
            } else {
                Err(err)
            };
        }

        let header = self.header_mut();
        header.add_empty(MAX_NUM_BLOCKS, ((new_size - old_size) / MAX_NUM_BLOCKS) as i32);
        header.max_entries.set(new_size as i32);
        end_update(header);

        log::debug!(
            "grew {} from {old_size} to {new_size} blocks",
            self.path().display()
        );
        Ok(())
    }
}

fn begin_update(header: &mut BlockFileHeader) {
    header.updating.set(header.updating.get() + 1);
}

fn end_update(header: &mut BlockFileHeader) {
    header.updating.set(header.updating.get() - 1);
}

/// Files seen while following a chain of next files.
struct ChainWalk {
    visited: [bool; MAX_BLOCK_FILE as usize + 1],
}

impl ChainWalk {
    fn new(first: u32) -> Self {
        let mut visited = [false; MAX_BLOCK_FILE as usize + 1];
        visited[first as usize] = true;
        Self { visited }
    }

    /// Checks that `next` is a chained file not seen before on this walk.
    fn step(&mut self, file: &BlockFile, next: u32) -> Result<()> {
        if next < FIRST_ADDITIONAL_BLOCK_FILE {
            return Err(file.corrupted(format!("chained to well-known file {next}")));
        }
        match self.visited.get_mut(next as usize) {
            Some(seen) if !*seen => {
                *seen = true;
                Ok(())
            }
            Some(_) => {
                log::error!("block file chain loops at {}", file.path().display());
                Err(file.corrupted("block file chain loops"))
            }
            None => Err(file.corrupted(format!("next file {next} out of range"))),
        }
    }
}

/// Where a new block of a given size should go.
#[derive(Debug, PartialEq, Eq)]
enum Placement {
    Use,
    Grow,
    Switch,
}

/// Statistics of one block file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileStats {
    pub file_number: u32,
    pub file_type: Option<FileType>,
    pub entry_size: u32,
    pub max_entries: u32,
    pub num_entries: u32,
    pub empty: [i32; 4],
    pub next_file: u32,
    pub updating: i32,
    pub file_len: u64,
}

impl FileStats {
    fn new(file_number: u32, file: &BlockFile) -> Self {
        let header = file.header();
        Self {
            file_number,
            file_type: FileType::from_entry_size(header.entry_size()),
            entry_size: header.entry_size(),
            max_entries: header.max_entries(),
            num_entries: header.num_entries(),
            empty: [1, 2, 3, 4].map(|class| header.empty(class)),
            next_file: header.next_file(),
            updating: header.updating.get(),
            file_len: file.len(),
        }
    }
}

type SharedFile = Arc<Mutex<BlockFile>>;

/// The set of block files of one cache directory.
///
/// Each file is guarded by its own mutex, which covers its bitmap, counters
/// and length. The list of open files has a separate lock that is never held
/// while waiting for a file.
pub struct BlockFiles {
    path: PathBuf,
    config: Config,
    files: RwLock<Vec<Option<SharedFile>>>,
    init: bool,
}

impl BlockFiles {
    /// Constructs a closed set of block files stored in `path`.
    pub fn new(path: impl Into<PathBuf>, config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            path: path.into(),
            config,
            files: RwLock::new(Vec::new()),
            init: false,
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.init
    }

    /// Opens the well-known file of every block type, creating them first
    /// if `create` is set.
    pub fn init(&mut self, create: bool) -> Result<()> {
        if self.init {
            return Err(Error::AlreadyInitialized);
        }

        let mut files = Vec::with_capacity(FIRST_ADDITIONAL_BLOCK_FILE as usize);
        for (index, file_type) in FileType::BLOCK_TYPES.into_iter().enumerate() {
            let index = index as u32;
            if create {
                self.create_block_file(index, file_type, true)?;
            }
            files.push(Some(Arc::new(Mutex::new(self.open_block_file(index)?))));
        }

        *self.files.get_mut() = files;
        self.init = true;
        Ok(())
    }

    /// Flushes and closes every open file.
    pub fn close(&mut self) -> Result<()> {
        let result = self.flush();
        self.files.get_mut().clear();
        self.init = false;
        result
    }

    /// Writes every open file back to disk.
    pub fn flush(&self) -> Result<()> {
        let files: Vec<SharedFile> = self.files.read().iter().flatten().cloned().collect();
        for file in files {
            file.lock().storage.flush()?;
        }
        Ok(())
    }

    /// Returns the path of the file with the given number.
    pub fn name(&self, index: u32) -> PathBuf {
        self.path.join(format!("{BLOCK_NAME}{index}"))
    }

    fn create_block_file(&self, index: u32, file_type: FileType, force: bool) -> Result<()> {
        let header = BlockFileHeader::new(file_type, index);
        MappedFile::create(&self.name(index), header.as_bytes(), force)?;
        Ok(())
    }

    fn open_block_file(&self, index: u32) -> Result<BlockFile> {
        let name = self.name(index);
        let storage = MappedFile::open(&name, BLOCK_HEADER_SIZE).inspect_err(|err| {
            log::error!("failed to open {}: {err}", name.display());
        })?;
        let mut file = BlockFile {
            storage,
            removed: false,
        };

        let header = file.header();
        if !header.is_valid() || FileType::from_entry_size(header.entry_size()).is_none() {
            log::error!("invalid file version or magic in {}", name.display());
            return Err(Error::InvalidHeader { path: name });
        }

        if header.updating.get() != 0 {
            log::warn!("{} was not closed properly, repairing", name.display());
            file.fix_header()?;
        } else if header.expected_len() != file.len() {
            log::warn!("{} has an unexpected size, repairing", name.display());
            file.fix_header()?;
        }
        Ok(file)
    }

    /// Returns the file with the given number, opening it if needed.
    pub fn get_file(&self, file_number: u32) -> Result<SharedFile> {
        if !self.init {
            return Err(Error::NotInitialized);
        }
        let index = file_number as usize;
        if let Some(Some(file)) = self.files.read().get(index) {
            return Ok(file.clone());
        }

        let mut files = self.files.write();
        if let Some(Some(file)) = files.get(index) {
            return Ok(file.clone());
        }
        let file = Arc::new(Mutex::new(self.open_block_file(file_number)?));
        if files.len() <= index {
            files.resize(index + 1, None);
        }
        files[index] = Some(file.clone());
        Ok(file)
    }

    /// Allocates `block_count` contiguous blocks of `file_type`.
    ///
    /// Files are grown, or chained to a new file, as needed. A request is
    /// retried once if the counters of a file turn out to be wrong.
    pub fn create_block(&self, file_type: FileType, block_count: u32) -> Result<Addr> {
        if file_type == FileType::External {
            return Err(Error::InvalidArgument("external records have no block file"));
        }
        if !(1..=MAX_NUM_BLOCKS).contains(&block_count) {
            return Err(Error::InvalidArgument("records span 1 to 4 blocks"));
        }
        if !self.init {
            return Err(Error::NotInitialized);
        }

        match self.try_create_block(file_type, block_count) {
            Err(Error::CounterDesync) => {
                log::warn!("retrying allocation of {block_count} {file_type:?} blocks");
                self.try_create_block(file_type, block_count)
            }
            result => result,
        }
    }

    fn try_create_block(&self, file_type: FileType, block_count: u32) -> Result<Addr> {
        let first = file_type as u32 - 1;
        let mut walk = ChainWalk::new(first);
        let mut file_number = first;
        let mut file = self.get_file(first)?.lock_arc();

        loop {
            if file.removed {
                drop(file);
                walk = ChainWalk::new(first);
                file_number = first;
                file = self.get_file(first)?.lock_arc();
                continue;
            }
            if file.header().entry_size() != file_type.block_size() {
                return Err(file.corrupted("chained to a file of another type"));
            }

            match self.placement(file.header(), block_count) {
                Placement::Use => {}
                Placement::Grow => file.grow(&self.config)?,
                Placement::Switch => {
                    let next = self.next_file(&mut file)?;
                    walk.step(&file, next)?;
                    // The current file stays locked until the next one is,
                    // so the link cannot be removed in between.
                    let next_file = self.get_file(next)?.lock_arc();
                    file = next_file;
                    file_number = next;
                    continue;
                }
            }

            let start = file.header_mut().allocate(block_count)?;
            return Ok(Addr::new(file_type, block_count, file_number, start));
        }
    }

    /// Decides whether a file can take a new run of `block_count` blocks.
    ///
    /// A file that already has a next file is skipped while it is nearly
    /// full, so that it has room for more than a few records once it is used
    /// again.
    fn placement(&self, header: &BlockFileHeader, block_count: u32) -> Placement {
        let have_space = (block_count..=MAX_NUM_BLOCKS).any(|class| header.empty(class) > 0);
        let prefer_switch =
            header.next_file() != 0 && header.empty_blocks() < self.config.switch_threshold();

        if have_space && !prefer_switch {
            Placement::Use
        } else if prefer_switch || header.max_entries() >= self.config.max_blocks {
            Placement::Switch
        } else {
            Placement::Grow
        }
    }

    /// Returns the number of the file chained after `file`, creating it if
    /// there is none yet.
    fn next_file(&self, file: &mut BlockFile) -> Result<u32> {
        let next = file.header().next_file();
        if next != 0 {
            return Ok(next);
        }

        let file_type = FileType::from_entry_size(file.header().entry_size())
            .ok_or_else(|| file.corrupted("unknown entry size"))?;
        let new_file = self.create_next_block_file(file_type)?;
        {
            let mut header = FileLock::new(file.header_mut());
            header.next_file.set(new_file as i16);
        }
        file.storage.flush()?;

        log::info!(
            "chained {} to {BLOCK_NAME}{new_file}",
            file.path().display()
        );
        Ok(new_file)
    }

    fn create_next_block_file(&self, file_type: FileType) -> Result<u32> {
        for index in FIRST_ADDITIONAL_BLOCK_FILE..=MAX_BLOCK_FILE {
            match self.create_block_file(index, file_type, false) {
                Ok(()) => return Ok(index),
                Err(Error::Io(err)) if err.kind() == std::io::ErrorKind::AlreadyExists => {}
                Err(err) => return Err(err),
            }
        }
        log::error!("no file number left for {file_type:?} blocks");
        Err(Error::NoSpace)
    }

    /// Releases the blocks of `addr`. With `deep`, the record's bytes are
    /// zeroed first.
    ///
    /// Uninitialized and separate-file addresses are ignored.
    pub fn delete_block(&self, addr: Addr, deep: bool) -> Result<()> {
        if !addr.is_initialized() || addr.is_separate_file() {
            return Ok(());
        }
        if !addr.sanity_check() {
            return Err(Error::InvalidAddress(addr));
        }

        let shared = self.get_file(addr.file_number())?;
        let mut file = shared.lock();
        if file.removed {
            return Err(Error::InvalidAddress(addr));
        }
        let range = file.record_range(addr)?;
        if deep {
            file.storage.bytes_mut()[range].fill(0);
        }
        file.header_mut()
            .deallocate(addr.start_block(), addr.num_blocks())
    }

    /// Grows the file with the given number by one increment.
    pub fn grow_block_file(&self, file_number: u32) -> Result<()> {
        let shared = self.get_file(file_number)?;
        let mut file = shared.lock();
        file.grow(&self.config)
    }

    /// Validates the length of a file against its header and rebuilds its
    /// allocation counters.
    pub fn fix_block_file_header(&self, file_number: u32) -> Result<()> {
        let shared = self.get_file(file_number)?;
        let mut file = shared.lock();
        file.fix_header()
    }

    /// Returns true if `addr` points to blocks that are in use.
    pub fn is_valid(&self, addr: Addr) -> bool {
        if !addr.is_initialized() || addr.is_separate_file() || !addr.sanity_check() {
            return false;
        }
        let Ok(shared) = self.get_file(addr.file_number()) else {
            return false;
        };
        let file = shared.lock();
        !file.removed
            && file.record_range(addr).is_ok()
            && used_map_block(addr.start_block(), addr.num_blocks(), file.header())
    }

    /// Reads `buf.len()` bytes of a record, starting at `offset`.
    pub fn read(&self, addr: Addr, offset: usize, buf: &mut [u8]) -> Result<()> {
        self.with_record(addr, offset, buf.len(), |file, range| {
            buf.copy_from_slice(&file.storage.bytes()[range]);
        })
    }

    /// Writes `data` into a record, starting at `offset`.
    pub fn write(&self, addr: Addr, offset: usize, data: &[u8]) -> Result<()> {
        self.with_record(addr, offset, data.len(), |file, range| {
            file.storage.bytes_mut()[range].copy_from_slice(data);
        })
    }

    fn with_record<F>(&self, addr: Addr, offset: usize, len: usize, f: F) -> Result<()>
    where
        F: FnOnce(&mut BlockFile, Range<usize>),
    {
        if !addr.is_initialized() || addr.is_separate_file() || !addr.sanity_check() {
            return Err(Error::InvalidAddress(addr));
        }
        let end = offset
            .checked_add(len)
            .filter(|&end| end <= addr.record_size() as usize)
            .ok_or(Error::InvalidArgument("access past the end of the record"))?;

        let shared = self.get_file(addr.file_number())?;
        let mut file = shared.lock();
        if file.removed {
            return Err(Error::InvalidAddress(addr));
        }
        let record = file.record_range(addr)?;
        f(&mut file, record.start + offset..record.start + end);
        Ok(())
    }

    /// Deletes the chained files of `file_type` that hold no records and
    /// returns how many were removed.
    pub fn remove_empty_files(&self, file_type: FileType) -> Result<usize> {
        if file_type == FileType::External {
            return Err(Error::InvalidArgument("external records have no block file"));
        }

        let first = file_type as u32 - 1;
        let mut walk = ChainWalk::new(first);
        let mut file = self.get_file(first)?.lock_arc();
        let mut removed = 0;
        loop {
            let next_number = file.header().next_file();
            if next_number == 0 {
                return Ok(removed);
            }
            walk.step(&file, next_number)?;

            let mut next = self.get_file(next_number)?.lock_arc();
            if !next.is_empty() {
                file = next;
                continue;
            }

            let after = next.header().next_file();
            {
                let mut header = FileLock::new(file.header_mut());
                header.next_file.set(after as i16);
            }
            file.storage.flush()?;
            next.removed = true;

            // Unlinked under the registry lock so that nobody reopens it first.
            let name = self.name(next_number);
            let mut files = self.files.write();
            match std::fs::remove_file(&name) {
                Ok(()) => log::info!("removed empty {}", name.display()),
                Err(err) => log::error!("failed to delete {}: {err}", name.display()),
            }
            if let Some(slot) = files.get_mut(next_number as usize) {
                *slot = None;
            }
            drop(files);
            drop(next);
            removed += 1;
        }
    }

    /// Returns statistics of every file, following the chain of each type.
    pub fn stats(&self) -> Result<Vec<FileStats>> {
        let mut stats = Vec::new();
        for file_type in FileType::BLOCK_TYPES {
            let mut file_number = file_type as u32 - 1;
            for _ in 0..=MAX_BLOCK_FILE {
                let shared = self.get_file(file_number)?;
                let file = shared.lock();
                let file_stats = FileStats::new(file_number, &file);
                file_number = file_stats.next_file;
                stats.push(file_stats);
                if file_number == 0 {
                    break;
                }
            }
        }
        Ok(stats)
    }
}

impl Drop for BlockFiles {
    fn drop(&mut self) {
        if let Err(err) = self.flush() {
            log::error!("failed to flush block files: {err}");
        }
    }
}
