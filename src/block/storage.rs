use std::{
    fs::{File, OpenOptions},
    path::{Path, PathBuf},
};

use memmap2::MmapMut;

use crate::error::{Error, Result};

/// A file mapped into memory as a whole.
///
/// The mapping is replaced when the file changes length, which requires
/// `&mut self`, so no slice of the old mapping can outlive a resize.
pub struct MappedFile {
    path: PathBuf,
    file: File,
    mmap: MmapMut,
}

impl MappedFile {
    /// Creates a file holding `contents`.
    /// If `overwrite` is false, fails when the file already exists.
    pub fn create(path: &Path, contents: &[u8], overwrite: bool) -> Result<Self> {
        let mut options = OpenOptions::new();
        options.read(true).write(true);
        if overwrite {
            options.create(true).truncate(true);
        } else {
            options.create_new(true);
        }
        let file = options.open(path)?;
        file.set_len(contents.len() as u64)?;

        let mut mapped = Self::map(path, file)?;
        mapped.mmap.copy_from_slice(contents);
        mapped.mmap.flush()?;
        Ok(mapped)
    }

    /// Opens and maps an existing file.
    /// Files shorter than `min_len` are rejected.
    pub fn open(path: &Path, min_len: usize) -> Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let len = file.metadata()?.len();
        if len < min_len as u64 {
            return Err(Error::Corrupted {
                path: path.to_owned(),
                reason: format!("file too small ({len} bytes)"),
            });
        }
        Self::map(path, file)
    }

    fn map(path: &Path, file: File) -> Result<Self> {
        // SAFETY: block files are owned by a single `BlockFiles` instance and
        // not modified by other processes while mapped. All access goes
        // through bounds-checked slices of the mapping.
        let mmap = unsafe { MmapMut::map_mut(&file)? };
        Ok(Self {
            path: path.to_owned(),
            file,
            mmap,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Returns the length of the mapping, which is the file length as of the
    /// last resize.
    pub fn len(&self) -> u64 {
        self.mmap.len() as u64
    }

    pub fn bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.mmap
    }

    /// Changes the length of the file and maps it again.
    pub fn set_len(&mut self, len: u64) -> Result<()> {
        self.mmap.flush()?;
        self.file.set_len(len)?;

        // SAFETY: the old mapping cannot be borrowed since this takes
        // `&mut self`; it was flushed above and is dropped on assignment.
        self.mmap = unsafe { MmapMut::map_mut(&self.file)? };
        Ok(())
    }

    /// Writes dirty pages of the mapping back to the file.
    pub fn flush(&self) -> Result<()> {
        self.mmap.flush()?;
        Ok(())
    }
}
