use std::path::PathBuf;

use thiserror::Error;

use crate::addr::Addr;

#[derive(Error, Debug)]
pub enum Error {
    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),

    #[error("invalid address {0:?}")]
    InvalidAddress(Addr),

    #[error("block files are not initialized")]
    NotInitialized,

    #[error("block files are already initialized")]
    AlreadyInitialized,

    #[error("no space left for a new block")]
    NoSpace,

    #[error("blocks at {index} are not allocated")]
    NotAllocated { index: u32 },

    #[error("allocation counters do not match the bitmap")]
    CounterDesync,

    #[error("invalid magic or version in {}", .path.display())]
    InvalidHeader { path: PathBuf },

    #[error("{} is corrupted: {reason}", .path.display())]
    Corrupted { path: PathBuf, reason: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Returns true if the file set can no longer be trusted and should be
    /// discarded by the owner of the cache.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::InvalidHeader { .. } | Error::Corrupted { .. })
    }
}

pub type Result<T> = std::result::Result<T, Error>;
