//! Block files for a disk cache.
//!
//! Small cache records are packed into large, memory-mapped files of
//! fixed-size blocks. Each file starts with a [`block::BlockFileHeader`]
//! whose bitmap tracks which blocks are in use, and records are addressed
//! with a 32-bit [`Addr`].

pub mod addr;
pub mod block;
pub mod config;
pub mod error;

pub use addr::{Addr, FileType};
pub use block::files::{BlockFiles, FileStats};
pub use config::Config;
pub use error::{Error, Result};
