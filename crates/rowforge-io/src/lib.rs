//! rowforge-io: bytes in and out.
//!
//! - [`storage`]: the `Storage` trait with filesystem and in-memory backends,
//!   picked per URI by [`storage::StorageRegistry`].
//! - [`readers::csv`]: typed CSV parsing of whole files or byte ranges.
//! - [`writers`]: CSV part files and JSON lines for result export.
//! - [`rows`]: lossless row part files for results read back from storage.
//! - [`split`]: input sizing and cutting files into byte ranges.

pub mod error;
pub mod readers;
pub mod rows;
pub mod split;
pub mod storage;
pub mod uri;
pub mod writers;

pub use error::{Error, Result};
pub use storage::{FsStorage, MemoryStorage, Storage, StorageRegistry};
pub use uri::{Location, Scheme};
