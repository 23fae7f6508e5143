//! Object storage behind one small trait.
//!
//! - `fs`: local filesystem, for bare paths and `file://` URIs.
//! - `memory`: process-local map, for `memory://` URIs (tests, emulated
//!   remote invocations, scratch space).
//!
//! [`StorageRegistry`] picks the backend from the URI scheme.

mod fs;
mod memory;

pub use fs::FsStorage;
pub use memory::MemoryStorage;

use crate::error::Result;
use crate::uri::{Location, Scheme};

/// Keys are backend paths (see [`Location::path`]), not URIs.
pub trait Storage: Send + Sync {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()>;

    /// Up to `len` bytes starting at `offset`; short or empty past the end.
    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>>;

    fn delete(&self, path: &str) -> Result<()>;

    /// Every key under `prefix`, sorted.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    fn size(&self, path: &str) -> Result<u64>;

    /// Content/version fingerprint, `None` when the object is missing.
    fn etag(&self, path: &str) -> Result<Option<String>>;

    fn read(&self, path: &str) -> Result<Vec<u8>> {
        let size = self.size(path)?;
        self.read_range(path, 0, size as usize)
    }
}

/// Resolves URIs to a backend. Cloning shares the in-memory store.
#[derive(Debug, Clone, Default)]
pub struct StorageRegistry {
    fs: FsStorage,
    memory: MemoryStorage,
}

impl StorageRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose `memory://` backend is `memory`.
    pub fn with_memory(memory: MemoryStorage) -> Self {
        Self {
            fs: FsStorage::new(),
            memory,
        }
    }

    pub fn memory(&self) -> &MemoryStorage {
        &self.memory
    }

    pub fn backend(&self, scheme: Scheme) -> &dyn Storage {
        match scheme {
            Scheme::File => &self.fs,
            Scheme::Memory => &self.memory,
        }
    }

    pub fn resolve(&self, uri: &str) -> Result<(&dyn Storage, Location)> {
        let loc = Location::parse(uri)?;
        Ok((self.backend(loc.scheme), loc))
    }

    pub fn read(&self, uri: &str) -> Result<Vec<u8>> {
        let (s, loc) = self.resolve(uri)?;
        s.read(&loc.path)
    }

    pub fn read_range(&self, uri: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let (s, loc) = self.resolve(uri)?;
        s.read_range(&loc.path, offset, len)
    }

    pub fn write(&self, uri: &str, bytes: &[u8]) -> Result<()> {
        let (s, loc) = self.resolve(uri)?;
        s.write(&loc.path, bytes)
    }

    pub fn size(&self, uri: &str) -> Result<u64> {
        let (s, loc) = self.resolve(uri)?;
        s.size(&loc.path)
    }

    pub fn delete(&self, uri: &str) -> Result<()> {
        let (s, loc) = self.resolve(uri)?;
        s.delete(&loc.path)
    }

    /// Objects under `uri`, returned as URIs of the same scheme.
    pub fn list(&self, uri: &str) -> Result<Vec<String>> {
        let (s, loc) = self.resolve(uri)?;
        Ok(s
            .list(&loc.path)?
            .into_iter()
            .map(|path| {
                Location {
                    scheme: loc.scheme,
                    path,
                }
                .to_string()
            })
            .collect())
    }
}
