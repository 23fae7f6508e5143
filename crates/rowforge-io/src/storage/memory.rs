//! In-memory storage for `memory://` URIs.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::Storage;
use crate::error::{Error, Result};

/// Thread-safe map of keys to bytes. Clones share the same objects.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    data: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    fn objects(&self) -> MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // a panic while holding the lock cannot leave a half-written entry
        self.data.lock().unwrap_or_else(|p| p.into_inner())
    }

    pub fn insert(&self, path: impl Into<String>, bytes: Vec<u8>) {
        self.objects().insert(path.into(), bytes);
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects().contains_key(path)
    }

    pub fn len(&self) -> usize {
        self.objects().len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects().is_empty()
    }

    pub fn clear(&self) {
        self.objects().clear();
    }
}

impl Storage for MemoryStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        self.objects().insert(path.to_string(), bytes.to_vec());
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let objects = self.objects();
        let bytes = objects
            .get(path)
            .ok_or_else(|| Error::NotFound(path.to_string()))?;
        let start = (offset as usize).min(bytes.len());
        let end = start.saturating_add(len).min(bytes.len());
        Ok(bytes[start..end].to_vec())
    }

    fn delete(&self, path: &str) -> Result<()> {
        self.objects().remove(path);
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .objects()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn size(&self, path: &str) -> Result<u64> {
        self.objects()
            .get(path)
            .map(|b| b.len() as u64)
            .ok_or_else(|| Error::NotFound(path.to_string()))
    }

    fn etag(&self, path: &str) -> Result<Option<String>> {
        Ok(self
            .objects()
            .get(path)
            .map(|b| blake3::hash(b).to_hex().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_ranges() {
        let s = MemoryStorage::new();
        s.write("t/file.txt", b"hello world").unwrap();
        assert_eq!(s.read_range("t/file.txt", 6, 5).unwrap(), b"world");
        assert_eq!(s.read_range("t/file.txt", 6, 100).unwrap(), b"world");
        assert!(s.read_range("t/file.txt", 50, 5).unwrap().is_empty());
        assert_eq!(s.read("t/file.txt").unwrap(), b"hello world");
    }

    #[test]
    fn missing_objects() {
        let s = MemoryStorage::new();
        assert!(matches!(s.size("nope"), Err(Error::NotFound(_))));
        assert_eq!(s.etag("nope").unwrap(), None);
    }

    #[test]
    fn list_and_delete() {
        let s = MemoryStorage::new();
        s.write("dir/b", b"2").unwrap();
        s.write("dir/a", b"1").unwrap();
        s.write("other/c", b"3").unwrap();
        assert_eq!(s.list("dir/").unwrap(), vec!["dir/a", "dir/b"]);
        s.delete("dir/a").unwrap();
        assert!(!s.contains("dir/a"));
        assert_eq!(s.len(), 2);
    }

    #[test]
    fn etag_tracks_content() {
        let s = MemoryStorage::new();
        s.write("k", b"one").unwrap();
        let a = s.etag("k").unwrap();
        s.write("k", b"two").unwrap();
        assert_ne!(a, s.etag("k").unwrap());
    }
}
