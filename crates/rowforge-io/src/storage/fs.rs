use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

use blake3::Hasher;

use super::Storage;
use crate::error::{Error, Result};

fn io_err(what: &str, path: &str, e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::NotFound {
        Error::NotFound(path.to_string())
    } else {
        Error::Storage(format!("{what} {path}: {e}"))
    }
}

/// Local filesystem storage (paths are host paths).
#[derive(Debug, Clone, Copy, Default)]
pub struct FsStorage;

impl FsStorage {
    pub fn new() -> Self {
        Self
    }
}

impl Storage for FsStorage {
    fn write(&self, path: &str, bytes: &[u8]) -> Result<()> {
        let p = Path::new(path);
        if let Some(parent) = p.parent().filter(|d| !d.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|e| io_err("mkparent", path, e))?;
        }
        let mut f = File::create(p).map_err(|e| io_err("create", path, e))?;
        f.write_all(bytes).map_err(|e| io_err("write", path, e))?;
        f.flush().map_err(|e| io_err("flush", path, e))?;
        Ok(())
    }

    fn read_range(&self, path: &str, offset: u64, len: usize) -> Result<Vec<u8>> {
        let mut f = File::open(path).map_err(|e| io_err("open", path, e))?;
        f.seek(SeekFrom::Start(offset))
            .map_err(|e| io_err("seek", path, e))?;
        let mut buf = Vec::with_capacity(len);
        f.take(len as u64)
            .read_to_end(&mut buf)
            .map_err(|e| io_err("read", path, e))?;
        Ok(buf)
    }

    fn delete(&self, path: &str) -> Result<()> {
        let p = Path::new(path);
        if p.exists() {
            fs::remove_file(p).map_err(|e| io_err("delete", path, e))?;
        }
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let root = Path::new(prefix);
        let mut out = Vec::new();
        if !root.exists() {
            return Ok(out);
        }
        if root.is_file() {
            out.push(prefix.to_string());
            return Ok(out);
        }

        fn visit(dir: &Path, out: &mut Vec<String>) -> std::io::Result<()> {
            for entry in fs::read_dir(dir)? {
                let path = entry?.path();
                if path.is_dir() {
                    visit(&path, out)?;
                } else if let Some(s) = path.to_str() {
                    out.push(s.to_string());
                }
            }
            Ok(())
        }

        visit(root, &mut out).map_err(|e| io_err("list", prefix, e))?;
        out.sort();
        Ok(out)
    }

    fn size(&self, path: &str) -> Result<u64> {
        let meta = fs::metadata(path).map_err(|e| io_err("stat", path, e))?;
        Ok(meta.len())
    }

    fn etag(&self, path: &str) -> Result<Option<String>> {
        // size + mtime + path, without reading the file
        let Ok(meta) = fs::metadata(path) else {
            return Ok(None);
        };
        let mut h = Hasher::new();
        h.update(&meta.len().to_le_bytes());
        if let Ok(d) = meta
            .modified()
            .map_err(|_| ())
            .and_then(|m| m.duration_since(std::time::UNIX_EPOCH).map_err(|_| ()))
        {
            h.update(&d.as_secs().to_le_bytes());
            h.update(&d.subsec_nanos().to_le_bytes());
        }
        h.update(path.as_bytes());
        Ok(Some(h.finalize().to_hex().to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scratch(name: &str) -> String {
        let dir = std::env::temp_dir().join(format!("rowforge-fs-{}-{name}", std::process::id()));
        dir.to_string_lossy().into_owned()
    }

    #[test]
    fn round_trip_and_list() {
        let dir = scratch("list");
        let fs = FsStorage::new();
        fs.write(&format!("{dir}/sub/a.csv"), b"1,2\n").unwrap();
        fs.write(&format!("{dir}/b.csv"), b"3,4\n5,6\n").unwrap();

        assert_eq!(fs.size(&format!("{dir}/b.csv")).unwrap(), 8);
        assert_eq!(fs.read_range(&format!("{dir}/b.csv"), 4, 100).unwrap(), b"5,6\n");
        let listed = fs.list(&dir).unwrap();
        assert_eq!(listed.len(), 2);
        assert!(fs.etag(&format!("{dir}/b.csv")).unwrap().is_some());

        std::fs::remove_dir_all(&dir).unwrap();
        assert!(fs.list(&dir).unwrap().is_empty());
    }

    #[test]
    fn missing_file_is_not_found() {
        let fs = FsStorage::new();
        let path = scratch("missing");
        assert!(matches!(fs.size(&path), Err(Error::NotFound(_))));
        assert_eq!(fs.etag(&path).unwrap(), None);
    }
}
