//! Input sizing and byte-range splitting of file sources.

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::StorageRegistry;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputFile {
    pub uri: String,
    pub size: u64,
}

/// `[offset, offset + len)` of one input file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRange {
    pub uri: String,
    pub offset: u64,
    pub len: u64,
}

pub fn input_sizes(storage: &StorageRegistry, uris: &[String]) -> Result<Vec<InputFile>> {
    uris.iter()
        .map(|uri| {
            Ok(InputFile {
                uri: uri.clone(),
                size: storage.size(uri)?,
            })
        })
        .collect()
}

/// Cut every file into consecutive ranges of at most `max_bytes`, in input
/// order. Empty files produce no range.
pub fn split_ranges(files: &[InputFile], max_bytes: u64) -> Vec<FileRange> {
    let max_bytes = max_bytes.max(1);
    let mut out = Vec::new();
    for f in files {
        let mut offset = 0;
        while offset < f.size {
            let len = max_bytes.min(f.size - offset);
            out.push(FileRange {
                uri: f.uri.clone(),
                offset,
                len,
            });
            offset += len;
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    fn file(uri: &str, size: u64) -> InputFile {
        InputFile {
            uri: uri.into(),
            size,
        }
    }

    #[test]
    fn splits_by_max_bytes() {
        let ranges = split_ranges(&[file("a", 250), file("empty", 0), file("b", 100)], 100);
        let shape: Vec<(&str, u64, u64)> = ranges
            .iter()
            .map(|r| (r.uri.as_str(), r.offset, r.len))
            .collect();
        assert_eq!(
            shape,
            vec![("a", 0, 100), ("a", 100, 100), ("a", 200, 50), ("b", 0, 100)]
        );
    }

    #[test]
    fn sizes_come_from_storage() {
        let reg = StorageRegistry::new();
        reg.write("memory://in/a.csv", b"x\n1\n").unwrap();
        let sizes = input_sizes(&reg, &["memory://in/a.csv".to_string()]).unwrap();
        assert_eq!(sizes, vec![file("memory://in/a.csv", 4)]);
        assert!(input_sizes(&reg, &["memory://in/missing.csv".to_string()]).is_err());
    }
}
