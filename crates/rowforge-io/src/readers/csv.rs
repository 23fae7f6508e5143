//! CSV to typed rows, for whole objects or byte ranges of them.
//!
//! A byte range `[offset, offset + len)` owns every line that *starts* inside
//! it: a range not at the start of the file skips the partial line it lands
//! in, and every range reads past its end to finish its last line. Ranges that
//! tile a file therefore see each line exactly once. Quoted fields containing
//! newlines are not supported in ranged reads.
//!
//! Values that do not parse as their declared type are kept as strings; the
//! compiled path flags them and the interpreter raises the real error.

use rowforge_core::schema::{DataType, Schema};
use rowforge_core::types::{Row, Scalar};

use crate::error::Result;
use crate::storage::Storage;

const EXTEND_CHUNK: usize = 64 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CsvOptions {
    pub has_header: bool,
    pub delimiter: u8,
}

impl Default for CsvOptions {
    fn default() -> Self {
        Self {
            has_header: true,
            delimiter: b',',
        }
    }
}

/// Parse one text field as `dt`. Empty text is null.
pub fn parse_field(text: &str, dt: DataType) -> Scalar {
    if text.is_empty() {
        return Scalar::Null;
    }
    let parsed = match dt {
        DataType::Int64 => text.trim().parse::<i64>().ok().map(Scalar::I64),
        DataType::Float64 => text.trim().parse::<f64>().ok().map(Scalar::F64),
        DataType::Boolean => parse_bool(text).map(Scalar::Bool),
        DataType::Utf8 => None,
        DataType::Any => text
            .trim()
            .parse::<i64>()
            .ok()
            .map(Scalar::I64)
            .or_else(|| text.trim().parse::<f64>().ok().map(Scalar::F64))
            .or_else(|| parse_bool(text).map(Scalar::Bool)),
    };
    parsed.unwrap_or_else(|| Scalar::Str(text.to_string()))
}

fn parse_bool(text: &str) -> Option<bool> {
    match text.trim().to_ascii_lowercase().as_str() {
        "true" | "t" | "yes" => Some(true),
        "false" | "f" | "no" => Some(false),
        _ => None,
    }
}

/// Parse CSV bytes into rows of `schema`. Short records are padded with
/// nulls and long ones truncated.
pub fn read_csv(bytes: &[u8], schema: &Schema, skip_header: bool, delimiter: u8) -> Result<Vec<Row>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(skip_header)
        .delimiter(delimiter)
        .flexible(true)
        .from_reader(bytes);
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        let row: Row = schema
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| record.get(i).map_or(Scalar::Null, |t| parse_field(t, f.data_type)))
            .collect();
        rows.push(row);
    }
    Ok(rows)
}

/// Bytes of the lines owned by `[offset, offset + len)` of `path`.
pub fn range_bytes(storage: &dyn Storage, path: &str, offset: u64, len: u64) -> Result<Vec<u8>> {
    let (start, skip_partial) = if offset == 0 {
        (0, false)
    } else {
        // one byte back: if it is a newline the range starts on a line boundary
        (offset - 1, true)
    };
    let want = (offset + len - start) as usize;
    let mut buf = storage.read_range(path, start, want)?;
    let mut next = start + buf.len() as u64;

    if buf.len() == want && buf.last() != Some(&b'\n') {
        loop {
            let chunk = storage.read_range(path, next, EXTEND_CHUNK)?;
            let done = chunk.len() < EXTEND_CHUNK;
            next += chunk.len() as u64;
            match chunk.iter().position(|b| *b == b'\n') {
                Some(nl) => {
                    buf.extend_from_slice(&chunk[..=nl]);
                    break;
                }
                None => buf.extend_from_slice(&chunk),
            }
            if done {
                break;
            }
        }
    }

    if skip_partial {
        match buf.iter().position(|b| *b == b'\n') {
            Some(nl) if (nl as u64) < len => {
                buf.drain(..=nl);
            }
            // no line starts inside the range
            _ => buf.clear(),
        }
    }
    Ok(buf)
}

/// Rows of the lines owned by a byte range. The header line is skipped by the
/// range starting at offset 0.
pub fn read_csv_range(
    storage: &dyn Storage,
    path: &str,
    schema: &Schema,
    offset: u64,
    len: u64,
    opts: CsvOptions,
) -> Result<Vec<Row>> {
    if len == 0 {
        return Ok(Vec::new());
    }
    let bytes = range_bytes(storage, path, offset, len)?;
    read_csv(&bytes, schema, opts.has_header && offset == 0, opts.delimiter)
}
