//! Lossless row part files for results that travel back through storage.
//!
//! One JSON array per line. Every cell is tagged with its runtime type and
//! floats keep their bit pattern, so empty strings, `NaN` and `-0.0` come
//! back exactly as written. CSV cannot tell `""` from a missing value.

use rowforge_core::types::{Row, Scalar};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

pub fn part_name(index: usize) -> String {
    format!("part-{index:05}.rows")
}

#[derive(Debug, Serialize)]
enum CellRef<'a> {
    N,
    B(bool),
    I(i64),
    F(u64),
    S(&'a str),
}

#[derive(Debug, Deserialize)]
enum Cell {
    N,
    B(bool),
    I(i64),
    F(u64),
    S(String),
}

impl<'a> From<&'a Scalar> for CellRef<'a> {
    fn from(v: &'a Scalar) -> Self {
        match v {
            Scalar::Null => CellRef::N,
            Scalar::Bool(b) => CellRef::B(*b),
            Scalar::I64(i) => CellRef::I(*i),
            Scalar::F64(f) => CellRef::F(f.to_bits()),
            Scalar::Str(s) => CellRef::S(s),
        }
    }
}

impl From<Cell> for Scalar {
    fn from(c: Cell) -> Self {
        match c {
            Cell::N => Scalar::Null,
            Cell::B(b) => Scalar::Bool(b),
            Cell::I(i) => Scalar::I64(i),
            Cell::F(bits) => Scalar::F64(f64::from_bits(bits)),
            Cell::S(s) => Scalar::Str(s),
        }
    }
}

pub fn encode_rows<'a>(rows: impl IntoIterator<Item = &'a Row>) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    for row in rows {
        let cells: Vec<CellRef<'_>> = row.iter().map(CellRef::from).collect();
        serde_json::to_writer(&mut out, &cells)?;
        out.push(b'\n');
    }
    Ok(out)
}

/// Rows of a part file; every row must have `width` cells.
pub fn decode_rows(bytes: &[u8], width: usize) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for (n, line) in bytes.split(|b| *b == b'\n').enumerate() {
        if line.is_empty() {
            continue;
        }
        let cells: Vec<Cell> = serde_json::from_slice(line)?;
        if cells.len() != width {
            return Err(Error::Storage(format!(
                "row part line {}: expected {width} cells, found {}",
                n + 1,
                cells.len()
            )));
        }
        rows.push(cells.into_iter().map(Scalar::from).collect());
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keeps_values_csv_would_lose() {
        let rows = vec![
            vec![Scalar::from(""), Scalar::Null, Scalar::F64(f64::NAN)],
            vec![Scalar::from("a,\"b\"\n"), Scalar::Bool(false), Scalar::F64(-0.0)],
            vec![Scalar::I64(i64::MIN), Scalar::F64(2.0), Scalar::I64(2)],
        ];
        let bytes = encode_rows(&rows).unwrap();
        assert_eq!(bytes.iter().filter(|b| **b == b'\n').count(), 3);

        let back = decode_rows(&bytes, 3).unwrap();
        assert_eq!(back[0][0], Scalar::from(""));
        assert_eq!(back[0][1], Scalar::Null);
        assert!(matches!(back[0][2], Scalar::F64(f) if f.is_nan()));
        assert_eq!(back[1], rows[1]);
        assert!(matches!(back[1][2], Scalar::F64(f) if f.is_sign_negative()));
        assert_eq!(back[2], rows[2]);
    }

    #[test]
    fn width_mismatch_is_an_error() {
        let bytes = encode_rows(&vec![vec![Scalar::I64(1)]]).unwrap();
        assert!(decode_rows(&bytes, 2).is_err());
        assert!(decode_rows(b"", 2).unwrap().is_empty());
    }
}
