//! Newline-delimited JSON export of result rows.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{BufWriter, Write};

use rowforge_core::types::{Row, Scalar};

use crate::error::Result;

pub struct JsonlWriter<W: Write> {
    writer: BufWriter<W>,
    columns: Vec<String>,
}

impl JsonlWriter<File> {
    pub fn to_path(path: &str, columns: Vec<String>) -> Result<Self> {
        let f = File::create(path)?;
        Ok(Self::to_writer(f, columns))
    }
}

impl<W: Write> JsonlWriter<W> {
    pub fn to_writer(writer: W, columns: Vec<String>) -> Self {
        Self {
            writer: BufWriter::new(writer),
            columns,
        }
    }

    /// One object per row, keyed by column name.
    pub fn write_rows<'a>(&mut self, rows: impl IntoIterator<Item = &'a Row>) -> Result<()> {
        for row in rows {
            let obj: BTreeMap<&str, serde_json::Value> = self
                .columns
                .iter()
                .zip(row)
                .map(|(name, v)| (name.as_str(), scalar_to_json(v)))
                .collect();
            serde_json::to_writer(&mut self.writer, &obj)?;
            self.writer.write_all(b"\n")?;
        }
        Ok(())
    }

    pub fn finish(mut self) -> Result<W> {
        self.writer.flush()?;
        self.writer
            .into_inner()
            .map_err(|e| e.into_error().into())
    }
}

pub fn scalar_to_json(v: &Scalar) -> serde_json::Value {
    match v {
        Scalar::Null => serde_json::Value::Null,
        Scalar::Bool(b) => serde_json::Value::Bool(*b),
        Scalar::I64(i) => serde_json::Value::from(*i),
        Scalar::F64(f) => serde_json::Value::from(*f),
        Scalar::Str(s) => serde_json::Value::String(s.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn one_object_per_line() {
        let mut w = JsonlWriter::to_writer(Vec::new(), vec!["a".into(), "b".into()]);
        let rows = vec![
            vec![Scalar::I64(1), Scalar::from("x")],
            vec![Scalar::Null, Scalar::F64(0.5)],
        ];
        w.write_rows(&rows).unwrap();
        let out = String::from_utf8(w.finish().unwrap()).unwrap();
        assert_eq!(out, "{\"a\":1,\"b\":\"x\"}\n{\"a\":null,\"b\":0.5}\n");
    }
}
