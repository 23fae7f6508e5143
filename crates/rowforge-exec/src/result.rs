//! What a finished job hands back to the caller.

use rowforge_core::dag::Action;
use rowforge_core::schema::Schema;
use rowforge_core::types::Row;
use rowforge_io::writers::jsonl::JsonlWriter;

use crate::error::Result;

#[derive(Debug, Clone, PartialEq)]
pub struct ResultSet {
    pub schema: Schema,
    pub rows: Vec<Row>,
    /// Rows are in input order (merged by partition index).
    pub ordered: bool,
    /// Part files written by a `WriteCsv` action.
    pub written: Vec<String>,
    /// Rows the action produced; for `Count` the count itself.
    pub row_count: u64,
}

impl ResultSet {
    /// Shape the merged root output according to the job's action.
    pub fn from_action(action: &Action, schema: Schema, mut rows: Vec<Row>, ordered: bool) -> Self {
        match action {
            Action::Collect => Self::rows(schema, rows, ordered),
            Action::Take(n) => {
                rows.truncate(*n);
                Self::rows(schema, rows, ordered)
            }
            Action::Count => ResultSet {
                schema,
                row_count: rows.len() as u64,
                rows: Vec::new(),
                ordered,
                written: Vec::new(),
            },
            Action::WriteCsv { .. } => ResultSet {
                schema,
                row_count: rows.len() as u64,
                rows: Vec::new(),
                ordered: true,
                written: Vec::new(),
            },
        }
    }

    /// Result of a `WriteCsv` job that wrote `written` holding `row_count` rows.
    pub fn written(schema: Schema, written: Vec<String>, row_count: u64) -> Self {
        ResultSet {
            schema,
            rows: Vec::new(),
            ordered: true,
            written,
            row_count,
        }
    }

    fn rows(schema: Schema, rows: Vec<Row>, ordered: bool) -> Self {
        ResultSet {
            schema,
            row_count: rows.len() as u64,
            rows,
            ordered,
            written: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn column(&self, name: &str) -> Option<Vec<&rowforge_core::types::Scalar>> {
        let idx = self.schema.index_of(name)?;
        Some(self.rows.iter().filter_map(|r| r.get(idx)).collect())
    }

    /// Export the rows as JSON lines.
    pub fn write_jsonl(&self, path: &str) -> Result<()> {
        let mut w = JsonlWriter::to_path(path, self.schema.names())?;
        w.write_rows(&self.rows)?;
        w.finish()?;
        Ok(())
    }
}
