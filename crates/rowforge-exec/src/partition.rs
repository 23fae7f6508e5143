//! Cutting a stage's input into partitions.

use rowforge_core::config::EngineConfig;
use rowforge_core::schema::Schema;
use rowforge_core::types::Row;
use rowforge_io::readers::csv::{read_csv_range, CsvOptions};
use rowforge_io::split::{input_sizes, split_ranges, FileRange};
use rowforge_io::StorageRegistry;
use rowforge_planner::physical::SourceSpec;

use crate::error::Result;

#[derive(Debug, Clone)]
pub enum PartitionInput {
    Rows(Vec<Row>),
    Range(FileRange),
}

impl PartitionInput {
    /// Materialize the rows of this partition.
    pub fn load(self, storage: &StorageRegistry, schema: &Schema, opts: CsvOptions) -> Result<Vec<Row>> {
        match self {
            PartitionInput::Rows(rows) => Ok(rows),
            PartitionInput::Range(range) => {
                let (backend, loc) = storage.resolve(&range.uri)?;
                Ok(read_csv_range(backend, &loc.path, schema, range.offset, range.len, opts)?)
            }
        }
    }
}

/// Split rows into chunks of at most `chunk` rows. Always yields at least one
/// partition so empty inputs still flow through the stage.
pub fn chunk_rows(rows: Vec<Row>, chunk: usize) -> Vec<PartitionInput> {
    let chunk = chunk.max(1);
    if rows.len() <= chunk {
        return vec![PartitionInput::Rows(rows)];
    }
    let mut out = Vec::with_capacity(rows.len().div_ceil(chunk));
    let mut it = rows.into_iter().peekable();
    while it.peek().is_some() {
        out.push(PartitionInput::Rows(it.by_ref().take(chunk).collect()));
    }
    out
}

/// Partitions of a source stage under the local backend.
pub fn source_partitions(
    source: &SourceSpec,
    storage: &StorageRegistry,
    cfg: &EngineConfig,
) -> Result<Vec<PartitionInput>> {
    match source {
        SourceSpec::Rows { rows, .. } => Ok(chunk_rows(rows.as_ref().clone(), cfg.partition_rows)),
        SourceSpec::Csv { uris, .. } => {
            let files = input_sizes(storage, uris)?;
            let ranges = split_ranges(&files, cfg.partition_bytes);
            if ranges.is_empty() {
                return Ok(vec![PartitionInput::Rows(Vec::new())]);
            }
            Ok(ranges.into_iter().map(PartitionInput::Range).collect())
        }
    }
}

pub fn csv_options(source: &SourceSpec) -> CsvOptions {
    match source {
        SourceSpec::Csv {
            has_header,
            delimiter,
            ..
        } => CsvOptions {
            has_header: *has_header,
            delimiter: *delimiter,
        },
        SourceSpec::Rows { .. } => CsvOptions::default(),
    }
}
