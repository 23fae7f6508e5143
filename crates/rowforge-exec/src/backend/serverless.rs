//! Serverless backend: a single file-to-file stage fanned out as remote
//! invocations.
//!
//! Inputs are cut into byte ranges no larger than the service's per-invocation
//! limit and packed first-fit decreasing into invocations. Each invocation
//! gets a self-contained [`File2FilePipeline`] descriptor and writes one part
//! file: CSV for storage sinks, lossless row parts for results the driver
//! reads back from scratch. Transient failures are retried with exponential backoff; a
//! partition that still fails is given up and its rows are counted as
//! `PartitionFailure`. A job that fails removes the parts its successful
//! invocations wrote.

use std::thread;

use rowforge_core::exception::{ExceptionRecord, ExceptionTally};
use rowforge_core::id::OpId;
use rowforge_core::schema::Schema;
use rowforge_core::types::Row;
use rowforge_io::readers::csv::{read_csv_range, CsvOptions};
use rowforge_io::split::{input_sizes, split_ranges, FileRange};
use rowforge_io::uri::Location;
use rowforge_io::rows::{decode_rows, part_name as rows_part_name};
use rowforge_io::writers::csv::part_name;
use rowforge_io::StorageRegistry;
use rowforge_planner::physical::{EndPointMode, SourceSpec, StageGraph};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use super::{remove_parts, ExecEnv};
use crate::diagnostics::Diagnostics;
use crate::error::{ExecError, Result};
use crate::metrics;
use crate::result::ResultSet;
use crate::retry::RetryPolicy;
use crate::scheduler::run_pool;

pub const CSV_WRITER: &str = "csvWriter";
pub const ROWS_WRITER: &str = "rowsWriter";

/// What the invocation service allows per call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerlessLimits {
    pub max_input_bytes_per_invocation: u64,
    pub max_concurrency: usize,
    pub memory_mb: u64,
}

/// Self-contained unit of remote work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct File2FilePipeline {
    /// Full hex content hash of the stage IR.
    pub code_id: String,
    /// JSON of the stage IR.
    pub stage_ir: String,
    pub write_callback: String,
    pub input_uris: Vec<String>,
    pub input_sizes: Vec<u64>,
    pub input_offsets: Vec<u64>,
    pub has_header: bool,
    pub delimiter: u8,
    pub output_uri: String,
    pub output_header: bool,
    pub input_columns: Vec<String>,
    pub output_columns: Vec<String>,
}

impl File2FilePipeline {
    pub fn validate(&self) -> Result<()> {
        let n = self.input_uris.len();
        if n == 0 {
            return Err(ExecError::Invalid("descriptor has no inputs".into()));
        }
        if self.input_sizes.len() != n || self.input_offsets.len() != n {
            return Err(ExecError::Invalid(format!(
                "descriptor has {n} inputs but {} sizes and {} offsets",
                self.input_sizes.len(),
                self.input_offsets.len()
            )));
        }
        if self.write_callback != CSV_WRITER && self.write_callback != ROWS_WRITER {
            return Err(ExecError::Invalid(format!(
                "unknown write callback '{}'",
                self.write_callback
            )));
        }
        Location::parse(&self.output_uri)?;
        Ok(())
    }

    pub fn ranges(&self) -> impl Iterator<Item = FileRange> + '_ {
        self.input_uris
            .iter()
            .zip(&self.input_offsets)
            .zip(&self.input_sizes)
            .map(|((uri, offset), len)| FileRange {
                uri: uri.clone(),
                offset: *offset,
                len: *len,
            })
    }

    pub fn csv_options(&self) -> CsvOptions {
        CsvOptions {
            has_header: self.has_header,
            delimiter: self.delimiter,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InvocationRequest {
    pub job_id: Uuid,
    pub partition: usize,
    /// 0 for the first try.
    pub attempt: u32,
    pub timeout_ms: u64,
    pub pipeline: File2FilePipeline,
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationResponse {
    pub output_uri: String,
    pub rows_in: u64,
    pub rows_out: u64,
    pub tally: ExceptionTally,
    pub unresolved: Vec<ExceptionRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvocationFailure {
    #[error("throttled")]
    Throttled,
    #[error("timed out after {0} ms")]
    TimedOut(u64),
    #[error("crashed: {0}")]
    Crashed(String),
    #[error("out of memory")]
    OutOfMemory,
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    #[error("malformed uri: {0}")]
    MalformedUri(String),
}

impl InvocationFailure {
    /// Worth another attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            InvocationFailure::Throttled | InvocationFailure::TimedOut(_) | InvocationFailure::Crashed(_)
        )
    }
}

/// Remote function service running file-to-file pipelines.
pub trait InvocationService: Send + Sync {
    fn limits(&self, memory_mb: u64) -> ServerlessLimits;

    fn invoke(&self, req: &InvocationRequest) -> std::result::Result<InvocationResponse, InvocationFailure>;
}

/// Pack ranges into invocations of at most `cap` bytes, first-fit decreasing.
/// Each invocation lists its ranges in input order; invocations are ordered
/// by their first range.
pub fn pack_invocations(ranges: Vec<FileRange>, cap: u64) -> Vec<Vec<FileRange>> {
    let mut order: Vec<usize> = (0..ranges.len()).collect();
    order.sort_by(|a, b| ranges[*b].len.cmp(&ranges[*a].len).then(a.cmp(b)));

    let mut bins: Vec<(u64, Vec<usize>)> = Vec::new();
    for i in order {
        let len = ranges[i].len;
        match bins.iter_mut().find(|(used, _)| used + len <= cap) {
            Some((used, members)) => {
                *used += len;
                members.push(i);
            }
            None => bins.push((len, vec![i])),
        }
    }
    for (_, members) in &mut bins {
        members.sort_unstable();
    }
    bins.sort_by_key(|(_, members)| members.first().copied());

    let mut slots: Vec<Option<FileRange>> = ranges.into_iter().map(Some).collect();
    bins.into_iter()
        .map(|(_, members)| members.into_iter().filter_map(|i| slots[i].take()).collect())
        .collect()
}

/// Outcome of one partition after retries.
#[derive(Debug)]
struct Attempted {
    result: std::result::Result<InvocationResponse, InvocationFailure>,
    retries: u32,
}

fn invoke_with_retry(
    service: &dyn InvocationService,
    mut req: InvocationRequest,
    policy: RetryPolicy,
) -> Attempted {
    let mut attempt = 0;
    loop {
        req.attempt = attempt;
        match service.invoke(&req) {
            Ok(resp) => {
                return Attempted {
                    result: Ok(resp),
                    retries: attempt,
                }
            }
            Err(failure) => {
                metrics::invocation_failed(req.partition, attempt, &failure.to_string());
                if !failure.is_transient() || !policy.allows_retry(attempt) {
                    return Attempted {
                        result: Err(failure),
                        retries: attempt,
                    };
                }
                thread::sleep(policy.backoff(attempt));
                attempt += 1;
            }
        }
    }
}

pub fn execute(
    graph: &StageGraph,
    env: &ExecEnv<'_>,
    service: &dyn InvocationService,
    diag: &mut Diagnostics,
) -> Result<ResultSet> {
    if !graph.is_file2file() {
        return Err(ExecError::Invalid(
            "only single-stage csv-to-csv plans run serverless".into(),
        ));
    }
    let stage = &graph.stages[0];
    let Some(SourceSpec::Csv {
        op: source_op,
        uris,
        has_header,
        delimiter,
    }) = stage.source()
    else {
        return Err(ExecError::Invalid("serverless stage has no csv source".into()));
    };

    let chain = stage.ir.chain_label();
    let handle = stage
        .compile(env.codegen)
        .map_err(|source| ExecError::Compile {
            stage: stage.id,
            chain: chain.clone(),
            source,
        })?;
    let stage_ir = stage.ir.to_json().map_err(|source| ExecError::Compile {
        stage: stage.id,
        chain: chain.clone(),
        source,
    })?;

    let limits = service.limits(env.cfg.memory_mb);
    let cap = limits.max_input_bytes_per_invocation.max(1);
    let files = input_sizes(env.storage, uris)?;
    let bins = pack_invocations(split_ranges(&files, cap), cap);

    let job_id = Uuid::new_v4();
    let (out_base, out_header, scratch) = match &stage.end {
        EndPointMode::Storage { uri, header } => (Location::parse(uri)?, *header, false),
        _ => {
            let scratch = Location::parse(&env.cfg.scratch_uri)?.join(&format!("job-{job_id}"));
            (scratch, false, true)
        }
    };
    let (write_callback, part): (&str, fn(usize) -> String) = if scratch {
        (ROWS_WRITER, rows_part_name)
    } else {
        (CSV_WRITER, part_name)
    };

    let input_columns = stage.ir.input_schema().names();
    let output_columns = stage.output_schema.names();
    let mut requests = Vec::with_capacity(bins.len());
    for (i, ranges) in bins.iter().enumerate() {
        let pipeline = File2FilePipeline {
            code_id: handle.id().0.to_hex(),
            stage_ir: stage_ir.clone(),
            write_callback: write_callback.to_string(),
            input_uris: ranges.iter().map(|r| r.uri.clone()).collect(),
            input_sizes: ranges.iter().map(|r| r.len).collect(),
            input_offsets: ranges.iter().map(|r| r.offset).collect(),
            has_header: *has_header,
            delimiter: *delimiter,
            output_uri: out_base.join(&part(i)).to_string(),
            output_header: out_header,
            input_columns: input_columns.clone(),
            output_columns: output_columns.clone(),
        };
        pipeline.validate()?;
        requests.push(InvocationRequest {
            job_id,
            partition: i,
            attempt: 0,
            timeout_ms: env.cfg.invocation_timeout_ms,
            pipeline,
        });
    }

    let _span = metrics::stage_span(stage.id, &chain, requests.len()).entered();
    tracing::info!(
        %job_id,
        invocations = requests.len(),
        cap,
        concurrency = limits.max_concurrency,
        "dispatching serverless job"
    );
    diag.begin_stage(stage.id, chain, Some(handle.id().to_string()));
    diag.invocations += requests.len();

    let policy = RetryPolicy::from_config(env.cfg);
    let mut done = run_pool(requests, limits.max_concurrency, env.cancel, |_, req| {
        invoke_with_retry(service, req, policy)
    })?;
    done.sort_by_key(|(i, _)| *i);

    let total = done.len();
    let mut outputs = Vec::new();
    let mut fatal = None;
    let mut lost = Vec::new();
    for (i, attempted) in done {
        for _ in 0..attempted.retries {
            diag.record_retry(i);
        }
        match attempted.result {
            Ok(resp) => {
                diag.record_partition(resp.rows_in, resp.rows_out, &resp.tally, resp.unresolved);
                outputs.push((resp.output_uri, resp.rows_out));
            }
            Err(failure) if failure.is_transient() => {
                tracing::warn!(partition = i, %failure, "partition given up after retries");
                lost.push(i);
            }
            Err(failure) => {
                tracing::error!(partition = i, %failure, "non-retryable invocation failure");
                fatal.get_or_insert(format!("partition {i}: {failure}"));
            }
        }
    }
    for i in lost {
        let rows = count_rows(env.storage, stage.ir.input_schema(), &bins[i], csv_opts(*has_header, *delimiter))?;
        diag.partition_lost(i, *source_op, rows);
    }
    let failed = fatal.or_else(|| {
        (total > 0 && outputs.is_empty()).then(|| format!("all {total} partitions failed"))
    });
    if let Some(reason) = failed {
        remove_parts(env.storage, outputs.iter().map(|(uri, _)| uri.as_str()));
        return Err(ExecError::JobFailed { reason });
    }

    let schema = stage.output_schema.clone();
    if !scratch {
        let rows = outputs.iter().map(|(_, n)| n).sum();
        let written = outputs.into_iter().map(|(uri, _)| uri).collect();
        return Ok(ResultSet::written(schema, written, rows));
    }
    let rows = read_back(env.storage, &schema, &outputs);
    remove_parts(env.storage, outputs.iter().map(|(uri, _)| uri.as_str()));
    let rows = rows?;
    let ordered = stage.end.is_ordered();
    Ok(ResultSet::from_action(&graph.action, schema, rows, ordered))
}

fn csv_opts(has_header: bool, delimiter: u8) -> CsvOptions {
    CsvOptions {
        has_header,
        delimiter,
    }
}

fn count_rows(storage: &StorageRegistry, schema: &Schema, ranges: &[FileRange], opts: CsvOptions) -> Result<u64> {
    let mut n = 0;
    for r in ranges {
        let (backend, loc) = storage.resolve(&r.uri)?;
        n += read_csv_range(backend, &loc.path, schema, r.offset, r.len, opts)?.len() as u64;
    }
    Ok(n)
}

fn read_back(storage: &StorageRegistry, schema: &Schema, outputs: &[(String, u64)]) -> Result<Vec<Row>> {
    let mut rows = Vec::new();
    for (uri, _) in outputs {
        let bytes = storage.read(uri)?;
        rows.extend(decode_rows(&bytes, schema.len())?);
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MB: u64 = 1024 * 1024;

    fn range(uri: &str, len: u64) -> FileRange {
        FileRange {
            uri: uri.into(),
            offset: 0,
            len,
        }
    }

    #[test]
    fn packs_first_fit_decreasing() {
        let ranges = vec![range("a", 100 * MB), range("b", 50 * MB), range("c", 50 * MB)];
        let bins = pack_invocations(ranges, 100 * MB);
        assert_eq!(bins.len(), 2);
        for bin in &bins {
            assert!(bin.iter().map(|r| r.len).sum::<u64>() <= 100 * MB);
        }
        assert_eq!(bins[0][0].uri, "a");
        assert_eq!(
            bins[1].iter().map(|r| r.uri.as_str()).collect::<Vec<_>>(),
            vec!["b", "c"]
        );
    }

    #[test]
    fn small_ranges_share_invocations() {
        let ranges = (0..10).map(|i| range(&format!("f{i}"), 10)).collect();
        let bins = pack_invocations(ranges, 35);
        assert_eq!(bins.len(), 4);
        assert_eq!(bins.iter().map(Vec::len).sum::<usize>(), 10);
        assert_eq!(bins[0][0].uri, "f0");
    }

    #[test]
    fn transient_failures_classify() {
        assert!(InvocationFailure::Throttled.is_transient());
        assert!(InvocationFailure::Crashed("x".into()).is_transient());
        assert!(!InvocationFailure::OutOfMemory.is_transient());
        assert!(!InvocationFailure::MalformedUri("x".into()).is_transient());
    }

    fn descriptor() -> File2FilePipeline {
        File2FilePipeline {
            code_id: "00".into(),
            stage_ir: "{}".into(),
            write_callback: CSV_WRITER.into(),
            input_uris: vec!["memory://in/a.csv".into()],
            input_sizes: vec![10],
            input_offsets: vec![0],
            has_header: true,
            delimiter: b',',
            output_uri: "memory://out/part-00000.csv".into(),
            output_header: true,
            input_columns: vec!["x".into()],
            output_columns: vec!["x".into()],
        }
    }

    #[test]
    fn descriptor_validation() {
        descriptor().validate().unwrap();

        let mut d = descriptor();
        d.input_sizes.push(3);
        assert!(matches!(d.validate(), Err(ExecError::Invalid(_))));

        let mut d = descriptor();
        d.input_uris.clear();
        d.input_sizes.clear();
        d.input_offsets.clear();
        assert!(d.validate().is_err());

        let mut d = descriptor();
        d.output_uri = "s3://bucket/key".into();
        assert!(matches!(d.validate(), Err(ExecError::Io(_))));
    }

    #[test]
    fn requests_serialize_for_the_wire() {
        let req = InvocationRequest {
            job_id: Uuid::new_v4(),
            partition: 1,
            attempt: 0,
            timeout_ms: 1000,
            pipeline: descriptor(),
        };
        let json = serde_json::to_string(&req).unwrap();
        let back: InvocationRequest = serde_json::from_str(&json).unwrap();
        assert_eq!(back, req);
    }
}
