//! In-process invocation service.
//!
//! Runs file-to-file descriptors on the calling thread against a shared
//! storage registry, the same way a remote worker would: deserialize the
//! stage IR, compile it (warm units are reused by code id), read the input
//! ranges, run the partition and write the part file in the format the
//! descriptor's write callback names.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use rowforge_core::schema::Schema;
use rowforge_io::readers::csv::read_csv_range;
use rowforge_io::rows::encode_rows;
use rowforge_io::writers::csv::write_csv_bytes;
use rowforge_io::StorageRegistry;
use rowforge_operators::{ClosureCodegen, CodeGenerator, CodeHandle, KernelContext, StageIr};

use crate::backend::serverless::{
    File2FilePipeline, InvocationFailure, InvocationRequest, InvocationResponse, InvocationService,
    ServerlessLimits, ROWS_WRITER,
};
use crate::runner::StageRunner;

const DEFAULT_CONCURRENCY: usize = 64;

pub struct InProcessInvoker {
    storage: StorageRegistry,
    codegen: Box<dyn CodeGenerator>,
    warm: Mutex<HashMap<String, Arc<CodeHandle>>>,
    max_concurrency: usize,
}

impl std::fmt::Debug for InProcessInvoker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InProcessInvoker")
            .field("codegen", &self.codegen.name())
            .field("max_concurrency", &self.max_concurrency)
            .finish()
    }
}

impl InProcessInvoker {
    pub fn new(storage: StorageRegistry) -> Self {
        Self {
            storage,
            codegen: Box::new(ClosureCodegen),
            warm: Mutex::new(HashMap::new()),
            max_concurrency: DEFAULT_CONCURRENCY,
        }
    }

    pub fn with_max_concurrency(mut self, n: usize) -> Self {
        self.max_concurrency = n.max(1);
        self
    }

    /// Compiled units kept warm across invocations.
    pub fn warm_units(&self) -> usize {
        self.warm.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn code_for(&self, p: &File2FilePipeline) -> Result<Arc<CodeHandle>, InvocationFailure> {
        let mut warm = self.warm.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(handle) = warm.get(&p.code_id) {
            return Ok(Arc::clone(handle));
        }
        let ir = StageIr::from_json(&p.stage_ir).map_err(crashed)?;
        let handle = self.codegen.compile(&ir).map_err(crashed)?;
        if handle.id().0.to_hex() != p.code_id {
            return Err(InvocationFailure::Crashed(format!(
                "stage IR hashes to {} but descriptor names {}",
                handle.id(),
                p.code_id
            )));
        }
        let handle = Arc::new(handle);
        warm.insert(p.code_id.clone(), Arc::clone(&handle));
        Ok(handle)
    }
}

fn crashed(e: impl std::fmt::Display) -> InvocationFailure {
    InvocationFailure::Crashed(e.to_string())
}

fn io_failure(e: rowforge_io::Error) -> InvocationFailure {
    match e {
        rowforge_io::Error::Uri { uri, reason } => {
            InvocationFailure::MalformedUri(format!("{uri}: {reason}"))
        }
        rowforge_io::Error::Io(err) if err.kind() == std::io::ErrorKind::PermissionDenied => {
            InvocationFailure::PermissionDenied(err.to_string())
        }
        other => crashed(other),
    }
}

impl InvocationService for InProcessInvoker {
    fn limits(&self, memory_mb: u64) -> ServerlessLimits {
        ServerlessLimits {
            max_input_bytes_per_invocation: (memory_mb * 1024 * 1024 / 4).max(1),
            max_concurrency: self.max_concurrency,
            memory_mb,
        }
    }

    fn invoke(&self, req: &InvocationRequest) -> Result<InvocationResponse, InvocationFailure> {
        let started = Instant::now();
        let p = &req.pipeline;
        p.validate().map_err(|e| InvocationFailure::MalformedUri(e.to_string()))?;
        let handle = self.code_for(p)?;
        let input_schema: Schema = handle.ir_arc().input_schema().clone();
        let output_schema: Schema = handle.ir_arc().output_schema().clone();

        let mut rows = Vec::new();
        for range in p.ranges() {
            let (backend, loc) = self.storage.resolve(&range.uri).map_err(io_failure)?;
            rows.extend(
                read_csv_range(backend, &loc.path, &input_schema, range.offset, range.len, p.csv_options())
                    .map_err(io_failure)?,
            );
        }

        let runner = StageRunner::new(handle, KernelContext::new(), Vec::new(), None).map_err(crashed)?;
        let out = runner.run_partition(req.partition, rows);
        let bytes = match p.write_callback.as_str() {
            ROWS_WRITER => encode_rows(&out.rows),
            _ => write_csv_bytes(&output_schema, &out.rows, p.output_header, b','),
        }
        .map_err(io_failure)?;
        self.storage.write(&p.output_uri, &bytes).map_err(io_failure)?;

        let elapsed = started.elapsed().as_millis() as u64;
        if elapsed > req.timeout_ms {
            return Err(InvocationFailure::TimedOut(req.timeout_ms));
        }
        tracing::trace!(partition = req.partition, attempt = req.attempt, elapsed, "invocation done");
        Ok(InvocationResponse {
            output_uri: p.output_uri.clone(),
            rows_in: out.rows_in,
            rows_out: out.rows_out(),
            tally: out.tally,
            unresolved: out.unresolved,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::serverless::CSV_WRITER;
    use rowforge_core::expr::Udf;
    use rowforge_core::id::OpId;
    use rowforge_core::schema::{DataType, Field};
    use rowforge_core::types::Scalar;
    use rowforge_operators::PhysicalOp;
    use uuid::Uuid;

    fn request(storage: &StorageRegistry) -> InvocationRequest {
        storage.write("memory://in/a.csv", b"x\n1\n0\n4\n").unwrap();
        let s = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
        let mut ir = StageIr::new(s.clone());
        ir.push(
            PhysicalOp::Map {
                id: OpId::new(1),
                udf: Udf::parse("8 // x AS x").unwrap(),
            },
            s,
        );
        InvocationRequest {
            job_id: Uuid::new_v4(),
            partition: 0,
            attempt: 0,
            timeout_ms: 60_000,
            pipeline: File2FilePipeline {
                code_id: ir.code_id().unwrap().0.to_hex(),
                stage_ir: ir.to_json().unwrap(),
                write_callback: CSV_WRITER.into(),
                input_uris: vec!["memory://in/a.csv".into()],
                input_sizes: vec![storage.size("memory://in/a.csv").unwrap()],
                input_offsets: vec![0],
                has_header: true,
                delimiter: b',',
                output_uri: "memory://out/part-00000.csv".into(),
                output_header: true,
                input_columns: vec!["x".into()],
                output_columns: vec!["x".into()],
            },
        }
    }

    #[test]
    fn runs_descriptor_and_writes_part_file() {
        let storage = StorageRegistry::new();
        let invoker = InProcessInvoker::new(storage.clone());
        let req = request(&storage);
        let resp = invoker.invoke(&req).unwrap();
        assert_eq!(resp.rows_in, 3);
        assert_eq!(resp.rows_out, 2);
        assert_eq!(resp.tally.total_unresolved(), 1);
        let written = storage.read("memory://out/part-00000.csv").unwrap();
        assert_eq!(written, b"x\n8\n2\n");

        invoker.invoke(&req).unwrap();
        assert_eq!(invoker.warm_units(), 1);
    }

    #[test]
    fn rows_writer_keeps_empty_strings() {
        let storage = StorageRegistry::new();
        storage.write("memory://in/s.csv", b"s\n a\n \n").unwrap();
        let s = Schema::new(vec![Field::new("s", DataType::Utf8, true)]);
        let mut ir = StageIr::new(s.clone());
        ir.push(
            PhysicalOp::Map {
                id: OpId::new(1),
                udf: Udf::parse("strip(s) AS s").unwrap(),
            },
            s,
        );
        let mut req = request(&storage);
        let p = &mut req.pipeline;
        p.code_id = ir.code_id().unwrap().0.to_hex();
        p.stage_ir = ir.to_json().unwrap();
        p.write_callback = ROWS_WRITER.into();
        p.input_uris = vec!["memory://in/s.csv".into()];
        p.input_sizes = vec![storage.size("memory://in/s.csv").unwrap()];
        p.output_uri = "memory://scratch/part-00000.rows".into();
        p.input_columns = vec!["s".into()];
        p.output_columns = vec!["s".into()];

        let resp = InProcessInvoker::new(storage.clone()).invoke(&req).unwrap();
        assert_eq!(resp.rows_out, 2);
        let bytes = storage.read("memory://scratch/part-00000.rows").unwrap();
        let rows = rowforge_io::rows::decode_rows(&bytes, 1).unwrap();
        assert_eq!(rows, vec![vec![Scalar::from("a")], vec![Scalar::from("")]]);
    }

    #[test]
    fn bad_uris_are_not_retryable() {
        let storage = StorageRegistry::new();
        let invoker = InProcessInvoker::new(storage.clone());
        let mut req = request(&storage);
        req.pipeline.input_uris = vec!["ftp://nowhere/a.csv".into()];
        let err = invoker.invoke(&req).unwrap_err();
        assert!(matches!(err, InvocationFailure::MalformedUri(_)));
        assert!(!err.is_transient());
    }

    #[test]
    fn limits_scale_with_memory() {
        let invoker = InProcessInvoker::new(StorageRegistry::new()).with_max_concurrency(8);
        let l = invoker.limits(1024);
        assert_eq!(l.max_input_bytes_per_invocation, 256 * 1024 * 1024);
        assert_eq!(l.max_concurrency, 8);
    }
}
