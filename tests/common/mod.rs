//! Shared fixtures for the integration tests.
#![allow(dead_code)]

use rowforge::core::config::EngineConfig;
use rowforge::core::schema::{DataType, Field, Schema};
use rowforge::core::types::{Row, Scalar};
use rowforge::exec::{
    InProcessInvoker, InvocationFailure, InvocationRequest, InvocationResponse, InvocationService,
    ServerlessLimits,
};
use rowforge::io::StorageRegistry;

pub fn int_schema(name: &str) -> Schema {
    Schema::new(vec![Field::new(name, DataType::Int64, false)])
}

pub fn int_rows(values: impl IntoIterator<Item = i64>) -> Vec<Row> {
    values.into_iter().map(|v| vec![Scalar::I64(v)]).collect()
}

pub fn ints(rows: &[Row], col: usize) -> Vec<i64> {
    rows.iter().filter_map(|r| r[col].as_i64()).collect()
}

/// Engine config with retries that do not slow the suite down.
pub fn quick_config() -> EngineConfig {
    EngineConfig {
        max_retries: 3,
        initial_backoff_ms: 1,
        max_backoff_ms: 2,
        ..EngineConfig::default()
    }
}

/// A one-column `x` csv of exactly `bytes` bytes (even, at least 2).
pub fn csv_of_size(bytes: usize, value: u8) -> Vec<u8> {
    let mut out = b"x\n".to_vec();
    while out.len() < bytes {
        out.push(b'0' + value % 10);
        out.push(b'\n');
    }
    out
}

/// In-process invoker with a fixed per-invocation input cap.
pub struct CappedInvoker {
    inner: InProcessInvoker,
    cap: u64,
}

impl CappedInvoker {
    pub fn new(storage: &StorageRegistry, cap: u64) -> Self {
        Self {
            inner: InProcessInvoker::new(storage.clone()).with_max_concurrency(4),
            cap,
        }
    }
}

impl InvocationService for CappedInvoker {
    fn limits(&self, memory_mb: u64) -> ServerlessLimits {
        ServerlessLimits {
            max_input_bytes_per_invocation: self.cap,
            ..self.inner.limits(memory_mb)
        }
    }

    fn invoke(&self, req: &InvocationRequest) -> Result<InvocationResponse, InvocationFailure> {
        self.inner.invoke(req)
    }
}
