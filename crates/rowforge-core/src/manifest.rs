//! Run manifest emitted after each execution, for audit and replay.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BackendKind;
use crate::hash::Hash256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ManifestId(pub Uuid);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    pub id: ManifestId,

    /// Stable hash of the stage graph (operator chains, schemas, end modes).
    pub plan_hash: Hash256,

    /// Backend that actually ran the job (never `Auto`).
    pub backend: BackendKind,

    pub engine_version: String,

    pub stages: usize,
    pub partitions: usize,
    pub rows_out: u64,
    pub unresolved: u64,

    /// Milliseconds since Unix epoch (UTC).
    pub started_ms: u64,
    pub finished_ms: u64,
}

impl RunManifest {
    pub fn new(plan_hash: Hash256, backend: BackendKind, started_ms: u64) -> Self {
        Self {
            id: ManifestId(Uuid::new_v4()),
            plan_hash,
            backend,
            engine_version: crate::VERSION.to_string(),
            stages: 0,
            partitions: 0,
            rows_out: 0,
            unresolved: 0,
            started_ms,
            finished_ms: started_ms,
        }
    }

    pub fn finish(mut self, finished_ms: u64, rows_out: u64, unresolved: u64) -> Self {
        self.finished_ms = finished_ms;
        self.rows_out = rows_out;
        self.unresolved = unresolved;
        self
    }
}
