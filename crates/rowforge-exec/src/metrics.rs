//! Tracing hooks for stage and partition boundaries.
//!
//! Only `tracing` events are emitted here; the binary decides where they go.

use rowforge_core::id::StageId;

use crate::runner::PartitionOutput;

pub fn stage_span(stage: StageId, chain: &str, partitions: usize) -> tracing::Span {
    tracing::info_span!("stage", %stage, chain, partitions)
}

pub fn partition_done(out: &PartitionOutput) {
    tracing::debug!(
        partition = out.partition,
        rows_in = out.rows_in,
        rows_out = out.rows_out(),
        unresolved = out.tally.total_unresolved(),
        resolved = out.tally.total_resolved(),
        ignored = out.tally.total_ignored(),
        "partition done"
    );
}

pub fn invocation_failed(partition: usize, attempt: u32, reason: &str) {
    tracing::warn!(partition, attempt, reason, "invocation failed");
}
