//! Per-job counters: exception outcomes, stage stats, retries and failures.

use std::collections::BTreeMap;
use std::fmt::Write as _;

use rowforge_core::config::BackendKind;
use rowforge_core::dag::LogicalPlan;
use rowforge_core::exception::{ExceptionCode, ExceptionRecord, ExceptionTally, TallyMap};
use rowforge_core::id::{OpId, StageId};

use crate::runner::PartitionOutput;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StageStats {
    pub stage: StageId,
    pub chain: String,
    /// Short hash of the compiled unit, once compiled.
    pub code_id: Option<String>,
    pub partitions: usize,
    pub rows_in: u64,
    pub rows_out: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Diagnostics {
    /// Backend that actually ran; `None` before execution.
    pub backend: Option<BackendKind>,
    pub tally: ExceptionTally,
    pub unresolved: Vec<ExceptionRecord>,
    pub stages: Vec<StageStats>,
    /// Retries (attempts beyond the first) per remote partition.
    pub retries: BTreeMap<usize, u32>,
    pub failed_partitions: Vec<usize>,
    pub invocations: usize,
    labels: BTreeMap<OpId, String>,
}

impl Diagnostics {
    /// Empty diagnostics labelling operators from the plan the user wrote.
    pub fn new(original: &LogicalPlan) -> Self {
        let mut labels = BTreeMap::new();
        original.walk(&mut |node| {
            labels.insert(node.id, node.describe());
        });
        Self {
            labels,
            ..Self::default()
        }
    }

    /// Forget the counters of a previous run; labels stay.
    pub fn reset(&mut self) {
        let labels = std::mem::take(&mut self.labels);
        *self = Self {
            labels,
            ..Self::default()
        };
    }

    pub fn label(&self, op: OpId) -> String {
        self.labels
            .get(&op)
            .cloned()
            .unwrap_or_else(|| op.to_string())
    }

    pub fn begin_stage(&mut self, stage: StageId, chain: String, code_id: Option<String>) {
        self.stages.push(StageStats {
            stage,
            chain,
            code_id,
            partitions: 0,
            rows_in: 0,
            rows_out: 0,
        });
    }

    /// Fold a finished partition into the current stage.
    pub fn absorb(&mut self, out: &mut PartitionOutput) {
        let unresolved = std::mem::take(&mut out.unresolved);
        self.record_partition(out.rows_in, out.rows_out(), &out.tally, unresolved);
    }

    pub fn record_partition(
        &mut self,
        rows_in: u64,
        rows_out: u64,
        tally: &ExceptionTally,
        mut unresolved: Vec<ExceptionRecord>,
    ) {
        if let Some(stats) = self.stages.last_mut() {
            stats.partitions += 1;
            stats.rows_in += rows_in;
            stats.rows_out += rows_out;
        }
        self.tally.merge(tally);
        self.unresolved.append(&mut unresolved);
    }

    /// Rows of a remote partition that was given up on.
    pub fn partition_lost(&mut self, partition: usize, op: OpId, rows: u64) {
        self.failed_partitions.push(partition);
        self.tally
            .add_unresolved(op, ExceptionCode::PartitionFailure, rows);
    }

    pub fn record_retry(&mut self, partition: usize) {
        *self.retries.entry(partition).or_insert(0) += 1;
    }

    pub fn total_retries(&self) -> u32 {
        self.retries.values().sum()
    }

    /// Every exception raised by user code, handled or not, by code name.
    pub fn exception_counts(&self) -> BTreeMap<String, u64> {
        let mut out = BTreeMap::new();
        for map in [&self.tally.unresolved, &self.tally.resolved, &self.tally.ignored] {
            fold_by_code(map, &mut out);
        }
        out
    }

    /// Sort unresolved records by ordinal so runs with different completion
    /// orders compare equal.
    pub fn normalize(&mut self) {
        self.unresolved.sort_by(|a, b| a.ordinal.cmp(&b.ordinal).then(a.op.cmp(&b.op)));
        self.failed_partitions.sort_unstable();
    }

    /// Multi-line human summary.
    pub fn report(&self) -> String {
        let mut out = String::new();
        if let Some(backend) = self.backend {
            let _ = writeln!(out, "backend: {backend}");
        }
        for s in &self.stages {
            let _ = writeln!(
                out,
                "{}: {} | partitions={} rows_in={} rows_out={}{}",
                s.stage,
                s.chain,
                s.partitions,
                s.rows_in,
                s.rows_out,
                s.code_id
                    .as_ref()
                    .map(|c| format!(" code={c}"))
                    .unwrap_or_default()
            );
        }
        let sections = [
            ("unresolved", &self.tally.unresolved),
            ("resolved", &self.tally.resolved),
            ("ignored", &self.tally.ignored),
            ("general path", &self.tally.general_path),
        ];
        for (name, map) in sections {
            for ((op, code), n) in map {
                let _ = writeln!(out, "{name}: {} {code} x{n}", self.label(*op));
            }
        }
        if !self.retries.is_empty() {
            let _ = writeln!(out, "retries: {}", self.total_retries());
        }
        if !self.failed_partitions.is_empty() {
            let _ = writeln!(out, "failed partitions: {:?}", self.failed_partitions);
        }
        out
    }
}

fn fold_by_code(map: &TallyMap, out: &mut BTreeMap<String, u64>) {
    for ((_, code), n) in map {
        *out.entry(code.name().to_string()).or_insert(0) += n;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::dag::LogicalOp;
    use rowforge_core::exception::RowOrdinal;
    use rowforge_core::schema::Schema;

    fn plan() -> LogicalPlan {
        LogicalPlan::new(
            OpId::new(0),
            LogicalOp::Parallelize {
                schema: Schema::new(vec![]),
                rows: vec![],
            },
        )
    }

    #[test]
    fn counts_fold_every_outcome_by_code() {
        let mut d = Diagnostics::new(&plan());
        d.tally.add_unresolved(OpId::new(1), ExceptionCode::TypeError, 1);
        d.tally.add_resolved(OpId::new(2), ExceptionCode::TypeError, 2);
        d.tally.add_ignored(OpId::new(1), ExceptionCode::ValueError, 4);
        d.tally.add_general_path(OpId::new(1), 7);
        let counts = d.exception_counts();
        assert_eq!(counts.get("TypeError"), Some(&3));
        assert_eq!(counts.get("ValueError"), Some(&4));
        assert!(!counts.contains_key("NormalCaseViolation"));
    }

    #[test]
    fn labels_come_from_the_original_plan() {
        let d = Diagnostics::new(&plan());
        assert_eq!(d.label(OpId::new(0)), "parallelize(0 rows)");
        assert_eq!(d.label(OpId::new(5)), "OpId(5)");
    }

    #[test]
    fn lost_partitions_and_reset() {
        let mut d = Diagnostics::new(&plan());
        d.partition_lost(2, OpId::new(3), 10);
        d.record_retry(2);
        d.record_retry(2);
        d.unresolved.push(ExceptionRecord {
            op: OpId::new(3),
            code: ExceptionCode::TypeError,
            ordinal: RowOrdinal { partition: 0, row: 0 },
            row: vec![],
        });
        assert_eq!(d.exception_counts().get("PartitionFailure"), Some(&10));
        assert_eq!(d.total_retries(), 2);
        assert!(d.report().contains("failed partitions: [2]"));
        d.reset();
        assert!(d.tally.is_empty());
        assert!(d.unresolved.is_empty());
        assert_eq!(d.label(OpId::new(0)), "parallelize(0 rows)");
    }
}
