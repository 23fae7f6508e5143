//! Runs one partition through one stage.
//!
//! Two passes over the partition:
//! - fast: every row goes through the compiled code handle; a row that raises
//!   is parked together with the operator position and the input it failed on.
//! - general: parked rows are replayed in ordinal order on the interpreter,
//!   through the exception router (resolve, ignore, or unresolved).
//!
//! The two outputs are merged back by row ordinal, and by join match order among
//! the rows one input fanned out to.

use std::collections::HashSet;
use std::sync::Arc;

use rowforge_core::exception::{ExceptionCode, ExceptionRecord, ExceptionTally, RowOrdinal};
use rowforge_core::id::OpId;
use rowforge_core::types::Row;
use rowforge_operators::{
    AggState, AggregateSpec, CodeHandle, Interpreter, KernelContext, OpOutput, RowKernel, StageIr,
};

use crate::error::Result;
use crate::router::{find_handler, Route};

/// Everything one partition produced.
#[derive(Debug)]
pub struct PartitionOutput {
    pub partition: usize,
    pub rows_in: u64,
    /// Emitted rows in input order. Empty for aggregate stages.
    pub rows: Vec<Row>,
    pub aggregate: Option<AggState>,
    pub tally: ExceptionTally,
    pub unresolved: Vec<ExceptionRecord>,
}

impl PartitionOutput {
    pub fn rows_out(&self) -> u64 {
        match &self.aggregate {
            Some(state) => state.groups() as u64,
            None => self.rows.len() as u64,
        }
    }
}

/// Position of a fanned-out row among its siblings: one index per fan-out
/// it went through, outermost first. Empty for rows that never fanned out.
type Branch = Vec<u32>;

fn child(branch: &[u32], j: usize) -> Branch {
    let mut b = Vec::with_capacity(branch.len() + 1);
    b.extend_from_slice(branch);
    b.push(j as u32);
    b
}

/// A row the fast path could not finish.
#[derive(Debug)]
struct Parked {
    ordinal: RowOrdinal,
    branch: Branch,
    /// Failing operator; `ops.len()` for the aggregate sink.
    index: usize,
    code: ExceptionCode,
    row: Row,
}

/// A resolution a row went through; counted only if the row survives.
/// Fanned-out siblings share the resolutions made before the fan-out, so
/// each one is committed at most once by `id`.
#[derive(Debug, Clone, Copy)]
struct Resolution {
    id: u64,
    op: OpId,
    code: ExceptionCode,
}

/// Where a row on the general path came from and what happened to it.
#[derive(Debug, Clone)]
struct Lineage {
    ordinal: RowOrdinal,
    branch: Branch,
    trail: Vec<Resolution>,
}

impl Lineage {
    fn fanned(&self, j: usize) -> Lineage {
        Lineage {
            ordinal: self.ordinal,
            branch: child(&self.branch, j),
            trail: self.trail.clone(),
        }
    }

    fn key(&self) -> (u64, Branch) {
        (self.ordinal.row, self.branch.clone())
    }
}

type Keyed = ((u64, Branch), Row);

#[derive(Debug)]
struct Sink {
    fast: Vec<Keyed>,
    general: Vec<Keyed>,
    aggregate: Option<AggState>,
    tally: ExceptionTally,
    unresolved: Vec<ExceptionRecord>,
    next_resolution: u64,
    committed: HashSet<u64>,
}

impl Sink {
    fn resolution(&mut self, op: OpId, code: ExceptionCode) -> Resolution {
        self.next_resolution += 1;
        Resolution {
            id: self.next_resolution,
            op,
            code,
        }
    }

    fn commit(&mut self, trail: &[Resolution]) {
        for r in trail {
            if self.committed.insert(r.id) {
                self.tally.add_resolved(r.op, r.code, 1);
            }
        }
    }
}

/// Per-stage executor shared by every partition of the stage.
#[derive(Debug)]
pub struct StageRunner {
    fast: Arc<CodeHandle>,
    general: Interpreter,
    ctx: KernelContext,
    downstream_ignores: Vec<(OpId, ExceptionCode)>,
    /// Empty aggregation state cloned per partition.
    aggregate: Option<AggState>,
}

impl StageRunner {
    pub fn new(
        fast: Arc<CodeHandle>,
        ctx: KernelContext,
        downstream_ignores: Vec<(OpId, ExceptionCode)>,
        aggregate: Option<&AggregateSpec>,
    ) -> Result<Self> {
        let ir = fast.ir_arc();
        let aggregate = aggregate
            .map(|spec| AggState::new(spec.clone(), ir.output_schema()))
            .transpose()?;
        Ok(Self {
            general: Interpreter::new(ir),
            fast,
            ctx,
            downstream_ignores,
            aggregate,
        })
    }

    fn ir(&self) -> &StageIr {
        self.general.ir()
    }

    pub fn run_partition(&self, partition: usize, rows: Vec<Row>) -> PartitionOutput {
        let rows_in = rows.len() as u64;
        let mut sink = Sink {
            fast: Vec::with_capacity(rows.len()),
            general: Vec::new(),
            aggregate: self.aggregate.clone(),
            tally: ExceptionTally::new(),
            unresolved: Vec::new(),
            next_resolution: 0,
            committed: HashSet::new(),
        };
        let mut parked = Vec::new();

        for (i, row) in rows.into_iter().enumerate() {
            let ordinal = RowOrdinal {
                partition,
                row: i as u64,
            };
            self.fast_row(ordinal, row, &mut sink, &mut parked);
        }
        if !parked.is_empty() {
            tracing::trace!(partition, parked = parked.len(), "replaying rows on the interpreter");
        }
        for p in parked {
            self.recover(p, &mut sink);
        }

        let rows = merge_by_ordinal(std::mem::take(&mut sink.fast), sink.general);
        PartitionOutput {
            partition,
            rows_in,
            rows,
            aggregate: sink.aggregate,
            tally: sink.tally,
            unresolved: sink.unresolved,
        }
    }

    fn fast_row(&self, ordinal: RowOrdinal, row: Row, sink: &mut Sink, parked: &mut Vec<Parked>) {
        let mut stack = vec![(0, Branch::new(), row)];
        while let Some((start, branch, row)) = stack.pop() {
            if let Some((branch, done)) = self.fast_chain(ordinal, start, branch, row, &mut stack, parked) {
                self.emit_fast(ordinal, branch, done, sink, parked);
            }
        }
    }

    /// Run the compiled chain from `start`; `Some` when the row reaches the end.
    fn fast_chain(
        &self,
        ordinal: RowOrdinal,
        start: usize,
        branch: Branch,
        mut row: Row,
        stack: &mut Vec<(usize, Branch, Row)>,
        parked: &mut Vec<Parked>,
    ) -> Option<(Branch, Row)> {
        for (i, op) in self.ir().ops.iter().enumerate().skip(start) {
            if op.is_recovery() {
                continue;
            }
            match self.fast.apply(i, &row, &self.ctx) {
                Ok(OpOutput::Keep) => {}
                Ok(OpOutput::Row(next)) => row = next,
                Ok(OpOutput::Drop) => return None,
                Ok(OpOutput::Rows(fanned)) => {
                    let children = fanned
                        .into_iter()
                        .enumerate()
                        .map(|(j, r)| (i + 1, child(&branch, j), r));
                    stack.extend(children.rev());
                    return None;
                }
                Err(code) => {
                    parked.push(Parked {
                        ordinal,
                        branch,
                        index: i,
                        code,
                        row,
                    });
                    return None;
                }
            }
        }
        Some((branch, row))
    }

    fn emit_fast(
        &self,
        ordinal: RowOrdinal,
        branch: Branch,
        row: Row,
        sink: &mut Sink,
        parked: &mut Vec<Parked>,
    ) {
        match sink.aggregate.as_mut() {
            Some(state) => {
                if let Err(code) = state.update(&row) {
                    parked.push(Parked {
                        ordinal,
                        branch,
                        index: self.ir().ops.len(),
                        code,
                        row,
                    });
                }
            }
            None => sink.fast.push(((ordinal.row, branch), row)),
        }
    }

    fn recover(&self, p: Parked, sink: &mut Sink) {
        let lineage = Lineage {
            ordinal: p.ordinal,
            branch: p.branch,
            trail: Vec::new(),
        };
        let Some(op) = self.ir().ops.get(p.index).map(|op| op.id()) else {
            let op = self.aggregate_op();
            self.route(lineage, op, op, p.index, p.code, p.row, sink);
            return;
        };
        let code = if p.code == ExceptionCode::NormalCaseViolation {
            match self.general.apply(p.index, &p.row, &self.ctx) {
                Ok(out) => {
                    sink.tally.add_general_path(op, 1);
                    self.follow(lineage, p.index + 1, p.row, out, sink);
                    return;
                }
                Err(real) => real,
            }
        } else {
            p.code
        };
        self.route(lineage, op, op, p.index, code, p.row, sink);
    }

    fn aggregate_op(&self) -> OpId {
        self.aggregate
            .as_ref()
            .map(|s| s.spec().op)
            .unwrap_or_else(|| OpId::new(u64::MAX))
    }

    /// Route `row`, the input of the operator that raised, to its handler.
    /// `record_op` is charged with the exception; `attached` is the operator
    /// resolvers must be attached to.
    #[allow(clippy::too_many_arguments)]
    fn route(
        &self,
        mut lineage: Lineage,
        record_op: OpId,
        attached: OpId,
        after: usize,
        code: ExceptionCode,
        row: Row,
        sink: &mut Sink,
    ) {
        match find_handler(self.ir(), after, attached, code, &self.downstream_ignores) {
            Route::Resolve(j) => match self.general.resolve(j, &row) {
                Ok(out) => {
                    let resolution = sink.resolution(attached, code);
                    lineage.trail.push(resolution);
                    self.follow(lineage, j + 1, row, out, sink);
                }
                Err(again) => {
                    let resolver = self.ir().ops[j].id();
                    self.route(lineage, resolver, attached, j, again, row, sink);
                }
            },
            Route::Ignore(rule) => {
                tracing::trace!(op = %record_op, %code, %rule, "row ignored");
                sink.tally.add_ignored(record_op, code, 1);
            }
            Route::Unhandled => {
                sink.tally.add_unresolved(record_op, code, 1);
                sink.unresolved.push(ExceptionRecord {
                    op: record_op,
                    code,
                    ordinal: lineage.ordinal,
                    row,
                });
            }
        }
    }

    /// Apply the outcome of an operator (or handler) that took `input`, then
    /// keep going on the interpreter from `next`.
    fn follow(&self, lineage: Lineage, next: usize, input: Row, out: OpOutput, sink: &mut Sink) {
        match out {
            OpOutput::Keep => self.run_general(lineage, next, input, sink),
            OpOutput::Row(row) => self.run_general(lineage, next, row, sink),
            OpOutput::Drop => sink.commit(&lineage.trail),
            OpOutput::Rows(rows) => {
                for (j, row) in rows.into_iter().enumerate() {
                    self.run_general(lineage.fanned(j), next, row, sink);
                }
            }
        }
    }

    fn run_general(&self, lineage: Lineage, from: usize, row: Row, sink: &mut Sink) {
        let ops = &self.ir().ops;
        let Some(i) = (from..ops.len()).find(|&i| !ops[i].is_recovery()) else {
            self.finish_general(lineage, row, sink);
            return;
        };
        match self.general.apply(i, &row, &self.ctx) {
            Ok(out) => self.follow(lineage, i + 1, row, out, sink),
            Err(code) => {
                let op = ops[i].id();
                self.route(lineage, op, op, i, code, row, sink);
            }
        }
    }

    fn finish_general(&self, lineage: Lineage, row: Row, sink: &mut Sink) {
        match sink.aggregate.as_mut() {
            Some(state) => {
                if let Err(code) = state.update(&row) {
                    let op = self.aggregate_op();
                    let end = self.ir().ops.len();
                    self.route(lineage, op, op, end, code, row, sink);
                    return;
                }
            }
            None => sink.general.push((lineage.key(), row)),
        }
        sink.commit(&lineage.trail);
    }
}

/// Both inputs are sorted by (ordinal, branch); keys never repeat across them.
fn merge_by_ordinal(fast: Vec<Keyed>, general: Vec<Keyed>) -> Vec<Row> {
    if general.is_empty() {
        return fast.into_iter().map(|(_, r)| r).collect();
    }
    let mut out = Vec::with_capacity(fast.len() + general.len());
    let mut general = general.into_iter().peekable();
    for (k, row) in fast {
        while let Some((_, g)) = general.next_if(|(g, _)| *g < k) {
            out.push(g);
        }
        out.push(row);
    }
    out.extend(general.map(|(_, r)| r));
    out
}
