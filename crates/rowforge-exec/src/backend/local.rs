//! Local backend: stages run in arena order on the worker pool.
//!
//! Every boundary materializes: a stage starts only after all partitions of
//! its predecessors finished and were merged. A storage stage that fails or
//! is cancelled removes every part name it owns.

use std::sync::Arc;

use rowforge_core::dag::Action;
use rowforge_core::schema::Schema;
use rowforge_core::types::Row;
use rowforge_io::uri::Location;
use rowforge_io::writers::csv::{part_name, write_csv_bytes};
use rowforge_io::StorageRegistry;
use rowforge_operators::{AggState, JoinTable, KernelContext};
use rowforge_planner::physical::{EndPointMode, Stage, StageGraph, StageInput};

use super::{remove_parts, ExecEnv};
use crate::diagnostics::Diagnostics;
use crate::error::{ExecError, Result};
use crate::metrics;
use crate::partition::{chunk_rows, csv_options, source_partitions, PartitionInput};
use crate::result::ResultSet;
use crate::runner::{PartitionOutput, StageRunner};
use crate::scheduler::run_pool;

/// What a finished non-root stage hands to its consumer.
#[derive(Debug)]
enum StageOutput {
    Rows(Vec<Row>),
    Table(Arc<JoinTable>),
}

/// Merged output of one stage.
struct Merged {
    rows: Vec<Row>,
    aggregate: Option<AggState>,
    written: Vec<String>,
    rows_written: u64,
}

pub fn execute(graph: &StageGraph, env: &ExecEnv<'_>, diag: &mut Diagnostics) -> Result<ResultSet> {
    graph.validate()?;
    let root = graph.root_index();
    let mut outputs: Vec<Option<StageOutput>> = Vec::with_capacity(graph.stages.len());

    for (i, stage) in graph.stages.iter().enumerate() {
        if env.cancel.is_cancelled() {
            return Err(ExecError::Cancelled);
        }
        let inputs = stage_inputs(stage, &mut outputs, env)?;
        let merged = run_stage(stage, &outputs, inputs, env, diag)?;

        if i == root {
            return finish_root(graph, stage, merged, env.storage);
        }
        let out = match &stage.end {
            EndPointMode::HashTable { key, .. } => {
                let table = JoinTable::build(&stage.output_schema, key, merged.rows)?;
                tracing::debug!(stage = %stage.id, rows = table.len(), "join table built");
                StageOutput::Table(Arc::new(table))
            }
            EndPointMode::Aggregate(spec) => StageOutput::Rows(finish_aggregate(merged.aggregate, spec, stage)?),
            _ => StageOutput::Rows(merged.rows),
        };
        outputs.push(Some(out));
    }
    Err(ExecError::Invalid("stage graph has no root".into()))
}

fn stage_inputs(
    stage: &Stage,
    outputs: &mut [Option<StageOutput>],
    env: &ExecEnv<'_>,
) -> Result<Vec<PartitionInput>> {
    match &stage.input {
        StageInput::Source(source) => source_partitions(source, env.storage, env.cfg),
        StageInput::Stage(p) => match outputs.get_mut(*p).and_then(Option::take) {
            Some(StageOutput::Rows(rows)) => Ok(chunk_rows(rows, env.cfg.partition_rows)),
            _ => Err(ExecError::Invalid(format!(
                "{} reads stage {p}, which produced no rows",
                stage.id
            ))),
        },
    }
}

fn run_stage(
    stage: &Stage,
    outputs: &[Option<StageOutput>],
    inputs: Vec<PartitionInput>,
    env: &ExecEnv<'_>,
    diag: &mut Diagnostics,
) -> Result<Merged> {
    let chain = stage.ir.chain_label();
    let handle = stage
        .compile(env.codegen)
        .map_err(|source| ExecError::Compile {
            stage: stage.id,
            chain: chain.clone(),
            source,
        })?;

    let mut ctx = KernelContext::new();
    for (join, b) in &stage.builds {
        match outputs.get(*b) {
            Some(Some(StageOutput::Table(t))) => ctx.insert_table(*join, Arc::clone(t)),
            _ => {
                return Err(ExecError::Invalid(format!(
                    "{} probes {join} but stage {b} built no table",
                    stage.id
                )))
            }
        }
    }
    let aggregate = match &stage.end {
        EndPointMode::Aggregate(spec) => Some(spec),
        _ => None,
    };
    let runner = StageRunner::new(
        Arc::clone(&handle),
        ctx,
        stage.downstream_ignores.clone(),
        aggregate,
    )?;

    let _span = metrics::stage_span(stage.id, &chain, inputs.len()).entered();
    diag.begin_stage(stage.id, chain, Some(handle.id().to_string()));

    let schema = stage.ir.input_schema().clone();
    let opts = stage.source().map(csv_options).unwrap_or_default();
    let storage = env.storage;
    let sink = match &stage.end {
        EndPointMode::Storage { uri, header } => Some((Location::parse(uri)?, *header)),
        _ => None,
    };
    let out_schema = &stage.output_schema;

    let partitions = inputs.len();
    let done = run_pool(inputs, env.cfg.max_parallel_tasks, env.cancel, |i, input| {
        let rows = input.load(storage, &schema, opts)?;
        let out = runner.run_partition(i, rows);
        let written = match &sink {
            Some((base, header)) => {
                Some(write_part(storage, base, i, out_schema, &out.rows, *header)?)
            }
            None => None,
        };
        Ok::<_, ExecError>((out, written))
    });

    let done = done.and_then(|done| {
        done.into_iter()
            .map(|(i, r)| r.map(|v| (i, v)))
            .collect::<Result<Vec<(usize, (PartitionOutput, Option<String>))>>>()
    });
    let mut done = match done {
        Ok(done) => done,
        Err(e) => {
            // cancelled or failed partitions leave no way to tell which parts exist
            if let Some((base, _)) = &sink {
                let parts: Vec<String> = (0..partitions).map(|i| base.join(&part_name(i)).to_string()).collect();
                remove_parts(storage, parts.iter().map(String::as_str));
            }
            return Err(e);
        }
    };
    // user aggregate folds also merge in partition order
    if stage.end.is_ordered() || aggregate.is_some() {
        done.sort_by_key(|(i, _)| *i);
    }

    let mut merged = Merged {
        rows: Vec::new(),
        aggregate: None,
        written: Vec::new(),
        rows_written: 0,
    };
    for (_, (mut out, written)) in done {
        metrics::partition_done(&out);
        diag.absorb(&mut out);
        if let Some(state) = out.aggregate {
            match merged.aggregate.as_mut() {
                Some(acc) => acc.merge(state).map_err(|code| ExecError::JobFailed {
                    reason: format!("{}: combining partition aggregates raised {code}", stage.id),
                })?,
                None => merged.aggregate = Some(state),
            }
        }
        match written {
            Some(uri) => {
                merged.rows_written += out.rows.len() as u64;
                merged.written.push(uri);
            }
            None => merged.rows.append(&mut out.rows),
        }
    }
    tracing::info!(stage = %stage.id, rows = merged.rows.len(), "stage finished");
    Ok(merged)
}

fn finish_aggregate(
    state: Option<AggState>,
    spec: &rowforge_operators::AggregateSpec,
    stage: &Stage,
) -> Result<Vec<Row>> {
    let state = match state {
        Some(s) => s,
        None => AggState::new(spec.clone(), stage.ir.output_schema())?,
    };
    Ok(state.finish())
}

fn finish_root(graph: &StageGraph, stage: &Stage, merged: Merged, storage: &StorageRegistry) -> Result<ResultSet> {
    let schema = stage.output_schema.clone();
    match &stage.end {
        EndPointMode::ResultSet { ordered } => {
            Ok(ResultSet::from_action(&graph.action, schema, merged.rows, *ordered))
        }
        EndPointMode::Storage { .. } => Ok(ResultSet::written(
            schema,
            merged.written,
            merged.rows_written,
        )),
        EndPointMode::Aggregate(spec) => {
            let rows = finish_aggregate(merged.aggregate, spec, stage)?;
            match &graph.action {
                Action::WriteCsv { uri, header } => {
                    let base = Location::parse(uri)?;
                    let n = rows.len() as u64;
                    let written = write_part(storage, &base, 0, &schema, &rows, *header)?;
                    Ok(ResultSet::written(schema, vec![written], n))
                }
                action => Ok(ResultSet::from_action(action, schema, rows, false)),
            }
        }
        other => Err(ExecError::Invalid(format!("root stage ends in {other:?}"))),
    }
}

/// Write one partition's rows as `part-NNNNN.csv` under `base`.
pub(crate) fn write_part(
    storage: &StorageRegistry,
    base: &Location,
    index: usize,
    schema: &Schema,
    rows: &[Row],
    header: bool,
) -> Result<String> {
    let target = base.join(&part_name(index)).to_string();
    let bytes = write_csv_bytes(schema, rows, header, b',')?;
    storage.write(&target, &bytes)?;
    Ok(target)
}
