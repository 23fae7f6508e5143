//! Plan Builder: logical tree -> stage graph.
//!
//! Walks from the root action down to the sources. A stage is opened at every
//! source and closed wherever rows have to be fully realised before anything
//! downstream can use them: cache, the build side of a join, aggregates, and
//! finally the root action.

use std::collections::HashSet;
use std::sync::Arc;

use rowforge_core::dag::{Action, JoinType, LogicalOp, LogicalPlan};
use rowforge_core::id::{OpId, StageId};
use rowforge_core::schema::{Field, Schema};
use rowforge_operators::infer::{column_schema, filter_schema, map_schema, single_expr};
use rowforge_operators::{join_output_schema, AggregateSpec, OpError, PhysicalOp, StageIr};

use crate::error::{PlanError, Result};
use crate::physical::{EndPointMode, SourceSpec, Stage, StageGraph, StageInput};

struct OpenStage {
    input: StageInput,
    ir: StageIr,
    builds: Vec<(OpId, usize)>,
    /// Set while the stage only forwards the output of this aggregate stage.
    forwards: Option<usize>,
}

impl OpenStage {
    fn new(input: StageInput, schema: Schema) -> Self {
        Self {
            input,
            ir: StageIr::new(schema),
            builds: Vec::new(),
            forwards: None,
        }
    }

    fn schema(&self) -> &Schema {
        self.ir.output_schema()
    }

    fn is_trivial(&self) -> bool {
        self.ir.ops.is_empty() && self.builds.is_empty()
    }
}

fn op_err(node: &LogicalPlan) -> impl Fn(OpError) -> PlanError + '_ {
    move |source| PlanError::Operator {
        op: node.id,
        kind: node.kind(),
        source,
    }
}

fn unsupported(node: &LogicalPlan, msg: impl Into<String>) -> PlanError {
    PlanError::Unsupported {
        op: node.id,
        kind: node.kind(),
        msg: msg.into(),
    }
}

/// Field-wise union of the parent's output and a resolver's output, so rows
/// coming out of either fit the declared schema.
fn widen(parent: &Schema, handler: &Schema) -> Schema {
    Schema::new(
        parent
            .fields
            .iter()
            .zip(&handler.fields)
            .map(|(p, h)| {
                Field::new(
                    p.name.clone(),
                    p.data_type.unify(h.data_type),
                    p.nullable || h.nullable,
                )
            })
            .collect(),
    )
}

#[derive(Default)]
struct Lowering {
    stages: Vec<Stage>,
}

impl Lowering {
    fn close(&mut self, open: OpenStage, end: EndPointMode) -> Result<usize> {
        let output_schema = match &end {
            EndPointMode::Aggregate(spec) => {
                spec.output_schema(open.schema())
                    .map_err(|source| PlanError::Operator {
                        op: spec.op,
                        kind: if spec.aggs.is_empty() { "unique" } else { "aggregate" },
                        source,
                    })?
            }
            _ => open.schema().clone(),
        };
        let index = self.stages.len();
        tracing::trace!(
            stage = index,
            ops = %open.ir.chain_label(),
            end = ?end,
            "closed stage"
        );
        self.stages.push(Stage::new(
            StageId::new(index as u64),
            open.input,
            open.builds,
            open.ir,
            end,
            output_schema,
        ));
        Ok(index)
    }

    fn lower(&mut self, node: &LogicalPlan) -> Result<OpenStage> {
        match &node.op {
            LogicalOp::Parallelize { schema, rows } => {
                if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != schema.len()) {
                    return Err(unsupported(
                        node,
                        format!(
                            "row {i} has {} values but the schema has {} columns",
                            row.len(),
                            schema.len()
                        ),
                    ));
                }
                let source = SourceSpec::Rows {
                    op: node.id,
                    rows: Arc::new(rows.clone()),
                };
                Ok(OpenStage::new(StageInput::Source(source), schema.clone()))
            }
            LogicalOp::CsvScan {
                uris,
                schema,
                has_header,
                delimiter,
            } => {
                if uris.is_empty() {
                    return Err(unsupported(node, "no input files"));
                }
                let source = SourceSpec::Csv {
                    op: node.id,
                    uris: uris.clone(),
                    has_header: *has_header,
                    delimiter: *delimiter,
                };
                Ok(OpenStage::new(StageInput::Source(source), schema.clone()))
            }
            LogicalOp::Map { input, udf } => {
                let mut open = self.lower(input)?;
                let out = map_schema(udf, open.schema()).map_err(op_err(node))?;
                open.ir.push(PhysicalOp::Map { id: node.id, udf: udf.clone() }, out);
                Ok(open)
            }
            LogicalOp::Filter { input, udf } => {
                let mut open = self.lower(input)?;
                let out = filter_schema(udf, open.schema()).map_err(op_err(node))?;
                open.ir.push(PhysicalOp::Filter { id: node.id, udf: udf.clone() }, out);
                Ok(open)
            }
            LogicalOp::MapColumn { input, column, udf } => {
                let mut open = self.lower(input)?;
                let out = column_schema(column, udf, open.schema(), true).map_err(op_err(node))?;
                let op = PhysicalOp::MapColumn {
                    id: node.id,
                    column: column.clone(),
                    udf: udf.clone(),
                };
                open.ir.push(op, out);
                Ok(open)
            }
            LogicalOp::WithColumn { input, column, udf } => {
                let mut open = self.lower(input)?;
                let out = column_schema(column, udf, open.schema(), false).map_err(op_err(node))?;
                let op = PhysicalOp::WithColumn {
                    id: node.id,
                    column: column.clone(),
                    udf: udf.clone(),
                };
                open.ir.push(op, out);
                Ok(open)
            }
            LogicalOp::SelectColumns { input, columns } => {
                let mut open = self.lower(input)?;
                let out = open
                    .schema()
                    .project(columns)
                    .map_err(|e| op_err(node)(e.into()))?;
                let op = PhysicalOp::SelectColumns {
                    id: node.id,
                    columns: columns.clone(),
                };
                open.ir.push(op, out);
                Ok(open)
            }
            LogicalOp::RenameColumn { input, old, new } => {
                let mut open = self.lower(input)?;
                let out = open
                    .schema()
                    .rename(old, new)
                    .map_err(|e| op_err(node)(e.into()))?;
                let op = PhysicalOp::RenameColumn {
                    id: node.id,
                    old: old.clone(),
                    new: new.clone(),
                };
                open.ir.push(op, out);
                Ok(open)
            }
            LogicalOp::Resolve { input, code, udf } => {
                let mut open = self.lower(input)?;
                let out = self.resolver_schema(node, &open, udf)?;
                let parent = open
                    .ir
                    .ops
                    .iter()
                    .rev()
                    .find(|op| !op.is_recovery())
                    .map(|op| op.id())
                    .ok_or_else(|| unsupported(node, "resolve must follow a map, filter, map_column or with_column"))?;
                let op = PhysicalOp::Resolve {
                    id: node.id,
                    parent,
                    code: *code,
                    udf: udf.clone(),
                };
                open.ir.push(op, out);
                Ok(open)
            }
            LogicalOp::Ignore { input, code } => {
                let mut open = self.lower(input)?;
                let out = open.schema().clone();
                open.ir.push(PhysicalOp::Ignore { id: node.id, code: *code }, out);
                Ok(open)
            }
            LogicalOp::Cache { input } => {
                let open = self.lower(input)?;
                let schema = open.schema().clone();
                let index = self.close(open, EndPointMode::Materialize)?;
                Ok(OpenStage::new(StageInput::Stage(index), schema))
            }
            LogicalOp::Join { left, right, spec } => {
                if matches!(spec.join_type, JoinType::Right | JoinType::Full) {
                    return Err(unsupported(
                        node,
                        format!("{:?} joins are not supported", spec.join_type),
                    ));
                }
                let mut probe = self.lower(left)?;
                let build = self.lower(right)?;
                let right_schema = build.schema().clone();
                let out = join_output_schema(probe.schema(), &right_schema, spec).map_err(op_err(node))?;
                let build_index = self.close(
                    build,
                    EndPointMode::HashTable {
                        join: node.id,
                        key: spec.right_key.clone(),
                    },
                )?;
                probe.builds.push((node.id, build_index));
                let op = PhysicalOp::JoinProbe {
                    id: node.id,
                    key: spec.left_key.clone(),
                    join_type: spec.join_type,
                    right_width: right_schema.len().saturating_sub(1),
                };
                probe.ir.push(op, out);
                Ok(probe)
            }
            LogicalOp::Aggregate {
                input,
                group_by,
                aggs,
            } => {
                let open = self.lower(input)?;
                let spec = AggregateSpec {
                    op: node.id,
                    group_by: group_by.clone(),
                    aggs: aggs.clone(),
                };
                self.close_aggregate(open, spec)
            }
            LogicalOp::Unique { input } => {
                let open = self.lower(input)?;
                let spec = AggregateSpec::unique(node.id, open.schema());
                self.close_aggregate(open, spec)
            }
            LogicalOp::Action { .. } => Err(PlanError::NestedAction { op: node.id }),
        }
    }

    fn close_aggregate(&mut self, open: OpenStage, spec: AggregateSpec) -> Result<OpenStage> {
        let index = self.close(open, EndPointMode::Aggregate(spec))?;
        let schema = self.stages[index].output_schema.clone();
        let mut next = OpenStage::new(StageInput::Stage(index), schema);
        next.forwards = Some(index);
        Ok(next)
    }

    /// Output schema after resolver `node`, which must directly follow a
    /// resolvable operator (other resolve/ignore nodes may sit in between).
    fn resolver_schema(
        &self,
        node: &LogicalPlan,
        open: &OpenStage,
        udf: &rowforge_core::expr::Udf,
    ) -> Result<Schema> {
        let not_resolvable =
            || unsupported(node, "resolve must follow a map, filter, map_column or with_column");
        let index = open
            .ir
            .ops
            .iter()
            .rposition(|op| !op.is_recovery())
            .ok_or_else(not_resolvable)?;
        let parent = &open.ir.ops[index];
        if !parent.is_resolvable() {
            return Err(not_resolvable());
        }
        let parent_in = open.ir.schema_at(index);
        let parent_out = &open.ir.schemas[index + 1];
        let handler = match parent {
            PhysicalOp::Map { udf: parent_udf, .. } => {
                let handler = map_schema(udf, parent_in).map_err(op_err(node))?;
                if handler.len() != parent_udf.len() {
                    return Err(op_err(node)(OpError::Arity {
                        expected: parent_udf.len(),
                        got: handler.len(),
                    }));
                }
                handler
            }
            PhysicalOp::Filter { .. } => filter_schema(udf, parent_in).map_err(op_err(node))?,
            PhysicalOp::MapColumn { column, .. } | PhysicalOp::WithColumn { column, .. } => {
                single_expr(udf).map_err(op_err(node))?;
                column_schema(column, udf, parent_in, false).map_err(op_err(node))?
            }
            _ => return Err(not_resolvable()),
        };
        Ok(widen(open.schema(), &widen(parent_out, &handler)))
    }
}

fn check_unique_ids(root: &LogicalPlan) -> Result<()> {
    let mut seen = HashSet::new();
    let mut dup = None;
    root.walk(&mut |n| {
        if !seen.insert(n.id) && dup.is_none() {
            dup = Some(n.id);
        }
    });
    match dup {
        Some(id) => Err(PlanError::DuplicateOpId(id)),
        None => Ok(()),
    }
}

/// Lower an action-rooted logical plan into a validated stage graph.
pub fn lower_to_stages(root: &LogicalPlan) -> Result<StageGraph> {
    check_unique_ids(root)?;
    let LogicalOp::Action { input, action } = &root.op else {
        return Err(PlanError::MissingAction {
            op: root.id,
            kind: root.kind(),
        });
    };

    let mut lowering = Lowering::default();
    let open = lowering.lower(input)?;
    let forwards_last = open.is_trivial()
        && open.forwards.is_some()
        && open.forwards == lowering.stages.len().checked_sub(1);
    if !forwards_last {
        let end = match action {
            Action::Collect | Action::Take(_) => EndPointMode::ResultSet { ordered: true },
            Action::Count => EndPointMode::ResultSet { ordered: false },
            Action::WriteCsv { uri, header } => EndPointMode::Storage {
                uri: uri.clone(),
                header: *header,
            },
        };
        lowering.close(open, end)?;
    }

    let mut graph = StageGraph {
        stages: lowering.stages,
        action: action.clone(),
        action_op: root.id,
    };
    attach_downstream_ignores(&mut graph);
    graph.validate()?;
    tracing::debug!(
        stages = graph.stages.len(),
        file2file = graph.is_file2file(),
        "lowered plan"
    );
    Ok(graph)
}

/// Every stage feeds exactly one consumer, so the downstream rules are the
/// ignores along the consumer chain, nearest first.
fn attach_downstream_ignores(graph: &mut StageGraph) {
    for i in 0..graph.stages.len() {
        let mut rules = Vec::new();
        let mut cursor = graph.successors(i).first().copied();
        while let Some(next) = cursor {
            rules.extend(graph.stages[next].ir.ignores());
            cursor = graph.successors(next).first().copied();
        }
        graph.stages[i].downstream_ignores = rules;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::PlanContext;
    use rowforge_core::dag::{Aggregation, JoinSpec};
    use rowforge_core::exception::ExceptionCode;
    use rowforge_core::schema::DataType;
    use rowforge_core::types::Scalar;

    fn ctx_rows(ctx: &PlanContext) -> crate::logical::Pipeline {
        let schema = Schema::new(vec![
            Field::new("k", DataType::Int64, false),
            Field::new("v", DataType::Utf8, false),
        ]);
        let rows = vec![vec![Scalar::I64(1), Scalar::from("a")]];
        ctx.parallelize(schema, rows)
    }

    #[test]
    fn row_wise_chain_fuses_into_one_stage() {
        let ctx = PlanContext::new();
        let plan = ctx_rows(&ctx)
            .map("k * 2 AS k, v")
            .unwrap()
            .resolve(ExceptionCode::TypeError, "0 AS k, v")
            .unwrap()
            .filter("k > 0")
            .unwrap()
            .collect();
        let g = lower_to_stages(&plan).unwrap();
        assert_eq!(g.stages.len(), 1);
        assert_eq!(g.stages[0].ir.chain_label(), "map -> resolve -> filter");
        assert_eq!(g.stages[0].end, EndPointMode::ResultSet { ordered: true });
    }

    #[test]
    fn join_closes_build_side() {
        let ctx = PlanContext::new();
        let right = ctx_rows(&ctx).rename_column("v", "w");
        let plan = ctx_rows(&ctx).join(right, "k", "k").count();
        let g = lower_to_stages(&plan).unwrap();
        assert_eq!(g.stages.len(), 2);
        assert!(matches!(g.stages[0].end, EndPointMode::HashTable { .. }));
        assert_eq!(g.stages[1].builds.len(), 1);
        assert_eq!(g.stages[1].output_schema.names(), vec!["k", "v", "w"]);
        assert_eq!(g.stages[1].end, EndPointMode::ResultSet { ordered: false });
    }

    #[test]
    fn aggregate_root_absorbs_action() {
        let ctx = PlanContext::new();
        let plan = ctx_rows(&ctx)
            .aggregate(&["v"], vec![Aggregation::Count, Aggregation::Sum("k".into())])
            .collect();
        let g = lower_to_stages(&plan).unwrap();
        assert_eq!(g.stages.len(), 1);
        assert!(matches!(g.stages[0].end, EndPointMode::Aggregate(_)));
        assert_eq!(g.stages[0].output_schema.names(), vec!["v", "count", "sum_k"]);
    }

    #[test]
    fn cache_then_map_makes_two_stages() {
        let ctx = PlanContext::new();
        let plan = ctx_rows(&ctx)
            .cache()
            .map("k + 1 AS k")
            .unwrap()
            .ignore(ExceptionCode::TypeError)
            .collect();
        let g = lower_to_stages(&plan).unwrap();
        assert_eq!(g.stages.len(), 2);
        assert_eq!(g.stages[0].end, EndPointMode::Materialize);
        assert_eq!(g.stages[0].downstream_ignores.len(), 1);
    }

    #[test]
    fn resolve_after_boundary_is_rejected() {
        let ctx = PlanContext::new();
        let plan = ctx_rows(&ctx)
            .cache()
            .resolve(ExceptionCode::TypeError, "0 AS k, v")
            .unwrap()
            .collect();
        let err = lower_to_stages(&plan).unwrap_err();
        assert!(matches!(err, PlanError::Unsupported { kind: "resolve", .. }));
    }

    #[test]
    fn resolver_arity_must_match_map() {
        let ctx = PlanContext::new();
        let plan = ctx_rows(&ctx)
            .map("k AS a, v AS b")
            .unwrap()
            .resolve(ExceptionCode::TypeError, "0 AS a")
            .unwrap()
            .collect();
        assert!(matches!(
            lower_to_stages(&plan),
            Err(PlanError::Operator {
                source: OpError::Arity { expected: 2, got: 1 },
                ..
            })
        ));
    }

    #[test]
    fn unsupported_join_type_names_the_operator() {
        let ctx = PlanContext::new();
        let right = ctx_rows(&ctx);
        let join = ctx_rows(&ctx).join_with(right, JoinSpec::new("k", "k", JoinType::Full));
        let id = join.id();
        let err = lower_to_stages(&join.collect()).unwrap_err();
        assert_eq!(
            err,
            PlanError::Unsupported {
                op: id,
                kind: "join",
                msg: "Full joins are not supported".into()
            }
        );
    }

    #[test]
    fn missing_action_and_unknown_column() {
        let ctx = PlanContext::new();
        let bare = ctx_rows(&ctx).map("k AS k").unwrap();
        assert!(matches!(
            lower_to_stages(bare.plan()),
            Err(PlanError::MissingAction { .. })
        ));
        let plan = ctx_rows(&ctx).filter("nope > 1").unwrap().collect();
        assert!(matches!(
            lower_to_stages(&plan),
            Err(PlanError::Operator {
                source: OpError::UnknownColumn { .. },
                ..
            })
        ));
    }

    #[test]
    fn pipelines_from_different_contexts_collide() {
        let a = PlanContext::new();
        let b = PlanContext::new();
        let plan = ctx_rows(&a).join(ctx_rows(&b), "k", "k").collect();
        assert!(matches!(
            lower_to_stages(&plan),
            Err(PlanError::DuplicateOpId(_))
        ));
    }
}
