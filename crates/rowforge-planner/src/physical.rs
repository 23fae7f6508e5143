//! Stage graph: the physical program the exec runtime drives.
//!
//! Stages live in an arena (`StageGraph::stages`) in topological order and
//! refer to their predecessors by index. The last stage is the root.

use std::fmt::Write as _;
use std::sync::{Arc, OnceLock};

use rowforge_core::dag::Action;
use rowforge_core::exception::ExceptionCode;
use rowforge_core::id::{OpId, StageId};
use rowforge_core::schema::Schema;
use rowforge_core::types::Row;
use rowforge_operators::{AggregateSpec, CodeGenerator, CodeHandle, CompileError, StageIr};
use serde::{Deserialize, Serialize};

use crate::error::{PlanError, Result};

/// Where a source stage reads its rows from.
#[derive(Debug, Clone)]
pub enum SourceSpec {
    Rows {
        op: OpId,
        rows: Arc<Vec<Row>>,
    },
    Csv {
        op: OpId,
        uris: Vec<String>,
        has_header: bool,
        delimiter: u8,
    },
}

impl SourceSpec {
    pub fn op(&self) -> OpId {
        match self {
            SourceSpec::Rows { op, .. } | SourceSpec::Csv { op, .. } => *op,
        }
    }

    fn describe(&self) -> String {
        match self {
            SourceSpec::Rows { rows, .. } => format!("parallelize({} rows)", rows.len()),
            SourceSpec::Csv { uris, .. } => format!("csv({})", uris.join(", ")),
        }
    }
}

#[derive(Debug, Clone)]
pub enum StageInput {
    Source(SourceSpec),
    /// Output of an earlier stage in the arena.
    Stage(usize),
}

/// What happens to the rows leaving a stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum EndPointMode {
    /// Fully realised before the successor starts (cache).
    Materialize,
    /// Build side of join `join`, keyed on `key`.
    HashTable { join: OpId, key: String },
    Aggregate(AggregateSpec),
    /// Rows handed back to the caller.
    ResultSet { ordered: bool },
    /// CSV part files written under `uri`.
    Storage { uri: String, header: bool },
}

impl EndPointMode {
    pub fn is_root_mode(&self) -> bool {
        matches!(
            self,
            EndPointMode::ResultSet { .. } | EndPointMode::Storage { .. }
        )
    }

    /// Whether partition outputs are merged by partition index.
    pub fn is_ordered(&self) -> bool {
        match self {
            EndPointMode::ResultSet { ordered } => *ordered,
            EndPointMode::Storage { .. } | EndPointMode::Materialize => true,
            EndPointMode::HashTable { .. } | EndPointMode::Aggregate(_) => false,
        }
    }

    fn label(&self) -> String {
        match self {
            EndPointMode::Materialize => "materialize".to_string(),
            EndPointMode::HashTable { join, key } => format!("hash_table({join}, key={key})"),
            EndPointMode::Aggregate(spec) if spec.aggs.is_empty() => {
                format!("unique({})", spec.group_by.join(", "))
            }
            EndPointMode::Aggregate(spec) => {
                let aggs: Vec<String> = spec.aggs.iter().map(|a| a.to_string()).collect();
                format!(
                    "aggregate(by [{}]: {})",
                    spec.group_by.join(", "),
                    aggs.join(", ")
                )
            }
            EndPointMode::ResultSet { ordered } => format!("result_set(ordered={ordered})"),
            EndPointMode::Storage { uri, .. } => format!("storage({uri})"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub id: StageId,
    pub input: StageInput,
    /// Join tables this stage probes: (join op, index of the building stage).
    pub builds: Vec<(OpId, usize)>,
    pub ir: Arc<StageIr>,
    pub end: EndPointMode,
    /// Schema of what leaves the stage; differs from the chain output for
    /// aggregate stages.
    pub output_schema: Schema,
    /// Ignore rules of every stage consuming this one's output, nearest first.
    pub downstream_ignores: Vec<(OpId, ExceptionCode)>,
    code: OnceLock<Arc<CodeHandle>>,
}

impl Stage {
    pub fn new(
        id: StageId,
        input: StageInput,
        builds: Vec<(OpId, usize)>,
        ir: StageIr,
        end: EndPointMode,
        output_schema: Schema,
    ) -> Self {
        Self {
            id,
            input,
            builds,
            ir: Arc::new(ir),
            end,
            output_schema,
            downstream_ignores: Vec::new(),
            code: OnceLock::new(),
        }
    }

    /// Compile once; later calls hand back the cached handle.
    pub fn compile(&self, codegen: &dyn CodeGenerator) -> std::result::Result<Arc<CodeHandle>, CompileError> {
        if let Some(handle) = self.code.get() {
            return Ok(Arc::clone(handle));
        }
        let handle = Arc::new(codegen.compile(&self.ir)?);
        Ok(Arc::clone(self.code.get_or_init(|| handle)))
    }

    pub fn is_compiled(&self) -> bool {
        self.code.get().is_some()
    }

    /// Arena indices this stage depends on.
    pub fn predecessors(&self) -> Vec<usize> {
        let mut out: Vec<usize> = match self.input {
            StageInput::Stage(i) => vec![i],
            StageInput::Source(_) => Vec::new(),
        };
        out.extend(self.builds.iter().map(|(_, i)| *i));
        out
    }

    pub fn source(&self) -> Option<&SourceSpec> {
        match &self.input {
            StageInput::Source(s) => Some(s),
            StageInput::Stage(_) => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct StageGraph {
    pub stages: Vec<Stage>,
    pub action: Action,
    pub action_op: OpId,
}

impl StageGraph {
    pub fn root(&self) -> Option<&Stage> {
        self.stages.last()
    }

    pub fn root_index(&self) -> usize {
        self.stages.len().saturating_sub(1)
    }

    pub fn successors(&self, index: usize) -> Vec<usize> {
        self.stages
            .iter()
            .enumerate()
            .filter(|(_, s)| s.predecessors().contains(&index))
            .map(|(i, _)| i)
            .collect()
    }

    /// Structural checks: topological order, one root, schemas line up
    /// across every boundary and end modes fit their position.
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(PlanError::InvalidGraph(msg));
        if self.stages.is_empty() {
            return invalid("no stages".into());
        }
        let root = self.root_index();
        for (i, stage) in self.stages.iter().enumerate() {
            if stage.id != StageId::new(i as u64) {
                return invalid(format!("stage at index {i} has id {}", stage.id));
            }
            for p in stage.predecessors() {
                if p >= i {
                    return invalid(format!("{} depends on later stage {p}", stage.id));
                }
            }
            if let StageInput::Stage(p) = stage.input {
                let upstream = &self.stages[p].output_schema;
                if upstream != stage.ir.input_schema() {
                    return invalid(format!(
                        "{} expects [{}] but {} emits [{}]",
                        stage.id,
                        stage.ir.input_schema().names().join(", "),
                        self.stages[p].id,
                        upstream.names().join(", ")
                    ));
                }
            }
            for (join, b) in &stage.builds {
                match &self.stages[*b].end {
                    EndPointMode::HashTable { join: j, .. } if j == join => {}
                    other => {
                        return invalid(format!(
                            "{} probes {join} but stage {b} ends in {}",
                            stage.id,
                            other.label()
                        ))
                    }
                }
            }
            let succ = self.successors(i);
            if i == root {
                if !succ.is_empty() {
                    return invalid(format!("root {} has successors", stage.id));
                }
                if !stage.end.is_root_mode() && !matches!(stage.end, EndPointMode::Aggregate(_)) {
                    return invalid(format!("root {} ends in {}", stage.id, stage.end.label()));
                }
            } else {
                if succ.is_empty() {
                    return invalid(format!("{} has no consumer", stage.id));
                }
                if stage.end.is_root_mode() {
                    return invalid(format!("inner {} ends in {}", stage.id, stage.end.label()));
                }
            }
        }
        Ok(())
    }

    /// One stage reading CSV files, row-wise operators only, writing its
    /// partitions straight out: the shape remote invocations can run.
    pub fn is_file2file(&self) -> bool {
        match self.stages.as_slice() {
            [only] => {
                matches!(only.input, StageInput::Source(SourceSpec::Csv { .. }))
                    && only.builds.is_empty()
                    && only.end.is_root_mode()
            }
            _ => false,
        }
    }

    pub fn input_uris(&self) -> Vec<String> {
        let mut out = Vec::new();
        for stage in &self.stages {
            if let Some(SourceSpec::Csv { uris, .. }) = stage.source() {
                out.extend(uris.iter().cloned());
            }
        }
        out
    }

    pub fn explain(&self) -> String {
        let mut out = String::new();
        for (i, stage) in self.stages.iter().enumerate() {
            let input = match &stage.input {
                StageInput::Source(s) => s.describe(),
                StageInput::Stage(p) => format!("stage {p}"),
            };
            let _ = write!(out, "{} <- {input}", stage.id);
            for (join, b) in &stage.builds {
                let _ = write!(out, " + probe {join} (stage {b})");
            }
            let _ = writeln!(out);
            let _ = writeln!(out, "  ops: {}", stage.ir.chain_label());
            let _ = writeln!(out, "  out: [{}]", stage.output_schema.names().join(", "));
            let _ = writeln!(out, "  end: {}", stage.end.label());
            if !stage.downstream_ignores.is_empty() {
                let rules: Vec<String> = stage
                    .downstream_ignores
                    .iter()
                    .map(|(op, code)| format!("{code}@{op}"))
                    .collect();
                let _ = writeln!(out, "  downstream ignores: {}", rules.join(", "));
            }
            if i == self.root_index() {
                let _ = writeln!(out, "  action: {:?}", self.action);
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::expr::Udf;
    use rowforge_core::schema::{DataType, Field};
    use rowforge_operators::{ClosureCodegen, PhysicalOp};

    fn stage() -> Stage {
        let schema = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
        let mut ir = StageIr::new(schema.clone());
        ir.push(
            PhysicalOp::Map {
                id: OpId::new(1),
                udf: Udf::parse("x + 1 AS x").unwrap(),
            },
            schema.clone(),
        );
        Stage::new(
            StageId::new(0),
            StageInput::Source(SourceSpec::Rows {
                op: OpId::new(0),
                rows: Arc::new(vec![]),
            }),
            vec![],
            ir,
            EndPointMode::ResultSet { ordered: true },
            schema,
        )
    }

    #[test]
    fn compile_is_memoized() {
        let s = stage();
        assert!(!s.is_compiled());
        let a = s.compile(&ClosureCodegen).unwrap();
        let b = s.compile(&ClosureCodegen).unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert!(s.is_compiled());
    }

    #[test]
    fn single_row_source_stage_is_valid_but_not_file2file() {
        let g = StageGraph {
            stages: vec![stage()],
            action: Action::Collect,
            action_op: OpId::new(2),
        };
        g.validate().unwrap();
        assert!(!g.is_file2file());
        assert!(g.explain().contains("ops: map"));
    }

    #[test]
    fn inner_stage_with_root_mode_is_rejected() {
        let mut second = stage();
        second.id = StageId::new(1);
        second.input = StageInput::Stage(0);
        let g = StageGraph {
            stages: vec![stage(), second],
            action: Action::Collect,
            action_op: OpId::new(2),
        };
        assert!(matches!(g.validate(), Err(PlanError::InvalidGraph(_))));
    }
}
