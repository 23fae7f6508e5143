//! Stage IR: the serializable operator chain of one stage.

use serde::{Deserialize, Serialize};

use rowforge_core::dag::JoinType;
use rowforge_core::exception::ExceptionCode;
use rowforge_core::expr::Udf;
use rowforge_core::hash::hash_serde;
use rowforge_core::id::OpId;
use rowforge_core::schema::Schema;

use crate::codegen::CodeId;
use crate::traits::CompileError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum PhysicalOp {
    Map {
        id: OpId,
        udf: Udf,
    },
    Filter {
        id: OpId,
        udf: Udf,
    },
    MapColumn {
        id: OpId,
        column: String,
        udf: Udf,
    },
    WithColumn {
        id: OpId,
        column: String,
        udf: Udf,
    },
    SelectColumns {
        id: OpId,
        columns: Vec<String>,
    },
    RenameColumn {
        id: OpId,
        old: String,
        new: String,
    },
    /// Handler for `code` raised by operator `parent`. A no-op for normal rows.
    Resolve {
        id: OpId,
        parent: OpId,
        code: ExceptionCode,
        udf: Udf,
    },
    Ignore {
        id: OpId,
        code: ExceptionCode,
    },
    /// Probe of the hash table built for join `id` by another stage.
    JoinProbe {
        id: OpId,
        key: String,
        join_type: JoinType,
        right_width: usize,
    },
}

impl PhysicalOp {
    pub fn id(&self) -> OpId {
        match self {
            PhysicalOp::Map { id, .. }
            | PhysicalOp::Filter { id, .. }
            | PhysicalOp::MapColumn { id, .. }
            | PhysicalOp::WithColumn { id, .. }
            | PhysicalOp::SelectColumns { id, .. }
            | PhysicalOp::RenameColumn { id, .. }
            | PhysicalOp::Resolve { id, .. }
            | PhysicalOp::Ignore { id, .. }
            | PhysicalOp::JoinProbe { id, .. } => *id,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PhysicalOp::Map { .. } => "map",
            PhysicalOp::Filter { .. } => "filter",
            PhysicalOp::MapColumn { .. } => "map_column",
            PhysicalOp::WithColumn { .. } => "with_column",
            PhysicalOp::SelectColumns { .. } => "select_columns",
            PhysicalOp::RenameColumn { .. } => "rename_column",
            PhysicalOp::Resolve { .. } => "resolve",
            PhysicalOp::Ignore { .. } => "ignore",
            PhysicalOp::JoinProbe { .. } => "join_probe",
        }
    }

    /// Operators whose exceptions can be handled by a following `Resolve`.
    pub fn is_resolvable(&self) -> bool {
        matches!(
            self,
            PhysicalOp::Map { .. }
                | PhysicalOp::Filter { .. }
                | PhysicalOp::MapColumn { .. }
                | PhysicalOp::WithColumn { .. }
        )
    }

    /// Recovery markers never touch normal rows.
    pub fn is_recovery(&self) -> bool {
        matches!(self, PhysicalOp::Resolve { .. } | PhysicalOp::Ignore { .. })
    }
}

/// Operator chain of one stage together with the schema between every pair of
/// operators: `schemas[i]` is what operator `i` consumes and
/// `schemas[ops.len()]` is what the stage emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageIr {
    pub ops: Vec<PhysicalOp>,
    pub schemas: Vec<Schema>,
}

impl StageIr {
    pub fn new(input_schema: Schema) -> Self {
        Self {
            ops: Vec::new(),
            schemas: vec![input_schema],
        }
    }

    pub fn push(&mut self, op: PhysicalOp, output_schema: Schema) {
        self.ops.push(op);
        self.schemas.push(output_schema);
    }

    pub fn input_schema(&self) -> &Schema {
        &self.schemas[0]
    }

    pub fn output_schema(&self) -> &Schema {
        &self.schemas[self.schemas.len() - 1]
    }

    /// Schema consumed by operator `index`.
    pub fn schema_at(&self, index: usize) -> &Schema {
        &self.schemas[index.min(self.schemas.len() - 1)]
    }

    pub fn position(&self, id: OpId) -> Option<usize> {
        self.ops.iter().position(|op| op.id() == id)
    }

    /// Ignore rules of this chain, in chain order.
    pub fn ignores(&self) -> Vec<(OpId, ExceptionCode)> {
        self.ops
            .iter()
            .filter_map(|op| match op {
                PhysicalOp::Ignore { id, code } => Some((*id, *code)),
                _ => None,
            })
            .collect()
    }

    /// `map -> resolve -> filter`, for error messages and explain output.
    pub fn chain_label(&self) -> String {
        if self.ops.is_empty() {
            return "(passthrough)".to_string();
        }
        self.ops
            .iter()
            .map(|op| op.kind())
            .collect::<Vec<_>>()
            .join(" -> ")
    }

    pub fn validate(&self) -> Result<(), CompileError> {
        if self.schemas.len() != self.ops.len() + 1 {
            return Err(CompileError::InvalidIr(format!(
                "{} operators but {} schemas",
                self.ops.len(),
                self.schemas.len()
            )));
        }
        for (i, op) in self.ops.iter().enumerate() {
            if let PhysicalOp::Resolve { parent, .. } = op {
                match self.position(*parent) {
                    Some(p) if p < i && self.ops[p].is_resolvable() => {}
                    _ => {
                        return Err(CompileError::InvalidIr(format!(
                            "resolver {} refers to {} which is not a preceding resolvable operator",
                            op.id(),
                            parent
                        )))
                    }
                }
            }
        }
        Ok(())
    }

    /// Content hash identifying the compiled unit built from this IR.
    pub fn code_id(&self) -> Result<CodeId, CompileError> {
        hash_serde(self)
            .map(CodeId)
            .map_err(|e| CompileError::InvalidIr(e.to_string()))
    }

    pub fn to_json(&self) -> Result<String, CompileError> {
        serde_json::to_string(self).map_err(|e| CompileError::InvalidIr(e.to_string()))
    }

    pub fn from_json(s: &str) -> Result<StageIr, CompileError> {
        let ir: StageIr =
            serde_json::from_str(s).map_err(|e| CompileError::InvalidIr(e.to_string()))?;
        ir.validate()?;
        Ok(ir)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::schema::{DataType, Field};

    fn ir() -> StageIr {
        let s = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
        let mut ir = StageIr::new(s.clone());
        ir.push(
            PhysicalOp::Map {
                id: OpId::new(1),
                udf: Udf::parse("x").unwrap(),
            },
            s.clone(),
        );
        ir.push(
            PhysicalOp::Resolve {
                id: OpId::new(2),
                parent: OpId::new(1),
                code: ExceptionCode::TypeError,
                udf: Udf::parse("0 AS x").unwrap(),
            },
            s.clone(),
        );
        ir.push(
            PhysicalOp::Ignore {
                id: OpId::new(3),
                code: ExceptionCode::ValueError,
            },
            s,
        );
        ir
    }

    #[test]
    fn json_round_trip_keeps_code_id() {
        let ir = ir();
        let json = ir.to_json().unwrap();
        let back = StageIr::from_json(&json).unwrap();
        assert_eq!(back, ir);
        assert_eq!(back.code_id().unwrap(), ir.code_id().unwrap());
        assert_eq!(ir.chain_label(), "map -> resolve -> ignore");
        assert_eq!(ir.ignores(), vec![(OpId::new(3), ExceptionCode::ValueError)]);
    }

    #[test]
    fn dangling_resolver_is_invalid() {
        let mut ir = ir();
        if let PhysicalOp::Resolve { parent, .. } = &mut ir.ops[1] {
            *parent = OpId::new(99);
        }
        assert!(ir.validate().is_err());
    }
}
