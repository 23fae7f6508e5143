//! The interpreter: exact, dynamically typed evaluation of a stage IR.
//!
//! It is the fallback path for rows the compiled code rejected and the only
//! path that runs resolver handlers. Column references are looked up by name
//! in the operator's input schema on every evaluation.

use std::sync::Arc;

use rowforge_core::exception::ExceptionCode;
use rowforge_core::expr::{BinaryOp, Expr, Udf};
use rowforge_core::schema::Schema;
use rowforge_core::types::{Row, Scalar};

use crate::eval;
use crate::ir::{PhysicalOp, StageIr};
use crate::join::probe_row;
use crate::traits::{KernelContext, OpOutput, RowKernel};

pub fn eval_expr(expr: &Expr, row: &Row, schema: &Schema) -> Result<Scalar, ExceptionCode> {
    match expr {
        Expr::Literal(v) => Ok(v.clone()),
        Expr::Column(name) => schema
            .index_of(name)
            .and_then(|i| row.get(i))
            .cloned()
            .ok_or(ExceptionCode::KeyError),
        Expr::Unary { op, expr } => eval::unary(*op, eval_expr(expr, row, schema)?),
        Expr::Binary {
            op: op @ (BinaryOp::And | BinaryOp::Or),
            left,
            right,
        } => {
            let l = eval_expr(left, row, schema)?;
            let short = (*op == BinaryOp::And) != l.truthy();
            if short {
                Ok(l)
            } else {
                eval_expr(right, row, schema)
            }
        }
        Expr::Binary { op, left, right } => {
            let l = eval_expr(left, row, schema)?;
            let r = eval_expr(right, row, schema)?;
            eval::binary(*op, l, r)
        }
        Expr::Call { func, args } => {
            let vals = args
                .iter()
                .map(|a| eval_expr(a, row, schema))
                .collect::<Result<Vec<_>, _>>()?;
            eval::call(*func, vals)
        }
    }
}

/// How a UDF-bearing operator turns its UDF output into a row.
#[derive(Debug, Clone, Copy)]
enum UdfShape<'a> {
    Map,
    Filter,
    Column { name: &'a str },
}

fn apply_udf(
    shape: UdfShape<'_>,
    udf: &Udf,
    row: &Row,
    input: &Schema,
) -> Result<OpOutput, ExceptionCode> {
    match shape {
        UdfShape::Map => {
            let out = udf
                .projections()
                .iter()
                .map(|p| eval_expr(&p.expr, row, input))
                .collect::<Result<Row, _>>()?;
            Ok(OpOutput::Row(out))
        }
        UdfShape::Filter => {
            let expr = udf.single().ok_or(ExceptionCode::TypeError)?;
            if eval_expr(expr, row, input)?.truthy() {
                Ok(OpOutput::Keep)
            } else {
                Ok(OpOutput::Drop)
            }
        }
        UdfShape::Column { name } => {
            let expr = udf.single().ok_or(ExceptionCode::TypeError)?;
            let v = eval_expr(expr, row, input)?;
            let mut out = row.clone();
            match input.index_of(name) {
                Some(i) if i < out.len() => out[i] = v,
                Some(_) => return Err(ExceptionCode::IndexError),
                None => out.push(v),
            }
            Ok(OpOutput::Row(out))
        }
    }
}

fn shape_of(op: &PhysicalOp) -> Option<(UdfShape<'_>, &Udf)> {
    match op {
        PhysicalOp::Map { udf, .. } => Some((UdfShape::Map, udf)),
        PhysicalOp::Filter { udf, .. } => Some((UdfShape::Filter, udf)),
        PhysicalOp::MapColumn { column, udf, .. } | PhysicalOp::WithColumn { column, udf, .. } => {
            Some((UdfShape::Column { name: column }, udf))
        }
        _ => None,
    }
}

#[derive(Debug, Clone)]
pub struct Interpreter {
    ir: Arc<StageIr>,
}

impl Interpreter {
    pub fn new(ir: Arc<StageIr>) -> Self {
        Self { ir }
    }

    /// Run the handler of resolver `index` on `row`, the input its parent
    /// operator saw. The handler output has the parent's shape: a replacement
    /// row for map, a keep/drop verdict for filter, a column value otherwise.
    pub fn resolve(&self, index: usize, row: &Row) -> Result<OpOutput, ExceptionCode> {
        let Some(PhysicalOp::Resolve { parent, udf, .. }) = self.ir.ops.get(index) else {
            return Err(ExceptionCode::IndexError);
        };
        let parent_idx = self.ir.position(*parent).ok_or(ExceptionCode::KeyError)?;
        let (shape, _) = shape_of(&self.ir.ops[parent_idx]).ok_or(ExceptionCode::TypeError)?;
        apply_udf(shape, udf, row, self.ir.schema_at(parent_idx))
    }
}

impl RowKernel for Interpreter {
    fn ir(&self) -> &StageIr {
        &self.ir
    }

    fn apply(&self, index: usize, row: &Row, ctx: &KernelContext) -> Result<OpOutput, ExceptionCode> {
        let op = self.ir.ops.get(index).ok_or(ExceptionCode::IndexError)?;
        let input = self.ir.schema_at(index);
        if let Some((shape, udf)) = shape_of(op) {
            return apply_udf(shape, udf, row, input);
        }
        match op {
            PhysicalOp::SelectColumns { columns, .. } => {
                let out = columns
                    .iter()
                    .map(|c| {
                        input
                            .index_of(c)
                            .and_then(|i| row.get(i))
                            .cloned()
                            .ok_or(ExceptionCode::KeyError)
                    })
                    .collect::<Result<Row, _>>()?;
                Ok(OpOutput::Row(out))
            }
            PhysicalOp::JoinProbe { id, key, join_type, .. } => {
                let table = ctx.table(*id).ok_or(ExceptionCode::KeyError)?;
                let key_idx = input.index_of(key).ok_or(ExceptionCode::KeyError)?;
                probe_row(table, *join_type, row, key_idx)
            }
            _ => Ok(OpOutput::Keep),
        }
    }
}
