//! Closure code generation: the fast path.
//!
//! Every expression is lowered once into a tree of boxed closures with column
//! names resolved to indices. Where inference fixed the operand types the
//! closure is specialised on them and rejects anything else with
//! `NormalCaseViolation`; the exception router then replays the row on the
//! interpreter. Value-level errors (overflow, division by zero, failed
//! conversions) raise the same codes as the interpreter.

use std::fmt;
use std::sync::Arc;

use rowforge_core::dag::JoinType;
use rowforge_core::exception::ExceptionCode;
use rowforge_core::expr::{BinaryOp, Expr, UnaryOp};
use rowforge_core::hash::Hash256;
use rowforge_core::id::OpId;
use rowforge_core::schema::{DataType, Schema};
use rowforge_core::types::{Row, Scalar};

use crate::eval;
use crate::infer::{infer_expr, single_expr};
use crate::ir::{PhysicalOp, StageIr};
use crate::join::probe_row;
use crate::traits::{CodeGenerator, CompileError, KernelContext, OpError, OpOutput, RowKernel};

use ExceptionCode::NormalCaseViolation;

/// Content address of a compiled unit: the hash of its stage IR.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CodeId(pub Hash256);

impl fmt::Display for CodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "code-{}", self.0.short())
    }
}

pub type Compiled = Box<dyn Fn(&Row) -> Result<Scalar, ExceptionCode> + Send + Sync>;

enum CompiledOp {
    Map(Vec<Compiled>),
    Filter(Compiled),
    SetColumn(usize, Compiled),
    AppendColumn(Compiled),
    Select(Vec<usize>),
    Probe {
        join: OpId,
        key: usize,
        join_type: JoinType,
    },
    PassThrough,
}

/// A compiled stage. Shared read-only between worker threads.
pub struct CodeHandle {
    id: CodeId,
    ir: Arc<StageIr>,
    ops: Vec<CompiledOp>,
}

impl fmt::Debug for CodeHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeHandle")
            .field("id", &self.id)
            .field("chain", &self.ir.chain_label())
            .finish()
    }
}

impl CodeHandle {
    pub fn id(&self) -> CodeId {
        self.id
    }

    pub fn ir_arc(&self) -> Arc<StageIr> {
        Arc::clone(&self.ir)
    }
}

impl RowKernel for CodeHandle {
    fn ir(&self) -> &StageIr {
        &self.ir
    }

    fn apply(&self, index: usize, row: &Row, ctx: &KernelContext) -> Result<OpOutput, ExceptionCode> {
        let op = self.ops.get(index).ok_or(ExceptionCode::IndexError)?;
        match op {
            CompiledOp::Map(exprs) => {
                let out = exprs.iter().map(|e| e(row)).collect::<Result<Row, _>>()?;
                Ok(OpOutput::Row(out))
            }
            CompiledOp::Filter(pred) => match pred(row)? {
                Scalar::Bool(true) => Ok(OpOutput::Keep),
                Scalar::Bool(false) => Ok(OpOutput::Drop),
                other => Ok(if other.truthy() {
                    OpOutput::Keep
                } else {
                    OpOutput::Drop
                }),
            },
            CompiledOp::SetColumn(i, e) => {
                let v = e(row)?;
                let mut out = row.clone();
                *out.get_mut(*i).ok_or(NormalCaseViolation)? = v;
                Ok(OpOutput::Row(out))
            }
            CompiledOp::AppendColumn(e) => {
                let v = e(row)?;
                let mut out = Vec::with_capacity(row.len() + 1);
                out.extend_from_slice(row);
                out.push(v);
                Ok(OpOutput::Row(out))
            }
            CompiledOp::Select(idx) => {
                let out = idx
                    .iter()
                    .map(|&i| row.get(i).cloned().ok_or(NormalCaseViolation))
                    .collect::<Result<Row, _>>()?;
                Ok(OpOutput::Row(out))
            }
            CompiledOp::Probe {
                join,
                key,
                join_type,
            } => {
                let table = ctx.table(*join).ok_or(ExceptionCode::KeyError)?;
                probe_row(table, *join_type, row, *key)
            }
            CompiledOp::PassThrough => Ok(OpOutput::Keep),
        }
    }
}

/// Default code generator: lowers each operator into closures.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClosureCodegen;

impl CodeGenerator for ClosureCodegen {
    fn name(&self) -> &'static str {
        "closure"
    }

    fn compile(&self, ir: &StageIr) -> Result<CodeHandle, CompileError> {
        ir.validate()?;
        let id = ir.code_id()?;
        let ops = ir
            .ops
            .iter()
            .enumerate()
            .map(|(i, op)| {
                compile_op(op, ir.schema_at(i)).map_err(|source| CompileError::Operator {
                    op: op.id(),
                    kind: op.kind(),
                    source,
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(CodeHandle {
            id,
            ir: Arc::new(ir.clone()),
            ops,
        })
    }
}

fn compile_op(op: &PhysicalOp, input: &Schema) -> Result<CompiledOp, OpError> {
    let index_of = |c: &str| {
        input.index_of(c).ok_or_else(|| OpError::UnknownColumn {
            column: c.to_string(),
        })
    };
    Ok(match op {
        PhysicalOp::Map { udf, .. } => CompiledOp::Map(
            udf.projections()
                .iter()
                .map(|p| compile_expr(&p.expr, input))
                .collect::<Result<_, _>>()?,
        ),
        PhysicalOp::Filter { udf, .. } => CompiledOp::Filter(compile_expr(single_expr(udf)?, input)?),
        PhysicalOp::MapColumn { column, udf, .. } => {
            CompiledOp::SetColumn(index_of(column)?, compile_expr(single_expr(udf)?, input)?)
        }
        PhysicalOp::WithColumn { column, udf, .. } => {
            let e = compile_expr(single_expr(udf)?, input)?;
            match input.index_of(column) {
                Some(i) => CompiledOp::SetColumn(i, e),
                None => CompiledOp::AppendColumn(e),
            }
        }
        PhysicalOp::SelectColumns { columns, .. } => CompiledOp::Select(
            columns
                .iter()
                .map(|c| index_of(c))
                .collect::<Result<_, _>>()?,
        ),
        PhysicalOp::JoinProbe {
            id, key, join_type, ..
        } => CompiledOp::Probe {
            join: *id,
            key: index_of(key)?,
            join_type: *join_type,
        },
        PhysicalOp::RenameColumn { .. } | PhysicalOp::Resolve { .. } | PhysicalOp::Ignore { .. } => {
            CompiledOp::PassThrough
        }
    })
}

/// Fixed-type view of an operand for specialised arithmetic.
fn typed_f64(v: &Scalar, dt: DataType) -> Option<f64> {
    match (v, dt) {
        (Scalar::I64(x), DataType::Int64) => Some(*x as f64),
        (Scalar::F64(x), DataType::Float64) => Some(*x),
        _ => None,
    }
}

pub fn compile_expr(expr: &Expr, schema: &Schema) -> Result<Compiled, OpError> {
    Ok(match expr {
        Expr::Literal(v) => {
            let v = v.clone();
            Box::new(move |_| Ok(v.clone()))
        }
        Expr::Column(name) => {
            let idx = schema.index_of(name).ok_or_else(|| OpError::UnknownColumn {
                column: name.clone(),
            })?;
            let f = &schema.fields[idx];
            let (dt, nullable) = (f.data_type, f.nullable);
            Box::new(move |row| match row.get(idx) {
                Some(v) if v.conforms_to(dt, nullable) => Ok(v.clone()),
                _ => Err(NormalCaseViolation),
            })
        }
        Expr::Unary { op, expr: inner } => {
            let dt = infer_expr(inner, schema)?.data_type;
            let inner = compile_expr(inner, schema)?;
            match (op, dt) {
                (UnaryOp::Neg, DataType::Int64) => Box::new(move |row| match inner(row)? {
                    Scalar::I64(x) => x
                        .checked_neg()
                        .map(Scalar::I64)
                        .ok_or(ExceptionCode::OverflowError),
                    _ => Err(NormalCaseViolation),
                }),
                (UnaryOp::Neg, DataType::Float64) => Box::new(move |row| match inner(row)? {
                    Scalar::F64(x) => Ok(Scalar::F64(-x)),
                    _ => Err(NormalCaseViolation),
                }),
                (op, _) => {
                    let op = *op;
                    Box::new(move |row| eval::unary(op, inner(row)?))
                }
            }
        }
        Expr::Binary { op, left, right } => compile_binary(*op, left, right, schema)?,
        Expr::Call { func, args } => {
            let func = *func;
            let args = args
                .iter()
                .map(|a| compile_expr(a, schema))
                .collect::<Result<Vec<_>, _>>()?;
            Box::new(move |row| {
                let vals = args.iter().map(|a| a(row)).collect::<Result<Vec<_>, _>>()?;
                eval::call(func, vals)
            })
        }
    })
}

fn compile_binary(op: BinaryOp, left: &Expr, right: &Expr, schema: &Schema) -> Result<Compiled, OpError> {
    let lt = infer_expr(left, schema)?.data_type;
    let rt = infer_expr(right, schema)?.data_type;
    let l = compile_expr(left, schema)?;
    let r = compile_expr(right, schema)?;

    if matches!(op, BinaryOp::And | BinaryOp::Or) {
        let is_and = op == BinaryOp::And;
        return Ok(Box::new(move |row| {
            let a = l(row)?;
            if is_and != a.truthy() {
                Ok(a)
            } else {
                r(row)
            }
        }));
    }

    use DataType::*;
    let numeric = |t: DataType| matches!(t, Int64 | Float64);

    Ok(match (lt, rt) {
        (Int64, Int64) if op.is_arithmetic() => Box::new(move |row| match (l(row)?, r(row)?) {
            (Scalar::I64(a), Scalar::I64(b)) => eval::int_arith(op, a, b),
            _ => Err(NormalCaseViolation),
        }),
        (Int64, Int64) => Box::new(move |row| match (l(row)?, r(row)?) {
            (Scalar::I64(a), Scalar::I64(b)) => Ok(Scalar::Bool(match op {
                BinaryOp::Eq => a == b,
                BinaryOp::NotEq => a != b,
                BinaryOp::Lt => a < b,
                BinaryOp::LtEq => a <= b,
                BinaryOp::Gt => a > b,
                _ => a >= b,
            })),
            _ => Err(NormalCaseViolation),
        }),
        (a, b) if numeric(a) && numeric(b) && op.is_arithmetic() => Box::new(move |row| {
            let (x, y) = (l(row)?, r(row)?);
            match (typed_f64(&x, a), typed_f64(&y, b)) {
                (Some(x), Some(y)) => eval::float_arith(op, x, y),
                _ => Err(NormalCaseViolation),
            }
        }),
        (a, b) if numeric(a) && numeric(b) => Box::new(move |row| {
            let (x, y) = (l(row)?, r(row)?);
            if typed_f64(&x, a).is_none() || typed_f64(&y, b).is_none() {
                return Err(NormalCaseViolation);
            }
            eval::compare(op, &x, &y).map(Scalar::Bool)
        }),
        (Utf8, Utf8) if op == BinaryOp::Add || op.is_comparison() => {
            Box::new(move |row| match (l(row)?, r(row)?) {
                (x @ Scalar::Str(_), y @ Scalar::Str(_)) => eval::binary(op, x, y),
                _ => Err(NormalCaseViolation),
            })
        }
        _ => Box::new(move |row| eval::binary(op, l(row)?, r(row)?)),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::interp::Interpreter;
    use rowforge_core::expr::Udf;
    use rowforge_core::schema::Field;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Float64, true),
            Field::new("s", DataType::Utf8, false),
        ])
    }

    fn eval_compiled(src: &str, row: Row) -> Result<Scalar, ExceptionCode> {
        let f = compile_expr(&Expr::parse(src).unwrap(), &schema()).unwrap();
        f(&row)
    }

    fn good_row() -> Row {
        vec![Scalar::I64(6), Scalar::F64(1.5), Scalar::from("hi")]
    }

    #[test]
    fn specialised_paths_match_interpreter() {
        let srcs = [
            "a + 1",
            "a * b",
            "a // 4",
            "a % 4",
            "a / 4",
            "a > 5 and b < 2",
            "s + '!'",
            "upper(s)",
            "-a",
            "coalesce(b, 0.0)",
            "a == 6.0",
        ];
        for src in srcs {
            let e = Expr::parse(src).unwrap();
            let want = crate::interp::eval_expr(&e, &good_row(), &schema());
            assert_eq!(eval_compiled(src, good_row()), want, "{src}");
        }
    }

    #[test]
    fn type_violations_are_flagged() {
        let dirty = vec![Scalar::from("6"), Scalar::F64(1.5), Scalar::from("hi")];
        assert_eq!(eval_compiled("a + 1", dirty.clone()), Err(NormalCaseViolation));
        assert_eq!(eval_compiled("len(s)", dirty), Ok(Scalar::I64(2)));

        let null_b = vec![Scalar::I64(1), Scalar::Null, Scalar::from("hi")];
        assert_eq!(eval_compiled("a + b", null_b.clone()), Err(NormalCaseViolation));
        assert_eq!(eval_compiled("is_null(b)", null_b), Ok(Scalar::Bool(true)));
    }

    #[test]
    fn value_errors_keep_their_codes() {
        let zero = vec![Scalar::I64(0), Scalar::F64(0.0), Scalar::from("x")];
        assert_eq!(
            eval_compiled("10 / a", zero.clone()),
            Err(ExceptionCode::ZeroDivisionError)
        );
        assert_eq!(eval_compiled("int(s)", zero), Err(ExceptionCode::ValueError));
        let big = vec![Scalar::I64(i64::MAX), Scalar::F64(0.0), Scalar::from("x")];
        assert_eq!(eval_compiled("a + 1", big), Err(ExceptionCode::OverflowError));
    }

    #[test]
    fn compiled_stage_agrees_with_interpreter() {
        let mut ir = StageIr::new(schema());
        let out = Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("s", DataType::Utf8, false),
        ]);
        ir.push(
            PhysicalOp::SelectColumns {
                id: OpId::new(1),
                columns: vec!["a".into(), "s".into()],
            },
            out.clone(),
        );
        ir.push(
            PhysicalOp::WithColumn {
                id: OpId::new(2),
                column: "n".into(),
                udf: Udf::parse("len(s) + a").unwrap(),
            },
            out.with_field(Field::new("n", DataType::Int64, false)),
        );
        let handle = ClosureCodegen.compile(&ir).unwrap();
        let interp = Interpreter::new(handle.ir_arc());
        let ctx = KernelContext::new();

        let row = good_row();
        let a = handle.apply(0, &row, &ctx).unwrap();
        assert_eq!(a, interp.apply(0, &row, &ctx).unwrap());
        let OpOutput::Row(selected) = a else {
            panic!("select must produce a row")
        };
        assert_eq!(
            handle.apply(1, &selected, &ctx),
            Ok(OpOutput::Row(vec![
                Scalar::I64(6),
                Scalar::from("hi"),
                Scalar::I64(8)
            ]))
        );
        assert_eq!(handle.id(), ir.code_id().unwrap());
    }

    #[test]
    fn unknown_columns_fail_compilation() {
        let mut ir = StageIr::new(schema());
        ir.push(
            PhysicalOp::Filter {
                id: OpId::new(4),
                udf: Udf::parse("zz > 1").unwrap(),
            },
            schema(),
        );
        match ClosureCodegen.compile(&ir) {
            Err(CompileError::Operator { op, kind, .. }) => {
                assert_eq!(op, OpId::new(4));
                assert_eq!(kind, "filter");
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
