//! Static type inference over expressions and operator output schemas.
//!
//! Inference never rejects a well-formed expression for type reasons: when a
//! type cannot be decided (or an operation is certain to raise at runtime) the
//! result is `Any`, and compiled code evaluates it dynamically. Only unknown
//! columns and shape problems are planning errors.

use rowforge_core::expr::{BinaryOp, Expr, Function, UnaryOp, Udf};
use rowforge_core::schema::{DataType, Field, Schema};
use rowforge_core::types::Scalar;

use crate::traits::OpError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TypeInfo {
    pub data_type: DataType,
    pub nullable: bool,
}

impl TypeInfo {
    fn new(data_type: DataType, nullable: bool) -> Self {
        Self {
            data_type,
            nullable,
        }
    }
}

fn int_like(t: DataType) -> bool {
    matches!(t, DataType::Boolean | DataType::Int64)
}

pub fn infer_expr(expr: &Expr, schema: &Schema) -> Result<TypeInfo, OpError> {
    Ok(match expr {
        Expr::Literal(v) => match v {
            Scalar::Null => TypeInfo::new(DataType::Any, true),
            other => TypeInfo::new(other.data_type(), false),
        },
        Expr::Column(name) => {
            let f = schema
                .field_by_name(name)
                .ok_or_else(|| OpError::UnknownColumn {
                    column: name.clone(),
                })?;
            TypeInfo::new(f.data_type, f.nullable)
        }
        Expr::Unary { op, expr } => {
            let t = infer_expr(expr, schema)?;
            match op {
                UnaryOp::Not => TypeInfo::new(DataType::Boolean, false),
                UnaryOp::Neg => {
                    let dt = match t.data_type {
                        DataType::Boolean | DataType::Int64 => DataType::Int64,
                        DataType::Float64 => DataType::Float64,
                        _ => DataType::Any,
                    };
                    TypeInfo::new(dt, t.nullable)
                }
            }
        }
        Expr::Binary { op, left, right } => {
            let l = infer_expr(left, schema)?;
            let r = infer_expr(right, schema)?;
            TypeInfo::new(binary_type(*op, l.data_type, r.data_type), l.nullable || r.nullable)
        }
        Expr::Call { func, args } => {
            let ts = args
                .iter()
                .map(|a| infer_expr(a, schema))
                .collect::<Result<Vec<_>, _>>()?;
            call_type(*func, &ts)
        }
    })
}

pub fn binary_type(op: BinaryOp, l: DataType, r: DataType) -> DataType {
    use DataType::*;
    match op {
        BinaryOp::Eq
        | BinaryOp::NotEq
        | BinaryOp::Lt
        | BinaryOp::LtEq
        | BinaryOp::Gt
        | BinaryOp::GtEq => Boolean,
        BinaryOp::And | BinaryOp::Or => {
            if l == r {
                l
            } else {
                Any
            }
        }
        BinaryOp::Add if l == Utf8 && r == Utf8 => Utf8,
        BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul | BinaryOp::FloorDiv | BinaryOp::Mod => {
            if int_like(l) && int_like(r) {
                Int64
            } else if l.is_numeric() && r.is_numeric() {
                Float64
            } else {
                Any
            }
        }
        BinaryOp::Div => {
            if l.is_numeric() && r.is_numeric() {
                Float64
            } else {
                Any
            }
        }
    }
}

fn call_type(func: Function, args: &[TypeInfo]) -> TypeInfo {
    use DataType::*;
    let any_nullable = args.iter().any(|a| a.nullable);
    let first = args.first().map(|a| a.data_type).unwrap_or(Any);
    match func {
        Function::Int | Function::Round | Function::Len => TypeInfo::new(Int64, any_nullable),
        Function::Float
        | Function::Sqrt
        | Function::Log
        | Function::Exp
        | Function::Sin
        | Function::Cos => TypeInfo::new(Float64, any_nullable),
        Function::Upper | Function::Lower | Function::Strip => TypeInfo::new(Utf8, any_nullable),
        Function::Str => TypeInfo::new(Utf8, false),
        Function::Bool | Function::IsNull => TypeInfo::new(Boolean, false),
        Function::Abs => {
            let dt = match first {
                Boolean | Int64 => Int64,
                Float64 => Float64,
                _ => Any,
            };
            TypeInfo::new(dt, any_nullable)
        }
        Function::Coalesce => {
            // Null literals carry no type information.
            let dt = args
                .iter()
                .filter(|a| !(a.nullable && a.data_type == Any))
                .map(|a| a.data_type)
                .reduce(DataType::unify)
                .unwrap_or(Any);
            TypeInfo::new(dt, args.iter().all(|a| a.nullable))
        }
    }
}

/// Output schema of `map(udf)`.
pub fn map_schema(udf: &Udf, input: &Schema) -> Result<Schema, OpError> {
    let mut fields = Vec::with_capacity(udf.len());
    for (name, p) in udf.output_names().into_iter().zip(udf.projections()) {
        if fields.iter().any(|f: &Field| f.name == name) {
            return Err(OpError::DuplicateColumn(name));
        }
        let t = infer_expr(&p.expr, input)?;
        fields.push(Field::new(name, t.data_type, t.nullable));
    }
    Ok(Schema::new(fields))
}

/// The single expression of a filter/column UDF, or an arity error.
pub fn single_expr(udf: &Udf) -> Result<&Expr, OpError> {
    udf.single().ok_or(OpError::Arity {
        expected: 1,
        got: udf.len(),
    })
}

/// Output schema of `map_column(column, udf)` (column must exist) or
/// `with_column(column, udf)` (replaced when it exists, appended otherwise).
pub fn column_schema(
    column: &str,
    udf: &Udf,
    input: &Schema,
    must_exist: bool,
) -> Result<Schema, OpError> {
    if must_exist && input.index_of(column).is_none() {
        return Err(OpError::UnknownColumn {
            column: column.to_string(),
        });
    }
    let t = infer_expr(single_expr(udf)?, input)?;
    Ok(input.with_field(Field::new(column, t.data_type, t.nullable)))
}

pub fn filter_schema(udf: &Udf, input: &Schema) -> Result<Schema, OpError> {
    infer_expr(single_expr(udf)?, input)?;
    Ok(input.clone())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("b", DataType::Float64, true),
            Field::new("s", DataType::Utf8, false),
        ])
    }

    fn ty(src: &str) -> TypeInfo {
        infer_expr(&Expr::parse(src).unwrap(), &schema()).unwrap()
    }

    #[test]
    fn arithmetic_promotion() {
        assert_eq!(ty("a + 1").data_type, DataType::Int64);
        assert_eq!(ty("a + b").data_type, DataType::Float64);
        assert!(ty("a + b").nullable);
        assert_eq!(ty("a / 2").data_type, DataType::Float64);
        assert_eq!(ty("s + s").data_type, DataType::Utf8);
        assert_eq!(ty("s + a").data_type, DataType::Any);
        assert_eq!(ty("a > 1 and s == 'x'").data_type, DataType::Boolean);
    }

    #[test]
    fn function_types() {
        assert_eq!(ty("int(s)").data_type, DataType::Int64);
        assert_eq!(ty("str(b)"), TypeInfo::new(DataType::Utf8, false));
        assert_eq!(ty("coalesce(b, 0.0)"), TypeInfo::new(DataType::Float64, false));
        assert_eq!(ty("coalesce(null, a)").data_type, DataType::Int64);
        assert_eq!(ty("is_null(b)"), TypeInfo::new(DataType::Boolean, false));
    }

    #[test]
    fn unknown_columns_fail() {
        let e = infer_expr(&Expr::parse("zz + 1").unwrap(), &schema()).unwrap_err();
        assert_eq!(
            e,
            OpError::UnknownColumn {
                column: "zz".into()
            }
        );
    }

    #[test]
    fn operator_schemas() {
        let s = map_schema(&Udf::parse("a * 2 AS twice, s").unwrap(), &schema()).unwrap();
        assert_eq!(s.names(), vec!["twice", "s"]);
        assert!(map_schema(&Udf::parse("a AS x, b AS x").unwrap(), &schema()).is_err());

        let s = column_schema("c", &Udf::parse("a + b").unwrap(), &schema(), false).unwrap();
        assert_eq!(s.names(), vec!["a", "b", "s", "c"]);
        assert!(column_schema("c", &Udf::parse("a").unwrap(), &schema(), true).is_err());
        assert!(filter_schema(&Udf::parse("a, b").unwrap(), &schema()).is_err());
    }
}
