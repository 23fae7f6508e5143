//! Exception routing: where a row that raised goes next.
//!
//! The nearest matching handler in pipeline order wins. Resolvers only match
//! inside the run of recovery operators that directly follows the failing
//! operator; ignores match anywhere later in this stage, then along the
//! consuming stages, nearest first.

use rowforge_core::exception::ExceptionCode;
use rowforge_core::id::OpId;
use rowforge_operators::{PhysicalOp, StageIr};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    /// Replay through the resolver at this chain position.
    Resolve(usize),
    /// Drop the row; the ignore rule that matched.
    Ignore(OpId),
    Unhandled,
}

/// Handler for `code` raised on behalf of operator `attached`, searching the
/// chain after position `after`. `after == ir.ops.len()` means the row failed
/// past the last operator (e.g. in the aggregate sink).
pub fn find_handler(
    ir: &StageIr,
    after: usize,
    attached: OpId,
    code: ExceptionCode,
    downstream_ignores: &[(OpId, ExceptionCode)],
) -> Route {
    let rest = ir.ops.get(after + 1..).unwrap_or_default();
    let mut attached_run = true;

    for op in rest {
        attached_run &= op.is_recovery();
        match op {
            PhysicalOp::Resolve {
                id,
                parent,
                code: c,
                ..
            } if attached_run && *parent == attached && *c == code => {
                if let Some(pos) = ir.position(*id) {
                    return Route::Resolve(pos);
                }
            }
            PhysicalOp::Ignore { id, code: c } if *c == code => return Route::Ignore(*id),
            _ => {}
        }
    }

    downstream_ignores
        .iter()
        .find(|(_, c)| *c == code)
        .map_or(Route::Unhandled, |(id, _)| Route::Ignore(*id))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::expr::Udf;
    use rowforge_core::schema::{DataType, Field, Schema};
    use ExceptionCode::*;

    fn ir() -> StageIr {
        let s = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
        let udf = |src: &str| Udf::parse(src).unwrap();
        let mut ir = StageIr::new(s.clone());
        let ops = vec![
            PhysicalOp::Map { id: OpId::new(1), udf: udf("x // 1 AS x") },
            PhysicalOp::Ignore { id: OpId::new(2), code: ValueError },
            PhysicalOp::Resolve { id: OpId::new(3), parent: OpId::new(1), code: ZeroDivisionError, udf: udf("0 AS x") },
            PhysicalOp::Resolve { id: OpId::new(4), parent: OpId::new(1), code: TypeError, udf: udf("1 AS x") },
            PhysicalOp::Filter { id: OpId::new(5), udf: udf("x > 0") },
            PhysicalOp::Ignore { id: OpId::new(6), code: TypeError },
        ];
        for op in ops {
            ir.push(op, s.clone());
        }
        ir
    }

    #[test]
    fn resolver_attached_to_failing_op() {
        let ir = ir();
        let r = find_handler(&ir, 0, OpId::new(1), ZeroDivisionError, &[]);
        assert_eq!(r, Route::Resolve(2));
        assert_eq!(find_handler(&ir, 0, OpId::new(1), TypeError, &[]), Route::Resolve(3));
    }

    #[test]
    fn resolver_failure_searches_past_itself() {
        let ir = ir();
        // handler at 3 raised TypeError: no later resolver, so the ignore at 5
        assert_eq!(
            find_handler(&ir, 3, OpId::new(1), TypeError, &[]),
            Route::Ignore(OpId::new(6))
        );
    }

    #[test]
    fn nearest_handler_in_pipeline_order_wins() {
        let s = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
        let udf = |src: &str| Udf::parse(src).unwrap();
        let mut ir = StageIr::new(s.clone());
        let ops = vec![
            PhysicalOp::Map { id: OpId::new(1), udf: udf("10 // x AS x") },
            PhysicalOp::Ignore { id: OpId::new(2), code: ZeroDivisionError },
            PhysicalOp::Resolve { id: OpId::new(3), parent: OpId::new(1), code: ZeroDivisionError, udf: udf("-1 AS x") },
            PhysicalOp::Resolve { id: OpId::new(4), parent: OpId::new(1), code: TypeError, udf: udf("0 AS x") },
            PhysicalOp::Ignore { id: OpId::new(5), code: TypeError },
        ];
        for op in ops {
            ir.push(op, s.clone());
        }
        assert_eq!(
            find_handler(&ir, 0, OpId::new(1), ZeroDivisionError, &[]),
            Route::Ignore(OpId::new(2))
        );
        assert_eq!(find_handler(&ir, 0, OpId::new(1), TypeError, &[]), Route::Resolve(3));
    }

    #[test]
    fn ignores_in_stage_then_downstream() {
        let ir = ir();
        assert_eq!(
            find_handler(&ir, 0, OpId::new(1), ValueError, &[]),
            Route::Ignore(OpId::new(2))
        );
        // the filter has no resolvers; its KeyError only matches downstream
        let downstream = [(OpId::new(9), KeyError)];
        assert_eq!(
            find_handler(&ir, 4, OpId::new(5), KeyError, &downstream),
            Route::Ignore(OpId::new(9))
        );
        assert_eq!(find_handler(&ir, 4, OpId::new(5), OverflowError, &downstream), Route::Unhandled);
        assert_eq!(find_handler(&ir, 6, OpId::new(5), KeyError, &downstream), Route::Ignore(OpId::new(9)));
    }
}
