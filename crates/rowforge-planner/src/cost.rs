//! Coarse work estimation used for backend selection.
//!
//! Walks the stage graph in arena order. Row counts come from in-memory
//! sources directly and from byte-size hints for file sources; everything
//! downstream is guessed with fixed selectivity heuristics.

use rowforge_core::dag::JoinType;
use rowforge_core::expr::{BinaryOp, Expr, Function, UnaryOp};
use rowforge_core::schema::{DataType, Schema};
use rowforge_operators::ir::PhysicalOp;
use serde::{Deserialize, Serialize};

use crate::physical::{EndPointMode, SourceSpec, StageGraph, StageInput};

/// Known input sizes, by source URI.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkHint {
    pub source_bytes: Vec<(String, u64)>,
}

impl WorkHint {
    fn bytes_of(&self, uri: &str) -> Option<u64> {
        self.source_bytes
            .iter()
            .find(|(u, _)| u == uri)
            .map(|(_, b)| *b)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkEstimate {
    /// Rows read at sources.
    pub total_rows: u64,
    /// Bytes read at sources.
    pub total_bytes: u64,
    /// Sum over operators of the rows each one sees.
    pub row_ops: u64,
    pub max_fan_in: u32,
    pub stages: usize,
}

fn selectivity(expr: &Expr) -> f64 {
    match expr {
        Expr::Binary { op, left, right } => match op {
            BinaryOp::Eq => 0.1,
            BinaryOp::NotEq => 0.9,
            BinaryOp::Lt | BinaryOp::LtEq | BinaryOp::Gt | BinaryOp::GtEq => 0.33,
            BinaryOp::And => selectivity(left) * selectivity(right),
            BinaryOp::Or => {
                let (a, b) = (selectivity(left), selectivity(right));
                a + b - a * b
            }
            _ => 0.5,
        },
        Expr::Unary {
            op: UnaryOp::Not,
            expr,
        } => 1.0 - selectivity(expr),
        Expr::Call {
            func: Function::IsNull,
            ..
        } => 0.05,
        Expr::Literal(v) if v.truthy() => 1.0,
        Expr::Literal(_) => 0.0,
        _ => 0.5,
    }
}

fn probe_cardinality(left_rows: u64, right_rows: u64, join_type: JoinType) -> u64 {
    match join_type {
        JoinType::Inner => {
            let geo = (left_rows as f64 * right_rows as f64).sqrt() as u64;
            geo.max(1).min(left_rows.min(right_rows))
        }
        JoinType::Left => (left_rows as f64 * 1.2) as u64,
        JoinType::Right => (right_rows as f64 * 1.2) as u64,
        JoinType::Full => (left_rows.max(right_rows) as f64 * 1.5) as u64,
    }
}

fn aggregate_groups(input_rows: u64, keys: usize) -> u64 {
    if keys == 0 {
        return 1;
    }
    let factor = match keys {
        1 => 0.1,
        2 => 0.25,
        3 => 0.4,
        _ => 0.5,
    };
    ((input_rows as f64 * factor) as u64).max(1).min(input_rows)
}

/// Rough width of one row, for turning byte sizes into row counts.
pub fn schema_size_bytes(schema: &Schema) -> u64 {
    let total: u64 = schema
        .fields
        .iter()
        .map(|f| match f.data_type {
            DataType::Boolean => 1,
            DataType::Int64 | DataType::Float64 => 8,
            DataType::Utf8 => 32,
            DataType::Any => 16,
        })
        .sum();
    total.max(1)
}

pub fn estimate_work(graph: &StageGraph, hints: Option<&WorkHint>) -> WorkEstimate {
    let mut est = WorkEstimate {
        max_fan_in: 1,
        stages: graph.stages.len(),
        ..WorkEstimate::default()
    };
    let mut rows_out = Vec::with_capacity(graph.stages.len());

    for stage in &graph.stages {
        let width = schema_size_bytes(stage.ir.input_schema());
        let mut rows = match &stage.input {
            StageInput::Source(SourceSpec::Rows { rows, .. }) => {
                let n = rows.len() as u64;
                est.total_rows += n;
                est.total_bytes += n * width;
                n
            }
            StageInput::Source(SourceSpec::Csv { uris, .. }) => {
                let bytes: u64 = uris
                    .iter()
                    .filter_map(|u| hints.and_then(|h| h.bytes_of(u)))
                    .sum();
                let n = bytes / width;
                est.total_rows += n;
                est.total_bytes += bytes;
                n
            }
            StageInput::Stage(p) => rows_out[*p],
        };
        est.max_fan_in = est.max_fan_in.max(1 + stage.builds.len() as u32);

        for op in &stage.ir.ops {
            est.row_ops += rows;
            rows = match op {
                PhysicalOp::Filter { udf, .. } => match udf.single() {
                    Some(e) => ((rows as f64 * selectivity(e)) as u64).max(1).min(rows),
                    None => rows,
                },
                PhysicalOp::JoinProbe { id, join_type, .. } => {
                    let right = stage
                        .builds
                        .iter()
                        .find(|(j, _)| j == id)
                        .map(|(_, b)| rows_out[*b])
                        .unwrap_or(0);
                    probe_cardinality(rows, right, *join_type)
                }
                _ => rows,
            };
        }
        if let EndPointMode::Aggregate(spec) = &stage.end {
            est.row_ops += rows;
            rows = aggregate_groups(rows, spec.group_by.len());
        }
        rows_out.push(rows);
    }
    est
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::logical::PlanContext;
    use crate::lower::lower_to_stages;
    use rowforge_core::dag::Aggregation;
    use rowforge_core::schema::Field;
    use rowforge_core::types::Scalar;

    fn schema() -> Schema {
        Schema::new(vec![
            Field::new("a", DataType::Int64, false),
            Field::new("s", DataType::Utf8, false),
        ])
    }

    #[test]
    fn selectivity_heuristics() {
        let e = |s: &str| Expr::parse(s).unwrap();
        assert_eq!(selectivity(&e("a == 1")), 0.1);
        assert!((selectivity(&e("a > 1 and a < 5")) - 0.33 * 0.33).abs() < 1e-9);
        assert!((selectivity(&e("not is_null(a)")) - 0.95).abs() < 1e-9);
    }

    #[test]
    fn counts_row_ops_through_stages() {
        let ctx = PlanContext::new();
        let rows: Vec<_> = (0..100)
            .map(|i| vec![Scalar::I64(i), Scalar::from("x")])
            .collect();
        let plan = ctx
            .parallelize(schema(), rows)
            .map("a * 2 AS a, s")
            .unwrap()
            .filter("a == 4")
            .unwrap()
            .aggregate(&["s"], vec![Aggregation::Count])
            .collect();
        let g = lower_to_stages(&plan).unwrap();
        let est = estimate_work(&g, None);
        assert_eq!(est.total_rows, 100);
        assert_eq!(est.total_bytes, 100 * 40);
        // map sees 100, filter 100, aggregate 10
        assert_eq!(est.row_ops, 210);
        assert_eq!(est.stages, 1);
    }

    #[test]
    fn csv_sources_use_hints() {
        let ctx = PlanContext::new();
        let plan = ctx.csv(["data/a.csv"], schema()).collect();
        let g = lower_to_stages(&plan).unwrap();
        let hint = WorkHint {
            source_bytes: vec![("data/a.csv".into(), 4_000)],
        };
        let est = estimate_work(&g, Some(&hint));
        assert_eq!(est.total_bytes, 4_000);
        assert_eq!(est.total_rows, 100);
        assert_eq!(estimate_work(&g, None).total_bytes, 0);
    }
}
