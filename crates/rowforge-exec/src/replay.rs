//! Stable plan hashing for run manifests.
//!
//! Two runs of the same pipeline over the same inputs hash to the same value,
//! whatever backend or partitioning they used.

use rowforge_core::hash::{hash_serde, hash_str, Hash256};
use rowforge_planner::physical::{SourceSpec, StageGraph, StageInput};

use crate::error::Result;

/// Hash of every stage's operator chain, end mode and input description.
pub fn hash_graph(graph: &StageGraph) -> Result<Hash256> {
    let mut acc = hash_str(&format!("{:?}", graph.action));
    for stage in &graph.stages {
        acc = acc.chain(&hash_serde(stage.ir.as_ref())?);
        acc = acc.chain(&hash_serde(&stage.end)?);
        let input = match &stage.input {
            StageInput::Stage(p) => format!("stage:{p}"),
            StageInput::Source(SourceSpec::Rows { rows, .. }) => {
                format!("rows:{}", hash_serde(rows.as_ref())?)
            }
            StageInput::Source(SourceSpec::Csv { uris, .. }) => format!("csv:{}", uris.join(",")),
        };
        acc = acc.chain(&hash_str(&input));
        for (join, b) in &stage.builds {
            acc = acc.chain(&hash_str(&format!("probe:{join}:{b}")));
        }
    }
    Ok(acc)
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::schema::{DataType, Field, Schema};
    use rowforge_core::types::Scalar;
    use rowforge_planner::logical::PlanContext;
    use rowforge_planner::lower::lower_to_stages;

    fn graph(filter: &str) -> StageGraph {
        let ctx = PlanContext::new();
        let schema = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
        let rows = (0..4).map(|i| vec![Scalar::I64(i)]).collect();
        let plan = ctx.parallelize(schema, rows).filter(filter).unwrap().collect();
        lower_to_stages(&plan).unwrap()
    }

    #[test]
    fn same_pipeline_same_hash() {
        assert_eq!(hash_graph(&graph("x > 1")).unwrap(), hash_graph(&graph("x > 1")).unwrap());
        assert_ne!(hash_graph(&graph("x > 1")).unwrap(), hash_graph(&graph("x > 2")).unwrap());
    }
}
