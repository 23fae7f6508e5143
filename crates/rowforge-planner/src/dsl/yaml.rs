//! YAML pipelines.
//!
//! Example:
//! ```yaml
//! config:
//!   max_parallel_tasks: 8
//!   backend: local
//! steps:
//!   - op: csv
//!     uris: ["data/orders.csv"]
//!     schema:
//!       - { name: id,    type: int64 }
//!       - { name: price, type: float64, nullable: true }
//!       - { name: qty,   type: int64 }
//!   - op: map
//!     udf: "id, price * qty AS total"
//!   - op: resolve
//!     code: TypeError
//!     udf: "id, 0.0 AS total"
//!   - op: filter
//!     udf: "total > 100"
//!   - op: to_csv
//!     uri: "out/big_orders"
//! ```
//!
//! Steps form a chain; the first step must be a source and the last one an
//! action. A `join` step carries its right side as a nested step list.

use serde::{Deserialize, Serialize};

use rowforge_core::config::{BackendKind, EngineConfig};
use rowforge_core::dag::{Aggregation, JoinSpec, JoinType, LogicalPlan};
use rowforge_core::exception::ExceptionCode;
use rowforge_core::schema::{DataType, Field, Schema};
use rowforge_core::types::Row;

use crate::error::{PlanError, Result};
use crate::logical::{PlanContext, Pipeline};

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Document {
    #[serde(default)]
    config: Option<PipelineConfig>,
    steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    Csv {
        uris: Vec<String>,
        schema: Vec<FieldDef>,
        #[serde(default = "default_true")]
        header: bool,
        #[serde(default = "default_delimiter")]
        delimiter: char,
    },
    Parallelize {
        schema: Vec<FieldDef>,
        #[serde(default)]
        rows: Vec<Row>,
    },
    Map {
        udf: String,
    },
    Filter {
        udf: String,
    },
    MapColumn {
        column: String,
        udf: String,
    },
    WithColumn {
        column: String,
        udf: String,
    },
    Select {
        columns: Vec<String>,
    },
    Rename {
        old: String,
        new: String,
    },
    Resolve {
        code: CodeDef,
        udf: String,
    },
    Ignore {
        code: CodeDef,
    },
    Cache,
    Join {
        right: Vec<Step>,
        left_key: String,
        right_key: String,
        #[serde(default = "default_how")]
        how: String,
        #[serde(default)]
        left_prefix: String,
        #[serde(default)]
        left_suffix: String,
        #[serde(default)]
        right_prefix: String,
        #[serde(default)]
        right_suffix: String,
    },
    Aggregate {
        #[serde(default)]
        group_by: Vec<String>,
        aggs: Vec<String>,
    },
    Unique,
    Collect,
    Take {
        n: usize,
    },
    Count,
    ToCsv {
        uri: String,
        #[serde(default = "default_true")]
        header: bool,
    },
}

fn default_true() -> bool {
    true
}

fn default_delimiter() -> char {
    ','
}

fn default_how() -> String {
    "inner".to_string()
}

impl Step {
    fn name(&self) -> &'static str {
        match self {
            Step::Csv { .. } => "csv",
            Step::Parallelize { .. } => "parallelize",
            Step::Map { .. } => "map",
            Step::Filter { .. } => "filter",
            Step::MapColumn { .. } => "map_column",
            Step::WithColumn { .. } => "with_column",
            Step::Select { .. } => "select",
            Step::Rename { .. } => "rename",
            Step::Resolve { .. } => "resolve",
            Step::Ignore { .. } => "ignore",
            Step::Cache => "cache",
            Step::Join { .. } => "join",
            Step::Aggregate { .. } => "aggregate",
            Step::Unique => "unique",
            Step::Collect => "collect",
            Step::Take { .. } => "take",
            Step::Count => "count",
            Step::ToCsv { .. } => "to_csv",
        }
    }
}

/// Exception code by name (`TypeError`) or number (`1`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum CodeDef {
    Number(i64),
    Name(String),
}

impl CodeDef {
    fn code(&self) -> Result<ExceptionCode> {
        Ok(match self {
            CodeDef::Number(n) => n.to_string().parse()?,
            CodeDef::Name(s) => s.parse()?,
        })
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FieldDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default)]
    pub nullable: bool,
}

fn to_schema(fields: &[FieldDef]) -> Result<Schema> {
    let fields = fields
        .iter()
        .map(|f| Ok(Field::new(f.name.clone(), DataType::parse(&f.data_type)?, f.nullable)))
        .collect::<Result<Vec<_>>>()?;
    Ok(Schema::new(fields))
}

/// Engine settings a pipeline file may override.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct PipelineConfig {
    pub mem_cap_bytes: Option<u64>,
    pub local_work_budget: Option<u64>,
    pub max_parallel_tasks: Option<usize>,
    pub partition_rows: Option<usize>,
    pub partition_bytes: Option<u64>,
    pub backend: Option<BackendKind>,
    pub scratch_uri: Option<String>,
    pub memory_mb: Option<u64>,
    pub invocation_timeout_ms: Option<u64>,
    pub max_retries: Option<u32>,
    pub initial_backoff_ms: Option<u64>,
    pub max_backoff_ms: Option<u64>,
}

impl PipelineConfig {
    pub fn apply_to(&self, cfg: &mut EngineConfig) {
        macro_rules! set {
            ($($field:ident),*) => {
                $(if let Some(v) = &self.$field { cfg.$field = v.clone(); })*
            };
        }
        set!(
            mem_cap_bytes,
            local_work_budget,
            max_parallel_tasks,
            partition_rows,
            partition_bytes,
            backend,
            scratch_uri,
            memory_mb,
            invocation_timeout_ms,
            max_retries,
            initial_backoff_ms,
            max_backoff_ms
        );
    }
}

#[derive(Debug, Clone)]
pub struct ParsedPipeline {
    pub plan: LogicalPlan,
    pub config: PipelineConfig,
}

fn dsl(msg: impl Into<String>) -> PlanError {
    PlanError::Dsl(msg.into())
}

fn source(ctx: &PlanContext, step: Step) -> Result<Pipeline> {
    match step {
        Step::Csv {
            uris,
            schema,
            header,
            delimiter,
        } => {
            if !delimiter.is_ascii() {
                return Err(dsl(format!("delimiter '{delimiter}' must be a single ASCII character")));
            }
            Ok(ctx.csv_with(uris, to_schema(&schema)?, header, delimiter as u8))
        }
        Step::Parallelize { schema, rows } => Ok(ctx.parallelize(to_schema(&schema)?, rows)),
        other => Err(dsl(format!(
            "pipeline must start with csv or parallelize, got {}",
            other.name()
        ))),
    }
}

/// Apply a non-source, non-action step.
fn transform(ctx: &PlanContext, p: Pipeline, step: Step) -> Result<Pipeline> {
    Ok(match step {
        Step::Map { udf } => p.map(&udf)?,
        Step::Filter { udf } => p.filter(&udf)?,
        Step::MapColumn { column, udf } => p.map_column(&column, &udf)?,
        Step::WithColumn { column, udf } => p.with_column(&column, &udf)?,
        Step::Select { columns } => p.select_columns(&columns),
        Step::Rename { old, new } => p.rename_column(&old, &new),
        Step::Resolve { code, udf } => p.resolve(code.code()?, &udf)?,
        Step::Ignore { code } => p.ignore(code.code()?),
        Step::Cache => p.cache(),
        Step::Unique => p.unique(),
        Step::Aggregate { group_by, aggs } => {
            let aggs = aggs
                .iter()
                .map(|a| a.parse::<Aggregation>())
                .collect::<std::result::Result<Vec<_>, _>>()?;
            p.aggregate(&group_by, aggs)
        }
        Step::Join {
            right,
            left_key,
            right_key,
            how,
            left_prefix,
            left_suffix,
            right_prefix,
            right_suffix,
        } => {
            let right = chain(ctx, right)?;
            let spec = JoinSpec {
                left_prefix,
                left_suffix,
                right_prefix,
                right_suffix,
                ..JoinSpec::new(left_key, right_key, how.parse::<JoinType>()?)
            };
            p.join_with(right, spec)
        }
        other => {
            return Err(dsl(format!(
                "step {} is not allowed in the middle of a pipeline",
                other.name()
            )))
        }
    })
}

/// Source followed by transforms, no action.
fn chain(ctx: &PlanContext, steps: Vec<Step>) -> Result<Pipeline> {
    let mut steps = steps.into_iter();
    let first = steps.next().ok_or_else(|| dsl("empty step list"))?;
    let mut p = source(ctx, first)?;
    for step in steps {
        p = transform(ctx, p, step)?;
    }
    Ok(p)
}

pub fn parse_yaml_pipeline(yaml_src: &str) -> Result<ParsedPipeline> {
    let doc: Document = serde_yaml::from_str(yaml_src)?;
    let mut steps = doc.steps;
    let action = steps.pop().ok_or_else(|| dsl("empty pipeline"))?;
    let ctx = PlanContext::new();
    let p = chain(&ctx, steps)?;
    let plan = match action {
        Step::Collect => p.collect(),
        Step::Take { n } => p.take(n),
        Step::Count => p.count(),
        Step::ToCsv { uri, header } => p.to_csv(&uri, header),
        other => {
            return Err(dsl(format!(
                "pipeline must end with collect, take, count or to_csv, got {}",
                other.name()
            )))
        }
    };
    tracing::debug!(root = %plan.id, "parsed yaml pipeline");
    Ok(ParsedPipeline {
        plan,
        config: doc.config.unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lower::lower_to_stages;
    use crate::physical::EndPointMode;
    use rowforge_core::dag::{Action, LogicalOp};

    #[test]
    fn parses_chain_with_config() {
        let src = r#"
config:
  max_parallel_tasks: 8
  backend: local
steps:
  - op: parallelize
    schema:
      - { name: x, type: int64 }
      - { name: s, type: utf8, nullable: true }
    rows:
      - [1, "a"]
      - [2, null]
  - op: map
    udf: "x * 2 AS y, s"
  - op: resolve
    code: TypeError
    udf: "0 AS y, s"
  - op: ignore
    code: 3
  - op: take
    n: 5
"#;
        let parsed = parse_yaml_pipeline(src).unwrap();
        assert_eq!(parsed.plan.action(), Some(&Action::Take(5)));
        let mut cfg = EngineConfig::default();
        parsed.config.apply_to(&mut cfg);
        assert_eq!(cfg.max_parallel_tasks, 8);
        assert_eq!(cfg.backend, BackendKind::Local);

        let g = lower_to_stages(&parsed.plan).unwrap();
        assert_eq!(g.stages[0].ir.chain_label(), "map -> resolve -> ignore");
        assert_eq!(
            g.stages[0].ir.ignores()[0].1,
            ExceptionCode::ZeroDivisionError
        );
    }

    #[test]
    fn join_with_nested_right_side() {
        let src = r#"
steps:
  - op: csv
    uris: [left.csv]
    schema: [{ name: k, type: int }, { name: a, type: str }]
  - op: join
    left_key: k
    right_key: k
    how: left
    right_prefix: "r_"
    right:
      - op: csv
        uris: [right.csv]
        schema: [{ name: k, type: int }, { name: a, type: str }]
      - op: filter
        udf: "k > 0"
  - op: aggregate
    group_by: [a]
    aggs: ["count", "max(r_a)"]
  - op: to_csv
    uri: out
"#;
        let parsed = parse_yaml_pipeline(src).unwrap();
        let LogicalOp::Action { action, .. } = &parsed.plan.op else {
            panic!("root is not an action");
        };
        assert!(matches!(action, Action::WriteCsv { header: true, .. }));
        let g = lower_to_stages(&parsed.plan).unwrap();
        // build side, then probe + aggregate; the write is fused into the root
        assert_eq!(g.stages.len(), 2);
        assert!(matches!(g.stages[0].end, EndPointMode::HashTable { .. }));
        assert!(matches!(g.stages[1].end, EndPointMode::Aggregate(_)));
        assert_eq!(g.stages[1].output_schema.names(), vec!["a", "count", "max_r_a"]);
    }

    #[test]
    fn user_aggregate_step() {
        let src = r#"
steps:
  - op: csv
    uris: [orders.csv]
    schema: [{ name: city, type: str }, { name: qty, type: int }]
  - op: aggregate
    group_by: [city]
    aggs: ["count", "aggregate(weighted; 0; acc + qty * 2; acc + other)"]
  - op: collect
"#;
        let parsed = parse_yaml_pipeline(src).unwrap();
        let g = lower_to_stages(&parsed.plan).unwrap();
        let out = &g.stages[0].output_schema;
        assert_eq!(out.names(), vec!["city", "count", "weighted"]);
        assert_eq!(out.fields[2].data_type, DataType::Int64);

        let bad = src.replace("acc + qty * 2", "acc + nope");
        let parsed = parse_yaml_pipeline(&bad).unwrap();
        assert!(lower_to_stages(&parsed.plan).is_err());
    }

    #[test]
    fn rejects_misplaced_steps() {
        let no_source = "steps:\n  - op: map\n    udf: \"x\"\n  - op: collect\n";
        assert!(matches!(parse_yaml_pipeline(no_source), Err(PlanError::Dsl(_))));

        let no_action = "steps:\n  - op: parallelize\n    schema: []\n  - op: cache\n";
        assert!(matches!(parse_yaml_pipeline(no_action), Err(PlanError::Dsl(_))));

        let bad_code = "steps:\n  - op: parallelize\n    schema: []\n  - op: ignore\n    code: Nope\n  - op: count\n";
        assert!(matches!(parse_yaml_pipeline(bad_code), Err(PlanError::Core(_))));
    }
}
