//! Logical plan tree: what to compute, independent of how it is staged.
//!
//! Each node carries an [`OpId`] that stays stable from the fluent builder down
//! to exception diagnostics. Inputs are boxed children; the root of an
//! executable tree is always an [`LogicalOp::Action`].

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::Error;
use crate::exception::ExceptionCode;
use crate::expr::{Expr, Udf};
use crate::id::OpId;
use crate::schema::Schema;
use crate::types::Row;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JoinType {
    Inner,
    Left,
    Right,
    Full,
}

impl FromStr for JoinType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "inner" => Ok(JoinType::Inner),
            "left" => Ok(JoinType::Left),
            "right" => Ok(JoinType::Right),
            "full" | "outer" => Ok(JoinType::Full),
            other => Err(Error::Config(format!("unknown join type '{other}'"))),
        }
    }
}

/// Key columns plus the renaming applied to the non-key columns of each side.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JoinSpec {
    pub left_key: String,
    pub right_key: String,
    pub join_type: JoinType,
    #[serde(default)]
    pub left_prefix: String,
    #[serde(default)]
    pub left_suffix: String,
    #[serde(default)]
    pub right_prefix: String,
    #[serde(default)]
    pub right_suffix: String,
}

impl JoinSpec {
    pub fn new(left_key: impl Into<String>, right_key: impl Into<String>, join_type: JoinType) -> Self {
        Self {
            left_key: left_key.into(),
            right_key: right_key.into(),
            join_type,
            left_prefix: String::new(),
            left_suffix: String::new(),
            right_prefix: String::new(),
            right_suffix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Aggregation {
    Count,
    Sum(String),
    Avg(String),
    Min(String),
    Max(String),
    /// User fold written in the expression language. `init` is a constant,
    /// `update` sees the row's columns plus the accumulator `acc`, `combine`
    /// merges two partition accumulators `acc` and `other`.
    Udf {
        name: String,
        init: String,
        update: String,
        combine: String,
    },
}

impl Aggregation {
    /// A user fold; every expression is checked to parse.
    pub fn udf(
        name: impl Into<String>,
        init: impl Into<String>,
        update: impl Into<String>,
        combine: impl Into<String>,
    ) -> Result<Aggregation, Error> {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(Error::Config("aggregate needs an output name".into()));
        }
        let (init, update, combine) = (init.into(), update.into(), combine.into());
        for src in [&init, &update, &combine] {
            Expr::parse(src)?;
        }
        Ok(Aggregation::Udf {
            name: name.trim().to_string(),
            init: init.trim().to_string(),
            update: update.trim().to_string(),
            combine: combine.trim().to_string(),
        })
    }

    /// The single input column of a built-in aggregate.
    pub fn column(&self) -> Option<&str> {
        match self {
            Aggregation::Count | Aggregation::Udf { .. } => None,
            Aggregation::Sum(c) | Aggregation::Avg(c) | Aggregation::Min(c) | Aggregation::Max(c) => {
                Some(c)
            }
        }
    }

    pub fn output_name(&self) -> String {
        match self {
            Aggregation::Count => "count".to_string(),
            Aggregation::Sum(c) => format!("sum_{c}"),
            Aggregation::Avg(c) => format!("avg_{c}"),
            Aggregation::Min(c) => format!("min_{c}"),
            Aggregation::Max(c) => format!("max_{c}"),
            Aggregation::Udf { name, .. } => name.clone(),
        }
    }
}

impl fmt::Display for Aggregation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Aggregation::Count => f.write_str("count"),
            Aggregation::Sum(c) => write!(f, "sum({c})"),
            Aggregation::Avg(c) => write!(f, "avg({c})"),
            Aggregation::Min(c) => write!(f, "min({c})"),
            Aggregation::Max(c) => write!(f, "max({c})"),
            Aggregation::Udf {
                name,
                init,
                update,
                combine,
            } => write!(f, "aggregate({name}; {init}; {update}; {combine})"),
        }
    }
}

/// Split on `sep` outside quoted strings.
fn split_unquoted(s: &str, sep: char) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut quote = None;
    let mut escaped = false;
    let mut start = 0;
    for (i, c) in s.char_indices() {
        match quote {
            Some(_) if escaped => escaped = false,
            Some(_) if c == '\\' => escaped = true,
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None if c == sep => {
                parts.push(&s[start..i]);
                start = i + c.len_utf8();
            }
            None => {}
        }
    }
    parts.push(&s[start..]);
    parts
}

/// Parses `count`, `count(*)`, `sum(col)`, `avg(col)`, `min(col)`, `max(col)`
/// and `aggregate(name; init; update; combine)`.
impl FromStr for Aggregation {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let lower = s.to_ascii_lowercase();
        if lower == "count" || lower == "count(*)" {
            return Ok(Aggregation::Count);
        }
        if lower.starts_with("aggregate(") {
            let body = s["aggregate(".len()..]
                .strip_suffix(')')
                .ok_or_else(|| Error::Config(format!("bad aggregation '{s}'")))?;
            return match split_unquoted(body, ';').as_slice() {
                [name, init, update, combine] => Aggregation::udf(*name, *init, *update, *combine),
                _ => Err(Error::Config(format!(
                    "aggregate takes name; init; update; combine, got '{s}'"
                ))),
            };
        }
        let (func, rest) = s
            .split_once('(')
            .ok_or_else(|| Error::Config(format!("bad aggregation '{s}'")))?;
        let col = rest
            .strip_suffix(')')
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| Error::Config(format!("bad aggregation '{s}'")))?
            .to_string();
        match func.trim().to_ascii_lowercase().as_str() {
            "sum" => Ok(Aggregation::Sum(col)),
            "avg" | "mean" => Ok(Aggregation::Avg(col)),
            "min" => Ok(Aggregation::Min(col)),
            "max" => Ok(Aggregation::Max(col)),
            other => Err(Error::Config(format!("unknown aggregation '{other}'"))),
        }
    }
}

/// Terminal actions; only valid at the root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Action {
    Collect,
    Take(usize),
    Count,
    WriteCsv { uri: String, header: bool },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogicalPlan {
    pub id: OpId,
    pub op: LogicalOp,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum LogicalOp {
    Parallelize {
        schema: Schema,
        rows: Vec<Row>,
    },
    CsvScan {
        uris: Vec<String>,
        schema: Schema,
        has_header: bool,
        delimiter: u8,
    },
    Map {
        input: Box<LogicalPlan>,
        udf: Udf,
    },
    Filter {
        input: Box<LogicalPlan>,
        udf: Udf,
    },
    MapColumn {
        input: Box<LogicalPlan>,
        column: String,
        udf: Udf,
    },
    WithColumn {
        input: Box<LogicalPlan>,
        column: String,
        udf: Udf,
    },
    SelectColumns {
        input: Box<LogicalPlan>,
        columns: Vec<String>,
    },
    RenameColumn {
        input: Box<LogicalPlan>,
        old: String,
        new: String,
    },
    Resolve {
        input: Box<LogicalPlan>,
        code: ExceptionCode,
        udf: Udf,
    },
    Ignore {
        input: Box<LogicalPlan>,
        code: ExceptionCode,
    },
    Cache {
        input: Box<LogicalPlan>,
    },
    Join {
        left: Box<LogicalPlan>,
        right: Box<LogicalPlan>,
        spec: JoinSpec,
    },
    Aggregate {
        input: Box<LogicalPlan>,
        group_by: Vec<String>,
        aggs: Vec<Aggregation>,
    },
    Unique {
        input: Box<LogicalPlan>,
    },
    Action {
        input: Box<LogicalPlan>,
        action: Action,
    },
}

impl LogicalPlan {
    pub fn new(id: OpId, op: LogicalOp) -> Self {
        Self { id, op }
    }

    pub fn inputs(&self) -> Vec<&LogicalPlan> {
        use LogicalOp::*;
        match &self.op {
            Parallelize { .. } | CsvScan { .. } => vec![],
            Map { input, .. }
            | Filter { input, .. }
            | MapColumn { input, .. }
            | WithColumn { input, .. }
            | SelectColumns { input, .. }
            | RenameColumn { input, .. }
            | Resolve { input, .. }
            | Ignore { input, .. }
            | Cache { input }
            | Aggregate { input, .. }
            | Unique { input }
            | Action { input, .. } => vec![input],
            Join { left, right, .. } => vec![left, right],
        }
    }

    pub fn kind(&self) -> &'static str {
        use LogicalOp::*;
        match &self.op {
            Parallelize { .. } => "parallelize",
            CsvScan { .. } => "csv",
            Map { .. } => "map",
            Filter { .. } => "filter",
            MapColumn { .. } => "map_column",
            WithColumn { .. } => "with_column",
            SelectColumns { .. } => "select_columns",
            RenameColumn { .. } => "rename_column",
            Resolve { .. } => "resolve",
            Ignore { .. } => "ignore",
            Cache { .. } => "cache",
            Join { .. } => "join",
            Aggregate { .. } => "aggregate",
            Unique { .. } => "unique",
            Action { .. } => "action",
        }
    }

    /// Human label used in diagnostics, e.g. `map(x + 1 AS y)`.
    pub fn describe(&self) -> String {
        use LogicalOp::*;
        match &self.op {
            Parallelize { rows, .. } => format!("parallelize({} rows)", rows.len()),
            CsvScan { uris, .. } => format!("csv({})", uris.join(", ")),
            Map { udf, .. } | Filter { udf, .. } => format!("{}({})", self.kind(), udf),
            MapColumn { column, udf, .. } | WithColumn { column, udf, .. } => {
                format!("{}({}, {})", self.kind(), column, udf)
            }
            SelectColumns { columns, .. } => format!("select_columns({})", columns.join(", ")),
            RenameColumn { old, new, .. } => format!("rename_column({old} -> {new})"),
            Resolve { code, udf, .. } => format!("resolve({code}, {udf})"),
            Ignore { code, .. } => format!("ignore({code})"),
            Cache { .. } => "cache".to_string(),
            Join { spec, .. } => format!(
                "join({:?}, {} = {})",
                spec.join_type, spec.left_key, spec.right_key
            ),
            Aggregate { group_by, aggs, .. } => {
                let aggs: Vec<String> = aggs.iter().map(|a| a.to_string()).collect();
                format!("aggregate(by [{}]: {})", group_by.join(", "), aggs.join(", "))
            }
            Unique { .. } => "unique".to_string(),
            Action { action, .. } => format!("{action:?}").to_ascii_lowercase(),
        }
    }

    /// Pre-order traversal.
    pub fn walk<'a>(&'a self, f: &mut dyn FnMut(&'a LogicalPlan)) {
        f(self);
        for child in self.inputs() {
            child.walk(f);
        }
    }

    pub fn find(&self, id: OpId) -> Option<&LogicalPlan> {
        let mut found = None;
        self.walk(&mut |n| {
            if n.id == id && found.is_none() {
                found = Some(n);
            }
        });
        found
    }

    pub fn action(&self) -> Option<&Action> {
        match &self.op {
            LogicalOp::Action { action, .. } => Some(action),
            _ => None,
        }
    }
}
