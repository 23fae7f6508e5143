//! Fluent construction of logical plans.
//!
//! ```ignore
//! let ctx = PlanContext::new();
//! let plan = ctx
//!     .parallelize(schema, rows)
//!     .map("price * qty AS total, name")?
//!     .resolve(ExceptionCode::TypeError, "0 AS total, name")?
//!     .filter("total > 10")?
//!     .collect();
//! ```
//!
//! Every node gets an [`OpId`] from the shared [`PlanContext`], so pipelines
//! that are joined together must come from the same context.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rowforge_core::dag::{Action, Aggregation, JoinSpec, JoinType, LogicalOp, LogicalPlan};
use rowforge_core::exception::ExceptionCode;
use rowforge_core::expr::Udf;
use rowforge_core::id::OpId;
use rowforge_core::schema::Schema;
use rowforge_core::types::Row;

use crate::error::Result;

/// Hands out operator ids for one family of pipelines.
#[derive(Debug, Clone, Default)]
pub struct PlanContext {
    next: Arc<AtomicU64>,
}

impl PlanContext {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&self) -> OpId {
        OpId::new(self.next.fetch_add(1, Ordering::Relaxed))
    }

    fn start(&self, op: LogicalOp) -> Pipeline {
        Pipeline {
            node: LogicalPlan::new(self.next_id(), op),
            ctx: self.clone(),
        }
    }

    /// In-memory rows as a source.
    pub fn parallelize(&self, schema: Schema, rows: Vec<Row>) -> Pipeline {
        self.start(LogicalOp::Parallelize { schema, rows })
    }

    /// Comma separated files with a header line.
    pub fn csv<S: Into<String>>(&self, uris: impl IntoIterator<Item = S>, schema: Schema) -> Pipeline {
        self.csv_with(uris, schema, true, b',')
    }

    pub fn csv_with<S: Into<String>>(
        &self,
        uris: impl IntoIterator<Item = S>,
        schema: Schema,
        has_header: bool,
        delimiter: u8,
    ) -> Pipeline {
        self.start(LogicalOp::CsvScan {
            uris: uris.into_iter().map(Into::into).collect(),
            schema,
            has_header,
            delimiter,
        })
    }
}

#[derive(Debug, Clone)]
pub struct Pipeline {
    ctx: PlanContext,
    node: LogicalPlan,
}

impl Pipeline {
    fn wrap(self, op: impl FnOnce(Box<LogicalPlan>) -> LogicalOp) -> Pipeline {
        let id = self.ctx.next_id();
        Pipeline {
            node: LogicalPlan::new(id, op(Box::new(self.node))),
            ctx: self.ctx,
        }
    }

    pub fn plan(&self) -> &LogicalPlan {
        &self.node
    }

    pub fn id(&self) -> OpId {
        self.node.id
    }

    pub fn map(self, udf: &str) -> Result<Pipeline> {
        let udf = Udf::parse(udf)?;
        Ok(self.wrap(|input| LogicalOp::Map { input, udf }))
    }

    pub fn filter(self, udf: &str) -> Result<Pipeline> {
        let udf = Udf::parse(udf)?;
        Ok(self.wrap(|input| LogicalOp::Filter { input, udf }))
    }

    /// Replace an existing column with the value of `udf`.
    pub fn map_column(self, column: &str, udf: &str) -> Result<Pipeline> {
        let udf = Udf::parse(udf)?;
        let column = column.to_string();
        Ok(self.wrap(|input| LogicalOp::MapColumn { input, column, udf }))
    }

    /// Add a column, or replace it when it already exists.
    pub fn with_column(self, column: &str, udf: &str) -> Result<Pipeline> {
        let udf = Udf::parse(udf)?;
        let column = column.to_string();
        Ok(self.wrap(|input| LogicalOp::WithColumn { input, column, udf }))
    }

    pub fn select_columns<S: AsRef<str>>(self, columns: &[S]) -> Pipeline {
        let columns = columns.iter().map(|c| c.as_ref().to_string()).collect();
        self.wrap(|input| LogicalOp::SelectColumns { input, columns })
    }

    pub fn rename_column(self, old: &str, new: &str) -> Pipeline {
        let (old, new) = (old.to_string(), new.to_string());
        self.wrap(|input| LogicalOp::RenameColumn { input, old, new })
    }

    /// Handle `code` raised by the preceding operator with `udf`.
    pub fn resolve(self, code: ExceptionCode, udf: &str) -> Result<Pipeline> {
        let udf = Udf::parse(udf)?;
        Ok(self.wrap(|input| LogicalOp::Resolve { input, code, udf }))
    }

    /// Drop rows that raise `code` anywhere upstream of this point.
    pub fn ignore(self, code: ExceptionCode) -> Pipeline {
        self.wrap(|input| LogicalOp::Ignore { input, code })
    }

    pub fn cache(self) -> Pipeline {
        self.wrap(|input| LogicalOp::Cache { input })
    }

    pub fn join(self, right: Pipeline, left_key: &str, right_key: &str) -> Pipeline {
        self.join_with(right, JoinSpec::new(left_key, right_key, JoinType::Inner))
    }

    pub fn left_join(self, right: Pipeline, left_key: &str, right_key: &str) -> Pipeline {
        self.join_with(right, JoinSpec::new(left_key, right_key, JoinType::Left))
    }

    pub fn join_with(self, right: Pipeline, spec: JoinSpec) -> Pipeline {
        let right = Box::new(right.node);
        self.wrap(|left| LogicalOp::Join { left, right, spec })
    }

    pub fn aggregate<S: AsRef<str>>(self, group_by: &[S], aggs: Vec<Aggregation>) -> Pipeline {
        let group_by = group_by.iter().map(|c| c.as_ref().to_string()).collect();
        self.wrap(|input| LogicalOp::Aggregate {
            input,
            group_by,
            aggs,
        })
    }

    pub fn unique(self) -> Pipeline {
        self.wrap(|input| LogicalOp::Unique { input })
    }

    fn action(self, action: Action) -> LogicalPlan {
        self.wrap(|input| LogicalOp::Action { input, action }).node
    }

    pub fn collect(self) -> LogicalPlan {
        self.action(Action::Collect)
    }

    pub fn take(self, n: usize) -> LogicalPlan {
        self.action(Action::Take(n))
    }

    pub fn count(self) -> LogicalPlan {
        self.action(Action::Count)
    }

    pub fn to_csv(self, uri: &str, header: bool) -> LogicalPlan {
        self.action(Action::WriteCsv {
            uri: uri.to_string(),
            header,
        })
    }
}
