//! Kernel and code-generator traits plus the operator error types.
//!
//! The exec runtime drives a stage by calling [`RowKernel::apply`] once per
//! operator per row. A kernel never panics on bad data: every row-level
//! problem comes back as an [`ExceptionCode`] for the exception router.

use std::collections::HashMap;
use std::sync::Arc;

use rowforge_core::exception::ExceptionCode;
use rowforge_core::id::OpId;
use rowforge_core::types::Row;
use thiserror::Error;

use crate::codegen::CodeHandle;
use crate::ir::StageIr;
use crate::join::JoinTable;

/// Planning-time problems with a single operator.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum OpError {
    #[error("unknown column '{column}'")]
    UnknownColumn { column: String },

    #[error("expected {expected} output column(s), got {got}")]
    Arity { expected: usize, got: usize },

    #[error("duplicate output column '{0}'")]
    DuplicateColumn(String),

    #[error("unsupported: {0}")]
    Unsupported(String),

    #[error("schema error: {0}")]
    Schema(String),
}

impl From<rowforge_core::error::Error> for OpError {
    fn from(e: rowforge_core::error::Error) -> Self {
        match e {
            rowforge_core::error::Error::Schema(msg) => OpError::Schema(msg),
            other => OpError::Unsupported(other.to_string()),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq)]
pub enum CompileError {
    #[error("operator {op} ({kind}): {source}")]
    Operator {
        op: OpId,
        kind: &'static str,
        #[source]
        source: OpError,
    },

    #[error("invalid stage IR: {0}")]
    InvalidIr(String),
}

/// Result of applying one operator to one row.
#[derive(Debug, Clone, PartialEq)]
pub enum OpOutput {
    /// The row continues unchanged.
    Keep,
    /// The row continues as this replacement.
    Row(Row),
    /// One input row became several (join fan-out).
    Rows(Vec<Row>),
    /// The row leaves the pipeline (filter rejected it, inner join missed).
    Drop,
}

/// Runtime inputs shared by every row of a stage: the hash tables of the joins
/// probed by this stage, keyed by join operator id.
#[derive(Debug, Clone, Default)]
pub struct KernelContext {
    tables: HashMap<OpId, Arc<JoinTable>>,
}

impl KernelContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(mut self, join: OpId, table: Arc<JoinTable>) -> Self {
        self.tables.insert(join, table);
        self
    }

    pub fn insert_table(&mut self, join: OpId, table: Arc<JoinTable>) {
        self.tables.insert(join, table);
    }

    pub fn table(&self, join: OpId) -> Option<&JoinTable> {
        self.tables.get(&join).map(|t| t.as_ref())
    }
}

/// Executes a stage's operator chain one operator at a time.
pub trait RowKernel: Send + Sync {
    fn ir(&self) -> &StageIr;

    /// Apply operator `index` of the chain to `row`.
    fn apply(&self, index: usize, row: &Row, ctx: &KernelContext) -> Result<OpOutput, ExceptionCode>;

    fn len(&self) -> usize {
        self.ir().ops.len()
    }

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Turns a stage IR into an executable code unit. Pure; never retried.
pub trait CodeGenerator: Send + Sync {
    fn name(&self) -> &'static str;

    fn compile(&self, ir: &StageIr) -> Result<CodeHandle, CompileError>;
}
