//! Convenient re-exports for downstream crates.

pub use crate::config::{BackendKind, EngineConfig};
pub use crate::dag::{Action, Aggregation, JoinSpec, JoinType, LogicalOp, LogicalPlan};
pub use crate::error::{Error, Result};
pub use crate::exception::{ExceptionCode, ExceptionRecord, ExceptionTally, RowOrdinal};
pub use crate::expr::{Expr, Udf};
pub use crate::hash::Hash256;
pub use crate::id::{OpId, PartitionId, StageId};
pub use crate::manifest::{ManifestId, RunManifest};
pub use crate::schema::{DataType, Field, Schema};
pub use crate::types::{Row, Scalar};
