//! rowforge: row pipelines with per-row exception handling.
//!
//! Build a pipeline with [`PlanContext`] (or load one from YAML), wrap it in
//! a [`Plan`] and execute it locally or on a serverless invocation service.
//! Rows that raise go to `resolve` handlers, `ignore` rules, or the
//! unresolved list in [`Diagnostics`].
//!
//! ```no_run
//! use rowforge::prelude::*;
//!
//! # fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//! let schema = Schema::new(vec![Field::new("x", DataType::Int64, false)]);
//! let ctx = PlanContext::new();
//! let rows = (0..10).map(|i| vec![Scalar::I64(i)]).collect();
//! let job = ctx
//!     .parallelize(schema, rows)
//!     .map("100 // x AS y")?
//!     .resolve(ExceptionCode::ZeroDivisionError, "-1 AS y")?
//!     .collect();
//! let mut plan = Plan::from_logical(&job, EngineConfig::default());
//! let rs = plan.execute()?;
//! assert_eq!(rs.len(), 10);
//! # Ok(())
//! # }
//! ```

#![forbid(unsafe_code)]

pub use rowforge_core as core;
pub use rowforge_exec as exec;
pub use rowforge_io as io;
pub use rowforge_operators as operators;
pub use rowforge_planner as planner;

pub use rowforge_exec::{CancelHandle, Diagnostics, ExecError, Plan, ResultSet};
pub use rowforge_planner::{parse_yaml_pipeline, PlanContext, PlanError, Pipeline};

pub mod prelude {
    pub use rowforge_core::prelude::*;
    pub use rowforge_exec::{CancelHandle, Diagnostics, ExecError, Plan, ResultSet};
    pub use rowforge_io::StorageRegistry;
    pub use rowforge_planner::{parse_yaml_pipeline, PlanContext, Pipeline};
}
