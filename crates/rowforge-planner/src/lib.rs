#![forbid(unsafe_code)]
//! rowforge-planner: from pipelines (fluent builder or YAML) → logical plan
//! → stage graph + coarse work estimate.
//!
//! Design:
//! - The logical tree is `rowforge-core::dag::LogicalPlan`; this crate adds a
//!   fluent [`Pipeline`] builder that hands out operator ids, and a YAML DSL
//!   that drives the same builder.
//! - [`lower_to_stages`] cuts the tree into stages at every point where the
//!   execution mode changes (cache, join build side, aggregate, durable sink)
//!   and fuses everything else, including the root action.
//! - Stages own their operator chain as a `StageIr` and compile it lazily,
//!   exactly once, through whatever `CodeGenerator` the executor supplies.
//! - [`estimate_work`] gives the orchestrator the numbers it needs to pick a
//!   backend.

pub mod cost;
pub mod dsl;
pub mod error;
pub mod logical;
pub mod lower;
pub mod physical;

pub use cost::{estimate_work, WorkEstimate, WorkHint};
pub use dsl::yaml::{parse_yaml_pipeline, ParsedPipeline, PipelineConfig};
pub use error::PlanError;
pub use logical::{PlanContext, Pipeline};
pub use lower::lower_to_stages;
pub use physical::{EndPointMode, SourceSpec, Stage, StageGraph, StageInput};
