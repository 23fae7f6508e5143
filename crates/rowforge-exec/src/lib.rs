#![forbid(unsafe_code)]
//! rowforge-exec: runs stage graphs.
//!
//! Design:
//! - [`plan::Plan`] owns one lowered pipeline; it picks a backend per run,
//!   executes, and keeps the result set, diagnostics and run manifest.
//! - [`runner::StageRunner`] drives one partition through one stage: compiled
//!   fast path first, then the interpreter for rows that raised, routed by
//!   [`router`] to resolvers and ignore rules.
//! - The local backend runs partitions on a `crossbeam-channel` worker pool
//!   ([`scheduler`]); the serverless backend ships file-to-file descriptors
//!   to an [`backend::serverless::InvocationService`], retrying transient
//!   failures.
//! - Exception tallies are per partition and merged when a partition finishes.

pub mod backend;
pub mod diagnostics;
pub mod emulator;
pub mod error;
pub mod failpoints;
pub mod metrics;
pub mod partition;
pub mod plan;
pub mod replay;
pub mod result;
pub mod retry;
pub mod router;
pub mod runner;
pub mod scheduler;

pub use backend::serverless::{
    File2FilePipeline, InvocationFailure, InvocationRequest, InvocationResponse, InvocationService,
    ServerlessLimits,
};
pub use backend::Backend;
pub use diagnostics::{Diagnostics, StageStats};
pub use emulator::InProcessInvoker;
pub use error::{ExecError, Result};
pub use failpoints::FaultyInvoker;
pub use plan::Plan;
pub use result::ResultSet;
pub use scheduler::CancelHandle;
