#![forbid(unsafe_code)]
//! rowforge-operators: what each operator does to a row.
//!
//! Design intent:
//! - A stage's operator chain is a serializable [`ir::StageIr`]; it is the unit
//!   handed to code generation and shipped inside remote descriptors.
//! - Two implementations of [`traits::RowKernel`] execute it: the
//!   [`interp::Interpreter`] (dynamic, exact semantics, the fallback path) and
//!   the closure-compiled [`codegen::CodeHandle`] (type-specialised fast path
//!   that reports `NormalCaseViolation` when its assumptions do not hold).
//! - Value semantics live once in [`eval`] so both paths agree on every
//!   exception they raise.
//! - Pure and synchronous; threads belong to the exec crate.

pub mod aggregate;
pub mod codegen;
pub mod eval;
pub mod infer;
pub mod interp;
pub mod ir;
pub mod join;
pub mod traits;

pub use aggregate::{AggState, AggregateSpec};
pub use codegen::{ClosureCodegen, CodeHandle, CodeId};
pub use interp::Interpreter;
pub use ir::{PhysicalOp, StageIr};
pub use join::{join_output_schema, JoinTable};
pub use traits::{CodeGenerator, CompileError, KernelContext, OpError, OpOutput, RowKernel};
