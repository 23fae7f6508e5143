//! rowforge-core: shared vocabulary of the rowforge engine.
//!
//! Everything here is pure data plus small pure functions: identifiers, schemas,
//! scalar values, the expression language, exception codes and tallies, the
//! logical plan tree, engine configuration, hashing and the run manifest.
//! No threads or I/O live in this crate.

#![forbid(unsafe_code)]

pub mod config;
pub mod dag;
pub mod error;
pub mod exception;
pub mod expr;
pub mod hash;
pub mod id;
pub mod manifest;
pub mod prelude;
pub mod schema;
pub mod types;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
