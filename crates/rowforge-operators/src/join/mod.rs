//! Joins: the build side is materialized into a [`JoinTable`] by its own stage;
//! the probe runs as an ordinary operator in the consuming stage.

pub mod hash;

pub use hash::{join_output_schema, probe_row, JoinTable};
