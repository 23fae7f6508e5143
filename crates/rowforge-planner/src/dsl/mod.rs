//! Text front-ends that build pipelines through [`crate::logical::Pipeline`].

pub mod yaml;
