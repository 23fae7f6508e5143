use rowforge_core::id::OpId;
use rowforge_operators::OpError;
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("operator {op} ({kind}): {source}")]
    Operator {
        op: OpId,
        kind: &'static str,
        #[source]
        source: OpError,
    },

    #[error("operator {op} ({kind}): {msg}")]
    Unsupported {
        op: OpId,
        kind: &'static str,
        msg: String,
    },

    #[error("plan root must be an action, found {kind} ({op})")]
    MissingAction { op: OpId, kind: &'static str },

    #[error("action {op} is only allowed at the root of a plan")]
    NestedAction { op: OpId },

    #[error("operator id {0} appears more than once; build joined pipelines from one PlanContext")]
    DuplicateOpId(OpId),

    #[error("invalid stage graph: {0}")]
    InvalidGraph(String),

    #[error("pipeline definition: {0}")]
    Dsl(String),

    #[error(transparent)]
    Core(#[from] rowforge_core::error::Error),
}

pub type Result<T> = std::result::Result<T, PlanError>;

impl From<serde_yaml::Error> for PlanError {
    fn from(e: serde_yaml::Error) -> Self {
        PlanError::Dsl(e.to_string())
    }
}
