use rowforge_core::id::StageId;
use rowforge_operators::{CompileError, OpError};
use rowforge_planner::PlanError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ExecError {
    #[error("planning failed: {0}")]
    Plan(#[from] PlanError),

    #[error("compiling {stage} ({chain}): {source}")]
    Compile {
        stage: StageId,
        chain: String,
        #[source]
        source: CompileError,
    },

    #[error("operator setup: {0}")]
    Operator(#[from] OpError),

    #[error("io: {0}")]
    Io(#[from] rowforge_io::Error),

    #[error(transparent)]
    Core(#[from] rowforge_core::error::Error),

    #[error("job failed: {reason}")]
    JobFailed { reason: String },

    #[error("execution cancelled")]
    Cancelled,

    #[error("plan has not been executed")]
    NotExecuted,

    #[error("invalid plan: {0}")]
    Invalid(String),
}

pub type Result<T> = std::result::Result<T, ExecError>;
