//! Execution backends.
//!
//! A closed set: every plan runs either on the local worker pool or as remote
//! invocations of single-stage file-to-file pipelines.

pub mod local;
pub mod serverless;

use rowforge_core::config::{BackendKind, EngineConfig};
use rowforge_io::StorageRegistry;
use rowforge_operators::CodeGenerator;
use rowforge_planner::physical::StageGraph;

use crate::diagnostics::Diagnostics;
use crate::error::{ExecError, Result};
use crate::result::ResultSet;
use crate::scheduler::CancelHandle;
use serverless::InvocationService;

/// Shared services a backend runs against.
#[derive(Clone, Copy)]
pub struct ExecEnv<'a> {
    pub cfg: &'a EngineConfig,
    pub storage: &'a StorageRegistry,
    pub codegen: &'a dyn CodeGenerator,
    pub cancel: &'a CancelHandle,
    pub invoker: Option<&'a dyn InvocationService>,
}

/// Best-effort removal of part files a failed or finished run no longer owns.
pub(crate) fn remove_parts<'a>(storage: &StorageRegistry, uris: impl IntoIterator<Item = &'a str>) {
    for uri in uris {
        if let Err(e) = storage.delete(uri) {
            tracing::debug!(%uri, error = %e, "part cleanup failed");
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Backend {
    Local,
    Serverless,
}

impl Backend {
    pub fn kind(self) -> BackendKind {
        match self {
            Backend::Local => BackendKind::Local,
            Backend::Serverless => BackendKind::Serverless,
        }
    }

    pub fn execute(
        self,
        graph: &StageGraph,
        env: &ExecEnv<'_>,
        diag: &mut Diagnostics,
    ) -> Result<ResultSet> {
        diag.backend = Some(self.kind());
        match self {
            Backend::Local => local::execute(graph, env, diag),
            Backend::Serverless => {
                let service = env.invoker.ok_or_else(|| {
                    ExecError::Invalid("serverless backend selected without an invocation service".into())
                })?;
                serverless::execute(graph, env, service, diag)
            }
        }
    }
}
