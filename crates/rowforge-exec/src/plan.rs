//! The orchestrator: one logical pipeline, lowered once, executable many times.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use rowforge_core::config::{BackendKind, EngineConfig};
use rowforge_core::dag::LogicalPlan;
use rowforge_core::exception::ExceptionRecord;
use rowforge_core::manifest::RunManifest;
use rowforge_io::StorageRegistry;
use rowforge_operators::{ClosureCodegen, CodeGenerator};
use rowforge_planner::{estimate_work, lower_to_stages, PlanError, StageGraph, WorkEstimate, WorkHint};

use crate::backend::serverless::InvocationService;
use crate::backend::{Backend, ExecEnv};
use crate::diagnostics::Diagnostics;
use crate::emulator::InProcessInvoker;
use crate::error::{ExecError, Result};
use crate::replay::hash_graph;
use crate::result::ResultSet;
use crate::scheduler::CancelHandle;

pub struct Plan {
    config: EngineConfig,
    graph: std::result::Result<StageGraph, PlanError>,
    storage: StorageRegistry,
    codegen: Arc<dyn CodeGenerator>,
    invoker: Option<Arc<dyn InvocationService>>,
    cancel: CancelHandle,
    diagnostics: Diagnostics,
    result: Option<ResultSet>,
    manifest: Option<RunManifest>,
}

impl std::fmt::Debug for Plan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Plan")
            .field("good", &self.good())
            .field("backend", &self.config.backend)
            .field("executed", &self.result.is_some())
            .finish()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Plan {
    /// Lower `optimized` into a stage graph. `original` is the plan as the
    /// user wrote it and only labels operators in diagnostics.
    ///
    /// Never fails: planning errors are kept and reported by [`Plan::good`]
    /// and [`Plan::execute`].
    pub fn new(optimized: &LogicalPlan, original: &LogicalPlan, config: EngineConfig) -> Self {
        let graph = config
            .validate()
            .map_err(PlanError::from)
            .and_then(|_| lower_to_stages(optimized))
            .and_then(|g| check_forced_backend(g, config.backend));
        match &graph {
            Ok(g) => tracing::debug!(stages = g.stages.len(), "plan lowered"),
            Err(e) => tracing::warn!(error = %e, "planning failed"),
        }
        Self {
            config,
            graph,
            storage: StorageRegistry::new(),
            codegen: Arc::new(ClosureCodegen),
            invoker: None,
            cancel: CancelHandle::new(),
            diagnostics: Diagnostics::new(original),
            result: None,
            manifest: None,
        }
    }

    /// Shorthand for a plan that was not rewritten before lowering.
    pub fn from_logical(plan: &LogicalPlan, config: EngineConfig) -> Self {
        Self::new(plan, plan, config)
    }

    pub fn with_storage(mut self, storage: StorageRegistry) -> Self {
        self.storage = storage;
        self
    }

    pub fn with_codegen(mut self, codegen: Arc<dyn CodeGenerator>) -> Self {
        self.codegen = codegen;
        self
    }

    /// Service used by the serverless backend. Defaults to an in-process
    /// invoker sharing this plan's storage.
    pub fn with_invoker(mut self, invoker: Arc<dyn InvocationService>) -> Self {
        self.invoker = Some(invoker);
        self
    }

    pub fn good(&self) -> bool {
        self.graph.is_ok()
    }

    pub fn planning_error(&self) -> Option<&PlanError> {
        self.graph.as_ref().err()
    }

    pub fn graph(&self) -> Option<&StageGraph> {
        self.graph.as_ref().ok()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn storage(&self) -> &StorageRegistry {
        &self.storage
    }

    pub fn estimate(&self) -> Option<WorkEstimate> {
        let graph = self.graph()?;
        Some(estimate_work(graph, Some(&size_hints(&self.storage, graph))))
    }

    /// Backend `execute` would use right now.
    pub fn select_backend(&self) -> Result<Backend> {
        let graph = self.graph.as_ref().map_err(|e| ExecError::Plan(e.clone()))?;
        Ok(choose_backend(&self.config, &self.storage, graph))
    }

    /// Run the whole plan. Earlier results and diagnostics are replaced.
    pub fn execute(&mut self) -> Result<&ResultSet> {
        let graph = self.graph.as_ref().map_err(|e| ExecError::Plan(e.clone()))?;
        self.result = None;
        self.manifest = None;
        self.diagnostics.reset();

        let backend = choose_backend(&self.config, &self.storage, graph);
        tracing::info!(backend = %backend.kind(), stages = graph.stages.len(), "executing plan");
        let started = now_ms();

        let fallback;
        let invoker: Option<&dyn InvocationService> = match (&self.invoker, backend) {
            (Some(i), _) => Some(i.as_ref()),
            (None, Backend::Serverless) => {
                fallback = InProcessInvoker::new(self.storage.clone());
                Some(&fallback)
            }
            (None, Backend::Local) => None,
        };
        let env = ExecEnv {
            cfg: &self.config,
            storage: &self.storage,
            codegen: self.codegen.as_ref(),
            cancel: &self.cancel,
            invoker,
        };
        let outcome = backend.execute(graph, &env, &mut self.diagnostics);
        self.diagnostics.normalize();

        if self.cancel.is_cancelled() {
            self.cancel.reset();
            tracing::warn!("execution cancelled");
            return Err(ExecError::Cancelled);
        }
        let rs = match outcome {
            Ok(rs) => rs,
            Err(e) => {
                tracing::error!(error = %e, "execution failed");
                return Err(e);
            }
        };

        let partitions = self.diagnostics.stages.iter().map(|s| s.partitions).sum();
        let mut manifest = RunManifest::new(hash_graph(graph)?, backend.kind(), started).finish(
            now_ms(),
            rs.row_count,
            self.diagnostics.tally.total_unresolved(),
        );
        manifest.stages = graph.stages.len();
        manifest.partitions = partitions;
        tracing::info!(
            rows = rs.row_count,
            unresolved = manifest.unresolved,
            manifest = %manifest.id.0,
            "plan finished"
        );
        self.manifest = Some(manifest);
        Ok(self.result.insert(rs))
    }

    pub fn result_set(&self) -> Result<&ResultSet> {
        self.result.as_ref().ok_or(ExecError::NotExecuted)
    }

    pub fn diagnostics(&self) -> &Diagnostics {
        &self.diagnostics
    }

    /// Every exception raised in the last run, resolved or not, by code name.
    pub fn exception_counts(&self) -> BTreeMap<String, u64> {
        self.diagnostics.exception_counts()
    }

    /// Rows no handler took care of, in input order.
    pub fn unresolved(&self) -> &[ExceptionRecord] {
        &self.diagnostics.unresolved
    }

    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn manifest(&self) -> Option<&RunManifest> {
        self.manifest.as_ref()
    }

    pub fn explain(&self) -> String {
        let graph = match &self.graph {
            Ok(g) => g,
            Err(e) => return format!("planning failed: {e}\n"),
        };
        let mut out = graph.explain();
        let est = estimate_work(graph, Some(&size_hints(&self.storage, graph)));
        let backend = choose_backend(&self.config, &self.storage, graph);
        let _ = writeln!(
            out,
            "estimate: rows={} bytes={} row_ops={} stages={}",
            est.total_rows, est.total_bytes, est.row_ops, est.stages
        );
        let _ = writeln!(
            out,
            "backend: {} (configured {}, file2file={})",
            backend.kind(),
            self.config.backend,
            graph.is_file2file()
        );
        out
    }
}

fn check_forced_backend(graph: StageGraph, backend: BackendKind) -> std::result::Result<StageGraph, PlanError> {
    if backend == BackendKind::Serverless && !graph.is_file2file() {
        return Err(PlanError::Unsupported {
            op: graph.action_op,
            kind: "serverless",
            msg: "only a single csv-to-csv stage can run serverless".into(),
        });
    }
    Ok(graph)
}

fn size_hints(storage: &StorageRegistry, graph: &StageGraph) -> WorkHint {
    let mut hint = WorkHint::default();
    for uri in graph.input_uris() {
        match storage.size(&uri) {
            Ok(n) => hint.source_bytes.push((uri, n)),
            Err(e) => tracing::debug!(%uri, error = %e, "no size for input"),
        }
    }
    hint
}

fn choose_backend(cfg: &EngineConfig, storage: &StorageRegistry, graph: &StageGraph) -> Backend {
    match cfg.backend {
        BackendKind::Local => Backend::Local,
        BackendKind::Serverless => Backend::Serverless,
        BackendKind::Auto => {
            let est = estimate_work(graph, Some(&size_hints(storage, graph)));
            if est.total_bytes <= cfg.mem_cap_bytes && est.row_ops <= cfg.local_work_budget {
                Backend::Local
            } else if graph.is_file2file() {
                tracing::info!(bytes = est.total_bytes, row_ops = est.row_ops, "offloading to serverless");
                Backend::Serverless
            } else {
                tracing::warn!(
                    bytes = est.total_bytes,
                    row_ops = est.row_ops,
                    "plan exceeds local limits but cannot run serverless; running locally"
                );
                Backend::Local
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rowforge_core::schema::{DataType, Field, Schema};
    use rowforge_core::types::Scalar;
    use rowforge_planner::PlanContext;

    fn schema() -> Schema {
        Schema::new(vec![Field::new("x", DataType::Int64, false)])
    }

    fn rows(n: i64) -> Vec<rowforge_core::types::Row> {
        (0..n).map(|i| vec![Scalar::I64(i)]).collect()
    }

    #[test]
    fn not_executed_until_execute() {
        let ctx = PlanContext::new();
        let lp = ctx.parallelize(schema(), rows(3)).collect();
        let mut plan = Plan::from_logical(&lp, EngineConfig::default());
        assert!(plan.good());
        assert!(matches!(plan.result_set(), Err(ExecError::NotExecuted)));
        assert_eq!(plan.execute().unwrap().len(), 3);
        assert!(plan.manifest().is_some());
        assert_eq!(plan.diagnostics().backend, Some(BackendKind::Local));
    }

    #[test]
    fn forced_serverless_needs_file2file() {
        let ctx = PlanContext::new();
        let lp = ctx.parallelize(schema(), rows(3)).collect();
        let cfg = EngineConfig {
            backend: BackendKind::Serverless,
            ..EngineConfig::default()
        };
        let mut plan = Plan::from_logical(&lp, cfg);
        assert!(!plan.good());
        assert!(plan.explain().starts_with("planning failed"));
        assert!(matches!(plan.execute(), Err(ExecError::Plan(PlanError::Unsupported { .. }))));
    }

    #[test]
    fn bad_config_is_a_planning_error() {
        let ctx = PlanContext::new();
        let lp = ctx.parallelize(schema(), rows(1)).count();
        let cfg = EngineConfig {
            memory_mb: 10,
            ..EngineConfig::default()
        };
        assert!(!Plan::from_logical(&lp, cfg).good());
    }

    #[test]
    fn auto_offloads_large_csv_jobs() {
        let storage = StorageRegistry::new();
        storage.write("memory://in/big.csv", &vec![b'1'; 2048]).unwrap();
        let ctx = PlanContext::new();
        let lp = ctx.csv(["memory://in/big.csv"], schema()).collect();
        let cfg = EngineConfig {
            mem_cap_bytes: 1024,
            ..EngineConfig::default()
        };
        let plan = Plan::from_logical(&lp, cfg.clone()).with_storage(storage.clone());
        assert_eq!(plan.select_backend().unwrap(), Backend::Serverless);

        let small = EngineConfig {
            mem_cap_bytes: 4096,
            ..cfg
        };
        let plan = Plan::from_logical(&lp, small).with_storage(storage);
        assert_eq!(plan.select_backend().unwrap(), Backend::Local);
        assert!(plan.explain().contains("backend: local"));
    }
}
