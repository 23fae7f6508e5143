//! rowforge CLI: run, validate and explain YAML pipelines.

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Parser, Subcommand};
use rowforge_core::config::{BackendKind, EngineConfig};
use rowforge_core::dag::Action;
use rowforge_exec::{Plan, ResultSet};
use rowforge_io::writers::jsonl::JsonlWriter;
use rowforge_planner::{parse_yaml_pipeline, ParsedPipeline};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "rowforge")]
#[command(about = "rowforge: row pipelines with per-row exception handling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute a pipeline from a YAML file
    Run {
        #[command(flatten)]
        opts: RunOpts,

        /// Write result rows as JSON lines to this file instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Parse and plan a pipeline without running it
    Validate {
        /// Path to the pipeline YAML file
        #[arg(short, long)]
        pipeline: PathBuf,
    },

    /// Show the stage graph and backend choice for a pipeline
    Explain {
        #[command(flatten)]
        opts: RunOpts,
    },
}

#[derive(Args)]
struct RunOpts {
    /// Path to the pipeline YAML file
    #[arg(short, long)]
    pipeline: PathBuf,

    /// Backend: auto, local or serverless (overrides config)
    #[arg(long)]
    backend: Option<BackendKind>,

    /// Local memory cap in bytes (overrides config)
    #[arg(long)]
    memory_cap: Option<u64>,

    /// Worker threads for local execution (overrides config)
    #[arg(long)]
    max_parallel: Option<usize>,
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}

fn main() {
    init_tracing();
    let cli = Cli::parse();

    let outcome = match cli.command {
        Commands::Run { opts, output } => run_pipeline(&opts, output.as_deref()),
        Commands::Validate { pipeline } => validate_pipeline(&pipeline),
        Commands::Explain { opts } => explain_pipeline(&opts),
    };
    if let Err(e) = outcome {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn load(path: &Path) -> Result<ParsedPipeline, Box<dyn Error>> {
    let yaml = fs::read_to_string(path)
        .map_err(|e| format!("reading {}: {e}", path.display()))?;
    Ok(parse_yaml_pipeline(&yaml)?)
}

/// Defaults, then `ROWFORGE_*` variables, then the pipeline's `config:`
/// block, then command-line flags.
fn build_config(parsed: &ParsedPipeline, opts: &RunOpts) -> EngineConfig {
    let mut config = EngineConfig::from_env();
    parsed.config.apply_to(&mut config);
    if let Some(backend) = opts.backend {
        config.backend = backend;
    }
    if let Some(cap) = opts.memory_cap {
        config.mem_cap_bytes = cap;
    }
    if let Some(n) = opts.max_parallel {
        config.max_parallel_tasks = n;
    }
    config
}

fn planned(opts: &RunOpts) -> Result<Plan, Box<dyn Error>> {
    let parsed = load(&opts.pipeline)?;
    let config = build_config(&parsed, opts);
    let plan = Plan::from_logical(&parsed.plan, config);
    if let Some(e) = plan.planning_error() {
        return Err(format!("planning failed: {e}").into());
    }
    Ok(plan)
}

fn run_pipeline(opts: &RunOpts, output: Option<&Path>) -> Result<(), Box<dyn Error>> {
    let mut plan = planned(opts)?;
    let count_only = matches!(plan.graph().map(|g| &g.action), Some(Action::Count));
    let rs = plan.execute()?;
    print_result(rs, count_only, output)?;

    let diag = plan.diagnostics();
    eprint!("{}", diag.report());
    if let Some(m) = plan.manifest() {
        eprintln!(
            "done in {}ms, plan hash {}",
            m.finished_ms.saturating_sub(m.started_ms),
            m.plan_hash.short()
        );
    }
    if !plan.unresolved().is_empty() {
        eprintln!("{} unresolved row(s)", plan.unresolved().len());
    }
    Ok(())
}

fn print_result(rs: &ResultSet, count_only: bool, output: Option<&Path>) -> Result<(), Box<dyn Error>> {
    if !rs.written.is_empty() {
        for uri in &rs.written {
            println!("{uri}");
        }
        eprintln!("wrote {} row(s) to {} file(s)", rs.row_count, rs.written.len());
        return Ok(());
    }
    if count_only {
        println!("{}", rs.row_count);
        return Ok(());
    }
    match output {
        Some(path) => {
            let path = path.to_string_lossy();
            rs.write_jsonl(&path)?;
            eprintln!("wrote {} row(s) to {path}", rs.len());
        }
        None => {
            let mut w = JsonlWriter::to_writer(std::io::stdout().lock(), rs.schema.names());
            w.write_rows(&rs.rows)?;
            w.finish()?;
        }
    }
    Ok(())
}

fn validate_pipeline(path: &Path) -> Result<(), Box<dyn Error>> {
    let parsed = load(path)?;
    let mut config = EngineConfig::from_env();
    parsed.config.apply_to(&mut config);
    config.validate()?;
    let plan = Plan::from_logical(&parsed.plan, config);
    if let Some(e) = plan.planning_error() {
        return Err(format!("planning failed: {e}").into());
    }
    let stages = plan.graph().map(|g| g.stages.len()).unwrap_or(0);
    println!("pipeline is valid ({stages} stage(s))");
    Ok(())
}

fn explain_pipeline(opts: &RunOpts) -> Result<(), Box<dyn Error>> {
    let plan = planned(opts)?;
    println!("Pipeline Execution Plan");
    println!("=======================");
    print!("{}", plan.explain());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts() -> RunOpts {
        RunOpts {
            pipeline: PathBuf::from("p.yaml"),
            backend: None,
            memory_cap: None,
            max_parallel: None,
        }
    }

    const YAML: &str = r#"
config:
  max_parallel_tasks: 2
  memory_mb: 2048
steps:
  - op: parallelize
    schema: [{name: x, type: int64}]
    rows: [[1], [2]]
  - op: collect
"#;

    #[test]
    fn flags_override_pipeline_config() {
        let parsed = parse_yaml_pipeline(YAML).unwrap();
        let config = build_config(&parsed, &opts());
        assert_eq!(config.max_parallel_tasks, 2);
        assert_eq!(config.memory_mb, 2048);

        let flagged = RunOpts {
            max_parallel: Some(7),
            backend: Some(BackendKind::Local),
            ..opts()
        };
        let config = build_config(&parsed, &flagged);
        assert_eq!(config.max_parallel_tasks, 7);
        assert_eq!(config.backend, BackendKind::Local);
    }

    #[test]
    fn cli_parses_run_flags() {
        let cli = Cli::try_parse_from([
            "rowforge", "run", "--pipeline", "p.yaml", "--backend", "serverless", "--memory-cap", "1024",
            "--output", "out.jsonl",
        ])
        .unwrap();
        match cli.command {
            Commands::Run { opts, output } => {
                assert_eq!(opts.backend, Some(BackendKind::Serverless));
                assert_eq!(opts.memory_cap, Some(1024));
                assert_eq!(output, Some(PathBuf::from("out.jsonl")));
            }
            _ => panic!("expected run"),
        }
    }
}
