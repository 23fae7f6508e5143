//! Engine configuration that downstream crates can serialize/deserialize.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, Result};

/// Smallest memory size a serverless invocation may be configured with.
pub const MIN_INVOCATION_MEMORY_MB: u64 = 384;
/// Largest memory size a serverless invocation may be configured with.
pub const MAX_INVOCATION_MEMORY_MB: u64 = 10_240;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    /// Pick per plan from estimated work.
    #[default]
    Auto,
    Local,
    Serverless,
}

impl FromStr for BackendKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "auto" => Ok(BackendKind::Auto),
            "local" => Ok(BackendKind::Local),
            "serverless" | "lambda" => Ok(BackendKind::Serverless),
            other => Err(Error::Config(format!("unknown backend '{other}'"))),
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            BackendKind::Auto => "auto",
            BackendKind::Local => "local",
            BackendKind::Serverless => "serverless",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Input bytes the local backend is trusted with before offloading.
    pub mem_cap_bytes: u64,

    /// Row-operator work (rows x operators) the local backend accepts under `Auto`.
    pub local_work_budget: u64,

    /// Worker threads for local execution.
    pub max_parallel_tasks: usize,

    /// Rows per partition for in-memory sources.
    pub partition_rows: usize,

    /// Byte size of local partitions cut from file sources.
    pub partition_bytes: u64,

    pub backend: BackendKind,

    /// Prefix for serverless job outputs (`memory://` or a filesystem URI).
    pub scratch_uri: String,

    /// Memory size of each serverless invocation.
    pub memory_mb: u64,

    pub invocation_timeout_ms: u64,

    /// Retry policy for transient invocation failures.
    pub max_retries: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mem_cap_bytes: 512 * 1024 * 1024, // 512 MiB
            local_work_budget: 50_000_000,
            max_parallel_tasks: 4,
            partition_rows: 10_000,
            partition_bytes: 32 * 1024 * 1024,
            backend: BackendKind::Auto,
            scratch_uri: "memory://rowforge-scratch".to_string(),
            memory_mb: 1536,
            invocation_timeout_ms: 300_000,
            max_retries: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
        }
    }
}

impl EngineConfig {
    /// Create a config from environment variables, falling back to defaults.
    ///
    /// Environment variables:
    /// - `ROWFORGE_MEM_CAP_BYTES`, `ROWFORGE_LOCAL_WORK_BUDGET`
    /// - `ROWFORGE_MAX_PARALLEL_TASKS`, `ROWFORGE_PARTITION_ROWS`, `ROWFORGE_PARTITION_BYTES`
    /// - `ROWFORGE_BACKEND` (`auto`, `local`, `serverless`)
    /// - `ROWFORGE_SCRATCH_URI`, `ROWFORGE_MEMORY_MB`, `ROWFORGE_INVOCATION_TIMEOUT_MS`
    /// - `ROWFORGE_MAX_RETRIES`, `ROWFORGE_INITIAL_BACKOFF_MS`, `ROWFORGE_MAX_BACKOFF_MS`
    ///
    /// Unparseable values are ignored.
    pub fn from_env() -> Self {
        Self::from_lookup(|k| std::env::var(k).ok())
    }

    /// Same as [`EngineConfig::from_env`] with an injectable variable source.
    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(v) = parse_var(&get, "ROWFORGE_MEM_CAP_BYTES") {
            cfg.mem_cap_bytes = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_LOCAL_WORK_BUDGET") {
            cfg.local_work_budget = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_MAX_PARALLEL_TASKS") {
            cfg.max_parallel_tasks = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_PARTITION_ROWS") {
            cfg.partition_rows = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_PARTITION_BYTES") {
            cfg.partition_bytes = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_BACKEND") {
            cfg.backend = v;
        }
        if let Some(s) = get("ROWFORGE_SCRATCH_URI") {
            cfg.scratch_uri = s;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_MEMORY_MB") {
            cfg.memory_mb = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_INVOCATION_TIMEOUT_MS") {
            cfg.invocation_timeout_ms = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_MAX_RETRIES") {
            cfg.max_retries = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_INITIAL_BACKOFF_MS") {
            cfg.initial_backoff_ms = v;
        }
        if let Some(v) = parse_var(&get, "ROWFORGE_MAX_BACKOFF_MS") {
            cfg.max_backoff_ms = v;
        }

        cfg
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_parallel_tasks == 0 {
            return Err(Error::Config("max_parallel_tasks must be at least 1".into()));
        }
        if self.partition_rows == 0 {
            return Err(Error::Config("partition_rows must be at least 1".into()));
        }
        if self.partition_bytes == 0 {
            return Err(Error::Config("partition_bytes must be at least 1".into()));
        }
        if !(MIN_INVOCATION_MEMORY_MB..=MAX_INVOCATION_MEMORY_MB).contains(&self.memory_mb) {
            return Err(Error::Config(format!(
                "memory_mb must be within {MIN_INVOCATION_MEMORY_MB}..={MAX_INVOCATION_MEMORY_MB}, got {}",
                self.memory_mb
            )));
        }
        if self.initial_backoff_ms > self.max_backoff_ms {
            return Err(Error::Config(
                "initial_backoff_ms must not exceed max_backoff_ms".into(),
            ));
        }
        if self.scratch_uri.trim().is_empty() {
            return Err(Error::Config("scratch_uri must not be empty".into()));
        }
        Ok(())
    }
}

fn parse_var<T: FromStr>(get: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    get(key).and_then(|s| s.trim().parse::<T>().ok())
}
