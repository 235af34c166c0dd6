// ABOUTME: Values passed between the prepare, execute, and collect phases
// ABOUTME: Compiled plans, prepared runs, execution results, and collected artifact paths

use osiris_core::constants::{
    ARTIFACTS_DIR, EVENTS_FILE, EXECUTION_LOG_FILE, METRICS_FILE, STATUS_FILE,
};
use osiris_core::{CoreError, Manifest};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Compiled manifest plus the directory its `cfg_path`s are relative to
#[derive(Debug, Clone, PartialEq)]
pub struct CompiledPlan {
    pub manifest: Manifest,
    pub cfg_root: PathBuf,
}

impl CompiledPlan {
    pub fn new(manifest: Manifest, cfg_root: impl Into<PathBuf>) -> Self {
        Self {
            manifest,
            cfg_root: cfg_root.into(),
        }
    }

    /// Load a compiled manifest; step configs live next to it
    pub fn load(manifest_path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let manifest_path = manifest_path.as_ref();
        let manifest = Manifest::from_path(manifest_path)?;
        let cfg_root = manifest_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Ok(Self::new(manifest, cfg_root))
    }
}

/// Where a run writes its logs and artifacts, in the target's own path space
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IoLayout {
    pub session_dir: String,
    pub events: String,
    pub metrics: String,
    pub execution_log: String,
    pub status: String,
    pub artifacts_dir: String,
}

impl IoLayout {
    pub fn under(session_dir: &str) -> Self {
        let session_dir = session_dir.trim_end_matches('/');
        let join = |name: &str| format!("{}/{}", session_dir, name);
        Self {
            session_dir: session_dir.to_string(),
            events: join(EVENTS_FILE),
            metrics: join(METRICS_FILE),
            execution_log: join(EXECUTION_LOG_FILE),
            status: join(STATUS_FILE),
            artifacts_dir: join(ARTIFACTS_DIR),
        }
    }
}

/// Resource limits for the run; all `None` for in-process execution
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Constraints {
    pub cpu: Option<u32>,
    pub memory_gb: Option<u32>,
    pub timeout_secs: Option<u64>,
}

impl Constraints {
    pub fn unconstrained() -> Self {
        Self::default()
    }

    pub fn is_unconstrained(&self) -> bool {
        *self == Self::default()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunParams {
    pub session_id: String,
    pub pipeline_id: String,
    pub steps_total: usize,
    pub force_spill: bool,
    pub install_deps: bool,
}

/// Everything `execute` needs, built once by `prepare`
#[derive(Debug, Clone)]
pub struct PreparedRun {
    pub plan: CompiledPlan,
    /// Connection descriptors keyed by `@family.alias`, secrets masked
    pub resolved_connections: BTreeMap<String, Value>,
    /// Step descriptors keyed by id, without `cfg_path`
    pub cfg_index: BTreeMap<String, Value>,
    pub io_layout: IoLayout,
    pub run_params: RunParams,
    pub constraints: Constraints,
    pub metadata: BTreeMap<String, String>,
}

/// Per-step summary reconstructed from the run's events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub ok: bool,
    pub rows: usize,
    pub duration_ms: u64,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecResult {
    pub success: bool,
    pub exit_code: i32,
    pub duration_seconds: f64,
    pub error_message: Option<String>,
    pub step_results: Vec<StepResult>,
}

/// Local paths of what a run produced; `None` means not produced
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CollectedArtifacts {
    pub events_log: Option<PathBuf>,
    pub metrics_log: Option<PathBuf>,
    pub execution_log: Option<PathBuf>,
    pub artifacts_dir: Option<PathBuf>,
    pub metadata: BTreeMap<String, Value>,
}

impl CollectedArtifacts {
    /// Pick up whichever standard run files exist under `dir`
    pub fn scan(dir: &Path) -> Self {
        let existing = |name: &str| Some(dir.join(name)).filter(|p| p.exists());
        Self {
            events_log: existing(EVENTS_FILE),
            metrics_log: existing(METRICS_FILE),
            execution_log: existing(EXECUTION_LOG_FILE),
            artifacts_dir: existing(ARTIFACTS_DIR),
            metadata: BTreeMap::new(),
        }
    }
}
