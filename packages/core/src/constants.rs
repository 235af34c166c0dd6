// ABOUTME: File names and fixed vocabulary shared by both execution paths
// ABOUTME: Local and sandboxed runs must agree on these for artifact parity

/// Compiled manifest, both next to the step configs and inside payloads
pub const MANIFEST_FILE: &str = "manifest.json";

/// Pinned dependency list shipped in sandbox payloads
pub const REQUIREMENTS_FILE: &str = "requirements.txt";

/// JSON-lines event stream written by every run
pub const EVENTS_FILE: &str = "events.jsonl";

/// JSON-lines metric stream written by every run
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Plain-text execution log
pub const EXECUTION_LOG_FILE: &str = "osiris.log";

/// Final status artifact
pub const STATUS_FILE: &str = "status.json";

/// Per-session artifacts directory name
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Masked copy of a step config inside `artifacts/<step_id>/`
pub const CLEANED_CONFIG_FILE: &str = "cleaned_config.json";

/// Step-level and run-level event names shared by the runner and the worker
pub mod event_names {
    pub const RUN_START: &str = "run_start";
    pub const RUN_COMPLETE: &str = "run_complete";
    pub const RUN_ERROR: &str = "run_error";
    pub const STEP_START: &str = "step_start";
    pub const STEP_COMPLETE: &str = "step_complete";
    pub const STEP_FAILED: &str = "step_failed";
    pub const STEP_ERROR: &str = "step_error";
}

/// Metric names shared by the runner and the worker
pub mod metric_names {
    pub const ROWS_READ: &str = "rows_read";
    pub const ROWS_WRITTEN: &str = "rows_written";
    pub const STEPS_COMPLETED: &str = "steps_completed";
    pub const STEP_DURATION_MS: &str = "step_duration_ms";
}
