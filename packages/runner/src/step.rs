// ABOUTME: Single-step execution shared by the DAG runner and the proxy worker
// ABOUTME: Emits step events, isolates driver failures, and derives row counts by driver role

use osiris_core::constants::{event_names, metric_names, CLEANED_CONFIG_FILE};
use osiris_core::{
    mask_secrets, CoreError, Driver, DriverContext, DriverError, DriverRole, InputRef,
    InputSource, OutputValue, ResolveError, RunLog, StepInputs, StepOutputs,
};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::panic::{self, AssertUnwindSafe};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{debug, warn};

/// Step-local failure, reported through events and responses rather than raised
#[derive(Error, Debug)]
pub enum StepError {
    #[error("{0}")]
    Setup(String),

    #[error(transparent)]
    DriverNotFound(CoreError),

    #[error("Input resolution failed: {0}")]
    Input(#[from] ResolveError),

    #[error(transparent)]
    Driver(#[from] DriverError),

    #[error("Driver panicked: {0}")]
    Panic(String),
}

impl StepError {
    pub fn error_type(&self) -> &'static str {
        match self {
            StepError::Setup(_) => "ConfigError",
            StepError::DriverNotFound(_) => "DriverNotFound",
            StepError::Input(_) => "InputResolutionError",
            StepError::Driver(e) => e.error_type(),
            StepError::Panic(_) => "Panic",
        }
    }

    /// Error followed by each source in the chain, one per line
    pub fn traceback(&self) -> String {
        let mut lines = vec![format!("{}: {}", self.error_type(), self)];
        let mut source = std::error::Error::source(self);
        while let Some(cause) = source {
            lines.push(format!("caused by: {}", cause));
            source = cause.source();
        }
        lines.join("\n")
    }
}

/// Driver and materialized config for a step about to run
pub struct StepSetup {
    pub driver: Arc<dyn Driver>,
    pub config: Value,
}

#[derive(Debug, Clone)]
pub struct StepFailure {
    pub error: String,
    pub error_type: String,
    pub traceback: String,
}

impl From<&StepError> for StepFailure {
    fn from(err: &StepError) -> Self {
        Self {
            error: err.to_string(),
            error_type: err.error_type().to_string(),
            traceback: err.traceback(),
        }
    }
}

/// Result of one step, successful or not
#[derive(Debug, Clone)]
pub struct StepOutcome {
    pub step_id: String,
    pub role: DriverRole,
    pub outputs: StepOutputs,
    pub rows_processed: usize,
    pub rows_read: usize,
    pub rows_written: usize,
    pub duration_ms: u64,
    pub failure: Option<StepFailure>,
}

impl StepOutcome {
    pub fn ok(&self) -> bool {
        self.failure.is_none()
    }
}

/// Run-wide row totals; writers are authoritative, extractors the fallback
/// when no writer completed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RowTotals {
    pub rows_read: usize,
    pub rows_written: usize,
    pub writer_completed: bool,
}

impl RowTotals {
    pub fn record(&mut self, outcome: &StepOutcome) {
        self.rows_read += outcome.rows_read;
        self.rows_written += outcome.rows_written;
        if outcome.role == DriverRole::Writer && outcome.ok() {
            self.writer_completed = true;
        }
    }

    pub fn total_rows(&self) -> usize {
        if self.writer_completed {
            self.rows_written
        } else {
            self.rows_read
        }
    }
}

fn table_rows<'a>(values: impl Iterator<Item = &'a OutputValue>) -> usize {
    values.filter_map(OutputValue::row_count).sum()
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Execute one step end to end.
///
/// `setup` runs after `step_start` so config and driver lookup failures are
/// reported as step failures. Inputs are resolved against `source` before
/// the driver is invoked.
#[allow(clippy::too_many_arguments)]
pub fn execute_step(
    log: &mut RunLog,
    artifacts_root: &Path,
    step_id: &str,
    driver_name: &str,
    role: DriverRole,
    setup: impl FnOnce(&mut RunLog) -> Result<StepSetup, StepError>,
    input_refs: &BTreeMap<String, InputRef>,
    source: &dyn InputSource,
) -> StepOutcome {
    let started = Instant::now();
    log.event(
        event_names::STEP_START,
        json!({"step_id": step_id, "driver": driver_name}),
    );
    debug!("Starting step {} ({})", step_id, driver_name);

    let result = run_driver(log, artifacts_root, step_id, setup, input_refs, source);
    let duration_ms = started.elapsed().as_millis() as u64;

    match result {
        Ok((outputs, inputs_rows)) => {
            let rows_processed = match role {
                DriverRole::Writer => inputs_rows,
                _ => table_rows(outputs.values()),
            };
            let rows_read = if role == DriverRole::Extractor {
                rows_processed
            } else {
                0
            };
            let rows_written = if role == DriverRole::Writer {
                rows_processed
            } else {
                0
            };

            let tags = json!({"step_id": step_id});
            if role == DriverRole::Extractor {
                log.metric(metric_names::ROWS_READ, rows_read, tags.clone());
            }
            if role == DriverRole::Writer {
                log.metric(metric_names::ROWS_WRITTEN, rows_written, tags.clone());
            }
            log.metric(metric_names::STEP_DURATION_MS, duration_ms, tags);
            log.event(
                event_names::STEP_COMPLETE,
                json!({"step_id": step_id, "rows": rows_processed, "duration_ms": duration_ms}),
            );
            log.info(format!(
                "Step {} completed: {} rows in {} ms",
                step_id, rows_processed, duration_ms
            ));

            StepOutcome {
                step_id: step_id.to_string(),
                role,
                outputs,
                rows_processed,
                rows_read,
                rows_written,
                duration_ms,
                failure: None,
            }
        }
        Err(err) => {
            let failure = StepFailure::from(&err);
            warn!("Step {} failed: {}", step_id, failure.error);
            log.event(
                event_names::STEP_FAILED,
                json!({
                    "step_id": step_id,
                    "error": failure.error,
                    "error_type": failure.error_type,
                    "traceback": failure.traceback,
                }),
            );
            log.error(format!("Step {} failed: {}", step_id, failure.error));

            StepOutcome {
                step_id: step_id.to_string(),
                role,
                outputs: StepOutputs::new(),
                rows_processed: 0,
                rows_read: 0,
                rows_written: 0,
                duration_ms,
                failure: Some(failure),
            }
        }
    }
}

fn run_driver(
    log: &mut RunLog,
    artifacts_root: &Path,
    step_id: &str,
    setup: impl FnOnce(&mut RunLog) -> Result<StepSetup, StepError>,
    input_refs: &BTreeMap<String, InputRef>,
    source: &dyn InputSource,
) -> Result<(StepOutputs, usize), StepError> {
    let StepSetup { driver, config } = setup(log)?;

    let step_artifacts = artifacts_root.join(step_id);
    std::fs::create_dir_all(&step_artifacts)
        .map_err(|e| StepError::Setup(format!("cannot create artifacts dir: {}", e)))?;
    let cleaned = mask_secrets(&config);
    let cleaned_bytes = serde_json::to_vec_pretty(&cleaned)
        .map_err(|e| StepError::Setup(format!("cannot encode cleaned config: {}", e)))?;
    if let Err(e) = std::fs::write(step_artifacts.join(CLEANED_CONFIG_FILE), cleaned_bytes) {
        warn!("Failed to write cleaned config for {}: {}", step_id, e);
    }

    let mut inputs = StepInputs::new();
    for (name, input_ref) in input_refs {
        inputs.insert(name.clone(), source.resolve(input_ref)?);
    }
    let inputs_rows = table_rows(inputs.values());

    let run = panic::catch_unwind(AssertUnwindSafe(|| {
        let mut ctx = DriverContext::new(step_id, step_artifacts.clone(), log);
        driver.run(step_id, &config, &inputs, &mut ctx)
    }));

    match run {
        Ok(result) => Ok((result?, inputs_rows)),
        Err(payload) => Err(StepError::Panic(panic_message(payload))),
    }
}
