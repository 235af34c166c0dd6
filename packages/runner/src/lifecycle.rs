// ABOUTME: Run-level events bracketing a pipeline execution
// ABOUTME: Shared by the in-process runner and the sandbox batch host so both streams match

use osiris_core::constants::{event_names, metric_names};
use osiris_core::{Manifest, RunLog};
use serde_json::json;
use tracing::info;

pub fn run_started(log: &mut RunLog, manifest: &Manifest) {
    log.event(
        event_names::RUN_START,
        json!({
            "pipeline_id": manifest.pipeline.id,
            "steps_total": manifest.steps.len(),
        }),
    );
    log.info(format!(
        "Starting pipeline {} ({} steps)",
        manifest.pipeline.id,
        manifest.steps.len()
    ));
}

pub fn run_completed(log: &mut RunLog, steps_completed: usize, steps_total: usize, total_rows: usize) {
    log.metric(metric_names::STEPS_COMPLETED, steps_completed, json!({}));
    log.event(
        event_names::RUN_COMPLETE,
        json!({
            "steps_completed": steps_completed,
            "steps_total": steps_total,
            "total_rows": total_rows,
        }),
    );
    log.info(format!(
        "Pipeline completed: {}/{} steps, {} rows",
        steps_completed, steps_total, total_rows
    ));
    info!("Pipeline completed: {}/{} steps", steps_completed, steps_total);
}

pub fn run_failed(
    log: &mut RunLog,
    steps_completed: usize,
    steps_total: usize,
    error: &str,
    failed_step: Option<&str>,
) {
    log.metric(metric_names::STEPS_COMPLETED, steps_completed, json!({}));
    log.event(
        event_names::RUN_ERROR,
        json!({
            "error": error,
            "failed_step": failed_step,
            "steps_completed": steps_completed,
            "steps_total": steps_total,
        }),
    );
    log.error(format!("Pipeline failed: {}", error));
}
