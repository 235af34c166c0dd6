// ABOUTME: Batch host that drives the proxy worker through a whole pipeline
// ABOUTME: Emits the run-level events so the sandbox stream matches an in-process run

use crate::error::Result;
use crate::protocol::{Command, Response};
use crate::worker::ProxyWorker;
use osiris_core::Manifest;
use osiris_runner::lifecycle::{run_completed, run_failed, run_started};
use osiris_runner::{derive_inputs, topological_order};
use tracing::{info, warn};

/// Outcome of a batch run
#[derive(Debug, Clone, PartialEq)]
pub struct BatchReport {
    pub success: bool,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub total_rows: usize,
    pub failed_step: Option<String>,
    pub error: Option<String>,
}

impl BatchReport {
    fn failed(steps_total: usize, error: String) -> Self {
        Self {
            success: false,
            steps_completed: 0,
            steps_total,
            total_rows: 0,
            failed_step: None,
            error: Some(error),
        }
    }

    pub fn exit_code(&self) -> i32 {
        if self.success {
            0
        } else {
            1
        }
    }
}

/// `prepare`, one `exec_step` per step in dependency order, then `cleanup`.
///
/// Stops at the first failed step. Every command's response is written to
/// the worker's output stream.
pub fn run_batch(
    worker: &mut ProxyWorker,
    session_id: &str,
    manifest: &Manifest,
) -> Result<BatchReport> {
    let steps_total = manifest.steps.len();
    let prepared = worker.dispatch(Command::Prepare {
        session_id: session_id.to_string(),
        manifest: manifest.clone(),
        install_deps: None,
    })?;
    if let Response::Error { error, .. } = prepared {
        warn!("Prepare failed: {}", error);
        worker.dispatch(Command::Cleanup {})?;
        return Ok(BatchReport::failed(steps_total, error));
    }

    let order = match topological_order(manifest) {
        Ok(order) => order,
        Err(e) => {
            if let Some(session) = worker.session_mut() {
                session.fail(e.to_string());
                run_failed(session.log_mut(), 0, steps_total, &e.to_string(), None);
            }
            worker.dispatch(Command::Cleanup {})?;
            return Ok(BatchReport::failed(steps_total, e.to_string()));
        }
    };

    if let Some(session) = worker.session_mut() {
        run_started(session.log_mut(), manifest);
    }

    let mut steps_completed = 0;
    let mut failure: Option<(String, String)> = None;
    for step_id in &order {
        let Some(step) = manifest.step(step_id) else {
            continue;
        };
        let inputs = derive_inputs(step, manifest, worker.registry());
        let response = worker.dispatch(Command::ExecStep {
            step_id: step.id.clone(),
            driver: step.driver.clone(),
            cfg_path: step.cfg_path.clone(),
            inputs,
        })?;

        match response {
            Response::StepResult(result) if result.ok => steps_completed += 1,
            Response::StepResult(result) => {
                let error = result
                    .error
                    .unwrap_or_else(|| format!("step {} failed", step.id));
                failure = Some((step.id.clone(), error));
                break;
            }
            Response::Error { error, .. } => {
                failure = Some((step.id.clone(), error));
                break;
            }
            other => {
                failure = Some((step.id.clone(), format!("unexpected response: {:?}", other)));
                break;
            }
        }
    }

    let total_rows = worker.session().map(|s| s.total_rows()).unwrap_or(0);
    if let Some(session) = worker.session_mut() {
        match &failure {
            Some((step_id, error)) => {
                session.fail(format!("step {} failed: {}", step_id, error));
                run_failed(
                    session.log_mut(),
                    steps_completed,
                    steps_total,
                    error,
                    Some(step_id),
                );
            }
            None => run_completed(session.log_mut(), steps_completed, steps_total, total_rows),
        }
    }

    worker.dispatch(Command::Cleanup {})?;

    let success = failure.is_none() && steps_completed == steps_total;
    info!(
        "Batch run finished: {}/{} steps, success={}",
        steps_completed, steps_total, success
    );
    let (failed_step, error) = match failure {
        Some((step_id, error)) => (Some(step_id), Some(error)),
        None => (None, None),
    };
    Ok(BatchReport {
        success,
        steps_completed,
        steps_total,
        total_rows,
        failed_step,
        error,
    })
}
