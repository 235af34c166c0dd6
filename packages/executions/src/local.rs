// ABOUTME: Local execution adapter running the DAG runner in-process
// ABOUTME: Session logs and artifacts land under the execution context's logs directory

use crate::adapter::{
    default_resolver, prepare_run, ExecutionAdapter, PrepareInputs, ADAPTER_TARGET_KEY,
};
use crate::error::{CollectError, ExecuteError, PrepareError};
use crate::types::{
    CollectedArtifacts, CompiledPlan, Constraints, ExecResult, IoLayout, PreparedRun, StepResult,
};
use async_trait::async_trait;
use osiris_core::constants::{event_names, EVENTS_FILE, MANIFEST_FILE};
use osiris_core::{read_jsonl, DriverRegistry, ExecutionContext, RunLog};
use osiris_runner::{ConnectionResolver, DagRunner, StepOutcome};
use serde_json::Value;
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

pub const LOCAL_TARGET: &str = "local";
pub const FALLBACK_FAILURE_MESSAGE: &str = "Pipeline execution failed";

pub struct LocalAdapter {
    registry: Option<DriverRegistry>,
    resolver: Option<Arc<dyn ConnectionResolver>>,
}

impl LocalAdapter {
    /// Builtin drivers; connections from `osiris_connections.json` next to
    /// the manifest, falling back to `OSIRIS_CONN_*` variables
    pub fn new() -> Self {
        Self {
            registry: None,
            resolver: None,
        }
    }

    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    fn resolver_for(&self, cfg_root: &Path) -> Arc<dyn ConnectionResolver> {
        match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => default_resolver(cfg_root),
        }
    }
}

impl Default for LocalAdapter {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionAdapter for LocalAdapter {
    fn target(&self) -> &'static str {
        LOCAL_TARGET
    }

    async fn prepare(
        &self,
        plan: &CompiledPlan,
        ctx: &ExecutionContext,
    ) -> Result<PreparedRun, PrepareError> {
        let resolver = self.resolver_for(&plan.cfg_root);
        let logs_dir = ctx.logs_dir();
        prepare_run(
            plan,
            ctx,
            PrepareInputs {
                target: LOCAL_TARGET,
                io_layout: IoLayout::under(&logs_dir.to_string_lossy()),
                constraints: Constraints::unconstrained(),
                force_spill: false,
                install_deps: false,
                resolver: Some(resolver.as_ref()),
            },
        )
    }

    async fn execute(
        &self,
        prepared: PreparedRun,
        ctx: &ExecutionContext,
    ) -> Result<ExecResult, ExecuteError> {
        let started = Instant::now();
        ctx.ensure_dirs()?;
        let logs_dir = ctx.logs_dir();

        let manifest_path = logs_dir.join(MANIFEST_FILE);
        std::fs::write(&manifest_path, prepared.plan.manifest.to_json_pretty()?)?;

        let mut runner = DagRunner::new(&manifest_path, ctx.artifacts_dir())
            .with_cfg_root(&prepared.plan.cfg_root)
            .with_resolver(self.resolver_for(&prepared.plan.cfg_root));
        if let Some(registry) = &self.registry {
            runner = runner.with_registry(registry.clone());
        }
        let mut log = RunLog::create(ctx.session_id.clone(), &logs_dir)?;

        info!(
            "Running pipeline {} locally (session {})",
            prepared.run_params.pipeline_id, ctx.session_id
        );
        let outcome = tokio::task::spawn_blocking(move || runner.run(&mut log))
            .await
            .map_err(|e| ExecuteError::Aborted(e.to_string()))?;

        let (success, step_results) = match outcome {
            Ok(report) => (
                report.success,
                report.steps.iter().map(StepResult::from).collect(),
            ),
            Err(e) => {
                warn!("Pipeline could not run: {}", e);
                (false, Vec::new())
            }
        };

        let error_message = if success {
            None
        } else {
            let message = last_failure_message(&logs_dir.join(EVENTS_FILE))
                .unwrap_or_else(|| FALLBACK_FAILURE_MESSAGE.to_string());
            warn!(
                "Local run failed: {} (session logs in {})",
                message,
                logs_dir.display()
            );
            Some(message)
        };

        Ok(ExecResult {
            success,
            exit_code: if success { 0 } else { 1 },
            duration_seconds: started.elapsed().as_secs_f64(),
            error_message,
            step_results,
        })
    }

    async fn collect(&self, ctx: &ExecutionContext) -> Result<CollectedArtifacts, CollectError> {
        let logs_dir = ctx.logs_dir();
        let mut collected = CollectedArtifacts::scan(&logs_dir);
        collected.metadata.insert(
            ADAPTER_TARGET_KEY.to_string(),
            Value::String(LOCAL_TARGET.to_string()),
        );
        collected.metadata.insert(
            "session_id".to_string(),
            Value::String(ctx.session_id.clone()),
        );
        collected.metadata.insert(
            "logs_dir".to_string(),
            Value::String(logs_dir.display().to_string()),
        );
        Ok(collected)
    }
}

impl From<&StepOutcome> for StepResult {
    fn from(outcome: &StepOutcome) -> Self {
        Self {
            step_id: outcome.step_id.clone(),
            ok: outcome.ok(),
            rows: outcome.rows_processed,
            duration_ms: outcome.duration_ms,
            error: outcome.failure.as_ref().map(|f| f.error.clone()),
        }
    }
}

/// Message of the most recent `step_error` or `run_error` event
pub fn last_failure_message(events_path: &Path) -> Option<String> {
    let records = read_jsonl(events_path).ok()?;
    records
        .iter()
        .rev()
        .find(|r| {
            matches!(
                r.get("event").and_then(Value::as_str),
                Some(event_names::STEP_ERROR) | Some(event_names::RUN_ERROR)
            )
        })
        .and_then(|r| r.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}
