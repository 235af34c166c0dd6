// ABOUTME: Execution adapter contract shared by the local and E2B targets
// ABOUTME: prepare builds a PreparedRun, execute runs it once, collect gathers the artifacts

use crate::error::{CollectError, ExecuteError, PrepareError};
use crate::types::{
    CollectedArtifacts, CompiledPlan, Constraints, ExecResult, IoLayout, PreparedRun, RunParams,
};
use async_trait::async_trait;
use osiris_core::{mask_secrets, ExecutionContext};
use osiris_runner::connections::CONNECTIONS_FILE;
use osiris_runner::{
    build_cfg_index, referenced_connections, topological_order, ConnectionError,
    ConnectionResolver, EnvConnections, FileConnections,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, warn};

pub const ADAPTER_TARGET_KEY: &str = "adapter_target";

/// One execution target.
///
/// A run calls `prepare`, then `execute` with its result, then `collect`,
/// all with the same [`ExecutionContext`].
#[async_trait]
pub trait ExecutionAdapter: Send + Sync {
    /// Target name used by the factory (`local`, `e2b`)
    fn target(&self) -> &'static str;

    /// Validate the plan and describe the run without executing anything.
    ///
    /// Creates the context's directories and nothing else.
    async fn prepare(
        &self,
        plan: &CompiledPlan,
        ctx: &ExecutionContext,
    ) -> Result<PreparedRun, PrepareError>;

    /// Perform the run. Pipeline failures come back as an unsuccessful
    /// [`ExecResult`]; errors mean the run could not be carried out.
    async fn execute(
        &self,
        prepared: PreparedRun,
        ctx: &ExecutionContext,
    ) -> Result<ExecResult, ExecuteError>;

    /// Locate (and for remote runs, post-process) what the run produced
    async fn collect(
        &self,
        ctx: &ExecutionContext,
    ) -> Result<CollectedArtifacts, CollectError>;
}

/// `osiris_connections.json` next to the manifest, else `OSIRIS_CONN_*` variables
pub(crate) fn default_resolver(cfg_root: &Path) -> Arc<dyn ConnectionResolver> {
    let file = cfg_root.join(CONNECTIONS_FILE);
    if file.is_file() {
        match FileConnections::load(&file) {
            Ok(connections) => return Arc::new(connections),
            Err(e) => warn!("Ignoring unreadable {}: {}", file.display(), e),
        }
    }
    Arc::new(EnvConnections)
}

/// Target-independent half of `prepare`
pub(crate) struct PrepareInputs<'a> {
    pub target: &'static str,
    pub io_layout: IoLayout,
    pub constraints: Constraints,
    pub force_spill: bool,
    pub install_deps: bool,
    pub resolver: Option<&'a dyn ConnectionResolver>,
}

pub(crate) fn prepare_run(
    plan: &CompiledPlan,
    ctx: &ExecutionContext,
    inputs: PrepareInputs<'_>,
) -> Result<PreparedRun, PrepareError> {
    let manifest = &plan.manifest;
    if manifest.steps.is_empty() {
        return Err(PrepareError::InvalidPlan(format!(
            "pipeline '{}' has no steps",
            manifest.pipeline.id
        )));
    }
    manifest.validate()?;
    topological_order(manifest)?;

    let cfg_index = build_cfg_index(manifest)?;
    let resolved_connections = resolve_masked(plan, inputs.resolver)?;

    ctx.ensure_dirs()?;

    let mut metadata = BTreeMap::new();
    metadata.insert(ADAPTER_TARGET_KEY.to_string(), inputs.target.to_string());
    metadata.insert("pipeline_name".to_string(), manifest.pipeline.name.clone());

    debug!(
        "Prepared {} run for pipeline {} ({} steps, {} connections)",
        inputs.target,
        manifest.pipeline.id,
        manifest.steps.len(),
        resolved_connections.len()
    );

    Ok(PreparedRun {
        plan: plan.clone(),
        resolved_connections,
        cfg_index,
        io_layout: inputs.io_layout,
        run_params: RunParams {
            session_id: ctx.session_id.clone(),
            pipeline_id: manifest.pipeline.id.clone(),
            steps_total: manifest.steps.len(),
            force_spill: inputs.force_spill,
            install_deps: inputs.install_deps,
        },
        constraints: inputs.constraints,
        metadata,
    })
}

fn resolve_masked(
    plan: &CompiledPlan,
    resolver: Option<&dyn ConnectionResolver>,
) -> Result<BTreeMap<String, Value>, PrepareError> {
    let references = referenced_connections(&plan.manifest, &plan.cfg_root)?;
    let mut resolved = BTreeMap::new();
    for reference in references {
        let resolver =
            resolver.ok_or_else(|| ConnectionError::NoResolver(reference.to_string()))?;
        let descriptor = resolver.resolve(&reference)?;
        resolved.insert(reference.to_string(), mask_secrets(&descriptor));
    }
    Ok(resolved)
}
