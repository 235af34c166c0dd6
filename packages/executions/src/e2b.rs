// ABOUTME: E2B execution adapter running the pipeline worker inside a remote sandbox
// ABOUTME: Ships a payload, polls the worker under a wall-clock timeout, and fetches the session back

use crate::adapter::{
    default_resolver, prepare_run, ExecutionAdapter, PrepareInputs, ADAPTER_TARGET_KEY,
};
use crate::config::{E2BConfig, API_KEY_VAR};
use crate::error::{CollectError, ExecuteError, PrepareError};
use crate::types::{
    CollectedArtifacts, CompiledPlan, Constraints, ExecResult, IoLayout, PreparedRun, StepResult,
};
use async_trait::async_trait;
use osiris_core::constants::{event_names, EVENTS_FILE, METRICS_FILE, STATUS_FILE};
use osiris_core::{read_jsonl, ExecutionContext, RunConfig, RunStatus};
use osiris_runner::{ConnectionRef, ConnectionResolver};
use osiris_sandbox::payload::BOOTSTRAP_FILE;
use osiris_sandbox::{
    validate_payload, BackoffPolicy, E2BTransport, E2BTransportConfig, FinalStatus,
    PayloadBuilder, SandboxClient, SandboxHandle, SandboxSpec, SandboxStatus, SandboxTransport,
    DEFAULT_INITIAL_INTERVAL, SANDBOX_HOME,
};
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

pub const E2B_TARGET: &str = "e2b";
/// Local subdirectory of the logs dir receiving the sandbox session
pub const REMOTE_DIR: &str = "remote";
/// Session directory inside the extracted payload
pub const REMOTE_SESSION_DIR: &str = "session";
const STAGING_DIR: &str = ".payload_staging";

/// Lifecycle of the sandbox behind one run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SandboxPhase {
    #[default]
    Uncreated,
    Created,
    PayloadUploaded,
    Running,
    Finished(SandboxStatus),
    Collected,
    Closed,
}

#[derive(Debug, Default)]
struct RunState {
    phase: SandboxPhase,
    /// Kept after close so `collect` can tell a run happened
    handle: Option<SandboxHandle>,
    final_status: Option<SandboxStatus>,
}

impl RunState {
    fn advance(&mut self, phase: SandboxPhase) {
        debug!("Sandbox phase {:?} -> {:?}", self.phase, phase);
        if let SandboxPhase::Finished(status) = phase {
            self.final_status = Some(status);
        }
        self.phase = phase;
    }
}

/// `<sandbox home>/<session_id>`, where the payload is extracted
pub fn remote_root(session_id: &str) -> String {
    format!("{}/{}", SANDBOX_HOME, session_id)
}

pub struct E2BAdapter {
    config: E2BConfig,
    transport: Option<Arc<dyn SandboxTransport>>,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    initial_interval: Duration,
    backoff: BackoffPolicy,
    state: Mutex<RunState>,
}

impl E2BAdapter {
    pub fn new(config: E2BConfig) -> Self {
        Self {
            config,
            transport: None,
            resolver: None,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
            backoff: BackoffPolicy::default(),
            state: Mutex::new(RunState::default()),
        }
    }

    /// Use this transport instead of the live E2B API
    pub fn with_transport(mut self, transport: Arc<dyn SandboxTransport>) -> Self {
        self.transport = Some(transport);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn with_poll_interval(mut self, interval: Duration, backoff: BackoffPolicy) -> Self {
        self.initial_interval = interval;
        self.backoff = backoff;
        self
    }

    pub fn config(&self) -> &E2BConfig {
        &self.config
    }

    pub async fn phase(&self) -> SandboxPhase {
        self.state.lock().await.phase
    }

    pub async fn sandbox_id(&self) -> Option<String> {
        let state = self.state.lock().await;
        state.handle.as_ref().map(|h| h.sandbox_id.clone())
    }

    async fn advance(&self, phase: SandboxPhase) {
        self.state.lock().await.advance(phase);
    }

    fn resolver_for(&self, cfg_root: &Path) -> Arc<dyn ConnectionResolver> {
        match &self.resolver {
            Some(resolver) => Arc::clone(resolver),
            None => default_resolver(cfg_root),
        }
    }

    fn transport(&self, api_key: &str) -> Result<Arc<dyn SandboxTransport>, ExecuteError> {
        if let Some(transport) = &self.transport {
            return Ok(Arc::clone(transport));
        }
        let mut config = E2BTransportConfig::new(api_key);
        if let Some(api_url) = &self.config.api_url {
            config.api_url = api_url.clone();
        }
        Ok(Arc::new(E2BTransport::new(config)?))
    }

    /// Configured pass-through variables plus one `OSIRIS_CONN_*` per connection
    fn sandbox_env(&self, prepared: &PreparedRun) -> Result<BTreeMap<String, String>, ExecuteError> {
        let mut env = self.config.env.clone();
        let resolver = self.resolver_for(&prepared.plan.cfg_root);
        for key in prepared.resolved_connections.keys() {
            let reference = ConnectionRef::parse(key)?;
            let descriptor = resolver.resolve(&reference)?;
            env.insert(reference.env_var_name(), descriptor.to_string());
        }
        Ok(env)
    }

    fn sandbox_spec(&self, prepared: &PreparedRun, env: BTreeMap<String, String>) -> SandboxSpec {
        let constraints = prepared.constraints;
        let mut metadata = BTreeMap::new();
        metadata.insert("session_id".to_string(), prepared.run_params.session_id.clone());
        metadata.insert("pipeline_id".to_string(), prepared.run_params.pipeline_id.clone());
        SandboxSpec {
            template: self.config.template.clone(),
            cpu: constraints.cpu.unwrap_or(self.config.cpu),
            memory_gb: constraints.memory_gb.unwrap_or(self.config.memory_gb),
            env,
            timeout_secs: constraints.timeout_secs.unwrap_or(self.config.timeout_secs),
            metadata,
        }
    }

    /// Payload upload through process exit; teardown is the caller's job
    async fn run_in_sandbox(
        &self,
        client: &SandboxClient,
        handle: &SandboxHandle,
        prepared: &PreparedRun,
        ctx: &ExecutionContext,
    ) -> Result<FinalStatus, ExecuteError> {
        let logs_dir = ctx.logs_dir();
        let root = remote_root(&ctx.session_id);

        let mut run_config = RunConfig::new(&ctx.session_id, &prepared.run_params.pipeline_id);
        run_config.session_dir = REMOTE_SESSION_DIR.to_string();
        run_config.sandbox_id = Some(handle.sandbox_id.clone());
        run_config.force_spill = prepared.run_params.force_spill;
        run_config.install_deps = prepared.run_params.install_deps;
        run_config.install_command = self.config.install_command.clone();

        let payload = PayloadBuilder::new(logs_dir.join(STAGING_DIR), &logs_dir)
            .with_requirements(self.config.requirements.clone())
            .build(&prepared.plan.manifest, &prepared.plan.cfg_root, &run_config)?;
        validate_payload(&payload.archive_path, &payload.manifest.sha256)?;

        client
            .upload_payload(handle, payload.read_archive()?, &root)
            .await?;
        self.advance(SandboxPhase::PayloadUploaded).await;

        let command = format!("sh {}/{}", root, BOOTSTRAP_FILE);
        let process = client.start(handle, &command).await?;
        self.advance(SandboxPhase::Running).await;

        let timeout = Duration::from_secs(
            prepared
                .constraints
                .timeout_secs
                .unwrap_or(self.config.timeout_secs),
        );
        let status = client
            .poll_until_complete(handle, &process, timeout, self.backoff)
            .await?;
        self.advance(SandboxPhase::Finished(status.status)).await;
        Ok(status)
    }
}

#[async_trait]
impl ExecutionAdapter for E2BAdapter {
    fn target(&self) -> &'static str {
        E2B_TARGET
    }

    async fn prepare(
        &self,
        plan: &CompiledPlan,
        ctx: &ExecutionContext,
    ) -> Result<PreparedRun, PrepareError> {
        let resolver = self.resolver_for(&plan.cfg_root);
        let session_dir = format!("{}/{}", remote_root(&ctx.session_id), REMOTE_SESSION_DIR);
        prepare_run(
            plan,
            ctx,
            PrepareInputs {
                target: E2B_TARGET,
                io_layout: IoLayout::under(&session_dir),
                constraints: Constraints {
                    cpu: Some(self.config.cpu),
                    memory_gb: Some(self.config.memory_gb),
                    timeout_secs: Some(self.config.timeout_secs),
                },
                force_spill: self.config.force_spill,
                install_deps: self.config.install_deps,
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
        let api_key = self
            .config
            .api_key
            .as_deref()
            .filter(|k| !k.is_empty())
            .ok_or(ExecuteError::MissingCredential(API_KEY_VAR))?;
        let client =
            SandboxClient::new(self.transport(api_key)?).with_initial_interval(self.initial_interval);

        ctx.ensure_dirs()?;
        let env = self.sandbox_env(&prepared)?;
        let handle = client.create(&self.sandbox_spec(&prepared, env)).await?;
        info!(
            "Created sandbox {} for pipeline {} (session {})",
            handle.sandbox_id, prepared.run_params.pipeline_id, ctx.session_id
        );
        {
            let mut state = self.state.lock().await;
            state.handle = Some(handle.clone());
            state.advance(SandboxPhase::Created);
        }

        let outcome = self.run_in_sandbox(&client, &handle, &prepared, ctx).await;

        let local_remote = ctx.logs_dir().join(REMOTE_DIR);
        if outcome.is_ok() {
            let download = client
                .download_artifacts(&handle, &prepared.io_layout.session_dir, &local_remote)
                .await;
            if !download.failures.is_empty() {
                warn!(
                    "{} sandbox files could not be downloaded into {}",
                    download.failures.len(),
                    local_remote.display()
                );
            }
            self.advance(SandboxPhase::Collected).await;
        }

        match client.close(&handle).await {
            Ok(()) => self.advance(SandboxPhase::Closed).await,
            Err(e) => warn!("Failed to close sandbox {}: {}", handle.sandbox_id, e),
        }

        let status = outcome?;
        let success = status.status == SandboxStatus::Success;
        let error_message = if success {
            None
        } else {
            let message = failure_message(&status, &local_remote);
            warn!(
                "Sandbox run failed: {} (remote session in {})",
                message,
                local_remote.display()
            );
            Some(message)
        };

        Ok(ExecResult {
            success,
            exit_code: if success { 0 } else { status.exit_code.unwrap_or(1) },
            duration_seconds: started.elapsed().as_secs_f64(),
            error_message,
            step_results: step_results_from_events(&local_remote.join(EVENTS_FILE)),
        })
    }

    async fn collect(&self, ctx: &ExecutionContext) -> Result<CollectedArtifacts, CollectError> {
        let (sandbox_id, final_status) = {
            let state = self.state.lock().await;
            let handle = state.handle.as_ref().ok_or(CollectError::NoSandbox)?;
            (handle.sandbox_id.clone(), state.final_status)
        };

        let remote = ctx.logs_dir().join(REMOTE_DIR);
        for name in [EVENTS_FILE, METRICS_FILE] {
            let path = remote.join(name);
            if !path.is_file() {
                continue;
            }
            match tag_jsonl(&path, "remote") {
                Ok(count) => debug!("Tagged {} records in {}", count, path.display()),
                Err(e) => warn!("Could not tag {}: {}", path.display(), e),
            }
        }

        let mut collected = CollectedArtifacts::scan(&remote);
        let metadata = &mut collected.metadata;
        metadata.insert(
            ADAPTER_TARGET_KEY.to_string(),
            Value::String(E2B_TARGET.to_string()),
        );
        metadata.insert("sandbox_id".to_string(), Value::String(sandbox_id));
        metadata.insert(
            "session_id".to_string(),
            Value::String(ctx.session_id.clone()),
        );
        metadata.insert(
            "remote_dir".to_string(),
            Value::String(remote.display().to_string()),
        );
        if let Some(status) = final_status {
            metadata.insert("final_status".to_string(), Value::String(status.to_string()));
        }
        Ok(collected)
    }
}

fn failure_message(status: &FinalStatus, local_remote: &Path) -> String {
    if status.status == SandboxStatus::Timeout {
        return format!(
            "Sandbox execution timed out after {:.1}s",
            status.duration_seconds
        );
    }
    let code = status.exit_code.unwrap_or(1);
    let stderr = status.stderr.trim();
    let detail = if stderr.is_empty() {
        RunStatus::read_from(local_remote.join(STATUS_FILE))
            .map(|s| s.reason)
            .unwrap_or_default()
    } else {
        stderr.to_string()
    };
    if detail.is_empty() {
        format!("Sandbox process exited with code {}", code)
    } else {
        format!("Sandbox process exited with code {}: {}", code, detail)
    }
}

/// Per-step results from a downloaded event stream; empty when it is missing
fn step_results_from_events(events_path: &Path) -> Vec<StepResult> {
    let Ok(records) = read_jsonl(events_path) else {
        return Vec::new();
    };
    records
        .iter()
        .filter_map(|record| {
            let event = record.get("event").and_then(Value::as_str)?;
            let step_id = record.get("step_id").and_then(Value::as_str)?.to_string();
            let count = |key: &str| record.get(key).and_then(Value::as_u64).unwrap_or(0);
            match event {
                event_names::STEP_COMPLETE => Some(StepResult {
                    step_id,
                    ok: true,
                    rows: count("rows") as usize,
                    duration_ms: count("duration_ms"),
                    error: None,
                }),
                event_names::STEP_FAILED => Some(StepResult {
                    step_id,
                    ok: false,
                    rows: 0,
                    duration_ms: count("duration_ms"),
                    error: record
                        .get("error")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                }),
                _ => None,
            }
        })
        .collect()
}

/// Add `"source": <source>` to every JSON object line of a JSONL file.
///
/// Lines that are not JSON objects are kept as they are. Returns the number
/// of tagged records.
pub fn tag_jsonl(path: &Path, source: &str) -> std::io::Result<usize> {
    let text = std::fs::read_to_string(path)?;
    let mut tagged = 0;
    let mut out = String::with_capacity(text.len() + 32);
    for line in text.lines() {
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(mut map)) => {
                map.insert("source".to_string(), Value::String(source.to_string()));
                out.push_str(&Value::Object(map).to_string());
                tagged += 1;
            }
            _ => out.push_str(line),
        }
        out.push('\n');
    }

    let tmp = path.with_extension("jsonl.tmp");
    std::fs::write(&tmp, out)?;
    std::fs::rename(&tmp, path)?;
    Ok(tagged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_tag_jsonl_passes_corrupt_lines_through() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(EVENTS_FILE);
        std::fs::write(
            &path,
            "{\"event\": \"run_start\"}\nnot json {\n{\"event\": \"run_complete\", \"source\": \"x\"}\n",
        )
        .unwrap();

        assert_eq!(tag_jsonl(&path, "remote").unwrap(), 2);

        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[1], "not json {");
        let first: Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first, json!({"event": "run_start", "source": "remote"}));
        let last: Value = serde_json::from_str(lines[2]).unwrap();
        assert_eq!(last["source"], "remote");
    }

    #[test]
    fn test_step_results_from_events() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join(EVENTS_FILE);
        std::fs::write(
            &path,
            [
                json!({"event": "step_start", "step_id": "a"}),
                json!({"event": "step_complete", "step_id": "a", "rows": 3, "duration_ms": 5}),
                json!({"event": "step_failed", "step_id": "b", "error": "boom"}),
            ]
            .iter()
            .map(Value::to_string)
            .collect::<Vec<_>>()
            .join("\n"),
        )
        .unwrap();

        let results = step_results_from_events(&path);
        assert_eq!(results.len(), 2);
        assert_eq!(results[0].rows, 3);
        assert!(results[0].ok);
        assert_eq!(results[1].error.as_deref(), Some("boom"));
        assert!(step_results_from_events(&tmp.path().join("missing.jsonl")).is_empty());
    }

    #[test]
    fn test_failure_message_prefers_stderr_then_status_reason() {
        let tmp = tempfile::tempdir().unwrap();
        let mut status = FinalStatus {
            status: SandboxStatus::Failed,
            exit_code: Some(3),
            duration_seconds: 1.0,
            stdout: String::new(),
            stderr: "Pipeline failed: boom\n".to_string(),
        };
        assert_eq!(
            failure_message(&status, tmp.path()),
            "Sandbox process exited with code 3: Pipeline failed: boom"
        );

        status.stderr.clear();
        assert_eq!(
            failure_message(&status, tmp.path()),
            "Sandbox process exited with code 3"
        );

        RunStatus::from_counts(None, 0, 2, Some("step extract failed".to_string()))
            .write_to(tmp.path().join(STATUS_FILE))
            .unwrap();
        assert_eq!(
            failure_message(&status, tmp.path()),
            "Sandbox process exited with code 3: step extract failed"
        );
    }

    #[tokio::test]
    async fn test_collect_without_sandbox_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let ctx = ExecutionContext::new("s1", tmp.path());
        let adapter = E2BAdapter::new(E2BConfig::default());

        assert!(matches!(
            adapter.collect(&ctx).await,
            Err(CollectError::NoSandbox)
        ));
        assert_eq!(adapter.phase().await, SandboxPhase::Uncreated);
    }

    #[tokio::test]
    async fn test_prepare_uses_sandbox_paths_and_configured_constraints() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("cfg")).unwrap();
        std::fs::write(tmp.path().join("cfg/a.json"), "{}").unwrap();
        let manifest = serde_json::from_value(json!({
            "pipeline": {"id": "p", "name": "p"},
            "steps": [{"id": "a", "driver": "x.extractor", "cfg_path": "cfg/a.json"}]
        }))
        .unwrap();
        let plan = CompiledPlan::new(manifest, tmp.path());
        let ctx = ExecutionContext::new("s1", tmp.path().join("out"));
        let config = E2BConfig {
            cpu: 4,
            ..E2BConfig::default()
        };

        let prepared = E2BAdapter::new(config).prepare(&plan, &ctx).await.unwrap();
        assert_eq!(prepared.io_layout.session_dir, "/home/user/s1/session");
        assert_eq!(prepared.constraints.cpu, Some(4));
        assert_eq!(prepared.constraints.timeout_secs, Some(900));
        assert_eq!(prepared.metadata[ADAPTER_TARGET_KEY], "e2b");
    }
}
