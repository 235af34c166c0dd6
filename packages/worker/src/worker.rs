// ABOUTME: Proxy worker that executes pipeline steps inside the sandbox
// ABOUTME: Reads one JSON command per line and writes exactly one JSON response per command

use crate::config::WorkerConfig;
use crate::deps::{ensure_dependencies, DependencyProbe, PathProbe};
use crate::error::{Result, WorkerError};
use crate::protocol::{event_names, timestamp, Command, Response, StepResult};
use crate::session::Session;
use osiris_core::constants::{REQUIREMENTS_FILE, STATUS_FILE};
use osiris_core::{DriverRegistry, InputRef, Manifest, RunLog, RunStatus, StreamWriter};
use osiris_runner::{
    builtin_registry, execute_step, materialize, ConnectionResolver, EnvConnections, StepError,
    StepSetup,
};
use serde_json::json;
use std::collections::BTreeMap;
use std::io::BufRead;
use std::sync::Arc;
use tracing::{debug, info, warn};

const MAX_ECHOED_LINE: usize = 200;

pub struct ProxyWorker {
    config: WorkerConfig,
    registry: DriverRegistry,
    probe: Box<dyn DependencyProbe>,
    resolver: Option<Arc<dyn ConnectionResolver>>,
    out: StreamWriter,
    session: Option<Session>,
    /// Why the last `prepare` failed; becomes the status reason if no session follows
    prepare_failure: Option<String>,
}

impl ProxyWorker {
    /// Worker with the builtin drivers, a `PATH` probe, and connections from
    /// `OSIRIS_CONN_*` variables. Responses and mirrored events go to `out`.
    pub fn new(config: WorkerConfig, out: StreamWriter) -> Self {
        let mut probe = PathProbe::new().with_requirements(config.cfg_root.join(REQUIREMENTS_FILE));
        if let Some(command) = &config.install_command {
            probe = probe.with_install_command(command.clone());
        }
        Self {
            config,
            registry: builtin_registry(),
            probe: Box::new(probe),
            resolver: Some(Arc::new(EnvConnections)),
            out,
            session: None,
            prepare_failure: None,
        }
    }

    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_probe(mut self, probe: impl DependencyProbe + 'static) -> Self {
        self.probe = Box::new(probe);
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    pub fn session(&self) -> Option<&Session> {
        self.session.as_ref()
    }

    pub(crate) fn session_mut(&mut self) -> Option<&mut Session> {
        self.session.as_mut()
    }

    /// Process commands until the input is exhausted; returns how many were handled
    pub fn serve<R: BufRead>(&mut self, input: R) -> Result<usize> {
        let mut handled = 0;
        for line in input.lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let response = self.handle_line(&line);
            self.write_response(&response)?;
            handled += 1;
        }
        info!("Input closed after {} commands", handled);
        Ok(handled)
    }

    /// Decode and handle one protocol line without writing the response
    pub fn handle_line(&mut self, line: &str) -> Response {
        match serde_json::from_str::<Command>(line) {
            Ok(command) => self.handle(command),
            Err(e) => {
                let echoed: String = line.chars().take(MAX_ECHOED_LINE).collect();
                Response::error(
                    WorkerError::InvalidCommand(e.to_string()).to_string(),
                    json!({"line": echoed}),
                )
            }
        }
    }

    /// Handle a command and write its response to the output stream
    pub fn dispatch(&mut self, command: Command) -> Result<Response> {
        let response = self.handle(command);
        self.write_response(&response)?;
        Ok(response)
    }

    pub fn handle(&mut self, command: Command) -> Response {
        let name = command.name();
        debug!("Handling {}", name);
        let result = match command {
            Command::Prepare {
                session_id,
                manifest,
                install_deps,
            } => self.prepare(session_id, manifest, install_deps),
            Command::ExecStep {
                step_id,
                driver,
                cfg_path,
                inputs,
            } => self.exec_step(&step_id, &driver, &cfg_path, &inputs),
            Command::Cleanup {} => Ok(self.cleanup()),
            Command::Ping { data } => Ok(Response::Pong {
                data,
                timestamp: timestamp(),
            }),
        };

        result.unwrap_or_else(|e| {
            warn!("{} failed: {}", name, e);
            Response::error(e.to_string(), json!({"cmd": name}))
        })
    }

    fn write_response(&self, response: &Response) -> Result<()> {
        self.out.write_message(&serde_json::to_value(response)?)?;
        Ok(())
    }

    fn prepare(
        &mut self,
        session_id: String,
        manifest: Manifest,
        install_deps: Option<bool>,
    ) -> Result<Response> {
        if let Some(active) = &self.session {
            return Err(WorkerError::SessionActive(active.id().to_string()));
        }
        if let Err(e) = manifest.validate() {
            self.prepare_failure = Some(e.to_string());
            return Err(e.into());
        }

        let log = RunLog::create(&session_id, &self.config.session_dir)?
            .with_mirror(self.out.clone());
        let mut session = Session::new(&session_id, manifest, log, self.config.force_spill);
        let drivers = session.manifest().driver_names();

        let required: Vec<String> = drivers
            .iter()
            .filter_map(|name| self.registry.get(name).ok())
            .flat_map(|driver| driver.required_modules())
            .collect();
        let install = install_deps.unwrap_or(self.config.install_deps);
        if let Err(e) = ensure_dependencies(self.probe.as_ref(), &required, install) {
            let log = session.log_mut();
            log.event(
                event_names::DEPENDENCY_CHECK_FAILED,
                json!({"error": e.to_string()}),
            );
            log.error(e.to_string());
            log.flush();
            self.prepare_failure = Some(e.to_string());
            return Err(e);
        }

        let mut loaded = Vec::new();
        for name in &drivers {
            match self.registry.get(name) {
                Ok(_) => {
                    session
                        .log_mut()
                        .event(event_names::DRIVER_REGISTERED, json!({"driver": name}));
                    loaded.push(name.clone());
                }
                Err(e) => {
                    warn!("Driver {} unavailable: {}", name, e);
                    session.log_mut().event(
                        event_names::DRIVER_REGISTRATION_FAILED,
                        json!({"driver": name, "error": e.to_string()}),
                    );
                }
            }
        }

        let steps_total = session.steps_total();
        session.log_mut().event(
            event_names::SESSION_INITIALIZED,
            json!({
                "session_id": session_id,
                "steps_total": steps_total,
                "drivers_loaded": loaded,
                "force_spill": self.config.force_spill,
            }),
        );
        info!(
            "Session {} initialized with {} drivers",
            session_id,
            loaded.len()
        );

        let session_dir = session.dir().display().to_string();
        self.prepare_failure = None;
        self.session = Some(session);
        Ok(Response::Prepared {
            session_id,
            session_dir,
            drivers_loaded: loaded,
            timestamp: timestamp(),
        })
    }

    fn exec_step(
        &mut self,
        step_id: &str,
        driver_name: &str,
        cfg_path: &str,
        inputs: &BTreeMap<String, InputRef>,
    ) -> Result<Response> {
        let session = self.session.as_mut().ok_or(WorkerError::NoSession)?;
        let registry = &self.registry;
        let resolver = self.resolver.as_deref();
        let cfg_root = self.config.cfg_root.as_path();
        let role = registry.role_of(driver_name);
        let artifacts_dir = session.artifacts_dir();

        let (log, cache) = session.log_and_cache();
        let mut outcome = execute_step(
            log,
            &artifacts_dir,
            step_id,
            driver_name,
            role,
            |log| {
                let materialized = materialize(cfg_root, step_id, cfg_path, resolver)
                    .map_err(|e| StepError::Setup(e.to_string()))?;
                log.event(
                    event_names::CONFIG_LOADED,
                    json!({
                        "step_id": step_id,
                        "sha256": materialized.sha256,
                        "keys": materialized.keys,
                    }),
                );
                let driver = registry
                    .get(driver_name)
                    .map_err(StepError::DriverNotFound)?;
                Ok(StepSetup {
                    driver,
                    config: materialized.config,
                })
            },
            inputs,
            cache,
        );

        session.record(&outcome);
        let outputs = if outcome.ok() {
            let produced = std::mem::take(&mut outcome.outputs);
            if let Err(e) = session.cache_mut().insert(step_id, produced) {
                warn!("Spill of step {} failed, keeping it in memory: {}", step_id, e);
                session
                    .log_mut()
                    .warn(format!("Spill of step {} failed: {}", step_id, e));
            }
            session
                .cache()
                .describe(step_id)
                .unwrap_or_else(|| json!({}))
        } else {
            json!({})
        };

        let failure = outcome.failure.as_ref();
        Ok(Response::StepResult(StepResult {
            step_id: step_id.to_string(),
            ok: outcome.ok(),
            rows_processed: outcome.rows_processed,
            rows_read: outcome.rows_read,
            rows_written: outcome.rows_written,
            duration_ms: outcome.duration_ms,
            outputs,
            error: failure.map(|f| f.error.clone()),
            error_type: failure.map(|f| f.error_type.clone()),
            traceback: failure.map(|f| f.traceback.clone()),
        }))
    }

    /// Finish the session. The status file is written on every path.
    fn cleanup(&mut self) -> Response {
        let status_path = self.config.session_dir.join(STATUS_FILE);
        let sandbox_id = self.config.sandbox_id.clone();

        let (session_id, steps_executed, steps_completed, total_rows, status) =
            match self.session.take() {
                Some(mut session) => {
                    let total_rows = session.total_rows();
                    let steps_executed = session.steps_executed();
                    let steps_completed = session.steps_completed();
                    let status = RunStatus::from_counts(
                        sandbox_id,
                        steps_completed,
                        session.steps_total(),
                        session.failure().map(str::to_string),
                    );

                    session.cache_mut().clear();
                    let log = session.log_mut();
                    log.event(
                        event_names::CLEANUP_COMPLETE,
                        json!({"steps_executed": steps_executed, "total_rows": total_rows}),
                    );
                    if let Err(e) = log.touch_metrics() {
                        warn!("Failed to create metrics file: {}", e);
                    }
                    log.flush();
                    (
                        Some(session.id().to_string()),
                        steps_executed,
                        steps_completed,
                        total_rows,
                        status,
                    )
                }
                None => {
                    let reason = self
                        .prepare_failure
                        .take()
                        .unwrap_or_else(|| "session was never prepared".to_string());
                    if let Err(e) = std::fs::create_dir_all(&self.config.session_dir) {
                        warn!("Failed to create session dir: {}", e);
                    }
                    (None, 0, 0, 0, RunStatus::from_counts(sandbox_id, 0, 0, Some(reason)))
                }
            };

        if let Err(e) = status.write_to(&status_path) {
            warn!("Failed to write {}: {}", status_path.display(), e);
        }
        info!(
            "Cleanup complete: {} steps executed, {} rows",
            steps_executed, total_rows
        );

        Response::CleanupComplete {
            session_id,
            steps_executed,
            steps_completed,
            total_rows,
            status_path: status_path.display().to_string(),
            timestamp: timestamp(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result as WorkerResult;
    use osiris_core::testing::{FailingDriver, StubExtractor, StubWriter};
    use osiris_core::{read_jsonl, Driver, DriverContext, DriverError, SharedBuffer, StepInputs, StepOutputs};
    use pretty_assertions::assert_eq;
    use serde_json::Value;
    use std::io::Cursor;
    use std::path::Path;

    struct AllPresent;

    impl DependencyProbe for AllPresent {
        fn is_available(&self, _module: &str) -> bool {
            true
        }

        fn install(&self, _missing: &[String]) -> WorkerResult<()> {
            Ok(())
        }
    }

    struct NothingPresent;

    impl DependencyProbe for NothingPresent {
        fn is_available(&self, _module: &str) -> bool {
            false
        }

        fn install(&self, _missing: &[String]) -> WorkerResult<()> {
            Err(WorkerError::InstallFailed("offline".to_string()))
        }
    }

    /// Writer that needs an external client binary
    struct NeedsClient;

    impl Driver for NeedsClient {
        fn run(
            &self,
            _step_id: &str,
            _config: &Value,
            _inputs: &StepInputs,
            _ctx: &mut DriverContext<'_>,
        ) -> std::result::Result<StepOutputs, DriverError> {
            Ok(StepOutputs::new())
        }

        fn required_modules(&self) -> Vec<String> {
            vec!["pg_client".to_string()]
        }
    }

    fn registry() -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register("stub.extractor", Arc::new(StubExtractor::new(3)));
        registry.register("stub.writer", Arc::new(StubWriter::default()) as Arc<dyn Driver>);
        registry.register("bad.extractor", Arc::new(FailingDriver::new("connection refused")));
        registry.register("pg.writer", Arc::new(NeedsClient));
        registry
    }

    fn payload_dir(dir: &Path) {
        std::fs::create_dir_all(dir.join("cfg")).unwrap();
        std::fs::write(
            dir.join("cfg/extract.json"),
            r#"{"component": "stub", "rows": 4, "password": "s3cret"}"#,
        )
        .unwrap();
        std::fs::write(dir.join("cfg/write.json"), r#"{"table": "out"}"#).unwrap();
    }

    fn worker(dir: &Path, force_spill: bool) -> (ProxyWorker, SharedBuffer) {
        payload_dir(dir);
        let buffer = SharedBuffer::new();
        let config = WorkerConfig::new(dir).with_force_spill(force_spill);
        let worker = ProxyWorker::new(config, StreamWriter::new(buffer.clone()))
            .with_registry(registry())
            .with_probe(AllPresent);
        (worker, buffer)
    }

    fn prepare_line(drivers: &[(&str, &str)]) -> String {
        let steps: Vec<Value> = drivers
            .iter()
            .map(|(id, driver)| json!({"id": id, "driver": driver, "cfg_path": format!("cfg/{}.json", id)}))
            .collect();
        json!({
            "cmd": "prepare",
            "session_id": "sess-1",
            "manifest": {"pipeline": {"id": "p", "name": "p"}, "steps": steps},
        })
        .to_string()
    }

    fn exec_line(step_id: &str, driver: &str, inputs: Value) -> String {
        json!({
            "cmd": "exec_step",
            "step_id": step_id,
            "driver": driver,
            "cfg_path": format!("cfg/{}.json", step_id),
            "inputs": inputs,
        })
        .to_string()
    }

    #[test]
    fn test_serve_runs_a_session_end_to_end() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, buffer) = worker(tmp.path(), false);
        let input = [
            prepare_line(&[("extract", "stub.extractor"), ("write", "stub.writer")]),
            exec_line("extract", "stub.extractor", json!({})),
            exec_line("write", "stub.writer", json!({"df": {"from_step": "extract", "key": "df"}})),
            r#"{"cmd": "ping", "data": {"n": 1}}"#.to_string(),
            r#"{"cmd": "cleanup"}"#.to_string(),
        ]
        .join("\n");

        let handled = worker.serve(Cursor::new(input)).unwrap();
        assert_eq!(handled, 5);

        let responses: Vec<Value> = buffer
            .lines()
            .into_iter()
            .filter(|m| m["type"] != "event" && m["type"] != "metric")
            .collect();
        let types: Vec<&str> = responses.iter().map(|r| r["type"].as_str().unwrap()).collect();
        assert_eq!(
            types,
            vec!["prepared", "step_result", "step_result", "pong", "cleanup_complete"]
        );
        assert_eq!(responses[1]["rows_read"], 4);
        assert_eq!(responses[1]["outputs"]["df"]["rows"], 4);
        assert_eq!(responses[2]["rows_written"], 4);
        assert_eq!(responses[3]["data"], json!({"n": 1}));
        assert_eq!(responses[4]["total_rows"], 4);

        let session_dir = tmp.path().join("session");
        let status = RunStatus::read_from(session_dir.join(STATUS_FILE)).unwrap();
        assert!(status.ok);
        assert_eq!(status.steps_completed, 2);

        let events = read_jsonl(session_dir.join("events.jsonl")).unwrap();
        let config_loaded = events
            .iter()
            .find(|e| e["event"] == event_names::CONFIG_LOADED)
            .unwrap();
        assert_eq!(config_loaded["keys"], json!(["component", "password", "rows"]));
        assert!(!config_loaded.to_string().contains("s3cret"));

        let cleaned = std::fs::read_to_string(session_dir.join("artifacts/extract/cleaned_config.json"))
            .unwrap();
        assert!(cleaned.contains("***MASKED***"));
        assert!(!cleaned.contains("component"));
    }

    #[test]
    fn test_step_failure_is_reported_and_loop_continues() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, _buffer) = worker(tmp.path(), false);
        worker.handle_line(&prepare_line(&[("extract", "bad.extractor")]));

        let response = worker.handle_line(&exec_line("extract", "bad.extractor", json!({})));
        match response {
            Response::StepResult(result) => {
                assert!(!result.ok);
                assert_eq!(result.error.as_deref(), Some("connection refused"));
                assert_eq!(result.error_type.as_deref(), Some("ExecutionError"));
                assert!(result.traceback.is_some());
            }
            other => panic!("unexpected response: {other:?}"),
        }

        let pong = worker.handle_line(r#"{"cmd": "ping"}"#);
        assert!(matches!(pong, Response::Pong { .. }));

        worker.handle_line(r#"{"cmd": "cleanup"}"#);
        let status = RunStatus::read_from(tmp.path().join("session").join(STATUS_FILE)).unwrap();
        assert!(!status.ok);
        assert_eq!(status.exit_code, 1);
        assert!(status.reason.contains("connection refused"));
    }

    #[test]
    fn test_missing_input_lists_available_steps() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, _buffer) = worker(tmp.path(), false);
        worker.handle_line(&prepare_line(&[("extract", "stub.extractor"), ("write", "stub.writer")]));
        worker.handle_line(&exec_line("extract", "stub.extractor", json!({})));

        let response = worker.handle_line(&exec_line(
            "write",
            "stub.writer",
            json!({"df": {"from_step": "transform", "key": "df"}}),
        ));
        let Response::StepResult(result) = response else {
            panic!("expected a step result");
        };
        assert_eq!(result.error_type.as_deref(), Some("InputResolutionError"));
        assert!(result.error.unwrap().contains("available steps: [extract]"));
    }

    #[test]
    fn test_force_spill_feeds_downstream_the_same_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, _buffer) = worker(tmp.path(), true);
        worker.handle_line(&prepare_line(&[("extract", "stub.extractor"), ("write", "stub.writer")]));

        let Response::StepResult(extract) =
            worker.handle_line(&exec_line("extract", "stub.extractor", json!({})))
        else {
            panic!("expected a step result");
        };
        assert_eq!(extract.outputs["spilled"], json!(true));
        assert!(extract.outputs.get("df").is_none());
        assert!(Path::new(extract.outputs["df_path"].as_str().unwrap()).exists());

        let Response::StepResult(write) = worker.handle_line(&exec_line(
            "write",
            "stub.writer",
            json!({"df": {"from_step": "extract", "key": "df"}}),
        )) else {
            panic!("expected a step result");
        };
        assert!(write.ok);
        assert_eq!(write.rows_written, 4);
    }

    #[test]
    fn test_exec_without_prepare_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, _buffer) = worker(tmp.path(), false);
        let response = worker.handle_line(&exec_line("extract", "stub.extractor", json!({})));
        match response {
            Response::Error { error, context, .. } => {
                assert!(error.contains("send prepare first"));
                assert_eq!(context["cmd"], "exec_step");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_line_gets_error_response() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, buffer) = worker(tmp.path(), false);
        worker.serve(Cursor::new("not json\n\n")).unwrap();
        let lines = buffer.lines();
        assert_eq!(lines.len(), 1);
        assert_eq!(lines[0]["type"], "error");
        assert_eq!(lines[0]["context"]["line"], "not json");
    }

    #[test]
    fn test_missing_dependencies_fail_prepare_but_cleanup_writes_status() {
        let tmp = tempfile::tempdir().unwrap();
        let (worker, _buffer) = worker(tmp.path(), false);
        let mut worker = worker.with_probe(NothingPresent);

        let response = worker.handle_line(&prepare_line(&[("write", "pg.writer")]));
        match &response {
            Response::Error { error, .. } => assert!(error.contains("pg_client")),
            other => panic!("unexpected response: {other:?}"),
        }
        assert!(worker.session().is_none());

        worker.handle_line(r#"{"cmd": "cleanup"}"#);
        let status = RunStatus::read_from(tmp.path().join("session").join(STATUS_FILE)).unwrap();
        assert!(!status.ok);
        assert!(status.reason.contains("pg_client"));
    }

    #[test]
    fn test_unknown_driver_registration_is_logged_not_fatal() {
        let tmp = tempfile::tempdir().unwrap();
        let (mut worker, _buffer) = worker(tmp.path(), false);
        let response =
            worker.handle_line(&prepare_line(&[("extract", "stub.extractor"), ("write", "mysql.writer")]));
        match response {
            Response::Prepared { drivers_loaded, .. } => {
                assert_eq!(drivers_loaded, vec!["stub.extractor"]);
            }
            other => panic!("unexpected response: {other:?}"),
        }

        worker.handle_line(r#"{"cmd": "cleanup"}"#);
        let events = read_jsonl(tmp.path().join("session/events.jsonl")).unwrap();
        let names: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();
        assert!(names.contains(&event_names::DRIVER_REGISTRATION_FAILED));
        assert!(names.contains(&event_names::SESSION_INITIALIZED));
    }
}
