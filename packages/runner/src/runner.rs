// ABOUTME: In-process DAG runner
// ABOUTME: Executes manifest steps in dependency order and stops at the first failed step

use crate::connections::ConnectionResolver;
use crate::dag::{derive_inputs, topological_order};
use crate::drivers::builtin_registry;
use crate::error::Result;
use crate::lifecycle::{run_completed, run_failed, run_started};
use crate::materialize::materialize;
use crate::step::{execute_step, RowTotals, StepError, StepOutcome, StepSetup};
use osiris_core::constants::STATUS_FILE;
use osiris_core::{DriverRegistry, Manifest, RunLog, RunStatus, StepOutputs};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tracing::{info, warn};

/// Summary of one pipeline run
#[derive(Debug, Clone)]
pub struct RunReport {
    pub success: bool,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub total_rows: usize,
    pub failed_step: Option<String>,
    pub error: Option<String>,
    pub steps: Vec<StepOutcome>,
    pub duration_ms: u64,
}

pub struct DagRunner {
    manifest_path: PathBuf,
    artifacts_dir: PathBuf,
    cfg_root: Option<PathBuf>,
    registry: DriverRegistry,
    resolver: Option<Arc<dyn ConnectionResolver>>,
}

impl DagRunner {
    /// Runner over a manifest file with the builtin drivers registered.
    ///
    /// Step configs are resolved relative to the manifest's directory.
    pub fn new(manifest_path: impl Into<PathBuf>, artifacts_dir: impl Into<PathBuf>) -> Self {
        Self {
            manifest_path: manifest_path.into(),
            artifacts_dir: artifacts_dir.into(),
            cfg_root: None,
            registry: builtin_registry(),
            resolver: None,
        }
    }

    pub fn with_registry(mut self, registry: DriverRegistry) -> Self {
        self.registry = registry;
        self
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn ConnectionResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Resolve step configs against `cfg_root` instead of the manifest's directory
    pub fn with_cfg_root(mut self, cfg_root: impl Into<PathBuf>) -> Self {
        self.cfg_root = Some(cfg_root.into());
        self
    }

    pub fn registry(&self) -> &DriverRegistry {
        &self.registry
    }

    fn cfg_root(&self) -> &Path {
        match &self.cfg_root {
            Some(root) => root,
            None => self
                .manifest_path
                .parent()
                .unwrap_or_else(|| Path::new(".")),
        }
    }

    /// Execute the pipeline, recording everything in `log`.
    ///
    /// Step failures end the run and are reported in the returned
    /// [`RunReport`]; only unreadable manifests and dependency cycles are
    /// returned as errors.
    pub fn run(&self, log: &mut RunLog) -> Result<RunReport> {
        let started = Instant::now();
        let manifest = Manifest::from_path(&self.manifest_path)?;
        let steps_total = manifest.steps.len();

        let order = match topological_order(&manifest) {
            Ok(order) => order,
            Err(e) => {
                run_failed(log, 0, steps_total, &e.to_string(), None);
                self.write_status(log, 0, steps_total, Some(e.to_string()));
                log.flush();
                return Err(e);
            }
        };

        run_started(log, &manifest);
        info!(
            "Running pipeline {} with {} steps",
            manifest.pipeline.id, steps_total
        );

        let cfg_root = self.cfg_root();
        let resolver = self.resolver.as_deref();
        let mut cache: BTreeMap<String, StepOutputs> = BTreeMap::new();
        let mut totals = RowTotals::default();
        let mut outcomes = Vec::with_capacity(steps_total);
        let mut failure: Option<(String, String)> = None;

        for step_id in &order {
            let Some(step) = manifest.step(step_id) else {
                continue;
            };
            let role = self.registry.role_of(&step.driver);
            let input_refs = derive_inputs(step, &manifest, &self.registry);
            let registry = &self.registry;

            let mut outcome = execute_step(
                log,
                &self.artifacts_dir,
                &step.id,
                &step.driver,
                role,
                |_| {
                    let driver = registry
                        .get(&step.driver)
                        .map_err(StepError::DriverNotFound)?;
                    let materialized = materialize(cfg_root, &step.id, &step.cfg_path, resolver)
                        .map_err(|e| StepError::Setup(e.to_string()))?;
                    Ok(StepSetup {
                        driver,
                        config: materialized.config,
                    })
                },
                &input_refs,
                &cache,
            );
            totals.record(&outcome);

            if let Some(f) = &outcome.failure {
                failure = Some((step.id.clone(), f.error.clone()));
                outcomes.push(outcome);
                break;
            }
            cache.insert(step.id.clone(), std::mem::take(&mut outcome.outputs));
            outcomes.push(outcome);
        }

        let steps_completed = outcomes.iter().filter(|o| o.ok()).count();
        match &failure {
            Some((step_id, error)) => {
                warn!("Pipeline failed at step {}: {}", step_id, error);
                run_failed(log, steps_completed, steps_total, error, Some(step_id));
            }
            None => run_completed(log, steps_completed, steps_total, totals.total_rows()),
        }

        let error = failure.as_ref().map(|(_, e)| e.clone());
        self.write_status(log, steps_completed, steps_total, error.clone());
        log.flush();

        Ok(RunReport {
            success: failure.is_none() && steps_completed == steps_total,
            steps_completed,
            steps_total,
            total_rows: totals.total_rows(),
            failed_step: failure.map(|(step_id, _)| step_id),
            error,
            steps: outcomes,
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }

    fn write_status(
        &self,
        log: &RunLog,
        steps_completed: usize,
        steps_total: usize,
        failure: Option<String>,
    ) {
        let status = RunStatus::from_counts(None, steps_completed, steps_total, failure);
        if let Err(e) = status.write_to(log.dir().join(STATUS_FILE)) {
            warn!("Failed to write status file: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osiris_core::testing::{FailingDriver, StubExtractor, StubWriter};
    use osiris_core::{read_jsonl, Driver};
    use serde_json::json;

    fn write_pipeline(dir: &Path, steps: serde_json::Value) -> PathBuf {
        let manifest = json!({"pipeline": {"id": "p1", "name": "p1"}, "steps": steps});
        for step in manifest["steps"].as_array().unwrap() {
            let cfg = dir.join(step["cfg_path"].as_str().unwrap());
            std::fs::create_dir_all(cfg.parent().unwrap()).unwrap();
            std::fs::write(cfg, r#"{"component": "x", "rows": 3}"#).unwrap();
        }
        let path = dir.join("manifest.json");
        std::fs::write(&path, serde_json::to_vec(&manifest).unwrap()).unwrap();
        path
    }

    fn registry(writer: StubWriter) -> DriverRegistry {
        let mut registry = DriverRegistry::new();
        registry.register("stub.extractor", Arc::new(StubExtractor::new(0)));
        registry.register("stub.writer", Arc::new(writer) as Arc<dyn Driver>);
        registry.register("bad.extractor", Arc::new(FailingDriver::new("no route to host")));
        registry
    }

    #[test]
    fn test_runs_steps_and_threads_outputs() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest_path = write_pipeline(
            tmp.path(),
            json!([
                {"id": "write", "driver": "stub.writer", "cfg_path": "cfg/write.json", "needs": ["extract"]},
                {"id": "extract", "driver": "stub.extractor", "cfg_path": "cfg/extract.json"}
            ]),
        );
        let writer = StubWriter::default();
        let logs = tmp.path().join("logs");
        let mut log = RunLog::create("s", &logs).unwrap();

        let report = DagRunner::new(&manifest_path, logs.join("artifacts"))
            .with_registry(registry(writer.clone()))
            .run(&mut log)
            .unwrap();

        assert!(report.success);
        assert_eq!(report.steps_completed, 2);
        assert_eq!(report.total_rows, 3);
        assert_eq!(writer.rows_written(), 3);

        let status = RunStatus::read_from(logs.join(STATUS_FILE)).unwrap();
        assert!(status.ok);
        assert!(logs.join("artifacts/extract/cleaned_config.json").exists());
    }

    #[test]
    fn test_first_failure_stops_the_run() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest_path = write_pipeline(
            tmp.path(),
            json!([
                {"id": "extract", "driver": "bad.extractor", "cfg_path": "cfg/extract.json"},
                {"id": "write", "driver": "stub.writer", "cfg_path": "cfg/write.json", "needs": ["extract"]}
            ]),
        );
        let logs = tmp.path().join("logs");
        let mut log = RunLog::create("s", &logs).unwrap();

        let report = DagRunner::new(&manifest_path, logs.join("artifacts"))
            .with_registry(registry(StubWriter::default()))
            .run(&mut log)
            .unwrap();

        assert!(!report.success);
        assert_eq!(report.failed_step.as_deref(), Some("extract"));
        assert_eq!(report.steps_completed, 0);

        let events = read_jsonl(logs.join("events.jsonl")).unwrap();
        let names: Vec<&str> = events.iter().filter_map(|e| e["event"].as_str()).collect();
        assert_eq!(names, vec!["run_start", "step_start", "step_failed", "run_error"]);
        assert_eq!(events[3]["error"], "no route to host");

        let status = RunStatus::read_from(logs.join(STATUS_FILE)).unwrap();
        assert_eq!(status.exit_code, 1);
        assert_eq!(status.reason, "no route to host");
    }

    #[test]
    fn test_cycle_rejected_before_any_step() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest_path = write_pipeline(
            tmp.path(),
            json!([
                {"id": "a", "driver": "stub.extractor", "cfg_path": "cfg/a.json", "needs": ["b"]},
                {"id": "b", "driver": "stub.writer", "cfg_path": "cfg/b.json", "needs": ["a"]}
            ]),
        );
        let logs = tmp.path().join("logs");
        let mut log = RunLog::create("s", &logs).unwrap();

        let result = DagRunner::new(&manifest_path, logs.join("artifacts"))
            .with_registry(registry(StubWriter::default()))
            .run(&mut log);
        assert!(result.is_err());

        let events = read_jsonl(logs.join("events.jsonl")).unwrap();
        assert!(events.iter().all(|e| e["event"] != "step_start"));
        assert_eq!(events.last().unwrap()["event"], "run_error");
    }

    #[test]
    fn test_unknown_driver_fails_step() {
        let tmp = tempfile::tempdir().unwrap();
        let manifest_path = write_pipeline(
            tmp.path(),
            json!([{"id": "a", "driver": "mysql.extractor", "cfg_path": "cfg/a.json"}]),
        );
        let logs = tmp.path().join("logs");
        let mut log = RunLog::create("s", &logs).unwrap();

        let report = DagRunner::new(&manifest_path, logs.join("artifacts"))
            .with_registry(registry(StubWriter::default()))
            .run(&mut log)
            .unwrap();
        assert!(!report.success);
        let error = report.error.unwrap();
        assert!(error.contains("mysql.extractor"));
        assert!(error.contains("stub.extractor"));
    }

    #[test]
    fn test_cfg_root_override_for_relocated_manifest() {
        let tmp = tempfile::tempdir().unwrap();
        let build = tmp.path().join("build");
        std::fs::create_dir_all(&build).unwrap();
        let original = write_pipeline(
            &build,
            json!([{"id": "extract", "driver": "stub.extractor", "cfg_path": "cfg/extract.json"}]),
        );
        let relocated = tmp.path().join("manifest.json");
        std::fs::copy(&original, &relocated).unwrap();
        let logs = tmp.path().join("logs");
        let mut log = RunLog::create("s", &logs).unwrap();

        let report = DagRunner::new(&relocated, logs.join("artifacts"))
            .with_cfg_root(&build)
            .with_registry(registry(StubWriter::default()))
            .run(&mut log)
            .unwrap();
        assert!(report.success);
        assert_eq!(report.steps_completed, 1);
    }
}
