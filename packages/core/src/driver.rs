// ABOUTME: Driver contract, typed driver registry, and cross-step input references
// ABOUTME: Drivers turn (config, inputs) into named outputs; the registry resolves them by name

use crate::error::CoreError;
use crate::events::RunLog;
use crate::table::Table;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;

/// What a driver does with data, used for row accounting
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriverRole {
    Extractor,
    Transformer,
    Writer,
    Other,
}

impl DriverRole {
    /// Naming convention fallback: the verb after the last `.` of `<family>.<verb>`
    pub fn from_driver_name(name: &str) -> Self {
        match name.rsplit('.').next() {
            Some("extractor") => DriverRole::Extractor,
            Some("writer") => DriverRole::Writer,
            Some("transformer") | Some("transform") | Some("processor") => DriverRole::Transformer,
            _ => DriverRole::Other,
        }
    }

    /// Writers consume tables but emit none
    pub fn produces_table(self) -> bool {
        !matches!(self, DriverRole::Writer)
    }
}

/// A single named step output
#[derive(Debug, Clone, PartialEq)]
pub enum OutputValue {
    Table(Table),
    Value(Value),
}

impl OutputValue {
    pub fn as_table(&self) -> Option<&Table> {
        match self {
            OutputValue::Table(table) => Some(table),
            OutputValue::Value(_) => None,
        }
    }

    pub fn row_count(&self) -> Option<usize> {
        self.as_table().map(Table::row_count)
    }
}

pub type StepOutputs = BTreeMap<String, OutputValue>;
pub type StepInputs = BTreeMap<String, OutputValue>;

/// Symbolic reference to another step's output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputRef {
    pub from_step: String,
    pub key: String,
}

impl InputRef {
    pub fn new(from_step: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            from_step: from_step.into(),
            key: key.into(),
        }
    }
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ResolveError {
    #[error("No cached output for step '{step}' (available steps: [{}])", .available.join(", "))]
    MissingStep { step: String, available: Vec<String> },

    #[error("Step '{step}' has no output '{key}' (available keys: [{}])", .available.join(", "))]
    MissingKey {
        step: String,
        key: String,
        available: Vec<String>,
    },

    #[error("Failed to reload spilled output of step '{step}': {message}")]
    Reload { step: String, message: String },
}

/// Anything that can answer `{from_step, key}` lookups
pub trait InputSource {
    fn resolve(&self, input: &InputRef) -> Result<OutputValue, ResolveError>;
}

impl InputSource for BTreeMap<String, StepOutputs> {
    fn resolve(&self, input: &InputRef) -> Result<OutputValue, ResolveError> {
        let outputs = self
            .get(&input.from_step)
            .ok_or_else(|| ResolveError::MissingStep {
                step: input.from_step.clone(),
                available: self.keys().cloned().collect(),
            })?;
        outputs
            .get(&input.key)
            .cloned()
            .ok_or_else(|| ResolveError::MissingKey {
                step: input.from_step.clone(),
                key: input.key.clone(),
                available: outputs.keys().cloned().collect(),
            })
    }
}

#[derive(Error, Debug)]
pub enum DriverError {
    #[error("Invalid config: {0}")]
    Config(String),

    #[error("Invalid input: {0}")]
    Input(String),

    #[error("{0}")]
    Execution(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl DriverError {
    /// Stable type name reported in `step_failed` events
    pub fn error_type(&self) -> &'static str {
        match self {
            DriverError::Config(_) => "ConfigError",
            DriverError::Input(_) => "InputError",
            DriverError::Execution(_) => "ExecutionError",
            DriverError::Io(_) => "IoError",
            DriverError::Json(_) => "JsonError",
            DriverError::Core(_) => "CoreError",
        }
    }
}

/// Runtime handle passed to a driver for one step
pub struct DriverContext<'a> {
    step_id: &'a str,
    artifacts_dir: PathBuf,
    log: &'a mut RunLog,
}

impl<'a> DriverContext<'a> {
    pub fn new(step_id: &'a str, artifacts_dir: PathBuf, log: &'a mut RunLog) -> Self {
        Self {
            step_id,
            artifacts_dir,
            log,
        }
    }

    pub fn step_id(&self) -> &str {
        self.step_id
    }

    /// `artifacts/<step_id>/`, created before the driver runs
    pub fn artifacts_dir(&self) -> &Path {
        &self.artifacts_dir
    }

    /// Record a metric tagged with this step
    pub fn log_metric(&mut self, name: &str, value: impl Into<Value>) {
        self.log
            .metric(name, value, json!({"step_id": self.step_id}));
    }

    pub fn log_event(&mut self, name: &str, data: Value) {
        self.log.event(name, data);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DoctorReport {
    pub ok: bool,
    pub message: String,
}

/// Pluggable unit of work behind a `<family>.<verb>` name
pub trait Driver: Send + Sync {
    fn run(
        &self,
        step_id: &str,
        config: &Value,
        inputs: &StepInputs,
        ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError>;

    /// Declared role; `None` falls back to the driver-name convention
    fn role(&self) -> Option<DriverRole> {
        None
    }

    /// External modules this driver needs inside the sandbox
    fn required_modules(&self) -> Vec<String> {
        Vec::new()
    }

    /// Optional schema/resource discovery
    fn discover(&self, _config: &Value) -> Result<Option<Value>, DriverError> {
        Ok(None)
    }

    /// Optional connectivity check
    fn doctor(&self, _config: &Value) -> Result<DoctorReport, DriverError> {
        Ok(DoctorReport {
            ok: true,
            message: "no checks implemented".to_string(),
        })
    }
}

/// Name-keyed driver registry populated at startup
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: BTreeMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, name: impl Into<String>, driver: Arc<dyn Driver>) {
        self.drivers.insert(name.into(), driver);
    }

    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>, CoreError> {
        self.drivers
            .get(name)
            .cloned()
            .ok_or_else(|| CoreError::DriverNotFound {
                name: name.to_string(),
                available: self.names(),
            })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.drivers.contains_key(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.drivers.keys().cloned().collect()
    }

    /// Declared role of a registered driver, else the naming convention
    pub fn role_of(&self, name: &str) -> DriverRole {
        self.drivers
            .get(name)
            .and_then(|d| d.role())
            .unwrap_or_else(|| DriverRole::from_driver_name(name))
    }

    pub fn len(&self) -> usize {
        self.drivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drivers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{StubExtractor, StubWriter};
    use rstest::rstest;

    #[rstest]
    #[case("mysql.extractor", DriverRole::Extractor)]
    #[case("filesystem.csv_writer", DriverRole::Other)]
    #[case("supabase.writer", DriverRole::Writer)]
    #[case("duckdb.processor", DriverRole::Transformer)]
    #[case("nodots", DriverRole::Other)]
    fn test_role_from_driver_name(#[case] name: &str, #[case] role: DriverRole) {
        assert_eq!(DriverRole::from_driver_name(name), role);
    }

    #[test]
    fn test_registry_lookup_failure_lists_available() {
        let mut registry = DriverRegistry::new();
        registry.register("stub.extractor", Arc::new(StubExtractor::new(1)));
        registry.register("stub.writer", Arc::new(StubWriter::default()));

        match registry.get("mysql.extractor") {
            Err(CoreError::DriverNotFound { name, available }) => {
                assert_eq!(name, "mysql.extractor");
                assert_eq!(available, vec!["stub.extractor", "stub.writer"]);
            }
            Err(other) => panic!("unexpected error: {other}"),
            Ok(_) => panic!("lookup should fail"),
        }
    }

    #[test]
    fn test_declared_role_overrides_name() {
        let mut registry = DriverRegistry::new();
        registry.register(
            "custom.sink",
            Arc::new(StubWriter::default()) as Arc<dyn Driver>,
        );
        assert_eq!(registry.role_of("custom.sink"), DriverRole::Writer);
        assert_eq!(registry.role_of("unknown.extractor"), DriverRole::Extractor);
    }

    #[test]
    fn test_map_input_source_reports_alternatives() {
        let mut cache: BTreeMap<String, StepOutputs> = BTreeMap::new();
        let mut outputs = StepOutputs::new();
        outputs.insert("df".to_string(), OutputValue::Value(json!(1)));
        cache.insert("extract".to_string(), outputs);

        let err = cache.resolve(&InputRef::new("extract", "rows")).unwrap_err();
        assert!(err.to_string().contains("available keys: [df]"));

        let err = cache.resolve(&InputRef::new("missing", "df")).unwrap_err();
        assert!(err.to_string().contains("available steps: [extract]"));

        assert!(cache.resolve(&InputRef::new("extract", "df")).is_ok());
    }
}
