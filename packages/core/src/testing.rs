// ABOUTME: Deterministic drivers for tests across the workspace
// ABOUTME: Enabled in dependents through the `test-utils` feature

use crate::driver::{
    Driver, DriverContext, DriverError, DriverRole, OutputValue, StepInputs, StepOutputs,
};
use crate::table::Table;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Emits `rows` synthetic records under `df`; `config.rows` overrides the count
#[derive(Debug, Clone)]
pub struct StubExtractor {
    rows: usize,
}

impl StubExtractor {
    pub fn new(rows: usize) -> Self {
        Self { rows }
    }
}

impl Driver for StubExtractor {
    fn run(
        &self,
        _step_id: &str,
        config: &Value,
        _inputs: &StepInputs,
        _ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError> {
        let rows = config
            .get("rows")
            .and_then(Value::as_u64)
            .map(|n| n as usize)
            .unwrap_or(self.rows);
        let records: Vec<Value> = (0..rows)
            .map(|i| json!({"id": i + 1, "name": format!("row-{}", i + 1)}))
            .collect();
        let mut table = Table::from_records(&records)?;
        if table.columns.is_empty() {
            table.columns = vec!["id".to_string(), "name".to_string()];
        }

        let mut outputs = StepOutputs::new();
        outputs.insert("df".to_string(), OutputValue::Table(table));
        Ok(outputs)
    }

    fn role(&self) -> Option<DriverRole> {
        Some(DriverRole::Extractor)
    }
}

/// Consumes every table input and counts the rows it saw
#[derive(Debug, Clone, Default)]
pub struct StubWriter {
    written: Arc<AtomicUsize>,
}

impl StubWriter {
    pub fn rows_written(&self) -> usize {
        self.written.load(Ordering::SeqCst)
    }
}

impl Driver for StubWriter {
    fn run(
        &self,
        _step_id: &str,
        _config: &Value,
        inputs: &StepInputs,
        _ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError> {
        let rows: usize = inputs.values().filter_map(OutputValue::row_count).sum();
        self.written.fetch_add(rows, Ordering::SeqCst);
        Ok(StepOutputs::new())
    }

    fn role(&self) -> Option<DriverRole> {
        Some(DriverRole::Writer)
    }
}

/// Always returns an execution error
#[derive(Debug, Clone)]
pub struct FailingDriver {
    pub message: String,
}

impl FailingDriver {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

impl Driver for FailingDriver {
    fn run(
        &self,
        _step_id: &str,
        _config: &Value,
        _inputs: &StepInputs,
        _ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError> {
        Err(DriverError::Execution(self.message.clone()))
    }
}

/// Panics inside `run`, for isolation tests
#[derive(Debug, Clone, Default)]
pub struct PanickingDriver;

impl Driver for PanickingDriver {
    fn run(
        &self,
        step_id: &str,
        _config: &Value,
        _inputs: &StepInputs,
        _ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError> {
        panic!("driver panicked in step {}", step_id);
    }
}
