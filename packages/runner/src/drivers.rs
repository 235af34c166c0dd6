// ABOUTME: Builtin filesystem drivers for JSON-lines data
// ABOUTME: Registered by default in the DAG runner and the sandbox worker

use osiris_core::{
    DoctorReport, Driver, DriverContext, DriverError, DriverRegistry, DriverRole, OutputValue,
    StepInputs, StepOutputs, Table,
};
use serde_json::{json, Value};
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::PathBuf;
use std::sync::Arc;

pub const JSONL_EXTRACTOR: &str = "filesystem.jsonl_extractor";
pub const JSONL_WRITER: &str = "filesystem.jsonl_writer";

/// Registry with every builtin driver
pub fn builtin_registry() -> DriverRegistry {
    let mut registry = DriverRegistry::new();
    registry.register(JSONL_EXTRACTOR, Arc::new(JsonlExtractor));
    registry.register(JSONL_WRITER, Arc::new(JsonlWriter));
    registry
}

fn required_path(config: &Value) -> Result<PathBuf, DriverError> {
    config
        .get("path")
        .and_then(Value::as_str)
        .map(PathBuf::from)
        .ok_or_else(|| DriverError::Config("'path' is required".to_string()))
}

/// Reads a JSON-lines file into a table.
///
/// Config: `path` (required), `limit` (optional row cap).
#[derive(Debug, Clone, Default)]
pub struct JsonlExtractor;

impl JsonlExtractor {
    fn read(&self, config: &Value) -> Result<Table, DriverError> {
        let path = required_path(config)?;
        let limit = config
            .get("limit")
            .and_then(Value::as_u64)
            .map(|n| n as usize);

        let file = File::open(&path)?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            if limit.is_some_and(|limit| records.len() >= limit) {
                break;
            }
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let record: Value = serde_json::from_str(&line).map_err(|e| {
                DriverError::Execution(format!(
                    "{}:{}: invalid JSON: {}",
                    path.display(),
                    idx + 1,
                    e
                ))
            })?;
            records.push(record);
        }

        Ok(Table::from_records(&records)?)
    }
}

impl Driver for JsonlExtractor {
    fn run(
        &self,
        _step_id: &str,
        config: &Value,
        _inputs: &StepInputs,
        _ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError> {
        let table = self.read(config)?;
        Ok(StepOutputs::from([("df".to_string(), OutputValue::Table(table))]))
    }

    fn role(&self) -> Option<DriverRole> {
        Some(DriverRole::Extractor)
    }

    fn discover(&self, config: &Value) -> Result<Option<Value>, DriverError> {
        let mut sample_config = config.clone();
        if let Value::Object(map) = &mut sample_config {
            map.insert("limit".to_string(), json!(100));
        }
        Ok(Some(self.read(&sample_config)?.schema()))
    }

    fn doctor(&self, config: &Value) -> Result<DoctorReport, DriverError> {
        let path = required_path(config)?;
        Ok(if path.is_file() {
            DoctorReport {
                ok: true,
                message: format!("{} is readable", path.display()),
            }
        } else {
            DoctorReport {
                ok: false,
                message: format!("{} does not exist", path.display()),
            }
        })
    }
}

/// Writes every table input as JSON lines.
///
/// Config: `path` (optional); defaults to `<step artifacts>/<filename>`
/// with `filename` defaulting to `output.jsonl`.
#[derive(Debug, Clone, Default)]
pub struct JsonlWriter;

impl Driver for JsonlWriter {
    fn run(
        &self,
        _step_id: &str,
        config: &Value,
        inputs: &StepInputs,
        ctx: &mut DriverContext<'_>,
    ) -> Result<StepOutputs, DriverError> {
        let tables: Vec<&Table> = inputs.values().filter_map(OutputValue::as_table).collect();
        if tables.is_empty() {
            return Err(DriverError::Input("no table input to write".to_string()));
        }

        let path = match config.get("path").and_then(Value::as_str) {
            Some(path) => PathBuf::from(path),
            None => {
                let filename = config
                    .get("filename")
                    .and_then(Value::as_str)
                    .unwrap_or("output.jsonl");
                ctx.artifacts_dir().join(filename)
            }
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut out = BufWriter::new(File::create(&path)?);
        let mut written = 0usize;
        for table in tables {
            for record in table.to_records() {
                serde_json::to_writer(&mut out, &record)?;
                out.write_all(b"\n")?;
                written += 1;
            }
        }
        out.flush()?;
        ctx.log_metric("bytes_written", std::fs::metadata(&path)?.len());
        tracing::debug!("Wrote {} rows to {}", written, path.display());

        Ok(StepOutputs::new())
    }

    fn role(&self) -> Option<DriverRole> {
        Some(DriverRole::Writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use osiris_core::RunLog;

    #[test]
    fn test_extract_then_write_roundtrips_rows() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("in.jsonl");
        std::fs::write(&source, "{\"id\": 1}\n\n{\"id\": 2, \"tag\": \"x\"}\n").unwrap();
        let mut log = RunLog::create("s", tmp.path().join("logs")).unwrap();

        let outputs = {
            let mut ctx = DriverContext::new("extract", tmp.path().join("a"), &mut log);
            JsonlExtractor
                .run("extract", &json!({"path": source}), &StepInputs::new(), &mut ctx)
                .unwrap()
        };
        assert_eq!(outputs["df"].row_count(), Some(2));

        let target = tmp.path().join("out/result.jsonl");
        let mut ctx = DriverContext::new("write", tmp.path().join("w"), &mut log);
        let written = JsonlWriter
            .run("write", &json!({"path": target}), &outputs, &mut ctx)
            .unwrap();
        assert!(written.is_empty());

        let text = std::fs::read_to_string(&target).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn test_extractor_requires_path() {
        let err = JsonlExtractor.doctor(&json!({})).unwrap_err();
        assert!(matches!(err, DriverError::Config(_)));
    }

    #[test]
    fn test_doctor_and_discover() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("in.jsonl");
        std::fs::write(&source, "{\"id\": 1, \"name\": \"a\"}\n").unwrap();

        let report = JsonlExtractor.doctor(&json!({"path": source})).unwrap();
        assert!(report.ok);
        let schema = JsonlExtractor
            .discover(&json!({"path": source}))
            .unwrap()
            .unwrap();
        assert_eq!(schema["fields"][1]["name"], "name");

        let missing = JsonlExtractor
            .doctor(&json!({"path": tmp.path().join("nope.jsonl")}))
            .unwrap();
        assert!(!missing.ok);
    }

    #[test]
    fn test_writer_rejects_missing_input() {
        let tmp = tempfile::tempdir().unwrap();
        let mut log = RunLog::create("s", tmp.path()).unwrap();
        let mut ctx = DriverContext::new("w", tmp.path().join("w"), &mut log);
        let err = JsonlWriter
            .run("w", &json!({}), &StepInputs::new(), &mut ctx)
            .unwrap_err();
        assert_eq!(err.error_type(), "InputError");
    }
}
