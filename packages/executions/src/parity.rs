// ABOUTME: Normalization of event and metric streams for local/remote comparison
// ABOUTME: Keeps the shared vocabulary and drops fields that legitimately differ between targets

use osiris_core::constants::{event_names, metric_names};
use osiris_core::{read_jsonl, CoreError};
use serde_json::Value;
use std::path::Path;

/// Events both adapters emit for the same pipeline
pub const SHARED_EVENTS: &[&str] = &[
    event_names::RUN_START,
    event_names::RUN_COMPLETE,
    event_names::RUN_ERROR,
    event_names::STEP_START,
    event_names::STEP_COMPLETE,
    event_names::STEP_FAILED,
];

pub const SHARED_METRICS: &[&str] = &[
    metric_names::ROWS_READ,
    metric_names::ROWS_WRITTEN,
    metric_names::STEPS_COMPLETED,
    metric_names::STEP_DURATION_MS,
];

const VOLATILE_FIELDS: &[&str] = &[
    "ts",
    "timestamp",
    "session",
    "session_id",
    "sandbox_id",
    "source",
    "adapter",
    "duration_ms",
    "duration_seconds",
    "traceback",
];

fn is_volatile(key: &str) -> bool {
    VOLATILE_FIELDS.contains(&key)
        || key == "path"
        || key.ends_with("_path")
        || key.ends_with("_dir")
}

/// Shared-vocabulary records with target-specific fields removed, in order
pub fn normalize_for_parity(records: &[Value]) -> Vec<Value> {
    records
        .iter()
        .filter_map(|record| {
            let map = record.as_object()?;
            let timing_value = match (map.get("event"), map.get("metric")) {
                (Some(Value::String(event)), _) if SHARED_EVENTS.contains(&event.as_str()) => {
                    false
                }
                (_, Some(Value::String(metric))) if SHARED_METRICS.contains(&metric.as_str()) => {
                    metric == metric_names::STEP_DURATION_MS
                }
                _ => return None,
            };

            let normalized = map
                .iter()
                .filter(|(key, _)| !is_volatile(key))
                .filter(|(key, _)| !(timing_value && key.as_str() == "value"))
                .map(|(key, value)| (key.clone(), value.clone()))
                .collect();
            Some(Value::Object(normalized))
        })
        .collect()
}

/// Read a JSONL stream and normalize it
pub fn load_normalized(path: impl AsRef<Path>) -> Result<Vec<Value>, CoreError> {
    Ok(normalize_for_parity(&read_jsonl(path)?))
}
