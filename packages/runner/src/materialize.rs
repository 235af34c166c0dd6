// ABOUTME: Per-step config materialization
// ABOUTME: Loads cfg files, strips orchestration keys, and injects resolved connections

use crate::connections::{ConnectionError, ConnectionRef, ConnectionResolver};
use crate::error::{Result, RunnerError};
use osiris_core::{Manifest, Step};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::debug;

/// Keys consumed by orchestration and never passed to drivers
pub const ORCHESTRATION_KEYS: &[&str] = &["component", "connection"];

pub const RESOLVED_CONNECTION_KEY: &str = "resolved_connection";

/// A step config ready for its driver
#[derive(Debug, Clone)]
pub struct MaterializedConfig {
    pub config: Value,
    /// SHA-256 of the raw config file bytes
    pub sha256: String,
    /// Top-level keys of the raw config, sorted
    pub keys: Vec<String>,
    pub connection: Option<ConnectionRef>,
}

/// Read `<cfg_root>/<cfg_path>` as a JSON object
pub fn load_step_config(cfg_root: &Path, step_id: &str, cfg_path: &str) -> Result<(Value, String)> {
    let path = cfg_root.join(cfg_path);
    let bytes = std::fs::read(&path).map_err(|e| match e.kind() {
        std::io::ErrorKind::NotFound => RunnerError::ConfigNotFound {
            step: step_id.to_string(),
            path: path.clone(),
        },
        _ => RunnerError::Io(e),
    })?;
    let sha256 = hex::encode(Sha256::digest(&bytes));
    let config: Value = serde_json::from_slice(&bytes)?;
    if !config.is_object() {
        return Err(RunnerError::ConfigNotObject {
            step: step_id.to_string(),
        });
    }
    Ok((config, sha256))
}

/// Remove `cfg_path` and orchestration-only keys in place
pub fn strip_orchestration_keys(config: &mut Value) {
    if let Value::Object(map) = config {
        map.remove("cfg_path");
        for key in ORCHESTRATION_KEYS {
            map.remove(*key);
        }
    }
}

/// Load a step config and turn it into the driver-facing shape
pub fn materialize(
    cfg_root: &Path,
    step_id: &str,
    cfg_path: &str,
    resolver: Option<&dyn ConnectionResolver>,
) -> Result<MaterializedConfig> {
    let (mut config, sha256) = load_step_config(cfg_root, step_id, cfg_path)?;

    let mut keys: Vec<String> = config
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();
    keys.sort();

    let connection = config
        .get("connection")
        .and_then(Value::as_str)
        .map(ConnectionRef::parse)
        .transpose()?;

    strip_orchestration_keys(&mut config);

    if let Some(reference) = &connection {
        let already_resolved = config.get(RESOLVED_CONNECTION_KEY).is_some();
        if !already_resolved {
            let resolver =
                resolver.ok_or_else(|| ConnectionError::NoResolver(reference.to_string()))?;
            let descriptor = resolver.resolve(reference)?;
            if let Value::Object(map) = &mut config {
                map.insert(RESOLVED_CONNECTION_KEY.to_string(), descriptor);
            }
            debug!("Resolved connection {} for step {}", reference, step_id);
        }
    }

    Ok(MaterializedConfig {
        config,
        sha256,
        keys,
        connection,
    })
}

/// Step descriptors keyed by id, each without its `cfg_path`
pub fn build_cfg_index(manifest: &Manifest) -> Result<BTreeMap<String, Value>> {
    manifest
        .steps
        .iter()
        .map(|step| Ok((step.id.clone(), step_descriptor(step)?)))
        .collect()
}

fn step_descriptor(step: &Step) -> Result<Value> {
    let mut value = serde_json::to_value(step)?;
    if let Value::Object(map) = &mut value {
        map.remove("cfg_path");
    }
    Ok(value)
}

/// Distinct connection references across all step configs, in step order
pub fn referenced_connections(manifest: &Manifest, cfg_root: &Path) -> Result<Vec<ConnectionRef>> {
    let mut refs: Vec<ConnectionRef> = Vec::new();
    for step in &manifest.steps {
        let (config, _) = load_step_config(cfg_root, &step.id, &step.cfg_path)?;
        if let Some(reference) = config.get("connection").and_then(Value::as_str) {
            let parsed = ConnectionRef::parse(reference)?;
            if !refs.contains(&parsed) {
                refs.push(parsed);
            }
        }
    }
    Ok(refs)
}
