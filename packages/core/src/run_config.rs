// ABOUTME: Run configuration shipped to the sandbox as run_config.json
// ABOUTME: Tells the in-sandbox worker where to write and how to manage memory

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub const RUN_CONFIG_FILE: &str = "run_config.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunConfig {
    pub session_id: String,
    pub pipeline_id: String,
    /// Directory for events/metrics/status, relative to the payload dir or absolute
    pub session_dir: String,
    #[serde(default)]
    pub sandbox_id: Option<String>,
    /// Write every tabular output to disk instead of keeping it resident
    #[serde(default)]
    pub force_spill: bool,
    /// Permit the worker to install missing driver dependencies
    #[serde(default)]
    pub install_deps: bool,
    #[serde(default)]
    pub install_command: Option<String>,
}

impl RunConfig {
    pub fn new(session_id: impl Into<String>, pipeline_id: impl Into<String>) -> Self {
        Self {
            session_id: session_id.into(),
            pipeline_id: pipeline_id.into(),
            session_dir: "session".to_string(),
            sandbox_id: None,
            force_spill: false,
            install_deps: false,
            install_command: None,
        }
    }

    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_apply_to_sparse_config() {
        let config: RunConfig = serde_json::from_str(
            r#"{"session_id": "s", "pipeline_id": "p", "session_dir": "out"}"#,
        )
        .unwrap();
        assert!(!config.force_spill);
        assert!(!config.install_deps);
        assert!(config.sandbox_id.is_none());
    }
}
