// ABOUTME: Error types for the runner package
// ABOUTME: Fatal pipeline configuration errors raised before or between steps

use crate::connections::ConnectionError;
use osiris_core::CoreError;
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum RunnerError {
    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Circular dependency detected among steps: {}", .0.join(" -> "))]
    CycleDetected(Vec<String>),

    #[error("Step '{step}' needs unknown step '{dependency}'")]
    UnknownDependency { step: String, dependency: String },

    #[error("Config file for step '{step}' not found: {}", .path.display())]
    ConfigNotFound { step: String, path: PathBuf },

    #[error("Config for step '{step}' must be a JSON object")]
    ConfigNotObject { step: String },

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),
}

pub type Result<T> = std::result::Result<T, RunnerError>;
