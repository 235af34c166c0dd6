// ABOUTME: Error types for the proxy worker
// ABOUTME: Session state, dependency, and payload loading failures

use osiris_core::CoreError;
use osiris_runner::RunnerError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Invalid command: {0}")]
    InvalidCommand(String),

    #[error("No active session; send prepare first")]
    NoSession,

    #[error("Session {0} is already active")]
    SessionActive(String),

    #[error(
        "Missing dependencies: {}. Enable install_deps or add them to the sandbox image",
        .0.join(", ")
    )]
    MissingDependencies(Vec<String>),

    #[error("Dependency installation failed: {0}")]
    InstallFailed(String),
}

pub type Result<T> = std::result::Result<T, WorkerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_dependencies_lists_every_module() {
        let err = WorkerError::MissingDependencies(vec!["duckdb".to_string(), "psql".to_string()]);
        let msg = err.to_string();
        assert!(msg.contains("duckdb, psql"));
        assert!(msg.contains("install_deps"));
    }
}
