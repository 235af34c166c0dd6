// ABOUTME: Per-run execution context shared by every adapter phase
// ABOUTME: Derives the logs and artifacts directories from a session id and base path

use crate::constants::ARTIFACTS_DIR;
use chrono::Utc;
use std::path::{Path, PathBuf};

/// Created once per run and passed by reference through prepare/execute/collect
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionContext {
    pub session_id: String,
    pub base_path: PathBuf,
}

impl ExecutionContext {
    pub fn new(session_id: impl Into<String>, base_path: impl Into<PathBuf>) -> Self {
        Self {
            session_id: session_id.into(),
            base_path: base_path.into(),
        }
    }

    /// Context with a freshly generated session id
    pub fn new_session(base_path: impl Into<PathBuf>) -> Self {
        Self::new(generate_session_id(), base_path)
    }

    /// `<base>/logs/<session_id>`
    pub fn logs_dir(&self) -> PathBuf {
        self.base_path.join("logs").join(&self.session_id)
    }

    /// `<base>/logs/<session_id>/artifacts`
    pub fn artifacts_dir(&self) -> PathBuf {
        self.logs_dir().join(ARTIFACTS_DIR)
    }

    /// Create the logs and artifacts directories; the only mutation adapters perform
    pub fn ensure_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(self.artifacts_dir())
    }

    pub fn base_path(&self) -> &Path {
        &self.base_path
    }
}

/// Session ids look like `run_20240101T120000Z_1a2b3c4d`
pub fn generate_session_id() -> String {
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    format!("run_{}_{}", Utc::now().format("%Y%m%dT%H%M%SZ"), &suffix[..8])
}
