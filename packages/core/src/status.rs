// ABOUTME: Final status artifact written at the end of every run
// ABOUTME: Same shape for local runs and sandboxed worker sessions

use crate::error::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunStatus {
    pub sandbox_id: Option<String>,
    pub exit_code: i32,
    pub steps_completed: usize,
    pub steps_total: usize,
    pub ok: bool,
    pub reason: String,
}

impl RunStatus {
    /// Derive ok/exit code from step counts; a run fails when any step did not complete
    pub fn from_counts(
        sandbox_id: Option<String>,
        steps_completed: usize,
        steps_total: usize,
        failure: Option<String>,
    ) -> Self {
        let ok = failure.is_none() && steps_completed >= steps_total;
        let reason = match failure {
            Some(reason) => reason,
            None if ok => String::new(),
            None => format!(
                "only {} of {} steps completed",
                steps_completed, steps_total
            ),
        };
        Self {
            sandbox_id,
            exit_code: if ok { 0 } else { 1 },
            steps_completed,
            steps_total,
            ok,
            reason,
        }
    }

    pub fn write_to(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_vec_pretty(self)?)?;
        Ok(())
    }

    pub fn read_from(path: impl AsRef<Path>) -> Result<Self> {
        let bytes = std::fs::read(path)?;
        Ok(serde_json::from_slice(&bytes)?)
    }
}
