// ABOUTME: Worker configuration derived from the payload's run_config.json
// ABOUTME: Resolves the session directory and config root against the payload directory

use crate::error::Result;
use osiris_core::run_config::RUN_CONFIG_FILE;
use osiris_core::RunConfig;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq)]
pub struct WorkerConfig {
    /// Directory `cfg_path`s are resolved against
    pub cfg_root: PathBuf,
    /// Where events, metrics, status, and artifacts are written
    pub session_dir: PathBuf,
    pub sandbox_id: Option<String>,
    pub force_spill: bool,
    pub install_deps: bool,
    pub install_command: Option<String>,
}

impl WorkerConfig {
    /// Defaults for a worker rooted at `payload_dir`
    pub fn new(payload_dir: impl Into<PathBuf>) -> Self {
        let payload_dir = payload_dir.into();
        Self {
            session_dir: payload_dir.join("session"),
            cfg_root: payload_dir,
            sandbox_id: None,
            force_spill: false,
            install_deps: false,
            install_command: None,
        }
    }

    pub fn from_run_config(payload_dir: &Path, run_config: &RunConfig) -> Self {
        let session_dir = Path::new(&run_config.session_dir);
        Self {
            cfg_root: payload_dir.to_path_buf(),
            session_dir: if session_dir.is_absolute() {
                session_dir.to_path_buf()
            } else {
                payload_dir.join(session_dir)
            },
            sandbox_id: run_config.sandbox_id.clone(),
            force_spill: run_config.force_spill,
            install_deps: run_config.install_deps,
            install_command: run_config.install_command.clone(),
        }
    }

    /// Read `<payload_dir>/run_config.json`
    pub fn load(payload_dir: &Path) -> Result<(Self, RunConfig)> {
        let run_config = RunConfig::from_path(payload_dir.join(RUN_CONFIG_FILE))?;
        Ok((Self::from_run_config(payload_dir, &run_config), run_config))
    }

    pub fn with_force_spill(mut self, force_spill: bool) -> Self {
        self.force_spill = force_spill;
        self
    }

    pub fn with_session_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.session_dir = dir.into();
        self
    }
}
