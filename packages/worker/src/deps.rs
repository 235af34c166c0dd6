// ABOUTME: Third-party dependency checks for the drivers a manifest uses
// ABOUTME: The live probe looks executables up on PATH and installs via a configured shell command

use crate::error::{Result, WorkerError};
use std::path::PathBuf;
use std::process::Command;
use tracing::{info, warn};

/// Exported to the install command so it can locate the pinned list
pub const REQUIREMENTS_ENV: &str = "OSIRIS_REQUIREMENTS_FILE";

pub trait DependencyProbe: Send + Sync {
    fn is_available(&self, module: &str) -> bool;

    /// Install the pinned dependency list; called only when installation is permitted
    fn install(&self, missing: &[String]) -> Result<()>;
}

/// Modules from `required` that the probe cannot find, deduplicated in order
pub fn missing_modules(probe: &dyn DependencyProbe, required: &[String]) -> Vec<String> {
    let mut missing: Vec<String> = Vec::new();
    for module in required {
        if !missing.contains(module) && !probe.is_available(module) {
            missing.push(module.clone());
        }
    }
    missing
}

/// Ensure every required module is present, installing first when allowed
pub fn ensure_dependencies(
    probe: &dyn DependencyProbe,
    required: &[String],
    install: bool,
) -> Result<()> {
    let missing = missing_modules(probe, required);
    if missing.is_empty() {
        return Ok(());
    }
    if !install {
        return Err(WorkerError::MissingDependencies(missing));
    }

    info!("Installing missing dependencies: {}", missing.join(", "));
    probe.install(&missing)?;

    let still_missing = missing_modules(probe, &missing);
    if still_missing.is_empty() {
        Ok(())
    } else {
        Err(WorkerError::MissingDependencies(still_missing))
    }
}

/// Probe backed by executables on `PATH`
#[derive(Debug, Clone, Default)]
pub struct PathProbe {
    install_command: Option<String>,
    requirements: Option<PathBuf>,
}

impl PathProbe {
    pub fn new() -> Self {
        Self::default()
    }

    /// Shell command run by `install`, e.g. `pip install -r "$OSIRIS_REQUIREMENTS_FILE"`
    pub fn with_install_command(mut self, command: impl Into<String>) -> Self {
        self.install_command = Some(command.into());
        self
    }

    pub fn with_requirements(mut self, path: impl Into<PathBuf>) -> Self {
        self.requirements = Some(path.into());
        self
    }
}

impl DependencyProbe for PathProbe {
    fn is_available(&self, module: &str) -> bool {
        which::which(module).is_ok()
    }

    fn install(&self, missing: &[String]) -> Result<()> {
        let command = self.install_command.as_deref().ok_or_else(|| {
            WorkerError::InstallFailed(format!(
                "no install command configured for {}",
                missing.join(", ")
            ))
        })?;

        let mut process = Command::new("sh");
        process.arg("-c").arg(command);
        if let Some(requirements) = &self.requirements {
            process.env(REQUIREMENTS_ENV, requirements);
            if let Some(dir) = requirements.parent() {
                process.current_dir(dir);
            }
        }

        let output = process.output()?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            warn!("Install command failed: {}", stderr);
            return Err(WorkerError::InstallFailed(format!(
                "`{}` exited with {}: {}",
                command, output.status, stderr
            )));
        }
        Ok(())
    }
}
