// ABOUTME: Error types for the execution adapters
// ABOUTME: One enum per adapter phase plus configuration errors for the E2B target

use crate::config::ConfigError;
use osiris_core::CoreError;
use osiris_runner::{ConnectionError, RunnerError};
use osiris_sandbox::{PayloadError, SandboxError};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum PrepareError {
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    #[error("Unknown execution target '{0}' (expected local or e2b)")]
    UnknownTarget(String),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error(transparent)]
    Runner(#[from] RunnerError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Error, Debug)]
pub enum ExecuteError {
    #[error("Missing credential: {0} is not set")]
    MissingCredential(&'static str),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Payload error: {0}")]
    Payload(#[from] PayloadError),

    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    #[error(transparent)]
    Core(#[from] CoreError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Pipeline task aborted: {0}")]
    Aborted(String),
}

#[derive(Error, Debug)]
pub enum CollectError {
    #[error("No sandbox was created for this run; nothing to collect")]
    NoSandbox,

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
