// ABOUTME: Error types for sandbox transports and the sandbox client
// ABOUTME: Covers remote API failures, missing sandboxes or files, and extraction failures

use thiserror::Error;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Sandbox not found: {0}")]
    SandboxNotFound(String),

    #[error("Sandbox {0} is closed")]
    SandboxClosed(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("File not found in sandbox: {0}")]
    FileNotFound(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Payload extraction failed (exit code {exit_code:?}): {stderr}")]
    Extraction {
        exit_code: Option<i32>,
        stderr: String,
    },
}

pub type Result<T> = std::result::Result<T, SandboxError>;
