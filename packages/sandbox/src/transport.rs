// ABOUTME: Transport trait and shared types for remote sandbox backends
// ABOUTME: Defines the abstract interface for sandbox lifecycle, processes, and files

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Home directory of the sandbox user; payloads are extracted below it
pub const SANDBOX_HOME: &str = "/home/user";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SandboxStatus {
    Pending,
    Running,
    Success,
    Failed,
    Timeout,
    Cancelled,
}

impl SandboxStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, SandboxStatus::Pending | SandboxStatus::Running)
    }
}

impl std::fmt::Display for SandboxStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            SandboxStatus::Pending => "pending",
            SandboxStatus::Running => "running",
            SandboxStatus::Success => "success",
            SandboxStatus::Failed => "failed",
            SandboxStatus::Timeout => "timeout",
            SandboxStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SandboxHandle {
    pub sandbox_id: String,
    pub status: SandboxStatus,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
}

impl SandboxHandle {
    pub fn new(sandbox_id: impl Into<String>) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            status: SandboxStatus::Running,
            metadata: BTreeMap::new(),
        }
    }
}

/// Resources and environment for a new sandbox
#[derive(Debug, Clone, PartialEq)]
pub struct SandboxSpec {
    pub template: Option<String>,
    pub cpu: u32,
    pub memory_gb: u32,
    pub env: BTreeMap<String, String>,
    pub timeout_secs: u64,
    pub metadata: BTreeMap<String, String>,
}

impl Default for SandboxSpec {
    fn default() -> Self {
        Self {
            template: None,
            cpu: 2,
            memory_gb: 4,
            env: BTreeMap::new(),
            timeout_secs: 900,
            metadata: BTreeMap::new(),
        }
    }
}

/// Background process started inside a sandbox
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    pub pid: String,
    pub command: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessState {
    Running,
    Exited(i32),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ProcessOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: Option<i32>,
}

impl ProcessOutput {
    pub fn success(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    pub fn failure(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }
}

/// Entry returned by a recursive directory listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Absolute path inside the sandbox
    pub path: String,
    pub is_dir: bool,
    pub size: u64,
}

/// Backend for remote sandboxes
#[async_trait]
pub trait SandboxTransport: Send + Sync {
    /// Create and start a sandbox
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle>;

    /// Write a file, creating parent directories
    async fn upload_file(&self, handle: &SandboxHandle, remote_path: &str, content: Vec<u8>)
        -> Result<()>;

    /// Start a shell command in the background
    async fn execute_command(&self, handle: &SandboxHandle, command: &str)
        -> Result<ProcessHandle>;

    async fn get_process_status(
        &self,
        handle: &SandboxHandle,
        process: &ProcessHandle,
    ) -> Result<ProcessState>;

    async fn get_process_output(
        &self,
        handle: &SandboxHandle,
        process: &ProcessHandle,
    ) -> Result<ProcessOutput>;

    async fn download_file(&self, handle: &SandboxHandle, remote_path: &str) -> Result<Vec<u8>>;

    /// Recursive listing of files below `remote_dir`
    async fn list_files(&self, handle: &SandboxHandle, remote_dir: &str) -> Result<Vec<FileEntry>>;

    /// Destroy the sandbox
    async fn close_sandbox(&self, handle: &SandboxHandle) -> Result<()>;
}
