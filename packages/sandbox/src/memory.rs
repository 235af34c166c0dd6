// ABOUTME: Deterministic in-memory sandbox transport
// ABOUTME: Used by tests and offline runs; extracts payloads and can delegate commands to a handler

use crate::error::{Result, SandboxError};
use crate::transport::{
    FileEntry, ProcessHandle, ProcessOutput, ProcessState, SandboxHandle, SandboxSpec,
    SandboxTransport,
};
use async_trait::async_trait;
use flate2::read::GzDecoder;
use std::collections::{BTreeMap, BTreeSet};
use std::io::Read;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use walkdir::WalkDir;

/// Flat file store keyed by absolute sandbox path
#[derive(Debug, Clone, Default)]
pub struct MemoryFs {
    files: BTreeMap<String, Vec<u8>>,
}

fn join_remote(dir: &str, rel: &str) -> String {
    format!("{}/{}", dir.trim_end_matches('/'), rel.trim_start_matches("./"))
}

impl MemoryFs {
    pub fn write(&mut self, path: impl Into<String>, content: Vec<u8>) {
        self.files.insert(path.into(), content);
    }

    pub fn read(&self, path: &str) -> Option<&[u8]> {
        self.files.get(path).map(Vec::as_slice)
    }

    pub fn contains(&self, path: &str) -> bool {
        self.files.contains_key(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.files.keys().map(String::as_str)
    }

    /// Files below `dir`, recursively
    pub fn list(&self, dir: &str) -> Vec<FileEntry> {
        let prefix = format!("{}/", dir.trim_end_matches('/'));
        self.files
            .iter()
            .filter(|(path, _)| path.starts_with(&prefix))
            .map(|(path, content)| FileEntry {
                path: path.clone(),
                is_dir: false,
                size: content.len() as u64,
            })
            .collect()
    }

    /// Unpack a gzip tar stored at `archive` into `dest`
    pub fn extract_tar_gz(&mut self, archive: &str, dest: &str) -> std::io::Result<usize> {
        let bytes = self
            .files
            .get(archive)
            .cloned()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::NotFound, archive.to_string()))?;

        let mut tar = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
        let mut extracted = 0;
        for entry in tar.entries()? {
            let mut entry = entry?;
            if !entry.header().entry_type().is_file() {
                continue;
            }
            let rel = entry.path()?.to_string_lossy().to_string();
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            self.files.insert(join_remote(dest, &rel), content);
            extracted += 1;
        }
        Ok(extracted)
    }

    /// Copy every file below `remote_dir` into `local_dir`
    pub fn export_dir(&self, remote_dir: &str, local_dir: &Path) -> std::io::Result<()> {
        let prefix = format!("{}/", remote_dir.trim_end_matches('/'));
        for (path, content) in &self.files {
            if let Some(rel) = path.strip_prefix(&prefix) {
                let target = local_dir.join(rel);
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::write(target, content)?;
            }
        }
        Ok(())
    }

    /// Copy every file below `local_dir` into the store under `remote_dir`
    pub fn import_dir(&mut self, local_dir: &Path, remote_dir: &str) -> std::io::Result<()> {
        for entry in WalkDir::new(local_dir).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::other)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(local_dir)
                .map_err(std::io::Error::other)?
                .to_string_lossy()
                .replace('\\', "/");
            self.files
                .insert(join_remote(remote_dir, &rel), std::fs::read(entry.path())?);
        }
        Ok(())
    }
}

/// Runs a non-extraction command against the sandbox filesystem
pub type CommandHandler = Arc<dyn Fn(&str, &mut MemoryFs) -> ProcessOutput + Send + Sync>;

struct MemoryProcess {
    output: ProcessOutput,
    /// Status polls left before the process reports exit; `None` never exits
    polls_remaining: Option<usize>,
}

struct MemorySandbox {
    spec: SandboxSpec,
    fs: MemoryFs,
    processes: BTreeMap<String, MemoryProcess>,
    closed: bool,
}

#[derive(Default)]
struct State {
    next_sandbox: usize,
    next_pid: usize,
    sandboxes: BTreeMap<String, MemorySandbox>,
    calls: Vec<String>,
}

impl State {
    fn sandbox(&mut self, handle: &SandboxHandle) -> Result<&mut MemorySandbox> {
        let sandbox = self
            .sandboxes
            .get_mut(&handle.sandbox_id)
            .ok_or_else(|| SandboxError::SandboxNotFound(handle.sandbox_id.clone()))?;
        if sandbox.closed {
            return Err(SandboxError::SandboxClosed(handle.sandbox_id.clone()));
        }
        Ok(sandbox)
    }
}

/// In-memory transport with deterministic ids (`mem-sbx-1`, `mem-sbx-2`, ...)
#[derive(Default)]
pub struct MemoryTransport {
    state: Mutex<State>,
    handler: Option<CommandHandler>,
    polls_before_exit: usize,
    never_complete: bool,
    failing_downloads: BTreeSet<String>,
}

impl MemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_handler(
        mut self,
        handler: impl Fn(&str, &mut MemoryFs) -> ProcessOutput + Send + Sync + 'static,
    ) -> Self {
        self.handler = Some(Arc::new(handler));
        self
    }

    /// Report `Running` for this many status polls before exiting
    pub fn with_polls_before_exit(mut self, polls: usize) -> Self {
        self.polls_before_exit = polls;
        self
    }

    /// Non-extraction commands never finish
    pub fn never_completing(mut self) -> Self {
        self.never_complete = true;
        self
    }

    /// Downloads of `remote_path` fail with an API error
    pub fn with_failing_download(mut self, remote_path: impl Into<String>) -> Self {
        self.failing_downloads.insert(remote_path.into());
        self
    }

    /// Recorded operations, e.g. `create`, `upload:/home/user/x`, `exec:<cmd>`
    pub async fn calls(&self) -> Vec<String> {
        self.state.lock().await.calls.clone()
    }

    pub async fn read_file(&self, sandbox_id: &str, path: &str) -> Option<Vec<u8>> {
        let state = self.state.lock().await;
        state
            .sandboxes
            .get(sandbox_id)
            .and_then(|s| s.fs.read(path))
            .map(<[u8]>::to_vec)
    }

    pub async fn is_closed(&self, sandbox_id: &str) -> bool {
        let state = self.state.lock().await;
        state.sandboxes.get(sandbox_id).is_some_and(|s| s.closed)
    }

    pub async fn spec_of(&self, sandbox_id: &str) -> Option<SandboxSpec> {
        let state = self.state.lock().await;
        state.sandboxes.get(sandbox_id).map(|s| s.spec.clone())
    }

    fn run_command(&self, command: &str, fs: &mut MemoryFs) -> (ProcessOutput, bool) {
        let parts: Vec<&str> = command.split_whitespace().collect();
        if let ["tar", "-xzf", archive, "-C", dest] = parts.as_slice() {
            let output = match fs.extract_tar_gz(archive, dest) {
                Ok(count) => ProcessOutput::success(format!("extracted {} files", count)),
                Err(e) => ProcessOutput::failure(2, format!("tar: {}", e)),
            };
            return (output, false);
        }

        let output = match &self.handler {
            Some(handler) => handler(command, fs),
            None => ProcessOutput::success(""),
        };
        (output, self.never_complete)
    }
}

#[async_trait]
impl SandboxTransport for MemoryTransport {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let mut state = self.state.lock().await;
        state.next_sandbox += 1;
        let sandbox_id = format!("mem-sbx-{}", state.next_sandbox);
        state.calls.push("create".to_string());
        state.sandboxes.insert(
            sandbox_id.clone(),
            MemorySandbox {
                spec: spec.clone(),
                fs: MemoryFs::default(),
                processes: BTreeMap::new(),
                closed: false,
            },
        );

        let mut handle = SandboxHandle::new(sandbox_id);
        handle.metadata = spec.metadata.clone();
        Ok(handle)
    }

    async fn upload_file(
        &self,
        handle: &SandboxHandle,
        remote_path: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("upload:{}", remote_path));
        state.sandbox(handle)?.fs.write(remote_path, content);
        Ok(())
    }

    async fn execute_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<ProcessHandle> {
        let mut state = self.state.lock().await;
        state.next_pid += 1;
        let pid = format!("mem-proc-{}", state.next_pid);
        state.calls.push(format!("exec:{}", command));

        let sandbox = state.sandbox(handle)?;
        let (output, never) = self.run_command(command, &mut sandbox.fs);
        sandbox.processes.insert(
            pid.clone(),
            MemoryProcess {
                output,
                polls_remaining: if never {
                    None
                } else {
                    Some(self.polls_before_exit)
                },
            },
        );

        Ok(ProcessHandle {
            pid,
            command: command.to_string(),
        })
    }

    async fn get_process_status(
        &self,
        handle: &SandboxHandle,
        process: &ProcessHandle,
    ) -> Result<ProcessState> {
        let mut state = self.state.lock().await;
        let sandbox = state.sandbox(handle)?;
        let proc = sandbox
            .processes
            .get_mut(&process.pid)
            .ok_or_else(|| SandboxError::ProcessNotFound(process.pid.clone()))?;

        Ok(match proc.polls_remaining.as_mut() {
            None => ProcessState::Running,
            Some(0) => ProcessState::Exited(proc.output.exit_code.unwrap_or(0)),
            Some(n) => {
                *n -= 1;
                ProcessState::Running
            }
        })
    }

    async fn get_process_output(
        &self,
        handle: &SandboxHandle,
        process: &ProcessHandle,
    ) -> Result<ProcessOutput> {
        let mut state = self.state.lock().await;
        let sandbox = state.sandbox(handle)?;
        sandbox
            .processes
            .get(&process.pid)
            .map(|p| p.output.clone())
            .ok_or_else(|| SandboxError::ProcessNotFound(process.pid.clone()))
    }

    async fn download_file(&self, handle: &SandboxHandle, remote_path: &str) -> Result<Vec<u8>> {
        let mut state = self.state.lock().await;
        state.calls.push(format!("download:{}", remote_path));
        if self.failing_downloads.contains(remote_path) {
            return Err(SandboxError::Api {
                status: 500,
                message: format!("simulated download failure for {}", remote_path),
            });
        }
        state
            .sandbox(handle)?
            .fs
            .read(remote_path)
            .map(<[u8]>::to_vec)
            .ok_or_else(|| SandboxError::FileNotFound(remote_path.to_string()))
    }

    async fn list_files(&self, handle: &SandboxHandle, remote_dir: &str) -> Result<Vec<FileEntry>> {
        let mut state = self.state.lock().await;
        Ok(state.sandbox(handle)?.fs.list(remote_dir))
    }

    async fn close_sandbox(&self, handle: &SandboxHandle) -> Result<()> {
        let mut state = self.state.lock().await;
        state.calls.push("close".to_string());
        let sandbox = state
            .sandboxes
            .get_mut(&handle.sandbox_id)
            .ok_or_else(|| SandboxError::SandboxNotFound(handle.sandbox_id.clone()))?;
        sandbox.closed = true;
        Ok(())
    }
}
