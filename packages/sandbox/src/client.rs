// ABOUTME: High-level sandbox client on top of a transport
// ABOUTME: Payload upload and extraction, bounded polling with backoff, and best-effort artifact download

use crate::error::{Result, SandboxError};
use crate::transport::{
    ProcessHandle, ProcessOutput, ProcessState, SandboxHandle, SandboxSpec, SandboxStatus,
    SandboxTransport,
};
use osiris_core::constants::{
    ARTIFACTS_DIR, EVENTS_FILE, EXECUTION_LOG_FILE, METRICS_FILE, STATUS_FILE,
};
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

pub const PAYLOAD_ARCHIVE_NAME: &str = "payload.tar.gz";
pub const DEFAULT_INITIAL_INTERVAL: Duration = Duration::from_secs(1);
pub const EXTRACTION_TIMEOUT: Duration = Duration::from_secs(30);
const MAX_INTERVAL_SECS: f64 = 10.0;

/// How the poll interval grows between status checks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackoffPolicy {
    /// `min(interval * 1.5, 10s)`
    #[default]
    Exponential,
    /// `min(interval + 0.5s, 10s)`
    Linear,
}

impl BackoffPolicy {
    pub fn next(self, interval: Duration) -> Duration {
        let secs = interval.as_secs_f64();
        let next = match self {
            BackoffPolicy::Exponential => secs * 1.5,
            BackoffPolicy::Linear => secs + 0.5,
        };
        Duration::from_secs_f64(next.min(MAX_INTERVAL_SECS))
    }
}

/// Outcome of waiting for a sandbox process
#[derive(Debug, Clone, PartialEq)]
pub struct FinalStatus {
    pub status: SandboxStatus,
    /// `None` when the process never finished
    pub exit_code: Option<i32>,
    pub duration_seconds: f64,
    pub stdout: String,
    pub stderr: String,
}

/// Local files fetched from a sandbox session directory
#[derive(Debug, Clone, Default)]
pub struct ArtifactDownload {
    pub downloaded: Vec<PathBuf>,
    /// Remote path and error for every file that could not be fetched
    pub failures: Vec<(String, String)>,
}

pub struct SandboxClient {
    transport: Arc<dyn SandboxTransport>,
    initial_interval: Duration,
}

impl SandboxClient {
    pub fn new(transport: Arc<dyn SandboxTransport>) -> Self {
        Self {
            transport,
            initial_interval: DEFAULT_INITIAL_INTERVAL,
        }
    }

    /// First poll interval (1 s by default)
    pub fn with_initial_interval(mut self, interval: Duration) -> Self {
        self.initial_interval = interval;
        self
    }

    pub fn transport(&self) -> &Arc<dyn SandboxTransport> {
        &self.transport
    }

    pub async fn create(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        self.transport.create_sandbox(spec).await
    }

    /// Upload a payload archive into `remote_dir` and unpack it there.
    ///
    /// Extraction must finish successfully within 30 seconds.
    pub async fn upload_payload(
        &self,
        handle: &SandboxHandle,
        archive: Vec<u8>,
        remote_dir: &str,
    ) -> Result<()> {
        let remote_dir = remote_dir.trim_end_matches('/');
        let archive_path = format!("{}/{}", remote_dir, PAYLOAD_ARCHIVE_NAME);
        let size = archive.len();
        self.transport
            .upload_file(handle, &archive_path, archive)
            .await?;
        info!("Uploaded payload ({} bytes) to {}", size, archive_path);

        let command = format!("tar -xzf {} -C {}", archive_path, remote_dir);
        let process = self.transport.execute_command(handle, &command).await?;
        let result = self
            .poll_until_complete(handle, &process, EXTRACTION_TIMEOUT, BackoffPolicy::Exponential)
            .await?;

        if result.status != SandboxStatus::Success {
            return Err(SandboxError::Extraction {
                exit_code: result.exit_code,
                stderr: result.stderr,
            });
        }
        debug!("Payload extracted into {}", remote_dir);
        Ok(())
    }

    pub async fn start(&self, handle: &SandboxHandle, command: &str) -> Result<ProcessHandle> {
        info!("Starting `{}` in sandbox {}", command, handle.sandbox_id);
        self.transport.execute_command(handle, command).await
    }

    /// Poll a process until it exits or `timeout` elapses.
    ///
    /// Past the deadline the result is `Timeout` with no exit code. Sleeps
    /// never overrun the remaining time.
    pub async fn poll_until_complete(
        &self,
        handle: &SandboxHandle,
        process: &ProcessHandle,
        timeout: Duration,
        backoff: BackoffPolicy,
    ) -> Result<FinalStatus> {
        let started = Instant::now();
        let mut interval = self.initial_interval;

        loop {
            let elapsed = started.elapsed();
            if elapsed >= timeout {
                warn!(
                    "Process {} did not finish within {:.1}s",
                    process.pid,
                    timeout.as_secs_f64()
                );
                return Ok(FinalStatus {
                    status: SandboxStatus::Timeout,
                    exit_code: None,
                    duration_seconds: elapsed.as_secs_f64(),
                    stdout: String::new(),
                    stderr: String::new(),
                });
            }

            if let ProcessState::Exited(code) =
                self.transport.get_process_status(handle, process).await?
            {
                let ProcessOutput {
                    stdout,
                    stderr,
                    exit_code,
                } = self.transport.get_process_output(handle, process).await?;
                let exit_code = exit_code.unwrap_or(code);
                return Ok(FinalStatus {
                    status: if exit_code == 0 {
                        SandboxStatus::Success
                    } else {
                        SandboxStatus::Failed
                    },
                    exit_code: Some(exit_code),
                    duration_seconds: started.elapsed().as_secs_f64(),
                    stdout,
                    stderr,
                });
            }

            let remaining = timeout.saturating_sub(started.elapsed());
            tokio::time::sleep(interval.min(remaining)).await;
            interval = backoff.next(interval);
        }
    }

    /// Fetch logs, status, and the `artifacts/` tree of a remote session.
    ///
    /// Individual failures are recorded and never stop the remaining downloads.
    pub async fn download_artifacts(
        &self,
        handle: &SandboxHandle,
        remote_session_dir: &str,
        local_dir: &Path,
    ) -> ArtifactDownload {
        let remote_session_dir = remote_session_dir.trim_end_matches('/');
        let mut result = ArtifactDownload::default();

        if let Err(e) = std::fs::create_dir_all(local_dir) {
            result
                .failures
                .push((local_dir.display().to_string(), e.to_string()));
            return result;
        }

        for name in [EVENTS_FILE, METRICS_FILE, EXECUTION_LOG_FILE, STATUS_FILE] {
            let remote = format!("{}/{}", remote_session_dir, name);
            self.fetch(handle, &remote, &local_dir.join(name), &mut result)
                .await;
        }

        let remote_artifacts = format!("{}/{}", remote_session_dir, ARTIFACTS_DIR);
        match self.transport.list_files(handle, &remote_artifacts).await {
            Ok(entries) => {
                for entry in entries.into_iter().filter(|e| !e.is_dir) {
                    let Some(rel) = entry
                        .path
                        .strip_prefix(&remote_artifacts)
                        .map(|r| r.trim_start_matches('/'))
                    else {
                        continue;
                    };
                    if !is_contained(rel) {
                        warn!("Refusing artifact outside {}: {}", remote_artifacts, entry.path);
                        result
                            .failures
                            .push((entry.path.clone(), "path escapes artifacts dir".to_string()));
                        continue;
                    }
                    let local = local_dir.join(ARTIFACTS_DIR).join(rel);
                    self.fetch(handle, &entry.path, &local, &mut result).await;
                }
            }
            Err(e) => {
                warn!("Failed to list {}: {}", remote_artifacts, e);
                result.failures.push((remote_artifacts, e.to_string()));
            }
        }

        info!(
            "Downloaded {} artifacts from sandbox {} ({} failures)",
            result.downloaded.len(),
            handle.sandbox_id,
            result.failures.len()
        );
        result
    }

    async fn fetch(
        &self,
        handle: &SandboxHandle,
        remote: &str,
        local: &Path,
        result: &mut ArtifactDownload,
    ) {
        let written = match self.transport.download_file(handle, remote).await {
            Ok(bytes) => local
                .parent()
                .map_or(Ok(()), std::fs::create_dir_all)
                .and_then(|_| std::fs::write(local, bytes))
                .map_err(|e| e.to_string()),
            Err(e) => Err(e.to_string()),
        };
        match written {
            Ok(()) => result.downloaded.push(local.to_path_buf()),
            Err(e) => {
                warn!("Failed to download {}: {}", remote, e);
                result.failures.push((remote.to_string(), e));
            }
        }
    }

    /// Destroy the sandbox; the caller decides how to report failure
    pub async fn close(&self, handle: &SandboxHandle) -> Result<()> {
        self.transport.close_sandbox(handle).await
    }
}

/// Relative path made only of normal components
fn is_contained(rel: &str) -> bool {
    !rel.is_empty()
        && Path::new(rel)
            .components()
            .all(|c| matches!(c, Component::Normal(_) | Component::CurDir))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryTransport;
    use rstest::rstest;

    #[rstest]
    #[case(BackoffPolicy::Exponential, 1.0, 1.5)]
    #[case(BackoffPolicy::Exponential, 8.0, 10.0)]
    #[case(BackoffPolicy::Linear, 1.0, 1.5)]
    #[case(BackoffPolicy::Linear, 9.8, 10.0)]
    fn test_backoff_is_capped(
        #[case] policy: BackoffPolicy,
        #[case] current: f64,
        #[case] expected: f64,
    ) {
        let next = policy.next(Duration::from_secs_f64(current));
        assert!((next.as_secs_f64() - expected).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_poll_times_out_without_exit_code() {
        let transport = Arc::new(MemoryTransport::new().never_completing());
        let client = SandboxClient::new(transport.clone());
        let handle = client.create(&SandboxSpec::default()).await.unwrap();
        let process = client.start(&handle, "sleep forever").await.unwrap();

        let started = Instant::now();
        let status = client
            .poll_until_complete(
                &handle,
                &process,
                Duration::from_millis(100),
                BackoffPolicy::Exponential,
            )
            .await
            .unwrap();

        assert_eq!(status.status, SandboxStatus::Timeout);
        assert_eq!(status.exit_code, None);
        assert!(started.elapsed() < Duration::from_millis(900));
    }

    #[tokio::test]
    async fn test_poll_reports_failure_output() {
        let transport = Arc::new(
            MemoryTransport::new()
                .with_polls_before_exit(2)
                .with_handler(|_, _| ProcessOutput::failure(3, "driver crashed")),
        );
        let client = SandboxClient::new(transport).with_initial_interval(Duration::from_millis(5));
        let handle = client.create(&SandboxSpec::default()).await.unwrap();
        let process = client.start(&handle, "run").await.unwrap();

        let status = client
            .poll_until_complete(&handle, &process, Duration::from_secs(5), BackoffPolicy::Linear)
            .await
            .unwrap();
        assert_eq!(status.status, SandboxStatus::Failed);
        assert_eq!(status.exit_code, Some(3));
        assert_eq!(status.stderr, "driver crashed");
    }

    #[tokio::test]
    async fn test_extraction_failure_is_hard_error() {
        let client = SandboxClient::new(Arc::new(MemoryTransport::new()))
            .with_initial_interval(Duration::from_millis(5));
        let handle = client.create(&SandboxSpec::default()).await.unwrap();

        let err = client
            .upload_payload(&handle, b"not a gzip".to_vec(), "/home/user/payload")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Extraction { exit_code: Some(2), .. }));
    }

    #[tokio::test]
    async fn test_artifact_download_is_best_effort() {
        let transport = Arc::new(
            MemoryTransport::new().with_failing_download("/home/user/session/metrics.jsonl"),
        );
        let client = SandboxClient::new(transport.clone());
        let handle = client.create(&SandboxSpec::default()).await.unwrap();
        for (path, body) in [
            ("/home/user/session/events.jsonl", "{}\n"),
            ("/home/user/session/metrics.jsonl", "{}\n"),
            ("/home/user/session/artifacts/extract/cleaned_config.json", "{}"),
        ] {
            transport
                .upload_file(&handle, path, body.as_bytes().to_vec())
                .await
                .unwrap();
        }

        let tmp = tempfile::tempdir().unwrap();
        let result = client
            .download_artifacts(&handle, "/home/user/session", tmp.path())
            .await;

        assert!(tmp.path().join("events.jsonl").exists());
        assert!(tmp
            .path()
            .join("artifacts/extract/cleaned_config.json")
            .exists());
        let failed: Vec<&str> = result.failures.iter().map(|(p, _)| p.as_str()).collect();
        assert!(failed.contains(&"/home/user/session/metrics.jsonl"));
        assert!(failed.contains(&"/home/user/session/osiris.log"));
        assert_eq!(result.downloaded.len(), 2);
    }

    #[tokio::test]
    async fn test_artifact_paths_cannot_leave_local_dir() {
        let transport = Arc::new(MemoryTransport::new());
        let client = SandboxClient::new(transport.clone());
        let handle = client.create(&SandboxSpec::default()).await.unwrap();
        for path in [
            "/home/user/session/artifacts/../../../../escaped.txt",
            "/home/user/session/artifacts/write/output.jsonl",
        ] {
            transport
                .upload_file(&handle, path, b"{}".to_vec())
                .await
                .unwrap();
        }

        let tmp = tempfile::tempdir().unwrap();
        let local_dir = tmp.path().join("a/b/c/remote");
        let result = client
            .download_artifacts(&handle, "/home/user/session", &local_dir)
            .await;

        assert!(!tmp.path().join("a/escaped.txt").exists());
        assert!(local_dir.join("artifacts/write/output.jsonl").exists());
        assert!(result
            .downloaded
            .iter()
            .all(|p| !p.to_string_lossy().contains("..")));
        assert!(result
            .failures
            .iter()
            .any(|(p, _)| p.ends_with("../../../../escaped.txt")));
    }

    #[rstest]
    #[case("extract/cleaned_config.json", true)]
    #[case("./out.jsonl", true)]
    #[case("../escaped.txt", false)]
    #[case("a/../../b", false)]
    #[case("/etc/passwd", false)]
    #[case("", false)]
    fn test_is_contained(#[case] rel: &str, #[case] expected: bool) {
        assert_eq!(is_contained(rel), expected);
    }
}
