// ABOUTME: Live E2B sandbox transport over the E2B control API and the in-sandbox envd API
// ABOUTME: Background processes are tracked through .out/.err/.exit files written inside the sandbox

use crate::error::{Result, SandboxError};
use crate::transport::{
    FileEntry, ProcessHandle, ProcessOutput, ProcessState, SandboxHandle, SandboxSpec,
    SandboxTransport, SANDBOX_HOME,
};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, info};

pub const DEFAULT_API_URL: &str = "https://api.e2b.app";
pub const DEFAULT_ENVD_URL_TEMPLATE: &str = "https://49983-{sandbox_id}.e2b.app";
pub const DEFAULT_TEMPLATE: &str = "base";

/// Directory holding process bookkeeping files inside the sandbox
const PROCESS_DIR: &str = "/tmp/osiris-proc";
const ACCESS_TOKEN_KEY: &str = "envd_access_token";

#[derive(Debug, Clone)]
pub struct E2BTransportConfig {
    pub api_key: String,
    pub api_url: String,
    /// envd base URL; `{sandbox_id}` is substituted per sandbox
    pub envd_url_template: String,
    pub request_timeout: Duration,
}

impl E2BTransportConfig {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            api_key: api_key.into(),
            api_url: DEFAULT_API_URL.to_string(),
            envd_url_template: DEFAULT_ENVD_URL_TEMPLATE.to_string(),
            request_timeout: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateSandboxResponse {
    #[serde(rename = "sandboxID")]
    sandbox_id: String,
    #[serde(default)]
    envd_access_token: Option<String>,
}

pub struct E2BTransport {
    client: Client,
    config: E2BTransportConfig,
}

impl E2BTransport {
    pub fn new(config: E2BTransportConfig) -> Result<Self> {
        if config.api_key.is_empty() {
            return Err(SandboxError::Config("E2B API key is required".to_string()));
        }
        let client = Client::builder().timeout(config.request_timeout).build()?;
        Ok(Self { client, config })
    }

    fn envd_url(&self, handle: &SandboxHandle) -> String {
        self.config
            .envd_url_template
            .replace("{sandbox_id}", &handle.sandbox_id)
            .trim_end_matches('/')
            .to_string()
    }

    fn envd(&self, builder: RequestBuilder, handle: &SandboxHandle) -> RequestBuilder {
        match handle.metadata.get(ACCESS_TOKEN_KEY) {
            Some(token) => builder.header("X-Access-Token", token),
            None => builder,
        }
    }

    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(SandboxError::Api {
            status: status.as_u16(),
            message,
        })
    }

    fn process_file(pid: &str, ext: &str) -> String {
        format!("{}/{}.{}", PROCESS_DIR, pid, ext)
    }

    /// Download a file, mapping 404 to `None`
    async fn try_download(&self, handle: &SandboxHandle, path: &str) -> Result<Option<Vec<u8>>> {
        match self.download_file(handle, path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(SandboxError::FileNotFound(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// Frame a JSON message for a Connect server-streaming request
fn connect_envelope(message: &Value) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(message)?;
    let mut body = Vec::with_capacity(payload.len() + 5);
    body.push(0u8);
    body.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    body.extend_from_slice(&payload);
    Ok(body)
}

fn entry_size(entry: &Value) -> u64 {
    match &entry["size"] {
        Value::Number(n) => n.as_u64().unwrap_or(0),
        Value::String(s) => s.parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl SandboxTransport for E2BTransport {
    async fn create_sandbox(&self, spec: &SandboxSpec) -> Result<SandboxHandle> {
        let body = json!({
            "templateID": spec.template.as_deref().unwrap_or(DEFAULT_TEMPLATE),
            "timeout": spec.timeout_secs,
            "envVars": spec.env,
            "metadata": spec.metadata,
            "cpuCount": spec.cpu,
            "memoryMB": spec.memory_gb * 1024,
        });
        let response = self
            .client
            .post(format!("{}/sandboxes", self.config.api_url.trim_end_matches('/')))
            .header("X-API-Key", &self.config.api_key)
            .json(&body)
            .send()
            .await?;
        let created: CreateSandboxResponse = Self::check(response).await?.json().await?;
        info!("Created E2B sandbox {}", created.sandbox_id);

        let mut handle = SandboxHandle::new(created.sandbox_id);
        handle.metadata = spec.metadata.clone();
        if let Some(token) = created.envd_access_token {
            handle.metadata.insert(ACCESS_TOKEN_KEY.to_string(), token);
        }
        Ok(handle)
    }

    async fn upload_file(
        &self,
        handle: &SandboxHandle,
        remote_path: &str,
        content: Vec<u8>,
    ) -> Result<()> {
        let file_name = remote_path.rsplit('/').next().unwrap_or(remote_path).to_string();
        let size = content.len();
        let form = reqwest::multipart::Form::new().part(
            "file",
            reqwest::multipart::Part::bytes(content).file_name(file_name),
        );
        let request = self
            .client
            .post(format!("{}/files", self.envd_url(handle)))
            .query(&[("path", remote_path), ("username", "user")])
            .multipart(form);
        Self::check(self.envd(request, handle).send().await?).await?;
        debug!("Uploaded {} bytes to {}", size, remote_path);
        Ok(())
    }

    async fn execute_command(
        &self,
        handle: &SandboxHandle,
        command: &str,
    ) -> Result<ProcessHandle> {
        let pid = uuid::Uuid::new_v4().simple().to_string();
        let wrapped = format!(
            "mkdir -p {dir} && (sh -c {cmd} > {out} 2> {err}; echo $? > {exit}.tmp && mv {exit}.tmp {exit}) &",
            dir = PROCESS_DIR,
            cmd = shell_quote(command),
            out = Self::process_file(&pid, "out"),
            err = Self::process_file(&pid, "err"),
            exit = Self::process_file(&pid, "exit"),
        );
        let message = json!({
            "process": {
                "cmd": "/bin/sh",
                "args": ["-c", wrapped],
                "envs": {},
                "cwd": SANDBOX_HOME,
            }
        });

        let request = self
            .client
            .post(format!("{}/process.Process/Start", self.envd_url(handle)))
            .header("Content-Type", "application/connect+json")
            .header("Connect-Protocol-Version", "1")
            .body(connect_envelope(&message)?);
        Self::check(self.envd(request, handle).send().await?).await?;
        debug!("Started process {} in sandbox {}", pid, handle.sandbox_id);

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
        let exit = self
            .try_download(handle, &Self::process_file(&process.pid, "exit"))
            .await?;
        Ok(match exit {
            None => ProcessState::Running,
            Some(bytes) => {
                let text = String::from_utf8_lossy(&bytes);
                ProcessState::Exited(text.trim().parse().unwrap_or(1))
            }
        })
    }

    async fn get_process_output(
        &self,
        handle: &SandboxHandle,
        process: &ProcessHandle,
    ) -> Result<ProcessOutput> {
        let read = |bytes: Option<Vec<u8>>| {
            bytes
                .map(|b| String::from_utf8_lossy(&b).to_string())
                .unwrap_or_default()
        };
        let stdout = read(
            self.try_download(handle, &Self::process_file(&process.pid, "out"))
                .await?,
        );
        let stderr = read(
            self.try_download(handle, &Self::process_file(&process.pid, "err"))
                .await?,
        );
        let exit_code = match self.get_process_status(handle, process).await? {
            ProcessState::Exited(code) => Some(code),
            ProcessState::Running => None,
        };
        Ok(ProcessOutput {
            stdout,
            stderr,
            exit_code,
        })
    }

    async fn download_file(&self, handle: &SandboxHandle, remote_path: &str) -> Result<Vec<u8>> {
        let request = self
            .client
            .get(format!("{}/files", self.envd_url(handle)))
            .query(&[("path", remote_path), ("username", "user")]);
        let response = self.envd(request, handle).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::FileNotFound(remote_path.to_string()));
        }
        Ok(Self::check(response).await?.bytes().await?.to_vec())
    }

    async fn list_files(&self, handle: &SandboxHandle, remote_dir: &str) -> Result<Vec<FileEntry>> {
        let request = self
            .client
            .post(format!(
                "{}/filesystem.Filesystem/ListDir",
                self.envd_url(handle)
            ))
            .header("Connect-Protocol-Version", "1")
            .json(&json!({"path": remote_dir, "depth": 16}));
        let response = self.envd(request, handle).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Err(SandboxError::FileNotFound(remote_dir.to_string()));
        }
        let listing: Value = Self::check(response).await?.json().await?;

        Ok(listing["entries"]
            .as_array()
            .map(|entries| {
                entries
                    .iter()
                    .filter_map(|entry| {
                        let path = entry["path"].as_str()?.to_string();
                        Some(FileEntry {
                            path,
                            is_dir: entry["type"].as_str() == Some("FILE_TYPE_DIRECTORY"),
                            size: entry_size(entry),
                        })
                    })
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn close_sandbox(&self, handle: &SandboxHandle) -> Result<()> {
        let response = self
            .client
            .delete(format!(
                "{}/sandboxes/{}",
                self.config.api_url.trim_end_matches('/'),
                handle.sandbox_id
            ))
            .header("X-API-Key", &self.config.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            debug!("Sandbox {} already gone", handle.sandbox_id);
            return Ok(());
        }
        Self::check(response).await?;
        info!("Closed E2B sandbox {}", handle.sandbox_id);
        Ok(())
    }
}
