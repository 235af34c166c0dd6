// ABOUTME: End-to-end sandbox session against the in-memory transport
// ABOUTME: Builds a real payload, uploads and extracts it, runs a command, and downloads artifacts

use osiris_core::{Manifest, RunConfig};
use osiris_sandbox::{
    BackoffPolicy, MemoryTransport, PayloadBuilder, ProcessOutput, SandboxClient, SandboxSpec,
    SandboxStatus, SANDBOX_HOME,
};
use pretty_assertions::assert_eq;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

fn build_payload(dir: &Path) -> osiris_sandbox::Payload {
    let cfg_root = dir.join("compiled");
    std::fs::create_dir_all(&cfg_root).unwrap();
    std::fs::write(cfg_root.join("extract.json"), r#"{"path": "in.jsonl"}"#).unwrap();
    let manifest = Manifest::from_json(
        r#"{"pipeline": {"id": "demo", "name": "Demo"}, "steps": [
            {"id": "extract", "driver": "filesystem.jsonl_extractor", "cfg_path": "extract.json"}
        ]}"#,
    )
    .unwrap();

    PayloadBuilder::new(dir.join("stage"), dir.join("out"))
        .build(&manifest, &cfg_root, &RunConfig::new("sess-1", "demo"))
        .unwrap()
}

#[tokio::test]
async fn test_payload_runs_and_artifacts_come_back() {
    let tmp = tempfile::tempdir().unwrap();
    let payload = build_payload(tmp.path());
    let remote_dir = format!("{}/sess-1", SANDBOX_HOME);

    let session_dir = format!("{}/session", remote_dir);
    let transport = Arc::new(MemoryTransport::new().with_handler(move |command, fs| {
        if !command.starts_with("sh ") {
            return ProcessOutput::failure(127, "unknown command");
        }
        fs.write(format!("{}/events.jsonl", session_dir), b"{\"event\":\"run_start\"}\n".to_vec());
        fs.write(format!("{}/status.json", session_dir), b"{\"ok\":true}".to_vec());
        fs.write(
            format!("{}/artifacts/extract/cleaned_config.json", session_dir),
            b"{}".to_vec(),
        );
        ProcessOutput::success("done")
    }));

    let client = SandboxClient::new(transport.clone()).with_initial_interval(Duration::from_millis(5));
    let handle = client.create(&SandboxSpec::default()).await.unwrap();

    client
        .upload_payload(&handle, payload.read_archive().unwrap(), &remote_dir)
        .await
        .unwrap();
    let manifest_path = format!("{}/manifest.json", remote_dir);
    assert!(transport
        .read_file(&handle.sandbox_id, &manifest_path)
        .await
        .is_some());
    assert!(transport
        .read_file(&handle.sandbox_id, &format!("{}/cfg/extract.json", remote_dir))
        .await
        .is_some());

    let process = client
        .start(&handle, &format!("sh {}/bootstrap.sh", remote_dir))
        .await
        .unwrap();
    let status = client
        .poll_until_complete(&handle, &process, Duration::from_secs(5), BackoffPolicy::Linear)
        .await
        .unwrap();
    assert_eq!(status.status, SandboxStatus::Success);
    assert_eq!(status.stdout, "done");

    let local = tmp.path().join("remote");
    let download = client
        .download_artifacts(&handle, &format!("{}/session", remote_dir), &local)
        .await;
    assert!(local.join("status.json").exists());
    assert!(local.join("artifacts/extract/cleaned_config.json").exists());
    // metrics.jsonl and osiris.log were never written
    assert_eq!(download.failures.len(), 2);

    client.close(&handle).await.unwrap();
    assert!(transport.is_closed(&handle.sandbox_id).await);
}
