// ABOUTME: E2B adapter over the in-memory transport running the real batch worker
// ABOUTME: Covers local/remote parity, credentials, timeouts, remote failures, and teardown

mod common;

use osiris_core::constants::{EVENTS_FILE, METRICS_FILE};
use osiris_core::{read_jsonl, ExecutionContext};
use osiris_executions::{
    load_normalized, CollectError, E2BAdapter, E2BConfig, ExecuteError, ExecutionAdapter,
    LocalAdapter, SandboxPhase, REMOTE_DIR,
};
use osiris_sandbox::{BackoffPolicy, MemoryTransport, ProcessOutput};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::{Duration, Instant};

fn config() -> E2BConfig {
    E2BConfig::default().with_api_key("e2b_test_key")
}

fn adapter(transport: Arc<MemoryTransport>, config: E2BConfig) -> E2BAdapter {
    E2BAdapter::new(config)
        .with_transport(transport)
        .with_poll_interval(Duration::from_millis(10), BackoffPolicy::Linear)
}

#[tokio::test]
async fn test_remote_run_matches_local_run() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = common::jsonl_pipeline(tmp.path());

    let local_ctx = ExecutionContext::new("run_local", tmp.path().join("runs"));
    let local = LocalAdapter::new();
    let prepared = local.prepare(&plan, &local_ctx).await.unwrap();
    assert!(local.execute(prepared, &local_ctx).await.unwrap().success);
    let local_artifacts = local.collect(&local_ctx).await.unwrap();

    let transport = Arc::new(
        MemoryTransport::new()
            .with_handler(common::worker_handler(tmp.path().join("sandbox")))
            .with_polls_before_exit(2),
    );
    let remote_ctx = ExecutionContext::new("run_remote", tmp.path().join("runs"));
    let remote = adapter(Arc::clone(&transport), config());
    let prepared = remote.prepare(&plan, &remote_ctx).await.unwrap();
    let result = remote.execute(prepared, &remote_ctx).await.unwrap();

    assert!(result.success, "{:?}", result.error_message);
    assert_eq!(result.exit_code, 0);
    assert_eq!(result.step_results.len(), 2);
    assert_eq!(remote.phase().await, SandboxPhase::Closed);
    assert!(transport.is_closed("mem-sbx-1").await);

    let remote_artifacts = remote.collect(&remote_ctx).await.unwrap();
    let remote_events = remote_artifacts.events_log.clone().unwrap();
    assert!(remote_events.starts_with(remote_ctx.logs_dir().join(REMOTE_DIR)));
    assert!(read_jsonl(&remote_events)
        .unwrap()
        .iter()
        .all(|e| e["source"] == "remote"));

    assert_eq!(
        load_normalized(&remote_events).unwrap(),
        load_normalized(local_artifacts.events_log.unwrap()).unwrap()
    );
    assert_eq!(
        load_normalized(remote_artifacts.metrics_log.unwrap()).unwrap(),
        load_normalized(local_artifacts.metrics_log.unwrap()).unwrap()
    );

    let written = remote_artifacts
        .artifacts_dir
        .unwrap()
        .join("write/cities.jsonl");
    assert_eq!(std::fs::read_to_string(written).unwrap().lines().count(), 3);
    assert_eq!(remote_artifacts.metadata["sandbox_id"], "mem-sbx-1");
    assert_eq!(remote_artifacts.metadata["final_status"], "success");
    assert!(remote_ctx.logs_dir().join("payload_manifest.json").exists());
}

#[tokio::test]
async fn test_missing_credential_is_typed_and_creates_nothing() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = common::jsonl_pipeline(tmp.path());
    let ctx = ExecutionContext::new("run_nokey", tmp.path().join("runs"));
    let transport = Arc::new(MemoryTransport::new());
    let adapter = adapter(Arc::clone(&transport), E2BConfig::default());

    let prepared = adapter.prepare(&plan, &ctx).await.unwrap();
    let err = adapter.execute(prepared, &ctx).await.unwrap_err();

    assert!(matches!(err, ExecuteError::MissingCredential("E2B_API_KEY")));
    assert!(transport.calls().await.is_empty());
    assert!(matches!(
        adapter.collect(&ctx).await,
        Err(CollectError::NoSandbox)
    ));
}

#[tokio::test]
async fn test_timeout_reports_failure_and_still_closes() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = common::jsonl_pipeline(tmp.path());
    let ctx = ExecutionContext::new("run_slow", tmp.path().join("runs"));
    let transport = Arc::new(MemoryTransport::new().never_completing());
    let adapter = adapter(Arc::clone(&transport), config().with_timeout_secs(1));

    let prepared = adapter.prepare(&plan, &ctx).await.unwrap();
    let started = Instant::now();
    let result = adapter.execute(prepared, &ctx).await.unwrap();

    assert!(started.elapsed() < Duration::from_secs(5));
    assert!(!result.success);
    assert_eq!(result.exit_code, 1);
    assert!(result.error_message.unwrap().contains("timed out"));
    assert!(transport.is_closed("mem-sbx-1").await);
    assert_eq!(adapter.phase().await, SandboxPhase::Closed);

    let collected = adapter.collect(&ctx).await.unwrap();
    assert!(collected.events_log.is_none());
    assert_eq!(collected.metadata["final_status"], "timeout");
}

#[tokio::test]
async fn test_remote_failure_surfaces_exit_code_and_stderr() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = common::jsonl_pipeline(tmp.path());
    let ctx = ExecutionContext::new("run_fail", tmp.path().join("runs"));
    let transport = Arc::new(
        MemoryTransport::new().with_handler(|_, _| ProcessOutput::failure(3, "worker crashed")),
    );
    let adapter = adapter(Arc::clone(&transport), config());

    let prepared = adapter.prepare(&plan, &ctx).await.unwrap();
    let result = adapter.execute(prepared, &ctx).await.unwrap();

    assert!(!result.success);
    assert_eq!(result.exit_code, 3);
    assert_eq!(
        result.error_message.as_deref(),
        Some("Sandbox process exited with code 3: worker crashed")
    );
    assert!(result.step_results.is_empty());
    assert!(transport.is_closed("mem-sbx-1").await);
}

#[tokio::test]
async fn test_sandbox_gets_resources_and_passthrough_env() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = common::jsonl_pipeline(tmp.path());
    let ctx = ExecutionContext::new("run_spec", tmp.path().join("runs"));
    let transport = Arc::new(MemoryTransport::new());
    let mut config = config();
    config.cpu = 8;
    config.env.insert("REGION".to_string(), "eu".to_string());
    let adapter = adapter(Arc::clone(&transport), config);

    let prepared = adapter.prepare(&plan, &ctx).await.unwrap();
    adapter.execute(prepared, &ctx).await.unwrap();

    let spec = transport.spec_of("mem-sbx-1").await.unwrap();
    assert_eq!(spec.cpu, 8);
    assert_eq!(spec.env["REGION"], "eu");
    assert_eq!(spec.metadata["session_id"], "run_spec");

    let calls = transport.calls().await;
    assert_eq!(calls.first().map(String::as_str), Some("create"));
    assert!(calls.contains(&"upload:/home/user/run_spec/payload.tar.gz".to_string()));
    assert!(calls.contains(&"exec:sh /home/user/run_spec/bootstrap.sh".to_string()));
    assert_eq!(calls.last().map(String::as_str), Some("close"));
}

#[tokio::test]
async fn test_collect_tags_metrics_too() {
    let tmp = tempfile::tempdir().unwrap();
    let plan = common::jsonl_pipeline(tmp.path());
    let ctx = ExecutionContext::new("run_tags", tmp.path().join("runs"));
    let transport = Arc::new(
        MemoryTransport::new().with_handler(common::worker_handler(tmp.path().join("sandbox"))),
    );
    let adapter = adapter(transport, config());

    let prepared = adapter.prepare(&plan, &ctx).await.unwrap();
    adapter.execute(prepared, &ctx).await.unwrap();
    adapter.collect(&ctx).await.unwrap();

    let remote = ctx.logs_dir().join(REMOTE_DIR);
    for name in [EVENTS_FILE, METRICS_FILE] {
        let records = read_jsonl(remote.join(name)).unwrap();
        assert!(!records.is_empty());
        assert!(records.iter().all(|r| r["source"] == "remote"));
    }
}
