// ABOUTME: Shared fixtures for the execution adapter integration tests
// ABOUTME: A three-row JSON-lines pipeline and an in-memory sandbox that runs the real worker

#![allow(dead_code)]

use osiris_core::constants::MANIFEST_FILE;
use osiris_core::{Manifest, SharedBuffer, StreamWriter};
use osiris_executions::CompiledPlan;
use osiris_sandbox::{MemoryFs, ProcessOutput};
use osiris_worker::{run_batch, ProxyWorker, WorkerConfig};
use serde_json::json;
use std::path::{Path, PathBuf};

/// extract (3 rows from input.jsonl) -> write
pub fn jsonl_pipeline(dir: &Path) -> CompiledPlan {
    let input = dir.join("input.jsonl");
    std::fs::write(
        &input,
        "{\"id\": 1, \"city\": \"Oslo\"}\n{\"id\": 2, \"city\": \"Rome\"}\n{\"id\": 3, \"city\": \"Lima\"}\n",
    )
    .unwrap();

    let build = dir.join("build");
    std::fs::create_dir_all(build.join("cfg")).unwrap();
    std::fs::write(
        build.join("cfg/extract.json"),
        json!({"component": "filesystem.jsonl_extractor", "path": input}).to_string(),
    )
    .unwrap();
    std::fs::write(
        build.join("cfg/write.json"),
        json!({"filename": "cities.jsonl"}).to_string(),
    )
    .unwrap();

    let manifest = json!({
        "pipeline": {"id": "cities", "name": "Cities"},
        "steps": [
            {"id": "extract", "driver": "filesystem.jsonl_extractor", "cfg_path": "cfg/extract.json"},
            {"id": "write", "driver": "filesystem.jsonl_writer", "cfg_path": "cfg/write.json", "needs": ["extract"]}
        ]
    });
    let manifest_path = build.join(MANIFEST_FILE);
    std::fs::write(&manifest_path, manifest.to_string()).unwrap();
    CompiledPlan::load(&manifest_path).unwrap()
}

/// Sandbox command handler that plays the bootstrap script: it copies the
/// extracted payload to `scratch`, runs the batch worker there, and copies
/// the session directory back into the sandbox filesystem.
pub fn worker_handler(
    scratch: PathBuf,
) -> impl Fn(&str, &mut MemoryFs) -> ProcessOutput + Send + Sync + 'static {
    move |command, fs| {
        let Some(root) = command
            .strip_prefix("sh ")
            .and_then(|script| script.strip_suffix("/bootstrap.sh"))
        else {
            return ProcessOutput::failure(127, format!("unexpected command: {}", command));
        };

        let local = scratch.join(root.trim_start_matches('/'));
        fs.export_dir(root, &local).unwrap();

        let (config, run_config) = WorkerConfig::load(&local).unwrap();
        let manifest = Manifest::from_path(local.join(MANIFEST_FILE)).unwrap();
        let mut worker = ProxyWorker::new(config, StreamWriter::new(SharedBuffer::new()));
        let report = run_batch(&mut worker, &run_config.session_id, &manifest).unwrap();

        fs.import_dir(&local.join("session"), &format!("{}/session", root))
            .unwrap();
        match report.error {
            None => ProcessOutput::success(""),
            Some(error) => ProcessOutput::failure(1, format!("Pipeline failed: {}", error)),
        }
    }
}
