// ABOUTME: Payload staging, packaging, and independent validation for sandbox runs
// ABOUTME: Produces an allowlisted, deterministic, size-bounded gzip tar with a SHA-256 digest

use chrono::Utc;
use flate2::read::GzDecoder;
use flate2::{Compression, GzBuilder};
use osiris_core::run_config::RUN_CONFIG_FILE;
use osiris_core::{CoreError, Manifest, RunConfig};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

pub use osiris_core::constants::{MANIFEST_FILE, REQUIREMENTS_FILE};
pub const BOOTSTRAP_FILE: &str = "bootstrap.sh";
pub const CFG_DIR: &str = "cfg";
pub const PAYLOAD_MANIFEST_FILE: &str = "payload_manifest.json";
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 10 * 1024 * 1024;

/// Starts the batch worker from the extracted payload directory
pub const DEFAULT_BOOTSTRAP: &str = r#"#!/bin/sh
set -e
cd "$(dirname "$0")"
exec osiris-worker run --payload-dir "$(pwd)"
"#;

#[derive(Error, Debug)]
pub enum PayloadError {
    #[error(
        "Missing config files for {} step(s): {}. Recompile the pipeline so every cfg_path exists under {}",
        .missing.len(),
        .missing.join(", "),
        .cfg_root.display()
    )]
    MissingConfigs {
        missing: Vec<String>,
        cfg_root: PathBuf,
    },

    #[error("Config files {first} and {second} both ship as {name}")]
    ConflictingConfigs {
        name: String,
        first: PathBuf,
        second: PathBuf,
    },

    #[error("Files outside the payload allowlist: {}", .0.join(", "))]
    AllowlistViolation(Vec<String>),

    #[error("Payload is {size} bytes, exceeding the {limit} byte limit")]
    TooLarge { size: u64, limit: u64 },

    #[error("Payload hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Core(#[from] CoreError),
}

pub type Result<T> = std::result::Result<T, PayloadError>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PayloadFile {
    pub name: String,
    pub size_bytes: u64,
}

/// Audit record persisted next to the archive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PayloadManifest {
    pub files: Vec<PayloadFile>,
    pub total_size_bytes: u64,
    pub sha256: String,
    pub created_at: String,
}

#[derive(Debug, Clone)]
pub struct Payload {
    pub archive_path: PathBuf,
    pub manifest: PayloadManifest,
}

impl Payload {
    pub fn read_archive(&self) -> Result<Vec<u8>> {
        Ok(std::fs::read(&self.archive_path)?)
    }
}

/// Archive name for a step's cfg file, `cfg/<path>` unless already prefixed
pub fn shipped_cfg_path(cfg_path: &str) -> String {
    let trimmed = cfg_path.trim_start_matches("./");
    if trimmed.starts_with("cfg/") {
        trimmed.to_string()
    } else {
        format!("{}/{}", CFG_DIR, trimmed)
    }
}

/// Archive name for one step's config.
///
/// Steps sharing a source file share its entry. A different file that maps to
/// an already shipped name moves to `cfg/<step_id>.json`.
fn claim_cfg_name(
    sources: &mut BTreeMap<String, PathBuf>,
    step_id: &str,
    cfg_path: &str,
    source: PathBuf,
) -> Result<String> {
    let preferred = shipped_cfg_path(cfg_path);
    let fallback = format!("{}/{}.json", CFG_DIR, step_id);
    for name in [preferred, fallback] {
        match sources.get(&name) {
            None => {
                sources.insert(name.clone(), source);
                return Ok(name);
            }
            Some(existing) if *existing == source => return Ok(name),
            Some(existing) => {
                debug!(
                    "{} already ships {}, renaming config of step {}",
                    existing.display(),
                    name,
                    step_id
                );
            }
        }
    }
    let name = format!("{}/{}.json", CFG_DIR, step_id);
    Err(PayloadError::ConflictingConfigs {
        first: sources.get(&name).cloned().unwrap_or_default(),
        second: source,
        name,
    })
}

/// Whether an archive entry name is allowed in any payload
pub fn is_allowlisted(name: &str) -> bool {
    if [MANIFEST_FILE, BOOTSTRAP_FILE, REQUIREMENTS_FILE, RUN_CONFIG_FILE].contains(&name) {
        return true;
    }
    name.strip_prefix("cfg/").is_some_and(|rest| {
        rest.ends_with(".json")
            && !rest.split('/').any(|part| part.is_empty() || part == "..")
    })
}

pub struct PayloadBuilder {
    staging_dir: PathBuf,
    output_dir: PathBuf,
    max_size_bytes: u64,
    bootstrap: String,
    requirements: Vec<String>,
}

impl PayloadBuilder {
    /// `staging_dir` is rebuilt from scratch; the archive and its audit
    /// record land in `output_dir`
    pub fn new(staging_dir: impl Into<PathBuf>, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            staging_dir: staging_dir.into(),
            output_dir: output_dir.into(),
            max_size_bytes: DEFAULT_MAX_PAYLOAD_BYTES,
            bootstrap: DEFAULT_BOOTSTRAP.to_string(),
            requirements: Vec::new(),
        }
    }

    pub fn with_max_size(mut self, bytes: u64) -> Self {
        self.max_size_bytes = bytes;
        self
    }

    pub fn with_bootstrap(mut self, script: impl Into<String>) -> Self {
        self.bootstrap = script.into();
        self
    }

    /// Pinned dependency list written to `requirements.txt`
    pub fn with_requirements(mut self, requirements: Vec<String>) -> Self {
        self.requirements = requirements;
        self
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    /// Stage and package in one go
    pub fn build(
        &self,
        manifest: &Manifest,
        cfg_root: &Path,
        run_config: &RunConfig,
    ) -> Result<Payload> {
        let expected = self.stage(manifest, cfg_root, run_config)?;
        self.package(&expected)
    }

    /// Write the allowlisted file set into a fresh staging directory.
    ///
    /// Returns the archive names that `package` must find there.
    pub fn stage(
        &self,
        manifest: &Manifest,
        cfg_root: &Path,
        run_config: &RunConfig,
    ) -> Result<BTreeSet<String>> {
        let missing: Vec<String> = manifest
            .steps
            .iter()
            .filter(|step| !cfg_root.join(&step.cfg_path).is_file())
            .map(|step| format!("{} ({})", step.cfg_path, step.id))
            .collect();
        if !missing.is_empty() {
            return Err(PayloadError::MissingConfigs {
                missing,
                cfg_root: cfg_root.to_path_buf(),
            });
        }

        if self.staging_dir.exists() {
            std::fs::remove_dir_all(&self.staging_dir)?;
        }
        std::fs::create_dir_all(self.staging_dir.join(CFG_DIR))?;

        let mut expected = BTreeSet::new();
        let mut sources: BTreeMap<String, PathBuf> = BTreeMap::new();
        let mut shipped = manifest.clone();
        for step in &mut shipped.steps {
            let source = std::fs::canonicalize(cfg_root.join(&step.cfg_path))?;
            let name = claim_cfg_name(&mut sources, &step.id, &step.cfg_path, source)?;
            let target = self.staging_dir.join(&name);
            if !target.exists() {
                if let Some(parent) = target.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                std::fs::copy(cfg_root.join(&step.cfg_path), &target)?;
            }
            step.cfg_path = name.clone();
            expected.insert(name);
        }

        self.write_staged(&mut expected, MANIFEST_FILE, shipped.to_json_pretty()?)?;
        self.write_staged(&mut expected, BOOTSTRAP_FILE, self.bootstrap.clone())?;
        let mut requirements = self.requirements.join("\n");
        if !requirements.is_empty() {
            requirements.push('\n');
        }
        self.write_staged(&mut expected, REQUIREMENTS_FILE, requirements)?;
        self.write_staged(&mut expected, RUN_CONFIG_FILE, run_config.to_json_pretty()?)?;

        debug!(
            "Staged {} payload files in {}",
            expected.len(),
            self.staging_dir.display()
        );
        Ok(expected)
    }

    fn write_staged(
        &self,
        expected: &mut BTreeSet<String>,
        name: &str,
        content: String,
    ) -> Result<()> {
        std::fs::write(self.staging_dir.join(name), content)?;
        expected.insert(name.to_string());
        Ok(())
    }

    /// Names in the staging dir that are not expected files or their parent dirs
    fn violations(&self, expected: &BTreeSet<String>) -> Result<Vec<String>> {
        let allowed_dirs: BTreeSet<String> = expected
            .iter()
            .flat_map(|name| {
                let parts: Vec<&str> = name.split('/').collect();
                (1..parts.len())
                    .map(|n| parts[..n].join("/"))
                    .collect::<Vec<_>>()
            })
            .collect();

        let mut violations = Vec::new();
        for entry in WalkDir::new(&self.staging_dir).min_depth(1).sort_by_file_name() {
            let entry = entry.map_err(std::io::Error::other)?;
            let rel = entry
                .path()
                .strip_prefix(&self.staging_dir)
                .map_err(std::io::Error::other)?
                .to_string_lossy()
                .replace('\\', "/");
            let ok = if entry.file_type().is_dir() {
                allowed_dirs.contains(&rel)
            } else {
                expected.contains(&rel) && is_allowlisted(&rel)
            };
            if !ok {
                violations.push(rel);
            }
        }
        Ok(violations)
    }

    /// Archive the staged files deterministically and persist the audit record
    pub fn package(&self, expected: &BTreeSet<String>) -> Result<Payload> {
        let violations = self.violations(expected)?;
        if !violations.is_empty() {
            return Err(PayloadError::AllowlistViolation(violations));
        }

        let mut files = Vec::with_capacity(expected.len());
        let encoder = GzBuilder::new().mtime(0).write(Vec::new(), Compression::default());
        let mut tar = tar::Builder::new(encoder);
        tar.mode(tar::HeaderMode::Deterministic);

        for name in expected {
            let content = std::fs::read(self.staging_dir.join(name))?;
            let mut header = tar::Header::new_gnu();
            header.set_size(content.len() as u64);
            header.set_mode(if name == BOOTSTRAP_FILE { 0o755 } else { 0o644 });
            header.set_mtime(0);
            header.set_uid(0);
            header.set_gid(0);
            header.set_cksum();
            tar.append_data(&mut header, name, content.as_slice())?;
            files.push(PayloadFile {
                name: name.clone(),
                size_bytes: content.len() as u64,
            });
        }

        let archive = tar.into_inner()?.finish()?;
        let size = archive.len() as u64;
        if size > self.max_size_bytes {
            return Err(PayloadError::TooLarge {
                size,
                limit: self.max_size_bytes,
            });
        }

        let manifest = PayloadManifest {
            total_size_bytes: files.iter().map(|f| f.size_bytes).sum(),
            files,
            sha256: hex::encode(Sha256::digest(&archive)),
            created_at: Utc::now().to_rfc3339(),
        };

        std::fs::create_dir_all(&self.output_dir)?;
        let archive_path = self.output_dir.join(crate::client::PAYLOAD_ARCHIVE_NAME);
        std::fs::write(&archive_path, &archive)?;
        std::fs::write(
            self.output_dir.join(PAYLOAD_MANIFEST_FILE),
            serde_json::to_vec_pretty(&manifest)?,
        )?;
        info!(
            "Built payload {} ({} bytes, sha256 {})",
            archive_path.display(),
            size,
            manifest.sha256
        );

        Ok(Payload {
            archive_path,
            manifest,
        })
    }
}

/// Re-open a built archive and check its digest and contents.
///
/// Shares nothing with the build path: entries are read back from the
/// compressed bytes and checked against the fixed allowlist.
pub fn validate_payload(archive_path: &Path, expected_sha256: &str) -> Result<Vec<PayloadFile>> {
    let bytes = std::fs::read(archive_path)?;
    let actual = hex::encode(Sha256::digest(&bytes));
    if actual != expected_sha256 {
        return Err(PayloadError::HashMismatch {
            expected: expected_sha256.to_string(),
            actual,
        });
    }

    let mut archive = tar::Archive::new(GzDecoder::new(bytes.as_slice()));
    let mut files = Vec::new();
    let mut violations = Vec::new();
    for entry in archive.entries()? {
        let entry = entry?;
        let name = entry.path()?.to_string_lossy().replace('\\', "/");
        if !entry.header().entry_type().is_file() || !is_allowlisted(&name) {
            violations.push(name);
            continue;
        }
        files.push(PayloadFile {
            name,
            size_bytes: entry.header().size()?,
        });
    }

    if !violations.is_empty() {
        return Err(PayloadError::AllowlistViolation(violations));
    }
    Ok(files)
}
