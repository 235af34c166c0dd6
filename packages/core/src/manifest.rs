// ABOUTME: Compiled pipeline manifest model
// ABOUTME: Steps, their driver names, config file references, and dependency edges

use crate::error::{CoreError, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ManifestMetadata {
    #[serde(default)]
    pub fingerprint: Option<String>,
    #[serde(default)]
    pub compiled_at: Option<String>,
    #[serde(default)]
    pub source_manifest_path: Option<String>,
}

/// One node of the pipeline DAG
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Step {
    pub id: String,
    /// Qualified driver name, `<family>.<verb>`
    pub driver: String,
    /// Config file path relative to the manifest directory
    pub cfg_path: String,
    /// Upstream step ids (edges run dependency -> dependent)
    #[serde(default)]
    pub needs: Vec<String>,
    /// Inline config copied by the compiler; informational only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub config: Option<serde_json::Value>,
}

/// Immutable compiled manifest
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    pub pipeline: PipelineInfo,
    pub steps: Vec<Step>,
    #[serde(default)]
    pub metadata: ManifestMetadata,
}

impl Manifest {
    /// Parse and validate a manifest from JSON text
    pub fn from_json(text: &str) -> Result<Self> {
        let manifest: Manifest = serde_json::from_str(text)?;
        manifest.validate()?;
        Ok(manifest)
    }

    /// Load and validate a manifest file
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_json(&text)
    }

    /// Check structural invariants, reporting every problem at once.
    ///
    /// Cycles are detected by the runner's planner, not here.
    pub fn validate(&self) -> Result<()> {
        let mut problems = Vec::new();
        let mut seen = HashSet::new();

        for step in &self.steps {
            if step.id.trim().is_empty() {
                problems.push("step with empty id".to_string());
            }
            if !seen.insert(step.id.as_str()) {
                problems.push(format!("duplicate step id '{}'", step.id));
            }
            if step.driver.trim().is_empty() {
                problems.push(format!("step '{}' has no driver", step.id));
            }
            if step.cfg_path.trim().is_empty() {
                problems.push(format!("step '{}' has no cfg_path", step.id));
            }
        }

        for step in &self.steps {
            for need in &step.needs {
                if !seen.contains(need.as_str()) {
                    problems.push(format!(
                        "step '{}' needs unknown step '{}'",
                        step.id, need
                    ));
                }
            }
        }

        if problems.is_empty() {
            Ok(())
        } else {
            Err(CoreError::InvalidManifest(problems))
        }
    }

    pub fn step(&self, id: &str) -> Option<&Step> {
        self.steps.iter().find(|s| s.id == id)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.steps.iter().map(|s| s.id.clone()).collect()
    }

    /// Distinct driver names in manifest order
    pub fn driver_names(&self) -> Vec<String> {
        let mut names: Vec<String> = Vec::new();
        for step in &self.steps {
            if !names.contains(&step.driver) {
                names.push(step.driver.clone());
            }
        }
        names
    }

    pub fn to_json_pretty(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn manifest_json(steps: serde_json::Value) -> String {
        json!({
            "pipeline": {"id": "p1", "name": "demo"},
            "steps": steps,
            "metadata": {"fingerprint": "abc"}
        })
        .to_string()
    }

    #[test]
    fn test_parse_valid_manifest() {
        let text = manifest_json(json!([
            {"id": "extract", "driver": "mysql.extractor", "cfg_path": "cfg/extract.json"},
            {"id": "write", "driver": "filesystem.jsonl_writer", "cfg_path": "cfg/write.json", "needs": ["extract"]}
        ]));
        let manifest = Manifest::from_json(&text).unwrap();
        assert_eq!(manifest.steps.len(), 2);
        assert_eq!(manifest.step("write").unwrap().needs, vec!["extract"]);
        assert_eq!(manifest.metadata.fingerprint.as_deref(), Some("abc"));
    }

    #[test]
    fn test_validate_reports_every_problem() {
        let text = manifest_json(json!([
            {"id": "a", "driver": "", "cfg_path": "cfg/a.json"},
            {"id": "a", "driver": "x.writer", "cfg_path": "cfg/b.json", "needs": ["ghost"]}
        ]));
        let err = Manifest::from_json(&text).unwrap_err();
        match err {
            CoreError::InvalidManifest(problems) => {
                assert_eq!(problems.len(), 3);
                assert!(problems.iter().any(|p| p.contains("duplicate")));
                assert!(problems.iter().any(|p| p.contains("ghost")));
                assert!(problems.iter().any(|p| p.contains("no driver")));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_driver_names_are_distinct_and_ordered() {
        let text = manifest_json(json!([
            {"id": "a", "driver": "x.extractor", "cfg_path": "cfg/a.json"},
            {"id": "b", "driver": "y.writer", "cfg_path": "cfg/b.json", "needs": ["a"]},
            {"id": "c", "driver": "x.extractor", "cfg_path": "cfg/c.json"}
        ]));
        let manifest = Manifest::from_json(&text).unwrap();
        assert_eq!(manifest.driver_names(), vec!["x.extractor", "y.writer"]);
    }
}
