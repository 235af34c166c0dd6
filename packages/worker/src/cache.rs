// ABOUTME: Session-scoped cache of step outputs with optional disk spill
// ABOUTME: Spilled tables are written column-major with a schema sidecar and reloaded on demand

use osiris_core::{InputRef, InputSource, OutputValue, ResolveError, StepOutputs, Table};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tracing::debug;

pub const SPILL_TABLE_KEY: &str = "df";
pub const SPILL_DATA_FILE: &str = "df.json";
pub const SPILL_SCHEMA_FILE: &str = "schema.json";

#[derive(Debug, Clone)]
enum CacheEntry {
    Resident(StepOutputs),
    /// `df` lives on disk; any other outputs stay in memory
    Spilled {
        rest: StepOutputs,
        df_path: PathBuf,
        schema_path: PathBuf,
    },
}

#[derive(Debug)]
pub struct OutputCache {
    spill_dir: PathBuf,
    force_spill: bool,
    entries: BTreeMap<String, CacheEntry>,
}

impl OutputCache {
    pub fn new(spill_dir: impl Into<PathBuf>, force_spill: bool) -> Self {
        Self {
            spill_dir: spill_dir.into(),
            force_spill,
            entries: BTreeMap::new(),
        }
    }

    pub fn force_spill(&self) -> bool {
        self.force_spill
    }

    /// Cache a step's outputs, spilling its table when force-spill is on.
    ///
    /// If the spill fails the outputs are kept resident and the error is returned.
    pub fn insert(&mut self, step_id: &str, mut outputs: StepOutputs) -> std::io::Result<()> {
        let spill_table = self.force_spill
            && matches!(outputs.get(SPILL_TABLE_KEY), Some(OutputValue::Table(_)));
        if !spill_table {
            self.entries
                .insert(step_id.to_string(), CacheEntry::Resident(outputs));
            return Ok(());
        }

        let Some(OutputValue::Table(table)) = outputs.remove(SPILL_TABLE_KEY) else {
            self.entries
                .insert(step_id.to_string(), CacheEntry::Resident(outputs));
            return Ok(());
        };

        match self.spill(step_id, &table) {
            Ok((df_path, schema_path)) => {
                debug!(
                    "Spilled {} rows of step {} to {}",
                    table.row_count(),
                    step_id,
                    df_path.display()
                );
                self.entries.insert(
                    step_id.to_string(),
                    CacheEntry::Spilled {
                        rest: outputs,
                        df_path,
                        schema_path,
                    },
                );
                Ok(())
            }
            Err(e) => {
                outputs.insert(SPILL_TABLE_KEY.to_string(), OutputValue::Table(table));
                self.entries
                    .insert(step_id.to_string(), CacheEntry::Resident(outputs));
                Err(e)
            }
        }
    }

    fn spill(&self, step_id: &str, table: &Table) -> std::io::Result<(PathBuf, PathBuf)> {
        let dir = self.spill_dir.join(step_id);
        std::fs::create_dir_all(&dir)?;
        let df_path = dir.join(SPILL_DATA_FILE);
        let schema_path = dir.join(SPILL_SCHEMA_FILE);
        std::fs::write(&df_path, serde_json::to_vec(&table.to_columnar())?)?;
        std::fs::write(&schema_path, serde_json::to_vec_pretty(&table.schema())?)?;
        Ok((df_path, schema_path))
    }

    pub fn contains(&self, step_id: &str) -> bool {
        self.entries.contains_key(step_id)
    }

    pub fn step_ids(&self) -> Vec<String> {
        self.entries.keys().cloned().collect()
    }

    /// JSON-safe view of a cache entry.
    ///
    /// Tables appear as `{rows, columns}`; a spilled entry is
    /// `{spilled: true, df_path, schema_path}` plus any resident values.
    pub fn describe(&self, step_id: &str) -> Option<Value> {
        let entry = self.entries.get(step_id)?;
        let (outputs, spilled) = match entry {
            CacheEntry::Resident(outputs) => (outputs, None),
            CacheEntry::Spilled {
                rest,
                df_path,
                schema_path,
            } => (rest, Some((df_path, schema_path))),
        };

        let mut map = Map::new();
        for (key, value) in outputs {
            let summary = match value {
                OutputValue::Table(table) => {
                    json!({"rows": table.row_count(), "columns": table.columns})
                }
                OutputValue::Value(v) => v.clone(),
            };
            map.insert(key.clone(), summary);
        }
        if let Some((df_path, schema_path)) = spilled {
            map.insert("spilled".to_string(), Value::Bool(true));
            map.insert("df_path".to_string(), json!(df_path.display().to_string()));
            map.insert(
                "schema_path".to_string(),
                json!(schema_path.display().to_string()),
            );
        }
        Some(Value::Object(map))
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn reload(step_id: &str, df_path: &Path) -> Result<Table, ResolveError> {
    let reload_error = |message: String| ResolveError::Reload {
        step: step_id.to_string(),
        message,
    };
    let bytes = std::fs::read(df_path)
        .map_err(|e| reload_error(format!("{}: {}", df_path.display(), e)))?;
    let value: Value = serde_json::from_slice(&bytes).map_err(|e| reload_error(e.to_string()))?;
    Table::from_columnar(&value).map_err(|e| reload_error(e.to_string()))
}

impl InputSource for OutputCache {
    fn resolve(&self, input: &InputRef) -> Result<OutputValue, ResolveError> {
        let entry = self
            .entries
            .get(&input.from_step)
            .ok_or_else(|| ResolveError::MissingStep {
                step: input.from_step.clone(),
                available: self.step_ids(),
            })?;

        let missing_key = |outputs: &StepOutputs, spilled: bool| {
            let mut available: Vec<String> = outputs.keys().cloned().collect();
            if spilled {
                available.push(SPILL_TABLE_KEY.to_string());
                available.sort();
            }
            ResolveError::MissingKey {
                step: input.from_step.clone(),
                key: input.key.clone(),
                available,
            }
        };

        match entry {
            CacheEntry::Resident(outputs) => outputs
                .get(&input.key)
                .cloned()
                .ok_or_else(|| missing_key(outputs, false)),
            CacheEntry::Spilled { rest, df_path, .. } => {
                if input.key == SPILL_TABLE_KEY {
                    reload(&input.from_step, df_path).map(OutputValue::Table)
                } else {
                    rest.get(&input.key)
                        .cloned()
                        .ok_or_else(|| missing_key(rest, true))
                }
            }
        }
    }
}
